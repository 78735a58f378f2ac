use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::request::ChatRequest;
use crate::response;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("upstream returned status {status}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream returned an unreadable body: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// A 4xx from the provider. Retrying the same payload cannot help.
    #[error("upstream rejected the request (status {status})")]
    Rejected { status: u16, detail: String },
    /// Transient failures outlasted the retry budget.
    #[error("upstream unavailable after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        last: TransportError,
    },
    /// The call succeeded but no known response shape carried reply text.
    #[error("could not extract reply text from upstream response")]
    UnrecognizedResponse,
    #[error("no upstream API key is configured")]
    MissingApiKey,
}

/// The network seam. Production uses [`HttpTransport`]; tests swap in
/// scripted transports.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &ChatRequest) -> Result<Value, TransportError>;
}

pub struct HttpTransport {
    api_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(api_url: String, api_key: String) -> Self {
        HttpTransport {
            api_url,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &ChatRequest) -> Result<Value, TransportError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|err| TransportError::Decode(err.to_string()))
    }
}

/// One logical upstream call with bounded exponential backoff: 5xx and
/// network failures are retried, a 4xx fails the send immediately.
pub struct UpstreamClient {
    transport: Box<dyn Transport>,
    max_retries: u32,
    base_delay: Duration,
}

impl UpstreamClient {
    pub fn new(transport: Box<dyn Transport>, max_retries: u32, base_delay_ms: u64) -> Self {
        UpstreamClient {
            transport,
            max_retries: max_retries.max(1),
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    pub async fn send(&self, request: &ChatRequest) -> Result<String, UpstreamError> {
        let mut attempt: u32 = 1;
        loop {
            let err = match self.transport.execute(request).await {
                Ok(body) => {
                    return response::extract_reply(&body).ok_or_else(|| {
                        tracing::error!("no reply text found in upstream response");
                        UpstreamError::UnrecognizedResponse
                    });
                }
                Err(err) => err,
            };

            let err = match classify(err) {
                Err(fatal) => {
                    tracing::error!(error = %fatal, "upstream call failed");
                    return Err(fatal);
                }
                Ok(transient) => transient,
            };

            if attempt >= self.max_retries {
                tracing::error!(attempts = attempt, error = %err, "upstream retries exhausted");
                return Err(UpstreamError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.base_delay * 2u32.pow(attempt);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient upstream failure, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Split a transport failure into transient (worth retrying) and fatal.
/// A decode failure on a 2xx is fatal: the transport already succeeded,
/// the body is what's wrong.
fn classify(err: TransportError) -> Result<TransportError, UpstreamError> {
    match err {
        TransportError::Status { status, body } if !(500..600).contains(&status) => {
            Err(UpstreamError::Rejected {
                status,
                detail: body,
            })
        }
        TransportError::Decode(_) => Err(UpstreamError::UnrecognizedResponse),
        transient => Ok(transient),
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::time::Instant;

    use super::testing::ScriptedTransport;
    use super::*;
    use crate::request::{build_request, RequestSettings};

    fn request() -> ChatRequest {
        let settings = RequestSettings {
            model: "gpt-4o-mini".to_string(),
            system_prompt: "test".to_string(),
            prompt_id: None,
            prompt_version: None,
            max_tokens: 100,
            temperature: 0.7,
        };
        build_request(&settings, "hello", &[], &[])
    }

    fn client(transport: Arc<ScriptedTransport>, max_retries: u32) -> UpstreamClient {
        UpstreamClient::new(Box::new(transport), max_retries, 1000)
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_retry_with_exponential_backoff() {
        let transport = Arc::new(ScriptedTransport::always_status(500));
        let client = client(transport.clone(), 3);

        let start = Instant::now();
        let err = client.send(&request()).await.unwrap_err();

        assert!(matches!(err, UpstreamError::Exhausted { attempts: 3, .. }));
        assert_eq!(transport.call_count(), 3);
        // 2s after the first attempt, 4s after the second.
        assert_eq!(start.elapsed(), Duration::from_millis(6000));
    }

    #[tokio::test]
    async fn client_errors_fail_immediately() {
        let transport = Arc::new(ScriptedTransport::always_status(400));
        let client = client(transport.clone(), 3);

        let err = client.send(&request()).await.unwrap_err();

        assert!(matches!(err, UpstreamError::Rejected { status: 400, .. }));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn network_failures_are_retried_until_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Network("connection reset".to_string())),
            Ok(json!({ "output_text": "recovered" })),
        ]));
        let client = client(transport.clone(), 3);

        let reply = client.send(&request()).await.unwrap();

        assert_eq!(reply, "recovered");
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn unrecognized_response_shape_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(json!({ "choices": [] }))]));
        let client = client(transport.clone(), 3);

        let err = client.send(&request()).await.unwrap_err();

        assert!(matches!(err, UpstreamError::UnrecognizedResponse));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn non_json_success_body_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(TransportError::Decode(
            "expected value".to_string(),
        ))]));
        let client = client(transport.clone(), 3);

        let err = client.send(&request()).await.unwrap_err();

        assert!(matches!(err, UpstreamError::UnrecognizedResponse));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_of_one_means_a_single_attempt() {
        let transport = Arc::new(ScriptedTransport::always_status(503));
        let client = client(transport.clone(), 1);

        let start = Instant::now();
        let err = client.send(&request()).await.unwrap_err();

        assert!(matches!(err, UpstreamError::Exhausted { attempts: 1, .. }));
        assert_eq!(transport.call_count(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
