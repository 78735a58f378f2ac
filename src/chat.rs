use thiserror::Error;

use crate::history::{now_ms, HistoryStore, Turn, TRANSPORT_WINDOW};
use crate::images::ImageAttachment;
use crate::request::{build_request, HistoryMessage, RequestSettings};
use crate::upstream::{UpstreamClient, UpstreamError};

/// Shown in the transcript when a send fails. The real error only goes to
/// the operator log.
pub const APOLOGY_REPLY: &str =
    "Sorry, something went wrong while answering. Please try again.";

/// Served instead of an upstream call when no API key is configured and
/// fallback replies are enabled.
pub const FALLBACK_REPLY: &str = "I received your message, but the assistant is running \
without an upstream API key, so I can't produce a full answer right now. Ask an operator \
to configure one to enable real replies and image understanding.";

#[derive(Debug, Error)]
pub enum SendError {
    #[error("send a message or attach an image first")]
    EmptyMessage,
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Drives one send cycle end to end: validate, record the user turn, call
/// upstream, record the outcome. Owns the transcript and the upstream
/// client; constructed once at startup. Exclusive access (`&mut self`) is
/// the single-in-flight-send lock.
pub struct ChatSession {
    settings: RequestSettings,
    history: HistoryStore,
    upstream: Option<UpstreamClient>,
    enable_fallback: bool,
}

impl ChatSession {
    pub fn new(
        settings: RequestSettings,
        history: HistoryStore,
        upstream: Option<UpstreamClient>,
        enable_fallback: bool,
    ) -> Self {
        ChatSession {
            settings,
            history,
            upstream,
            enable_fallback,
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// One complete send. On success the assistant turn is returned; on
    /// failure a fixed apology turn is recorded instead and the typed error
    /// is surfaced to the caller.
    ///
    /// `client_history`, when the web client supplies one, replaces the
    /// store's trailing window as prompt context for this request.
    pub async fn send_message(
        &mut self,
        text: &str,
        images: Vec<ImageAttachment>,
        client_history: Option<Vec<HistoryMessage>>,
    ) -> Result<Turn, SendError> {
        let user_turn = Turn::user(text, images, now_ms()).ok_or(SendError::EmptyMessage)?;

        // Snapshot before appending: the in-flight message is carried once,
        // by the final request message, not through replayed history.
        let snapshot = client_history.unwrap_or_else(|| {
            self.history
                .trailing(TRANSPORT_WINDOW)
                .iter()
                .map(HistoryMessage::from)
                .collect()
        });

        self.history.append(user_turn.clone());
        self.history.persist();

        let reply = match &self.upstream {
            Some(upstream) => {
                let request =
                    build_request(&self.settings, &user_turn.text, &user_turn.images, &snapshot);
                upstream.send(&request).await
            }
            None if self.enable_fallback => Ok(FALLBACK_REPLY.to_string()),
            None => Err(UpstreamError::MissingApiKey),
        };

        match reply {
            Ok(text) => {
                let turn = Turn::assistant(text, now_ms());
                self.history.append(turn.clone());
                self.history.persist();
                Ok(turn)
            }
            Err(err) => {
                tracing::error!(error = %err, "send failed");
                self.history.append(Turn::assistant_error(APOLOGY_REPLY, now_ms()));
                self.history.persist();
                Err(SendError::Upstream(err))
            }
        }
    }
}
