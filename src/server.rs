use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use crate::chat::{ChatSession, SendError};
use crate::history::Role;
use crate::images::{self, ImageError, MAX_IMAGES, MAX_IMAGE_BYTES};
use crate::request::HistoryMessage;
use crate::upstream::UpstreamError;

pub type SharedSession = Arc<Mutex<ChatSession>>;

pub fn router(session: SharedSession) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(health))
        .route("/chat", post(chat))
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_IMAGES * MAX_IMAGE_BYTES + 1024 * 1024))
        .with_state(session)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "online",
        "service": "dalma-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "chat": "POST /chat",
            "health": "GET /",
        },
    }))
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
    timestamp: String,
}

async fn chat(State(session): State<SharedSession>, multipart: Multipart) -> Response {
    let form = match read_form(multipart).await {
        Ok(form) => form,
        Err(response) => return response,
    };

    let images = match images::prepare_all(form.images).await {
        Ok(images) => images,
        Err(err) => return image_error(err),
    };

    // One in-flight send at a time; a second submit is turned away rather
    // than queued behind the first.
    let mut session = match session.try_lock() {
        Ok(session) => session,
        Err(_) => {
            return error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "another message is still being processed",
            )
        }
    };

    match session.send_message(&form.message, images, form.history).await {
        Ok(turn) => {
            let timestamp = chrono::DateTime::from_timestamp_millis(turn.timestamp)
                .unwrap_or_else(chrono::Utc::now)
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            (
                StatusCode::OK,
                Json(ChatResponse {
                    response: turn.text,
                    timestamp,
                }),
            )
                .into_response()
        }
        Err(SendError::EmptyMessage) => {
            error_response(StatusCode::BAD_REQUEST, "send a message or attach an image")
        }
        Err(SendError::Upstream(UpstreamError::MissingApiKey)) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "the assistant is not configured yet",
        ),
        // Detail was already logged where it happened; the client gets a
        // generic notice.
        Err(SendError::Upstream(_)) => error_response(
            StatusCode::BAD_GATEWAY,
            "the assistant could not be reached",
        ),
    }
}

struct ChatForm {
    message: String,
    history: Option<Vec<HistoryMessage>>,
    images: Vec<(Option<String>, Vec<u8>)>,
}

async fn read_form(mut multipart: Multipart) -> Result<ChatForm, Response> {
    let mut form = ChatForm {
        message: String::new(),
        history: None,
        images: Vec::new(),
    };

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "unreadable multipart body");
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    "unreadable request body",
                ));
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "message" => {
                let text = field.text().await.map_err(|err| {
                    tracing::warn!(error = %err, "unreadable message field");
                    error_response(StatusCode::BAD_REQUEST, "unreadable message field")
                })?;
                form.message = text.trim().to_string();
            }
            "history" => {
                let raw = field.text().await.map_err(|err| {
                    tracing::warn!(error = %err, "unreadable history field");
                    error_response(StatusCode::BAD_REQUEST, "unreadable history field")
                })?;
                form.history = Some(parse_history(&raw)?);
            }
            "images" => {
                // Extras past the cap are dropped, same as the builder.
                if form.images.len() >= MAX_IMAGES {
                    continue;
                }
                let mime = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(|err| {
                    tracing::warn!(error = %err, "unreadable image part");
                    error_response(StatusCode::BAD_REQUEST, "unreadable image part")
                })?;
                form.images.push((mime, bytes.to_vec()));
            }
            _ => {}
        }
    }

    Ok(form)
}

fn parse_history(raw: &str) -> Result<Vec<HistoryMessage>, Response> {
    #[derive(Deserialize)]
    struct Entry {
        role: Role,
        #[serde(default)]
        text: String,
    }

    let entries: Vec<Entry> = serde_json::from_str(raw).map_err(|err| {
        tracing::warn!(error = %err, "malformed history field");
        error_response(StatusCode::BAD_REQUEST, "malformed history")
    })?;

    Ok(entries
        .into_iter()
        .map(|entry| HistoryMessage {
            role: entry.role,
            text: entry.text,
        })
        .collect())
}

fn image_error(err: ImageError) -> Response {
    match err {
        ImageError::TooLarge => error_response(StatusCode::PAYLOAD_TOO_LARGE, &err.to_string()),
        ImageError::NotAnImage => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        ImageError::TaskFailed => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "could not process the uploaded images",
        ),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_field_accepts_the_legacy_bot_role() {
        let parsed = parse_history(
            r#"[{"role":"user","text":"hi"},{"role":"bot","text":"hello"}]"#,
        )
        .ok()
        .expect("valid history parses");

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].role, Role::User);
        assert_eq!(parsed[1].role, Role::Assistant);
        assert_eq!(parsed[1].text, "hello");
    }

    #[test]
    fn malformed_history_is_a_client_error() {
        assert!(parse_history("{not json").is_err());
        assert!(parse_history(r#"[{"role":"wizard","text":"hi"}]"#).is_err());
    }

    #[test]
    fn history_entries_may_omit_text() {
        let parsed = parse_history(r#"[{"role":"user"}]"#)
            .ok()
            .expect("valid history parses");
        assert_eq!(parsed[0].text, "");
    }
}
