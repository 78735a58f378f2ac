use serde::Serialize;

use crate::history::{Role, Turn};
use crate::images::{ImageAttachment, MAX_IMAGES};

/// Stand-in text when a message is images-only.
pub const DESCRIBE_IMAGES_PROMPT: &str = "Describe what is in these images.";

/// Outbound completion request. Field names follow the provider's
/// chat-completions wire format.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptRef>,
    pub messages: Vec<OutboundMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Reference to a server-side prompt template.
#[derive(Debug, Clone, Serialize)]
pub struct PromptRef {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub role: &'static str,
    pub content: MessageContent,
}

/// Plain text for history replay, content parts for the current message
/// when images ride along.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

/// A prior turn reprojected for transport: text only, images dropped.
#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub role: Role,
    pub text: String,
}

impl From<&Turn> for HistoryMessage {
    fn from(turn: &Turn) -> Self {
        HistoryMessage {
            role: turn.role,
            text: turn.text.clone(),
        }
    }
}

/// Everything the builder needs from configuration.
#[derive(Debug, Clone)]
pub struct RequestSettings {
    pub model: String,
    pub system_prompt: String,
    pub prompt_id: Option<String>,
    pub prompt_version: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Assemble the outbound payload: the system instruction, the trailing
/// history window as text-only messages, then exactly one current message
/// carrying the new text and at most ten images (extras silently dropped).
pub fn build_request(
    settings: &RequestSettings,
    text: &str,
    images: &[ImageAttachment],
    history: &[HistoryMessage],
) -> ChatRequest {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(OutboundMessage {
        role: "system",
        content: MessageContent::Text(settings.system_prompt.clone()),
    });

    for entry in history {
        let role = match entry.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        messages.push(OutboundMessage {
            role,
            content: MessageContent::Text(entry.text.clone()),
        });
    }

    let content = if images.is_empty() {
        MessageContent::Text(text.to_string())
    } else {
        let lead = if text.trim().is_empty() {
            DESCRIBE_IMAGES_PROMPT
        } else {
            text
        };
        let mut parts = Vec::with_capacity(images.len().min(MAX_IMAGES) + 1);
        parts.push(ContentPart::Text {
            text: lead.to_string(),
        });
        for image in images.iter().take(MAX_IMAGES) {
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: image.data_url(),
                },
            });
        }
        MessageContent::Parts(parts)
    };
    messages.push(OutboundMessage {
        role: "user",
        content,
    });

    ChatRequest {
        model: settings.model.clone(),
        prompt: settings.prompt_id.clone().map(|id| PromptRef {
            id,
            version: settings.prompt_version.clone(),
        }),
        messages,
        max_tokens: settings.max_tokens,
        temperature: settings.temperature,
    }
}
