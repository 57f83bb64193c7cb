use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Attachment, AttachmentKind, GroundingMetadata, Message, Role};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Provider not configured: {0}")]
    Configuration(String),
}

/// Inline binary payload, base64 without any data-URL header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

/// One piece of a turn: text or inline binary data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    /// Inline part from an attachment, stripping any `data:` URL prefix.
    pub fn inline(attachment: &Attachment) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: attachment.mime_type.clone(),
                data: attachment.base64_payload().to_string(),
            }),
        }
    }
}

/// A role-tagged turn as the provider understands it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    /// Web-search augmentation; responses may carry grounding metadata
    WebSearch,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub system_instruction: Option<String>,
    pub tools: Vec<Tool>,
    /// Prior turns, oldest first
    pub history: Vec<Content>,
    /// Parts of the new user turn
    pub message: Vec<Part>,
    pub generation_config: Option<GenerationConfig>,
}

impl GenerateRequest {
    /// Single-turn request with no history, instruction or tools.
    pub fn prompt(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_instruction: None,
            tools: Vec::new(),
            history: Vec::new(),
            message: vec![Part::text(prompt)],
            generation_config: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResponse {
    pub text: String,
    pub grounding_metadata: Option<GroundingMetadata>,
}

/// Incremental piece of a streamed response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseChunk {
    pub text: String,
    pub grounding_metadata: Option<GroundingMetadata>,
}

pub type ResponseStream = BoxStream<'static, Result<ResponseChunk, ProviderError>>;

/// Black-box generative backend: given a configuration and a message, returns
/// or streams text plus optional grounding metadata.
#[async_trait]
pub trait ChatProvider: Send + Sync + 'static {
    async fn generate(&self, request: GenerateRequest) -> Result<ProviderResponse, ProviderError>;

    async fn stream(&self, request: GenerateRequest) -> Result<ResponseStream, ProviderError>;
}

/// Parts for a new user turn: the text (when not blank) followed by one inline part per attachment.
pub fn user_parts(text: &str, attachments: &[Attachment]) -> Vec<Part> {
    let mut parts = Vec::with_capacity(attachments.len() + 1);
    if !text.trim().is_empty() {
        parts.push(Part::text(text));
    }
    parts.extend(attachments.iter().map(Part::inline));
    parts
}

/// Convert one message to a provider turn. Messages without text or attachments have no turn.
pub fn message_to_content(message: &Message) -> Option<Content> {
    if !message.has_content() {
        return None;
    }
    Some(Content {
        role: message.role,
        parts: user_parts(&message.text, &message.attachments),
    })
}

pub fn history_to_contents(messages: &[Message]) -> Vec<Content> {
    messages.iter().filter_map(message_to_content).collect()
}

/// Rebuild messages from provider turns, e.g. to inspect a session's accumulated history.
pub fn contents_to_messages(contents: &[Content]) -> Vec<Message> {
    contents
        .iter()
        .map(|content| {
            let text: String = content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect();
            let attachments = content
                .parts
                .iter()
                .filter_map(|p| p.inline_data.as_ref())
                .map(|inline| Attachment {
                    kind: if inline.mime_type.starts_with("audio/") {
                        AttachmentKind::Audio
                    } else {
                        AttachmentKind::Image
                    },
                    mime_type: inline.mime_type.clone(),
                    data: inline.data.clone(),
                })
                .collect();
            match content.role {
                Role::User => Message::user(text, attachments),
                Role::Model => Message {
                    attachments,
                    ..Message::model(text)
                },
            }
        })
        .collect()
}
