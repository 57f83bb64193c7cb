use serde::{Deserialize, Serialize};

/// Generate a collision-resistant identifier for messages and entities.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current wall-clock time as epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "model" => Some(Role::Model),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Audio,
}

/// Inline binary payload carried with a message.
///
/// `data` is usually a data URL (`data:<mime>;base64,<payload>`) as captured by
/// the input layer; the prefix is stripped before it reaches the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub mime_type: String,
    pub data: String,
}

impl Attachment {
    pub fn image(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: AttachmentKind::Image,
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn audio(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: AttachmentKind::Audio,
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// The bare base64 payload with any `data:<mime>;base64,` prefix removed.
    pub fn base64_payload(&self) -> &str {
        strip_data_url(&self.data)
    }
}

/// Strip a `data:` URL header, leaving only what follows the first comma.
/// Strings that are not data URLs are returned unchanged.
pub fn strip_data_url(data: &str) -> &str {
    if data.starts_with("data:") {
        match data.split_once(',') {
            Some((_, payload)) => payload,
            None => "",
        }
    } else {
        data
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSource {
    pub uri: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<WebSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchEntryPoint {
    pub rendered_content: String,
}

/// Citation data returned when web-search augmentation was used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingMetadata {
    #[serde(default)]
    pub grounding_chunks: Vec<GroundingChunk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_entry_point: Option<SearchEntryPoint>,
}

impl GroundingMetadata {
    pub fn is_empty(&self) -> bool {
        self.grounding_chunks.is_empty() && self.search_entry_point.is_none()
    }

    /// Web sources suitable for display: both `uri` and `title` present,
    /// deduplicated by `uri`, first occurrence wins.
    pub fn sources(&self) -> Vec<&WebSource> {
        let mut seen = std::collections::HashSet::new();
        self.grounding_chunks
            .iter()
            .filter_map(|chunk| chunk.web.as_ref())
            .filter(|web| !web.uri.is_empty() && !web.title.is_empty())
            .filter(|web| seen.insert(web.uri.as_str()))
            .collect()
    }
}

/// Merge newly received metadata into `current`.
///
/// Last-seen wins, but an empty or absent update never clears what is already there.
pub fn merge_grounding(current: &mut Option<GroundingMetadata>, incoming: Option<&GroundingMetadata>) {
    if let Some(incoming) = incoming
        && !incoming.is_empty()
    {
        *current = Some(incoming.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding_metadata: Option<GroundingMetadata>,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl Message {
    pub fn user(text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            id: new_id(),
            role: Role::User,
            text: text.into(),
            attachments,
            is_streaming: false,
            grounding_metadata: None,
            timestamp: now_millis(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role: Role::Model,
            text: text.into(),
            attachments: Vec::new(),
            is_streaming: false,
            grounding_metadata: None,
            timestamp: now_millis(),
        }
    }

    /// Empty model message shown while a reply is pending.
    pub fn placeholder() -> Self {
        Self {
            is_streaming: true,
            ..Self::model("")
        }
    }

    /// Whether this message can be sent to the provider as a conversational turn.
    pub fn has_content(&self) -> bool {
        !self.text.trim().is_empty() || !self.attachments.is_empty()
    }
}
