use serde::{Deserialize, Serialize};

pub const DEFAULT_THEME_ID: &str = "ocean";

/// Theme identifiers a project may reference. Visual definitions live in the front-end.
pub const THEME_IDS: &[&str] = &[
    "ocean",
    "sand",
    "autumn",
    "midnight",
    "eco",
    "cyberpunk",
    "glass",
];

/// Map unknown theme ids to the default theme.
pub fn resolve_theme_id(theme_id: &str) -> &'static str {
    THEME_IDS
        .iter()
        .copied()
        .find(|id| *id == theme_id)
        .unwrap_or(DEFAULT_THEME_ID)
}

/// Signed-in user, owned by the auth subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// A persona/context scope that owns conversations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub system_instruction: String,
    pub theme_id: String,
    pub created_at: i64,
}

/// Fields required to create a project; the store assigns id and creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProject {
    pub user_id: String,
    pub name: String,
    pub system_instruction: String,
    pub theme_id: String,
}

/// Partial project update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub system_instruction: Option<String>,
    pub theme_id: Option<String>,
}

impl ProjectUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.system_instruction.is_none() && self.theme_id.is_none()
    }

    pub fn apply_to(&self, project: &mut Project) {
        if let Some(name) = &self.name {
            project.name = name.clone();
        }
        if let Some(instruction) = &self.system_instruction {
            project.system_instruction = instruction.clone();
        }
        if let Some(theme_id) = &self.theme_id {
            project.theme_id = theme_id.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub project_id: String,
    pub title: String,
    /// Epoch milliseconds; sort key for conversation lists (descending)
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// Characters of the latest message kept as a conversation preview
pub const PREVIEW_CHARS: usize = 80;

pub fn preview_of(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.chars().take(PREVIEW_CHARS).collect())
    }
}

/// Sort conversations newest first.
pub fn sort_conversations(conversations: &mut [Conversation]) {
    conversations.sort_by_key(|c| std::cmp::Reverse(c.updated_at));
}
