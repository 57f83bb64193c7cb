use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::controllers::DEFAULT_INSTRUCTION;
use crate::models::DEFAULT_THEME_ID;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Which Session Store backend to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Json,
    #[default]
    Sqlite,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreKind::Memory),
            "json" => Ok(StoreKind::Json),
            "sqlite" => Ok(StoreKind::Sqlite),
            other => Err(format!("unknown store kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LuminaSettings {
    pub model: String,
    /// Model used for conversation titles; falls back to `model`
    pub title_model: Option<String>,
    pub api_base_url: Option<String>,
    pub api_key: Option<String>,
    pub streaming: bool,
    pub store: StoreKind,
    pub data_dir: Option<PathBuf>,
    pub default_instruction: String,
    pub default_theme_id: String,
    pub fallback_title_chars: usize,
}

impl Default for LuminaSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            title_model: None,
            api_base_url: None,
            api_key: None,
            streaming: true,
            store: StoreKind::default(),
            data_dir: None,
            default_instruction: DEFAULT_INSTRUCTION.to_string(),
            default_theme_id: DEFAULT_THEME_ID.to_string(),
            fallback_title_chars: 30,
        }
    }
}

impl LuminaSettings {
    pub fn title_model(&self) -> &str {
        self.title_model.as_deref().unwrap_or(&self.model)
    }

    /// Directory for local stores, if one could be determined.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|dir| dir.join("lumina")))
    }

    /// Apply environment overrides. `lookup` is usually `|key| std::env::var(key).ok()`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("GEMINI_API_KEY").or_else(|| non_empty("API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(model) = non_empty("LUMINA_MODEL") {
            self.model = model;
        }
        if let Some(store) = non_empty("LUMINA_STORE") {
            match store.parse() {
                Ok(kind) => self.store = kind,
                Err(e) => warn!(error = %e, "Ignoring LUMINA_STORE"),
            }
        }
        if let Some(dir) = non_empty("LUMINA_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }
}
