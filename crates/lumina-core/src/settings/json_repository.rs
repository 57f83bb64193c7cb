use std::path::PathBuf;

use super::model::LuminaSettings;
use super::repository::{SettingsError, SettingsRepository, SettingsResult};
use crate::repositories::BoxFuture;

pub struct SettingsJsonRepository {
    file_path: PathBuf,
}

impl SettingsJsonRepository {
    /// Repository at the platform config directory (`<config>/lumina/settings.json`).
    pub fn new() -> SettingsResult<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SettingsError::Path("Cannot determine config directory".into()))?;

        Ok(Self {
            file_path: config_dir.join("lumina").join("settings.json"),
        })
    }

    pub fn at(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.file_path
    }
}

impl SettingsRepository for SettingsJsonRepository {
    fn load(&self) -> BoxFuture<'static, SettingsResult<LuminaSettings>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(LuminaSettings::default());
                }
                Err(e) => return Err(SettingsError::Io(e.to_string())),
            };

            serde_json::from_str(&contents).map_err(|e| SettingsError::Serialization(e.to_string()))
        })
    }

    fn save(&self, settings: LuminaSettings) -> BoxFuture<'static, SettingsResult<()>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            let json = serde_json::to_string_pretty(&settings)
                .map_err(|e| SettingsError::Serialization(e.to_string()))?;

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SettingsError::Io(e.to_string()))?;
            }

            // Write atomically using temp file + rename
            let temp_path = path.with_extension("json.tmp");
            tokio::fs::write(&temp_path, json)
                .await
                .map_err(|e| SettingsError::Io(e.to_string()))?;
            tokio::fs::rename(&temp_path, &path)
                .await
                .map_err(|e| SettingsError::Io(e.to_string()))?;

            Ok(())
        })
    }
}
