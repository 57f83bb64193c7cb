use thiserror::Error;

use super::model::LuminaSettings;
use crate::repositories::BoxFuture;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Path error: {0}")]
    Path(String),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

pub trait SettingsRepository: Send + Sync + 'static {
    /// Load settings, or defaults when nothing was saved yet
    fn load(&self) -> BoxFuture<'static, SettingsResult<LuminaSettings>>;

    fn save(&self, settings: LuminaSettings) -> BoxFuture<'static, SettingsResult<()>>;
}
