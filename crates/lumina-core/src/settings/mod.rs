pub mod json_repository;
pub mod model;
pub mod repository;

pub use json_repository::SettingsJsonRepository;
pub use model::{LuminaSettings, StoreKind};
pub use repository::{SettingsError, SettingsRepository, SettingsResult};
