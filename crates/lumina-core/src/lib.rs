//! Chat core for Lumina: projects, conversations and streamed model replies.
//!
//! Front-ends drive a [`ChatController`] and render from its state and
//! [`ChatEvent`]s; persistence and the model provider sit behind traits.

pub mod controllers;
pub mod models;
pub mod repositories;
pub mod services;
pub mod settings;

#[cfg(test)]
mod test_helpers;

pub use controllers::{ChatController, ChatEvent, ControllerConfig};
pub use repositories::{SessionStore, StoreError};
pub use services::{ChatProvider, ChatSession, GeminiProvider};
pub use settings::{LuminaSettings, StoreKind};
