pub mod chat_controller;

pub use chat_controller::{
    ChatController, ChatEvent, ControllerConfig, DEFAULT_CONVERSATION_TITLE, DEFAULT_INSTRUCTION,
    DEFAULT_PROJECT_NAME, GENERATION_ERROR_TEXT, INTERRUPTED_MARKER,
};
