pub mod chat_session;
pub mod gemini_provider;
pub mod provider;
pub mod title_generator;

pub use chat_session::{ChatSession, SessionError, SessionReply};
pub use gemini_provider::{GeminiConfig, GeminiProvider};
pub use provider::{
    ChatProvider, Content, GenerateRequest, GenerationConfig, Part, ProviderError,
    ProviderResponse, ResponseChunk, ResponseStream, Tool,
};
pub use title_generator::{TitleGenerator, clean_title, fallback_title};
