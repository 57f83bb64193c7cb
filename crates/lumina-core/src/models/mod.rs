pub mod chat_state;
pub mod message;
pub mod navigation;
pub mod notifier;
pub mod project;

pub use chat_state::{ChatState, EditState, InFlightTurn};
pub use message::{
    Attachment, AttachmentKind, GroundingChunk, GroundingMetadata, Message, Role,
    SearchEntryPoint, WebSource, new_id, now_millis, strip_data_url,
};
pub use navigation::Navigation;
pub use notifier::{ChannelNotifier, Notifier, Toast, ToastKind, ToastLog};
pub use project::{
    Conversation, DEFAULT_THEME_ID, NewProject, Project, ProjectUpdate, THEME_IDS, User,
    resolve_theme_id,
};
