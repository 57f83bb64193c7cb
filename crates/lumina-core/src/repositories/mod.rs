pub mod error;
pub mod in_memory_store;
pub mod json_store;
pub mod session_store;
pub mod sqlite_store;

pub use error::{StoreError, StoreResult};
pub use in_memory_store::InMemorySessionStore;
pub use json_store::JsonSessionStore;
pub use session_store::{BoxFuture, SessionStore};
pub use sqlite_store::SqliteSessionStore;
