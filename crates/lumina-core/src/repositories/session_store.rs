use std::future::Future;
use std::pin::Pin;

use super::error::StoreResult;
use crate::models::{Conversation, Message, NewProject, Project, ProjectUpdate};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable storage for projects, conversations and messages.
///
/// Ownership is hierarchical: deleting a project removes its conversations,
/// deleting a conversation removes its messages. Implementations never leave
/// orphaned rows behind.
pub trait SessionStore: Send + Sync + 'static {
    /// Projects owned by `user_id`, newest first
    fn list_projects(&self, user_id: &str) -> BoxFuture<'static, StoreResult<Vec<Project>>>;

    fn create_project(&self, project: NewProject) -> BoxFuture<'static, StoreResult<Project>>;

    fn update_project(
        &self,
        id: &str,
        update: ProjectUpdate,
    ) -> BoxFuture<'static, StoreResult<()>>;

    /// Delete a project and everything below it
    fn delete_project(&self, id: &str) -> BoxFuture<'static, StoreResult<()>>;

    /// Conversations of a project sorted by `updated_at` descending
    fn list_conversations(
        &self,
        project_id: &str,
    ) -> BoxFuture<'static, StoreResult<Vec<Conversation>>>;

    fn create_conversation(
        &self,
        project_id: &str,
        title: &str,
    ) -> BoxFuture<'static, StoreResult<Conversation>>;

    fn rename_conversation(&self, id: &str, title: &str) -> BoxFuture<'static, StoreResult<()>>;

    /// Delete a conversation and its messages
    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, StoreResult<()>>;

    /// Bump `updated_at` to now
    fn touch_conversation(&self, id: &str) -> BoxFuture<'static, StoreResult<()>>;

    /// Messages in chronological order
    fn list_messages(&self, conversation_id: &str) -> BoxFuture<'static, StoreResult<Vec<Message>>>;

    /// Persist a message and touch its conversation.
    ///
    /// Returns the stored form: the store may normalize the id and timestamp.
    /// Transient flags such as `is_streaming` are never persisted.
    fn save_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> BoxFuture<'static, StoreResult<Message>>;

    /// Remove specific messages of a conversation (used when an edit discards a tail)
    fn delete_messages(
        &self,
        conversation_id: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'static, StoreResult<()>>;
}

/// Normalize a message for storage: keep the client id when present,
/// default the timestamp, drop the streaming flag.
pub(crate) fn normalize_for_storage(mut message: Message, now: i64) -> Message {
    if message.id.trim().is_empty() {
        message.id = crate::models::new_id();
    }
    if message.timestamp <= 0 {
        message.timestamp = now;
    }
    message.is_streaming = false;
    message
}

/// Millisecond clock that never returns the same value twice, so `updated_at`
/// ordering stays total even for writes within the same millisecond.
#[derive(Debug, Default)]
pub(crate) struct MonotonicClock {
    last: std::sync::atomic::AtomicI64,
}

impl MonotonicClock {
    pub(crate) fn now(&self) -> i64 {
        use std::sync::atomic::Ordering;

        let now = crate::models::now_millis();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange(last, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}
