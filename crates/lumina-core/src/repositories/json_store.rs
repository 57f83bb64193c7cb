use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::debug;

use super::error::{StoreError, StoreResult};
use super::session_store::{BoxFuture, MonotonicClock, SessionStore, normalize_for_storage};
use crate::models::project::{preview_of, sort_conversations};
use crate::models::{Conversation, Message, NewProject, Project, ProjectUpdate, new_id};

struct Inner {
    root: PathBuf,
    /// Serializes read-modify-write cycles across all files
    write_lock: Mutex<()>,
    clock: MonotonicClock,
}

/// Local device storage backed by JSON files.
///
/// Layout under the root directory:
/// - `projects.json`
/// - `conversations.json`
/// - `messages/<conversation_id>.json`
#[derive(Clone)]
pub struct JsonSessionStore {
    inner: Arc<Inner>,
}

impl JsonSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                write_lock: Mutex::new(()),
                clock: MonotonicClock::default(),
            }),
        }
    }

    /// Store under the platform data directory (`~/.local/share/lumina/store` on Linux)
    pub fn in_default_location() -> StoreResult<Self> {
        let root = dirs::data_dir()
            .ok_or_else(|| StoreError::Initialization {
                message: "Could not determine data directory".to_string(),
            })?
            .join("lumina")
            .join("store");
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }
}

impl Inner {
    fn projects_path(&self) -> PathBuf {
        self.root.join("projects.json")
    }

    fn conversations_path(&self) -> PathBuf {
        self.root.join("conversations.json")
    }

    fn messages_path(&self, conversation_id: &str) -> StoreResult<PathBuf> {
        if conversation_id.is_empty()
            || conversation_id.contains(['/', '\\'])
            || conversation_id.starts_with('.')
        {
            return Err(StoreError::InvalidData {
                message: format!("Invalid conversation id: {conversation_id:?}"),
            });
        }
        Ok(self
            .root
            .join("messages")
            .join(format!("{conversation_id}.json")))
    }

    async fn projects(&self) -> StoreResult<Vec<Project>> {
        read_json(&self.projects_path()).await
    }

    async fn conversations(&self) -> StoreResult<Vec<Conversation>> {
        read_json(&self.conversations_path()).await
    }

    async fn messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        read_json(&self.messages_path(conversation_id)?).await
    }

    async fn remove_messages_file(&self, conversation_id: &str) -> StoreResult<()> {
        let path = self.messages_path(conversation_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read a JSON document, treating a missing file as empty.
async fn read_json<T: DeserializeOwned + Default>(path: &Path) -> StoreResult<T> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write a JSON document atomically (write to temp, then rename).
async fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, json).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

impl SessionStore for JsonSessionStore {
    fn list_projects(&self, user_id: &str) -> BoxFuture<'static, StoreResult<Vec<Project>>> {
        let inner = self.inner.clone();
        let user_id = user_id.to_string();

        Box::pin(async move {
            let mut projects: Vec<Project> = inner
                .projects()
                .await?
                .into_iter()
                .filter(|p| p.user_id == user_id)
                .collect();
            projects.sort_by_key(|p| std::cmp::Reverse(p.created_at));
            Ok(projects)
        })
    }

    fn create_project(&self, project: NewProject) -> BoxFuture<'static, StoreResult<Project>> {
        let inner = self.inner.clone();

        Box::pin(async move {
            let _guard = inner.write_lock.lock().await;
            let mut projects = inner.projects().await?;
            let project = Project {
                id: new_id(),
                user_id: project.user_id,
                name: project.name,
                system_instruction: project.system_instruction,
                theme_id: project.theme_id,
                created_at: inner.clock.now(),
            };
            projects.push(project.clone());
            write_json(&inner.projects_path(), &projects).await?;
            Ok(project)
        })
    }

    fn update_project(
        &self,
        id: &str,
        update: ProjectUpdate,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let id = id.to_string();

        Box::pin(async move {
            let _guard = inner.write_lock.lock().await;
            let mut projects = inner.projects().await?;
            let project = projects
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or_else(|| StoreError::not_found("project", &id))?;
            update.apply_to(project);
            write_json(&inner.projects_path(), &projects).await
        })
    }

    fn delete_project(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let id = id.to_string();

        Box::pin(async move {
            let _guard = inner.write_lock.lock().await;

            // Children first, so a crash midway never leaves orphans behind a deleted parent
            let conversations = inner.conversations().await?;
            let (owned, kept): (Vec<Conversation>, Vec<Conversation>) =
                conversations.into_iter().partition(|c| c.project_id == id);
            for conversation in &owned {
                inner.remove_messages_file(&conversation.id).await?;
            }
            write_json(&inner.conversations_path(), &kept).await?;

            let mut projects = inner.projects().await?;
            projects.retain(|p| p.id != id);
            write_json(&inner.projects_path(), &projects).await?;

            debug!(project_id = %id, conversations = owned.len(), "Deleted project");
            Ok(())
        })
    }

    fn list_conversations(
        &self,
        project_id: &str,
    ) -> BoxFuture<'static, StoreResult<Vec<Conversation>>> {
        let inner = self.inner.clone();
        let project_id = project_id.to_string();

        Box::pin(async move {
            let mut conversations: Vec<Conversation> = inner
                .conversations()
                .await?
                .into_iter()
                .filter(|c| c.project_id == project_id)
                .collect();
            sort_conversations(&mut conversations);
            Ok(conversations)
        })
    }

    fn create_conversation(
        &self,
        project_id: &str,
        title: &str,
    ) -> BoxFuture<'static, StoreResult<Conversation>> {
        let inner = self.inner.clone();
        let project_id = project_id.to_string();
        let title = title.to_string();

        Box::pin(async move {
            let _guard = inner.write_lock.lock().await;
            if !inner.projects().await?.iter().any(|p| p.id == project_id) {
                return Err(StoreError::not_found("project", project_id));
            }

            let mut conversations = inner.conversations().await?;
            let conversation = Conversation {
                id: new_id(),
                project_id,
                title,
                updated_at: inner.clock.now(),
                preview: None,
            };
            conversations.push(conversation.clone());
            write_json(&inner.conversations_path(), &conversations).await?;
            Ok(conversation)
        })
    }

    fn rename_conversation(&self, id: &str, title: &str) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let id = id.to_string();
        let title = title.to_string();

        Box::pin(async move {
            let _guard = inner.write_lock.lock().await;
            let mut conversations = inner.conversations().await?;
            let conversation = conversations
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| StoreError::not_found("conversation", &id))?;
            conversation.title = title;
            conversation.updated_at = inner.clock.now();
            write_json(&inner.conversations_path(), &conversations).await
        })
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let id = id.to_string();

        Box::pin(async move {
            let _guard = inner.write_lock.lock().await;
            inner.remove_messages_file(&id).await?;
            let mut conversations = inner.conversations().await?;
            conversations.retain(|c| c.id != id);
            write_json(&inner.conversations_path(), &conversations).await
        })
    }

    fn touch_conversation(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let id = id.to_string();

        Box::pin(async move {
            let _guard = inner.write_lock.lock().await;
            let mut conversations = inner.conversations().await?;
            let conversation = conversations
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| StoreError::not_found("conversation", &id))?;
            conversation.updated_at = inner.clock.now();
            write_json(&inner.conversations_path(), &conversations).await
        })
    }

    fn list_messages(&self, conversation_id: &str) -> BoxFuture<'static, StoreResult<Vec<Message>>> {
        let inner = self.inner.clone();
        let conversation_id = conversation_id.to_string();

        Box::pin(async move { inner.messages(&conversation_id).await })
    }

    fn save_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> BoxFuture<'static, StoreResult<Message>> {
        let inner = self.inner.clone();
        let conversation_id = conversation_id.to_string();

        Box::pin(async move {
            let _guard = inner.write_lock.lock().await;
            let now = inner.clock.now();
            let message = normalize_for_storage(message, now);

            let mut conversations = inner.conversations().await?;
            let conversation = conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
                .ok_or_else(|| StoreError::not_found("conversation", &conversation_id))?;
            conversation.updated_at = now;
            if let Some(preview) = preview_of(&message.text) {
                conversation.preview = Some(preview);
            }

            let mut messages = inner.messages(&conversation_id).await?;
            match messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => *existing = message.clone(),
                None => messages.push(message.clone()),
            }
            write_json(&inner.messages_path(&conversation_id)?, &messages).await?;
            write_json(&inner.conversations_path(), &conversations).await?;
            Ok(message)
        })
    }

    fn delete_messages(
        &self,
        conversation_id: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let inner = self.inner.clone();
        let conversation_id = conversation_id.to_string();

        Box::pin(async move {
            let _guard = inner.write_lock.lock().await;
            let mut messages = inner.messages(&conversation_id).await?;
            let before = messages.len();
            messages.retain(|m| !ids.contains(&m.id));
            if messages.len() != before {
                write_json(&inner.messages_path(&conversation_id)?, &messages).await?;
            }
            Ok(())
        })
    }
}
