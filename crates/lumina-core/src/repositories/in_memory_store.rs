use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::{StoreError, StoreResult};
use super::session_store::{BoxFuture, MonotonicClock, SessionStore, normalize_for_storage};
use crate::models::project::{preview_of, sort_conversations};
use crate::models::{Conversation, Message, NewProject, Project, ProjectUpdate, new_id};

#[derive(Default)]
struct Tables {
    projects: HashMap<String, Project>,
    conversations: HashMap<String, Conversation>,
    /// Keyed by conversation id, chronological
    messages: HashMap<String, Vec<Message>>,
}

/// In-memory session store.
/// Useful for testing and for running without durable storage.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    tables: Arc<Mutex<Tables>>,
    clock: Arc<MonotonicClock>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn list_projects(&self, user_id: &str) -> BoxFuture<'static, StoreResult<Vec<Project>>> {
        let tables = self.tables.clone();
        let user_id = user_id.to_string();

        Box::pin(async move {
            let tables = tables.lock();
            let mut projects: Vec<Project> = tables
                .projects
                .values()
                .filter(|p| p.user_id == user_id)
                .cloned()
                .collect();
            projects.sort_by_key(|p| std::cmp::Reverse(p.created_at));
            Ok(projects)
        })
    }

    fn create_project(&self, project: NewProject) -> BoxFuture<'static, StoreResult<Project>> {
        let tables = self.tables.clone();
        let created_at = self.clock.now();

        Box::pin(async move {
            let project = Project {
                id: new_id(),
                user_id: project.user_id,
                name: project.name,
                system_instruction: project.system_instruction,
                theme_id: project.theme_id,
                created_at,
            };
            tables
                .lock()
                .projects
                .insert(project.id.clone(), project.clone());
            Ok(project)
        })
    }

    fn update_project(
        &self,
        id: &str,
        update: ProjectUpdate,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let tables = self.tables.clone();
        let id = id.to_string();

        Box::pin(async move {
            let mut tables = tables.lock();
            let project = tables
                .projects
                .get_mut(&id)
                .ok_or_else(|| StoreError::not_found("project", &id))?;
            update.apply_to(project);
            Ok(())
        })
    }

    fn delete_project(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let tables = self.tables.clone();
        let id = id.to_string();

        Box::pin(async move {
            let mut tables = tables.lock();
            tables.projects.remove(&id);

            let owned: Vec<String> = tables
                .conversations
                .values()
                .filter(|c| c.project_id == id)
                .map(|c| c.id.clone())
                .collect();
            for conversation_id in owned {
                tables.conversations.remove(&conversation_id);
                tables.messages.remove(&conversation_id);
            }
            Ok(())
        })
    }

    fn list_conversations(
        &self,
        project_id: &str,
    ) -> BoxFuture<'static, StoreResult<Vec<Conversation>>> {
        let tables = self.tables.clone();
        let project_id = project_id.to_string();

        Box::pin(async move {
            let tables = tables.lock();
            let mut conversations: Vec<Conversation> = tables
                .conversations
                .values()
                .filter(|c| c.project_id == project_id)
                .cloned()
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
        let tables = self.tables.clone();
        let project_id = project_id.to_string();
        let title = title.to_string();
        let updated_at = self.clock.now();

        Box::pin(async move {
            let mut tables = tables.lock();
            if !tables.projects.contains_key(&project_id) {
                return Err(StoreError::not_found("project", project_id));
            }
            let conversation = Conversation {
                id: new_id(),
                project_id,
                title,
                updated_at,
                preview: None,
            };
            tables
                .conversations
                .insert(conversation.id.clone(), conversation.clone());
            Ok(conversation)
        })
    }

    fn rename_conversation(&self, id: &str, title: &str) -> BoxFuture<'static, StoreResult<()>> {
        let tables = self.tables.clone();
        let id = id.to_string();
        let title = title.to_string();
        let updated_at = self.clock.now();

        Box::pin(async move {
            let mut tables = tables.lock();
            let conversation = tables
                .conversations
                .get_mut(&id)
                .ok_or_else(|| StoreError::not_found("conversation", &id))?;
            conversation.title = title;
            conversation.updated_at = updated_at;
            Ok(())
        })
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let tables = self.tables.clone();
        let id = id.to_string();

        Box::pin(async move {
            let mut tables = tables.lock();
            tables.conversations.remove(&id);
            tables.messages.remove(&id);
            Ok(())
        })
    }

    fn touch_conversation(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let tables = self.tables.clone();
        let id = id.to_string();
        let updated_at = self.clock.now();

        Box::pin(async move {
            let mut tables = tables.lock();
            let conversation = tables
                .conversations
                .get_mut(&id)
                .ok_or_else(|| StoreError::not_found("conversation", &id))?;
            conversation.updated_at = updated_at;
            Ok(())
        })
    }

    fn list_messages(&self, conversation_id: &str) -> BoxFuture<'static, StoreResult<Vec<Message>>> {
        let tables = self.tables.clone();
        let conversation_id = conversation_id.to_string();

        Box::pin(async move {
            Ok(tables
                .lock()
                .messages
                .get(&conversation_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn save_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> BoxFuture<'static, StoreResult<Message>> {
        let tables = self.tables.clone();
        let conversation_id = conversation_id.to_string();
        let now = self.clock.now();

        Box::pin(async move {
            let message = normalize_for_storage(message, now);
            let mut tables = tables.lock();

            let conversation = tables
                .conversations
                .get_mut(&conversation_id)
                .ok_or_else(|| StoreError::not_found("conversation", &conversation_id))?;
            conversation.updated_at = now;
            if let Some(preview) = preview_of(&message.text) {
                conversation.preview = Some(preview);
            }

            let messages = tables.messages.entry(conversation_id).or_default();
            match messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => *existing = message.clone(),
                None => messages.push(message.clone()),
            }
            Ok(message)
        })
    }

    fn delete_messages(
        &self,
        conversation_id: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let tables = self.tables.clone();
        let conversation_id = conversation_id.to_string();

        Box::pin(async move {
            if let Some(messages) = tables.lock().messages.get_mut(&conversation_id) {
                messages.retain(|m| !ids.contains(&m.id));
            }
            Ok(())
        })
    }
}
