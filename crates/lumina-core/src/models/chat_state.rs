use super::message::{GroundingMetadata, Message, Role, merge_grounding};
use super::navigation::Navigation;
use super::project::{Conversation, Project, User, preview_of, sort_conversations};

/// Edit mode: the user is rewriting a previously sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditState {
    pub message_id: String,
    pub draft: String,
}

/// Bookkeeping for the generation currently in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightTurn {
    pub turn_id: u64,
    pub conversation_id: String,
    pub placeholder_id: String,
}

/// In-memory state owned by the chat controller.
///
/// Every mutation goes through a short critical section that reads the
/// latest value; nothing here is ever replaced with a snapshot taken
/// before an await.
#[derive(Debug, Default)]
pub struct ChatState {
    pub user: Option<User>,
    pub projects: Vec<Project>,
    /// Conversations of the active project, newest first
    pub conversations: Vec<Conversation>,
    /// Messages of the active conversation, chronological
    pub messages: Vec<Message>,
    pub navigation: Navigation,
    pub is_loading: bool,
    pub editing: Option<EditState>,
    pub in_flight: Option<InFlightTurn>,
    next_turn_id: u64,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_turn_id(&mut self) -> u64 {
        self.next_turn_id += 1;
        self.next_turn_id
    }

    pub fn project(&self, id: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn project_mut(&mut self, id: &str) -> Option<&mut Project> {
        self.projects.iter_mut().find(|p| p.id == id)
    }

    pub fn active_project(&self) -> Option<&Project> {
        self.navigation
            .active_project_id()
            .and_then(|id| self.project(id))
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Apply `f` to the message with `id`. Returns false if it is no longer in the list.
    pub fn update_message(&mut self, id: &str, f: impl FnOnce(&mut Message)) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                f(message);
                true
            }
            None => false,
        }
    }

    /// Append a streamed delta to the placeholder `id`.
    pub fn append_delta(
        &mut self,
        id: &str,
        delta: &str,
        metadata: Option<&GroundingMetadata>,
    ) -> bool {
        self.update_message(id, |message| {
            message.text.push_str(delta);
            merge_grounding(&mut message.grounding_metadata, metadata);
        })
    }

    /// Rewrite a client-generated id once the store assigned its own.
    pub fn rename_message(&mut self, old_id: &str, new_id: &str) {
        if old_id == new_id {
            return;
        }
        self.update_message(old_id, |message| message.id = new_id.to_string());
        if let Some(turn) = self.in_flight.as_mut()
            && turn.placeholder_id == old_id
        {
            turn.placeholder_id = new_id.to_string();
        }
        if let Some(edit) = self.editing.as_mut()
            && edit.message_id == old_id
        {
            edit.message_id = new_id.to_string();
        }
    }

    /// Index of a user message, the only kind that can be edited.
    pub fn user_message_index(&self, id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.id == id && m.role == Role::User)
    }

    pub fn upsert_conversation(&mut self, conversation: Conversation) {
        match self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation.id)
        {
            Some(existing) => *existing = conversation,
            None => self.conversations.push(conversation),
        }
        sort_conversations(&mut self.conversations);
    }

    /// Set a conversation title by id. Returns false if the conversation is not listed.
    pub fn set_conversation_title(&mut self, id: &str, title: &str) -> bool {
        match self.conversations.iter_mut().find(|c| c.id == id) {
            Some(conversation) => {
                conversation.title = title.to_string();
                true
            }
            None => false,
        }
    }

    /// Bump a conversation to the top of the list after a message was saved.
    pub fn touch_conversation(&mut self, id: &str, updated_at: i64, last_text: &str) {
        if let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == id) {
            conversation.updated_at = conversation.updated_at.max(updated_at);
            if let Some(preview) = preview_of(last_text) {
                conversation.preview = Some(preview);
            }
            sort_conversations(&mut self.conversations);
        }
    }

    /// Whether the in-flight turn (if any) is `turn_id`.
    pub fn owns_turn(&self, turn_id: u64) -> bool {
        self.in_flight.as_ref().map(|t| t.turn_id) == Some(turn_id)
    }

    /// Clear loading state, but only for the turn that set it.
    pub fn finish_turn(&mut self, turn_id: u64) -> bool {
        if self.owns_turn(turn_id) {
            self.in_flight = None;
            self.is_loading = false;
            true
        } else {
            false
        }
    }

    /// Forget everything tied to the user. Turn ids keep counting so late
    /// completions from before the reset never match a new turn.
    pub fn reset(&mut self) {
        *self = Self {
            next_turn_id: self.next_turn_id,
            ..Self::default()
        };
    }

    /// Drop everything tied to the active conversation.
    pub fn clear_conversation_view(&mut self) {
        self.messages.clear();
        self.editing = None;
    }
}
