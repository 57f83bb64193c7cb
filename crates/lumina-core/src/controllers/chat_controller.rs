use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::message::merge_grounding;
use crate::models::{
    Attachment, ChatState, Conversation, EditState, InFlightTurn, Message, NewProject, Notifier,
    Project, ProjectUpdate, User, now_millis, resolve_theme_id,
};
use crate::repositories::SessionStore;
use crate::services::title_generator::fallback_title;
use crate::services::{ChatSession, SessionError, TitleGenerator};
use crate::settings::LuminaSettings;

pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";
pub const DEFAULT_PROJECT_NAME: &str = "New Project";
pub const DEFAULT_INSTRUCTION: &str = "You are a helpful, concise and elegant virtual assistant.";
pub const INTERRUPTED_MARKER: &str = " [Interrupted]";
pub const GENERATION_ERROR_TEXT: &str = "Error communicating with the model.";

const EVENT_CAPACITY: usize = 256;

/// Change notifications for front-ends. Carry no state; read it back from the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEvent {
    MessagesChanged,
    ConversationsChanged,
    ProjectsChanged,
    LoadingChanged(bool),
    StreamDelta { message_id: String, delta: String },
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub streaming: bool,
    pub default_instruction: String,
    pub default_theme_id: String,
    pub fallback_title_chars: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            streaming: true,
            default_instruction: DEFAULT_INSTRUCTION.to_string(),
            default_theme_id: crate::models::DEFAULT_THEME_ID.to_string(),
            fallback_title_chars: 30,
        }
    }
}

impl ControllerConfig {
    pub fn from_settings(settings: &LuminaSettings) -> Self {
        Self {
            streaming: settings.streaming,
            default_instruction: settings.default_instruction.clone(),
            default_theme_id: settings.default_theme_id.clone(),
            fallback_title_chars: settings.fallback_title_chars,
        }
    }
}

/// Sequences every user action against the store and the chat session.
///
/// State lives behind a short-lived lock that is never held across an
/// await. Every completion re-reads the latest state and updates by id, so
/// interleaved async work (a reply and a title, say) never loses writes.
pub struct ChatController {
    state: Arc<Mutex<ChatState>>,
    store: Arc<dyn SessionStore>,
    session: Arc<ChatSession>,
    notifier: Arc<dyn Notifier>,
    config: ControllerConfig,
    events: broadcast::Sender<ChatEvent>,
    /// Conversations whose title generation already fired
    titled: Mutex<HashSet<String>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    /// Bumped on every navigation so late loads can tell they are stale
    load_ticket: Mutex<u64>,
}

impl ChatController {
    pub fn new(
        store: Arc<dyn SessionStore>,
        session: Arc<ChatSession>,
        notifier: Arc<dyn Notifier>,
        config: ControllerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(ChatState::new())),
            store,
            session,
            notifier,
            config,
            events,
            titled: Mutex::new(HashSet::new()),
            background: Mutex::new(Vec::new()),
            load_ticket: Mutex::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Run `f` against the current state.
    pub fn with_state<R>(&self, f: impl FnOnce(&ChatState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().conversations.clone()
    }

    pub fn projects(&self) -> Vec<Project> {
        self.state.lock().projects.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().is_loading
    }

    pub fn editing(&self) -> Option<EditState> {
        self.state.lock().editing.clone()
    }

    pub fn active_project(&self) -> Option<Project> {
        self.state.lock().active_project().cloned()
    }

    pub fn active_conversation_id(&self) -> Option<String> {
        self.state
            .lock()
            .navigation
            .active_conversation_id()
            .map(str::to_string)
    }

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn next_load_ticket(&self) -> u64 {
        let mut ticket = self.load_ticket.lock();
        *ticket += 1;
        *ticket
    }

    fn is_current_load(&self, ticket: u64) -> bool {
        *self.load_ticket.lock() == ticket
    }

    fn effective_instruction(&self, instruction: &str) -> String {
        if instruction.trim().is_empty() {
            self.config.default_instruction.clone()
        } else {
            instruction.to_string()
        }
    }

    /// Abort the in-flight generation and release the loading state.
    /// The placeholder keeps its partial text plus the interruption marker.
    fn interrupt_generation(&self, state: &mut ChatState) -> bool {
        if !state.is_loading {
            return false;
        }
        self.session.abort();
        if let Some(turn) = state.in_flight.take() {
            state.update_message(&turn.placeholder_id, |message| {
                if !message.text.ends_with(INTERRUPTED_MARKER) {
                    message.text.push_str(INTERRUPTED_MARKER);
                }
                message.is_streaming = false;
            });
        }
        state.is_loading = false;
        true
    }

    fn abort_for_navigation(&self) {
        let stopped = {
            let mut state = self.state.lock();
            self.interrupt_generation(&mut state)
        };
        if stopped {
            debug!("Generation aborted by navigation");
            self.emit(ChatEvent::LoadingChanged(false));
        }
    }

    // Session lifecycle

    pub async fn sign_in(&self, user: User) {
        info!(user_id = %user.id, "Signed in");
        self.state.lock().user = Some(user);
        self.load_projects().await;
    }

    /// Abort any generation and forget everything tied to the user.
    pub fn sign_out(&self) {
        {
            let mut state = self.state.lock();
            self.interrupt_generation(&mut state);
            state.reset();
        }
        self.next_load_ticket();
        self.session.start_session(&[], "", false);
        self.notifier.info("Signed out.");
        self.emit(ChatEvent::LoadingChanged(false));
        self.emit(ChatEvent::ProjectsChanged);
        self.emit(ChatEvent::ConversationsChanged);
        self.emit(ChatEvent::MessagesChanged);
    }

    pub async fn load_projects(&self) {
        let Some(user_id) = self.state.lock().user.as_ref().map(|u| u.id.clone()) else {
            debug!("No user signed in, not loading projects");
            return;
        };

        match self.store.list_projects(&user_id).await {
            Ok(projects) => {
                debug!(count = projects.len(), "Loaded projects");
                self.state.lock().projects = projects;
                self.emit(ChatEvent::ProjectsChanged);
            }
            Err(e) => {
                warn!(error = ?e, "Failed to load projects");
                self.notifier.error("Failed to load projects");
            }
        }
    }

    // Projects

    /// Create a project and make it active.
    pub async fn create_project(
        &self,
        name: &str,
        instruction: &str,
        theme_id: &str,
    ) -> Option<Project> {
        let Some(user_id) = self.state.lock().user.as_ref().map(|u| u.id.clone()) else {
            warn!("Cannot create a project without a signed-in user");
            return None;
        };
        let name = match name.trim() {
            "" => DEFAULT_PROJECT_NAME,
            trimmed => trimmed,
        };
        let theme_id = if theme_id.trim().is_empty() {
            resolve_theme_id(&self.config.default_theme_id)
        } else {
            resolve_theme_id(theme_id)
        };

        let new_project = NewProject {
            user_id,
            name: name.to_string(),
            system_instruction: self.effective_instruction(instruction),
            theme_id: theme_id.to_string(),
        };
        match self.store.create_project(new_project).await {
            Ok(project) => {
                info!(project_id = %project.id, "Created project");
                self.state.lock().projects.insert(0, project.clone());
                self.emit(ChatEvent::ProjectsChanged);
                self.notifier.success("Project created");
                self.select_project(Some(&project.id)).await;
                Some(project)
            }
            Err(e) => {
                warn!(error = ?e, "Failed to create project");
                self.notifier.error("Failed to create project");
                None
            }
        }
    }

    /// Switch projects: drops the active conversation and loads the new project's conversations.
    pub async fn select_project(&self, id: Option<&str>) {
        {
            let mut state = self.state.lock();
            if state.navigation.active_project_id() == id {
                return;
            }
            if self.interrupt_generation(&mut state) {
                self.emit(ChatEvent::LoadingChanged(false));
            }
            state.navigation.select_project(id.map(str::to_string));
            state.conversations.clear();
            state.clear_conversation_view();
        }
        let ticket = self.next_load_ticket();
        self.emit(ChatEvent::ConversationsChanged);
        self.emit(ChatEvent::MessagesChanged);

        let Some(project_id) = id else {
            return;
        };
        debug!(project_id, "Loading conversations");
        match self.store.list_conversations(project_id).await {
            Ok(conversations) => {
                {
                    let mut state = self.state.lock();
                    if !self.is_current_load(ticket)
                        || !state.navigation.is_project_active(project_id)
                    {
                        debug!(project_id, "Discarding stale conversation list");
                        return;
                    }
                    state.conversations = conversations;
                }
                self.emit(ChatEvent::ConversationsChanged);
            }
            Err(e) => {
                warn!(project_id, error = ?e, "Failed to load conversations");
                self.notifier.error("Failed to load conversations");
            }
        }
    }

    pub async fn rename_project(&self, id: &str, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        let update = ProjectUpdate {
            name: Some(name.to_string()),
            ..Default::default()
        };
        self.update_project(id, update, "Failed to rename project")
            .await;
    }

    /// Persist a new system instruction and re-seed the live session when it
    /// belongs to the conversation on screen.
    pub async fn update_project_instruction(&self, id: &str, instruction: &str) {
        let instruction = self.effective_instruction(instruction);
        let update = ProjectUpdate {
            system_instruction: Some(instruction.clone()),
            ..Default::default()
        };
        if !self
            .update_project(id, update, "Failed to save instructions")
            .await
        {
            return;
        }

        {
            let state = self.state.lock();
            if state.navigation.is_project_active(id)
                && state.navigation.active_conversation_id().is_some()
            {
                if state.is_loading {
                    // The running send records its exchange; only the instruction changes
                    self.session.set_system_instruction(&instruction);
                } else {
                    self.session.start_session(
                        &state.messages,
                        &instruction,
                        self.session.use_search(),
                    );
                }
            }
        }
        self.notifier.success("Project instructions updated");
    }

    pub async fn change_project_theme(&self, id: &str, theme_id: &str) {
        let update = ProjectUpdate {
            theme_id: Some(resolve_theme_id(theme_id).to_string()),
            ..Default::default()
        };
        self.update_project(id, update, "Failed to change theme")
            .await;
    }

    async fn update_project(&self, id: &str, update: ProjectUpdate, failure: &str) -> bool {
        if update.is_empty() {
            return false;
        }
        match self.store.update_project(id, update.clone()).await {
            Ok(()) => {
                if let Some(project) = self.state.lock().project_mut(id) {
                    update.apply_to(project);
                }
                self.emit(ChatEvent::ProjectsChanged);
                true
            }
            Err(e) => {
                warn!(project_id = %id, error = ?e, "Failed to update project");
                self.notifier.error(failure);
                false
            }
        }
    }

    /// Delete a project with all its conversations and messages.
    pub async fn delete_project(&self, id: &str) {
        if let Err(e) = self.store.delete_project(id).await {
            warn!(project_id = %id, error = ?e, "Failed to delete project");
            self.notifier.error("Failed to delete project");
            return;
        }

        let was_active = {
            let mut state = self.state.lock();
            state.projects.retain(|p| p.id != id);
            let was_active = state.navigation.is_project_active(id);
            if was_active {
                if self.interrupt_generation(&mut state) {
                    self.emit(ChatEvent::LoadingChanged(false));
                }
                state.navigation.forget_project(id);
                state.conversations.clear();
                state.clear_conversation_view();
            }
            was_active
        };
        if was_active {
            self.next_load_ticket();
            self.emit(ChatEvent::ConversationsChanged);
            self.emit(ChatEvent::MessagesChanged);
        }
        info!(project_id = %id, "Deleted project");
        self.emit(ChatEvent::ProjectsChanged);
        self.notifier.info("Project deleted");
    }

    // Conversations

    /// Create an empty conversation in the active project and open it.
    pub async fn create_conversation(&self) -> Option<Conversation> {
        let Some(project_id) = self.state.lock().navigation.active_project_id().map(str::to_string)
        else {
            debug!("No active project, not creating a conversation");
            return None;
        };

        match self
            .store
            .create_conversation(&project_id, DEFAULT_CONVERSATION_TITLE)
            .await
        {
            Ok(conversation) => {
                self.abort_for_navigation();
                self.open_new_conversation(&project_id, &conversation, false);
                Some(conversation)
            }
            Err(e) => {
                warn!(project_id = %project_id, error = ?e, "Failed to create conversation");
                self.notifier.error("Failed to create conversation");
                None
            }
        }
    }

    /// Make a freshly created conversation active with an empty session.
    /// Returns false if the user left the project meanwhile.
    fn open_new_conversation(
        &self,
        project_id: &str,
        conversation: &Conversation,
        use_search: bool,
    ) -> bool {
        {
            let mut state = self.state.lock();
            if !state.navigation.is_project_active(project_id) {
                return false;
            }
            let instruction = state
                .active_project()
                .map(|p| self.effective_instruction(&p.system_instruction))
                .unwrap_or_else(|| self.config.default_instruction.clone());
            state.upsert_conversation(conversation.clone());
            state.navigation.select_conversation(&conversation.id);
            state.clear_conversation_view();
            self.session.start_session(&[], &instruction, use_search);
        }
        self.next_load_ticket();
        info!(conversation_id = %conversation.id, "Opened new conversation");
        self.emit(ChatEvent::ConversationsChanged);
        self.emit(ChatEvent::MessagesChanged);
        true
    }

    /// Open a conversation: load its messages and seed the session with them.
    /// Selecting the active conversation again does nothing.
    pub async fn select_conversation(&self, id: &str) {
        let instruction = {
            let mut state = self.state.lock();
            if state.navigation.is_conversation_active(id) {
                return;
            }
            let Some(project) = state.active_project() else {
                debug!(conversation_id = %id, "No active project, ignoring selection");
                return;
            };
            let instruction = self.effective_instruction(&project.system_instruction);
            if self.interrupt_generation(&mut state) {
                self.emit(ChatEvent::LoadingChanged(false));
            }
            state.navigation.select_conversation(id);
            state.clear_conversation_view();
            instruction
        };
        let ticket = self.next_load_ticket();
        self.emit(ChatEvent::MessagesChanged);

        let messages = match self.store.list_messages(id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(conversation_id = %id, error = ?e, "Failed to load messages");
                self.notifier.error("Failed to load messages");
                Vec::new()
            }
        };

        {
            let mut state = self.state.lock();
            if !self.is_current_load(ticket) || !state.navigation.is_conversation_active(id) {
                debug!(conversation_id = %id, "Discarding stale message load");
                return;
            }
            debug!(conversation_id = %id, count = messages.len(), "Loaded messages");
            self.session.start_session(&messages, &instruction, false);
            state.messages = messages;
        }
        self.emit(ChatEvent::MessagesChanged);
    }

    pub async fn rename_conversation(&self, id: &str, title: &str) {
        let title = title.trim();
        if title.is_empty() {
            return;
        }
        if let Err(e) = self.store.rename_conversation(id, title).await {
            warn!(conversation_id = %id, error = ?e, "Failed to rename conversation");
            self.notifier.error("Failed to rename conversation");
            return;
        }
        self.state.lock().set_conversation_title(id, title);
        self.emit(ChatEvent::ConversationsChanged);
    }

    /// Delete a conversation and its messages.
    pub async fn delete_conversation(&self, id: &str) {
        if let Err(e) = self.store.delete_conversation(id).await {
            warn!(conversation_id = %id, error = ?e, "Failed to delete conversation");
            self.notifier.error("Failed to delete conversation");
            return;
        }

        let was_active = {
            let mut state = self.state.lock();
            state.conversations.retain(|c| c.id != id);
            let was_active = state.navigation.is_conversation_active(id);
            if was_active {
                if self.interrupt_generation(&mut state) {
                    self.emit(ChatEvent::LoadingChanged(false));
                }
                state.navigation.forget_conversation(id);
                state.clear_conversation_view();
            }
            was_active
        };
        if was_active {
            self.next_load_ticket();
            self.emit(ChatEvent::MessagesChanged);
        }
        info!(conversation_id = %id, "Deleted conversation");
        self.emit(ChatEvent::ConversationsChanged);
        self.notifier.info("Conversation deleted");
    }

    // Editing

    /// Enter edit mode for a user message. Replaces any previous edit target.
    pub fn edit_message(&self, id: &str, current_text: &str) -> bool {
        {
            let mut state = self.state.lock();
            if state.user_message_index(id).is_none() {
                debug!(message_id = %id, "Only user messages can be edited");
                return false;
            }
            state.editing = Some(EditState {
                message_id: id.to_string(),
                draft: current_text.to_string(),
            });
        }
        self.emit(ChatEvent::MessagesChanged);
        true
    }

    pub fn cancel_edit(&self) {
        if self.state.lock().editing.take().is_some() {
            self.emit(ChatEvent::MessagesChanged);
        }
    }

    // Generation

    /// Stop the reply being generated, keeping what arrived so far.
    pub fn stop_generation(&self) {
        let stopped = {
            let mut state = self.state.lock();
            self.interrupt_generation(&mut state)
        };
        if stopped {
            info!("Generation stopped by user");
            self.emit(ChatEvent::LoadingChanged(false));
            self.emit(ChatEvent::MessagesChanged);
        }
    }

    /// Send a user turn and drive the reply to completion.
    ///
    /// No-op without an active project, while another reply is loading, or
    /// when there is nothing to send.
    pub async fn send_message(&self, text: &str, attachments: Vec<Attachment>, use_search: bool) {
        if text.trim().is_empty() && attachments.is_empty() {
            return;
        }

        let user_message = Message::user(text, attachments);
        let placeholder = Message::placeholder();
        let placeholder_id = placeholder.id.clone();

        // Claim the loading state before any await so concurrent sends bounce off
        let (turn_id, project_id, instruction, active_conversation) = {
            let mut state = self.state.lock();
            if state.is_loading {
                debug!("A reply is already loading, ignoring send");
                return;
            }
            let Some(project) = state.active_project() else {
                warn!("No active project, ignoring send");
                return;
            };
            let project_id = project.id.clone();
            let instruction = self.effective_instruction(&project.system_instruction);
            let active_conversation = state
                .navigation
                .active_conversation_id()
                .map(str::to_string);
            let turn_id = state.next_turn_id();
            state.is_loading = true;
            state.in_flight = Some(InFlightTurn {
                turn_id,
                conversation_id: active_conversation.clone().unwrap_or_default(),
                placeholder_id: placeholder_id.clone(),
            });
            (turn_id, project_id, instruction, active_conversation)
        };
        self.emit(ChatEvent::LoadingChanged(true));

        // 1. Target conversation
        let conversation_id = match active_conversation {
            Some(id) => id,
            None => match self
                .store
                .create_conversation(&project_id, DEFAULT_CONVERSATION_TITLE)
                .await
            {
                Ok(conversation) => {
                    let still_owned = self.state.lock().owns_turn(turn_id);
                    if !still_owned
                        || !self.open_new_conversation(&project_id, &conversation, use_search)
                    {
                        debug!("Send cancelled while creating its conversation");
                        self.release_turn(turn_id);
                        return;
                    }
                    conversation.id
                }
                Err(e) => {
                    warn!(project_id = %project_id, error = ?e, "Failed to create conversation for send");
                    self.notifier.error("Failed to start conversation");
                    self.release_turn(turn_id);
                    return;
                }
            },
        };

        // 2-5. Edit truncation, title trigger and optimistic append in one step
        let (discarded, reseed, first_turn_title) = {
            let mut state = self.state.lock();
            if !state.owns_turn(turn_id) || !state.navigation.is_conversation_active(&conversation_id)
            {
                drop(state);
                self.release_turn(turn_id);
                return;
            }

            let mut discarded = Vec::new();
            let mut reseed = None;
            if let Some(edit) = state.editing.take()
                && let Some(index) = state.user_message_index(&edit.message_id)
            {
                discarded = state
                    .messages
                    .split_off(index)
                    .into_iter()
                    .map(|m| m.id)
                    .collect::<Vec<_>>();
                reseed = Some(state.messages.clone());
            }

            let base_is_empty = state.messages.is_empty();
            let first_turn_title = (base_is_empty
                && !text.trim().is_empty()
                && self.titled.lock().insert(conversation_id.clone()))
            .then(|| fallback_title(text, self.config.fallback_title_chars));
            if let Some(title) = &first_turn_title {
                state.set_conversation_title(&conversation_id, title);
            }

            state.messages.push(user_message.clone());
            state.messages.push(placeholder);
            if let Some(turn) = state.in_flight.as_mut() {
                turn.conversation_id = conversation_id.clone();
            }
            (discarded, reseed, first_turn_title)
        };
        if let Some(base) = &reseed {
            debug!(kept = base.len(), discarded = discarded.len(), "Truncating history for edit");
            self.session.start_session(base, &instruction, use_search);
        }
        self.emit(ChatEvent::MessagesChanged);
        if first_turn_title.is_some() {
            self.emit(ChatEvent::ConversationsChanged);
        }

        // Persistence of the user side; failures are reported, never rolled back
        if !discarded.is_empty()
            && let Err(e) = self
                .store
                .delete_messages(&conversation_id, discarded)
                .await
        {
            warn!(conversation_id = %conversation_id, error = ?e, "Failed to delete edited messages");
            self.notifier.error("Failed to remove edited messages");
        }
        if let Some(title) = first_turn_title {
            self.start_title_generation(&conversation_id, &title, text)
                .await;
        }
        self.persist_message(&conversation_id, user_message.clone())
            .await;

        // 6. Dispatch
        let still_owned = self.state.lock().owns_turn(turn_id);
        if !still_owned {
            // Stopped before the request went out
            let interrupted = Message {
                id: placeholder_id.clone(),
                ..Message::model(INTERRUPTED_MARKER)
            };
            self.persist_message(&conversation_id, interrupted).await;
            return;
        }
        let result = if self.config.streaming {
            let state = self.state.clone();
            let events = self.events.clone();
            let message_id = placeholder_id.clone();
            self.session
                .send_streaming(
                    text,
                    &user_message.attachments,
                    use_search,
                    move |delta, metadata| {
                        let applied = {
                            let mut state = state.lock();
                            state.owns_turn(turn_id)
                                && state.append_delta(&message_id, delta, metadata)
                        };
                        if applied {
                            let _ = events.send(ChatEvent::StreamDelta {
                                message_id: message_id.clone(),
                                delta: delta.to_string(),
                            });
                        }
                    },
                )
                .await
        } else {
            self.session
                .send(text, &user_message.attachments, use_search)
                .await
        };

        // 7. Finalize
        match result {
            Ok(reply) => {
                debug!(conversation_id = %conversation_id, chars = reply.text.len(), "Reply complete");
                let mut visible_text = None;
                self.state.lock().update_message(&placeholder_id, |message| {
                    // A stop that raced the end of the reply keeps its marker
                    if message.text.ends_with(INTERRUPTED_MARKER) {
                        visible_text = Some(message.text.clone());
                    } else {
                        message.text = reply.text.clone();
                    }
                    merge_grounding(&mut message.grounding_metadata, reply.grounding_metadata.as_ref());
                    message.is_streaming = false;
                });
                let model_message = Message {
                    id: placeholder_id.clone(),
                    grounding_metadata: reply.grounding_metadata,
                    ..Message::model(visible_text.unwrap_or(reply.text))
                };
                self.persist_message(&conversation_id, model_message).await;
            }
            Err(SessionError::Aborted {
                partial_text,
                grounding_metadata,
            }) => {
                info!(conversation_id = %conversation_id, chars = partial_text.len(), "Reply interrupted");
                let fallback_text = format!("{partial_text}{INTERRUPTED_MARKER}");
                let mut visible_text = None;
                self.state.lock().update_message(&placeholder_id, |message| {
                    if !message.text.ends_with(INTERRUPTED_MARKER) {
                        message.text = fallback_text.clone();
                    }
                    merge_grounding(&mut message.grounding_metadata, grounding_metadata.as_ref());
                    message.is_streaming = false;
                    visible_text = Some(message.text.clone());
                });
                let interrupted = Message {
                    id: placeholder_id.clone(),
                    grounding_metadata,
                    ..Message::model(visible_text.unwrap_or(fallback_text))
                };
                self.persist_message(&conversation_id, interrupted).await;
            }
            Err(SessionError::Generation(e)) => {
                error!(conversation_id = %conversation_id, error = ?e, "Generation failed");
                self.state.lock().update_message(&placeholder_id, |message| {
                    message.text = GENERATION_ERROR_TEXT.to_string();
                    message.is_streaming = false;
                });
                self.notifier.error("Failed to get a reply from the model");
            }
        }

        // 8. Loading ends for this turn only
        self.release_turn(turn_id);
        self.emit(ChatEvent::MessagesChanged);
    }

    fn release_turn(&self, turn_id: u64) {
        if self.state.lock().finish_turn(turn_id) {
            self.emit(ChatEvent::LoadingChanged(false));
        }
    }

    /// Save a message; on success adopt the store's id and bump the conversation.
    async fn persist_message(&self, conversation_id: &str, message: Message) {
        let client_id = message.id.clone();
        match self.store.save_message(conversation_id, message).await {
            Ok(saved) => {
                {
                    let mut state = self.state.lock();
                    if saved.id != client_id {
                        debug!(client_id = %client_id, stored_id = %saved.id, "Store assigned a new message id");
                        state.rename_message(&client_id, &saved.id);
                    }
                    state.touch_conversation(conversation_id, now_millis(), &saved.text);
                }
                self.emit(ChatEvent::ConversationsChanged);
            }
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = ?e, "Failed to save message");
                self.notifier.error("Failed to save message");
            }
        }
    }

    /// Persist the fallback title, then ask for a better one in the background.
    async fn start_title_generation(&self, conversation_id: &str, fallback: &str, text: &str) {
        if let Err(e) = self
            .store
            .rename_conversation(conversation_id, fallback)
            .await
        {
            warn!(conversation_id = %conversation_id, error = ?e, "Failed to save fallback title");
        }

        let handle = tokio::spawn(apply_generated_title(
            self.session.title_generator(),
            self.state.clone(),
            self.store.clone(),
            self.events.clone(),
            conversation_id.to_string(),
            text.to_string(),
        ));
        let mut background = self.background.lock();
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    /// Wait for outstanding background work such as title generation.
    pub async fn wait_for_background_tasks(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = ?e, "Background task failed");
            }
        }
    }
}

/// Apply a generated title to the conversation it was generated for,
/// wherever the user is by now. Empty suggestions keep the current title.
async fn apply_generated_title(
    generator: TitleGenerator,
    state: Arc<Mutex<ChatState>>,
    store: Arc<dyn SessionStore>,
    events: broadcast::Sender<ChatEvent>,
    conversation_id: String,
    text: String,
) {
    let title = generator.generate(&text).await;
    if title.is_empty() {
        debug!(conversation_id = %conversation_id, "No title suggestion, keeping fallback");
        return;
    }

    if state.lock().set_conversation_title(&conversation_id, &title) {
        let _ = events.send(ChatEvent::ConversationsChanged);
    }
    if let Err(e) = store.rename_conversation(&conversation_id, &title).await {
        warn!(conversation_id = %conversation_id, error = ?e, "Failed to save generated title");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GroundingChunk, GroundingMetadata, Role, ToastLog, WebSource};
    use crate::services::provider::{
        ChatProvider, GenerateRequest, ProviderError, ProviderResponse, ResponseChunk,
        ResponseStream,
    };
    use crate::test_helpers::{FlakyStore, MockProvider, wait_until};

    const CHAT_MODEL: &str = "chat-model";
    const TITLE_MODEL: &str = "title-model";

    struct Harness {
        controller: Arc<ChatController>,
        provider: Arc<MockProvider>,
        store: Arc<FlakyStore>,
        toasts: Arc<ToastLog>,
        project: Project,
    }

    async fn harness(streaming: bool) -> Harness {
        let provider = Arc::new(MockProvider::new());
        provider.isolate_model(TITLE_MODEL);
        let store = Arc::new(FlakyStore::new());
        let toasts = Arc::new(ToastLog::default());
        let session = Arc::new(ChatSession::new(provider.clone(), CHAT_MODEL, TITLE_MODEL));
        let config = ControllerConfig {
            streaming,
            ..Default::default()
        };
        let controller = Arc::new(ChatController::new(
            store.clone(),
            session,
            toasts.clone(),
            config,
        ));
        controller
            .sign_in(User {
                id: "u1".to_string(),
                name: "Ada".to_string(),
                email: "ada@example.com".to_string(),
                avatar: None,
            })
            .await;
        let project = controller
            .create_project("Research", "Answer briefly", "ocean")
            .await
            .unwrap();
        toasts.clear();

        Harness {
            controller,
            provider,
            store,
            toasts,
            project,
        }
    }

    fn chunk(text: &str) -> Result<ResponseChunk, ProviderError> {
        Ok(ResponseChunk {
            text: text.to_string(),
            grounding_metadata: None,
        })
    }

    fn spawn_send(
        controller: &Arc<ChatController>,
        text: &'static str,
        use_search: bool,
    ) -> JoinHandle<()> {
        let controller = controller.clone();
        tokio::spawn(async move { controller.send_message(text, vec![], use_search).await })
    }

    #[tokio::test]
    async fn test_send_appends_user_and_placeholder_before_reply() {
        let h = harness(true).await;
        let gate = h.provider.push_gated_stream();

        let task = spawn_send(&h.controller, "hello", false);
        wait_until(|| h.controller.messages().len() == 2).await;

        let messages = h.controller.messages();
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].text, "hello");
        assert_eq!(messages[1].role, Role::Model);
        assert_eq!(messages[1].text, "");
        assert!(messages[1].is_streaming);
        assert!(h.controller.is_loading());

        gate.send(chunk("Hi!")).unwrap();
        drop(gate);
        task.await.unwrap();

        let messages = h.controller.messages();
        assert_eq!(messages[1].text, "Hi!");
        assert!(!messages[1].is_streaming);
        assert!(!h.controller.is_loading());
    }

    #[tokio::test]
    async fn test_stop_generation_keeps_partial_text() {
        let h = harness(true).await;
        let gate = h.provider.push_gated_stream();

        let task = spawn_send(&h.controller, "tell me", false);
        gate.send(chunk("He")).unwrap();
        gate.send(chunk("llo")).unwrap();
        wait_until(|| {
            h.controller
                .messages()
                .get(1)
                .is_some_and(|m| m.text == "Hello")
        })
        .await;

        h.controller.stop_generation();
        task.await.unwrap();

        let messages = h.controller.messages();
        assert_eq!(messages[1].text, "Hello [Interrupted]");
        assert!(!messages[1].is_streaming);
        assert!(!h.controller.is_loading());
        assert_eq!(h.toasts.error_count(), 0);

        let conversation_id = h.controller.active_conversation_id().unwrap();
        let stored = h.store.list_messages(&conversation_id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].text, "Hello [Interrupted]");
    }

    #[tokio::test]
    async fn test_stop_generation_in_non_streaming_mode() {
        let h = harness(false).await;
        let _gate = h.provider.push_gated_reply();

        let task = spawn_send(&h.controller, "slow question", false);
        wait_until(|| h.provider.requests_for_model(CHAT_MODEL).len() == 1).await;
        assert_eq!(h.controller.with_state(|s| s.messages.len()), 2);

        h.controller.stop_generation();
        task.await.unwrap();

        let messages = h.controller.messages();
        assert_eq!(messages[1].text, INTERRUPTED_MARKER);
        assert!(!h.controller.is_loading());
        assert_eq!(h.toasts.error_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_generation_when_idle_is_noop() {
        let h = harness(true).await;
        let mut events = h.controller.subscribe();
        h.controller.stop_generation();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_edit_truncates_history_and_store() {
        let h = harness(false).await;
        h.provider.push_reply("B");
        h.provider.push_reply("D");
        h.provider.push_reply("E");

        h.controller.send_message("A", vec![], false).await;
        h.controller.send_message("C", vec![], false).await;
        let before = h.controller.messages();
        let texts: Vec<&str> = before.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["A", "B", "C", "D"]);

        assert!(!h.controller.edit_message(&before[1].id, "B"));
        assert!(h.controller.edit_message(&before[2].id, "C"));
        h.controller.send_message("C2", vec![], false).await;

        let after = h.controller.messages();
        let texts: Vec<&str> = after.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["A", "B", "C2", "E"]);
        assert_eq!(after[0].id, before[0].id);
        assert_eq!(after[1].id, before[1].id);
        assert!(h.controller.editing().is_none());

        // Provider saw only the kept prefix as context
        let last = h.provider.requests_for_model(CHAT_MODEL).pop().unwrap();
        let context: Vec<Option<&str>> = last
            .history
            .iter()
            .map(|c| c.parts[0].text.as_deref())
            .collect();
        assert_eq!(context, vec![Some("A"), Some("B")]);

        let conversation_id = h.controller.active_conversation_id().unwrap();
        let stored = h.store.list_messages(&conversation_id).await.unwrap();
        let stored: Vec<&str> = stored.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(stored, vec!["A", "B", "C2", "E"]);
    }

    #[tokio::test]
    async fn test_cancel_edit_leaves_messages() {
        let h = harness(false).await;
        h.provider.push_reply("reply");
        h.controller.send_message("question", vec![], false).await;
        let id = h.controller.messages()[0].id.clone();

        assert!(h.controller.edit_message(&id, "question"));
        assert_eq!(h.controller.editing().unwrap().draft, "question");
        h.controller.cancel_edit();
        assert!(h.controller.editing().is_none());
        assert_eq!(h.controller.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_title_generated_once_on_first_turn() {
        let h = harness(false).await;
        h.provider
            .push_reply_for_model(TITLE_MODEL, "\"Greeting Exchange\"");
        h.provider.push_reply("one");
        h.provider.push_reply("two");

        h.controller
            .send_message("hello there, this is a fairly long first message", vec![], false)
            .await;
        h.controller.send_message("second", vec![], false).await;
        h.controller.wait_for_background_tasks().await;

        assert_eq!(h.provider.requests_for_model(TITLE_MODEL).len(), 1);
        let conversations = h.controller.conversations();
        assert_eq!(conversations[0].title, "Greeting Exchange");
        let stored = h.store.list_conversations(&h.project.id).await.unwrap();
        assert_eq!(stored[0].title, "Greeting Exchange");
    }

    #[tokio::test]
    async fn test_fallback_title_kept_when_generation_fails() {
        let h = harness(false).await;
        h.provider.push_error_for_model(
            TITLE_MODEL,
            ProviderError::Network("offline".to_string()),
        );
        h.provider.push_reply("ok");

        let text = "abcdefghijklmnopqrstuvwxyz0123456789";
        h.controller.send_message(text, vec![], false).await;
        h.controller.wait_for_background_tasks().await;

        let title = h.controller.conversations()[0].title.clone();
        assert_eq!(title, "abcdefghijklmnopqrstuvwxyz0123...");
        assert_eq!(h.toasts.error_count(), 0);
    }

    #[tokio::test]
    async fn test_late_title_applies_to_its_own_conversation() {
        let h = harness(false).await;
        let title_gate = h.provider.push_gated_reply_for_model(TITLE_MODEL);
        h.provider.push_reply("first reply");

        h.controller.send_message("first chat", vec![], false).await;
        let first_id = h.controller.active_conversation_id().unwrap();

        let second = h.controller.create_conversation().await.unwrap();
        assert_eq!(h.controller.active_conversation_id(), Some(second.id.clone()));

        title_gate
            .send(Ok(crate::services::ProviderResponse {
                text: "Original Topic".to_string(),
                grounding_metadata: None,
            }))
            .unwrap();
        h.controller.wait_for_background_tasks().await;

        let conversations = h.controller.conversations();
        let first = conversations.iter().find(|c| c.id == first_id).unwrap();
        let other = conversations.iter().find(|c| c.id == second.id).unwrap();
        assert_eq!(first.title, "Original Topic");
        assert_eq!(other.title, DEFAULT_CONVERSATION_TITLE);
    }

    #[tokio::test]
    async fn test_search_toggle_keeps_context_across_sends() {
        let h = harness(true).await;
        h.provider.push_stream(&["first ", "answer"]);
        let metadata = GroundingMetadata {
            grounding_chunks: vec![GroundingChunk {
                web: Some(WebSource {
                    uri: "https://news.example".to_string(),
                    title: "News".to_string(),
                }),
            }],
            search_entry_point: None,
        };
        h.provider.push_reply_with_metadata("second answer", metadata.clone());

        h.controller.send_message("first question", vec![], false).await;
        h.controller.send_message("what's new?", vec![], true).await;

        let requests = h.provider.requests_for_model(CHAT_MODEL);
        let second = &requests[1];
        let context: Vec<(Role, Option<&str>)> = second
            .history
            .iter()
            .map(|c| (c.role, c.parts[0].text.as_deref()))
            .collect();
        assert_eq!(
            context,
            vec![
                (Role::User, Some("first question")),
                (Role::Model, Some("first answer")),
            ]
        );
        let messages = h.controller.messages();
        assert_eq!(messages[3].grounding_metadata, Some(metadata));
    }

    #[tokio::test]
    async fn test_reselecting_conversation_loads_once() {
        let h = harness(false).await;
        let conversation = h.controller.create_conversation().await.unwrap();
        h.controller.select_project(None).await;
        h.controller.select_project(Some(&h.project.id)).await;

        h.controller.select_conversation(&conversation.id).await;
        h.controller.select_conversation(&conversation.id).await;
        assert_eq!(h.store.calls("list_messages"), 1);
    }

    #[tokio::test]
    async fn test_select_conversation_seeds_session() {
        let h = harness(false).await;
        h.provider.push_reply("stored reply");
        h.controller.send_message("stored question", vec![], false).await;
        let conversation_id = h.controller.active_conversation_id().unwrap();

        h.controller.create_conversation().await.unwrap();
        h.controller.select_conversation(&conversation_id).await;
        assert_eq!(h.controller.messages().len(), 2);

        h.provider.push_reply("follow-up reply");
        h.controller.send_message("follow-up", vec![], false).await;
        let last = h.provider.requests_for_model(CHAT_MODEL).pop().unwrap();
        assert_eq!(last.history.len(), 2);
        assert_eq!(last.system_instruction.as_deref(), Some("Answer briefly"));
    }

    #[tokio::test]
    async fn test_delete_active_project_cascades_and_clears_selection() {
        let h = harness(false).await;
        h.provider.push_reply("reply");
        h.controller.send_message("hello", vec![], false).await;
        let conversation_id = h.controller.active_conversation_id().unwrap();

        h.controller.delete_project(&h.project.id).await;

        assert!(h.controller.active_project().is_none());
        assert!(h.controller.active_conversation_id().is_none());
        assert!(h.controller.messages().is_empty());
        assert!(h.controller.conversations().is_empty());
        assert!(h.store.list_projects("u1").await.unwrap().is_empty());
        assert!(
            h.store
                .list_messages(&conversation_id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_delete_active_conversation_clears_view() {
        let h = harness(false).await;
        h.provider.push_reply("reply");
        h.controller.send_message("hello", vec![], false).await;
        let conversation_id = h.controller.active_conversation_id().unwrap();

        h.controller.delete_conversation(&conversation_id).await;

        assert!(h.controller.active_conversation_id().is_none());
        assert!(h.controller.messages().is_empty());
        assert!(h.controller.conversations().is_empty());
        assert_eq!(h.controller.active_project().unwrap().id, h.project.id);
    }

    #[tokio::test]
    async fn test_generation_error_is_reported_and_not_persisted() {
        let h = harness(true).await;
        h.provider.push_error(ProviderError::Api {
            status: 500,
            message: "boom".to_string(),
        });

        h.controller.send_message("hello", vec![], false).await;

        let messages = h.controller.messages();
        assert_eq!(messages[1].text, GENERATION_ERROR_TEXT);
        assert!(!messages[1].is_streaming);
        assert!(!h.controller.is_loading());
        assert_eq!(h.toasts.error_count(), 1);

        let conversation_id = h.controller.active_conversation_id().unwrap();
        let stored = h.store.list_messages(&conversation_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_failed_user_save_does_not_block_reply() {
        let h = harness(false).await;
        h.store.fail("save_message");
        h.provider.push_reply("still here");

        h.controller.send_message("hello", vec![], false).await;

        let messages = h.controller.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "hello");
        assert_eq!(messages[1].text, "still here");
        assert!(h.toasts.error_count() >= 1);
        assert!(!h.controller.is_loading());

        h.store.heal("save_message");
        h.provider.push_reply("saved");
        h.controller.send_message("again", vec![], false).await;
        let conversation_id = h.controller.active_conversation_id().unwrap();
        let stored: Vec<String> = h
            .store
            .list_messages(&conversation_id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(stored, vec!["again", "saved"]);
    }

    #[tokio::test]
    async fn test_failed_conversation_creation_aborts_send() {
        let h = harness(false).await;
        h.store.fail("create_conversation");

        h.controller.send_message("hello", vec![], false).await;

        assert!(h.controller.messages().is_empty());
        assert!(!h.controller.is_loading());
        assert_eq!(h.toasts.error_count(), 1);
        assert!(h.provider.requests_for_model(CHAT_MODEL).is_empty());
    }

    #[tokio::test]
    async fn test_store_assigned_ids_replace_client_ids() {
        let h = harness(false).await;
        h.store.assign_server_ids();
        h.provider.push_reply("reply");

        h.controller.send_message("hello", vec![], false).await;

        let ids: Vec<String> = h.controller.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["srv-1".to_string(), "srv-2".to_string()]);
    }

    #[tokio::test]
    async fn test_send_without_project_is_noop() {
        let h = harness(false).await;
        h.controller.select_project(None).await;

        h.controller.send_message("hello", vec![], false).await;

        assert!(h.controller.messages().is_empty());
        assert!(h.provider.requests().is_empty());
        assert_eq!(h.toasts.error_count(), 0);
    }

    #[tokio::test]
    async fn test_send_while_loading_is_ignored() {
        let h = harness(true).await;
        let gate = h.provider.push_gated_stream();
        let task = spawn_send(&h.controller, "first", false);
        wait_until(|| h.controller.is_loading() && h.controller.messages().len() == 2).await;

        h.controller.send_message("second", vec![], false).await;
        assert_eq!(h.controller.messages().len(), 2);

        drop(gate);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_instruction_update_reseeds_session() {
        let h = harness(false).await;
        h.provider.push_reply("first");
        h.controller.send_message("hello", vec![], false).await;

        h.controller
            .update_project_instruction(&h.project.id, "Reply in haiku")
            .await;
        h.provider.push_reply("second");
        h.controller.send_message("again", vec![], false).await;

        let last = h.provider.requests_for_model(CHAT_MODEL).pop().unwrap();
        assert_eq!(last.system_instruction.as_deref(), Some("Reply in haiku"));
        assert_eq!(last.history.len(), 2);
        assert_eq!(
            h.controller.active_project().unwrap().system_instruction,
            "Reply in haiku"
        );

        h.controller
            .update_project_instruction(&h.project.id, "   ")
            .await;
        assert_eq!(
            h.controller.active_project().unwrap().system_instruction,
            DEFAULT_INSTRUCTION
        );
    }

    #[tokio::test]
    async fn test_instruction_update_during_reply_keeps_full_exchange() {
        let h = harness(true).await;
        let gate = h.provider.push_gated_stream();
        let task = spawn_send(&h.controller, "first", false);
        gate.send(chunk("answer")).unwrap();
        wait_until(|| {
            h.controller
                .messages()
                .get(1)
                .is_some_and(|m| m.text == "answer")
        })
        .await;

        h.controller
            .update_project_instruction(&h.project.id, "New persona")
            .await;
        gate.send(chunk(" more")).unwrap();
        drop(gate);
        task.await.unwrap();

        h.provider.push_reply("ok");
        h.controller.send_message("second", vec![], false).await;

        let visible: Vec<String> = h.controller.messages().into_iter().map(|m| m.text).collect();
        assert_eq!(visible, vec!["first", "answer more", "second", "ok"]);
        let last = h.provider.requests_for_model(CHAT_MODEL).pop().unwrap();
        let context: Vec<(Role, Option<&str>)> = last
            .history
            .iter()
            .map(|c| (c.role, c.parts[0].text.as_deref()))
            .collect();
        assert_eq!(
            context,
            vec![(Role::User, Some("first")), (Role::Model, Some("answer more"))]
        );
        assert_eq!(last.system_instruction.as_deref(), Some("New persona"));
    }

    /// Stream that stops the controller's generation while delivering its end.
    struct StopAtEndProvider {
        controller: Mutex<Option<Arc<ChatController>>>,
    }

    #[async_trait::async_trait]
    impl ChatProvider for StopAtEndProvider {
        async fn generate(
            &self,
            _request: GenerateRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse::default())
        }

        async fn stream(&self, _request: GenerateRequest) -> Result<ResponseStream, ProviderError> {
            let controller = self.controller.lock().clone();
            Ok(Box::pin(futures::stream::unfold(false, move |done| {
                let controller = controller.clone();
                async move {
                    if done {
                        if let Some(controller) = controller {
                            controller.stop_generation();
                        }
                        None
                    } else {
                        Some((chunk("done"), true))
                    }
                }
            })))
        }
    }

    #[tokio::test]
    async fn test_stop_racing_reply_end_keeps_marker() {
        let provider = Arc::new(StopAtEndProvider {
            controller: Mutex::new(None),
        });
        let store = Arc::new(FlakyStore::new());
        let session = Arc::new(ChatSession::new(provider.clone(), CHAT_MODEL, TITLE_MODEL));
        let controller = Arc::new(ChatController::new(
            store.clone(),
            session,
            Arc::new(ToastLog::default()),
            ControllerConfig::default(),
        ));
        *provider.controller.lock() = Some(controller.clone());
        controller
            .sign_in(User {
                id: "u1".to_string(),
                name: "Ada".to_string(),
                email: "ada@example.com".to_string(),
                avatar: None,
            })
            .await;
        controller.create_project("Research", "", "").await.unwrap();

        controller.send_message("hello", vec![], false).await;

        let messages = controller.messages();
        assert_eq!(messages[1].text, "done [Interrupted]");
        assert!(!messages[1].is_streaming);
        assert!(!controller.is_loading());
        let conversation_id = controller.active_conversation_id().unwrap();
        let stored = store.list_messages(&conversation_id).await.unwrap();
        assert_eq!(stored[1].text, "done [Interrupted]");
        *provider.controller.lock() = None;
    }

    #[tokio::test]
    async fn test_change_theme_falls_back_to_default() {
        let h = harness(false).await;
        h.controller.change_project_theme(&h.project.id, "eco").await;
        assert_eq!(h.controller.active_project().unwrap().theme_id, "eco");

        h.controller
            .change_project_theme(&h.project.id, "neon-pink")
            .await;
        assert_eq!(h.controller.active_project().unwrap().theme_id, "ocean");
        let stored = h.store.list_projects("u1").await.unwrap();
        assert_eq!(stored[0].theme_id, "ocean");
    }

    #[tokio::test]
    async fn test_rename_conversation_and_project() {
        let h = harness(false).await;
        let conversation = h.controller.create_conversation().await.unwrap();

        h.controller
            .rename_conversation(&conversation.id, "  Renamed  ")
            .await;
        h.controller.rename_project(&h.project.id, "Lab").await;

        assert_eq!(h.controller.conversations()[0].title, "Renamed");
        assert_eq!(h.controller.active_project().unwrap().name, "Lab");
    }

    #[tokio::test]
    async fn test_navigation_during_generation_aborts_and_persists() {
        let h = harness(true).await;
        let gate = h.provider.push_gated_stream();
        let task = spawn_send(&h.controller, "first", false);
        gate.send(chunk("partial")).unwrap();
        wait_until(|| {
            h.controller
                .messages()
                .get(1)
                .is_some_and(|m| m.text == "partial")
        })
        .await;
        let original = h.controller.active_conversation_id().unwrap();

        h.controller.create_conversation().await.unwrap();
        assert!(!h.controller.is_loading());
        task.await.unwrap();

        assert!(h.controller.messages().is_empty());
        let stored = h.store.list_messages(&original).await.unwrap();
        assert_eq!(stored[1].text, "partial [Interrupted]");
    }

    #[tokio::test]
    async fn test_sign_out_clears_everything() {
        let h = harness(false).await;
        h.provider.push_reply("reply");
        h.controller.send_message("hello", vec![], false).await;

        h.controller.sign_out();

        assert!(h.controller.projects().is_empty());
        assert!(h.controller.conversations().is_empty());
        assert!(h.controller.messages().is_empty());
        assert!(h.controller.active_project().is_none());
        assert!(h.controller.with_state(|s| s.user.is_none()));
    }

    #[tokio::test]
    async fn test_stream_deltas_are_published() {
        let h = harness(true).await;
        h.provider.push_stream(&["a", "b"]);
        let mut events = h.controller.subscribe();

        h.controller.send_message("go", vec![], false).await;

        let mut deltas = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ChatEvent::StreamDelta { delta, .. } = event {
                deltas.push(delta);
            }
        }
        assert_eq!(deltas, vec!["a".to_string(), "b".to_string()]);
    }
}
