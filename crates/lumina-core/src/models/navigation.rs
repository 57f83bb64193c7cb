/// Which project and conversation the user is looking at.
///
/// Pure selection state: transitions report whether anything changed and the
/// controller performs the matching loads. A conversation can only be active
/// while a project is active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Navigation {
    active_project_id: Option<String>,
    active_conversation_id: Option<String>,
}

impl Navigation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_project_id(&self) -> Option<&str> {
        self.active_project_id.as_deref()
    }

    pub fn active_conversation_id(&self) -> Option<&str> {
        self.active_project_id
            .as_ref()
            .and(self.active_conversation_id.as_deref())
    }

    pub fn is_project_active(&self, id: &str) -> bool {
        self.active_project_id.as_deref() == Some(id)
    }

    pub fn is_conversation_active(&self, id: &str) -> bool {
        self.active_conversation_id() == Some(id)
    }

    /// Switch projects. Always drops the active conversation.
    /// Returns false if `id` is already the active project.
    pub fn select_project(&mut self, id: Option<String>) -> bool {
        if self.active_project_id == id {
            return false;
        }
        self.active_project_id = id;
        self.active_conversation_id = None;
        true
    }

    /// Switch conversations within the active project.
    /// Returns false when no project is active or `id` is already active.
    pub fn select_conversation(&mut self, id: &str) -> bool {
        if self.active_project_id.is_none() || self.is_conversation_active(id) {
            return false;
        }
        self.active_conversation_id = Some(id.to_string());
        true
    }

    /// Clear pointers that referenced a deleted project. Returns true if anything was cleared.
    pub fn forget_project(&mut self, id: &str) -> bool {
        if self.is_project_active(id) {
            self.active_project_id = None;
            self.active_conversation_id = None;
            true
        } else {
            false
        }
    }

    /// Clear the conversation pointer if it referenced a deleted conversation.
    pub fn forget_conversation(&mut self, id: &str) -> bool {
        if self.active_conversation_id.as_deref() == Some(id) {
            self.active_conversation_id = None;
            true
        } else {
            false
        }
    }
}
