use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use super::message::new_id;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToastKind {
    Success,
    Error,
    Info,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Toast {
    pub id: String,
    pub message: String,
    pub kind: ToastKind,
}

/// Sink for user-visible outcomes of asynchronous operations.
///
/// This is the only channel through which failures reach the user; nothing
/// below the controller surfaces raw errors to the front-end.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, toast: Toast);

    fn success(&self, message: &str) {
        self.notify(Toast {
            id: new_id(),
            message: message.to_string(),
            kind: ToastKind::Success,
        });
    }

    fn error(&self, message: &str) {
        self.notify(Toast {
            id: new_id(),
            message: message.to_string(),
            kind: ToastKind::Error,
        });
    }

    fn info(&self, message: &str) {
        self.notify(Toast {
            id: new_id(),
            message: message.to_string(),
            kind: ToastKind::Info,
        });
    }
}

/// Bounded in-memory toast log with FIFO eviction.
/// Front-ends poll it; tests inspect it.
pub struct ToastLog {
    entries: Mutex<VecDeque<Toast>>,
    max_entries: usize,
}

impl ToastLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn entries(&self) -> Vec<Toast> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn error_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|t| t.kind == ToastKind::Error)
            .count()
    }

    /// Remove a toast once the front-end has dismissed it
    pub fn dismiss(&self, id: &str) {
        self.entries.lock().retain(|t| t.id != id);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for ToastLog {
    fn default() -> Self {
        Self::new(100)
    }
}

impl Notifier for ToastLog {
    fn notify(&self, toast: Toast) {
        let mut entries = self.entries.lock();
        entries.push_back(toast);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }
}

/// Forwards toasts to a channel consumed by a front-end task.
pub struct ChannelNotifier {
    sender: UnboundedSender<Toast>,
}

impl ChannelNotifier {
    pub fn new(sender: UnboundedSender<Toast>) -> Self {
        Self { sender }
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, toast: Toast) {
        // Receiver gone means the front-end shut down; nothing left to show it to.
        if self.sender.send(toast).is_err() {
            tracing::debug!("Toast receiver dropped");
        }
    }
}
