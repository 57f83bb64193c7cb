use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::provider::{
    ChatProvider, Content, GenerateRequest, Part, ProviderError, Tool, contents_to_messages,
    history_to_contents, user_parts,
};
use super::title_generator::TitleGenerator;
use crate::models::message::merge_grounding;
use crate::models::{Attachment, GroundingMetadata, Message, Role};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Generation failed: {0}")]
    Generation(#[from] ProviderError),

    /// Cancelled through [`ChatSession::abort`]. Not a failure from the user's point of view.
    #[error("Generation aborted")]
    Aborted {
        partial_text: String,
        grounding_metadata: Option<GroundingMetadata>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionReply {
    pub text: String,
    pub grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Default)]
struct SessionInner {
    started: bool,
    history: Vec<Content>,
    system_instruction: String,
    use_search: bool,
    /// Bumped by every `start_session`; a send only records its exchange if unchanged
    epoch: u64,
}

/// Everything a send needs, captured under one lock.
struct PreparedTurn {
    request: GenerateRequest,
    user_turn: Content,
    epoch: u64,
}

enum StreamOutcome {
    Completed,
    Aborted,
    Failed(ProviderError),
}

/// The live conversation with the model: system instruction, tool
/// configuration and the accumulated turn history.
///
/// One instance per chat view, owned by the controller. Sends are expected
/// to be serialized by the caller; `abort` may be called from anywhere.
pub struct ChatSession {
    provider: Arc<dyn ChatProvider>,
    model: String,
    title_generator: TitleGenerator,
    inner: Mutex<SessionInner>,
    cancel: Mutex<Option<(u64, CancellationToken)>>,
    next_call_id: AtomicU64,
}

impl ChatSession {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        model: impl Into<String>,
        title_model: impl Into<String>,
    ) -> Self {
        Self {
            title_generator: TitleGenerator::new(provider.clone(), title_model),
            provider,
            model: model.into(),
            inner: Mutex::new(SessionInner::default()),
            cancel: Mutex::new(None),
            next_call_id: AtomicU64::new(0),
        }
    }

    /// Replace the session with one seeded from `history`.
    /// Messages without text or attachments are left out of the turn history.
    pub fn start_session(&self, history: &[Message], system_instruction: &str, use_search: bool) {
        let contents = history_to_contents(history);
        let mut inner = self.inner.lock();
        inner.started = true;
        inner.epoch += 1;
        inner.history = contents;
        inner.system_instruction = system_instruction.to_string();
        inner.use_search = use_search;
        info!(
            turns = inner.history.len(),
            use_search,
            epoch = inner.epoch,
            "Chat session started"
        );
    }

    /// Change the instruction for later sends, keeping history and epoch.
    /// Safe while a send is in flight: its exchange is still recorded.
    pub fn set_system_instruction(&self, system_instruction: &str) {
        let mut inner = self.inner.lock();
        inner.system_instruction = system_instruction.to_string();
        debug!(epoch = inner.epoch, "System instruction updated in place");
    }

    pub fn system_instruction(&self) -> String {
        self.inner.lock().system_instruction.clone()
    }

    pub fn use_search(&self) -> bool {
        self.inner.lock().use_search
    }

    /// Accumulated turn history as messages (fresh ids, text and attachments only).
    pub fn history(&self) -> Vec<Message> {
        contents_to_messages(&self.inner.lock().history)
    }

    pub fn title_generator(&self) -> TitleGenerator {
        self.title_generator.clone()
    }

    /// Whether a send is currently armed for cancellation.
    pub fn is_in_flight(&self) -> bool {
        self.cancel.lock().is_some()
    }

    /// Cancel the in-flight send, if any. Safe to call at any time.
    pub fn abort(&self) {
        if let Some((call_id, token)) = self.cancel.lock().take() {
            debug!(call_id, "Aborting generation");
            token.cancel();
        }
    }

    /// Non-streaming send: waits for the whole reply.
    pub async fn send(
        &self,
        text: &str,
        attachments: &[Attachment],
        use_search: bool,
    ) -> Result<SessionReply, SessionError> {
        let turn = self.prepare(text, attachments, use_search);
        let (call_id, token) = self.arm();

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SessionError::Aborted {
                partial_text: String::new(),
                grounding_metadata: None,
            }),
            response = self.provider.generate(turn.request) => response.map_err(SessionError::from),
        };
        self.disarm(call_id);

        if let Ok(reply) = &result {
            self.record(turn.epoch, turn.user_turn, &reply.text);
        }
        result.map(|response| SessionReply {
            text: response.text,
            grounding_metadata: response.grounding_metadata,
        })
    }

    /// Streaming send. `on_chunk` sees every delta until the stream ends or is aborted;
    /// nothing is delivered after cancellation.
    pub async fn send_streaming<F>(
        &self,
        text: &str,
        attachments: &[Attachment],
        use_search: bool,
        mut on_chunk: F,
    ) -> Result<SessionReply, SessionError>
    where
        F: FnMut(&str, Option<&GroundingMetadata>) + Send,
    {
        let turn = self.prepare(text, attachments, use_search);
        let (call_id, token) = self.arm();

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            stream = self.provider.stream(turn.request) => Some(stream),
        };
        let mut stream = match opened {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                self.disarm(call_id);
                return Err(SessionError::Generation(e));
            }
            None => {
                return Err(SessionError::Aborted {
                    partial_text: String::new(),
                    grounding_metadata: None,
                });
            }
        };

        let mut full_text = String::new();
        let mut metadata: Option<GroundingMetadata> = None;
        let outcome = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break StreamOutcome::Aborted,
                item = stream.next() => match item {
                    Some(Ok(chunk)) => {
                        full_text.push_str(&chunk.text);
                        merge_grounding(&mut metadata, chunk.grounding_metadata.as_ref());
                        on_chunk(&chunk.text, chunk.grounding_metadata.as_ref());
                    }
                    Some(Err(e)) => break StreamOutcome::Failed(e),
                    None => break StreamOutcome::Completed,
                },
            }
        };
        self.disarm(call_id);

        match outcome {
            StreamOutcome::Completed => {
                self.record(turn.epoch, turn.user_turn, &full_text);
                Ok(SessionReply {
                    text: full_text,
                    grounding_metadata: metadata,
                })
            }
            StreamOutcome::Aborted => {
                self.record(turn.epoch, turn.user_turn, &full_text);
                Err(SessionError::Aborted {
                    partial_text: full_text,
                    grounding_metadata: metadata,
                })
            }
            StreamOutcome::Failed(e) => Err(SessionError::Generation(e)),
        }
    }

    /// Build the request, rebuilding the session first if the search setting changed.
    fn prepare(&self, text: &str, attachments: &[Attachment], use_search: bool) -> PreparedTurn {
        let mut inner = self.inner.lock();
        if !inner.started {
            debug!("No session yet, starting one with empty history");
            inner.started = true;
            inner.epoch += 1;
        }
        if inner.use_search != use_search {
            // Same turns, new tool configuration
            info!(
                use_search,
                turns = inner.history.len(),
                "Reconstructing chat session for search toggle"
            );
            inner.use_search = use_search;
        }

        let parts: Vec<Part> = user_parts(text, attachments);
        let tools = if inner.use_search {
            vec![Tool::WebSearch]
        } else {
            Vec::new()
        };
        let system_instruction =
            Some(inner.system_instruction.clone()).filter(|s| !s.trim().is_empty());

        PreparedTurn {
            request: GenerateRequest {
                model: self.model.clone(),
                system_instruction,
                tools,
                history: inner.history.clone(),
                message: parts.clone(),
                generation_config: None,
            },
            user_turn: Content {
                role: Role::User,
                parts,
            },
            epoch: inner.epoch,
        }
    }

    fn arm(&self) -> (u64, CancellationToken) {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        *self.cancel.lock() = Some((call_id, token.clone()));
        (call_id, token)
    }

    fn disarm(&self, call_id: u64) {
        let mut cancel = self.cancel.lock();
        if cancel.as_ref().map(|(id, _)| *id) == Some(call_id) {
            *cancel = None;
        }
    }

    /// Append a finished exchange, unless the session was restarted meanwhile
    /// or there is no model text to pair the user turn with.
    fn record(&self, epoch: u64, user_turn: Content, model_text: &str) {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            warn!(
                call_epoch = epoch,
                current_epoch = inner.epoch,
                "Session restarted during generation, not recording exchange"
            );
            return;
        }
        if model_text.is_empty() || user_turn.parts.is_empty() {
            return;
        }
        inner.history.push(user_turn);
        inner.history.push(Content {
            role: Role::Model,
            parts: vec![Part::text(model_text)],
        });
    }
}
