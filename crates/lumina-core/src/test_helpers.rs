//! Shared test doubles.
//!
//! - `MockProvider`: scripted [`ChatProvider`] with gated streams and request capture.
//! - `FlakyStore`: in-memory [`SessionStore`] with per-operation failure injection.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::models::{
    Conversation, GroundingMetadata, Message, NewProject, Project, ProjectUpdate,
};
use crate::repositories::{
    BoxFuture, InMemorySessionStore, SessionStore, StoreError, StoreResult,
};
use crate::services::provider::{
    ChatProvider, GenerateRequest, ProviderError, ProviderResponse, ResponseChunk, ResponseStream,
};

pub type ChunkSender = mpsc::UnboundedSender<Result<ResponseChunk, ProviderError>>;
pub type ReplySender = oneshot::Sender<Result<ProviderResponse, ProviderError>>;

enum Scripted {
    Reply(ProviderResponse),
    Error(ProviderError),
    Stream(Vec<Result<ResponseChunk, ProviderError>>),
    GatedStream(mpsc::UnboundedReceiver<Result<ResponseChunk, ProviderError>>),
    GatedReply(oneshot::Receiver<Result<ProviderResponse, ProviderError>>),
}

/// Scripted provider. Scripts are consumed in order. A model that ever had
/// a script pushed for it only draws from its own queue; every other model
/// shares one queue. With nothing scripted, replies are empty.
pub struct MockProvider {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

const ANY_MODEL: &str = "";

impl MockProvider {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, model: &str, script: Scripted) {
        self.scripts
            .lock()
            .entry(model.to_string())
            .or_default()
            .push_back(script);
    }

    /// Give `model` its own (empty) queue so it never consumes shared scripts.
    pub fn isolate_model(&self, model: &str) {
        self.scripts.lock().entry(model.to_string()).or_default();
    }

    pub fn push_reply(&self, text: &str) {
        self.push(
            ANY_MODEL,
            Scripted::Reply(ProviderResponse {
                text: text.to_string(),
                grounding_metadata: None,
            }),
        );
    }

    pub fn push_reply_with_metadata(&self, text: &str, metadata: GroundingMetadata) {
        self.push(
            ANY_MODEL,
            Scripted::Reply(ProviderResponse {
                text: text.to_string(),
                grounding_metadata: Some(metadata),
            }),
        );
    }

    pub fn push_reply_for_model(&self, model: &str, text: &str) {
        self.push(
            model,
            Scripted::Reply(ProviderResponse {
                text: text.to_string(),
                grounding_metadata: None,
            }),
        );
    }

    pub fn push_error(&self, error: ProviderError) {
        self.push(ANY_MODEL, Scripted::Error(error));
    }

    pub fn push_error_for_model(&self, model: &str, error: ProviderError) {
        self.push(model, Scripted::Error(error));
    }

    pub fn push_stream(&self, chunks: &[&str]) {
        let chunks = chunks
            .iter()
            .map(|text| {
                Ok(ResponseChunk {
                    text: text.to_string(),
                    grounding_metadata: None,
                })
            })
            .collect();
        self.push(ANY_MODEL, Scripted::Stream(chunks));
    }

    /// Stream whose chunks are fed by the returned sender; dropping it ends the stream.
    pub fn push_gated_stream(&self) -> ChunkSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(ANY_MODEL, Scripted::GatedStream(rx));
        tx
    }

    /// Non-streaming reply released by the returned sender.
    pub fn push_gated_reply(&self) -> ReplySender {
        let (tx, rx) = oneshot::channel();
        self.push(ANY_MODEL, Scripted::GatedReply(rx));
        tx
    }

    pub fn push_gated_reply_for_model(&self, model: &str) -> ReplySender {
        let (tx, rx) = oneshot::channel();
        self.push(model, Scripted::GatedReply(rx));
        tx
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_for_model(&self, model: &str) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.model == model)
            .cloned()
            .collect()
    }

    /// Wait until at least `count` requests were received.
    pub async fn wait_for_requests(&self, count: usize) {
        wait_until(|| self.requests.lock().len() >= count).await;
    }

    fn next_script(&self, request: &GenerateRequest) -> Option<Scripted> {
        self.requests.lock().push(request.clone());
        let mut scripts = self.scripts.lock();
        if let Some(queue) = scripts.get_mut(&request.model) {
            return queue.pop_front();
        }
        scripts.get_mut(ANY_MODEL).and_then(|q| q.pop_front())
    }
}

fn gate_closed() -> ProviderError {
    ProviderError::Network("gate closed".to_string())
}

#[async_trait]
impl ChatProvider for MockProvider {
    async fn generate(&self, request: GenerateRequest) -> Result<ProviderResponse, ProviderError> {
        match self.next_script(&request) {
            None => Ok(ProviderResponse::default()),
            Some(Scripted::Reply(reply)) => Ok(reply),
            Some(Scripted::Error(e)) => Err(e),
            Some(Scripted::Stream(chunks)) => {
                let mut response = ProviderResponse::default();
                for chunk in chunks {
                    let chunk = chunk?;
                    response.text.push_str(&chunk.text);
                    if chunk.grounding_metadata.is_some() {
                        response.grounding_metadata = chunk.grounding_metadata;
                    }
                }
                Ok(response)
            }
            Some(Scripted::GatedStream(mut rx)) => {
                let mut response = ProviderResponse::default();
                while let Some(chunk) = rx.recv().await {
                    response.text.push_str(&chunk?.text);
                }
                Ok(response)
            }
            Some(Scripted::GatedReply(rx)) => rx.await.unwrap_or_else(|_| Err(gate_closed())),
        }
    }

    async fn stream(&self, request: GenerateRequest) -> Result<ResponseStream, ProviderError> {
        match self.next_script(&request) {
            None => Ok(Box::pin(stream::empty::<Result<ResponseChunk, ProviderError>>())),
            Some(Scripted::Reply(reply)) => {
                let chunk: Result<ResponseChunk, ProviderError> = Ok(ResponseChunk {
                    text: reply.text,
                    grounding_metadata: reply.grounding_metadata,
                });
                Ok(Box::pin(stream::iter(vec![chunk])))
            }
            Some(Scripted::Error(e)) => Err(e),
            Some(Scripted::Stream(chunks)) => Ok(Box::pin(stream::iter(chunks))),
            Some(Scripted::GatedStream(rx)) => Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }))),
            Some(Scripted::GatedReply(rx)) => Ok(Box::pin(stream::once(async move {
                rx.await.unwrap_or_else(|_| Err(gate_closed())).map(|reply| ResponseChunk {
                    text: reply.text,
                    grounding_metadata: reply.grounding_metadata,
                })
            }))),
        }
    }
}

/// Poll `condition` until it holds; panics after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached within 5s");
}

/// In-memory store that can be told to fail specific operations.
///
/// Operation names match the `SessionStore` method names.
pub struct FlakyStore {
    inner: InMemorySessionStore,
    failing: Mutex<HashSet<&'static str>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    server_ids: AtomicBool,
    next_server_id: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemorySessionStore::new(),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(HashMap::new()),
            server_ids: AtomicBool::new(false),
            next_server_id: AtomicUsize::new(0),
        }
    }

    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().insert(operation);
    }

    pub fn heal(&self, operation: &'static str) {
        self.failing.lock().remove(operation);
    }

    /// Make `save_message` replace client ids with store-assigned ones.
    pub fn assign_server_ids(&self) {
        self.server_ids.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self, operation: &'static str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    /// Record the call; true if it should fail.
    fn enter(&self, operation: &'static str) -> bool {
        *self.calls.lock().entry(operation).or_default() += 1;
        self.failing.lock().contains(operation)
    }
}

fn injected<T: Send + 'static>(operation: &'static str) -> BoxFuture<'static, StoreResult<T>> {
    Box::pin(async move {
        Err(StoreError::InvalidData {
            message: format!("injected failure in {operation}"),
        })
    })
}

impl SessionStore for FlakyStore {
    fn list_projects(&self, user_id: &str) -> BoxFuture<'static, StoreResult<Vec<Project>>> {
        if self.enter("list_projects") {
            return injected("list_projects");
        }
        self.inner.list_projects(user_id)
    }

    fn create_project(&self, project: NewProject) -> BoxFuture<'static, StoreResult<Project>> {
        if self.enter("create_project") {
            return injected("create_project");
        }
        self.inner.create_project(project)
    }

    fn update_project(
        &self,
        id: &str,
        update: ProjectUpdate,
    ) -> BoxFuture<'static, StoreResult<()>> {
        if self.enter("update_project") {
            return injected("update_project");
        }
        self.inner.update_project(id, update)
    }

    fn delete_project(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        if self.enter("delete_project") {
            return injected("delete_project");
        }
        self.inner.delete_project(id)
    }

    fn list_conversations(
        &self,
        project_id: &str,
    ) -> BoxFuture<'static, StoreResult<Vec<Conversation>>> {
        if self.enter("list_conversations") {
            return injected("list_conversations");
        }
        self.inner.list_conversations(project_id)
    }

    fn create_conversation(
        &self,
        project_id: &str,
        title: &str,
    ) -> BoxFuture<'static, StoreResult<Conversation>> {
        if self.enter("create_conversation") {
            return injected("create_conversation");
        }
        self.inner.create_conversation(project_id, title)
    }

    fn rename_conversation(&self, id: &str, title: &str) -> BoxFuture<'static, StoreResult<()>> {
        if self.enter("rename_conversation") {
            return injected("rename_conversation");
        }
        self.inner.rename_conversation(id, title)
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        if self.enter("delete_conversation") {
            return injected("delete_conversation");
        }
        self.inner.delete_conversation(id)
    }

    fn touch_conversation(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        if self.enter("touch_conversation") {
            return injected("touch_conversation");
        }
        self.inner.touch_conversation(id)
    }

    fn list_messages(&self, conversation_id: &str) -> BoxFuture<'static, StoreResult<Vec<Message>>> {
        if self.enter("list_messages") {
            return injected("list_messages");
        }
        self.inner.list_messages(conversation_id)
    }

    fn save_message(
        &self,
        conversation_id: &str,
        mut message: Message,
    ) -> BoxFuture<'static, StoreResult<Message>> {
        if self.enter("save_message") {
            return injected("save_message");
        }
        if self.server_ids.load(Ordering::SeqCst) {
            let n = self.next_server_id.fetch_add(1, Ordering::SeqCst) + 1;
            message.id = format!("srv-{n}");
        }
        self.inner.save_message(conversation_id, message)
    }

    fn delete_messages(
        &self,
        conversation_id: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'static, StoreResult<()>> {
        if self.enter("delete_messages") {
            return injected("delete_messages");
        }
        self.inner.delete_messages(conversation_id, ids)
    }
}
