//! Mock implementations for testing
//!
//! These mocks enable integration testing without real I/O.

use super::traits::*;
use crate::context::{ContextSettings, ConversationContext, Services};
use crate::db::{Checkpoint, Conversation};
use crate::fsm::{FsmDefinition, State};
use crate::mml::{Message, NewMessage, Sender, Stack, ValidationError, WsSerializer};
use crate::rpc::{
    LlmResponseMessage, PartialResult, RpcBridge, WorkerDirectory, WorkerReply, WorkerRequest,
};
use crate::worker::{AnswerRequest, Answerer, Chunk, ChunkStream, WorkerError};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// ============================================================================
// In-Memory Storage
// ============================================================================

#[derive(Default)]
struct StorageInner {
    conversations: HashMap<String, Conversation>,
    messages: Vec<Message>,
    definitions: HashMap<String, FsmDefinition>,
    checkpoints: HashMap<String, Checkpoint>,
}

/// In-memory storage enforcing the same chain rules as the database
#[derive(Default)]
pub struct InMemoryStorage {
    inner: Mutex<StorageInner>,
    fail_writes: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definition(self, def: FsmDefinition) -> Self {
        self.add_definition(def);
        self
    }

    pub fn add_definition(&self, def: FsmDefinition) {
        self.inner
            .lock()
            .unwrap()
            .definitions
            .insert(def.name.clone(), def);
    }

    /// Make every message write fail with a backend error
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn checkpoint_count(&self) -> usize {
        self.inner.lock().unwrap().checkpoints.len()
    }

    pub fn message_count(&self, conv_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conv_id)
            .count()
    }
}

fn check_prev(messages: &[Message], msg: &NewMessage) -> Result<(), ValidationError> {
    let same_conv = || messages.iter().filter(|m| m.conversation_id == msg.conversation_id);
    match &msg.prev {
        None if same_conv().any(|m| m.prev.is_none()) => Err(ValidationError::DuplicatePrev),
        None => Ok(()),
        Some(prev) => {
            let owner = messages
                .iter()
                .find(|m| &m.id == prev)
                .ok_or_else(|| ValidationError::UnknownPrev(prev.clone()))?;
            if owner.conversation_id != msg.conversation_id {
                return Err(ValidationError::ForeignPrev(prev.clone()));
            }
            if same_conv().any(|m| m.prev.as_ref() == Some(prev)) {
                return Err(ValidationError::DuplicatePrev);
            }
            Ok(())
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryStorage {
    async fn get_or_create_conversation(
        &self,
        platform_conversation_id: &str,
    ) -> Result<Conversation, String> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .conversations
            .values()
            .find(|c| c.platform_conversation_id == platform_conversation_id)
        {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let conv = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            platform_conversation_id: platform_conversation_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.conversations.insert(conv.id.clone(), conv.clone());
        Ok(conv)
    }

    async fn find_conversation(
        &self,
        platform_conversation_id: &str,
    ) -> Result<Option<Conversation>, String> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .conversations
            .values()
            .find(|c| c.platform_conversation_id == platform_conversation_id)
            .cloned())
    }

    async fn add_message(&self, msg: &NewMessage) -> Result<Message, StoreError> {
        msg.validate()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("in-memory storage set to fail".to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.conversations.contains_key(&msg.conversation_id) {
            return Err(StoreError::Backend(format!(
                "Conversation not found: {}",
                msg.conversation_id
            )));
        }
        check_prev(&inner.messages, msg)?;

        let sequence_id = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == msg.conversation_id)
            .count() as i64
            + 1;
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: msg.conversation_id.clone(),
            sequence_id,
            sender: msg.sender.clone(),
            stacks: msg.stacks.clone(),
            send_time: msg.send_time,
            prev: msg.prev.clone(),
            created_at: Utc::now(),
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn get_last_message(&self, conv_id: &str) -> Result<Option<Message>, String> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .rev()
            .find(|m| m.conversation_id == conv_id)
            .cloned())
    }

    async fn get_messages(&self, conv_id: &str) -> Result<Vec<Message>, String> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conv_id)
            .cloned()
            .collect())
    }

    async fn delete_conversation(&self, conv_id: &str) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.conversations.remove(conv_id).is_none() {
            return Err(format!("Conversation not found: {conv_id}"));
        }
        inner.messages.retain(|m| m.conversation_id != conv_id);
        inner.checkpoints.remove(conv_id);
        Ok(())
    }
}

#[async_trait]
impl DefinitionStore for InMemoryStorage {
    async fn get_definition_by_name(&self, name: &str) -> Result<Option<FsmDefinition>, String> {
        Ok(self.inner.lock().unwrap().definitions.get(name).cloned())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn save_checkpoint(
        &self,
        conv_id: &str,
        fsm_name: &str,
        state: &State,
    ) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();
        let fsm_definition_id = inner.definitions.get(fsm_name).and_then(|d| d.id);
        inner.checkpoints.insert(
            conv_id.to_string(),
            Checkpoint {
                conversation_id: conv_id.to_string(),
                fsm_definition_id,
                fsm_name: fsm_name.to_string(),
                state: state.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_checkpoint(&self, conv_id: &str) -> Result<Option<Checkpoint>, String> {
        Ok(self.inner.lock().unwrap().checkpoints.get(conv_id).cloned())
    }
}

// ============================================================================
// Recording Transport
// ============================================================================

/// Transport that records every payload, optionally failing each send
#[derive(Default)]
pub struct RecordingTransport {
    payloads: Mutex<Vec<Value>>,
    fail: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().unwrap().clone()
    }

    /// Delivered payloads, read back as serialized messages
    pub fn messages(&self) -> Vec<Message> {
        self.payloads()
            .into_iter()
            .filter_map(|p| serde_json::from_value(p).ok())
            .collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages().iter().map(Message::text).collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, payload: Value) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError("recording transport set to fail".to_string()));
        }
        self.payloads.lock().unwrap().push(payload);
        Ok(())
    }
}

// ============================================================================
// Scripted Answerer
// ============================================================================

/// Answerer that streams a fixed list of chunks
pub struct ScriptedAnswerer {
    model_id: String,
    chunks: Vec<Chunk>,
    fail_after: Option<usize>,
    /// Record of all requests made
    pub requests: Mutex<Vec<AnswerRequest>>,
}

impl ScriptedAnswerer {
    pub fn new(model_id: impl Into<String>, chunks: Vec<Chunk>) -> Self {
        Self {
            model_id: model_id.into(),
            chunks,
            fail_after: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Yield an error after `n` chunks instead of finishing
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

#[async_trait]
impl Answerer for ScriptedAnswerer {
    async fn answer(&self, request: &AnswerRequest) -> Result<ChunkStream, WorkerError> {
        self.requests.lock().unwrap().push(request.clone());
        let mut items: Vec<Result<Chunk, WorkerError>> = self.chunks.iter().cloned().map(Ok).collect();
        if let Some(n) = self.fail_after {
            items.truncate(n);
            items.push(Err(WorkerError::network("scripted failure")));
        }
        Ok(stream::iter(items).boxed())
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ============================================================================
// Test Session Builder
// ============================================================================

/// One conversation wired to in-memory collaborators
pub struct TestSession {
    pub storage: Arc<InMemoryStorage>,
    pub transport: Arc<RecordingTransport>,
    pub bridge: Arc<RpcBridge>,
    pub directory: WorkerDirectory,
    pub conversation_id: String,
    pub platform_conversation_id: String,
    settings: ContextSettings,
}

impl TestSession {
    pub async fn new() -> Self {
        Self::with_storage(Arc::new(InMemoryStorage::new())).await
    }

    pub async fn with_storage(storage: Arc<InMemoryStorage>) -> Self {
        let conv = storage
            .get_or_create_conversation("test-platform-conv")
            .await
            .unwrap();
        Self {
            storage,
            transport: Arc::new(RecordingTransport::new()),
            bridge: Arc::new(RpcBridge::new()),
            directory: WorkerDirectory::new(),
            conversation_id: conv.id,
            platform_conversation_id: conv.platform_conversation_id,
            settings: ContextSettings::default(),
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.settings.default_model = Some(model.into());
        self
    }

    /// Serve `llm` requests by replaying `results` into the bridge, yielding
    /// between results so the consumer may resume in the middle
    pub fn with_scripted_worker(mut self, results: Vec<PartialResult>) -> Self {
        let (tx, mut rx) = mpsc::channel::<WorkerRequest>(8);
        let bridge = Arc::clone(&self.bridge);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let WorkerRequest::LlmRequest {
                    bot_channel_name, ..
                } = request
                else {
                    continue;
                };
                for result in results.clone() {
                    let _ = bridge.dispatch(WorkerReply::SendLlmResponse {
                        message: LlmResponseMessage {
                            bot_channel_name: Some(bot_channel_name.clone()),
                            result,
                        },
                    });
                    tokio::task::yield_now().await;
                }
            }
        });
        self.directory.register("llm", tx);
        self
    }

    /// Accept `llm` requests and never answer them
    pub fn with_silent_worker(mut self) -> Self {
        let (tx, mut rx) = mpsc::channel::<WorkerRequest>(8);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        self.directory.register("llm", tx);
        self
    }

    pub fn services(&self) -> Services {
        Services {
            storage: self.storage.clone(),
            bridge: Arc::clone(&self.bridge),
            directory: self.directory.clone(),
            settings: self.settings.clone(),
        }
    }

    pub fn context(&self, fsm_name: &str) -> ConversationContext {
        ConversationContext::new(
            &self.conversation_id,
            &self.platform_conversation_id,
            fsm_name,
            Arc::new(WsSerializer),
            self.transport.clone(),
            self.services(),
        )
    }

    /// Store a human text turn chained after the current last message
    pub async fn say(&self, text: &str) -> Message {
        let prev = self
            .storage
            .get_last_message(&self.conversation_id)
            .await
            .unwrap()
            .map(|m| m.id);
        let msg = NewMessage::new(&self.conversation_id, Sender::human("ws"), vec![Stack::text(text)])
            .after(prev);
        self.storage.add_message(&msg).await.unwrap()
    }

    pub async fn checkpoint(&self) -> Option<Checkpoint> {
        self.storage
            .get_checkpoint(&self.conversation_id)
            .await
            .unwrap()
    }
}
