//! Runtime for executing conversations
//!
//! Every conversation with live traffic owns one task holding its Machine.
//! Inbound payloads are queued to that task, so a conversation takes one
//! transition at a time while other conversations proceed independently.

mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::ConversationRuntime;
pub use traits::*;

use crate::context::{ContextError, ContextSettings, ConversationContext, Services};
use crate::db::Conversation;
use crate::fsm::{DefinitionError, HandlerRegistry, MachineError};
use crate::mml::{PlatformSerializer, ValidationError, WsSerializer};
use crate::rpc::{RpcBridge, RpcError, WorkerDirectory, WorkerRequest};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

/// Type alias for the production manager
pub type ProductionManager = RuntimeManager<DatabaseStorage>;

/// Events sent to outbound subscribers of a conversation
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    /// One platform payload produced by the conversation's serializer
    Message { payload: Value },
    StateChange { state: String },
    Error { message: String },
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("no serializer registered for platform '{0}'")]
    UnknownPlatform(String),
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("storage error: {0}")]
    Store(String),
    #[error("conversation runtime is gone")]
    SessionClosed,
}

impl From<ContextError> for RuntimeError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Validation(e) => RuntimeError::Validation(e),
            ContextError::Store(e) => RuntimeError::Store(e),
            ContextError::Rpc(e) => RuntimeError::Rpc(e),
        }
    }
}

/// Result of handling one inbound payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundOutcome {
    pub conversation_id: String,
    pub message_id: String,
    /// State the machine is in after the payload was processed
    pub state: String,
}

/// Work item queued to a conversation runtime
pub struct InboundRequest {
    pub payload: Value,
    pub reply: oneshot::Sender<Result<InboundOutcome, RuntimeError>>,
}

/// Handle to interact with a running conversation
#[derive(Clone)]
pub struct ConversationHandle {
    pub event_tx: mpsc::Sender<InboundRequest>,
    pub cancel: CancellationToken,
}

/// Manager for all conversation runtimes, keyed by platform conversation id
pub struct RuntimeManager<S: Storage + Clone + 'static> {
    storage: S,
    registry: Arc<HandlerRegistry>,
    bridge: Arc<RpcBridge>,
    directory: WorkerDirectory,
    settings: ContextSettings,
    serializers: HashMap<String, Arc<dyn PlatformSerializer>>,
    runtimes: RwLock<HashMap<String, ConversationHandle>>,
    outbound: RwLock<HashMap<String, broadcast::Sender<OutboundEvent>>>,
}

impl<S: Storage + Clone + 'static> RuntimeManager<S> {
    pub fn new(
        storage: S,
        registry: Arc<HandlerRegistry>,
        bridge: Arc<RpcBridge>,
        directory: WorkerDirectory,
        settings: ContextSettings,
    ) -> Self {
        let mut serializers: HashMap<String, Arc<dyn PlatformSerializer>> = HashMap::new();
        serializers.insert(WsSerializer.platform().to_string(), Arc::new(WsSerializer));
        Self {
            storage,
            registry,
            bridge,
            directory,
            settings,
            serializers,
            runtimes: RwLock::new(HashMap::new()),
            outbound: RwLock::new(HashMap::new()),
        }
    }

    /// Add an adapter for another platform, replacing any with the same name
    pub fn register_serializer(&mut self, serializer: Arc<dyn PlatformSerializer>) -> &mut Self {
        self.serializers
            .insert(serializer.platform().to_string(), serializer);
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn bridge(&self) -> &Arc<RpcBridge> {
        &self.bridge
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    /// Store an inbound platform payload and drive the conversation's machine.
    ///
    /// The conversation is created on first contact. Its machine is resumed
    /// from the cached checkpoint when one exists; otherwise it is built from
    /// the definition named `fsm_name` and started by this payload.
    pub async fn handle_inbound(
        &self,
        platform: &str,
        fsm_name: &str,
        platform_conversation_id: &str,
        payload: Value,
    ) -> Result<InboundOutcome, RuntimeError> {
        let serializer = self
            .serializers
            .get(platform)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownPlatform(platform.to_string()))?;

        let conv = self
            .storage
            .get_or_create_conversation(platform_conversation_id)
            .await
            .map_err(RuntimeError::Store)?;

        let handle = self.get_or_create(&conv, fsm_name, serializer).await?;

        let (reply, rx) = oneshot::channel();
        handle
            .event_tx
            .send(InboundRequest { payload, reply })
            .await
            .map_err(|_| RuntimeError::SessionClosed)?;
        rx.await.map_err(|_| RuntimeError::SessionClosed)?
    }

    async fn get_or_create(
        &self,
        conv: &Conversation,
        fsm_name: &str,
        serializer: Arc<dyn PlatformSerializer>,
    ) -> Result<ConversationHandle, RuntimeError> {
        let key = &conv.platform_conversation_id;
        {
            let runtimes = self.runtimes.read().await;
            if let Some(handle) = runtimes.get(key) {
                if !handle.event_tx.is_closed() {
                    return Ok(handle.clone());
                }
            }
        }

        // Held across construction so a conversation never gets two machines
        let mut runtimes = self.runtimes.write().await;
        if let Some(handle) = runtimes.get(key) {
            if !handle.event_tx.is_closed() {
                return Ok(handle.clone());
            }
        }

        let checkpoint = self
            .storage
            .get_checkpoint(&conv.id)
            .await
            .map_err(RuntimeError::Store)?;
        let name = checkpoint
            .as_ref()
            .map_or(fsm_name, |c| c.fsm_name.as_str())
            .to_string();
        if name != fsm_name {
            tracing::debug!(
                conv_id = %conv.id,
                fsm = %name,
                requested = %fsm_name,
                "Resuming with the checkpointed FSM"
            );
        }

        let definition = self
            .storage
            .get_definition_by_name(&name)
            .await
            .map_err(RuntimeError::Store)?
            .ok_or_else(|| DefinitionError::NotFound(name.clone()))?;

        let broadcast_tx = self.outbound_sender(key).await;
        let services = Services {
            storage: Arc::new(self.storage.clone()),
            bridge: Arc::clone(&self.bridge),
            directory: self.directory.clone(),
            settings: self.settings.clone(),
        };
        let ctx = ConversationContext::new(
            &conv.id,
            &conv.platform_conversation_id,
            &name,
            serializer,
            Arc::new(BroadcastTransport::new(broadcast_tx.clone())),
            services,
        );
        let machine = definition.build_machine(
            ctx,
            &self.registry,
            checkpoint.as_ref().map(|c| &c.state),
        )?;

        let (event_tx, event_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let runtime = ConversationRuntime::new(
            machine,
            checkpoint.is_some(),
            self.storage.clone(),
            event_rx,
            broadcast_tx,
            cancel.clone(),
        );

        let conv_id = conv.id.clone();
        tokio::spawn(async move {
            runtime.run().await;
            tracing::info!(conv_id = %conv_id, "Conversation runtime finished");
        });

        let handle = ConversationHandle { event_tx, cancel };
        runtimes.insert(key.clone(), handle.clone());
        Ok(handle)
    }

    async fn outbound_sender(&self, platform_conversation_id: &str) -> broadcast::Sender<OutboundEvent> {
        if let Some(tx) = self.outbound.read().await.get(platform_conversation_id) {
            return tx.clone();
        }
        self.outbound
            .write()
            .await
            .entry(platform_conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(128).0)
            .clone()
    }

    /// Subscribe to a conversation's outbound events. Works before the
    /// conversation has received anything.
    pub async fn subscribe(&self, platform_conversation_id: &str) -> broadcast::Receiver<OutboundEvent> {
        self.outbound_sender(platform_conversation_id)
            .await
            .subscribe()
    }

    /// Tear down the conversation's runtime. Its machine and context are
    /// dropped, which closes every RPC channel still open; replies arriving
    /// later are discarded. Returns whether a runtime was running.
    pub async fn disconnect(&self, platform_conversation_id: &str) -> bool {
        let handle = self.runtimes.write().await.remove(platform_conversation_id);
        match handle {
            Some(handle) => {
                handle.cancel.cancel();
                tracing::info!(platform_conversation_id, "Disconnected conversation");
                true
            }
            None => false,
        }
    }

    /// Disconnect and delete a conversation with everything it owns
    pub async fn delete_conversation(&self, platform_conversation_id: &str) -> Result<(), RuntimeError> {
        let conv = self
            .storage
            .find_conversation(platform_conversation_id)
            .await
            .map_err(RuntimeError::Store)?
            .ok_or_else(|| RuntimeError::ConversationNotFound(platform_conversation_id.to_string()))?;

        self.disconnect(platform_conversation_id).await;
        self.outbound.write().await.remove(platform_conversation_id);
        self.storage
            .delete_conversation(&conv.id)
            .await
            .map_err(RuntimeError::Store)?;
        tracing::info!(conv_id = %conv.id, "Deleted conversation");
        Ok(())
    }

    /// Ask the worker serving `parser` to ingest a data source. Nothing
    /// waits for the outcome.
    pub async fn request_parse(&self, parser: &str, data_source_id: &str) -> Result<(), RuntimeError> {
        self.directory
            .send(WorkerRequest::SendDataSourceToParse {
                parser: parser.to_string(),
                data_source_id: data_source_id.to_string(),
            })
            .await?;
        tracing::info!(parser, data_source_id, "Requested data source parse");
        Ok(())
    }

    #[cfg(test)]
    pub async fn active_conversations(&self) -> usize {
        self.runtimes
            .read()
            .await
            .values()
            .filter(|h| !h.event_tx.is_closed())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{InMemoryStorage, RecordingTransport};
    use super::*;
    use crate::fsm::{register_builtins, FsmDefinition, State, Transition};
    use crate::mml::{Message, TextSerializer};
    use crate::rpc::{LlmResponseMessage, PartialResult, WorkerReply};
    use serde_json::json;
    use std::time::Duration;

    fn bye_fsm() -> FsmDefinition {
        FsmDefinition::new(
            "bye",
            vec![
                State::new("start").initial().with_events(["greet"]),
                State::new("end").with_events(["goodbye"]),
            ],
            vec![Transition::new("start", "end").when("user_said_bye")],
        )
        .with_funcs(["greet", "goodbye", "user_said_bye"])
    }

    fn llm_fsm() -> FsmDefinition {
        FsmDefinition::new(
            "qa",
            vec![
                State::new("idle").initial(),
                State::new("answering").with_events(["answer_with_llm"]),
            ],
            vec![
                Transition::new("idle", "answering").when("always"),
                Transition::new("answering", "answering").when("always"),
            ],
        )
        .with_funcs(["always", "answer_with_llm"])
    }

    fn manager(storage: Arc<InMemoryStorage>) -> RuntimeManager<Arc<InMemoryStorage>> {
        manager_with(storage, WorkerDirectory::new(), Arc::new(RpcBridge::new()))
    }

    fn manager_with(
        storage: Arc<InMemoryStorage>,
        directory: WorkerDirectory,
        bridge: Arc<RpcBridge>,
    ) -> RuntimeManager<Arc<InMemoryStorage>> {
        let mut registry = HandlerRegistry::new();
        register_builtins(&mut registry);
        RuntimeManager::new(
            storage,
            Arc::new(registry),
            bridge,
            directory,
            ContextSettings {
                default_model: Some("m".to_string()),
            },
        )
    }

    fn text(t: &str) -> Value {
        json!({ "stacks": [{ "type": "text", "payload": t }] })
    }

    fn drain(rx: &mut broadcast::Receiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn bot_texts(events: &[OutboundEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                OutboundEvent::Message { payload } => {
                    serde_json::from_value::<Message>(payload.clone()).ok()
                }
                _ => None,
            })
            .map(|m| m.text())
            .collect()
    }

    #[tokio::test]
    async fn test_first_inbound_starts_then_advances() {
        let storage = Arc::new(InMemoryStorage::new().with_definition(bye_fsm()));
        let manager = manager(storage.clone());
        let mut rx = manager.subscribe("p-1").await;

        let first = manager
            .handle_inbound("ws", "bye", "p-1", text("hello"))
            .await
            .unwrap();
        assert_eq!(first.state, "start");

        let second = manager
            .handle_inbound("ws", "bye", "p-1", text("ok bye"))
            .await
            .unwrap();
        assert_eq!(second.state, "end");
        assert_eq!(first.conversation_id, second.conversation_id);

        let events = drain(&mut rx);
        assert_eq!(
            bot_texts(&events),
            vec!["Hello! Say bye when you are done.", "Goodbye!"]
        );
        let states: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                OutboundEvent::StateChange { state } => Some(state.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec!["start", "end"]);

        // Two inbound and two bot turns, chained in order
        let messages = storage.get_messages(&first.conversation_id).await.unwrap();
        assert_eq!(messages.len(), 4);
        for pair in messages.windows(2) {
            assert_eq!(pair[1].prev.as_deref(), Some(pair[0].id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_hello_keeps_machine_in_start() {
        let storage = Arc::new(InMemoryStorage::new().with_definition(bye_fsm()));
        let manager = manager(storage);

        manager.handle_inbound("ws", "bye", "p-1", text("hi")).await.unwrap();
        let outcome = manager
            .handle_inbound("ws", "bye", "p-1", text("hello again"))
            .await
            .unwrap();
        assert_eq!(outcome.state, "start");
    }

    #[tokio::test]
    async fn test_resumes_from_checkpoint_after_restart() {
        let storage = Arc::new(InMemoryStorage::new().with_definition(bye_fsm()));

        let before = manager(storage.clone());
        before.handle_inbound("ws", "bye", "p-1", text("hi")).await.unwrap();
        drop(before);

        // A fresh manager has no live runtimes; the checkpoint decides
        let after = manager(storage.clone());
        let mut rx = after.subscribe("p-1").await;
        let outcome = after
            .handle_inbound("ws", "bye", "p-1", text("bye"))
            .await
            .unwrap();
        assert_eq!(outcome.state, "end");
        // Not restarted: no second greeting
        assert_eq!(bot_texts(&drain(&mut rx)), vec!["Goodbye!"]);
        assert_eq!(storage.checkpoint_count(), 1);
    }

    #[tokio::test]
    async fn test_validation_error_leaves_state_unchanged() {
        let storage = Arc::new(InMemoryStorage::new().with_definition(bye_fsm()));
        let manager = manager(storage.clone());
        let mut rx = manager.subscribe("p-1").await;

        let first = manager.handle_inbound("ws", "bye", "p-1", text("hi")).await.unwrap();
        drain(&mut rx);

        let err = manager
            .handle_inbound("ws", "bye", "p-1", json!({ "stacks": [] }))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(ValidationError::EmptyStacks)));

        let events = drain(&mut rx);
        assert!(matches!(events.as_slice(), [OutboundEvent::Error { .. }]));
        let checkpoint = storage.get_checkpoint(&first.conversation_id).await.unwrap().unwrap();
        assert_eq!(checkpoint.state.name, "start");
        assert_eq!(storage.message_count(&first.conversation_id), 2);
    }

    #[tokio::test]
    async fn test_unknown_definition_and_platform() {
        let storage = Arc::new(InMemoryStorage::new());
        let manager = manager(storage);

        let err = manager
            .handle_inbound("ws", "nope", "p-1", text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Definition(DefinitionError::NotFound(_))));

        let err = manager
            .handle_inbound("carrier-pigeon", "nope", "p-1", text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownPlatform(_)));
    }

    #[tokio::test]
    async fn test_malformed_definition_is_fatal_and_spawns_nothing() {
        let broken = [
            FsmDefinition::new("no-initial", vec![State::new("a")], vec![]),
            FsmDefinition::new(
                "dangling",
                vec![State::new("a").initial()],
                vec![Transition::new("a", "nowhere")],
            ),
            // `greet` is registered but not listed in funcs
            FsmDefinition::new("unbound", vec![State::new("a").initial().with_events(["greet"])], vec![]),
        ];
        let storage = Arc::new(InMemoryStorage::new());
        for def in &broken {
            storage.add_definition(def.clone());
        }
        let manager = manager(storage);

        for (i, def) in broken.iter().enumerate() {
            let err = manager
                .handle_inbound("ws", &def.name, &format!("p-{i}"), text("hi"))
                .await
                .unwrap_err();
            assert!(matches!(err, RuntimeError::Definition(_)), "{}: {err}", def.name);
        }
        assert_eq!(manager.active_conversations().await, 0);
    }

    #[tokio::test]
    async fn test_failed_entry_event_keeps_checkpointed_state() {
        // No worker serves `llm`, so entering `answering` fails every time
        let storage = Arc::new(InMemoryStorage::new().with_definition(llm_fsm()));
        let live = manager(storage.clone());

        let first = live.handle_inbound("ws", "qa", "p-1", text("hi")).await.unwrap();
        assert_eq!(first.state, "idle");

        for question in ["q1", "q2"] {
            let err = live
                .handle_inbound("ws", "qa", "p-1", text(question))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                RuntimeError::Machine(MachineError::Handler { name, .. }) if name == "answer_with_llm"
            ));
            let checkpoint = storage.get_checkpoint(&first.conversation_id).await.unwrap().unwrap();
            assert_eq!(checkpoint.state.name, "idle");
        }
        assert_eq!(live.active_conversations().await, 1);

        // A restarted manager resumes from the same state and fails the same way
        drop(live);
        let restarted = manager(storage.clone());
        let err = restarted
            .handle_inbound("ws", "qa", "p-1", text("q3"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Machine(MachineError::Handler { .. })));
        let checkpoint = storage.get_checkpoint(&first.conversation_id).await.unwrap().unwrap();
        assert_eq!(checkpoint.state.name, "idle");
    }

    #[tokio::test]
    async fn test_waiting_conversation_does_not_block_others() {
        let storage = Arc::new(
            InMemoryStorage::new()
                .with_definition(llm_fsm())
                .with_definition(bye_fsm()),
        );
        let (tx, mut worker_rx) = mpsc::channel::<WorkerRequest>(4);
        let mut directory = WorkerDirectory::new();
        directory.register("llm", tx);
        let manager = Arc::new(manager_with(storage, directory, Arc::new(RpcBridge::new())));

        manager.handle_inbound("ws", "qa", "a", text("hi")).await.unwrap();
        let pending = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.handle_inbound("ws", "qa", "a", text("q")).await })
        };
        // Conversation `a` is now suspended on a stream nobody fills
        assert!(worker_rx.recv().await.is_some());

        let other = async {
            manager.handle_inbound("ws", "bye", "b", text("hello")).await?;
            manager.handle_inbound("ws", "bye", "b", text("bye")).await
        };
        let outcome = tokio::time::timeout(Duration::from_secs(5), other)
            .await
            .expect("conversation b was blocked")
            .unwrap();
        assert_eq!(outcome.state, "end");
        assert!(!pending.is_finished());

        assert!(manager.disconnect("a").await);
        assert!(matches!(
            pending.await.unwrap().unwrap_err(),
            RuntimeError::SessionClosed
        ));
    }

    #[tokio::test]
    async fn test_parse_request_reaches_parser_worker() {
        let (tx, mut rx) = mpsc::channel::<WorkerRequest>(1);
        let mut directory = WorkerDirectory::new();
        directory.register("parser.pdf", tx);
        let manager = manager_with(Arc::new(InMemoryStorage::new()), directory, Arc::new(RpcBridge::new()));

        manager.request_parse("pdf", "ds-7").await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(WorkerRequest::SendDataSourceToParse { parser, data_source_id })
                if parser == "pdf" && data_source_id == "ds-7"
        ));
        assert!(matches!(
            manager.request_parse("csv", "ds-7").await.unwrap_err(),
            RuntimeError::Rpc(RpcError::WorkerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_registered_serializer_fans_out_stacks() {
        let storage = Arc::new(InMemoryStorage::new().with_definition(bye_fsm()));
        let mut manager = manager(storage);
        manager.register_serializer(Arc::new(TextSerializer::new("sms")));
        let mut rx = manager.subscribe("p-1").await;

        manager
            .handle_inbound("sms", "bye", "p-1", json!({ "text": "hello" }))
            .await
            .unwrap();

        let payloads: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                OutboundEvent::Message { payload } => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["text"], "Hello! Say bye when you are done.");
    }

    #[tokio::test]
    async fn test_streamed_answer_reaches_subscribers_in_order() {
        let storage = Arc::new(InMemoryStorage::new().with_definition(llm_fsm()));
        let bridge = Arc::new(RpcBridge::new());
        let (tx, mut worker_rx) = mpsc::channel::<WorkerRequest>(4);
        let mut directory = WorkerDirectory::new();
        directory.register("llm", tx);

        let worker_bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            while let Some(WorkerRequest::LlmRequest {
                bot_channel_name, ..
            }) = worker_rx.recv().await
            {
                for result in [
                    PartialResult::chunk("one "),
                    PartialResult::chunk("two "),
                    PartialResult::last("three"),
                ] {
                    worker_bridge
                        .dispatch(WorkerReply::SendLlmResponse {
                            message: LlmResponseMessage {
                                bot_channel_name: Some(bot_channel_name.clone()),
                                result,
                            },
                        })
                        .unwrap();
                }
            }
        });

        let manager = manager_with(storage, directory, Arc::clone(&bridge));
        let mut rx = manager.subscribe("p-1").await;
        manager.handle_inbound("ws", "qa", "p-1", text("hi")).await.unwrap();
        let outcome = manager
            .handle_inbound("ws", "qa", "p-1", text("what is rust?"))
            .await
            .unwrap();
        assert_eq!(outcome.state, "answering");

        let responses: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                OutboundEvent::Message { payload } => {
                    serde_json::from_value::<Message>(payload).ok()
                }
                _ => None,
            })
            .map(|m| m.stacks[0].payload["model_response"].clone())
            .collect();
        assert_eq!(responses, vec![json!("one "), json!("two "), json!("three")]);
        assert_eq!(bridge.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_forgets_pending_channels() {
        let storage = Arc::new(InMemoryStorage::new().with_definition(llm_fsm()));
        let bridge = Arc::new(RpcBridge::new());
        let (tx, mut worker_rx) = mpsc::channel::<WorkerRequest>(4);
        let mut directory = WorkerDirectory::new();
        directory.register("llm", tx);
        let manager = Arc::new(manager_with(storage, directory, Arc::clone(&bridge)));

        manager.handle_inbound("ws", "qa", "p-1", text("hi")).await.unwrap();

        // The second inbound waits on a worker that never answers
        let pending = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.handle_inbound("ws", "qa", "p-1", text("q")).await })
        };
        let Some(WorkerRequest::LlmRequest {
            bot_channel_name, ..
        }) = worker_rx.recv().await
        else {
            panic!("expected an LLM request");
        };
        assert_eq!(bridge.open_channels(), 1);

        assert!(manager.disconnect("p-1").await);
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, RuntimeError::SessionClosed));
        assert_eq!(bridge.open_channels(), 0);

        // A late reply for the torn-down channel is dropped, not an error
        let late = bridge.dispatch(WorkerReply::SendLlmResponse {
            message: LlmResponseMessage {
                bot_channel_name: Some(bot_channel_name),
                result: PartialResult::last("late"),
            },
        });
        assert!(matches!(late, Err(RpcError::ChannelNotFound(_))));
        assert!(!manager.disconnect("p-1").await);
    }

    #[tokio::test]
    async fn test_delete_conversation() {
        let storage = Arc::new(InMemoryStorage::new().with_definition(bye_fsm()));
        let manager = manager(storage.clone());
        let outcome = manager.handle_inbound("ws", "bye", "p-1", text("hi")).await.unwrap();

        manager.delete_conversation("p-1").await.unwrap();
        assert_eq!(storage.message_count(&outcome.conversation_id), 0);
        assert_eq!(storage.checkpoint_count(), 0);
        assert_eq!(manager.active_conversations().await, 0);
        assert!(matches!(
            manager.delete_conversation("p-1").await.unwrap_err(),
            RuntimeError::ConversationNotFound(_)
        ));

        // Starts over as a new conversation
        let again = manager.handle_inbound("ws", "bye", "p-1", text("hi")).await.unwrap();
        assert_ne!(again.conversation_id, outcome.conversation_id);
        assert_eq!(again.state, "start");
    }

    #[tokio::test]
    async fn test_broadcast_transport_without_subscribers_is_ok() {
        let (tx, _) = broadcast::channel(4);
        let transport = BroadcastTransport::new(tx);
        transport.send(json!({ "x": 1 })).await.unwrap();

        let recording = RecordingTransport::new();
        recording.send(json!({ "x": 1 })).await.unwrap();
        assert_eq!(recording.payloads().len(), 1);
    }
}
