//! Per-conversation session object
//!
//! The context is what guards and actions see. It reads the conversation's
//! MML chain, emits bot turns through the platform serializer and transport,
//! and owns the result stream of every RPC request it has in flight.

use crate::fsm::HandlerError;
use crate::mml::{Message, NewMessage, PlatformSerializer, Sender, Stack, ValidationError};
use crate::rpc::{
    Batch, ContextSnapshot, ResultStream, RpcBridge, RpcError, WorkerDirectory, WorkerRequest,
};
use crate::runtime::{MessageStore, StoreError, Transport};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("storage error: {0}")]
    Store(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl From<StoreError> for ContextError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(e) => ContextError::Validation(e),
            StoreError::Backend(e) => ContextError::Store(e),
        }
    }
}

impl From<ContextError> for HandlerError {
    fn from(err: ContextError) -> Self {
        HandlerError(err.to_string())
    }
}

/// Knobs handlers may consult
#[derive(Debug, Clone, Default)]
pub struct ContextSettings {
    pub default_model: Option<String>,
}

/// Process-wide collaborators every context is built from
#[derive(Clone)]
pub struct Services {
    pub storage: Arc<dyn MessageStore>,
    pub bridge: Arc<RpcBridge>,
    pub directory: WorkerDirectory,
    pub settings: ContextSettings,
}

pub struct ConversationContext {
    conversation_id: String,
    platform_conversation_id: String,
    fsm_name: String,
    channel_name: String,
    storage: Arc<dyn MessageStore>,
    serializer: Arc<dyn PlatformSerializer>,
    transport: Arc<dyn Transport>,
    bridge: Arc<RpcBridge>,
    directory: WorkerDirectory,
    settings: ContextSettings,
    streams: HashMap<String, ResultStream>,
}

impl ConversationContext {
    pub fn new(
        conversation_id: impl Into<String>,
        platform_conversation_id: impl Into<String>,
        fsm_name: impl Into<String>,
        serializer: Arc<dyn PlatformSerializer>,
        transport: Arc<dyn Transport>,
        services: Services,
    ) -> Self {
        let conversation_id = conversation_id.into();
        Self {
            channel_name: format!("conv.{conversation_id}"),
            conversation_id,
            platform_conversation_id: platform_conversation_id.into(),
            fsm_name: fsm_name.into(),
            storage: services.storage,
            serializer,
            transport,
            bridge: services.bridge,
            directory: services.directory,
            settings: services.settings,
            streams: HashMap::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn fsm_name(&self) -> &str {
        &self.fsm_name
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    /// Most recently created turn of the conversation
    pub async fn get_last_mml(&self) -> Result<Option<Message>, ContextError> {
        self.storage
            .get_last_message(&self.conversation_id)
            .await
            .map_err(ContextError::Store)
    }

    /// Most recent turn sent by a human
    pub async fn last_human_mml(&self) -> Result<Option<Message>, ContextError> {
        let messages = self
            .storage
            .get_messages(&self.conversation_id)
            .await
            .map_err(ContextError::Store)?;
        Ok(messages.into_iter().rev().find(Message::is_from_human))
    }

    /// Validate and store an inbound platform payload, chained after the
    /// current last turn
    pub async fn receive(&self, payload: &Value) -> Result<Message, ContextError> {
        let prev = self.get_last_mml().await?.map(|m| m.id);
        let mml = self
            .serializer
            .to_mml(payload, &self.conversation_id, prev)?;
        let stored = self.storage.add_message(&mml).await?;
        tracing::debug!(
            conv_id = %self.conversation_id,
            message_id = %stored.id,
            "Stored inbound message"
        );
        Ok(stored)
    }

    /// Store a bot turn and deliver it. Every payload the serializer yields
    /// is sent exactly once; delivery failures are logged and skipped.
    pub async fn send_response(&self, stacks: Vec<Stack>) -> Result<Message, ContextError> {
        let prev = self.get_last_mml().await?.map(|m| m.id);
        let mml = NewMessage::new(&self.conversation_id, Sender::bot(), stacks).after(prev);
        mml.validate()?;
        let stored = self.storage.add_message(&mml).await?;

        for payload in self.serializer.to_platform(&stored) {
            if let Err(e) = self.transport.send(payload).await {
                tracing::warn!(
                    conv_id = %self.conversation_id,
                    message_id = %stored.id,
                    error = %e,
                    "Failed to deliver payload"
                );
            }
        }
        Ok(stored)
    }

    /// Correlation payload for outbound RPC requests. Reads only.
    pub async fn serialize(&self) -> Result<ContextSnapshot, ContextError> {
        let last_mml = self.get_last_mml().await?.map(|m| m.stacks);
        Ok(ContextSnapshot {
            conversation_id: self.conversation_id.clone(),
            platform_conversation_id: self.platform_conversation_id.clone(),
            fsm_name: self.fsm_name.clone(),
            last_mml,
            channel_name: self.channel_name.clone(),
        })
    }

    /// Issue an LLM request and open the channel its results will arrive on.
    /// Returns the channel name to pass to [`Self::next_batch`].
    pub async fn send_llm_request(
        &mut self,
        model_id: &str,
        input: &str,
    ) -> Result<String, ContextError> {
        let channel = format!("{}.llm.{}", self.channel_name, Uuid::new_v4());
        let context = self.serialize().await?;

        let stream = self.bridge.register(&channel);
        self.streams.insert(channel.clone(), stream);

        let request = WorkerRequest::LlmRequest {
            bot_channel_name: channel.clone(),
            model_id: model_id.to_string(),
            input: input.to_string(),
            context,
        };
        if let Err(e) = self.directory.send(request).await {
            self.close_channel(&channel);
            return Err(e.into());
        }

        tracing::info!(
            conv_id = %self.conversation_id,
            channel = %channel,
            model = %model_id,
            "Issued LLM request"
        );
        Ok(channel)
    }

    /// Wait for the next batch on `channel`. The channel is closed once its
    /// final result has been drained.
    pub async fn next_batch(&mut self, channel: &str) -> Result<Batch, ContextError> {
        let stream = self
            .streams
            .get_mut(channel)
            .ok_or_else(|| RpcError::ChannelNotFound(channel.to_string()))?;
        let batch = stream.next_batch().await;
        if !batch.more {
            self.close_channel(channel);
        }
        Ok(batch)
    }

    /// Stop listening on `channel`. Later replies for it are dropped.
    pub fn close_channel(&mut self, channel: &str) {
        self.streams.remove(channel);
        self.bridge.forget(channel);
    }

    #[cfg(test)]
    pub fn open_channels(&self) -> Vec<&str> {
        self.streams.keys().map(String::as_str).collect()
    }
}

impl Drop for ConversationContext {
    fn drop(&mut self) {
        for channel in self.streams.keys() {
            self.bridge.forget(channel);
        }
    }
}
