//! Trait abstractions for runtime I/O
//!
//! These traits enable testing sessions and handlers with mock
//! implementations.

use crate::db::{Checkpoint, Conversation};
use crate::fsm::{FsmDefinition, State};
use crate::mml::{Message, NewMessage, ValidationError};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure appending a message. Chain violations stay distinguishable so the
/// caller can report them back to the sender.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    Backend(String),
}

/// Delivery failure reported by a transport
#[derive(Debug, Clone, Error)]
#[error("delivery failed: {0}")]
pub struct TransportError(pub String);

/// Storage for conversations and their message chains
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get_or_create_conversation(
        &self,
        platform_conversation_id: &str,
    ) -> Result<Conversation, String>;

    async fn find_conversation(
        &self,
        platform_conversation_id: &str,
    ) -> Result<Option<Conversation>, String>;

    /// Append a message, enforcing chain linkage
    async fn add_message(&self, msg: &NewMessage) -> Result<Message, StoreError>;

    /// Most recently created message of a conversation
    async fn get_last_message(&self, conv_id: &str) -> Result<Option<Message>, String>;

    /// All messages of a conversation, oldest first
    async fn get_messages(&self, conv_id: &str) -> Result<Vec<Message>, String>;

    async fn delete_conversation(&self, conv_id: &str) -> Result<(), String>;
}

/// Read access to stored FSM definitions
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn get_definition_by_name(&self, name: &str) -> Result<Option<FsmDefinition>, String>;
}

/// Cached machine state, keyed by conversation id
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Create-or-update the conversation's checkpoint
    async fn save_checkpoint(
        &self,
        conv_id: &str,
        fsm_name: &str,
        state: &State,
    ) -> Result<(), String>;

    async fn get_checkpoint(&self, conv_id: &str) -> Result<Option<Checkpoint>, String>;
}

/// Outbound delivery to the conversation's platform
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, payload: Value) -> Result<(), TransportError>;
}

/// Combined storage trait for convenience
pub trait Storage: MessageStore + DefinitionStore + CheckpointStore {}
impl<T: MessageStore + DefinitionStore + CheckpointStore> Storage for T {}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: MessageStore + ?Sized> MessageStore for Arc<T> {
    async fn get_or_create_conversation(
        &self,
        platform_conversation_id: &str,
    ) -> Result<Conversation, String> {
        (**self).get_or_create_conversation(platform_conversation_id).await
    }

    async fn find_conversation(
        &self,
        platform_conversation_id: &str,
    ) -> Result<Option<Conversation>, String> {
        (**self).find_conversation(platform_conversation_id).await
    }

    async fn add_message(&self, msg: &NewMessage) -> Result<Message, StoreError> {
        (**self).add_message(msg).await
    }

    async fn get_last_message(&self, conv_id: &str) -> Result<Option<Message>, String> {
        (**self).get_last_message(conv_id).await
    }

    async fn get_messages(&self, conv_id: &str) -> Result<Vec<Message>, String> {
        (**self).get_messages(conv_id).await
    }

    async fn delete_conversation(&self, conv_id: &str) -> Result<(), String> {
        (**self).delete_conversation(conv_id).await
    }
}

#[async_trait]
impl<T: DefinitionStore + ?Sized> DefinitionStore for Arc<T> {
    async fn get_definition_by_name(&self, name: &str) -> Result<Option<FsmDefinition>, String> {
        (**self).get_definition_by_name(name).await
    }
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn save_checkpoint(
        &self,
        conv_id: &str,
        fsm_name: &str,
        state: &State,
    ) -> Result<(), String> {
        (**self).save_checkpoint(conv_id, fsm_name, state).await
    }

    async fn get_checkpoint(&self, conv_id: &str) -> Result<Option<Checkpoint>, String> {
        (**self).get_checkpoint(conv_id).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, payload: Value) -> Result<(), TransportError> {
        (**self).send(payload).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

use super::OutboundEvent;
use crate::db::{Database, DbError};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Adapter to use Database as Storage
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn inner(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl MessageStore for DatabaseStorage {
    async fn get_or_create_conversation(
        &self,
        platform_conversation_id: &str,
    ) -> Result<Conversation, String> {
        self.db
            .get_or_create_conversation(platform_conversation_id)
            .map_err(|e| e.to_string())
    }

    async fn find_conversation(
        &self,
        platform_conversation_id: &str,
    ) -> Result<Option<Conversation>, String> {
        self.db
            .find_conversation(platform_conversation_id)
            .map_err(|e| e.to_string())
    }

    async fn add_message(&self, msg: &NewMessage) -> Result<Message, StoreError> {
        self.db.add_message(msg).map_err(|e| match e {
            DbError::Validation(v) => StoreError::Validation(v),
            other => StoreError::Backend(other.to_string()),
        })
    }

    async fn get_last_message(&self, conv_id: &str) -> Result<Option<Message>, String> {
        self.db.get_last_message(conv_id).map_err(|e| e.to_string())
    }

    async fn get_messages(&self, conv_id: &str) -> Result<Vec<Message>, String> {
        self.db.get_messages(conv_id).map_err(|e| e.to_string())
    }

    async fn delete_conversation(&self, conv_id: &str) -> Result<(), String> {
        self.db.delete_conversation(conv_id).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl DefinitionStore for DatabaseStorage {
    async fn get_definition_by_name(&self, name: &str) -> Result<Option<FsmDefinition>, String> {
        match self.db.get_fsm_definition_by_name(name) {
            Ok(def) => Ok(Some(def)),
            Err(DbError::DefinitionNotFound(_)) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[async_trait]
impl CheckpointStore for DatabaseStorage {
    async fn save_checkpoint(
        &self,
        conv_id: &str,
        fsm_name: &str,
        state: &State,
    ) -> Result<(), String> {
        self.db
            .save_checkpoint(conv_id, fsm_name, state)
            .map_err(|e| e.to_string())
    }

    async fn get_checkpoint(&self, conv_id: &str) -> Result<Option<Checkpoint>, String> {
        self.db.get_checkpoint(conv_id).map_err(|e| e.to_string())
    }
}

/// Transport that fans payloads out to the conversation's SSE subscribers.
/// A conversation nobody is listening to still counts as delivered.
#[derive(Clone)]
pub struct BroadcastTransport {
    tx: broadcast::Sender<OutboundEvent>,
}

impl BroadcastTransport {
    pub fn new(tx: broadcast::Sender<OutboundEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Transport for BroadcastTransport {
    async fn send(&self, payload: Value) -> Result<(), TransportError> {
        let _ = self.tx.send(OutboundEvent::Message { payload });
        Ok(())
    }
}
