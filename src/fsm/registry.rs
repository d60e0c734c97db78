//! Handler registry
//!
//! Guards and actions are compiled into the binary and registered by name at
//! startup. Stored definitions refer to them symbolically; nothing from the
//! store is ever executed as code.

use crate::context::ConversationContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by a guard or action body
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// Named async predicate deciding transition eligibility
#[async_trait]
pub trait Guard: Send + Sync {
    async fn check(&self, ctx: &mut ConversationContext) -> Result<bool, HandlerError>;
}

/// Named async side effect run on state entry
#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, ctx: &mut ConversationContext) -> Result<(), HandlerError>;
}

#[derive(Clone)]
pub enum Handler {
    Guard(Arc<dyn Guard>),
    Action(Arc<dyn Action>),
}

impl Handler {
    pub fn kind(&self) -> &'static str {
        match self {
            Handler::Guard(_) => "guard",
            Handler::Action(_) => "action",
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler::{}", self.kind())
    }
}

/// Startup-time table from symbolic name to handler
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a guard. A later registration under the same name replaces
    /// the earlier one.
    pub fn register_guard(&mut self, name: impl Into<String>, guard: impl Guard + 'static) -> &mut Self {
        self.handlers
            .insert(name.into(), Handler::Guard(Arc::new(guard)));
        self
    }

    pub fn register_action(
        &mut self,
        name: impl Into<String>,
        action: impl Action + 'static,
    ) -> &mut Self {
        self.handlers
            .insert(name.into(), Handler::Action(Arc::new(action)));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    /// Registered names, sorted
    #[cfg(test)]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
