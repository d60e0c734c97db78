//! Asynchronous request/response protocol with compute workers
//!
//! Requests go out through the [`WorkerDirectory`], addressed by task name.
//! Replies come back as [`WorkerReply`] envelopes and are routed by the
//! [`RpcBridge`] into the [`ResultStream`] of the context that asked.

mod bridge;
mod stream;
mod types;

pub use bridge::RpcBridge;
pub use stream::{Batch, ResultStream};
pub use types::*;

use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("no RPC channel named '{0}'")]
    ChannelNotFound(String),
    #[error("no worker serves '{0}'")]
    WorkerUnavailable(String),
    /// The worker's request queue has shut down
    #[error("RPC stream closed")]
    StreamClosed,
}

/// Channel-name lookup from task name to the worker serving it
#[derive(Debug, Clone, Default)]
pub struct WorkerDirectory {
    workers: HashMap<String, mpsc::Sender<WorkerRequest>>,
}

impl WorkerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task: impl Into<String>, tx: mpsc::Sender<WorkerRequest>) -> &mut Self {
        self.workers.insert(task.into(), tx);
        self
    }

    /// Send a request to the worker registered for its task name
    pub async fn send(&self, request: WorkerRequest) -> Result<(), RpcError> {
        let task = request.task_name();
        let tx = self
            .workers
            .get(&task)
            .ok_or_else(|| RpcError::WorkerUnavailable(task.clone()))?;
        tx.send(request).await.map_err(|_| RpcError::StreamClosed)?;
        tracing::debug!(task = %task, "Sent worker request");
        Ok(())
    }
}
