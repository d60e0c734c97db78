//! Routes worker replies to the streams waiting on them

use super::stream::{self, ResultStream, StreamSender};
use super::{RpcError, WorkerReply};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Table of open response channels, shared by every conversation in the
/// process. Each channel has exactly one consumer, the context that opened it.
#[derive(Debug, Default)]
pub struct RpcBridge {
    routes: Mutex<HashMap<String, StreamSender>>,
}

impl RpcBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel and hand back its consumer end. Re-registering a name
    /// replaces the previous route; the old consumer never sees more results.
    pub fn register(&self, channel: impl Into<String>) -> ResultStream {
        let (tx, rx) = stream::channel();
        let channel = channel.into();
        tracing::debug!(channel = %channel, "Registered RPC channel");
        self.routes().insert(channel, tx);
        rx
    }

    pub fn forget(&self, channel: &str) {
        if self.routes().remove(channel).is_some() {
            tracing::debug!(channel = %channel, "Forgot RPC channel");
        }
    }

    #[cfg(test)]
    pub fn is_open(&self, channel: &str) -> bool {
        self.routes().contains_key(channel)
    }

    #[cfg(test)]
    pub fn open_channels(&self) -> usize {
        self.routes().len()
    }

    /// Deliver a worker reply. Returns how many results were buffered.
    /// Replies for unknown channels are dropped with a warning.
    pub fn dispatch(&self, reply: WorkerReply) -> Result<usize, RpcError> {
        let Some(channel) = reply.channel().map(str::to_string) else {
            tracing::warn!("Dropping RPC reply without a channel name");
            return Err(RpcError::ChannelNotFound(String::new()));
        };

        let mut routes = self.routes();
        let Some(sender) = routes.get(&channel) else {
            tracing::warn!(channel = %channel, "Dropping RPC reply for unknown channel");
            return Err(RpcError::ChannelNotFound(channel));
        };

        let results = reply.into_results();
        let count = results.len();
        let finished = results.last().is_some_and(|r| r.is_final);

        if !sender.push(results) {
            // Consumer went away; the reply has nowhere to go.
            tracing::debug!(channel = %channel, "RPC consumer gone, dropping channel");
            routes.remove(&channel);
            return Ok(0);
        }
        if finished {
            routes.remove(&channel);
        }
        tracing::debug!(channel = %channel, count, finished, "Dispatched RPC results");
        Ok(count)
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamSender>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
