//! Conversation runtime executor

use super::traits::Storage;
use super::{InboundOutcome, InboundRequest, OutboundEvent, RuntimeError};
use crate::fsm::Machine;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Task owning one conversation's machine. Inbound payloads are handled
/// strictly one after another.
pub struct ConversationRuntime<S: Storage + Clone + 'static> {
    machine: Machine,
    /// Whether the machine has entered its initial state
    started: bool,
    storage: S,
    event_rx: mpsc::Receiver<InboundRequest>,
    broadcast_tx: broadcast::Sender<OutboundEvent>,
    cancel: CancellationToken,
}

impl<S: Storage + Clone + 'static> ConversationRuntime<S> {
    pub fn new(
        machine: Machine,
        started: bool,
        storage: S,
        event_rx: mpsc::Receiver<InboundRequest>,
        broadcast_tx: broadcast::Sender<OutboundEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            machine,
            started,
            storage,
            event_rx,
            broadcast_tx,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let conv_id = self.machine.context().conversation_id().to_string();
        tracing::info!(
            conv_id = %conv_id,
            fsm = %self.machine.fsm_name(),
            state = %self.machine.current_state().name,
            started = self.started,
            "Starting conversation runtime"
        );

        loop {
            let request = tokio::select! {
                () = self.cancel.cancelled() => break,
                request = self.event_rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let InboundRequest { payload, reply } = request;
            // Cancellation drops the in-flight step along with its reply
            // sender; the caller sees the session as closed.
            let cancel = self.cancel.clone();
            let result = tokio::select! {
                () = cancel.cancelled() => break,
                result = self.process(payload) => result,
            };

            if let Err(e) = &result {
                tracing::warn!(conv_id = %conv_id, error = %e, "Inbound message failed");
                let _ = self.broadcast_tx.send(OutboundEvent::Error {
                    message: e.to_string(),
                });
            }
            let _ = reply.send(result);
        }

        tracing::info!(conv_id = %conv_id, "Conversation runtime stopped");
    }

    async fn process(&mut self, payload: Value) -> Result<InboundOutcome, RuntimeError> {
        let stored = match self.machine.context().receive(&payload).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::debug!(
                    conv_id = %self.machine.context().conversation_id(),
                    error = %e,
                    "Rejected inbound payload"
                );
                return Err(e.into());
            }
        };

        let before = self.machine.current_state().name.clone();
        let changed = if self.started {
            self.machine.advance(&self.storage).await?.is_some()
        } else {
            self.machine.start(&self.storage).await?;
            self.started = true;
            true
        };

        let state = self.machine.current_state().name.clone();
        if changed {
            tracing::debug!(
                conv_id = %stored.conversation_id,
                from = %before,
                to = %state,
                "State changed"
            );
            let _ = self.broadcast_tx.send(OutboundEvent::StateChange {
                state: state.clone(),
            });
        }

        Ok(InboundOutcome {
            conversation_id: stored.conversation_id,
            message_id: stored.id,
            state,
        })
    }
}
