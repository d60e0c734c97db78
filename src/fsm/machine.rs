//! Machine: one conversation's live FSM
//!
//! A machine is always in some state. `start` enters the initial state,
//! `advance` takes at most one transition. Both persist a checkpoint.

use super::definition::{CompiledFsm, DefinitionError, State, Transition};
use super::registry::HandlerError;
use crate::context::ConversationContext;
use crate::runtime::CheckpointStore;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("handler '{name}' failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: HandlerError,
    },
    #[error("failed to save checkpoint: {0}")]
    Checkpoint(String),
}

pub struct Machine {
    fsm: Arc<CompiledFsm>,
    current_state: State,
    ctx: ConversationContext,
}

impl Machine {
    pub(crate) fn new(fsm: Arc<CompiledFsm>, ctx: ConversationContext, current_state: State) -> Self {
        Self {
            fsm,
            current_state,
            ctx,
        }
    }

    pub fn fsm_name(&self) -> &str {
        self.fsm.name()
    }

    pub fn current_state(&self) -> &State {
        &self.current_state
    }

    pub fn context(&self) -> &ConversationContext {
        &self.ctx
    }

    /// Enter the initial state, run its events and persist the checkpoint
    pub async fn start(&mut self, store: &dyn CheckpointStore) -> Result<(), MachineError> {
        let initial = self.fsm.initial_state().clone();
        tracing::info!(
            conv_id = %self.ctx.conversation_id(),
            fsm = %self.fsm.name(),
            state = %initial.name,
            "Starting machine"
        );
        self.run_events(&initial).await?;
        self.current_state = initial;
        self.save_checkpoint(store).await
    }

    /// Take the first qualifying outgoing transition, if any. Returns the
    /// name of the state entered, or `None` when the machine stayed put.
    /// The checkpoint is persisted either way. When an entry event of the
    /// destination fails the machine stays in its source state, matching the
    /// last checkpoint.
    pub async fn advance(
        &mut self,
        store: &dyn CheckpointStore,
    ) -> Result<Option<String>, MachineError> {
        let fsm = Arc::clone(&self.fsm);
        let source = self.current_state.name.clone();
        let mut entered = None;

        for transition in fsm.outgoing(&source) {
            if !self.qualifies(transition).await? {
                continue;
            }
            let dest = fsm
                .state(&transition.dest)
                .cloned()
                .ok_or_else(|| DefinitionError::UnknownState {
                    fsm: fsm.name().to_string(),
                    state: transition.dest.clone(),
                })?;
            tracing::info!(
                conv_id = %self.ctx.conversation_id(),
                from = %transition.source,
                to = %dest.name,
                "Transition taken"
            );
            self.run_events(&dest).await?;
            entered = Some(dest.name.clone());
            self.current_state = dest;
            break;
        }

        if entered.is_none() {
            tracing::debug!(
                conv_id = %self.ctx.conversation_id(),
                state = %self.current_state.name,
                "No transition qualified"
            );
        }

        self.save_checkpoint(store).await?;
        Ok(entered)
    }

    /// Every condition holds and no `unless` holds. Both lists stop at the
    /// first guard that decides the outcome.
    async fn qualifies(&mut self, transition: &Transition) -> Result<bool, MachineError> {
        for name in &transition.conditions {
            if !self.check(name).await? {
                return Ok(false);
            }
        }
        for name in &transition.unless {
            if self.check(name).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn check(&mut self, name: &str) -> Result<bool, MachineError> {
        let guard = self.fsm.guard(name)?;
        guard
            .check(&mut self.ctx)
            .await
            .map_err(|source| MachineError::Handler {
                name: name.to_string(),
                source,
            })
    }

    async fn run_events(&mut self, state: &State) -> Result<(), MachineError> {
        for name in &state.events {
            let action = self.fsm.action(name)?;
            tracing::debug!(conv_id = %self.ctx.conversation_id(), event = %name, "Running event");
            action
                .run(&mut self.ctx)
                .await
                .map_err(|source| MachineError::Handler {
                    name: name.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    async fn save_checkpoint(&self, store: &dyn CheckpointStore) -> Result<(), MachineError> {
        store
            .save_checkpoint(self.ctx.conversation_id(), self.fsm.name(), &self.current_state)
            .await
            .map_err(MachineError::Checkpoint)?;
        tracing::debug!(
            conv_id = %self.ctx.conversation_id(),
            state = %self.current_state.name,
            "Checkpoint saved"
        );
        Ok(())
    }
}
