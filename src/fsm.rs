//! Finite state machines driving conversations
//!
//! A stored [`FsmDefinition`] names its states, transitions and the handlers
//! it uses. [`FsmDefinition::build_machine`] resolves those names against the
//! [`HandlerRegistry`] and yields a [`Machine`] bound to one conversation.

mod builtins;
mod definition;
mod machine;
mod registry;

pub use builtins::register_builtins;
pub use definition::{DefinitionError, FsmDefinition, State, Transition};
pub use machine::{Machine, MachineError};
pub use registry::{HandlerError, HandlerRegistry};
