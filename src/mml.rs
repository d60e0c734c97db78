//! Message Markup Language
//!
//! The normalized, platform-independent representation of one conversational
//! turn, plus the adapters that translate platform payloads to and from it.

mod serializer;
mod types;

pub use serializer::{PlatformSerializer, TextSerializer, WsSerializer};
pub use types::*;

use thiserror::Error;

/// Inbound payload or chain-linkage failure. Recoverable per message: the
/// conversation state is left untouched and the error goes back to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid payload: {0}")]
    Schema(String),
    #[error("a message must carry at least one stack")]
    EmptyStacks,
    #[error("stack {index} ({kind}): {reason}")]
    InvalidStack {
        index: usize,
        kind: &'static str,
        reason: String,
    },
    #[error("human senders must name a platform")]
    MissingPlatform,
    #[error("prev should be always unique for the same conversation")]
    DuplicatePrev,
    #[error("prev message not found: {0}")]
    UnknownPrev(String),
    #[error("prev should belong to the same conversation: {0}")]
    ForeignPrev(String),
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Schema(err.to_string())
    }
}
