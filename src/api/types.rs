//! API request and response types

use crate::db::Vote;
use serde::{Deserialize, Serialize};

/// Result of an accepted inbound message
#[derive(Debug, Serialize)]
pub struct InboundResponse {
    pub conversation_id: String,
    pub message_id: String,
    pub state: String,
}

/// Response with conversation and messages
#[derive(Debug, Serialize)]
pub struct ConversationWithMessagesResponse {
    pub conversation: serde_json::Value,
    pub messages: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Acknowledgement for a worker reply
#[derive(Debug, Serialize)]
pub struct RpcAck {
    /// Partial results handed to a waiting conversation
    pub delivered: usize,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub vote: Vote,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ParseRequest {
    pub parser: String,
}

/// Response for lifecycle actions
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Response for model list
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Machine-readable category, e.g. `validation`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: &'static str) -> Self {
        self.kind = Some(kind);
        self
    }
}
