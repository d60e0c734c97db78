//! Wire types exchanged with compute workers

use crate::mml::Stack;
use serde::{Deserialize, Serialize};

/// Source document backing part of an answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[cfg(test)]
impl Reference {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
        }
    }
}

/// One incremental chunk of a streamed worker response. Every result carries
/// its own reference list, possibly empty. A final result with `error` set
/// means the answer was cut short.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialResult {
    #[serde(default)]
    pub res: String,
    #[serde(default)]
    pub context: Vec<Reference>,
    #[serde(rename = "final", default)]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lm_msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
impl PartialResult {
    pub fn chunk(res: impl Into<String>) -> Self {
        Self {
            res: res.into(),
            context: Vec::new(),
            is_final: false,
            lm_msg_id: None,
            error: None,
        }
    }

    pub fn last(res: impl Into<String>) -> Self {
        Self {
            is_final: true,
            ..Self::chunk(res)
        }
    }

    pub fn with_context(mut self, context: Vec<Reference>) -> Self {
        self.context = context;
        self
    }

    pub fn with_msg_id(mut self, lm_msg_id: impl Into<String>) -> Self {
        self.lm_msg_id = Some(lm_msg_id.into());
        self
    }
}

/// Envelope a worker sends back to the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReply {
    /// Batch of results for one channel
    RpcResponse {
        #[serde(default)]
        bot_channel_name: Option<String>,
        payload: Vec<PartialResult>,
    },
    /// Single streamed LLM chunk
    SendLlmResponse { message: LlmResponseMessage },
}

impl WorkerReply {
    pub fn channel(&self) -> Option<&str> {
        match self {
            WorkerReply::RpcResponse {
                bot_channel_name, ..
            } => bot_channel_name.as_deref(),
            WorkerReply::SendLlmResponse { message } => message.bot_channel_name.as_deref(),
        }
    }

    pub fn into_results(self) -> Vec<PartialResult> {
        match self {
            WorkerReply::RpcResponse { payload, .. } => payload,
            WorkerReply::SendLlmResponse { message } => vec![message.result],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmResponseMessage {
    #[serde(default)]
    pub bot_channel_name: Option<String>,
    #[serde(flatten)]
    pub result: PartialResult,
}

/// Correlation payload a context hands to the worker along with a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub conversation_id: String,
    pub platform_conversation_id: String,
    pub fsm_name: String,
    /// Stacks of the most recent turn, if any
    #[serde(default)]
    pub last_mml: Option<Vec<Stack>>,
    /// Transport address of the conversation session
    pub channel_name: String,
}

/// Envelope the broker sends to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    LlmRequest {
        /// Channel the worker must address its replies to
        bot_channel_name: String,
        model_id: String,
        input: String,
        context: ContextSnapshot,
    },
    SendDataSourceToParse {
        parser: String,
        data_source_id: String,
    },
}

impl WorkerRequest {
    /// Directory key of the worker that serves this request
    pub fn task_name(&self) -> String {
        match self {
            WorkerRequest::LlmRequest { .. } => "llm".to_string(),
            WorkerRequest::SendDataSourceToParse { parser, .. } => format!("parser.{parser}"),
        }
    }
}
