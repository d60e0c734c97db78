//! MML record types

use super::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Human,
    Bot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(rename = "type")]
    pub kind: AgentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Platform-specific identifiers (user id, chat id, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ids: BTreeMap<String, String>,
}

impl Sender {
    pub fn human(platform: impl Into<String>) -> Self {
        Self {
            kind: AgentType::Human,
            platform: Some(platform.into()),
            ids: BTreeMap::new(),
        }
    }

    pub fn bot() -> Self {
        Self {
            kind: AgentType::Bot,
            platform: None,
            ids: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ids.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.kind == AgentType::Human && self.platform.as_deref().is_none_or(str::is_empty) {
            return Err(ValidationError::MissingPlatform);
        }
        Ok(())
    }
}

/// Content block kinds a stack can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackType {
    Text,
    Html,
    Image,
    Satisfaction,
    QuickReplies,
    LmGeneratedText,
}

impl StackType {
    pub fn as_str(self) -> &'static str {
        match self {
            StackType::Text => "text",
            StackType::Html => "html",
            StackType::Image => "image",
            StackType::Satisfaction => "satisfaction",
            StackType::QuickReplies => "quick_replies",
            StackType::LmGeneratedText => "lm_generated_text",
        }
    }
}

/// One content block of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    #[serde(rename = "type")]
    pub kind: StackType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub meta: Value,
}

impl Stack {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: StackType::Text,
            payload: Value::String(text.into()),
            meta: Value::Null,
        }
    }

    pub fn lm_generated_text(payload: Value) -> Self {
        Self {
            kind: StackType::LmGeneratedText,
            payload,
            meta: Value::Null,
        }
    }

    /// Text content, for stacks that carry plain text
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            StackType::Text => self.payload.as_str(),
            StackType::LmGeneratedText => self.payload.get("model_response")?.as_str(),
            _ => None,
        }
    }

    fn validate(&self, index: usize) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidStack {
            index,
            kind: self.kind.as_str(),
            reason: reason.to_string(),
        };

        match self.kind {
            StackType::Text | StackType::Html => {
                if !self.payload.is_string() {
                    return Err(invalid("payload must be a string"));
                }
            }
            StackType::Image => {
                let raw = self.payload.as_str().ok_or_else(|| invalid("payload must be a URL"))?;
                let url = url::Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(invalid("image URLs must be http or https"));
                }
            }
            StackType::LmGeneratedText => {
                if !self.payload.is_object() {
                    return Err(invalid("payload must be an object"));
                }
            }
            StackType::Satisfaction | StackType::QuickReplies => {}
        }
        Ok(())
    }
}

/// A stored, immutable conversational turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sequence_id: i64,
    pub sender: Sender,
    pub stacks: Vec<Stack>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub send_time: DateTime<Utc>,
    pub prev: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Concatenated text of every text-bearing stack
    pub fn text(&self) -> String {
        self.stacks
            .iter()
            .filter_map(Stack::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_from_human(&self) -> bool {
        self.sender.kind == AgentType::Human
    }
}

/// A turn that has not been stored yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender: Sender,
    pub stacks: Vec<Stack>,
    pub send_time: DateTime<Utc>,
    pub prev: Option<String>,
}

impl NewMessage {
    pub fn new(conversation_id: impl Into<String>, sender: Sender, stacks: Vec<Stack>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender,
            stacks,
            send_time: Utc::now(),
            prev: None,
        }
    }

    pub fn after(mut self, prev: Option<String>) -> Self {
        self.prev = prev;
        self
    }

    /// Checks everything that does not need the store: sender and stacks.
    /// Chain linkage is checked by the store at insert time.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.sender.validate()?;
        if self.stacks.is_empty() {
            return Err(ValidationError::EmptyStacks);
        }
        for (index, stack) in self.stacks.iter().enumerate() {
            stack.validate(index)?;
        }
        Ok(())
    }
}
