//! Platform adapters
//!
//! Each messaging platform gets one adapter that turns its inbound JSON into
//! an unsaved MML turn and renders stored turns back into its wire schema.

use super::{Message, NewMessage, Sender, Stack, ValidationError};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

/// Capability interface every platform adapter implements
pub trait PlatformSerializer: Send + Sync {
    /// Platform name recorded on human senders
    fn platform(&self) -> &str;

    /// Convert an inbound payload into a validated, unsaved turn chained
    /// after `prev`
    fn to_mml(
        &self,
        payload: &Value,
        conversation_id: &str,
        prev: Option<String>,
    ) -> Result<NewMessage, ValidationError>;

    /// Render a stored turn for delivery. Platforms that need multi-part
    /// delivery return several payloads, sent in order.
    fn to_platform(&self, mml: &Message) -> Vec<Value>;
}

/// WebSocket-style adapter: stacks in, whole serialized message out
#[derive(Debug, Default, Clone)]
pub struct WsSerializer;

#[derive(Debug, Deserialize)]
struct WsInbound {
    stacks: Vec<Stack>,
    #[serde(default)]
    sender: Option<Sender>,
    /// JS timestamp in milliseconds
    #[serde(default)]
    send_time: Option<i64>,
}

impl PlatformSerializer for WsSerializer {
    fn platform(&self) -> &str {
        "ws"
    }

    fn to_mml(
        &self,
        payload: &Value,
        conversation_id: &str,
        prev: Option<String>,
    ) -> Result<NewMessage, ValidationError> {
        let inbound: WsInbound = serde_json::from_value(payload.clone())?;
        let sender = inbound
            .sender
            .unwrap_or_else(|| Sender::human(self.platform()));

        let mut msg = NewMessage::new(conversation_id, sender, inbound.stacks).after(prev);
        if let Some(ms) = inbound.send_time {
            msg.send_time = DateTime::<Utc>::from_timestamp_millis(ms)
                .ok_or_else(|| ValidationError::Schema(format!("send_time out of range: {ms}")))?;
        }
        msg.validate()?;
        Ok(msg)
    }

    fn to_platform(&self, mml: &Message) -> Vec<Value> {
        vec![serde_json::to_value(mml).unwrap_or(Value::Null)]
    }
}

/// Plain-text adapter for platforms that only speak `{"text": ...}`.
/// Outbound turns are split one payload per stack.
#[derive(Debug, Clone)]
pub struct TextSerializer {
    platform: String,
}

impl TextSerializer {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TextInbound {
    text: String,
    #[serde(default)]
    user_id: Option<String>,
}

impl PlatformSerializer for TextSerializer {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn to_mml(
        &self,
        payload: &Value,
        conversation_id: &str,
        prev: Option<String>,
    ) -> Result<NewMessage, ValidationError> {
        let inbound: TextInbound = serde_json::from_value(payload.clone())?;
        let mut sender = Sender::human(&self.platform);
        if let Some(user_id) = inbound.user_id {
            sender = sender.with_id("user_id", user_id);
        }
        let msg = NewMessage::new(conversation_id, sender, vec![Stack::text(inbound.text)])
            .after(prev);
        msg.validate()?;
        Ok(msg)
    }

    fn to_platform(&self, mml: &Message) -> Vec<Value> {
        mml.stacks
            .iter()
            .map(|stack| match stack.as_text() {
                Some(text) => json!({ "text": text, "message_id": mml.id }),
                None => json!({
                    "type": stack.kind.as_str(),
                    "payload": stack.payload,
                    "message_id": mml.id,
                }),
            })
            .collect()
    }
}
