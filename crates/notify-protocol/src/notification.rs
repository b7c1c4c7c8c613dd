//! Notification payloads pushed by the backend.
//!
//! The channel itself only checks that a frame is JSON; [`PushMessage`] keeps
//! the parsed value as-is and hands it to the sink. [`Notification`] and
//! [`PushEnvelope`] give sinks typed access when they want it.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::ChannelError;

/// A notification row as the backend stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    /// Notification category (e.g. "comment", "report", "system")
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub content: String,
    /// Kind of object the notification points at, if any
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub target_id: Option<i64>,
    /// 0/1 on the wire; booleans are accepted too
    #[serde(default, deserialize_with = "deserialize_flag", serialize_with = "serialize_flag")]
    pub is_read: bool,
    #[serde(default, deserialize_with = "deserialize_flag", serialize_with = "serialize_flag")]
    pub is_pushed: bool,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Notification {
    /// `(target_type, target_id)` when both are present.
    pub fn target(&self) -> Option<(&str, i64)> {
        match (&self.target_type, self.target_id) {
            (Some(kind), Some(id)) => Some((kind.as_str(), id)),
            _ => None,
        }
    }
}

/// `{ "type": "...", "data": <Notification> }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Notification,
}

/// One inbound frame, parsed as JSON and otherwise untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage(Value);

impl PushMessage {
    pub fn parse(text: &str) -> Result<Self, ChannelError> {
        Ok(Self(serde_json::from_str(text)?))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ChannelError> {
        Ok(Self(serde_json::from_slice(bytes)?))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Top-level `type` field, if the payload is an object that has one.
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    /// Interpret the payload as a notification, either wrapped in an
    /// envelope or bare.
    pub fn notification(&self) -> Option<Notification> {
        if let Some(data) = self.0.get("data") {
            if let Ok(notification) = Notification::deserialize(data) {
                return Some(notification);
            }
        }
        Notification::deserialize(&self.0).ok()
    }
}

impl From<Value> for PushMessage {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<&Notification> for PushMessage {
    fn from(notification: &Notification) -> Self {
        Self(serde_json::to_value(notification).unwrap_or(Value::Null))
    }
}

impl From<&PushEnvelope> for PushMessage {
    fn from(envelope: &PushEnvelope) -> Self {
        Self(serde_json::to_value(envelope).unwrap_or(Value::Null))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(i64),
}

fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(n) => n != 0,
    })
}

fn serialize_flag<S: Serializer>(flag: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(u8::from(*flag))
}
