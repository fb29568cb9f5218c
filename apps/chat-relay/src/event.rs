use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::RelayError;

/// Envelope shared by every event relayed over the channel and sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatEvent {
    pub id: u64,
    pub timestamp: DateTime<FixedOffset>,
    #[serde(flatten)]
    pub body: EventBody,
    pub resource_id: String,
    pub session_id: String,
    #[serde(with = "error_flag")]
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<String>,
}

/// Type-specific payload, tagged by the wire `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    /// Sent to a fresh or still-anonymous session after admission
    SessionInit,
    /// A display name was bound to the session
    UserName { user_name: String },
    /// Chat text from a named session
    Message { user_name: String, message: String },
    /// The session's connection went away or was closed by the server
    Disconnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl EventBody {
    pub fn kind(&self) -> &'static str {
        match self {
            EventBody::SessionInit => "session_init",
            EventBody::UserName { .. } => "user_name",
            EventBody::Message { .. } => "message",
            EventBody::Disconnected { .. } => "disconnected",
        }
    }
}

impl ChatEvent {
    pub fn new(
        id: u64,
        resource_id: impl Into<String>,
        session_id: impl Into<String>,
        body: EventBody,
    ) -> Self {
        Self {
            id,
            timestamp: Local::now().fixed_offset(),
            body,
            resource_id: resource_id.into(),
            session_id: session_id.into(),
            error: false,
            error_info: None,
        }
    }

    pub fn with_error(mut self, info: impl Into<String>) -> Self {
        self.error = true;
        self.error_info = Some(info.into());
        self
    }

    pub fn is_message(&self) -> bool {
        matches!(self.body, EventBody::Message { .. })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// Events a browser may send over its connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    UserName { user_name: String },
    Message { message: String },
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|err| RelayError::MalformedClientEvent(err.to_string()))
    }
}

/// Process-local event id source. Ids are not unique across processes.
#[derive(Debug, Default)]
pub struct EventIds {
    next: AtomicU64,
}

impl EventIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

mod error_flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(flag: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*flag))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(u8::deserialize(deserializer)? != 0)
    }
}
