//! Wire envelope exchanged over the realtime socket.
//!
//! Frames are JSON text in both directions. Outbound frames are control
//! messages; inbound frames of type `event` carry a row change for a channel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A database row as delivered by the backend
pub type Record = Map<String, Value>;

/// Row change type, also used as the key for handler registration.
///
/// `All` is the wildcard: handlers registered under it receive every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "*")]
    All,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Insert => "INSERT",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
            EventType::All => "*",
        };
        f.write_str(name)
    }
}

/// A row change delivered to channel handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub table: String,
    pub schema: String,
    /// ISO-8601 timestamp of the commit, as sent by the backend
    pub commit_timestamp: String,
    /// New row for INSERT and UPDATE
    #[serde(default)]
    pub new: Option<Record>,
    /// Previous row for DELETE and UPDATE, when the backend supplies it
    #[serde(default)]
    pub old: Option<Record>,
}

/// Control frames sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Heartbeat,
}

impl ClientMessage {
    /// Serialize to the JSON text frame
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Frames sent by the backend.
///
/// Envelope types other than `event` decode to `Other` and are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Event {
        channel: String,
        payload: ChangePayload,
    },
    #[serde(other)]
    Other,
}

impl ServerMessage {
    /// Decode a JSON text frame
    pub fn decode(text: &str) -> Result<ServerMessage, serde_json::Error> {
        serde_json::from_str(text)
    }
}
