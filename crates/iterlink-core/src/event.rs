//! The opaque event record streamed by the server.
//!
//! The engine never interprets agent semantics. A [`ChatEvent`] is only a
//! type tag, an optional numeric timestamp, an optional server-assigned id,
//! and whatever else the server put alongside them (kept verbatim in
//! [`ChatEvent::payload`]).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::ids::{EventId, SessionId};

/// A single timestamped event as observed on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Event type tag (`"type"` on the wire).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix milliseconds. Non-numeric wire values are treated as absent.
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<i64>,
    /// Server-assigned, globally unique id. The sole dedup key.
    #[serde(
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<EventId>,
    /// Everything else, untouched.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ChatEvent {
    /// Build an event with no id and an empty payload.
    pub fn new(event_type: impl Into<String>, timestamp: Option<i64>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp,
            id: None,
            payload: Map::new(),
        }
    }

    /// Set the server id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(EventId::from_raw(id));
        self
    }

    /// Add a payload field.
    #[must_use]
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        let _ = self.payload.insert(key.to_owned(), value);
        self
    }

    /// Parse an event from a JSON value. Returns `None` for anything that is
    /// not an object with a string `type`.
    pub fn from_value(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }

    /// Parse a JSON array of events, skipping malformed entries.
    pub fn list_from_value(value: &Value) -> Vec<Self> {
        value
            .as_array()
            .map(|items| items.iter().cloned().filter_map(Self::from_value).collect())
            .unwrap_or_default()
    }

    /// Server-assigned session id carried on the event, if any.
    pub fn session_hint(&self) -> Option<SessionId> {
        ["sessionId", "session_id"]
            .iter()
            .find_map(|key| self.payload.get(*key).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
            .map(SessionId::from_raw)
    }

    /// Hex SHA-256 of the serialized event. Stable across replays because
    /// payload keys serialize in sorted order.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(self).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }

    /// Serialize back to the wire shape.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }))
}

fn lenient_id<'de, D>(deserializer: D) -> Result<Option<EventId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::String(s) if !s.is_empty() => Some(EventId::from_raw(s)),
        Value::Number(n) => Some(EventId::from_raw(n.to_string())),
        _ => None,
    }))
}
