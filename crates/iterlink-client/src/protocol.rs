//! Wire message classification.
//!
//! Inbound text frames are JSON objects with a `type` and an optional
//! `instanceId`. Anything that is not a JSON object with a string `type` is
//! dropped at parse time.

use iterlink_core::{ChatEvent, InstanceId, InstanceStatus};
use serde_json::{Value, json};

/// Inbound message categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundKind {
    /// Handshake carrying authoritative history.
    Connected,
    /// Catch-up answer.
    PendingEvents,
    /// Instance switched workspace; carries fresh history.
    WorkspaceSwitched,
    /// `<stream>:event`
    StreamEvent,
    /// `<stream>:status`
    StreamStatus,
    /// `<stream>:output`
    StreamOutput,
    /// `<stream>:error`
    StreamError,
    /// `<stream>:exit`
    StreamExit,
    /// Echo of a user prompt.
    UserMessage,
    /// Server-level error.
    Error,
    /// Keepalive reply.
    Pong,
    /// `chat:*`, active instance only.
    Chat,
    /// `*_created`, `*_updated`, `*_deleted`.
    Mutation,
    /// Anything else.
    Unknown,
}

impl InboundKind {
    /// Classify a `type` string.
    pub fn classify(msg_type: &str) -> Self {
        match msg_type {
            "connected" => return Self::Connected,
            "pending_events" => return Self::PendingEvents,
            "workspace_switched" => return Self::WorkspaceSwitched,
            "user_message" => return Self::UserMessage,
            "error" => return Self::Error,
            "pong" => return Self::Pong,
            _ => {}
        }
        if msg_type.starts_with("chat:") {
            return Self::Chat;
        }
        if let Some((stream, suffix)) = msg_type.rsplit_once(':') {
            if !stream.is_empty() {
                return match suffix {
                    "event" => Self::StreamEvent,
                    "status" => Self::StreamStatus,
                    "output" => Self::StreamOutput,
                    "error" => Self::StreamError,
                    "exit" => Self::StreamExit,
                    _ => Self::Unknown,
                };
            }
        }
        if ["_created", "_updated", "_deleted"]
            .iter()
            .any(|s| msg_type.ends_with(s))
        {
            return Self::Mutation;
        }
        Self::Unknown
    }
}

/// A parsed inbound message.
#[derive(Clone, Debug, PartialEq)]
pub struct Inbound {
    /// Category.
    pub kind: InboundKind,
    /// Raw `type`.
    pub msg_type: String,
    /// Explicit target; `None` means the active instance.
    pub instance_id: Option<InstanceId>,
    /// The whole message.
    pub body: Value,
}

impl Inbound {
    /// Parse a text frame. Returns `None` for malformed input.
    pub fn parse(text: &str) -> Option<Self> {
        let body: Value = serde_json::from_str(text).ok()?;
        Self::from_value(body)
    }

    /// Classify an already-decoded message.
    pub fn from_value(body: Value) -> Option<Self> {
        let msg_type = body.as_object()?.get("type")?.as_str()?.to_owned();
        let instance_id = body
            .get("instanceId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(InstanceId::from_raw);
        Some(Self {
            kind: InboundKind::classify(&msg_type),
            msg_type,
            instance_id,
            body,
        })
    }

    /// Events under `key` (malformed entries skipped).
    pub fn events(&self, key: &str) -> Vec<ChatEvent> {
        self.body
            .get(key)
            .map(ChatEvent::list_from_value)
            .unwrap_or_default()
    }

    /// The single event carried by an event-bearing message.
    ///
    /// Looks in `event`, then `data`; `user_message` falls back to the
    /// message itself.
    pub fn event(&self) -> Option<ChatEvent> {
        for key in ["event", "data"] {
            if let Some(v) = self.body.get(key).filter(|v| v.is_object()) {
                return ChatEvent::from_value(v.clone());
            }
        }
        if self.kind == InboundKind::UserMessage {
            let mut body = self.body.clone();
            if let Some(obj) = body.as_object_mut() {
                let _ = obj.remove("instanceId");
            }
            return ChatEvent::from_value(body);
        }
        None
    }

    /// `status` parsed leniently, if present.
    pub fn status(&self) -> Option<InstanceStatus> {
        self.str_field("status").map(InstanceStatus::parse_lenient)
    }

    /// First present string among `keys`.
    pub fn text(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.str_field(k))
    }

    /// A string field.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }
}

/// Outbound messages.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// Catch-up request.
    Reconnect {
        /// Instance to catch up.
        instance_id: InstanceId,
        /// Newest timestamp already seen.
        last_event_timestamp: i64,
    },
    /// Keepalive.
    Ping,
    /// Ask the server to resume an interrupted session.
    ResumeSession {
        /// Instance to resume.
        instance_id: InstanceId,
    },
    /// Application message forwarded untouched.
    App(Value),
}

impl Outbound {
    /// JSON form.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Reconnect {
                instance_id,
                last_event_timestamp,
            } => json!({
                "type": "reconnect",
                "instanceId": instance_id,
                "lastEventTimestamp": last_event_timestamp,
            }),
            Self::Ping => json!({ "type": "ping" }),
            Self::ResumeSession { instance_id } => json!({
                "type": "resume_session",
                "instanceId": instance_id,
            }),
            Self::App(value) => value.clone(),
        }
    }

    /// Serialized text frame.
    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Reconnect { .. } => "reconnect",
            Self::Ping => "ping",
            Self::ResumeSession { .. } => "resume_session",
            Self::App(_) => "app",
        }
    }
}
