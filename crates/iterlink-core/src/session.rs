//! Sessions and the durable event record.

use serde::{Deserialize, Serialize};

use crate::event::ChatEvent;
use crate::ids::{EventId, InstanceId, SessionId};

/// A contiguous run of events for one instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Server-assigned or derived session id.
    pub id: SessionId,
    /// Unix milliseconds of the boundary event that opened the session.
    pub started_at: i64,
}

impl Session {
    /// Open a session, preferring the server-assigned id.
    pub fn open(instance: &InstanceId, started_at: i64, server_id: Option<SessionId>) -> Self {
        Self {
            id: server_id.unwrap_or_else(|| SessionId::derive(instance, started_at)),
            started_at,
        }
    }
}

/// The form written to the local event store.
///
/// `id` is unique in the store; writing the same id again overwrites.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedEvent {
    /// Dedup key.
    pub id: EventId,
    /// Session the event belongs to.
    pub session_id: SessionId,
    /// Instance the session belongs to.
    pub instance_id: InstanceId,
    /// Unix milliseconds; a stand-in when the event carried none.
    pub timestamp: i64,
    /// Copy of `event.event_type`, denormalized for queries.
    pub event_type: String,
    /// The event as observed.
    pub event: ChatEvent,
}

/// Hex digits of the content fingerprint kept in derived ids.
const FINGERPRINT_LEN: usize = 16;

impl PersistedEvent {
    /// Wrap an event for persistence under `session_id`.
    ///
    /// Shorthand for [`PersistedEvent::at_position`] with occurrence 0 and
    /// no stand-in timestamp.
    pub fn new(event: ChatEvent, session_id: SessionId, instance_id: InstanceId) -> Self {
        Self::at_position(event, session_id, instance_id, 0, 0)
    }

    /// Wrap an event, keying id-less events by content.
    ///
    /// Without a server id the key is `"{session}:{fingerprint}:{occurrence}"`,
    /// where `occurrence` counts identical id-less events seen earlier in the
    /// session. Distinct events never share a key and a replay of the same
    /// event lands on the same row. `fallback_ts` is stored when the event has
    /// no timestamp so it sorts after what preceded it.
    pub fn at_position(
        event: ChatEvent,
        session_id: SessionId,
        instance_id: InstanceId,
        occurrence: u32,
        fallback_ts: i64,
    ) -> Self {
        let timestamp = event.timestamp.unwrap_or(fallback_ts);
        let id = event.id.clone().unwrap_or_else(|| {
            let digest = event.fingerprint();
            let short = &digest[..FINGERPRINT_LEN.min(digest.len())];
            EventId::from_raw(format!("{session_id}:{short}:{occurrence}"))
        });
        Self {
            id,
            session_id,
            instance_id,
            timestamp,
            event_type: event.event_type.clone(),
            event,
        }
    }
}
