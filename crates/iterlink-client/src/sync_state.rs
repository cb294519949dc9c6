//! Per-instance sync bookkeeping, in memory only.
//!
//! Rebuilt from scratch on every process start. Owned by the router, which
//! lives inside the connection actor.

use std::collections::HashMap;

use iterlink_core::{ChatEvent, InstanceId, Session};

/// Sync state of one instance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceSync {
    /// Newest event timestamp observed.
    pub last_event_timestamp: Option<i64>,
    /// Open session, if a boundary has been seen.
    pub current_session: Option<Session>,
    /// Id-less events seen in the open session, by content fingerprint.
    occurrences: HashMap<String, u32>,
}

/// Sync state of every instance seen so far.
#[derive(Debug, Default)]
pub struct SyncState {
    instances: HashMap<InstanceId, InstanceSync>,
}

impl SyncState {
    /// State of one instance.
    pub fn get(&self, instance: &InstanceId) -> Option<&InstanceSync> {
        self.instances.get(instance)
    }

    /// Open session of `instance`.
    pub fn current_session(&self, instance: &InstanceId) -> Option<&Session> {
        self.get(instance)?.current_session.as_ref()
    }

    /// Newest timestamp observed for `instance`.
    pub fn last_event_timestamp(&self, instance: &InstanceId) -> Option<i64> {
        self.get(instance)?.last_event_timestamp
    }

    /// Raise the instance's timestamp to `ts`; older values are ignored.
    /// Returns `true` if it moved.
    pub fn observe_timestamp(&mut self, instance: &InstanceId, ts: i64) -> bool {
        let entry = self.instances.entry(instance.clone()).or_default();
        match entry.last_event_timestamp {
            Some(current) if current >= ts => false,
            _ => {
                entry.last_event_timestamp = Some(ts);
                true
            }
        }
    }

    /// Open a new session for `instance` from a boundary event, replacing any
    /// open one.
    ///
    /// The id is the event's own session id when present, otherwise derived
    /// from the instance and start time. `started_at` is the event timestamp
    /// (or `now_ms` if it has none) but never earlier than the replaced
    /// session's start.
    pub(crate) fn allocate_session(
        &mut self,
        instance: &InstanceId,
        boundary: &ChatEvent,
        now_ms: i64,
    ) -> Session {
        let entry = self.instances.entry(instance.clone()).or_default();
        let floor = entry.current_session.as_ref().map_or(i64::MIN, |s| s.started_at);
        let started_at = boundary.timestamp.unwrap_or(now_ms).max(floor);
        let session = Session::open(instance, started_at, boundary.session_hint());
        entry.current_session = Some(session.clone());
        entry.occurrences.clear();
        session
    }

    /// How many id-less events with this fingerprint the open session has
    /// already seen; counts this one.
    pub(crate) fn next_occurrence(&mut self, instance: &InstanceId, fingerprint: &str) -> u32 {
        let entry = self.instances.entry(instance.clone()).or_default();
        let seen = entry.occurrences.entry(fingerprint.to_owned()).or_insert(0);
        let occurrence = *seen;
        *seen += 1;
        occurrence
    }

    /// Instances with a known timestamp, for catch-up requests.
    pub fn catch_up_targets(&self) -> Vec<(InstanceId, i64)> {
        let mut targets: Vec<_> = self
            .instances
            .iter()
            .filter_map(|(id, s)| s.last_event_timestamp.map(|ts| (id.clone(), ts)))
            .collect();
        targets.sort();
        targets
    }

    /// Every instance with state.
    pub fn instances(&self) -> impl Iterator<Item = &InstanceId> {
        self.instances.keys()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.instances.clear();
    }
}
