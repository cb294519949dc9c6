//! UI cache interface.
//!
//! The engine only ever notifies the cache; it never reads events back
//! except for [`EventCache::event_count`] during reconciliation.

use std::collections::HashMap;

use iterlink_core::{ChatEvent, ConnectionStatus, InstanceId, InstanceStatus, TokenUsage};
use parking_lot::RwLock;

/// Receiver of everything the engine learns.
pub trait EventCache: Send + Sync {
    /// Foreground instance.
    fn active_instance(&self) -> InstanceId;
    /// Change the foreground instance.
    fn set_active_instance(&self, instance: InstanceId);
    /// Events currently held for `instance`.
    fn event_count(&self, instance: &InstanceId) -> usize;
    /// Last known status of `instance`.
    fn status(&self, instance: &InstanceId) -> InstanceStatus;

    /// Append one live event.
    fn add_event(&self, instance: &InstanceId, event: ChatEvent);
    /// Replace the list with authoritative server history.
    fn set_events(&self, instance: &InstanceId, events: Vec<ChatEvent>);
    /// Replace the list with locally stored history (boot seeding).
    fn replace_events(&self, instance: &InstanceId, events: Vec<ChatEvent>);
    /// Append a raw output line.
    fn append_output(&self, instance: &InstanceId, line: String);

    /// Set the instance status.
    fn set_status(&self, instance: &InstanceId, status: InstanceStatus);
    /// Set the connection status.
    fn set_connection_status(&self, status: ConnectionStatus);
    /// Record an instance-level error.
    fn set_error(&self, instance: &InstanceId, message: String);
    /// Reconnect attempts are exhausted.
    fn connection_failed(&self, attempts: u32);

    /// Fold usage into the running totals.
    fn add_token_usage(&self, instance: &InstanceId, usage: TokenUsage);
    /// Reset per-session aggregates (token totals, output lines).
    fn reset_token_usage(&self, instance: &InstanceId);
    /// A durable write was given up on.
    fn set_persistence_error(&self, message: String, failed_count: u64);
}

/// Cached view of one instance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceView {
    /// Event log.
    pub events: Vec<ChatEvent>,
    /// Status.
    pub status: InstanceStatus,
    /// Token totals for the open session.
    pub usage: TokenUsage,
    /// Output lines for the open session.
    pub output: Vec<String>,
    /// Last reported error.
    pub last_error: Option<String>,
    /// Whether `events` came from the server rather than the local store.
    pub synced: bool,
}

#[derive(Debug, Default)]
struct Inner {
    active: InstanceId,
    connection: ConnectionStatus,
    failed_attempts: Option<u32>,
    persistence_error: Option<(String, u64)>,
    instances: HashMap<InstanceId, InstanceView>,
}

/// Thread-safe in-memory [`EventCache`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    inner: RwLock<Inner>,
}

impl MemoryCache {
    /// Empty cache with `active` in the foreground.
    pub fn new(active: InstanceId) -> Self {
        Self {
            inner: RwLock::new(Inner {
                active,
                ..Inner::default()
            }),
        }
    }

    /// Snapshot of one instance.
    pub fn view(&self, instance: &InstanceId) -> InstanceView {
        self.inner
            .read()
            .instances
            .get(instance)
            .cloned()
            .unwrap_or_default()
    }

    /// Events of one instance.
    pub fn events(&self, instance: &InstanceId) -> Vec<ChatEvent> {
        self.inner
            .read()
            .instances
            .get(instance)
            .map(|v| v.events.clone())
            .unwrap_or_default()
    }

    /// Every instance with cached state, sorted.
    pub fn instances(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self.inner.read().instances.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Connection status.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.read().connection
    }

    /// Attempts reported by the last terminal failure.
    pub fn failed_attempts(&self) -> Option<u32> {
        self.inner.read().failed_attempts
    }

    /// Last persistence advisory.
    pub fn persistence_error(&self) -> Option<(String, u64)> {
        self.inner.read().persistence_error.clone()
    }

    fn with_instance<R>(&self, instance: &InstanceId, f: impl FnOnce(&mut InstanceView) -> R) -> R {
        let mut inner = self.inner.write();
        f(inner.instances.entry(instance.clone()).or_default())
    }
}

impl EventCache for MemoryCache {
    fn active_instance(&self) -> InstanceId {
        self.inner.read().active.clone()
    }

    fn set_active_instance(&self, instance: InstanceId) {
        self.inner.write().active = instance;
    }

    fn event_count(&self, instance: &InstanceId) -> usize {
        self.inner
            .read()
            .instances
            .get(instance)
            .map_or(0, |v| v.events.len())
    }

    fn status(&self, instance: &InstanceId) -> InstanceStatus {
        self.inner
            .read()
            .instances
            .get(instance)
            .map(|v| v.status)
            .unwrap_or_default()
    }

    fn add_event(&self, instance: &InstanceId, event: ChatEvent) {
        self.with_instance(instance, |view| {
            // A server id seen twice is the same event.
            if event.id.is_some() && view.events.iter().any(|e| e.id == event.id) {
                return;
            }
            view.events.push(event);
        });
    }

    fn set_events(&self, instance: &InstanceId, events: Vec<ChatEvent>) {
        self.with_instance(instance, |view| {
            view.events = events;
            view.synced = true;
        });
    }

    fn replace_events(&self, instance: &InstanceId, events: Vec<ChatEvent>) {
        self.with_instance(instance, |view| {
            view.events = events;
            view.synced = false;
        });
    }

    fn append_output(&self, instance: &InstanceId, line: String) {
        self.with_instance(instance, |view| view.output.push(line));
    }

    fn set_status(&self, instance: &InstanceId, status: InstanceStatus) {
        self.with_instance(instance, |view| view.status = status);
    }

    fn set_connection_status(&self, status: ConnectionStatus) {
        let mut inner = self.inner.write();
        inner.connection = status;
        if status == ConnectionStatus::Connected {
            inner.failed_attempts = None;
        }
    }

    fn set_error(&self, instance: &InstanceId, message: String) {
        self.with_instance(instance, |view| view.last_error = Some(message));
    }

    fn connection_failed(&self, attempts: u32) {
        let mut inner = self.inner.write();
        inner.connection = ConnectionStatus::Failed;
        inner.failed_attempts = Some(attempts);
    }

    fn add_token_usage(&self, instance: &InstanceId, usage: TokenUsage) {
        self.with_instance(instance, |view| view.usage += usage);
    }

    fn reset_token_usage(&self, instance: &InstanceId) {
        self.with_instance(instance, |view| {
            view.usage = TokenUsage::default();
            view.output.clear();
        });
    }

    fn set_persistence_error(&self, message: String, failed_count: u64) {
        self.inner.write().persistence_error = Some((message, failed_count));
    }
}
