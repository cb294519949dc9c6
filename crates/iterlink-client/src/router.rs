//! Inbound message routing and the per-event path.
//!
//! The router is synchronous and lives inside the connection actor, so each
//! call sees a consistent [`SyncState`]. For every event it:
//!
//! 1. advances the instance's last event timestamp,
//! 2. opens a new session if the event is a boundary,
//! 3. enqueues the event for durable write under the open session,
//! 4. appends it to the cache (reviving a stopped instance),
//! 5. folds its token usage into the running totals.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use iterlink_core::{
    ChatEvent, InstanceId, InstanceStatus, PersistedEvent, Session, TokenUsage, now_ms,
};
use iterlink_store::{WriteOp, WriteQueue};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::boundary;
use crate::cache::EventCache;
use crate::protocol::{Inbound, InboundKind, Outbound};
use crate::reconcile::{self, ReconcileOutcome, ReconcilePlan};
use crate::sync_state::SyncState;

/// Side effects the actor carries out after routing.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Write to the transport.
    Send(Outbound),
    /// Hand to application subscribers untouched.
    Forward(Value),
}

/// Per-connection routing state.
pub struct Router {
    sync: SyncState,
    cache: Arc<dyn EventCache>,
    queue: Arc<WriteQueue>,
    running_before_disconnect: BTreeSet<InstanceId>,
    resumed: BTreeSet<InstanceId>,
}

impl Router {
    /// New router with empty sync state.
    pub fn new(cache: Arc<dyn EventCache>, queue: Arc<WriteQueue>) -> Self {
        Self {
            sync: SyncState::default(),
            cache,
            queue,
            running_before_disconnect: BTreeSet::new(),
            resumed: BTreeSet::new(),
        }
    }

    /// Read-only sync state.
    pub fn sync_state(&self) -> &SyncState {
        &self.sync
    }

    /// Change the foreground instance.
    pub fn set_active_instance(&mut self, instance: InstanceId) {
        debug!(instance_id = %instance, "active instance changed");
        self.cache.set_active_instance(instance);
    }

    /// Drop all in-memory sync state.
    pub fn reset(&mut self) {
        self.sync.clear();
        self.running_before_disconnect.clear();
        self.resumed.clear();
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Messages to send right after the transport opens: one catch-up
    /// request per instance with a known timestamp, then auto-resume for
    /// instances that were running when the last connection dropped.
    pub fn on_open(&mut self) -> Vec<Outbound> {
        let mut out: Vec<Outbound> = self
            .sync
            .catch_up_targets()
            .into_iter()
            .map(|(instance_id, last_event_timestamp)| {
                debug!(instance_id = %instance_id, last_event_timestamp, "requesting catch-up");
                Outbound::Reconnect {
                    instance_id,
                    last_event_timestamp,
                }
            })
            .collect();

        for instance_id in std::mem::take(&mut self.running_before_disconnect) {
            info!(instance_id = %instance_id, "instance was running before disconnect, resuming");
            let _ = self.resumed.insert(instance_id.clone());
            out.push(Outbound::ResumeSession { instance_id });
        }
        out
    }

    /// Remember which instances were running when the transport dropped.
    pub fn on_close(&mut self) {
        self.resumed.clear();
        let mut known: BTreeSet<InstanceId> = self.sync.instances().cloned().collect();
        let _ = known.insert(self.cache.active_instance());
        for instance in known {
            if self.cache.status(&instance) == InstanceStatus::Running {
                let _ = self.running_before_disconnect.insert(instance);
            }
        }
    }

    // ── Routing ─────────────────────────────────────────────────────

    /// Route one inbound message.
    pub fn route(&mut self, msg: Inbound) -> Vec<Effect> {
        let active = self.cache.active_instance();
        let instance = msg.instance_id.clone().unwrap_or_else(|| active.clone());

        match msg.kind {
            InboundKind::Connected => return self.on_connected(&msg, &instance),
            InboundKind::PendingEvents => {
                let events = msg.events("events");
                debug!(instance_id = %instance, count = events.len(), "catch-up events received");
                for event in events {
                    self.fold_event(&instance, event);
                }
                if let Some(status) = msg.status() {
                    self.cache.set_status(&instance, status);
                }
            }
            InboundKind::WorkspaceSwitched => {
                let _ = self.reconcile(&instance, msg.events("events"), msg.status());
            }
            InboundKind::StreamEvent | InboundKind::UserMessage => match msg.event() {
                Some(event) => self.fold_event(&instance, event),
                None => debug!(msg_type = %msg.msg_type, "event message without event, dropping"),
            },
            InboundKind::StreamStatus => self.on_status(&msg, &instance),
            InboundKind::StreamOutput => {
                if let Some(line) = msg.text(&["line", "data", "output", "text"]) {
                    self.revive_if_stopped(&instance);
                    self.cache.append_output(&instance, line.to_owned());
                }
            }
            InboundKind::StreamError | InboundKind::Error => {
                let message = msg.text(&["error", "message"]).unwrap_or("unknown error");
                warn!(instance_id = %instance, msg_type = %msg.msg_type, error = message, "server reported error");
                self.cache.set_error(&instance, message.to_owned());
            }
            InboundKind::StreamExit => {
                debug!(instance_id = %instance, code = ?msg.body.get("code"), "instance exited");
                self.cache.set_status(&instance, InstanceStatus::Exited);
            }
            InboundKind::Pong => trace!("pong"),
            InboundKind::Chat => {
                if instance != active {
                    debug!(instance_id = %instance, msg_type = %msg.msg_type, "chat message for inactive instance, dropping");
                    return Vec::new();
                }
                return vec![Effect::Forward(msg.body)];
            }
            InboundKind::Mutation => return vec![Effect::Forward(msg.body)],
            InboundKind::Unknown => debug!(msg_type = %msg.msg_type, "unknown message type, dropping"),
        }
        Vec::new()
    }

    fn on_connected(&mut self, msg: &Inbound, default_instance: &InstanceId) -> Vec<Effect> {
        let entries: Vec<(InstanceId, &Value)> = match msg.body.get("instances").and_then(Value::as_array) {
            Some(list) => list
                .iter()
                .map(|entry| {
                    let id = entry
                        .get("instanceId")
                        .and_then(Value::as_str)
                        .map_or_else(|| default_instance.clone(), InstanceId::from_raw);
                    (id, entry)
                })
                .collect(),
            None => vec![(default_instance.clone(), &msg.body)],
        };

        let mut effects = Vec::new();
        for (instance, entry) in entries {
            let events = entry
                .get("events")
                .map(ChatEvent::list_from_value)
                .unwrap_or_default();
            let status = entry
                .get("status")
                .and_then(Value::as_str)
                .map(InstanceStatus::parse_lenient);
            let _ = self.reconcile(&instance, events, status);

            if reports_saved_state(entry) && self.resumed.insert(instance.clone()) {
                info!(instance_id = %instance, "server reports saved session state, resuming");
                effects.push(Effect::Send(Outbound::ResumeSession {
                    instance_id: instance,
                }));
            }
        }
        effects
    }

    fn on_status(&mut self, msg: &Inbound, instance: &InstanceId) {
        if let Some(status) = msg.status() {
            self.cache.set_status(instance, status);
        }
        let Some(task_id) = msg.text(&["taskId", "task_id"]) else {
            return;
        };
        match self.sync.current_session(instance) {
            Some(session) => self.queue.enqueue(WriteOp::SetTaskId {
                session_id: session.id.clone(),
                task_id: task_id.to_owned(),
            }),
            None => debug!(instance_id = %instance, task_id, "task id without open session, ignoring"),
        }
    }

    // ── Per-event path ──────────────────────────────────────────────

    /// Run one event through the five-step path.
    pub fn fold_event(&mut self, instance: &InstanceId, event: ChatEvent) {
        metrics::counter!("iterlink_events_routed_total").increment(1);

        let fallback_ts = self.sync.last_event_timestamp(instance).unwrap_or(0);
        if let Some(ts) = event.timestamp {
            let _ = self.sync.observe_timestamp(instance, ts);
        }

        if boundary::is_boundary(&event) {
            let _ = self.on_boundary(instance, &event);
        }

        match self.sync.current_session(instance).map(|s| s.id.clone()) {
            Some(session_id) => {
                let occurrence = match event.id {
                    Some(_) => 0,
                    None => self.sync.next_occurrence(instance, &event.fingerprint()),
                };
                self.queue.enqueue(WriteOp::PutEvent(PersistedEvent::at_position(
                    event.clone(),
                    session_id,
                    instance.clone(),
                    occurrence,
                    fallback_ts,
                )));
            }
            None => debug!(
                instance_id = %instance,
                event_type = %event.event_type,
                "no open session, event not persisted"
            ),
        }

        let usage = TokenUsage::from_event(&event);
        self.revive_if_stopped(instance);
        self.cache.add_event(instance, event);

        if let Some(usage) = usage {
            self.cache.add_token_usage(instance, usage);
        }
    }

    /// Single entry for a session boundary: allocate the session, record it
    /// durably, and restart the usage totals.
    fn on_boundary(&mut self, instance: &InstanceId, boundary: &ChatEvent) -> Session {
        let session = self.sync.allocate_session(instance, boundary, now_ms());
        info!(
            instance_id = %instance,
            session_id = %session.id,
            started_at = session.started_at,
            "session started"
        );
        self.queue.enqueue(WriteOp::EnsureSession {
            instance_id: instance.clone(),
            session: session.clone(),
        });
        self.cache.reset_token_usage(instance);
        session
    }

    fn revive_if_stopped(&self, instance: &InstanceId) {
        if self.cache.status(instance) == InstanceStatus::Stopped {
            debug!(instance_id = %instance, "data from stopped instance, marking running");
            self.cache.set_status(instance, InstanceStatus::Running);
        }
    }

    // ── Reconciliation ──────────────────────────────────────────────

    /// Compare server history against the cache, repair the local store if
    /// it is behind, then make the server list authoritative in the cache.
    pub fn reconcile(
        &mut self,
        instance: &InstanceId,
        events: Vec<ChatEvent>,
        status: Option<InstanceStatus>,
    ) -> ReconcileOutcome {
        if let Some(newest) = events.iter().filter_map(|e| e.timestamp).max() {
            let _ = self.sync.observe_timestamp(instance, newest);
        }
        if self.sync.current_session(instance).is_none() {
            if let Some(latest) = boundary::latest_boundary(&events) {
                let _ = self.on_boundary(instance, latest);
            }
        }

        let local = self.cache.event_count(instance);
        let server = events.len();
        let outcome = match reconcile::plan(local, server) {
            ReconcilePlan::FirstLoad => ReconcileOutcome::FirstLoad,
            ReconcilePlan::InSync => ReconcileOutcome::InSync,
            ReconcilePlan::LocalAhead { surplus } => {
                debug!(instance_id = %instance, local, server, surplus, "local history ahead of server, leaving as is");
                ReconcileOutcome::LocalAhead
            }
            ReconcilePlan::Repair { gap } => {
                warn!(
                    instance_id = %instance,
                    local,
                    server,
                    gap,
                    "local history behind server: {local} local vs {server} server events"
                );
                self.repair(instance, &events, gap)
            }
        };

        self.queue.enqueue(WriteOp::MarkReconciled {
            instance_id: instance.clone(),
            at: now_ms(),
            repair_size: outcome.repair_size(),
        });
        self.cache.set_events(instance, events);
        if let Some(status) = status {
            self.cache.set_status(instance, status);
        }
        outcome
    }

    fn repair(&self, instance: &InstanceId, events: &[ChatEvent], gap: usize) -> ReconcileOutcome {
        let Some(session) = self.sync.current_session(instance) else {
            warn!(instance_id = %instance, gap, "no open session, repair skipped");
            return ReconcileOutcome::RepairSkipped { gap };
        };
        // Same keys the live path derives, so a replay overwrites rather
        // than duplicates.
        let mut occurrences: HashMap<String, u32> = HashMap::new();
        let mut last_ts = 0;
        for event in events {
            let occurrence = match event.id {
                Some(_) => 0,
                None => {
                    let seen = occurrences.entry(event.fingerprint()).or_insert(0);
                    *seen += 1;
                    *seen - 1
                }
            };
            self.queue.enqueue(WriteOp::PutEvent(PersistedEvent::at_position(
                event.clone(),
                session.id.clone(),
                instance.clone(),
                occurrence,
                last_ts,
            )));
            last_ts = event.timestamp.unwrap_or(last_ts);
        }
        metrics::counter!("iterlink_repairs_total").increment(1);
        info!(
            instance_id = %instance,
            session_id = %session.id,
            enqueued = events.len(),
            "repair writes enqueued"
        );
        ReconcileOutcome::Repaired {
            gap,
            enqueued: events.len(),
        }
    }
}

fn reports_saved_state(entry: &Value) -> bool {
    entry.get("hasSavedState").and_then(Value::as_bool).unwrap_or(false)
        || entry.get("savedSession").is_some_and(|v| !v.is_null())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use iterlink_core::logging::capture_logs;
    use iterlink_core::{ConnectionStatus, EventId, SessionId};
    use iterlink_store::{EventStore, WriteQueueConfig};
    use serde_json::json;
    use tracing::Level;

    use super::*;
    use crate::cache::MemoryCache;

    struct Harness {
        router: Router,
        cache: Arc<MemoryCache>,
        store: Arc<EventStore>,
        queue: Arc<WriteQueue>,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(EventStore::in_memory().unwrap());
            let queue = Arc::new(WriteQueue::start(store.clone(), WriteQueueConfig::default()));
            let cache = Arc::new(MemoryCache::new(InstanceId::from_raw("A")));
            let router = Router::new(cache.clone(), queue.clone());
            Self {
                router,
                cache,
                store,
                queue,
            }
        }

        fn route(&mut self, msg: Value) -> Vec<Effect> {
            self.router.route(Inbound::from_value(msg).unwrap())
        }

        async fn stored(&self, instance: &str) -> u64 {
            self.queue.flush().await;
            self.store.count_events(&InstanceId::from_raw(instance)).unwrap()
        }
    }

    fn id(s: &str) -> InstanceId {
        InstanceId::from_raw(s)
    }

    fn event_msg(instance: Option<&str>, event: Value) -> Value {
        let mut msg = json!({ "type": "loop:event", "event": event });
        if let Some(i) = instance {
            msg["instanceId"] = json!(i);
        }
        msg
    }

    fn history(n: usize) -> Vec<Value> {
        (1..=n)
            .map(|i| {
                let t = if i == 1 { "session_start" } else { "output" };
                json!({ "type": t, "id": format!("evt-{i}"), "timestamp": i * 100 })
            })
            .collect()
    }

    fn cached(n: usize) -> Vec<ChatEvent> {
        (1..=n)
            .map(|i| ChatEvent::new("output", Some(i as i64)).with_id(format!("local-{i}")))
            .collect()
    }

    #[tokio::test]
    async fn events_route_to_their_instance() {
        let mut h = Harness::new();
        let _ = h.route(event_msg(Some("B"), json!({"type": "output", "id": "b1", "timestamp": 1})));
        let _ = h.route(event_msg(None, json!({"type": "output", "id": "a1", "timestamp": 2})));

        let ids = |i: &str| -> Vec<String> {
            h.cache
                .events(&id(i))
                .into_iter()
                .filter_map(|e| e.id.map(|x| x.to_string()))
                .collect()
        };
        assert_eq!(ids("A"), vec!["a1"]);
        assert_eq!(ids("B"), vec!["b1"]);
    }

    #[tokio::test]
    async fn untagged_events_follow_active_instance() {
        let mut h = Harness::new();
        h.router.set_active_instance(id("C"));
        let _ = h.route(event_msg(None, json!({"type": "output", "timestamp": 1})));
        assert_eq!(h.cache.event_count(&id("C")), 1);
        assert_eq!(h.cache.event_count(&id("A")), 0);
    }

    #[tokio::test]
    async fn boundary_opens_session_before_persisting() {
        let mut h = Harness::new();
        let _ = h.route(event_msg(None, json!({"type": "session_start", "id": "s0", "timestamp": 10})));
        let _ = h.route(event_msg(None, json!({"type": "output", "id": "o1", "timestamp": 11})));
        assert_eq!(h.stored("A").await, 2);

        let boundary = h.store.get_event(&EventId::from_raw("s0")).unwrap().unwrap();
        assert_eq!(boundary.session_id, SessionId::from_raw("A-10"));
        let session = h.store.get_session(&SessionId::from_raw("A-10")).unwrap().unwrap();
        assert_eq!(session.started_at, 10);
    }

    fn idless_session() -> Vec<Value> {
        vec![
            json!({"type": "session_start", "id": "s0", "timestamp": 10}),
            json!({"type": "output", "text": "first", "timestamp": 11}),
            json!({"type": "output", "text": "second", "timestamp": 11}),
            json!({"type": "user_message", "text": "hi"}),
            json!({"type": "user_message", "text": "hi"}),
        ]
    }

    #[tokio::test]
    async fn idless_events_are_all_persisted_in_receive_order() {
        let mut h = Harness::new();
        for event in idless_session() {
            let _ = h.route(event_msg(None, event));
        }
        assert_eq!(h.cache.event_count(&id("A")), 5);
        assert_eq!(h.stored("A").await, 5);

        let rows = h.store.recent_events(&id("A"), 10).unwrap();
        let order: Vec<_> = rows
            .iter()
            .map(|r| {
                let text = r.event.payload.get("text").and_then(Value::as_str).unwrap_or("");
                format!("{}:{text}", r.event_type)
            })
            .collect();
        assert_eq!(
            order,
            vec!["session_start:", "output:first", "output:second", "user_message:hi", "user_message:hi"]
        );
        assert!(rows.iter().all(|r| r.timestamp >= 10));
    }

    #[tokio::test]
    async fn repairing_live_history_does_not_duplicate_rows() {
        let mut h = Harness::new();
        for event in idless_session() {
            let _ = h.route(event_msg(None, event));
        }
        assert_eq!(h.stored("A").await, 5);

        h.cache.replace_events(&id("A"), cached(2));
        let events = ChatEvent::list_from_value(&json!(idless_session()));
        let outcome = h.router.reconcile(&id("A"), events, None);
        assert_matches!(outcome, ReconcileOutcome::Repaired { enqueued: 5, .. });
        assert_eq!(h.stored("A").await, 5);
    }

    #[tokio::test]
    async fn events_before_any_boundary_are_cached_not_persisted() {
        let mut h = Harness::new();
        let _ = h.route(event_msg(None, json!({"type": "output", "id": "o1", "timestamp": 1})));
        assert_eq!(h.cache.event_count(&id("A")), 1);
        assert_eq!(h.stored("A").await, 0);
    }

    #[tokio::test]
    async fn server_session_id_is_used() {
        let mut h = Harness::new();
        let _ = h.route(event_msg(
            None,
            json!({"type": "iteration_start", "sessionId": "srv-7", "timestamp": 5}),
        ));
        assert_eq!(
            h.router.sync_state().current_session(&id("A")).unwrap().id.as_str(),
            "srv-7"
        );
    }

    #[tokio::test]
    async fn timestamp_tracks_newest_event() {
        let mut h = Harness::new();
        for ts in [50, 20, 80] {
            let _ = h.route(event_msg(None, json!({"type": "output", "timestamp": ts})));
        }
        let _ = h.route(event_msg(None, json!({"type": "output", "timestamp": "soon"})));
        assert_eq!(h.router.sync_state().last_event_timestamp(&id("A")), Some(80));
    }

    #[tokio::test]
    async fn stopped_instance_revived_by_data() {
        let mut h = Harness::new();
        h.cache.set_status(&id("A"), InstanceStatus::Stopped);
        let _ = h.route(json!({"type": "loop:output", "line": "still going"}));
        assert_eq!(h.cache.status(&id("A")), InstanceStatus::Running);
        assert_eq!(h.cache.view(&id("A")).output, vec!["still going"]);

        h.cache.set_status(&id("B"), InstanceStatus::Stopped);
        let _ = h.route(event_msg(Some("B"), json!({"type": "output"})));
        assert_eq!(h.cache.status(&id("B")), InstanceStatus::Running);
    }

    #[tokio::test]
    async fn token_usage_folds_and_resets_on_boundary() {
        let mut h = Harness::new();
        let usage = json!({"inputTokens": 100, "outputTokens": 20});
        let _ = h.route(event_msg(None, json!({"type": "turn_end", "usage": usage})));
        let _ = h.route(event_msg(None, json!({"type": "turn_end", "usage": usage})));
        assert_eq!(h.cache.view(&id("A")).usage.input_tokens, 200);

        let _ = h.route(event_msg(None, json!({"type": "session_start", "timestamp": 9})));
        assert!(h.cache.view(&id("A")).usage.is_empty());
    }

    #[tokio::test]
    async fn status_messages_update_cache_and_task_id() {
        let mut h = Harness::new();
        let _ = h.route(event_msg(None, json!({"type": "session_start", "timestamp": 3})));
        let _ = h.route(json!({"type": "loop:status", "status": "running", "taskId": "task-42"}));
        assert_eq!(h.cache.status(&id("A")), InstanceStatus::Running);

        h.queue.flush().await;
        let session = h.store.get_session(&SessionId::from_raw("A-3")).unwrap().unwrap();
        assert_eq!(session.task_id.as_deref(), Some("task-42"));

        let _ = h.route(json!({"type": "loop:exit", "code": 0}));
        assert_eq!(h.cache.status(&id("A")), InstanceStatus::Exited);
    }

    #[tokio::test]
    async fn errors_recorded_per_instance() {
        let mut h = Harness::new();
        let _ = h.route(json!({"type": "loop:error", "instanceId": "B", "error": "crashed"}));
        let _ = h.route(json!({"type": "error", "message": "bad request"}));
        assert_eq!(h.cache.view(&id("B")).last_error.as_deref(), Some("crashed"));
        assert_eq!(h.cache.view(&id("A")).last_error.as_deref(), Some("bad request"));
    }

    #[tokio::test]
    async fn chat_only_for_active_instance() {
        let mut h = Harness::new();
        let msg = json!({"type": "chat:delta", "instanceId": "B", "text": "hi"});
        assert!(h.route(msg).is_empty());

        let msg = json!({"type": "chat:delta", "text": "hi"});
        assert_eq!(h.route(msg.clone()), vec![Effect::Forward(msg)]);
    }

    #[tokio::test]
    async fn mutations_forwarded_and_unknown_dropped() {
        let mut h = Harness::new();
        let msg = json!({"type": "task_updated", "id": 4});
        assert_eq!(h.route(msg.clone()), vec![Effect::Forward(msg)]);
        assert!(h.route(json!({"type": "mystery"})).is_empty());
        assert!(h.route(json!({"type": "pong"})).is_empty());
    }

    #[tokio::test]
    async fn reconcile_under_count_repairs_and_warns_once() {
        let mut h = Harness::new();
        let (logs, _guard) = capture_logs();
        h.cache.replace_events(&id("A"), cached(2));

        let _ = h.route(json!({"type": "connected", "events": history(5)}));

        let warnings = logs.matching(Level::WARN, "local history behind server");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field("local"), Some("2"));
        assert_eq!(warnings[0].field("server"), Some("5"));
        assert_eq!(warnings[0].field("gap"), Some("3"));

        assert_eq!(h.stored("A").await, 5);
        let ids: Vec<_> = h
            .cache
            .events(&id("A"))
            .into_iter()
            .map(|e| e.id.unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["evt-1", "evt-2", "evt-3", "evt-4", "evt-5"]);
        let meta = h.store.sync_meta(&id("A")).unwrap().unwrap();
        assert_eq!(meta.last_repair_size, 5);
    }

    #[tokio::test]
    async fn reconcile_equal_counts_is_silent() {
        let mut h = Harness::new();
        let (logs, _guard) = capture_logs();
        h.cache.replace_events(&id("A"), cached(5));
        let events = ChatEvent::list_from_value(&json!(history(5)));
        let outcome = h.router.reconcile(&id("A"), events, None);
        assert_eq!(outcome, ReconcileOutcome::InSync);
        assert_eq!(logs.count_at_level(Level::WARN), 0);
        assert_eq!(h.stored("A").await, 0);
    }

    #[tokio::test]
    async fn reconcile_first_load_is_silent() {
        let mut h = Harness::new();
        let (logs, _guard) = capture_logs();
        let events = ChatEvent::list_from_value(&json!(history(5)));
        let outcome = h.router.reconcile(&id("A"), events, Some(InstanceStatus::Running));
        assert_eq!(outcome, ReconcileOutcome::FirstLoad);
        assert_eq!(logs.count_at_level(Level::WARN), 0);
        assert_eq!(h.stored("A").await, 0);
        assert_eq!(h.store.list_sessions(&id("A")).unwrap().len(), 1);
        assert_eq!(h.store.sync_meta(&id("A")).unwrap().unwrap().last_repair_size, 0);
        assert_eq!(h.cache.event_count(&id("A")), 5);
        assert_eq!(h.cache.status(&id("A")), InstanceStatus::Running);
        assert!(h.cache.view(&id("A")).synced);
    }

    #[tokio::test]
    async fn reconcile_local_ahead_takes_no_action() {
        let mut h = Harness::new();
        let (logs, _guard) = capture_logs();
        h.cache.replace_events(&id("A"), cached(7));
        let events = ChatEvent::list_from_value(&json!(history(5)));
        assert_eq!(
            h.router.reconcile(&id("A"), events, None),
            ReconcileOutcome::LocalAhead
        );
        assert_eq!(logs.count_at_level(Level::WARN), 0);
        assert_eq!(h.cache.event_count(&id("A")), 5);
    }

    #[tokio::test]
    async fn repair_skipped_without_session_but_still_warns() {
        let mut h = Harness::new();
        let (logs, _guard) = capture_logs();
        h.cache.replace_events(&id("A"), cached(2));
        let events: Vec<_> = (1..=5)
            .map(|i| ChatEvent::new("output", Some(i)).with_id(format!("evt-{i}")))
            .collect();
        let outcome = h.router.reconcile(&id("A"), events, None);
        assert_matches!(outcome, ReconcileOutcome::RepairSkipped { gap: 3 });
        assert!(logs.has_event(Level::WARN, "local history behind server"));
        assert!(logs.has_event(Level::WARN, "repair skipped"));
        assert_eq!(h.stored("A").await, 0);
        assert_eq!(h.cache.event_count(&id("A")), 5);
    }

    #[tokio::test]
    async fn reconcile_advances_timestamp() {
        let mut h = Harness::new();
        let events = ChatEvent::list_from_value(&json!(history(3)));
        let _ = h.router.reconcile(&id("A"), events, None);
        assert_eq!(h.router.sync_state().last_event_timestamp(&id("A")), Some(300));
    }

    #[tokio::test]
    async fn connected_with_instance_list() {
        let mut h = Harness::new();
        let effects = h.route(json!({
            "type": "connected",
            "instances": [
                {"instanceId": "A", "events": history(2), "status": "running"},
                {"instanceId": "B", "events": history(3), "hasSavedState": true},
            ]
        }));
        assert_eq!(h.cache.event_count(&id("A")), 2);
        assert_eq!(h.cache.event_count(&id("B")), 3);
        assert_eq!(
            effects,
            vec![Effect::Send(Outbound::ResumeSession { instance_id: id("B") })]
        );
    }

    #[tokio::test]
    async fn pending_events_fold_through_event_path() {
        let mut h = Harness::new();
        let _ = h.route(json!({
            "type": "pending_events",
            "instanceId": "B",
            "events": history(4),
            "status": "running",
        }));
        assert_eq!(h.cache.event_count(&id("B")), 4);
        assert_eq!(h.cache.status(&id("B")), InstanceStatus::Running);
        assert_eq!(h.router.sync_state().last_event_timestamp(&id("B")), Some(400));
        assert_eq!(h.stored("B").await, 4);
    }

    #[tokio::test]
    async fn open_requests_catch_up_and_resumes_running_instances() {
        let mut h = Harness::new();
        let _ = h.route(event_msg(Some("A"), json!({"type": "output", "timestamp": 50})));
        let _ = h.route(event_msg(Some("B"), json!({"type": "output", "timestamp": 70})));
        h.cache.set_status(&id("B"), InstanceStatus::Running);

        h.router.on_close();
        let out = h.router.on_open();
        assert_eq!(
            out,
            vec![
                Outbound::Reconnect { instance_id: id("A"), last_event_timestamp: 50 },
                Outbound::Reconnect { instance_id: id("B"), last_event_timestamp: 70 },
                Outbound::ResumeSession { instance_id: id("B") },
            ]
        );

        // Already resumed on this connection: saved state does not resume twice.
        let effects = h.route(json!({"type": "connected", "instanceId": "B", "hasSavedState": true}));
        assert!(effects.is_empty());

        // Resume is one-shot per disconnect.
        h.cache.set_status(&id("B"), InstanceStatus::Idle);
        h.router.on_close();
        assert_eq!(h.router.on_open().len(), 2);
    }

    #[tokio::test]
    async fn reset_forgets_sync_state() {
        let mut h = Harness::new();
        let _ = h.route(event_msg(None, json!({"type": "session_start", "timestamp": 1})));
        h.router.reset();
        assert!(h.router.on_open().is_empty());
        assert!(h.router.sync_state().current_session(&id("A")).is_none());
        assert_eq!(h.cache.connection_status(), ConnectionStatus::Disconnected);
    }
}
