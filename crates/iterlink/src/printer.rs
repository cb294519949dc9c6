//! Stdout rendering for the CLI.

use std::fmt::Write as _;

use iterlink_client::{EventCache, MemoryCache};
use iterlink_core::{ChatEvent, ConnectionStatus, InstanceId, InstanceStatus, PersistedEvent, TokenUsage};
use iterlink_store::EventStore;
use serde_json::json;

/// Cache that prints every event it receives as one JSON line.
pub struct PrintingCache {
    inner: MemoryCache,
}

impl PrintingCache {
    /// Wrap `inner`.
    pub fn new(inner: MemoryCache) -> Self {
        Self { inner }
    }
}

fn print_event(instance: &InstanceId, event: &ChatEvent) {
    println!("{}", json!({ "instanceId": instance, "event": event.to_value() }));
}

impl EventCache for PrintingCache {
    fn active_instance(&self) -> InstanceId {
        self.inner.active_instance()
    }

    fn set_active_instance(&self, instance: InstanceId) {
        self.inner.set_active_instance(instance);
    }

    fn event_count(&self, instance: &InstanceId) -> usize {
        self.inner.event_count(instance)
    }

    fn status(&self, instance: &InstanceId) -> InstanceStatus {
        self.inner.status(instance)
    }

    fn add_event(&self, instance: &InstanceId, event: ChatEvent) {
        print_event(instance, &event);
        self.inner.add_event(instance, event);
    }

    fn set_events(&self, instance: &InstanceId, events: Vec<ChatEvent>) {
        for event in &events {
            print_event(instance, event);
        }
        self.inner.set_events(instance, events);
    }

    fn replace_events(&self, instance: &InstanceId, events: Vec<ChatEvent>) {
        self.inner.replace_events(instance, events);
    }

    fn append_output(&self, instance: &InstanceId, line: String) {
        println!("{}", json!({ "instanceId": instance, "output": line }));
        self.inner.append_output(instance, line);
    }

    fn set_status(&self, instance: &InstanceId, status: InstanceStatus) {
        self.inner.set_status(instance, status);
    }

    fn set_connection_status(&self, status: ConnectionStatus) {
        self.inner.set_connection_status(status);
    }

    fn set_error(&self, instance: &InstanceId, message: String) {
        eprintln!("[{instance}] error: {message}");
        self.inner.set_error(instance, message);
    }

    fn connection_failed(&self, attempts: u32) {
        eprintln!("connection permanently failed after {attempts} attempts");
        self.inner.connection_failed(attempts);
    }

    fn add_token_usage(&self, instance: &InstanceId, usage: TokenUsage) {
        self.inner.add_token_usage(instance, usage);
    }

    fn reset_token_usage(&self, instance: &InstanceId) {
        self.inner.reset_token_usage(instance);
    }

    fn set_persistence_error(&self, message: String, failed_count: u64) {
        eprintln!("persistence error ({failed_count} failed): {message}");
        self.inner.set_persistence_error(message, failed_count);
    }
}

fn format_ts(ts: Option<i64>) -> String {
    ts.and_then(chrono::DateTime::from_timestamp_millis)
        .map_or_else(|| "-".to_owned(), |dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
}

/// One persisted event as a line of text.
pub fn event_line(event: &PersistedEvent) -> String {
    format!(
        "{}  {:<24} {}  {}",
        format_ts(Some(event.timestamp)),
        event.event_type,
        event.session_id,
        event.id
    )
}

/// Store summary. With `instance`, also lists that instance's sessions.
pub fn stats(store: &EventStore, instance: Option<&InstanceId>) -> iterlink_store::Result<String> {
    let mut out = String::new();
    let summaries = store.instance_summaries()?;
    let total: u64 = summaries.iter().map(|s| s.event_count).sum();
    let _ = writeln!(out, "{} instances, {total} events", summaries.len());

    for summary in summaries
        .iter()
        .filter(|s| instance.is_none_or(|i| *i == s.instance_id))
    {
        let repaired = summary.meta.as_ref().map_or(0, |m| m.repair_count);
        let _ = writeln!(
            out,
            "{}: {} sessions, {} events, latest {}, {} repairs",
            summary.instance_id,
            summary.session_count,
            summary.event_count,
            format_ts(summary.latest_timestamp),
            repaired,
        );
    }

    if let Some(instance) = instance {
        for s in store.session_summaries(instance)? {
            let _ = writeln!(
                out,
                "  {}  started {}  {} events{}",
                s.session.id,
                format_ts(Some(s.session.started_at)),
                s.event_count,
                s.session
                    .task_id
                    .as_deref()
                    .map(|t| format!("  task {t}"))
                    .unwrap_or_default(),
            );
        }
    }
    Ok(out)
}
