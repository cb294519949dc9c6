//! Session boundary detection.

use iterlink_core::ChatEvent;

/// Event types that open a new session.
pub const BOUNDARY_TYPES: &[&str] = &["session_start", "session.start", "iteration_start"];

/// Whether `event` starts a new session.
pub fn is_boundary(event: &ChatEvent) -> bool {
    BOUNDARY_TYPES.contains(&event.event_type.as_str())
}

/// The last boundary event in `events`, if any.
pub fn latest_boundary(events: &[ChatEvent]) -> Option<&ChatEvent> {
    events.iter().rev().find(|e| is_boundary(e))
}
