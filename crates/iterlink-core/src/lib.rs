//! # iterlink-core
//!
//! Foundation types shared by every iterlink crate:
//!
//! - **Branded IDs**: `InstanceId`, `SessionId`, `EventId` as newtypes for type safety
//! - **Events**: [`ChatEvent`], the opaque timestamped record streamed by the server
//! - **Sessions**: [`Session`] and [`PersistedEvent`], the durable form of an event
//! - **Token usage**: running totals folded from event usage fields
//! - **Status**: instance and connection status enums
//! - **Retry**: exponential backoff with jitter
//! - **Logging**: `tracing` subscriber setup and a capture layer for tests

#![deny(unsafe_code)]

pub mod event;
pub mod ids;
pub mod logging;
pub mod retry;
pub mod session;
pub mod status;
pub mod tokens;

pub use event::ChatEvent;
pub use ids::{EventId, InstanceId, SessionId};
pub use session::{PersistedEvent, Session};
pub use status::{ConnectionStatus, InstanceStatus};
pub use tokens::TokenUsage;

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
