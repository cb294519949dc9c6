//! # iterlink-client
//!
//! The live half of the sync engine: one long-lived connection to the
//! event server, and everything that happens to a message after it arrives.
//!
//! - **[`manager`]**: actor owning the transport, the connection state machine,
//!   reconnect backoff and heartbeat
//! - **[`router`]**: classification and the per-event path (timestamp,
//!   session boundary, persistence, cache, token totals)
//! - **[`reconcile`]**: local/server history comparison and repair
//! - **[`cache`]**: the UI cache interface and an in-memory implementation
//! - **[`engine`]**: [`SyncEngine`], which wires store, queue, cache and manager

#![deny(unsafe_code)]

pub mod backoff;
pub mod boundary;
pub mod cache;
pub mod engine;
pub mod errors;
pub mod manager;
pub mod protocol;
pub mod reconcile;
pub mod router;
pub mod state;
pub mod sync_state;
pub mod transport;

pub use cache::{EventCache, MemoryCache};
pub use engine::SyncEngine;
pub use errors::{ClientError, StateError, TransportError};
pub use manager::{ConnectionManager, ManagerConfig};
pub use protocol::{Inbound, InboundKind, Outbound};
pub use reconcile::ReconcileOutcome;
pub use router::{Effect, Router};
pub use state::ConnectionState;
pub use transport::{Connector, TransportChannels, TransportFrame, WsConnector};
