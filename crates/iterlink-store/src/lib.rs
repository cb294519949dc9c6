//! # iterlink-store
//!
//! Durable local persistence for streamed session events.
//!
//! - **[`sqlite`]**: connection pool, embedded migrations, stateless repositories
//! - **[`EventStore`]**: facade over the pool; every write is an idempotent upsert
//! - **[`WriteQueue`]**: single-worker FIFO that retries failed writes and
//!   reports exhausted ones through a hook instead of failing the caller

#![deny(unsafe_code)]

pub mod errors;
pub mod sqlite;
pub mod store;
pub mod write_queue;

pub use errors::{Result, StoreError};
pub use sqlite::{ConnectionConfig, ConnectionPool, new_file, new_in_memory, run_migrations};
pub use store::{EventStore, InstanceSummary, SessionSummary};
pub use write_queue::{
    EventWriter, WriteFailure, WriteOp, WriteQueue, WriteQueueConfig, WriteStats,
};
