//! Client error types.

use iterlink_store::StoreError;
use thiserror::Error;

use crate::state::{ConnectionState, Transition};

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be opened.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The transport closed underneath us.
    #[error("transport closed")]
    Closed,
    /// The peer violated the framing protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// An illegal connection state transition.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal transition {event:?} from {from:?}")]
pub struct StateError {
    /// State the machine was in.
    pub from: ConnectionState,
    /// Rejected input.
    pub event: Transition,
}

/// Errors surfaced by [`SyncEngine`](crate::SyncEngine) setup.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Local store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Internal error (e.g. a background task that never returned).
    #[error("internal error: {0}")]
    Internal(String),
}
