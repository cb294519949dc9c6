//! Connection state machine.
//!
//! `Disconnected → Connecting → Connected → Disconnected → …`. Every change
//! goes through [`ConnectionState::apply`]; anything not listed there is
//! rejected.

use iterlink_core::ConnectionStatus;

use crate::errors::StateError;

/// Transport state, one per manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport.
    #[default]
    Disconnected,
    /// Transport open in flight.
    Connecting,
    /// Transport open.
    Connected,
}

/// Inputs to the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Start opening a transport.
    Connect,
    /// The transport finished opening.
    Opened,
    /// The transport closed, failed to open, or was torn down on request.
    Closed,
}

impl ConnectionState {
    /// Next state for `event`, or an error if the move is illegal.
    pub fn apply(self, event: Transition) -> Result<Self, StateError> {
        use ConnectionState::{Connected, Connecting, Disconnected};
        match (self, event) {
            (Disconnected, Transition::Connect) => Ok(Connecting),
            (Connecting, Transition::Opened) => Ok(Connected),
            (Connecting | Connected, Transition::Closed) => Ok(Disconnected),
            (from, event) => Err(StateError { from, event }),
        }
    }

    /// Status shown to the UI cache.
    pub fn as_status(self) -> ConnectionStatus {
        match self {
            Self::Disconnected => ConnectionStatus::Disconnected,
            Self::Connecting => ConnectionStatus::Connecting,
            Self::Connected => ConnectionStatus::Connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn happy_path_cycle() {
        let s = ConnectionState::Disconnected;
        let s = s.apply(Transition::Connect).unwrap();
        assert_eq!(s, ConnectionState::Connecting);
        let s = s.apply(Transition::Opened).unwrap();
        assert_eq!(s, ConnectionState::Connected);
        let s = s.apply(Transition::Closed).unwrap();
        assert_eq!(s, ConnectionState::Disconnected);
    }

    #[test]
    fn failed_open_returns_to_disconnected() {
        let s = ConnectionState::Connecting.apply(Transition::Closed).unwrap();
        assert_eq!(s, ConnectionState::Disconnected);
    }

    #[test]
    fn illegal_transitions_rejected() {
        for (from, event) in [
            (ConnectionState::Connected, Transition::Connect),
            (ConnectionState::Connecting, Transition::Connect),
            (ConnectionState::Connected, Transition::Opened),
            (ConnectionState::Disconnected, Transition::Opened),
            (ConnectionState::Disconnected, Transition::Closed),
        ] {
            assert_matches!(from.apply(event), Err(StateError { from: f, event: e }) if f == from && e == event);
        }
    }

    #[test]
    fn maps_to_cache_status() {
        assert_eq!(
            ConnectionState::Connecting.as_status(),
            ConnectionStatus::Connecting
        );
    }
}
