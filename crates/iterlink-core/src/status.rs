//! Instance and connection status.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// High-level status of an instance as reported by the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Nothing running.
    #[default]
    Idle,
    /// An iteration is in progress.
    Running,
    /// Stopped by the user.
    Stopped,
    /// The agent process exited.
    Exited,
    /// The agent reported an error.
    Error,
}

impl InstanceStatus {
    /// Wire string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Error => "error",
        }
    }

    /// Lenient parse: unknown strings map to [`InstanceStatus::Idle`].
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "running" | "active" | "started" => Ok(Self::Running),
            "stopped" | "paused" => Ok(Self::Stopped),
            "exited" | "completed" | "finished" => Ok(Self::Exited),
            "error" | "failed" => Ok(Self::Error),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection status as shown to the UI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No transport.
    #[default]
    Disconnected,
    /// Transport opening.
    Connecting,
    /// Transport open.
    Connected,
    /// Backoff exhausted. Terminal until the user reconnects.
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        })
    }
}
