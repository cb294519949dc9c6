//! Branded string identifiers.
//!
//! All three ids are opaque strings chosen elsewhere: instance ids by the UI,
//! event ids by the server, and session ids either by the server or derived
//! from the instance id and session start time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing string without validation.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id!(
    /// A logical worker/session host tracked independently by the client.
    InstanceId
);
branded_id!(
    /// A contiguous run of events for one instance.
    SessionId
);
branded_id!(
    /// Server-assigned (or derived) event identity; the dedup key.
    EventId
);

impl InstanceId {
    /// Id used when the server omits `instanceId` and nothing else is active.
    pub const DEFAULT: &'static str = "default";

    /// The `"default"` instance.
    pub fn default_instance() -> Self {
        Self::from_raw(Self::DEFAULT)
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::default_instance()
    }
}

impl SessionId {
    /// Derive a session id for an instance that started at `started_at` (ms).
    pub fn derive(instance: &InstanceId, started_at: i64) -> Self {
        Self(format!("{instance}-{started_at}"))
    }
}
