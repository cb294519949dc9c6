//! Local/server history comparison.
//!
//! Only an under-count (`0 < local < server`) is treated as local data loss.
//! A local count above the server's is left alone.

/// Decision for one reconciliation pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcilePlan {
    /// Nothing cached yet; this is the first load.
    FirstLoad,
    /// Counts match.
    InSync,
    /// The cache holds more than the server sent.
    LocalAhead {
        /// Extra local events.
        surplus: usize,
    },
    /// The cache is missing events the server has.
    Repair {
        /// Missing events.
        gap: usize,
    },
}

/// Compare cached and server counts.
pub fn plan(local: usize, server: usize) -> ReconcilePlan {
    if local == 0 {
        ReconcilePlan::FirstLoad
    } else if local < server {
        ReconcilePlan::Repair { gap: server - local }
    } else if local > server {
        ReconcilePlan::LocalAhead {
            surplus: local - server,
        }
    } else {
        ReconcilePlan::InSync
    }
}

/// What a reconciliation pass did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// First load, nothing compared.
    FirstLoad,
    /// Counts matched.
    InSync,
    /// Local held more; left alone.
    LocalAhead,
    /// Server history replayed through the write queue.
    Repaired {
        /// Missing events detected.
        gap: usize,
        /// Writes enqueued (the whole server list).
        enqueued: usize,
    },
    /// Gap detected but no session is open to write under.
    RepairSkipped {
        /// Missing events detected.
        gap: usize,
    },
}

impl ReconcileOutcome {
    /// Events replayed, for bookkeeping.
    pub fn repair_size(self) -> u64 {
        match self {
            Self::Repaired { enqueued, .. } => enqueued as u64,
            _ => 0,
        }
    }
}
