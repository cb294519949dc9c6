//! High-level [`EventStore`] over the connection pool.
//!
//! All methods are synchronous; async callers go through the
//! [`WriteQueue`](crate::WriteQueue), which runs them on the blocking pool.

use iterlink_core::{EventId, InstanceId, PersistedEvent, Session, SessionId};
use iterlink_settings::StoreSettings;
use tracing::{debug, info};

use crate::errors::Result;
use crate::sqlite::repositories::{EventRepo, SessionRepo, SessionRow, SyncMeta, SyncMetaRepo};
use crate::sqlite::{self, ConnectionConfig, ConnectionPool, PooledConnection};
use crate::write_queue::{EventWriter, WriteOp};

/// Per-instance totals for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceSummary {
    /// Instance id.
    pub instance_id: InstanceId,
    /// Number of sessions.
    pub session_count: u64,
    /// Number of persisted events.
    pub event_count: u64,
    /// Newest persisted timestamp.
    pub latest_timestamp: Option<i64>,
    /// Bookkeeping row, if any.
    pub meta: Option<SyncMeta>,
}

/// Per-session totals for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    /// The session row.
    pub session: SessionRow,
    /// Number of persisted events in it.
    pub event_count: u64,
}

/// Local event store.
#[derive(Clone)]
pub struct EventStore {
    pool: ConnectionPool,
}

impl EventStore {
    /// Wrap an already-migrated pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Open (or create) the file database described by `settings` and migrate it.
    pub fn open(settings: &StoreSettings) -> Result<Self> {
        let pool = sqlite::new_file(&settings.db_path, &ConnectionConfig::from(settings))?;
        let applied = sqlite::run_migrations(&*pool.get()?)?;
        info!(path = %settings.db_path.display(), applied, "event store opened");
        Ok(Self::new(pool))
    }

    /// Migrated in-memory store.
    pub fn in_memory() -> Result<Self> {
        let pool = sqlite::new_in_memory(&ConnectionConfig::default())?;
        let _ = sqlite::run_migrations(&*pool.get()?)?;
        Ok(Self::new(pool))
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Upsert an event by id.
    ///
    /// The owning session row is created on the fly (started at the event's
    /// timestamp) if an earlier `ensure_session` never landed.
    pub fn put_event(&self, event: &PersistedEvent) -> Result<bool> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let _ = SessionRepo::ensure(&tx, &event.instance_id, &event.session_id, event.timestamp)?;
        let inserted = EventRepo::upsert(&tx, event)?;
        SyncMetaRepo::note_persisted(&tx, &event.instance_id, event.timestamp)?;
        tx.commit()?;
        debug!(
            event_id = %event.id,
            session_id = %event.session_id,
            inserted,
            "event persisted"
        );
        Ok(inserted)
    }

    /// Create the session row if missing.
    pub fn ensure_session(&self, instance_id: &InstanceId, session: &Session) -> Result<bool> {
        let conn = self.conn()?;
        SessionRepo::ensure(&conn, instance_id, &session.id, session.started_at)
    }

    /// Attach a server task id to a session.
    pub fn update_session_task_id(&self, session_id: &SessionId, task_id: &str) -> Result<()> {
        let conn = self.conn()?;
        SessionRepo::update_task_id(&conn, session_id, task_id)
    }

    /// Record a reconciliation pass.
    pub fn mark_reconciled(&self, instance_id: &InstanceId, at: i64, repair_size: u64) -> Result<()> {
        let conn = self.conn()?;
        SyncMetaRepo::note_reconciled(&conn, instance_id, at, repair_size)
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Fetch one event.
    pub fn get_event(&self, id: &EventId) -> Result<Option<PersistedEvent>> {
        EventRepo::get(&*self.conn()?, id)
    }

    /// Newest `limit` events of an instance, oldest first.
    pub fn recent_events(&self, instance_id: &InstanceId, limit: usize) -> Result<Vec<PersistedEvent>> {
        EventRepo::list_recent_by_instance(&*self.conn()?, instance_id, limit)
    }

    /// Number of events for an instance.
    pub fn count_events(&self, instance_id: &InstanceId) -> Result<u64> {
        EventRepo::count_by_instance(&*self.conn()?, instance_id)
    }

    /// Total number of events.
    pub fn count_all_events(&self) -> Result<u64> {
        EventRepo::count_all(&*self.conn()?)
    }

    /// Fetch a session row.
    pub fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRow>> {
        SessionRepo::get(&*self.conn()?, session_id)
    }

    /// Sessions of an instance, oldest first.
    pub fn list_sessions(&self, instance_id: &InstanceId) -> Result<Vec<SessionRow>> {
        SessionRepo::list_by_instance(&*self.conn()?, instance_id)
    }

    /// Every instance with stored sessions.
    pub fn list_instances(&self) -> Result<Vec<InstanceId>> {
        SessionRepo::list_instances(&*self.conn()?)
    }

    /// Bookkeeping for an instance.
    pub fn sync_meta(&self, instance_id: &InstanceId) -> Result<Option<SyncMeta>> {
        SyncMetaRepo::get(&*self.conn()?, instance_id)
    }

    /// Totals for every instance.
    pub fn instance_summaries(&self) -> Result<Vec<InstanceSummary>> {
        let conn = self.conn()?;
        SessionRepo::list_instances(&conn)?
            .into_iter()
            .map(|instance_id| -> Result<InstanceSummary> {
                Ok(InstanceSummary {
                    session_count: SessionRepo::list_by_instance(&conn, &instance_id)?.len() as u64,
                    event_count: EventRepo::count_by_instance(&conn, &instance_id)?,
                    latest_timestamp: EventRepo::latest_timestamp(&conn, &instance_id)?,
                    meta: SyncMetaRepo::get(&conn, &instance_id)?,
                    instance_id,
                })
            })
            .collect()
    }

    /// Totals for every session of an instance.
    pub fn session_summaries(&self, instance_id: &InstanceId) -> Result<Vec<SessionSummary>> {
        let conn = self.conn()?;
        SessionRepo::list_by_instance(&conn, instance_id)?
            .into_iter()
            .map(|session| -> Result<SessionSummary> {
                Ok(SessionSummary {
                    event_count: EventRepo::count_by_session(&conn, &session.id)?,
                    session,
                })
            })
            .collect()
    }
}

impl EventWriter for EventStore {
    fn apply(&self, op: &WriteOp) -> Result<()> {
        match op {
            WriteOp::PutEvent(event) => self.put_event(event).map(|_| ()),
            WriteOp::EnsureSession {
                instance_id,
                session,
            } => self.ensure_session(instance_id, session).map(|_| ()),
            WriteOp::SetTaskId {
                session_id,
                task_id,
            } => self.update_session_task_id(session_id, task_id),
            WriteOp::MarkReconciled {
                instance_id,
                at,
                repair_size,
            } => self.mark_reconciled(instance_id, *at, *repair_size),
        }
    }
}
