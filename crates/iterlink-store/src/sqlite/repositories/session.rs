//! Session repository: one row per logical session.

use iterlink_core::{InstanceId, SessionId};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::errors::{Result, StoreError};

/// Raw session row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRow {
    /// Session id.
    pub id: SessionId,
    /// Owning instance.
    pub instance_id: InstanceId,
    /// Unix ms of the opening boundary event.
    pub started_at: i64,
    /// Server task attached to the session, if reported.
    pub task_id: Option<String>,
}

/// Session repository.
pub struct SessionRepo;

impl SessionRepo {
    /// Create the session row if it does not exist yet.
    ///
    /// An existing row keeps its original `started_at`. Returns `true` when
    /// a row was inserted.
    pub fn ensure(
        conn: &Connection,
        instance_id: &InstanceId,
        session_id: &SessionId,
        started_at: i64,
    ) -> Result<bool> {
        let inserted = conn.execute(
            "INSERT INTO sessions (id, instance_id, started_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO NOTHING",
            params![session_id.as_str(), instance_id.as_str(), started_at],
        )?;
        Ok(inserted > 0)
    }

    /// Attach a server task id to a session.
    pub fn update_task_id(conn: &Connection, session_id: &SessionId, task_id: &str) -> Result<()> {
        let changed = conn.execute(
            "UPDATE sessions SET task_id = ?2 WHERE id = ?1",
            params![session_id.as_str(), task_id],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Fetch a session by id.
    pub fn get(conn: &Connection, session_id: &SessionId) -> Result<Option<SessionRow>> {
        let row = conn
            .query_row(
                "SELECT id, instance_id, started_at, task_id FROM sessions WHERE id = ?1",
                params![session_id.as_str()],
                read_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Sessions of an instance, oldest first.
    pub fn list_by_instance(conn: &Connection, instance_id: &InstanceId) -> Result<Vec<SessionRow>> {
        let mut stmt = conn.prepare(
            "SELECT id, instance_id, started_at, task_id FROM sessions
             WHERE instance_id = ?1 ORDER BY started_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![instance_id.as_str()], read_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recently started session of an instance.
    pub fn latest_for_instance(conn: &Connection, instance_id: &InstanceId) -> Result<Option<SessionRow>> {
        let row = conn
            .query_row(
                "SELECT id, instance_id, started_at, task_id FROM sessions
                 WHERE instance_id = ?1 ORDER BY started_at DESC, rowid DESC LIMIT 1",
                params![instance_id.as_str()],
                read_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Every instance that owns at least one session.
    pub fn list_instances(conn: &Connection) -> Result<Vec<InstanceId>> {
        let mut stmt =
            conn.prepare("SELECT DISTINCT instance_id FROM sessions ORDER BY instance_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|r| r.map(InstanceId::from_raw))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: SessionId::from_raw(row.get::<_, String>(0)?),
        instance_id: InstanceId::from_raw(row.get::<_, String>(1)?),
        started_at: row.get(2)?,
        task_id: row.get(3)?,
    })
}
