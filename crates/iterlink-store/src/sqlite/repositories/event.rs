//! Event repository: upsert and read-back of persisted events.
//!
//! The full [`ChatEvent`] is stored as JSON in `payload`; `type` and
//! `timestamp` are denormalized for ordering and diagnostics.

use iterlink_core::{ChatEvent, EventId, InstanceId, PersistedEvent, SessionId};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::errors::Result;

const COLUMNS: &str = "id, session_id, instance_id, timestamp, type, payload";

/// Event repository.
pub struct EventRepo;

impl EventRepo {
    /// Insert or overwrite the row keyed by `event.id`.
    ///
    /// Returns `true` when the id was new.
    pub fn upsert(conn: &Connection, event: &PersistedEvent) -> Result<bool> {
        let existed = Self::exists(conn, &event.id)?;
        let payload = serde_json::to_string(&event.event)?;
        let _ = conn.execute(
            "INSERT INTO events (id, session_id, instance_id, timestamp, type, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
               session_id  = excluded.session_id,
               instance_id = excluded.instance_id,
               timestamp   = excluded.timestamp,
               type        = excluded.type,
               payload     = excluded.payload,
               written_at  = datetime('now')",
            params![
                event.id.as_str(),
                event.session_id.as_str(),
                event.instance_id.as_str(),
                event.timestamp,
                event.event_type,
                payload,
            ],
        )?;
        Ok(!existed)
    }

    /// Whether a row with `id` exists.
    pub fn exists(conn: &Connection, id: &EventId) -> Result<bool> {
        let found = conn
            .query_row(
                "SELECT 1 FROM events WHERE id = ?1",
                params![id.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Fetch one event by id.
    pub fn get(conn: &Connection, id: &EventId) -> Result<Option<PersistedEvent>> {
        let sql = format!("SELECT {COLUMNS} FROM events WHERE id = ?1");
        let row = conn
            .query_row(&sql, params![id.as_str()], read_row)
            .optional()?;
        row.map(decode).transpose()
    }

    /// The most recent `limit` events of an instance, oldest first.
    pub fn list_recent_by_instance(
        conn: &Connection,
        instance_id: &InstanceId,
        limit: usize,
    ) -> Result<Vec<PersistedEvent>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM (
               SELECT {COLUMNS}, rowid AS rid FROM events WHERE instance_id = ?1
               ORDER BY timestamp DESC, rid DESC LIMIT ?2
             ) ORDER BY timestamp ASC, rid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![instance_id.as_str(), limit as i64], read_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode).collect()
    }

    /// Number of events stored for an instance.
    pub fn count_by_instance(conn: &Connection, instance_id: &InstanceId) -> Result<u64> {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE instance_id = ?1",
            params![instance_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Number of events stored for a session.
    pub fn count_by_session(conn: &Connection, session_id: &SessionId) -> Result<u64> {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE session_id = ?1",
            params![session_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Total number of stored events.
    pub fn count_all(conn: &Connection) -> Result<u64> {
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Newest event timestamp for an instance.
    pub fn latest_timestamp(conn: &Connection, instance_id: &InstanceId) -> Result<Option<i64>> {
        let ts: Option<i64> = conn.query_row(
            "SELECT MAX(timestamp) FROM events WHERE instance_id = ?1",
            params![instance_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(ts)
    }
}

struct EventRow {
    id: String,
    session_id: String,
    instance_id: String,
    timestamp: i64,
    event_type: String,
    payload: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        instance_id: row.get(2)?,
        timestamp: row.get(3)?,
        event_type: row.get(4)?,
        payload: row.get(5)?,
    })
}

fn decode(row: EventRow) -> Result<PersistedEvent> {
    let event: ChatEvent = serde_json::from_str(&row.payload)?;
    Ok(PersistedEvent {
        id: EventId::from_raw(row.id),
        session_id: SessionId::from_raw(row.session_id),
        instance_id: InstanceId::from_raw(row.instance_id),
        timestamp: row.timestamp,
        event_type: row.event_type,
        event,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sqlite::repositories::SessionRepo;
    use crate::sqlite::repositories::test_support::migrated;

    fn persisted(id: &str, ts: i64, text: &str) -> PersistedEvent {
        let event = ChatEvent::new("output", Some(ts))
            .with_id(id)
            .with_field("text", json!(text));
        PersistedEvent::new(event, SessionId::from_raw("s1"), InstanceId::from_raw("a"))
    }

    fn with_session() -> Connection {
        let conn = migrated();
        let _ = SessionRepo::ensure(
            &conn,
            &InstanceId::from_raw("a"),
            &SessionId::from_raw("s1"),
            1,
        )
        .unwrap();
        conn
    }

    #[test]
    fn upsert_same_id_keeps_one_row_with_last_write() {
        let conn = with_session();
        assert!(EventRepo::upsert(&conn, &persisted("evt-1", 10, "first")).unwrap());
        assert!(!EventRepo::upsert(&conn, &persisted("evt-1", 10, "second")).unwrap());

        assert_eq!(EventRepo::count_all(&conn).unwrap(), 1);
        let stored = EventRepo::get(&conn, &EventId::from_raw("evt-1"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.event.payload["text"], "second");
    }

    #[test]
    fn get_round_trips_payload() {
        let conn = with_session();
        let original = persisted("evt-1", 10, "hello");
        let _ = EventRepo::upsert(&conn, &original).unwrap();
        let stored = EventRepo::get(&conn, &original.id).unwrap().unwrap();
        assert_eq!(stored, original);
    }

    #[test]
    fn get_missing_is_none() {
        let conn = with_session();
        assert!(EventRepo::get(&conn, &EventId::from_raw("nope")).unwrap().is_none());
    }

    #[test]
    fn recent_by_instance_returns_tail_oldest_first() {
        let conn = with_session();
        for ts in 1..=5 {
            let _ = EventRepo::upsert(&conn, &persisted(&format!("e{ts}"), ts, "x")).unwrap();
        }
        let ids: Vec<_> = EventRepo::list_recent_by_instance(&conn, &InstanceId::from_raw("a"), 2)
            .unwrap()
            .into_iter()
            .map(|e| e.id.to_string())
            .collect();
        assert_eq!(ids, vec!["e4", "e5"]);
    }

    #[test]
    fn counts_and_latest_timestamp() {
        let conn = with_session();
        let instance = InstanceId::from_raw("a");
        assert_eq!(EventRepo::latest_timestamp(&conn, &instance).unwrap(), None);
        for ts in [5, 50, 7] {
            let _ = EventRepo::upsert(&conn, &persisted(&format!("e{ts}"), ts, "x")).unwrap();
        }
        assert_eq!(EventRepo::count_by_instance(&conn, &instance).unwrap(), 3);
        assert_eq!(
            EventRepo::count_by_session(&conn, &SessionId::from_raw("s1")).unwrap(),
            3
        );
        assert_eq!(EventRepo::latest_timestamp(&conn, &instance).unwrap(), Some(50));
        assert_eq!(
            EventRepo::count_by_instance(&conn, &InstanceId::from_raw("b")).unwrap(),
            0
        );
    }
}
