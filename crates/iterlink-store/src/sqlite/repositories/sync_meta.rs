//! Per-instance sync bookkeeping, kept for diagnostics.

use iterlink_core::InstanceId;
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::Result;

/// One `sync_meta` row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncMeta {
    /// Newest timestamp of any persisted event.
    pub last_persisted_ts: Option<i64>,
    /// Unix ms of the last reconciliation.
    pub last_reconcile_at: Option<i64>,
    /// Events replayed by the last repair.
    pub last_repair_size: u64,
    /// Number of repairs performed.
    pub repair_count: u64,
}

/// `sync_meta` repository.
pub struct SyncMetaRepo;

impl SyncMetaRepo {
    /// Raise `last_persisted_ts` to `ts` if it is newer.
    pub fn note_persisted(conn: &Connection, instance_id: &InstanceId, ts: i64) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO sync_meta (instance_id, last_persisted_ts) VALUES (?1, ?2)
             ON CONFLICT(instance_id) DO UPDATE SET
               last_persisted_ts = MAX(COALESCE(last_persisted_ts, excluded.last_persisted_ts),
                                       excluded.last_persisted_ts)",
            params![instance_id.as_str(), ts],
        )?;
        Ok(())
    }

    /// Record a reconciliation. A non-zero `repair_size` counts as a repair.
    pub fn note_reconciled(
        conn: &Connection,
        instance_id: &InstanceId,
        at: i64,
        repair_size: u64,
    ) -> Result<()> {
        let repaired = i64::from(repair_size > 0);
        let _ = conn.execute(
            "INSERT INTO sync_meta (instance_id, last_reconcile_at, last_repair_size, repair_count)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(instance_id) DO UPDATE SET
               last_reconcile_at = excluded.last_reconcile_at,
               last_repair_size  = excluded.last_repair_size,
               repair_count      = repair_count + excluded.repair_count",
            params![instance_id.as_str(), at, repair_size as i64, repaired],
        )?;
        Ok(())
    }

    /// Fetch bookkeeping for an instance.
    pub fn get(conn: &Connection, instance_id: &InstanceId) -> Result<Option<SyncMeta>> {
        let meta = conn
            .query_row(
                "SELECT last_persisted_ts, last_reconcile_at, last_repair_size, repair_count
                 FROM sync_meta WHERE instance_id = ?1",
                params![instance_id.as_str()],
                |row| {
                    Ok(SyncMeta {
                        last_persisted_ts: row.get(0)?,
                        last_reconcile_at: row.get(1)?,
                        last_repair_size: row.get::<_, i64>(2)? as u64,
                        repair_count: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(meta)
    }
}
