//! Per-user sync watermark, persisted so an incremental sync resumes from
//! where the last session left off instead of replaying from zero.

use crate::error::StoreResult;
use crate::model::SyncState;
use crate::Store;
use rusqlite::{params, OptionalExtension};

impl Store {
    pub fn load_sync_state(&self, user_id: &str) -> StoreResult<SyncState> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT last_sync_seq, last_sync_time, is_syncing FROM sync_config WHERE user_id = ?1",
                params![user_id],
                |r| {
                    Ok(SyncState {
                        last_sync_seq: r.get(0)?,
                        last_sync_time: r.get(1)?,
                        is_syncing: r.get::<_, i64>(2)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row.unwrap_or_default())
    }

    /// Advance the watermark. `seq` only ever moves forward: a late-arriving
    /// response for an older sync round must not roll the cursor back.
    pub fn advance_sync_watermark(&self, user_id: &str, seq: i64, time: i64) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sync_config (user_id, last_sync_seq, last_sync_time, is_syncing)
             VALUES (?1, ?2, ?3, 0)
             ON CONFLICT(user_id) DO UPDATE SET
                last_sync_seq = MAX(last_sync_seq, excluded.last_sync_seq),
                last_sync_time = CASE
                    WHEN excluded.last_sync_seq >= last_sync_seq THEN excluded.last_sync_time
                    ELSE last_sync_time
                END",
            params![user_id, seq, time],
        )?;
        Ok(())
    }

    pub fn set_syncing(&self, user_id: &str, syncing: bool) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sync_config (user_id, last_sync_seq, last_sync_time, is_syncing)
             VALUES (?1, 0, 0, ?2)
             ON CONFLICT(user_id) DO UPDATE SET is_syncing = excluded.is_syncing",
            params![user_id, syncing as i64],
        )?;
        Ok(())
    }

    /// Unconditionally rewind the watermark to zero. Unlike
    /// `advance_sync_watermark`, this is not monotonic — it is for an
    /// explicit full resync, not normal batch progress.
    pub fn reset_sync_state(&self, user_id: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sync_config (user_id, last_sync_seq, last_sync_time, is_syncing)
             VALUES (?1, 0, 0, 0)
             ON CONFLICT(user_id) DO UPDATE SET last_sync_seq = 0, last_sync_time = 0, is_syncing = 0",
            params![user_id],
        )?;
        Ok(())
    }
}
