//! Sync ledger: the single source of truth for "has this segment left the
//! device safely."
//!
//! Every state transition is the result of exactly one logical operation
//! (enqueue, upload-start, upload-progress, upload-success, upload-failure,
//! purge) and is persisted as a single SQL statement before any other
//! component acts on it. A crash between pipeline steps therefore never
//! leaves the buffer and the ledger disagreeing about a segment.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::{now_ms, SegmentId, SegmentMeta};

/// Durable upload state of one segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncState {
    Pending,
    Uploading,
    Confirmed,
    Failed(String),
}

impl SyncState {
    fn to_db(&self) -> (&'static str, Option<&str>) {
        match self {
            SyncState::Pending => ("pending", None),
            SyncState::Uploading => ("uploading", None),
            SyncState::Confirmed => ("confirmed", None),
            SyncState::Failed(reason) => ("failed", Some(reason)),
        }
    }

    fn from_db(state: &str, reason: Option<String>) -> Result<Self> {
        match state {
            "pending" => Ok(SyncState::Pending),
            "uploading" => Ok(SyncState::Uploading),
            "confirmed" => Ok(SyncState::Confirmed),
            "failed" => Ok(SyncState::Failed(reason.unwrap_or_default())),
            other => Err(anyhow!("corrupt ledger: unknown state '{}'", other)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.to_db().0
    }
}

/// One ledger row. One-to-one with a segment; retained after purge so the
/// upload history stays auditable.
#[derive(Clone, Debug)]
pub struct SyncRecord {
    pub segment_id: SegmentId,
    pub capture_start_ms: u64,
    pub state: SyncState,
    pub attempts: u32,
    pub last_attempt_at_ms: Option<u64>,
    pub bytes_acked: u64,
    pub blob_len: u64,
    pub checksum: [u8; 32],
    pub purged: bool,
    pub meta_json: String,
}

impl SyncRecord {
    pub fn meta(&self) -> Result<SegmentMeta> {
        Ok(serde_json::from_str(&self.meta_json)?)
    }
}

pub struct SyncLedger {
    conn: Connection,
}

impl SyncLedger {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut ledger = Self { conn };
        ledger.ensure_schema()?;
        Ok(ledger)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS sync_records (
              segment_key TEXT PRIMARY KEY,
              device_id TEXT NOT NULL,
              seq INTEGER NOT NULL,
              capture_start_ms INTEGER NOT NULL,
              state TEXT NOT NULL,
              failure_reason TEXT,
              attempts INTEGER NOT NULL DEFAULT 0,
              last_attempt_at_ms INTEGER,
              bytes_acked INTEGER NOT NULL DEFAULT 0,
              blob_len INTEGER NOT NULL,
              checksum BLOB NOT NULL,
              purged INTEGER NOT NULL DEFAULT 0,
              meta_json TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sync_state ON sync_records(state);
            CREATE INDEX IF NOT EXISTS idx_sync_capture ON sync_records(capture_start_ms);
            "#,
        )?;
        Ok(())
    }

    /// Enqueue transition: Pending. Refuses unredacted metadata outright;
    /// the type system already prevents this path, the ledger re-checks it
    /// as the last line of defense.
    pub fn record_enqueued(&mut self, meta: &SegmentMeta) -> Result<()> {
        if !meta.redaction_applied {
            return Err(anyhow!(
                "refusing to enqueue segment {} without redaction",
                meta.id
            ));
        }
        let created_at = now_ms()? as i64;
        let meta_json = serde_json::to_string(meta)?;
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO sync_records(
                segment_key, device_id, seq, capture_start_ms, state,
                attempts, bytes_acked, blob_len, checksum, meta_json, created_at_ms
            )
            VALUES (?1, ?2, ?3, ?4, 'pending', 0, 0, ?5, ?6, ?7, ?8)
            "#,
            params![
                meta.id.object_key(),
                meta.id.device_id,
                meta.id.seq as i64,
                meta.capture_start_ms as i64,
                meta.blob_len as i64,
                meta.checksum.to_vec(),
                meta_json,
                created_at,
            ],
        )?;
        if inserted == 0 {
            return Err(anyhow!("segment {} already in ledger", meta.id));
        }
        Ok(())
    }

    /// Upload-start transition: the oldest claimable Pending segment by
    /// capture time becomes Uploading and is returned. The claim is a
    /// single UPDATE, so there is exactly one owner per segment key.
    ///
    /// A segment is claimable only when every earlier sequence number of
    /// its device already has a ledger row. Sequence numbers are assigned
    /// contiguously at capture time, so a missing row means an earlier
    /// capture is still in redaction; uploading past it would break the
    /// capture-time order the remote must observe. Dropped segments leave
    /// an audit row (see [`record_dropped`](Self::record_dropped)) and so
    /// never stall the queue.
    pub fn claim_next_pending(&mut self) -> Result<Option<SyncRecord>> {
        for record in self.list(Some("pending"))? {
            let seq = record.segment_id.seq as i64;
            let earlier: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM sync_records WHERE device_id = ?1 AND seq < ?2",
                params![record.segment_id.device_id, seq],
                |row| row.get(0),
            )?;
            if earlier < seq {
                continue;
            }
            let updated = self.conn.execute(
                "UPDATE sync_records SET state = 'uploading' WHERE segment_key = ?1 AND state = 'pending'",
                params![record.segment_id.object_key()],
            )?;
            if updated == 1 {
                return self.get(&record.segment_id);
            }
        }
        Ok(None)
    }

    /// Audit row for a segment discarded before enqueue (fail-closed drop).
    /// No media is referenced; the row records the loss and keeps the
    /// device's sequence numbering gap-free for upload ordering.
    pub fn record_dropped(
        &mut self,
        id: &SegmentId,
        capture_start_ms: u64,
        reason: &str,
    ) -> Result<()> {
        let created_at = now_ms()? as i64;
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO sync_records(
                segment_key, device_id, seq, capture_start_ms, state,
                failure_reason, attempts, bytes_acked, blob_len, checksum,
                purged, meta_json, created_at_ms
            )
            VALUES (?1, ?2, ?3, ?4, 'failed', ?5, 0, 0, 0, ?6, 1, '{}', ?7)
            "#,
            params![
                id.object_key(),
                id.device_id,
                id.seq as i64,
                capture_start_ms as i64,
                reason,
                [0u8; 32].to_vec(),
                created_at,
            ],
        )?;
        if inserted == 0 {
            return Err(anyhow!("segment {} already in ledger", id));
        }
        Ok(())
    }

    /// Record one upload attempt against an Uploading segment.
    pub fn record_attempt(&mut self, id: &SegmentId) -> Result<()> {
        let at = now_ms()? as i64;
        self.transition(
            id,
            "UPDATE sync_records SET attempts = attempts + 1, last_attempt_at_ms = ?2
             WHERE segment_key = ?1",
            params![id.object_key(), at],
        )
    }

    /// Upload-progress transition: persist the remote-acknowledged offset
    /// so a resume never re-sends acknowledged bytes.
    pub fn record_bytes_acked(&mut self, id: &SegmentId, bytes_acked: u64) -> Result<()> {
        self.transition(
            id,
            "UPDATE sync_records SET bytes_acked = ?2 WHERE segment_key = ?1",
            params![id.object_key(), bytes_acked as i64],
        )
    }

    /// Upload-success transition: Confirmed. Local media may be purged
    /// afterwards; the record itself is retained for audit.
    pub fn mark_confirmed(&mut self, id: &SegmentId) -> Result<()> {
        self.transition(
            id,
            "UPDATE sync_records SET state = 'confirmed', failure_reason = NULL
             WHERE segment_key = ?1",
            params![id.object_key()],
        )
    }

    /// Upload-failure transition: Failed(reason), surfaced to the caller
    /// layer and retained locally until acknowledged or retried.
    pub fn mark_failed(&mut self, id: &SegmentId, reason: &str) -> Result<()> {
        self.transition(
            id,
            "UPDATE sync_records SET state = 'failed', failure_reason = ?2
             WHERE segment_key = ?1",
            params![id.object_key(), reason],
        )
    }

    /// Reset to Pending: used for crash recovery policy and manual retry of
    /// Failed segments.
    pub fn mark_pending(&mut self, id: &SegmentId) -> Result<()> {
        self.transition(
            id,
            "UPDATE sync_records SET state = 'pending', failure_reason = NULL
             WHERE segment_key = ?1",
            params![id.object_key()],
        )
    }

    /// Purge transition: local blob deleted, record kept.
    pub fn mark_purged(&mut self, id: &SegmentId) -> Result<()> {
        self.transition(
            id,
            "UPDATE sync_records SET purged = 1 WHERE segment_key = ?1",
            params![id.object_key()],
        )
    }

    fn transition(
        &mut self,
        id: &SegmentId,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<()> {
        let updated = self.conn.execute(sql, params)?;
        if updated == 0 {
            return Err(anyhow!("ledger has no record for segment {}", id));
        }
        Ok(())
    }

    pub fn get(&self, id: &SegmentId) -> Result<Option<SyncRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("{} WHERE segment_key = ?1", SELECT_RECORD),
                params![id.object_key()],
                map_record,
            )
            .optional()?;
        record.map(SyncRecord::try_from).transpose()
    }

    /// All records in capture order, optionally filtered by state name.
    pub fn list(&self, state: Option<&str>) -> Result<Vec<SyncRecord>> {
        let mut records = Vec::new();
        let sql = match state {
            Some(_) => format!(
                "{} WHERE state = ?1 ORDER BY capture_start_ms ASC, seq ASC",
                SELECT_RECORD
            ),
            None => format!("{} ORDER BY capture_start_ms ASC, seq ASC", SELECT_RECORD),
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows: Vec<RawRecord> = match state {
            Some(state) => stmt
                .query_map(params![state], map_record)?
                .collect::<rusqlite::Result<_>>()?,
            None => stmt
                .query_map([], map_record)?
                .collect::<rusqlite::Result<_>>()?,
        };
        for raw in rows {
            records.push(raw.try_into()?);
        }
        Ok(records)
    }

    /// Bytes still spooled on disk (blobs not yet purged).
    pub fn spooled_bytes(&self) -> Result<u64> {
        let sum: Option<i64> = self.conn.query_row(
            "SELECT SUM(blob_len) FROM sync_records WHERE purged = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(sum.unwrap_or(0) as u64)
    }

    /// Count of records not yet Confirmed.
    pub fn unconfirmed_count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_records WHERE state != 'confirmed'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Oldest segment that has not been confirmed, for policy-gated
    /// eviction.
    pub fn oldest_unconfirmed(&self) -> Result<Option<SyncRecord>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "{} WHERE state != 'confirmed' AND purged = 0
                     ORDER BY capture_start_ms ASC, seq ASC LIMIT 1",
                    SELECT_RECORD
                ),
                [],
                map_record,
            )
            .optional()?;
        record.map(SyncRecord::try_from).transpose()
    }

    /// Next monotonic sequence number for a device after a restart.
    pub fn next_seq(&self, device_id: &str) -> Result<u64> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(seq) FROM sync_records WHERE device_id = ?1",
            params![device_id],
            |row| row.get(0),
        )?;
        Ok(max.map(|m| m as u64 + 1).unwrap_or(0))
    }
}

const SELECT_RECORD: &str = "SELECT segment_key, capture_start_ms, state, failure_reason,
    attempts, last_attempt_at_ms, bytes_acked, blob_len, checksum, purged, meta_json
    FROM sync_records";

struct RawRecord {
    segment_key: String,
    capture_start_ms: i64,
    state: String,
    failure_reason: Option<String>,
    attempts: i64,
    last_attempt_at_ms: Option<i64>,
    bytes_acked: i64,
    blob_len: i64,
    checksum: Vec<u8>,
    purged: i64,
    meta_json: String,
}

fn map_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        segment_key: row.get(0)?,
        capture_start_ms: row.get(1)?,
        state: row.get(2)?,
        failure_reason: row.get(3)?,
        attempts: row.get(4)?,
        last_attempt_at_ms: row.get(5)?,
        bytes_acked: row.get(6)?,
        blob_len: row.get(7)?,
        checksum: row.get(8)?,
        purged: row.get(9)?,
        meta_json: row.get(10)?,
    })
}

impl TryFrom<RawRecord> for SyncRecord {
    type Error = anyhow::Error;

    fn try_from(raw: RawRecord) -> Result<Self> {
        if raw.checksum.len() != 32 {
            return Err(anyhow!("corrupt ledger: checksum size"));
        }
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&raw.checksum);
        Ok(SyncRecord {
            segment_id: SegmentId::parse(&raw.segment_key)?,
            capture_start_ms: raw.capture_start_ms as u64,
            state: SyncState::from_db(&raw.state, raw.failure_reason)?,
            attempts: raw.attempts as u32,
            last_attempt_at_ms: raw.last_attempt_at_ms.map(|v| v as u64),
            bytes_acked: raw.bytes_acked as u64,
            blob_len: raw.blob_len as u64,
            checksum,
            purged: raw.purged != 0,
            meta_json: raw.meta_json,
        })
    }
}
