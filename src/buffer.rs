//! Durable, ordered, quota-bounded segment buffer.
//!
//! Redacted segments are spooled to the filesystem (one blob per segment,
//! written atomically) while the sync ledger tracks their upload state.
//! Capacity is bounded by a byte quota, not an element count. When the
//! quota is reached the buffer either backpressures the producer
//! ([`RetentionPolicy::Strict`]) or evicts the oldest unconfirmed segment
//! ([`RetentionPolicy::EvictOldest`]); it never corrupts the ledger.
//!
//! On open the buffer reconciles the ledger against the spool so a process
//! restart resumes uploads instead of restarting them.

use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ledger::{SyncLedger, SyncRecord, SyncState};
use crate::{checksum_of, RedactedSegment, SegmentId};

const SPOOL_DIR: &str = "spool";
const LEDGER_FILE: &str = "ledger.db";
const SEGMENT_EXT: &str = "seg";

/// What to do when the storage quota is exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Backpressure the producer; nothing is lost.
    Strict,
    /// Lossy degradation: evict the oldest unconfirmed segment.
    EvictOldest,
}

impl RetentionPolicy {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "strict" => Ok(RetentionPolicy::Strict),
            "evict_oldest" => Ok(RetentionPolicy::EvictOldest),
            other => Err(anyhow!(
                "retention policy must be 'strict' or 'evict_oldest', got '{}'",
                other
            )),
        }
    }
}

/// Typed quota error so the producer can distinguish backpressure from
/// real failures.
#[derive(Clone, Debug)]
pub struct QuotaExceeded {
    pub needed_bytes: u64,
    pub quota_bytes: u64,
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "storage quota exceeded: need {} bytes, quota {} bytes",
            self.needed_bytes, self.quota_bytes
        )
    }
}

impl std::error::Error for QuotaExceeded {}

/// Ledger database path under a buffer root, for tooling that inspects the
/// ledger without opening the full buffer.
pub fn ledger_path(root: &Path) -> PathBuf {
    root.join(LEDGER_FILE)
}

pub struct SegmentBuffer {
    ledger: SyncLedger,
    spool_dir: PathBuf,
    quota_bytes: u64,
    policy: RetentionPolicy,
}

impl SegmentBuffer {
    pub fn open(root: &Path, quota_bytes: u64, policy: RetentionPolicy) -> Result<Self> {
        if quota_bytes == 0 {
            return Err(anyhow!("buffer quota must be greater than zero"));
        }
        let spool_dir = root.join(SPOOL_DIR);
        fs::create_dir_all(&spool_dir)?;
        let ledger = SyncLedger::open(&root.join(LEDGER_FILE))?;
        let mut buffer = Self {
            ledger,
            spool_dir,
            quota_bytes,
            policy,
        };
        buffer.recover()?;
        Ok(buffer)
    }

    /// Enqueue a redacted segment.
    ///
    /// Only [`RedactedSegment`] exists as an input type, so raw media cannot
    /// reach this point; the `redaction_applied` check is defense in depth
    /// and is re-checked by the ledger insert.
    pub fn enqueue(&mut self, segment: &RedactedSegment) -> Result<()> {
        if !segment.meta.redaction_applied {
            return Err(anyhow!(
                "refusing to spool segment {} without redaction",
                segment.meta.id
            ));
        }

        self.make_room_for(segment.blob.len() as u64)?;

        // Blob first, ledger second: a crash in between leaves an orphan
        // blob that recovery removes, never a ledger row without bytes.
        let path = self.blob_path(&segment.meta.id);
        write_atomic(&path, &segment.blob)?;
        if let Err(err) = self.ledger.record_enqueued(&segment.meta) {
            let _ = fs::remove_file(&path);
            return Err(err);
        }

        log::debug!(
            "spooled segment {} ({} bytes, {} spooled total)",
            segment.meta.id,
            segment.blob.len(),
            self.ledger.spooled_bytes()?
        );
        Ok(())
    }

    fn make_room_for(&mut self, incoming: u64) -> Result<()> {
        loop {
            let spooled = self.ledger.spooled_bytes()?;
            if spooled + incoming <= self.quota_bytes {
                return Ok(());
            }
            match self.policy {
                RetentionPolicy::Strict => {
                    return Err(QuotaExceeded {
                        needed_bytes: spooled + incoming,
                        quota_bytes: self.quota_bytes,
                    }
                    .into());
                }
                RetentionPolicy::EvictOldest => {
                    let Some(victim) = self.ledger.oldest_unconfirmed()? else {
                        return Err(QuotaExceeded {
                            needed_bytes: spooled + incoming,
                            quota_bytes: self.quota_bytes,
                        }
                        .into());
                    };
                    log::warn!(
                        "quota reached; evicting oldest unconfirmed segment {}",
                        victim.segment_id
                    );
                    // Ledger first, then the blob: the record must never
                    // claim bytes that are already gone.
                    self.ledger
                        .mark_failed(&victim.segment_id, "evicted: storage quota reached")?;
                    self.ledger.mark_purged(&victim.segment_id)?;
                    let _ = fs::remove_file(self.blob_path(&victim.segment_id));
                }
            }
        }
    }

    /// Next segment for the upload worker, strictly in capture-time order.
    ///
    /// A segment left Uploading by a crash is returned first so the upload
    /// resumes from its acknowledged offset instead of restarting.
    pub fn next_for_upload(&mut self) -> Result<Option<SyncRecord>> {
        let uploading = self.ledger.list(Some("uploading"))?;
        if let Some(record) = uploading.into_iter().next() {
            return Ok(Some(record));
        }
        self.ledger.claim_next_pending()
    }

    /// Read a spooled blob and verify its checksum.
    pub fn read_blob(&self, record: &SyncRecord) -> Result<Vec<u8>> {
        let path = self.blob_path(&record.segment_id);
        let blob = fs::read(&path)
            .map_err(|e| anyhow!("spool read failed for {}: {}", record.segment_id, e))?;
        if checksum_of(&blob) != record.checksum {
            return Err(anyhow!(
                "spool corruption: checksum mismatch for {}",
                record.segment_id
            ));
        }
        Ok(blob)
    }

    /// Delete local media for Confirmed segments; records stay for audit.
    /// Returns the number of blobs purged.
    pub fn purge_confirmed(&mut self) -> Result<u32> {
        let mut purged = 0u32;
        for record in self.ledger.list(Some("confirmed"))? {
            if record.purged {
                continue;
            }
            self.ledger.mark_purged(&record.segment_id)?;
            let _ = fs::remove_file(self.blob_path(&record.segment_id));
            purged += 1;
        }
        if purged > 0 {
            log::debug!("purged {} confirmed segment blob(s)", purged);
        }
        Ok(purged)
    }

    // Ledger transitions are routed through the buffer so all shared
    // mutation goes through a single serialized access path.

    pub fn record_attempt(&mut self, id: &SegmentId) -> Result<()> {
        self.ledger.record_attempt(id)
    }

    /// Audit row for a segment discarded before it was ever spooled.
    pub fn record_dropped(
        &mut self,
        id: &SegmentId,
        capture_start_ms: u64,
        reason: &str,
    ) -> Result<()> {
        self.ledger.record_dropped(id, capture_start_ms, reason)
    }

    pub fn record_bytes_acked(&mut self, id: &SegmentId, bytes: u64) -> Result<()> {
        self.ledger.record_bytes_acked(id, bytes)
    }

    pub fn mark_confirmed(&mut self, id: &SegmentId) -> Result<()> {
        self.ledger.mark_confirmed(id)
    }

    pub fn mark_failed(&mut self, id: &SegmentId, reason: &str) -> Result<()> {
        self.ledger.mark_failed(id, reason)
    }

    pub fn get(&self, id: &SegmentId) -> Result<Option<SyncRecord>> {
        self.ledger.get(id)
    }

    pub fn list(&self, state: Option<&str>) -> Result<Vec<SyncRecord>> {
        self.ledger.list(state)
    }

    pub fn spooled_bytes(&self) -> Result<u64> {
        self.ledger.spooled_bytes()
    }

    pub fn unconfirmed_count(&self) -> Result<u64> {
        self.ledger.unconfirmed_count()
    }

    pub fn next_seq(&self, device_id: &str) -> Result<u64> {
        self.ledger.next_seq(device_id)
    }

    /// Reconcile ledger and spool after a (possibly unclean) shutdown.
    ///
    /// - Uploading records are left as-is: the worker resumes them from the
    ///   persisted acknowledged offset.
    /// - Records whose blob vanished become Failed (or purged, if already
    ///   Confirmed) with an explicit reason; nothing disappears silently.
    /// - Blobs without a ledger row are orphans from a crash mid-enqueue
    ///   and are removed.
    fn recover(&mut self) -> Result<()> {
        let mut expected: HashSet<PathBuf> = HashSet::new();

        for record in self.ledger.list(None)? {
            let path = self.blob_path(&record.segment_id);
            if record.purged {
                continue;
            }
            if path.exists() {
                expected.insert(path);
                continue;
            }
            if record.state == SyncState::Confirmed {
                self.ledger.mark_purged(&record.segment_id)?;
            } else {
                log::error!(
                    "spool blob missing for {} (state {}); marking failed",
                    record.segment_id,
                    record.state.name()
                );
                self.ledger
                    .mark_failed(&record.segment_id, "spool blob missing after restart")?;
                self.ledger.mark_purged(&record.segment_id)?;
            }
        }

        for entry in fs::read_dir(&self.spool_dir)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                // Half-written temp file from a crash mid-enqueue.
                Some("tmp") => {
                    let _ = fs::remove_file(&path);
                }
                Some(SEGMENT_EXT) if !expected.contains(&path) => {
                    log::warn!("removing orphan spool blob {}", path.display());
                    let _ = fs::remove_file(&path);
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn blob_path(&self, id: &SegmentId) -> PathBuf {
        // "device:rear_cam" -> "device_rear_cam-<seq>.seg"
        let name = format!(
            "{}-{:020}.{}",
            id.device_id.replace(':', "_"),
            id.seq,
            SEGMENT_EXT
        );
        self.spool_dir.join(name)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
