//! Ordered, resumable upload of spooled segments.
//!
//! The upload worker drains the segment buffer strictly in capture-time
//! order, resumes each upload from the remote's committed offset, retries
//! transient failures with bounded exponential backoff, and records every
//! state transition in the sync ledger before acting on it.
//!
//! Chronological integrity matters for evidence: a single drain loop
//! uploads one segment at a time, so the remote always receives segments
//! in strictly increasing capture-time order per device.

use anyhow::Result;
use rand::Rng;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use crate::buffer::SegmentBuffer;
use crate::ledger::SyncRecord;
use crate::SegmentId;

mod memory;
#[cfg(feature = "upload-http")]
pub mod http;

pub use memory::MemoryRemoteStore;

// -------------------- Errors --------------------

/// Upload failures, classified for retry policy.
#[derive(Clone, Debug)]
pub enum UploadError {
    /// Network hiccup, 5xx, timeout: worth retrying with backoff.
    Transient(String),
    /// The remote rejected the request outright; retrying cannot help.
    Permanent(String),
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::Transient(msg) => write!(f, "transient upload failure: {}", msg),
            UploadError::Permanent(msg) => write!(f, "permanent upload failure: {}", msg),
        }
    }
}

impl std::error::Error for UploadError {}

// -------------------- Remote Store --------------------

/// External collaborators: remote object storage plus the metadata
/// database. Both are fallible network services; the core never assumes a
/// call succeeded until the response says so.
pub trait RemoteStore: Send {
    fn name(&self) -> &'static str;

    /// How many bytes the remote has durably committed for this segment.
    /// Zero for an unknown segment.
    fn committed_offset(&mut self, id: &SegmentId) -> Result<u64, UploadError>;

    /// Append a chunk at `offset`. Returns the new committed offset.
    /// Must be idempotent for already-committed ranges.
    fn put_chunk(&mut self, id: &SegmentId, offset: u64, chunk: &[u8])
        -> Result<u64, UploadError>;

    /// Seal the object. Must be a no-op when already finalized with the
    /// same checksum, so re-running a confirmed upload never duplicates.
    fn finalize(&mut self, id: &SegmentId, checksum: [u8; 32], total_len: u64)
        -> Result<(), UploadError>;

    /// Write segment metadata (location, timestamps) alongside the object.
    fn put_metadata(&mut self, id: &SegmentId, meta_json: &str) -> Result<(), UploadError>;
}

// -------------------- Worker --------------------

#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub chunk_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            chunk_bytes: 256 * 1024,
        }
    }
}

/// Result of one drain step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Nothing pending.
    Idle,
    Confirmed(SegmentId),
    /// Retries exhausted or permanent failure; record moved to Failed and
    /// retained locally for the user-facing layer to surface.
    Failed(SegmentId, String),
}

pub struct UploadWorker {
    store: Box<dyn RemoteStore>,
    config: UploadConfig,
}

impl UploadWorker {
    pub fn new(store: Box<dyn RemoteStore>, config: UploadConfig) -> Result<Self> {
        if config.max_attempts == 0 {
            return Err(anyhow::anyhow!("upload max_attempts must be >= 1"));
        }
        if config.chunk_bytes == 0 {
            return Err(anyhow::anyhow!("upload chunk_bytes must be >= 1"));
        }
        Ok(Self { store, config })
    }

    /// Upload the next segment in capture order, if any.
    ///
    /// The buffer mutex is held only around ledger transitions and blob
    /// reads, never across network calls.
    pub fn upload_next(&mut self, buffer: &Mutex<SegmentBuffer>) -> Result<UploadOutcome> {
        let (record, blob) = {
            let mut guard = lock(buffer)?;
            let Some(record) = guard.next_for_upload()? else {
                return Ok(UploadOutcome::Idle);
            };
            match guard.read_blob(&record) {
                Ok(blob) => (record, blob),
                Err(err) => {
                    // Spool corruption or loss: never uploadable, never silent.
                    let reason = format!("local blob unreadable: {}", err);
                    guard.mark_failed(&record.segment_id, &reason)?;
                    return Ok(UploadOutcome::Failed(record.segment_id, reason));
                }
            }
        };

        self.upload_segment(buffer, &record, &blob)
    }

    fn upload_segment(
        &mut self,
        buffer: &Mutex<SegmentBuffer>,
        record: &SyncRecord,
        blob: &[u8],
    ) -> Result<UploadOutcome> {
        let id = &record.segment_id;
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            lock(buffer)?.record_attempt(id)?;

            match self.try_upload(buffer, record, blob) {
                Ok(()) => {
                    lock(buffer)?.mark_confirmed(id)?;
                    log::info!(
                        "segment {} confirmed after {} attempt(s) ({} bytes)",
                        id,
                        attempt,
                        blob.len()
                    );
                    return Ok(UploadOutcome::Confirmed(id.clone()));
                }
                Err(UploadError::Permanent(msg)) => {
                    log::error!("segment {} upload permanently failed: {}", id, msg);
                    lock(buffer)?.mark_failed(id, &msg)?;
                    return Ok(UploadOutcome::Failed(id.clone(), msg));
                }
                Err(UploadError::Transient(msg)) => {
                    last_error = msg;
                    if attempt < self.config.max_attempts {
                        let delay = self.backoff_delay(attempt);
                        log::warn!(
                            "segment {} upload attempt {}/{} failed ({}); retrying in {:?}",
                            id,
                            attempt,
                            self.config.max_attempts,
                            last_error,
                            delay
                        );
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        let reason = format!(
            "retries exhausted after {} attempts: {}",
            self.config.max_attempts, last_error
        );
        log::error!("segment {} upload failed: {}", id, reason);
        lock(buffer)?.mark_failed(id, &reason)?;
        Ok(UploadOutcome::Failed(id.clone(), reason))
    }

    /// One attempt: query the committed offset, stream the remaining bytes,
    /// then finalize and write metadata.
    fn try_upload(
        &mut self,
        buffer: &Mutex<SegmentBuffer>,
        record: &SyncRecord,
        blob: &[u8],
    ) -> Result<(), UploadError> {
        let id = &record.segment_id;
        let total = blob.len() as u64;

        // The remote's committed offset is authoritative; the ledger copy
        // exists for observability and crash diagnosis.
        let mut offset = self.store.committed_offset(id)?;
        if offset > total {
            return Err(UploadError::Permanent(format!(
                "remote committed {} bytes but segment has {}",
                offset, total
            )));
        }
        if offset > 0 {
            log::info!("segment {} resuming upload at byte {}", id, offset);
        }

        while offset < total {
            let end = (offset as usize + self.config.chunk_bytes).min(blob.len());
            let acked = self
                .store
                .put_chunk(id, offset, &blob[offset as usize..end])?;
            if acked <= offset {
                return Err(UploadError::Transient(format!(
                    "remote did not advance past byte {}",
                    offset
                )));
            }
            offset = acked;
            lock(buffer)
                .and_then(|mut guard| guard.record_bytes_acked(id, offset))
                .map_err(|e| UploadError::Permanent(format!("ledger write failed: {}", e)))?;
        }

        self.store.finalize(id, record.checksum, total)?;
        self.store.put_metadata(id, &record.meta_json)?;
        Ok(())
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .initial_backoff
            .saturating_mul(1u32 << (attempt - 1).min(16));
        let capped = exp.min(self.config.max_backoff);
        // Full jitter keeps a fleet of devices from thundering back in sync.
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64 / 2);
        capped + Duration::from_millis(jitter_ms)
    }
}

fn lock(buffer: &Mutex<SegmentBuffer>) -> Result<std::sync::MutexGuard<'_, SegmentBuffer>> {
    buffer
        .lock()
        .map_err(|_| anyhow::anyhow!("segment buffer lock poisoned"))
}
