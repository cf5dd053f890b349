//! Evidence Pipeline
//!
//! Core kernel for a personal-safety recorder: capture media in the
//! background, redact bystander faces on-device, and synchronize the
//! redacted segments to remote storage while the device may be offline.
//!
//! # Architecture
//!
//! The pipeline enforces three invariants by construction:
//!
//! 1. **No Raw Persistence**: unredacted media never reaches the segment
//!    buffer. The buffer's enqueue API only accepts [`RedactedSegment`];
//!    raw frame bytes are private to the crate and zeroized on drop.
//! 2. **Fail-Closed Redaction**: if the face detector is unavailable, the
//!    pipeline halts or drops the segment. It never forwards raw media.
//! 3. **Ledger Before Action**: every upload state transition is persisted
//!    in the sync ledger before any component acts on it, so a crash never
//!    leaves the buffer and the ledger disagreeing about a segment.
//!
//! # Module Structure
//!
//! - `capture`: capture devices and the bounded-duration segment source
//! - `redact`: face detection backends and the blurring redactor
//! - `tag`: location sampling and staleness-bounded tagging
//! - `buffer`: durable, ordered, quota-bounded segment buffer
//! - `ledger`: sync ledger, the single source of truth for upload state
//! - `upload`: ordered, resumable upload worker with bounded retries
//! - `pipeline`: supervisor owning the session and the worker threads

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod buffer;
pub mod capture;
pub mod config;
pub mod ledger;
pub mod pipeline;
pub mod redact;
pub mod tag;
pub mod upload;

pub use buffer::{RetentionPolicy, SegmentBuffer};
pub use capture::{CaptureDevice, CaptureError, Frame, RawSegment, SegmentSource, StubCamera};
pub use config::EvidencedConfig;
pub use ledger::{SyncLedger, SyncRecord, SyncState};
pub use redact::{
    FaceDetector, FaceRegion, FailurePolicy, RedactionError, Redactor, StubFaceDetector,
};
pub use tag::{LocationProvider, LocationTagger, StaticLocationProvider};
pub use upload::{MemoryRemoteStore, RemoteStore, UploadError, UploadWorker};

pub fn now_ms() -> Result<u64> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
    Ok(now.as_millis() as u64)
}

// -------------------- Segment Identity --------------------

/// A conforming device_id MUST be a local identifier, never a hardware
/// serial or account handle. A positive allowlist pattern avoids trivial
/// bypasses.
///
/// Allowed: "device:rear_cam", "device:pixel-7a", "device:unit_03"
/// Disallowed: anything with whitespace, slashes, or punctuation outside [_-].
pub fn validate_device_id(device_id: &str) -> Result<()> {
    // Compile once for hot paths.
    static DEVICE_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = DEVICE_ID_RE.get_or_init(|| regex::Regex::new(r"^device:[a-z0-9_-]{1,64}$").unwrap());

    let did = device_id.to_lowercase();
    if !re.is_match(&did) {
        return Err(anyhow!("device_id must match ^device:[a-z0-9_-]{{1,64}}$"));
    }
    Ok(())
}

/// Segment identity: monotonic per device, device-unique.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId {
    pub device_id: String,
    pub seq: u64,
}

impl SegmentId {
    pub fn new(device_id: &str, seq: u64) -> Result<Self> {
        validate_device_id(device_id)?;
        Ok(Self {
            device_id: device_id.to_lowercase(),
            seq,
        })
    }

    /// Stable key used for ledger rows, spool file names, and remote objects.
    /// Zero-padding keeps lexical order equal to capture order.
    pub fn object_key(&self) -> String {
        format!("{}/{:020}", self.device_id, self.seq)
    }

    pub fn parse(key: &str) -> Result<Self> {
        let (device_id, seq) = key
            .rsplit_once('/')
            .ok_or_else(|| anyhow!("malformed segment key: {}", key))?;
        let seq: u64 = seq
            .parse()
            .map_err(|_| anyhow!("malformed segment sequence in key: {}", key))?;
        Self::new(device_id, seq)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.object_key())
    }
}

// -------------------- Location Samples --------------------

/// Last-known device location attached to a segment, if fresh enough.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct LocationSample {
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: f32,
    pub sampled_at_ms: u64,
}

// -------------------- Segment Metadata --------------------

/// Metadata for a redacted segment. This is what the ledger persists and
/// what the upload worker writes to the remote metadata store.
///
/// `redaction_applied` is always true for segments constructed through
/// [`redact::Redactor`]; the field exists so the buffer can refuse anything
/// else and so audits can assert the invariant end to end.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub id: SegmentId,
    pub capture_start_ms: u64,
    pub capture_end_ms: u64,
    pub width: u32,
    pub height: u32,
    pub frame_count: u32,
    pub redaction_applied: bool,
    pub regions_redacted: u32,
    pub location: Option<LocationSample>,
    pub blob_len: u64,
    pub checksum: [u8; 32],
}

/// A segment whose frames have passed through the redactor.
///
/// This is the only type [`SegmentBuffer::enqueue`] accepts. There is no
/// public constructor taking arbitrary bytes; the redactor is the single
/// producer, which makes "raw media in the buffer" unrepresentable.
#[derive(Debug)]
pub struct RedactedSegment {
    pub meta: SegmentMeta,
    pub(crate) blob: Vec<u8>,
}

impl RedactedSegment {
    pub(crate) fn new(meta: SegmentMeta, blob: Vec<u8>) -> Self {
        Self { meta, blob }
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }
}

pub(crate) fn checksum_of(blob: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    Sha256::digest(blob).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_allowlist() {
        assert!(validate_device_id("device:rear_cam").is_ok());
        assert!(validate_device_id("DEVICE:Rear_Cam").is_ok());
        assert!(validate_device_id("device:pixel-7a").is_ok());
        assert!(validate_device_id("rear_cam").is_err());
        assert!(validate_device_id("device:rear cam").is_err());
        assert!(validate_device_id("device:a/b").is_err());
        assert!(validate_device_id("device:").is_err());
    }

    #[test]
    fn segment_key_round_trips() {
        let id = SegmentId::new("device:rear_cam", 42).unwrap();
        assert_eq!(id.object_key(), "device:rear_cam/00000000000000000042");
        let parsed = SegmentId::parse(&id.object_key()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn segment_keys_sort_by_sequence() {
        let a = SegmentId::new("device:cam", 9).unwrap();
        let b = SegmentId::new("device:cam", 10).unwrap();
        assert!(a.object_key() < b.object_key());
    }
}
