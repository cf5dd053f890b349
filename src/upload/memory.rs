//! In-memory remote store with scriptable faults, for tests and demos.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{RemoteStore, UploadError};
use crate::SegmentId;

#[derive(Default)]
struct Inner {
    objects: HashMap<SegmentId, Vec<u8>>,
    finalized: HashMap<SegmentId, [u8; 32]>,
    finalized_order: Vec<SegmentId>,
    metadata: HashMap<SegmentId, String>,
    bytes_accepted: u64,
    // Fault scripting.
    fail_put_after_bytes: Option<u64>,
    transient_put_failures: u32,
    permanent_put_reason: Option<String>,
}

/// Cloneable handle over a shared in-memory remote. Tests keep one clone
/// for inspection while the upload worker owns another.
#[derive(Clone)]
pub struct MemoryRemoteStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, Inner>, UploadError> {
        self.inner
            .lock()
            .map_err(|_| UploadError::Permanent("memory store lock poisoned".into()))
    }

    // ---- fault scripting ----

    /// Reject the put that would push total accepted bytes past the limit,
    /// once, with a transient error. Models a mid-upload connection drop.
    pub fn fail_put_after_bytes(&self, limit: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_put_after_bytes = Some(limit);
        }
    }

    /// Fail the next `n` puts with a transient error.
    pub fn fail_puts_with_transient(&self, n: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.transient_put_failures = n;
        }
    }

    /// Fail every put with a permanent error.
    pub fn fail_puts_with_permanent(&self, reason: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.permanent_put_reason = Some(reason.to_string());
        }
    }

    // ---- inspection ----

    pub fn object(&self, id: &SegmentId) -> Option<Vec<u8>> {
        self.inner.lock().ok()?.objects.get(id).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().map(|i| i.objects.len()).unwrap_or(0)
    }

    pub fn finalized_order(&self) -> Vec<SegmentId> {
        self.inner
            .lock()
            .map(|i| i.finalized_order.clone())
            .unwrap_or_default()
    }

    pub fn metadata(&self, id: &SegmentId) -> Option<String> {
        self.inner.lock().ok()?.metadata.get(id).cloned()
    }

    pub fn bytes_accepted(&self) -> u64 {
        self.inner.lock().map(|i| i.bytes_accepted).unwrap_or(0)
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn committed_offset(&mut self, id: &SegmentId) -> Result<u64, UploadError> {
        let inner = self.guard()?;
        Ok(inner.objects.get(id).map(|o| o.len() as u64).unwrap_or(0))
    }

    fn put_chunk(
        &mut self,
        id: &SegmentId,
        offset: u64,
        chunk: &[u8],
    ) -> Result<u64, UploadError> {
        let mut inner = self.guard()?;

        if let Some(reason) = &inner.permanent_put_reason {
            return Err(UploadError::Permanent(reason.clone()));
        }
        if inner.transient_put_failures > 0 {
            inner.transient_put_failures -= 1;
            return Err(UploadError::Transient("scripted network failure".into()));
        }
        if let Some(limit) = inner.fail_put_after_bytes {
            if inner.bytes_accepted + chunk.len() as u64 > limit {
                inner.fail_put_after_bytes = None;
                return Err(UploadError::Transient("connection dropped".into()));
            }
        }

        let object = inner.objects.entry(id.clone()).or_default();
        let committed = object.len() as u64;
        if offset > committed {
            return Err(UploadError::Permanent(format!(
                "gap in upload: offset {} past committed {}",
                offset, committed
            )));
        }
        // Overlapping range: drop the already-committed prefix (idempotent).
        let skip = (committed - offset) as usize;
        if skip >= chunk.len() {
            return Ok(committed);
        }
        let fresh = &chunk[skip..];
        object.extend_from_slice(fresh);
        let new_committed = object.len() as u64;
        inner.bytes_accepted += fresh.len() as u64;
        Ok(new_committed)
    }

    fn finalize(
        &mut self,
        id: &SegmentId,
        checksum: [u8; 32],
        total_len: u64,
    ) -> Result<(), UploadError> {
        let mut inner = self.guard()?;
        let len = inner.objects.get(id).map(|o| o.len() as u64).unwrap_or(0);
        if len != total_len {
            return Err(UploadError::Transient(format!(
                "finalize with incomplete object: {} of {} bytes",
                len, total_len
            )));
        }
        match inner.finalized.get(id) {
            // Already sealed with the same content: no-op, no duplicate.
            Some(existing) if *existing == checksum => Ok(()),
            Some(_) => Err(UploadError::Permanent(
                "finalize checksum mismatch with existing object".into(),
            )),
            None => {
                inner.finalized.insert(id.clone(), checksum);
                inner.finalized_order.push(id.clone());
                Ok(())
            }
        }
    }

    fn put_metadata(&mut self, id: &SegmentId, meta_json: &str) -> Result<(), UploadError> {
        let mut inner = self.guard()?;
        inner.metadata.insert(id.clone(), meta_json.to_string());
        Ok(())
    }
}
