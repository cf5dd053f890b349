//! Resumable, ordered, idempotent upload behavior against a scripted
//! remote.

use std::sync::Mutex;
use std::time::Duration;

use evidence_pipeline::capture::{StubCamera, StubCameraConfig};
use evidence_pipeline::upload::{UploadConfig, UploadOutcome};
use evidence_pipeline::{
    MemoryRemoteStore, RedactedSegment, RetentionPolicy, Redactor, SegmentBuffer, SegmentSource,
    StubFaceDetector, SyncState, UploadWorker,
};

fn make_segments(count: usize) -> Vec<RedactedSegment> {
    let camera = StubCamera::new(StubCameraConfig {
        width: 20,
        height: 20,
        frame_interval_ms: 100,
        ..StubCameraConfig::default()
    });
    let mut source =
        SegmentSource::new(camera, "device:cam", 5, 2, Duration::from_millis(1)).unwrap();
    let mut redactor = Redactor::new(Box::new(StubFaceDetector::new()), 0.5, 2).unwrap();
    (0..count)
        .map(|_| redactor.redact(source.next_segment().unwrap()).unwrap())
        .collect()
}

fn quick_config() -> UploadConfig {
    UploadConfig {
        max_attempts: 4,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        chunk_bytes: 100,
    }
}

#[test]
fn network_drop_at_forty_percent_resumes_not_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = Mutex::new(
        SegmentBuffer::open(dir.path(), 10_000_000, RetentionPolicy::Strict).unwrap(),
    );
    let segments = make_segments(1);
    let blob_len = segments[0].meta.blob_len;
    buffer.lock().unwrap().enqueue(&segments[0]).unwrap();

    let store = MemoryRemoteStore::new();
    store.fail_put_after_bytes(blob_len * 2 / 5);

    let mut worker = UploadWorker::new(Box::new(store.clone()), quick_config()).unwrap();
    let outcome = worker.upload_next(&buffer).unwrap();
    assert!(matches!(outcome, UploadOutcome::Confirmed(_)));

    // Total bytes accepted equals the blob length: the resume sent only
    // the remaining tail, never byte zero again.
    assert_eq!(store.bytes_accepted(), blob_len);
    assert_eq!(
        store.object(&segments[0].meta.id).unwrap(),
        segments[0].blob()
    );
}

#[test]
fn confirmed_segment_is_never_reuploaded() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = Mutex::new(
        SegmentBuffer::open(dir.path(), 10_000_000, RetentionPolicy::Strict).unwrap(),
    );
    let segments = make_segments(1);
    buffer.lock().unwrap().enqueue(&segments[0]).unwrap();

    let store = MemoryRemoteStore::new();
    let mut worker = UploadWorker::new(Box::new(store.clone()), quick_config()).unwrap();
    assert!(matches!(
        worker.upload_next(&buffer).unwrap(),
        UploadOutcome::Confirmed(_)
    ));

    for _ in 0..3 {
        assert_eq!(worker.upload_next(&buffer).unwrap(), UploadOutcome::Idle);
    }
    assert_eq!(store.object_count(), 1);
    assert_eq!(store.bytes_accepted(), segments[0].meta.blob_len);

    // The same id cannot even be enqueued a second time.
    assert!(buffer.lock().unwrap().enqueue(&segments[0]).is_err());
}

#[test]
fn remote_receives_strict_capture_order() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = Mutex::new(
        SegmentBuffer::open(dir.path(), 10_000_000, RetentionPolicy::Strict).unwrap(),
    );
    let segments = make_segments(4);
    // Enqueue in scrambled completion order, as a redaction pool would.
    for index in [2usize, 0, 3, 1] {
        buffer.lock().unwrap().enqueue(&segments[index]).unwrap();
    }

    let store = MemoryRemoteStore::new();
    let mut worker = UploadWorker::new(Box::new(store.clone()), quick_config()).unwrap();
    while worker.upload_next(&buffer).unwrap() != UploadOutcome::Idle {}

    let starts: Vec<u64> = store
        .finalized_order()
        .iter()
        .map(|id| {
            let record = buffer.lock().unwrap().get(id).unwrap().unwrap();
            record.capture_start_ms
        })
        .collect();
    assert_eq!(starts.len(), 4);
    assert!(starts.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn exhausted_retries_surface_and_keep_media() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = Mutex::new(
        SegmentBuffer::open(dir.path(), 10_000_000, RetentionPolicy::Strict).unwrap(),
    );
    let segments = make_segments(1);
    let id = segments[0].meta.id.clone();
    buffer.lock().unwrap().enqueue(&segments[0]).unwrap();

    let store = MemoryRemoteStore::new();
    store.fail_puts_with_transient(1000);

    let mut worker = UploadWorker::new(Box::new(store.clone()), quick_config()).unwrap();
    match worker.upload_next(&buffer).unwrap() {
        UploadOutcome::Failed(failed_id, reason) => {
            assert_eq!(failed_id, id);
            assert!(reason.contains("retries exhausted"));
        }
        other => panic!("expected Failed, got {:?}", other),
    }

    let record = buffer.lock().unwrap().get(&id).unwrap().unwrap();
    assert!(matches!(record.state, SyncState::Failed(_)));
    assert_eq!(record.attempts, 4);
    // Media is retained locally for manual retry.
    assert!(buffer.lock().unwrap().read_blob(&record).is_ok());
}
