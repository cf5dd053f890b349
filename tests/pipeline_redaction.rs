//! End-to-end redaction invariants: nothing unredacted can reach the
//! buffer, and the confidence threshold decides which faces are blurred.

use std::time::Duration;

use evidence_pipeline::capture::{StubCamera, StubCameraConfig, StubFace};
use evidence_pipeline::pipeline::{PipelineConfig, PipelineSupervisor, SessionContext};
use evidence_pipeline::upload::UploadConfig;
use evidence_pipeline::{
    FailurePolicy, LocationSample, LocationTagger, MemoryRemoteStore, RetentionPolicy, Redactor,
    SegmentBuffer, SegmentMeta, SegmentSource, StaticLocationProvider, StubFaceDetector,
    UploadWorker,
};

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = std::time::Instant::now() + deadline;
    while std::time::Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn everything_in_the_buffer_is_redacted() {
    let dir = tempfile::tempdir().unwrap();
    let camera = StubCamera::new(StubCameraConfig {
        width: 48,
        height: 32,
        frame_interval_ms: 1,
        faces: vec![StubFace {
            x: 10,
            y: 10,
            w: 8,
            h: 8,
            confidence: 0.9,
        }],
        ..StubCameraConfig::default()
    });
    let source =
        SegmentSource::new(camera, "device:cam", 6, 2, Duration::from_millis(1)).unwrap();
    let redactors = vec![
        Redactor::new(Box::new(StubFaceDetector::new()), 0.5, 3).unwrap(),
        Redactor::new(Box::new(StubFaceDetector::new()), 0.5, 3).unwrap(),
    ];
    let now = evidence_pipeline::now_ms().unwrap();
    let tagger = LocationTagger::new(
        Box::new(StaticLocationProvider::new(Some(LocationSample {
            lat: 48.2,
            lon: 16.37,
            accuracy_m: 8.0,
            sampled_at_ms: now,
        }))),
        Duration::from_secs(600),
        Duration::from_millis(5),
    );
    let buffer = SegmentBuffer::open(dir.path(), 100_000_000, RetentionPolicy::Strict).unwrap();
    let store = MemoryRemoteStore::new();
    let uploader = UploadWorker::new(
        Box::new(store.clone()),
        UploadConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            chunk_bytes: 8192,
        },
    )
    .unwrap();

    let supervisor = PipelineSupervisor::spawn(
        SessionContext::new("device:cam").unwrap(),
        source,
        redactors,
        tagger,
        buffer,
        uploader,
        PipelineConfig {
            failure_policy: FailurePolicy::Block,
            idle_poll: Duration::from_millis(10),
            ..PipelineConfig::default()
        },
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        store.finalized_order().len() >= 2
    }));
    let buffer = supervisor.buffer();
    supervisor.shutdown().unwrap();

    // Every ledger record that carries media was redacted before enqueue,
    // and the metadata the remote received says so too.
    let records = buffer.lock().unwrap().list(None).unwrap();
    assert!(!records.is_empty());
    for record in &records {
        if record.blob_len == 0 {
            continue;
        }
        let meta = record.meta().unwrap();
        assert!(meta.redaction_applied, "segment {} unredacted", record.segment_id);
        assert!(meta.regions_redacted >= 1);
        assert_eq!(meta.location.map(|l| l.lat), Some(48.2));
    }
    for id in store.finalized_order() {
        let meta: SegmentMeta =
            serde_json::from_str(&store.metadata(&id).unwrap()).unwrap();
        assert!(meta.redaction_applied);
    }
}

#[test]
fn low_confidence_face_is_left_alone() {
    // A 15-second segment at 1 fps with two faces: 0.9 and 0.4 confidence.
    // At threshold 0.5, exactly one region is redacted.
    let camera = StubCamera::new(StubCameraConfig {
        width: 64,
        height: 48,
        frame_interval_ms: 1000,
        faces: vec![
            StubFace {
                x: 6,
                y: 6,
                w: 10,
                h: 10,
                confidence: 0.9,
            },
            StubFace {
                x: 40,
                y: 28,
                w: 10,
                h: 10,
                confidence: 0.4,
            },
        ],
        ..StubCameraConfig::default()
    });
    let mut source =
        SegmentSource::new(camera, "device:cam", 15, 2, Duration::from_millis(1)).unwrap();
    let raw = source.next_segment().unwrap();
    assert_eq!(raw.capture_end_ms() - raw.capture_start_ms(), 14_000);

    let mut redactor = Redactor::new(Box::new(StubFaceDetector::new()), 0.5, 5).unwrap();
    let segment = redactor.redact(raw).unwrap();

    assert_eq!(segment.meta.regions_redacted, 1);
    assert_eq!(segment.meta.frame_count, 15);

    // The low-confidence face's marker pixels survive in every frame.
    let stride = 64usize * 48 * 3;
    for frame in 0..15usize {
        let offset = frame * stride + (30 * 64 + 42) * 3;
        assert_eq!(segment.blob()[offset], 255);
        assert_eq!(segment.blob()[offset + 1], 0);
    }
}

#[test]
fn redactor_failure_never_yields_a_segment() {
    let camera = StubCamera::new(StubCameraConfig {
        width: 16,
        height: 16,
        frame_interval_ms: 1,
        ..StubCameraConfig::default()
    });
    let mut source =
        SegmentSource::new(camera, "device:cam", 4, 2, Duration::from_millis(1)).unwrap();
    let raw = source.next_segment().unwrap();

    let mut redactor =
        Redactor::new(Box::new(StubFaceDetector::new().with_failure_after(0)), 0.5, 2).unwrap();
    assert!(redactor.redact(raw).is_err());
}
