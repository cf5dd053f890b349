use std::sync::Mutex;

use tempfile::NamedTempFile;

use evidence_pipeline::config::EvidencedConfig;
use evidence_pipeline::{FailurePolicy, RetentionPolicy};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "EVIDENCE_CONFIG",
        "EVIDENCE_DEVICE_ID",
        "EVIDENCE_DATA_DIR",
        "EVIDENCE_QUOTA_BYTES",
        "EVIDENCE_RETENTION_POLICY",
        "EVIDENCE_FAILURE_POLICY",
        "EVIDENCE_UPLOAD_BASE_URL",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "device_id": "device:front_cam",
        "data_dir": "/var/lib/evidence",
        "capture": {
            "fps": 12,
            "segment_seconds": 20,
            "reacquire_attempts": 5
        },
        "redaction": {
            "confidence_threshold": 0.6,
            "sample_interval": 4,
            "workers": 3,
            "failure_policy": "drop"
        },
        "location": {
            "staleness_secs": 60,
            "fix_timeout_ms": 250
        },
        "buffer": {
            "quota_bytes": 1048576,
            "retention_policy": "evict_oldest"
        },
        "upload": {
            "max_attempts": 7,
            "chunk_bytes": 65536,
            "base_url": "https://storage.example/v1"
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("EVIDENCE_CONFIG", file.path());
    std::env::set_var("EVIDENCE_DEVICE_ID", "device:rear_cam");
    std::env::set_var("EVIDENCE_QUOTA_BYTES", "2097152");

    let cfg = EvidencedConfig::load().expect("load config");

    // Env overrides beat the file; the rest comes from the file.
    assert_eq!(cfg.device_id, "device:rear_cam");
    assert_eq!(cfg.data_dir.to_str().unwrap(), "/var/lib/evidence");
    assert_eq!(cfg.capture.fps, 12);
    assert_eq!(cfg.capture.segment_seconds, 20);
    assert_eq!(cfg.capture.frames_per_segment(), 240);
    assert_eq!(cfg.capture.reacquire_attempts, 5);
    assert!((cfg.redaction.confidence_threshold - 0.6).abs() < 1e-6);
    assert_eq!(cfg.redaction.sample_interval, 4);
    assert_eq!(cfg.redaction.workers, 3);
    assert_eq!(cfg.redaction.failure_policy, FailurePolicy::Drop);
    assert_eq!(cfg.location.staleness.as_secs(), 60);
    assert_eq!(cfg.location.fix_timeout.as_millis(), 250);
    assert_eq!(cfg.buffer.quota_bytes, 2_097_152);
    assert_eq!(cfg.buffer.retention_policy, RetentionPolicy::EvictOldest);
    assert_eq!(cfg.upload.max_attempts, 7);
    assert_eq!(cfg.upload.chunk_bytes, 65536);
    assert_eq!(
        cfg.upload.base_url.as_deref(),
        Some("https://storage.example/v1")
    );

    clear_env();
}

#[test]
fn defaults_apply_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = EvidencedConfig::load().expect("load defaults");
    assert_eq!(cfg.device_id, "device:rear_cam");
    assert_eq!(cfg.capture.fps, 10);
    assert_eq!(cfg.capture.segment_seconds, 15);
    assert_eq!(cfg.redaction.failure_policy, FailurePolicy::Block);
    assert_eq!(cfg.buffer.retention_policy, RetentionPolicy::Strict);
    assert!(cfg.upload.base_url.is_none());

    clear_env();
}

#[test]
fn invalid_device_id_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("EVIDENCE_DEVICE_ID", "rear cam");
    assert!(EvidencedConfig::load().is_err());

    clear_env();
}
