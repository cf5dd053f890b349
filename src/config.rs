use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::buffer::RetentionPolicy;
use crate::redact::FailurePolicy;

const DEFAULT_DEVICE_ID: &str = "device:rear_cam";
const DEFAULT_DATA_DIR: &str = "evidence_data";
const DEFAULT_FPS: u32 = 10;
const DEFAULT_SEGMENT_SECONDS: u32 = 15;
const DEFAULT_REACQUIRE_ATTEMPTS: u32 = 3;
const DEFAULT_REACQUIRE_PAUSE_MS: u64 = 500;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DEFAULT_SAMPLE_INTERVAL: u32 = 5;
const DEFAULT_REDACTION_WORKERS: usize = 2;
const DEFAULT_LOCATION_STALENESS_SECS: u64 = 120;
const DEFAULT_LOCATION_FIX_TIMEOUT_MS: u64 = 500;
const DEFAULT_QUOTA_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_UPLOAD_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_UPLOAD_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_UPLOAD_MAX_BACKOFF_MS: u64 = 60_000;
const DEFAULT_UPLOAD_CHUNK_BYTES: usize = 256 * 1024;

#[derive(Debug, Deserialize, Default)]
struct EvidencedConfigFile {
    device_id: Option<String>,
    data_dir: Option<String>,
    capture: Option<CaptureConfigFile>,
    redaction: Option<RedactionConfigFile>,
    location: Option<LocationConfigFile>,
    buffer: Option<BufferConfigFile>,
    upload: Option<UploadConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    fps: Option<u32>,
    segment_seconds: Option<u32>,
    reacquire_attempts: Option<u32>,
    reacquire_pause_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RedactionConfigFile {
    confidence_threshold: Option<f32>,
    sample_interval: Option<u32>,
    workers: Option<usize>,
    failure_policy: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LocationConfigFile {
    staleness_secs: Option<u64>,
    fix_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BufferConfigFile {
    quota_bytes: Option<u64>,
    retention_policy: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct UploadConfigFile {
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    chunk_bytes: Option<usize>,
    base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EvidencedConfig {
    pub device_id: String,
    pub data_dir: PathBuf,
    pub capture: CaptureSettings,
    pub redaction: RedactionSettings,
    pub location: LocationSettings,
    pub buffer: BufferSettings,
    pub upload: UploadSettings,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub fps: u32,
    pub segment_seconds: u32,
    pub reacquire_attempts: u32,
    pub reacquire_pause: Duration,
}

impl CaptureSettings {
    pub fn frames_per_segment(&self) -> u32 {
        self.fps * self.segment_seconds
    }
}

#[derive(Debug, Clone)]
pub struct RedactionSettings {
    pub confidence_threshold: f32,
    pub sample_interval: u32,
    pub workers: usize,
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone)]
pub struct LocationSettings {
    pub staleness: Duration,
    pub fix_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub quota_bytes: u64,
    pub retention_policy: RetentionPolicy,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub chunk_bytes: usize,
    /// Storage gateway URL. None selects the in-memory store (demo mode).
    pub base_url: Option<String>,
}

impl EvidencedConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("EVIDENCE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EvidencedConfigFile) -> Result<Self> {
        let device_id = file
            .device_id
            .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string());
        let data_dir = PathBuf::from(file.data_dir.unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()));
        let capture = {
            let c = file.capture.unwrap_or_default();
            CaptureSettings {
                fps: c.fps.unwrap_or(DEFAULT_FPS),
                segment_seconds: c.segment_seconds.unwrap_or(DEFAULT_SEGMENT_SECONDS),
                reacquire_attempts: c.reacquire_attempts.unwrap_or(DEFAULT_REACQUIRE_ATTEMPTS),
                reacquire_pause: Duration::from_millis(
                    c.reacquire_pause_ms.unwrap_or(DEFAULT_REACQUIRE_PAUSE_MS),
                ),
            }
        };
        let redaction = {
            let r = file.redaction.unwrap_or_default();
            RedactionSettings {
                confidence_threshold: r
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                sample_interval: r.sample_interval.unwrap_or(DEFAULT_SAMPLE_INTERVAL),
                workers: r.workers.unwrap_or(DEFAULT_REDACTION_WORKERS),
                failure_policy: match r.failure_policy {
                    Some(policy) => FailurePolicy::parse(&policy)?,
                    None => FailurePolicy::Block,
                },
            }
        };
        let location = {
            let l = file.location.unwrap_or_default();
            LocationSettings {
                staleness: Duration::from_secs(
                    l.staleness_secs.unwrap_or(DEFAULT_LOCATION_STALENESS_SECS),
                ),
                fix_timeout: Duration::from_millis(
                    l.fix_timeout_ms.unwrap_or(DEFAULT_LOCATION_FIX_TIMEOUT_MS),
                ),
            }
        };
        let buffer = {
            let b = file.buffer.unwrap_or_default();
            BufferSettings {
                quota_bytes: b.quota_bytes.unwrap_or(DEFAULT_QUOTA_BYTES),
                retention_policy: match b.retention_policy {
                    Some(policy) => RetentionPolicy::parse(&policy)?,
                    None => RetentionPolicy::Strict,
                },
            }
        };
        let upload = {
            let u = file.upload.unwrap_or_default();
            UploadSettings {
                max_attempts: u.max_attempts.unwrap_or(DEFAULT_UPLOAD_MAX_ATTEMPTS),
                initial_backoff: Duration::from_millis(
                    u.initial_backoff_ms
                        .unwrap_or(DEFAULT_UPLOAD_INITIAL_BACKOFF_MS),
                ),
                max_backoff: Duration::from_millis(
                    u.max_backoff_ms.unwrap_or(DEFAULT_UPLOAD_MAX_BACKOFF_MS),
                ),
                chunk_bytes: u.chunk_bytes.unwrap_or(DEFAULT_UPLOAD_CHUNK_BYTES),
                base_url: u.base_url,
            }
        };
        Ok(Self {
            device_id,
            data_dir,
            capture,
            redaction,
            location,
            buffer,
            upload,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device_id) = std::env::var("EVIDENCE_DEVICE_ID") {
            if !device_id.trim().is_empty() {
                self.device_id = device_id;
            }
        }
        if let Ok(data_dir) = std::env::var("EVIDENCE_DATA_DIR") {
            if !data_dir.trim().is_empty() {
                self.data_dir = PathBuf::from(data_dir);
            }
        }
        if let Ok(quota) = std::env::var("EVIDENCE_QUOTA_BYTES") {
            let bytes: u64 = quota
                .parse()
                .map_err(|_| anyhow!("EVIDENCE_QUOTA_BYTES must be an integer byte count"))?;
            self.buffer.quota_bytes = bytes;
        }
        if let Ok(policy) = std::env::var("EVIDENCE_RETENTION_POLICY") {
            if !policy.trim().is_empty() {
                self.buffer.retention_policy = RetentionPolicy::parse(&policy)?;
            }
        }
        if let Ok(policy) = std::env::var("EVIDENCE_FAILURE_POLICY") {
            if !policy.trim().is_empty() {
                self.redaction.failure_policy = FailurePolicy::parse(&policy)?;
            }
        }
        if let Ok(base_url) = std::env::var("EVIDENCE_UPLOAD_BASE_URL") {
            if !base_url.trim().is_empty() {
                self.upload.base_url = Some(base_url);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        crate::validate_device_id(&self.device_id)?;
        self.device_id = self.device_id.to_lowercase();

        if self.capture.fps == 0 {
            return Err(anyhow!("capture fps must be greater than zero"));
        }
        if !(1..=60).contains(&self.capture.segment_seconds) {
            return Err(anyhow!("segment_seconds must be within 1..=60"));
        }
        if !(0.0..=1.0).contains(&self.redaction.confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within 0..=1"));
        }
        if self.redaction.sample_interval == 0 {
            return Err(anyhow!("sample_interval must be >= 1"));
        }
        if self.redaction.workers == 0 {
            return Err(anyhow!("redaction workers must be >= 1"));
        }
        if self.buffer.quota_bytes == 0 {
            return Err(anyhow!("buffer quota_bytes must be greater than zero"));
        }
        if self.upload.max_attempts == 0 {
            return Err(anyhow!("upload max_attempts must be >= 1"));
        }
        if self.upload.chunk_bytes == 0 {
            return Err(anyhow!("upload chunk_bytes must be >= 1"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<EvidencedConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
