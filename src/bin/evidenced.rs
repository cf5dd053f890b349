//! evidenced - background evidence pipeline daemon
//!
//! This daemon:
//! 1. Captures bounded-duration segments from the configured device
//! 2. Redacts bystander faces on-device (fail-closed)
//! 3. Tags segments with the last known location, when fresh
//! 4. Spools redacted segments to the durable, quota-bounded buffer
//! 5. Uploads them in capture order with resume and bounded retries
//! 6. Purges confirmed local media, keeping ledger records for audit
//!
//! Without an upload base_url it runs against an in-memory remote: useful
//! for demos and soak tests, useless for durability, and loud about it.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use evidence_pipeline::pipeline::{PipelineConfig, PipelineControl, PipelineSupervisor, SessionContext};
use evidence_pipeline::upload::UploadConfig;
use evidence_pipeline::{
    EvidencedConfig, LocationSample, LocationTagger, MemoryRemoteStore, Redactor, RemoteStore,
    SegmentBuffer, SegmentSource, StaticLocationProvider, StubCamera, StubFaceDetector,
    UploadWorker,
};
use evidence_pipeline::capture::StubCameraConfig;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = EvidencedConfig::load()?;
    log::info!(
        "evidenced starting for {} (data dir {})",
        cfg.device_id,
        cfg.data_dir.display()
    );

    std::fs::create_dir_all(&cfg.data_dir)?;
    let buffer = SegmentBuffer::open(
        &cfg.data_dir,
        cfg.buffer.quota_bytes,
        cfg.buffer.retention_policy,
    )?;
    let resume_seq = buffer.next_seq(&cfg.device_id)?;
    if resume_seq > 0 {
        log::info!("resuming segment numbering at {}", resume_seq);
    }

    // The camera is an external collaborator; the stub device stands in for
    // the platform capture stack here, as the stub detector does for the
    // inference runtime.
    let camera = StubCamera::new(StubCameraConfig {
        width: 160,
        height: 120,
        frame_interval_ms: 1000 / cfg.capture.fps.max(1) as u64,
        ..StubCameraConfig::default()
    });
    let mut source = SegmentSource::new(
        camera,
        &cfg.device_id,
        cfg.capture.frames_per_segment(),
        cfg.capture.reacquire_attempts,
        cfg.capture.reacquire_pause,
    )?;
    source.resume_from_seq(resume_seq);

    let mut redactors = Vec::with_capacity(cfg.redaction.workers);
    for _ in 0..cfg.redaction.workers {
        let mut redactor = Redactor::new(
            Box::new(StubFaceDetector::new()),
            cfg.redaction.confidence_threshold,
            cfg.redaction.sample_interval,
        )?;
        // Surface model unavailability before the camera is acquired.
        redactor.warm_up().map_err(|e| anyhow!("{}", e))?;
        redactors.push(redactor);
    }

    let tagger = LocationTagger::new(
        Box::new(StaticLocationProvider::new(static_location_from_env()?)),
        cfg.location.staleness,
        cfg.location.fix_timeout,
    );

    let store = build_remote_store(&cfg)?;
    let uploader = UploadWorker::new(
        store,
        UploadConfig {
            max_attempts: cfg.upload.max_attempts,
            initial_backoff: cfg.upload.initial_backoff,
            max_backoff: cfg.upload.max_backoff,
            chunk_bytes: cfg.upload.chunk_bytes,
        },
    )?;

    let session = SessionContext::new(&cfg.device_id)?;
    let supervisor = PipelineSupervisor::spawn(
        session,
        source,
        redactors,
        tagger,
        buffer,
        uploader,
        PipelineConfig {
            failure_policy: cfg.redaction.failure_policy,
            ..PipelineConfig::default()
        },
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let buffer_handle = supervisor.buffer();
    let mut last_health_log = Instant::now();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            log::info!("shutdown requested; flushing in-flight segments");
            supervisor.control(PipelineControl::Stop);
            break;
        }
        if supervisor.is_stopped() {
            break;
        }
        if last_health_log.elapsed() >= Duration::from_secs(5) {
            if let Ok(mut guard) = buffer_handle.lock() {
                // Sweep confirmed media that the upload path has not purged
                // yet (for example after a restart).
                if let Err(err) = guard.purge_confirmed() {
                    log::warn!("purge sweep failed: {}", err);
                }
                let spooled = guard.spooled_bytes().unwrap_or(0);
                let unconfirmed = guard.unconfirmed_count().unwrap_or(0);
                log::info!(
                    "health: {} unconfirmed segment(s), ~{} KB spooled",
                    unconfirmed,
                    spooled / 1024
                );
            }
            last_health_log = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    supervisor.shutdown()?;
    log::info!("evidenced stopped");
    Ok(())
}

fn build_remote_store(cfg: &EvidencedConfig) -> Result<Box<dyn RemoteStore>> {
    match &cfg.upload.base_url {
        Some(base_url) => {
            #[cfg(feature = "upload-http")]
            {
                use evidence_pipeline::upload::http::{HttpRemoteStore, HttpRemoteStoreConfig};
                let store = HttpRemoteStore::new(HttpRemoteStoreConfig {
                    base_url: base_url.clone(),
                    auth_token: std::env::var("EVIDENCE_UPLOAD_TOKEN").ok(),
                    ..HttpRemoteStoreConfig::default()
                })?;
                log::info!("uploading to {}", base_url);
                Ok(Box::new(store))
            }
            #[cfg(not(feature = "upload-http"))]
            {
                Err(anyhow!(
                    "upload.base_url set ({}) but evidenced was built without the upload-http feature",
                    base_url
                ))
            }
        }
        None => {
            log::warn!("no upload.base_url configured; using in-memory remote (demo mode)");
            Ok(Box::new(MemoryRemoteStore::new()))
        }
    }
}

/// Optional fixed location for deployments without a live provider:
/// EVIDENCE_STATIC_LOCATION="52.52,13.405".
fn static_location_from_env() -> Result<Option<LocationSample>> {
    let Ok(raw) = std::env::var("EVIDENCE_STATIC_LOCATION") else {
        return Ok(None);
    };
    let (lat, lon) = raw
        .split_once(',')
        .ok_or_else(|| anyhow!("EVIDENCE_STATIC_LOCATION must be 'lat,lon'"))?;
    let lat: f64 = lat
        .trim()
        .parse()
        .map_err(|_| anyhow!("EVIDENCE_STATIC_LOCATION latitude is not a number"))?;
    let lon: f64 = lon
        .trim()
        .parse()
        .map_err(|_| anyhow!("EVIDENCE_STATIC_LOCATION longitude is not a number"))?;
    Ok(Some(LocationSample {
        lat,
        lon,
        accuracy_m: 0.0,
        sampled_at_ms: evidence_pipeline::now_ms()?,
    }))
}
