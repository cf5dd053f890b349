//! Pipeline supervisor.
//!
//! Owns the worker threads and the session context:
//!
//! - one capture producer, chunking the device stream into raw segments
//! - a pool of redaction workers (parallel across segments, never across
//!   frames of one segment, so box tracking stays continuous)
//! - one upload worker, draining the buffer in capture-time order
//!
//! Control is explicit Start/Pause/Resume/Stop messages, independent of any
//! host lifecycle callbacks. Stopping closes the capture channel and lets
//! the redaction workers flush every in-flight segment through redaction
//! before they exit; partially captured raw data is zeroized and never
//! persisted.
//!
//! The segment buffer (with its ledger) is the only shared mutable state,
//! behind a single mutex, so each segment key has exactly one owner at any
//! time.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer::{QuotaExceeded, SegmentBuffer};
use crate::capture::{CaptureDevice, RawSegment, SegmentSource};
use crate::redact::{FailurePolicy, Redactor};
use crate::tag::LocationTagger;
use crate::upload::{UploadOutcome, UploadWorker};
use crate::RedactedSegment;

/// Explicit session object replacing any global "current recording
/// session" state. The supervisor owns its lifetime and hands references
/// to each component.
#[derive(Clone, Debug)]
pub struct SessionContext {
    pub device_id: String,
    pub session_started_ms: u64,
}

impl SessionContext {
    pub fn new(device_id: &str) -> Result<Self> {
        crate::validate_device_id(device_id)?;
        Ok(Self {
            device_id: device_id.to_lowercase(),
            session_started_ms: crate::now_ms()?,
        })
    }
}

/// Control messages understood by the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineControl {
    /// Halt capture; redaction and upload keep draining what exists.
    Pause,
    Resume,
    /// Shut down: capture stops, in-flight segments flush through
    /// redaction, workers exit.
    Stop,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// How to react when the detector is unavailable. Both choices fail
    /// closed.
    pub failure_policy: FailurePolicy,
    /// Raw segments buffered between capture and redaction. Small by
    /// design: raw media in memory is exposure.
    pub queue_depth: usize,
    /// How long the producer waits before retrying a full buffer.
    pub backpressure_pause: Duration,
    /// Upload worker poll interval when the buffer is drained.
    pub idle_poll: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Block,
            queue_depth: 2,
            backpressure_pause: Duration::from_millis(200),
            idle_poll: Duration::from_millis(500),
        }
    }
}

struct ControlState {
    stop: AtomicBool,
    paused: AtomicBool,
    fatal: Mutex<Option<String>>,
}

impl ControlState {
    fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            fatal: Mutex::new(None),
        }
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Record a fatal error and stop the pipeline instance. First error
    /// wins; later ones are logged by their originating stage.
    fn fail(&self, message: String) {
        if let Ok(mut fatal) = self.fatal.lock() {
            if fatal.is_none() {
                *fatal = Some(message);
            }
        }
        self.stop.store(true, Ordering::SeqCst);
    }
}

pub struct PipelineSupervisor {
    session: SessionContext,
    control: Arc<ControlState>,
    buffer: Arc<Mutex<SegmentBuffer>>,
    threads: Vec<JoinHandle<()>>,
}

impl PipelineSupervisor {
    /// Spawn the pipeline. The redactor pool size is the number of
    /// redactors supplied; each worker owns one (detection state is
    /// per-segment, never shared across workers).
    pub fn spawn<D: CaptureDevice + 'static>(
        session: SessionContext,
        mut source: SegmentSource<D>,
        redactors: Vec<Redactor>,
        tagger: LocationTagger,
        buffer: SegmentBuffer,
        uploader: UploadWorker,
        config: PipelineConfig,
    ) -> Result<Self> {
        if redactors.is_empty() {
            return Err(anyhow!("pipeline needs at least one redactor"));
        }
        if config.queue_depth == 0 {
            return Err(anyhow!("pipeline queue_depth must be >= 1"));
        }

        let control = Arc::new(ControlState::new());
        let buffer = Arc::new(Mutex::new(buffer));
        let tagger = Arc::new(tagger);
        let (tx, rx) = mpsc::sync_channel::<RawSegment>(config.queue_depth);
        let rx = Arc::new(Mutex::new(rx));

        let mut threads = Vec::new();

        {
            let control = control.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("capture".into())
                    .spawn(move || capture_loop(&mut source, tx, &control))?,
            );
        }

        for (i, mut redactor) in redactors.into_iter().enumerate() {
            let control = control.clone();
            let buffer = buffer.clone();
            let tagger = tagger.clone();
            let rx = rx.clone();
            let config = config.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("redact-{}", i))
                    .spawn(move || {
                        redaction_loop(&mut redactor, &rx, &tagger, &buffer, &control, &config)
                    })?,
            );
        }

        {
            let control = control.clone();
            let buffer = buffer.clone();
            let config = config.clone();
            let mut uploader = uploader;
            threads.push(
                std::thread::Builder::new()
                    .name("upload".into())
                    .spawn(move || upload_loop(&mut uploader, &buffer, &control, &config))?,
            );
        }

        log::info!(
            "pipeline started for {} (session {})",
            session.device_id,
            session.session_started_ms
        );

        Ok(Self {
            session,
            control,
            buffer,
            threads,
        })
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn control(&self, message: PipelineControl) {
        match message {
            PipelineControl::Pause => {
                log::info!("pipeline paused (capture halted, sync continues)");
                self.control.paused.store(true, Ordering::SeqCst);
            }
            PipelineControl::Resume => {
                log::info!("pipeline resumed");
                self.control.paused.store(false, Ordering::SeqCst);
            }
            PipelineControl::Stop => {
                self.control.stop.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Shared access to the buffer for inspection (health logging, purge
    /// sweeps). All mutation still goes through the same mutex the workers
    /// use.
    pub fn buffer(&self) -> Arc<Mutex<SegmentBuffer>> {
        self.buffer.clone()
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.control
            .fatal
            .lock()
            .ok()
            .and_then(|fatal| fatal.clone())
    }

    pub fn is_stopped(&self) -> bool {
        self.control.stopping()
    }

    /// Stop and join every worker. Returns the first fatal error, if the
    /// pipeline died rather than being asked to stop.
    pub fn shutdown(mut self) -> Result<()> {
        self.control(PipelineControl::Stop);
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                log::error!("pipeline worker panicked during shutdown");
            }
        }
        match self.fatal_error() {
            Some(message) => Err(anyhow!("pipeline failed: {}", message)),
            None => Ok(()),
        }
    }
}

fn capture_loop<D: CaptureDevice>(
    source: &mut SegmentSource<D>,
    tx: SyncSender<RawSegment>,
    control: &ControlState,
) {
    loop {
        if control.stopping() {
            break;
        }
        if control.paused() {
            std::thread::sleep(Duration::from_millis(50));
            continue;
        }
        match source.next_segment() {
            Ok(raw) => {
                // A full queue blocks here: raw-segment backpressure.
                if tx.send(raw).is_err() {
                    break;
                }
            }
            Err(err) => {
                // Re-acquisition was already attempted inside the source;
                // this is fatal to the pipeline instance.
                control.fail(format!("capture failed: {}", err));
                break;
            }
        }
    }
    // Deterministic hardware release, then channel close: the redaction
    // workers drain whatever was in flight and exit.
    source.stop();
}

fn redaction_loop(
    redactor: &mut Redactor,
    rx: &Mutex<Receiver<RawSegment>>,
    tagger: &LocationTagger,
    buffer: &Mutex<SegmentBuffer>,
    control: &ControlState,
    config: &PipelineConfig,
) {
    loop {
        let raw = {
            let Ok(guard) = rx.lock() else {
                control.fail("redaction queue lock poisoned".into());
                return;
            };
            guard.recv()
        };
        let Ok(raw) = raw else {
            // Channel closed: capture is done and the backlog is flushed.
            return;
        };
        let raw_id = raw.id().clone();
        let raw_start_ms = raw.capture_start_ms();

        match redactor.redact(raw) {
            Ok(mut segment) => {
                tagger.tag(&mut segment.meta);
                enqueue_with_backpressure(buffer, &segment, control, config);
            }
            Err(err) => match config.failure_policy {
                FailurePolicy::Block => {
                    control.fail(format!("redaction unavailable, halting: {}", err));
                    return;
                }
                FailurePolicy::Drop => {
                    // Fail closed by discarding: the raw bytes are gone
                    // (zeroized). The audit row keeps the loss visible and
                    // the upload queue gap-free.
                    log::error!(
                        "segment {} dropped, redaction unavailable: {}",
                        raw_id,
                        err
                    );
                    let recorded = match buffer.lock() {
                        Ok(mut guard) => guard.record_dropped(
                            &raw_id,
                            raw_start_ms,
                            &format!("dropped: {}", err),
                        ),
                        Err(_) => Err(anyhow!("segment buffer lock poisoned")),
                    };
                    if let Err(ledger_err) = recorded {
                        control.fail(format!("drop audit write failed: {}", ledger_err));
                        return;
                    }
                }
            },
        }
    }
}

fn enqueue_with_backpressure(
    buffer: &Mutex<SegmentBuffer>,
    segment: &RedactedSegment,
    control: &ControlState,
    config: &PipelineConfig,
) {
    loop {
        let result = match buffer.lock() {
            Ok(mut guard) => guard.enqueue(segment),
            Err(_) => {
                control.fail("segment buffer lock poisoned".into());
                return;
            }
        };
        match result {
            Ok(()) => return,
            Err(err) if err.downcast_ref::<QuotaExceeded>().is_some() => {
                if control.stopping() {
                    log::warn!(
                        "segment {} discarded at shutdown: {}",
                        segment.meta.id,
                        err
                    );
                    return;
                }
                log::warn!("segment buffer full, backpressuring redaction: {}", err);
                std::thread::sleep(config.backpressure_pause);
            }
            Err(err) => {
                // A ledger/spool write failure crosses the durability
                // invariant; never swallow it.
                control.fail(format!("segment enqueue failed: {}", err));
                return;
            }
        }
    }
}

fn upload_loop(
    uploader: &mut UploadWorker,
    buffer: &Mutex<SegmentBuffer>,
    control: &ControlState,
    config: &PipelineConfig,
) {
    loop {
        if control.stopping() {
            break;
        }
        match uploader.upload_next(buffer) {
            Ok(UploadOutcome::Idle) => std::thread::sleep(config.idle_poll),
            Ok(UploadOutcome::Confirmed(_)) => {
                if let Ok(mut guard) = buffer.lock() {
                    if let Err(err) = guard.purge_confirmed() {
                        log::warn!("purge after confirm failed: {}", err);
                    }
                }
            }
            Ok(UploadOutcome::Failed(id, reason)) => {
                // Already recorded as Failed in the ledger; the user-facing
                // layer surfaces it from there.
                log::warn!("segment {} left for manual retry: {}", id, reason);
            }
            Err(err) => {
                control.fail(format!("upload worker ledger failure: {}", err));
                break;
            }
        }
    }
}
