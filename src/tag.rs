//! Location tagging.
//!
//! Attaches the most recent location sample to a segment when one is fresh
//! enough. The tagger never blocks segment flow for long: it polls the
//! provider briefly and then lets the segment through unlocated.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::{LocationSample, SegmentMeta};

/// External collaborator: the platform location service. The core only
/// reads last-known samples; it never requests continuous high-power
/// tracking. `Sync` because one tagger serves every redaction worker.
pub trait LocationProvider: Send + Sync {
    fn last_known(&self) -> Option<LocationSample>;
}

/// Fixed provider for tests and demos.
pub struct StaticLocationProvider {
    sample: Mutex<Option<LocationSample>>,
}

impl StaticLocationProvider {
    pub fn new(sample: Option<LocationSample>) -> Self {
        Self {
            sample: Mutex::new(sample),
        }
    }

    pub fn set(&self, sample: Option<LocationSample>) {
        if let Ok(mut guard) = self.sample.lock() {
            *guard = sample;
        }
    }
}

impl LocationProvider for StaticLocationProvider {
    fn last_known(&self) -> Option<LocationSample> {
        self.sample.lock().ok().and_then(|guard| *guard)
    }
}

pub struct LocationTagger {
    provider: Box<dyn LocationProvider>,
    staleness: Duration,
    fix_timeout: Duration,
    poll_interval: Duration,
}

impl LocationTagger {
    pub fn new(provider: Box<dyn LocationProvider>, staleness: Duration, fix_timeout: Duration) -> Self {
        Self {
            provider,
            staleness,
            fix_timeout,
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Attach a fresh-enough location to the segment, or flag it unlocated.
    /// Returns true when a location was attached.
    pub fn tag(&self, meta: &mut SegmentMeta) -> bool {
        let deadline = Instant::now() + self.fix_timeout;
        loop {
            if let Some(sample) = self.fresh_sample() {
                meta.location = Some(sample);
                return true;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(self.poll_interval.min(self.fix_timeout));
        }
        meta.location = None;
        log::info!("segment {} is unlocated (no fresh fix)", meta.id);
        false
    }

    fn fresh_sample(&self) -> Option<LocationSample> {
        let sample = self.provider.last_known()?;
        let now = crate::now_ms().ok()?;
        let age_ms = now.saturating_sub(sample.sampled_at_ms);
        if age_ms <= self.staleness.as_millis() as u64 {
            Some(sample)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SegmentId;

    fn meta() -> SegmentMeta {
        SegmentMeta {
            id: SegmentId::new("device:cam", 0).unwrap(),
            capture_start_ms: 0,
            capture_end_ms: 1000,
            width: 8,
            height: 8,
            frame_count: 2,
            redaction_applied: true,
            regions_redacted: 0,
            location: None,
            blob_len: 0,
            checksum: [0u8; 32],
        }
    }

    fn sample(sampled_at_ms: u64) -> LocationSample {
        LocationSample {
            lat: 52.52,
            lon: 13.405,
            accuracy_m: 12.0,
            sampled_at_ms,
        }
    }

    #[test]
    fn fresh_sample_is_attached() {
        let now = crate::now_ms().unwrap();
        let provider = StaticLocationProvider::new(Some(sample(now)));
        let tagger = LocationTagger::new(
            Box::new(provider),
            Duration::from_secs(120),
            Duration::from_millis(10),
        );
        let mut m = meta();
        assert!(tagger.tag(&mut m));
        assert!(m.location.is_some());
    }

    #[test]
    fn stale_sample_leaves_segment_unlocated() {
        let now = crate::now_ms().unwrap();
        let provider = StaticLocationProvider::new(Some(sample(now.saturating_sub(10 * 60 * 1000))));
        let tagger = LocationTagger::new(
            Box::new(provider),
            Duration::from_secs(120),
            Duration::from_millis(10),
        );
        let mut m = meta();
        assert!(!tagger.tag(&mut m));
        assert!(m.location.is_none());
    }

    #[test]
    fn missing_provider_fix_times_out_quickly() {
        let provider = StaticLocationProvider::new(None);
        let tagger = LocationTagger::new(
            Box::new(provider),
            Duration::from_secs(120),
            Duration::from_millis(20),
        );
        let started = Instant::now();
        let mut m = meta();
        assert!(!tagger.tag(&mut m));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
