use anyhow::{anyhow, Result};

use super::blur::blur_region;
use super::detector::{FaceDetector, FaceRegion, RedactionError};
use crate::capture::RawSegment;
use crate::{checksum_of, RedactedSegment, SegmentMeta};

/// Two region centers closer than this (normalized) are treated as the same
/// face when propagating boxes between sampled frames.
const MATCH_RADIUS: f32 = 0.25;

/// What to do with a segment when the detector is unavailable. Both choices
/// fail closed; neither forwards raw media.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Halt the redaction stage and surface the error upward.
    Block,
    /// Discard the segment and record the loss in the ledger.
    Drop,
}

impl FailurePolicy {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "block" => Ok(FailurePolicy::Block),
            "drop" => Ok(FailurePolicy::Drop),
            other => Err(anyhow!(
                "redaction failure_policy must be 'block' or 'drop', got '{}'",
                other
            )),
        }
    }
}

/// Detections taken at one sampled frame.
struct Sample {
    frame: u32,
    regions: Vec<FaceRegion>,
}

/// Runs face detection on sampled frames, propagates boxes across the
/// skipped frames, and blurs every accepted region in place.
pub struct Redactor {
    detector: Box<dyn FaceDetector>,
    confidence_threshold: f32,
    sample_interval: u32,
}

impl Redactor {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        confidence_threshold: f32,
        sample_interval: u32,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within 0..=1"));
        }
        if sample_interval == 0 {
            return Err(anyhow!("sample_interval must be >= 1"));
        }
        Ok(Self {
            detector,
            confidence_threshold,
            sample_interval,
        })
    }

    /// Load the model before capture starts so unavailability surfaces early.
    pub fn warm_up(&mut self) -> Result<(), RedactionError> {
        self.detector.warm_up()
    }

    /// Redact one raw segment. Output duration, timing, and frame count
    /// equal the input; only the blurred regions change.
    ///
    /// Any detector error aborts the whole segment: a half-redacted segment
    /// must never be forwarded, so there is no partial-success path.
    pub fn redact(&mut self, mut raw: RawSegment) -> Result<RedactedSegment, RedactionError> {
        let frame_count = raw.frame_count();
        if frame_count == 0 {
            return Err(RedactionError::Failed("empty segment".into()));
        }
        let width = raw.width();
        let height = raw.height();

        let mut samples: Vec<Sample> = Vec::new();
        let mut frame = 0u32;
        while frame < frame_count {
            let detections = self
                .detector
                .detect(raw.frame_at(frame), width, height)?;
            let accepted = detections
                .into_iter()
                .filter(|r| r.confidence >= self.confidence_threshold)
                .collect();
            samples.push(Sample {
                frame,
                regions: accepted,
            });
            frame += self.sample_interval;
        }

        let (per_frame, tracks) = propagate(&samples, frame_count);

        let mut data = raw.take_data();
        let stride = raw.frame_stride();
        for (i, regions) in per_frame.iter().enumerate() {
            let slice = &mut data[i * stride..(i + 1) * stride];
            for region in regions {
                blur_region(slice, width, height, region);
            }
        }

        let meta = SegmentMeta {
            id: raw.id().clone(),
            capture_start_ms: raw.capture_start_ms(),
            capture_end_ms: raw.capture_end_ms(),
            width,
            height,
            frame_count,
            redaction_applied: true,
            regions_redacted: tracks,
            location: None,
            blob_len: data.len() as u64,
            checksum: checksum_of(&data),
        };

        log::debug!(
            "redacted segment {}: {} face track(s) across {} frames",
            meta.id,
            tracks,
            frame_count
        );

        Ok(RedactedSegment::new(meta, data))
    }
}

/// Expand sampled detections into a region list per frame.
///
/// Regions are matched between consecutive samples by nearest center and
/// linearly interpolated across the gap. A region present on only one side
/// of a gap still covers the whole gap: over-blurring an exiting face is
/// cheap, letting identity flicker through is not.
///
/// Returns the per-frame regions and the number of distinct face tracks.
fn propagate(samples: &[Sample], frame_count: u32) -> (Vec<Vec<FaceRegion>>, u32) {
    let mut per_frame: Vec<Vec<FaceRegion>> = vec![Vec::new(); frame_count as usize];
    let mut tracks = samples.first().map(|s| s.regions.len() as u32).unwrap_or(0);

    for pair in samples.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let matches = match_regions(&prev.regions, &next.regions);
        tracks += matches.new_in_next as u32;

        per_frame[prev.frame as usize] = prev.regions.clone();
        let gap = next.frame - prev.frame;
        for f in (prev.frame + 1)..next.frame {
            let t = (f - prev.frame) as f32 / gap as f32;
            per_frame[f as usize] = matches.interpolated(&prev.regions, &next.regions, t);
        }
    }

    // The last sample's regions carry through to the end of the segment.
    if let Some(last) = samples.last() {
        for f in last.frame..frame_count {
            per_frame[f as usize] = last.regions.clone();
        }
    }

    (per_frame, tracks)
}

struct RegionMatches {
    /// pairs[i] = Some(j) when next[i] continues prev[j].
    pairs: Vec<Option<usize>>,
    new_in_next: usize,
}

impl RegionMatches {
    fn interpolated(
        &self,
        prev: &[FaceRegion],
        next: &[FaceRegion],
        t: f32,
    ) -> Vec<FaceRegion> {
        let mut out = Vec::with_capacity(prev.len() + next.len());
        let mut prev_used = vec![false; prev.len()];

        for (i, pair) in self.pairs.iter().enumerate() {
            match pair {
                Some(j) => {
                    prev_used[*j] = true;
                    out.push(lerp_region(&prev[*j], &next[i], t));
                }
                // Appears only at the far sample: cover the gap with its box.
                None => out.push(next[i]),
            }
        }
        // Gone by the far sample: keep covering until the gap ends.
        for (j, used) in prev_used.iter().enumerate() {
            if !used {
                out.push(prev[j]);
            }
        }
        out
    }
}

fn match_regions(prev: &[FaceRegion], next: &[FaceRegion]) -> RegionMatches {
    let mut taken = vec![false; prev.len()];
    let mut pairs = Vec::with_capacity(next.len());
    let mut new_in_next = 0usize;

    for region in next {
        let (cx, cy) = region.center();
        let mut best: Option<(usize, f32)> = None;
        for (j, candidate) in prev.iter().enumerate() {
            if taken[j] {
                continue;
            }
            let (px, py) = candidate.center();
            let dist = ((cx - px).powi(2) + (cy - py).powi(2)).sqrt();
            if dist <= MATCH_RADIUS && best.map(|(_, d)| dist < d).unwrap_or(true) {
                best = Some((j, dist));
            }
        }
        match best {
            Some((j, _)) => {
                taken[j] = true;
                pairs.push(Some(j));
            }
            None => {
                new_in_next += 1;
                pairs.push(None);
            }
        }
    }

    RegionMatches {
        pairs,
        new_in_next,
    }
}

fn lerp_region(a: &FaceRegion, b: &FaceRegion, t: f32) -> FaceRegion {
    let lerp = |x: f32, y: f32| x + (y - x) * t;
    FaceRegion {
        x: lerp(a.x, b.x),
        y: lerp(a.y, b.y),
        w: lerp(a.w, b.w),
        h: lerp(a.h, b.h),
        confidence: a.confidence.min(b.confidence),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{SegmentSource, StubCamera, StubCameraConfig, StubFace};
    use crate::redact::StubFaceDetector;
    use std::time::Duration;

    fn capture_segment(faces: Vec<StubFace>, frames: u32) -> RawSegment {
        let camera = StubCamera::new(StubCameraConfig {
            width: 64,
            height: 48,
            faces,
            ..StubCameraConfig::default()
        });
        let mut source =
            SegmentSource::new(camera, "device:test_cam", frames, 3, Duration::from_millis(0))
                .unwrap();
        source.next_segment().unwrap()
    }

    #[test]
    fn threshold_splits_strong_and_weak_faces() {
        let strong = StubFace {
            x: 8,
            y: 8,
            w: 10,
            h: 10,
            confidence: 0.9,
        };
        let weak = StubFace {
            x: 40,
            y: 24,
            w: 10,
            h: 10,
            confidence: 0.4,
        };
        let raw = capture_segment(vec![strong, weak], 8);

        let mut redactor =
            Redactor::new(Box::new(StubFaceDetector::new()), 0.5, 2).unwrap();
        let segment = redactor.redact(raw).unwrap();

        assert!(segment.meta.redaction_applied);
        assert_eq!(segment.meta.regions_redacted, 1);
        assert_eq!(segment.meta.frame_count, 8);

        // Weak face marker must survive untouched; strong face must not.
        let stride = 64usize * 48 * 3;
        let frame0 = &segment.blob()[..stride];
        let weak_offset = (26usize * 64 + 42) * 3;
        assert_eq!(frame0[weak_offset], 255);
        assert_eq!(frame0[weak_offset + 1], 0);
        let strong_offset = (10usize * 64 + 10) * 3;
        let strong_px = &frame0[strong_offset..strong_offset + 3];
        assert_ne!(strong_px, &[255, 0, 230][..]);
    }

    #[test]
    fn detector_failure_fails_closed() {
        let raw = capture_segment(vec![], 8);
        let mut redactor = Redactor::new(
            Box::new(StubFaceDetector::new().with_failure_after(0)),
            0.5,
            4,
        )
        .unwrap();
        match redactor.redact(raw) {
            Err(RedactionError::ModelUnavailable(_)) => {}
            other => panic!("expected ModelUnavailable, got {:?}", other.map(|s| s.meta)),
        }
    }

    #[test]
    fn mid_segment_detector_failure_drops_whole_segment() {
        let raw = capture_segment(vec![], 8);
        // Fails on the second sampled frame.
        let mut redactor = Redactor::new(
            Box::new(StubFaceDetector::new().with_failure_after(1)),
            0.5,
            4,
        )
        .unwrap();
        assert!(redactor.redact(raw).is_err());
    }

    #[test]
    fn output_preserves_timing_and_checksum() {
        let raw = capture_segment(vec![], 6);
        let start = raw.capture_start_ms();
        let end = raw.capture_end_ms();
        let mut redactor =
            Redactor::new(Box::new(StubFaceDetector::new()), 0.5, 3).unwrap();
        let segment = redactor.redact(raw).unwrap();
        assert_eq!(segment.meta.capture_start_ms, start);
        assert_eq!(segment.meta.capture_end_ms, end);
        assert_eq!(segment.meta.blob_len as usize, segment.blob().len());
        assert_eq!(segment.meta.checksum, crate::checksum_of(segment.blob()));
    }

    /// Detector that reports a face sliding right on each sampled frame.
    struct SlidingDetector {
        calls: u32,
    }

    impl FaceDetector for SlidingDetector {
        fn name(&self) -> &'static str {
            "sliding"
        }

        fn detect(
            &mut self,
            _pixels: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<FaceRegion>, RedactionError> {
            let x = 0.1 + 0.4 * self.calls as f32;
            self.calls += 1;
            Ok(vec![FaceRegion {
                x,
                y: 0.25,
                w: 0.25,
                h: 0.5,
                confidence: 0.95,
            }])
        }
    }

    #[test]
    fn boxes_interpolate_across_skipped_frames() {
        // Two identically configured cameras produce identical frames, so the
        // unredacted capture doubles as the reference image.
        let raw = capture_segment(vec![], 5);
        let reference = capture_segment(vec![], 5);
        let mut no_op =
            Redactor::new(Box::new(StubFaceDetector::new()), 0.5, 1).unwrap();
        let reference = no_op.redact(reference).unwrap();

        let mut redactor =
            Redactor::new(Box::new(SlidingDetector { calls: 0 }), 0.5, 4).unwrap();
        let segment = redactor.redact(raw).unwrap();

        // Samples at frames 0 (x=0.1) and 4 (x=0.5); frame 2 interpolates to
        // x=0.3, so the box covers x in [0.3, 0.55) => pixels 19..35 of 64.
        let stride = 64usize * 48 * 3;
        let frame2 = &segment.blob()[2 * stride..3 * stride];
        let ref2 = &reference.blob()[2 * stride..3 * stride];
        let row = (24usize * 64 + 19) * 3;
        assert_ne!(&frame2[row..row + 17 * 3], &ref2[row..row + 17 * 3]);
        // Far corner stays untouched.
        let outside = (2usize * 64 + 2) * 3;
        assert_eq!(&frame2[outside..outside + 3], &ref2[outside..outside + 3]);
    }
}
