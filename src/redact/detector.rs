use std::collections::HashMap;
use std::fmt;

use crate::capture::stub::confidence_from_marker;

/// A detected face bounding box in normalized 0..1 coordinates.
///
/// Ephemeral: consumed entirely inside the redactor. Deliberately not
/// serializable and never persisted or transmitted.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
}

impl FaceRegion {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }
}

/// Redaction failures.
#[derive(Clone, Debug)]
pub enum RedactionError {
    /// The detection model failed to load or crashed. The pipeline must
    /// fail closed on this variant.
    ModelUnavailable(String),
    /// Detection ran but produced an unusable result.
    Failed(String),
}

impl fmt::Display for RedactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedactionError::ModelUnavailable(msg) => write!(f, "model unavailable: {}", msg),
            RedactionError::Failed(msg) => write!(f, "redaction failed: {}", msg),
        }
    }
}

impl std::error::Error for RedactionError {}

/// Face detection backend.
///
/// # Audit Boundary
///
/// This trait defines an AUDIT BOUNDARY, not a security boundary.
/// Implementations MUST be manually audited to ensure they:
/// - Do not store raw pixels beyond the `detect` call
/// - Do not write to disk
/// - Do not make network requests
/// - Do not compute identity-linked outputs beyond bounding boxes
///
/// The runtime behind this trait (an on-device inference engine) is an
/// external collaborator with bounded latency and an explicit unavailable
/// state, reported as [`RedactionError::ModelUnavailable`].
pub trait FaceDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Detect faces in one RGB24 frame.
    ///
    /// Implementations must treat the pixel slice as read-only and
    /// ephemeral.
    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceRegion>, RedactionError>;

    /// Optional warm-up hook; loads the model eagerly so unavailability
    /// surfaces before capture starts.
    fn warm_up(&mut self) -> Result<(), RedactionError> {
        Ok(())
    }
}

/// Stub detector for tests. Finds the marker rectangles painted by
/// `StubCamera`: pixels with R=255, G=0, where the blue channel encodes the
/// confidence to report. One region is reported per distinct blue value, so
/// test fixtures paint faces with distinct confidences.
pub struct StubFaceDetector {
    calls: u64,
    fail_after: Option<u64>,
}

impl StubFaceDetector {
    pub fn new() -> Self {
        Self {
            calls: 0,
            fail_after: None,
        }
    }

    /// Report `ModelUnavailable` on every detect call past the given count.
    pub fn with_failure_after(mut self, calls: u64) -> Self {
        self.fail_after = Some(calls);
        self
    }
}

impl Default for StubFaceDetector {
    fn default() -> Self {
        Self::new()
    }
}

struct MarkerBounds {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    count: u32,
}

impl FaceDetector for StubFaceDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceRegion>, RedactionError> {
        if let Some(limit) = self.fail_after {
            if self.calls >= limit {
                return Err(RedactionError::ModelUnavailable(
                    "stub detector scripted failure".into(),
                ));
            }
        }
        self.calls += 1;

        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(RedactionError::Failed(format!(
                "frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            )));
        }

        let mut buckets: HashMap<u8, MarkerBounds> = HashMap::new();
        for y in 0..height {
            for x in 0..width {
                let offset = (y as usize * width as usize + x as usize) * 3;
                if pixels[offset] == 255 && pixels[offset + 1] == 0 {
                    let b = pixels[offset + 2];
                    let bounds = buckets.entry(b).or_insert(MarkerBounds {
                        min_x: x,
                        min_y: y,
                        max_x: x,
                        max_y: y,
                        count: 0,
                    });
                    bounds.min_x = bounds.min_x.min(x);
                    bounds.min_y = bounds.min_y.min(y);
                    bounds.max_x = bounds.max_x.max(x);
                    bounds.max_y = bounds.max_y.max(y);
                    bounds.count += 1;
                }
            }
        }

        let mut regions: Vec<FaceRegion> = buckets
            .into_iter()
            .filter(|(_, b)| b.count >= 4)
            .map(|(b, bounds)| FaceRegion {
                x: bounds.min_x as f32 / width as f32,
                y: bounds.min_y as f32 / height as f32,
                w: (bounds.max_x - bounds.min_x + 1) as f32 / width as f32,
                h: (bounds.max_y - bounds.min_y + 1) as f32 / height as f32,
                confidence: confidence_from_marker(b),
            })
            .collect();
        regions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(regions)
    }
}
