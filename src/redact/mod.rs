//! Face redaction.
//!
//! This module is the privacy boundary of the pipeline. A raw segment goes
//! in; a segment with every detected face irreversibly blurred comes out.
//! The redaction layer is responsible for:
//! - Running the face detector on sampled frames (CPU/coverage trade-off)
//! - Propagating bounding boxes across skipped frames so identity does not
//!   flicker through between samples
//! - Scaling blur strength with region size so re-sharpening cannot
//!   trivially recover identity
//!
//! The redaction layer MUST fail closed: if the detector cannot run, the
//! segment is dropped or the stage halts. Raw media is never forwarded.

mod blur;
mod detector;
mod redactor;

pub use detector::{FaceDetector, FaceRegion, RedactionError, StubFaceDetector};
pub use redactor::{FailurePolicy, Redactor};
