//! Capture devices and the bounded-duration segment source.
//!
//! This module turns a continuous raw frame stream into `RawSegment`s of a
//! fixed duration. The capture layer is responsible for:
//! - Holding exclusive hardware access while active, released on stop
//! - Bounding each segment's duration (bounds memory and redo cost)
//! - Assigning monotonic, device-unique segment ids and capture timestamps
//! - Bounded device re-acquisition before reporting errors upward
//!
//! The capture layer MUST NOT:
//! - Store raw frames to disk
//! - Hand raw frames to anything but the redactor
//! - Log raw frame content

use std::fmt;
use std::time::Duration;

use zeroize::Zeroize;

use crate::SegmentId;

pub(crate) mod stub;

pub use stub::{FailMode, StubCamera, StubCameraConfig, StubFace};

/// Bytes per RGB24 pixel.
pub(crate) const RGB24_BPP: usize = 3;

// -------------------- Errors --------------------

/// Capture failures, split into the kinds callers must distinguish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureError {
    /// Hardware exists but is busy or temporarily gone (for example taken
    /// by another process). Eligible for bounded re-acquisition.
    DeviceUnavailable(String),
    /// The platform refused access. Re-acquisition is attempted the same
    /// bounded number of times, then the error is reported upward.
    PermissionDenied(String),
    /// Unrecoverable device fault.
    Fatal(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::DeviceUnavailable(msg) => write!(f, "device unavailable: {}", msg),
            CaptureError::PermissionDenied(msg) => write!(f, "permission denied: {}", msg),
            CaptureError::Fatal(msg) => write!(f, "capture failed: {}", msg),
        }
    }
}

impl std::error::Error for CaptureError {}

// -------------------- Frames --------------------

/// One raw RGB24 frame. Pixel bytes are private and zeroized on drop;
/// the only consumer is the in-crate segment assembly path.
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at_ms: u64,
}

impl Frame {
    /// Build a frame from tightly packed RGB24 bytes. Length must match the
    /// dimensions exactly.
    pub fn rgb24(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        captured_at_ms: u64,
    ) -> Result<Self, CaptureError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(RGB24_BPP))
            .ok_or_else(|| CaptureError::Fatal("frame dimensions overflow".into()))?;
        if pixels.len() != expected {
            return Err(CaptureError::Fatal(format!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            )));
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at_ms,
        })
    }

    pub(crate) fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.pixels.zeroize();
    }
}

// -------------------- Capture Device --------------------

/// External collaborator: the camera/microphone hardware.
///
/// Implementations own exclusive hardware access between `start` and `stop`
/// and must release it deterministically on `stop`. The core only consumes
/// frames; device enumeration and preview belong to the host layer.
pub trait CaptureDevice: Send {
    /// Device identifier for logs.
    fn name(&self) -> &str;

    /// Acquire the device. Idempotent when already started.
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Release the device. Must not fail; called on every shutdown path.
    fn stop(&mut self);

    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;
}

// -------------------- Raw Segments --------------------

/// A bounded-duration run of raw frames. Bytes are private; there is no
/// `Clone`, no serialization, and no public byte accessor. The only way out
/// of this type is through the redactor, which consumes it.
pub struct RawSegment {
    /// Private, contiguous RGB24 frames. MUST NOT be exposed publicly.
    data: Vec<u8>,
    id: SegmentId,
    width: u32,
    height: u32,
    frame_count: u32,
    capture_start_ms: u64,
    capture_end_ms: u64,
}

impl RawSegment {
    pub(crate) fn new(
        data: Vec<u8>,
        id: SegmentId,
        width: u32,
        height: u32,
        frame_count: u32,
        capture_start_ms: u64,
        capture_end_ms: u64,
    ) -> Self {
        Self {
            data,
            id,
            width,
            height,
            frame_count,
            capture_start_ms,
            capture_end_ms,
        }
    }

    pub fn id(&self) -> &SegmentId {
        &self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn capture_start_ms(&self) -> u64 {
        self.capture_start_ms
    }

    pub fn capture_end_ms(&self) -> u64 {
        self.capture_end_ms
    }

    pub(crate) fn frame_stride(&self) -> usize {
        self.width as usize * self.height as usize * RGB24_BPP
    }

    pub(crate) fn frame_at(&self, index: u32) -> &[u8] {
        let stride = self.frame_stride();
        let start = index as usize * stride;
        &self.data[start..start + stride]
    }

    /// Move the frame bytes out for redaction. The redactor is the single
    /// caller; the emptied buffer still zeroizes on drop.
    pub(crate) fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl Drop for RawSegment {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

// -------------------- Segment Source --------------------

/// Chunks a capture device's frame stream into bounded raw segments.
pub struct SegmentSource<D: CaptureDevice> {
    device: D,
    device_id: String,
    frames_per_segment: u32,
    next_seq: u64,
    max_reacquire_attempts: u32,
    reacquire_pause: Duration,
    started: bool,
}

impl<D: CaptureDevice> SegmentSource<D> {
    pub fn new(
        device: D,
        device_id: &str,
        frames_per_segment: u32,
        max_reacquire_attempts: u32,
        reacquire_pause: Duration,
    ) -> anyhow::Result<Self> {
        crate::validate_device_id(device_id)?;
        if frames_per_segment == 0 {
            return Err(anyhow::anyhow!("frames_per_segment must be >= 1"));
        }
        Ok(Self {
            device,
            device_id: device_id.to_lowercase(),
            frames_per_segment,
            next_seq: 0,
            max_reacquire_attempts,
            reacquire_pause,
            started: false,
        })
    }

    /// Resume sequence numbering after a restart so ids stay monotonic.
    pub fn resume_from_seq(&mut self, next_seq: u64) {
        self.next_seq = next_seq;
    }

    pub fn start(&mut self) -> Result<(), CaptureError> {
        self.device.start()?;
        self.started = true;
        Ok(())
    }

    /// Release the device. Safe to call on every shutdown path.
    pub fn stop(&mut self) {
        if self.started {
            self.device.stop();
            self.started = false;
        }
    }

    /// Capture the next bounded segment.
    ///
    /// Device loss mid-segment triggers bounded re-acquisition; once the
    /// attempts are exhausted the error is reported upward and the partial
    /// segment is discarded (zeroized), never forwarded.
    pub fn next_segment(&mut self) -> Result<RawSegment, CaptureError> {
        if !self.started {
            self.start()?;
        }

        let mut data: Vec<u8> = Vec::new();
        let mut width = 0u32;
        let mut height = 0u32;
        let mut capture_start_ms = 0u64;
        let mut capture_end_ms = 0u64;
        let mut frames = 0u32;

        while frames < self.frames_per_segment {
            let frame = match self.device.next_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    if let Err(err) = self.reacquire(&err) {
                        // The partial segment never leaves this function.
                        data.zeroize();
                        return Err(err);
                    }
                    continue;
                }
            };

            if frames == 0 {
                width = frame.width;
                height = frame.height;
                capture_start_ms = frame.captured_at_ms;
            } else if frame.width != width || frame.height != height {
                data.zeroize();
                return Err(CaptureError::Fatal(format!(
                    "frame geometry changed mid-segment: {}x{} -> {}x{}",
                    width, height, frame.width, frame.height
                )));
            }
            capture_end_ms = frame.captured_at_ms;
            data.extend_from_slice(frame.pixels());
            frames += 1;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let id = SegmentId::new(&self.device_id, seq)
            .map_err(|e| CaptureError::Fatal(e.to_string()))?;

        log::debug!(
            "captured segment {} ({} frames, {}x{})",
            id,
            frames,
            width,
            height
        );

        Ok(RawSegment::new(
            data,
            id,
            width,
            height,
            frames,
            capture_start_ms,
            capture_end_ms,
        ))
    }

    /// Bounded re-acquisition. Fatal errors and exhausted attempts are
    /// returned to the caller.
    fn reacquire(&mut self, cause: &CaptureError) -> Result<(), CaptureError> {
        if matches!(cause, CaptureError::Fatal(_)) {
            return Err(cause.clone());
        }

        for attempt in 1..=self.max_reacquire_attempts {
            log::warn!(
                "capture device {} lost ({}); re-acquire attempt {}/{}",
                self.device.name(),
                cause,
                attempt,
                self.max_reacquire_attempts
            );
            self.device.stop();
            self.started = false;
            std::thread::sleep(self.reacquire_pause);
            match self.device.start() {
                Ok(()) => {
                    self.started = true;
                    return Ok(());
                }
                Err(CaptureError::Fatal(msg)) => return Err(CaptureError::Fatal(msg)),
                Err(_) => continue,
            }
        }

        log::error!(
            "capture device {} not recovered after {} attempts",
            self.device.name(),
            self.max_reacquire_attempts
        );
        Err(cause.clone())
    }
}

impl<D: CaptureDevice> Drop for SegmentSource<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_validates_length() {
        assert!(Frame::rgb24(vec![0u8; 12], 2, 2, 0).is_ok());
        assert!(Frame::rgb24(vec![0u8; 11], 2, 2, 0).is_err());
    }

    #[test]
    fn segments_get_monotonic_ids() {
        let camera = StubCamera::new(StubCameraConfig {
            width: 8,
            height: 8,
            ..StubCameraConfig::default()
        });
        let mut source =
            SegmentSource::new(camera, "device:test_cam", 4, 3, Duration::from_millis(0)).unwrap();

        let a = source.next_segment().unwrap();
        let b = source.next_segment().unwrap();
        assert_eq!(a.id().seq, 0);
        assert_eq!(b.id().seq, 1);
        assert_eq!(a.frame_count(), 4);
        assert!(a.capture_end_ms() >= a.capture_start_ms());
    }

    #[test]
    fn transient_device_loss_is_reacquired() {
        let camera = StubCamera::new(StubCameraConfig {
            width: 8,
            height: 8,
            fail_mode: FailMode::TransientAfter(3),
            ..StubCameraConfig::default()
        });
        let mut source =
            SegmentSource::new(camera, "device:test_cam", 6, 3, Duration::from_millis(0)).unwrap();

        let segment = source.next_segment().unwrap();
        assert_eq!(segment.frame_count(), 6);
    }

    #[test]
    fn exhausted_reacquire_reports_device_unavailable() {
        let camera = StubCamera::new(StubCameraConfig {
            width: 8,
            height: 8,
            fail_mode: FailMode::PermanentAfter(2),
            ..StubCameraConfig::default()
        });
        let mut source =
            SegmentSource::new(camera, "device:test_cam", 6, 2, Duration::from_millis(0)).unwrap();

        match source.next_segment() {
            Err(CaptureError::DeviceUnavailable(_)) => {}
            other => panic!("expected DeviceUnavailable, got {:?}", other.map(|s| s.frame_count())),
        }
    }

    #[test]
    fn permission_denied_is_distinct() {
        let camera = StubCamera::new(StubCameraConfig {
            width: 8,
            height: 8,
            fail_mode: FailMode::DeniedAtStart,
            ..StubCameraConfig::default()
        });
        let mut source =
            SegmentSource::new(camera, "device:test_cam", 4, 1, Duration::from_millis(0)).unwrap();

        match source.next_segment() {
            Err(CaptureError::PermissionDenied(_)) => {}
            other => panic!(
                "expected PermissionDenied, got {:?}",
                other.map(|s| s.frame_count())
            ),
        }
    }
}
