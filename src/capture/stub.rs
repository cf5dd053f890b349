//! Synthetic capture device for tests and demos.
//!
//! `StubCamera` generates deterministic RGB24 frames and can paint
//! "face" rectangles using a marker color that encodes the detection
//! confidence the stub detector should report. It can also script device
//! loss to exercise the re-acquisition path.

use super::{CaptureDevice, CaptureError, Frame};

/// Marker color for painted faces: (255, 0, b) where b encodes confidence.
pub(crate) fn face_marker_color(confidence: f32) -> [u8; 3] {
    let b = (confidence.clamp(0.0, 1.0) * 255.0).round() as u8;
    [255, 0, b]
}

pub(crate) fn confidence_from_marker(b: u8) -> f32 {
    b as f32 / 255.0
}

/// A face painted into stub frames. Coordinates are in pixels.
#[derive(Clone, Copy, Debug)]
pub struct StubFace {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub confidence: f32,
}

/// Scripted device failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailMode {
    #[default]
    None,
    /// Device drops once after this many frames; a restart recovers it.
    TransientAfter(u64),
    /// Device drops after this many frames and never comes back.
    PermanentAfter(u64),
    /// Platform refuses access outright.
    DeniedAtStart,
}

#[derive(Clone, Debug)]
pub struct StubCameraConfig {
    pub width: u32,
    pub height: u32,
    /// Timestamp step between frames.
    pub frame_interval_ms: u64,
    pub faces: Vec<StubFace>,
    pub fail_mode: FailMode,
}

impl Default for StubCameraConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            frame_interval_ms: 100,
            faces: Vec::new(),
            fail_mode: FailMode::None,
        }
    }
}

pub struct StubCamera {
    config: StubCameraConfig,
    base_ms: u64,
    frames_emitted: u64,
    scene_state: u8,
    started: bool,
    down: bool,
    tripped: bool,
}

impl StubCamera {
    pub fn new(config: StubCameraConfig) -> Self {
        Self {
            config,
            base_ms: 0,
            frames_emitted: 0,
            scene_state: 0,
            started: false,
            down: false,
            tripped: false,
        }
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count =
            self.config.width as usize * self.config.height as usize * super::RGB24_BPP;
        if self.frames_emitted % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frames_emitted + self.scene_state as u64) % 251) as u8;
        }

        // Faces are a checkerboard of marker and shadow so a blur visibly
        // destroys them; a solid block would survive averaging unchanged.
        for face in &self.config.faces {
            let color = face_marker_color(face.confidence);
            let x1 = face.x.min(self.config.width);
            let y1 = face.y.min(self.config.height);
            let x2 = (face.x + face.w).min(self.config.width);
            let y2 = (face.y + face.h).min(self.config.height);
            for y in y1..y2 {
                for x in x1..x2 {
                    let offset =
                        (y as usize * self.config.width as usize + x as usize) * super::RGB24_BPP;
                    if (x + y) % 2 == 0 {
                        pixels[offset] = color[0];
                        pixels[offset + 1] = color[1];
                        pixels[offset + 2] = color[2];
                    } else {
                        pixels[offset] = 20;
                        pixels[offset + 1] = 20;
                        pixels[offset + 2] = 20;
                    }
                }
            }
        }

        pixels
    }
}

impl CaptureDevice for StubCamera {
    fn name(&self) -> &str {
        "stub-camera"
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.config.fail_mode == FailMode::DeniedAtStart {
            return Err(CaptureError::PermissionDenied(
                "camera access not granted".into(),
            ));
        }
        if self.down {
            match self.config.fail_mode {
                FailMode::TransientAfter(_) => self.down = false,
                _ => {
                    return Err(CaptureError::DeviceUnavailable(
                        "stub camera is gone".into(),
                    ))
                }
            }
        }
        if self.base_ms == 0 {
            self.base_ms = crate::now_ms().unwrap_or(0);
        }
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.started = false;
    }

    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        if !self.started {
            return Err(CaptureError::DeviceUnavailable("not started".into()));
        }
        if self.down {
            return Err(CaptureError::DeviceUnavailable("stub camera is down".into()));
        }
        match self.config.fail_mode {
            FailMode::TransientAfter(n) if !self.tripped && self.frames_emitted >= n => {
                self.tripped = true;
                self.down = true;
                return Err(CaptureError::DeviceUnavailable("stub camera dropped".into()));
            }
            FailMode::PermanentAfter(n) if self.frames_emitted >= n => {
                self.down = true;
                return Err(CaptureError::DeviceUnavailable("stub camera dropped".into()));
            }
            _ => {}
        }

        let pixels = self.generate_pixels();
        let captured_at_ms = self.base_ms + self.frames_emitted * self.config.frame_interval_ms;
        self.frames_emitted += 1;
        Frame::rgb24(pixels, self.config.width, self.config.height, captured_at_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paints_face_marker() {
        let mut camera = StubCamera::new(StubCameraConfig {
            width: 16,
            height: 16,
            faces: vec![StubFace {
                x: 4,
                y: 4,
                w: 4,
                h: 4,
                confidence: 0.9,
            }],
            ..StubCameraConfig::default()
        });
        camera.start().unwrap();
        let frame = camera.next_frame().unwrap();
        let color = face_marker_color(0.9);
        let offset = (5 * 16 + 5) * 3;
        assert_eq!(&frame.pixels()[offset..offset + 3], &color);
    }

    #[test]
    fn timestamps_step_by_interval() {
        let mut camera = StubCamera::new(StubCameraConfig {
            width: 4,
            height: 4,
            frame_interval_ms: 100,
            ..StubCameraConfig::default()
        });
        camera.start().unwrap();
        let a = camera.next_frame().unwrap();
        let b = camera.next_frame().unwrap();
        assert_eq!(b.captured_at_ms - a.captured_at_ms, 100);
    }
}
