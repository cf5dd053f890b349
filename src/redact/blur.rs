//! Iterated box blur over a face region.
//!
//! Three box-blur passes approximate a Gaussian. The kernel radius scales
//! with the region size, so a large (close) face receives a proportionally
//! stronger blur and a re-sharpening pass cannot trivially recover identity.

use super::detector::FaceRegion;

const BLUR_PASSES: u32 = 3;
const MIN_RADIUS: usize = 2;

/// Convert a normalized region to a clamped pixel rect (x1, y1, x2, y2),
/// half-open on the right/bottom edge. Returns None for degenerate rects.
pub(crate) fn pixel_rect(
    region: &FaceRegion,
    width: u32,
    height: u32,
) -> Option<(usize, usize, usize, usize)> {
    let w = width as f32;
    let h = height as f32;
    let x1 = (region.x * w).floor().max(0.0) as usize;
    let y1 = (region.y * h).floor().max(0.0) as usize;
    let x2 = (((region.x + region.w) * w).ceil() as usize).min(width as usize);
    let y2 = (((region.y + region.h) * h).ceil() as usize).min(height as usize);
    if x1 >= x2 || y1 >= y2 {
        return None;
    }
    Some((x1, y1, x2, y2))
}

/// Kernel radius for a region of the given pixel size.
pub(crate) fn blur_radius(rect_w: usize, rect_h: usize) -> usize {
    MIN_RADIUS.max(rect_w.max(rect_h) / 6)
}

/// Blur one region of an RGB24 frame in place.
pub(crate) fn blur_region(pixels: &mut [u8], width: u32, height: u32, region: &FaceRegion) {
    let Some((x1, y1, x2, y2)) = pixel_rect(region, width, height) else {
        return;
    };
    let radius = blur_radius(x2 - x1, y2 - y1);
    let stride = width as usize * 3;

    let mut scratch = vec![0u8; (x2 - x1) * (y2 - y1) * 3];
    for _ in 0..BLUR_PASSES {
        horizontal_pass(pixels, &mut scratch, stride, x1, y1, x2, y2, radius);
        vertical_pass(pixels, &mut scratch, stride, x1, y1, x2, y2, radius);
    }
}

#[allow(clippy::too_many_arguments)]
fn horizontal_pass(
    pixels: &mut [u8],
    scratch: &mut [u8],
    stride: usize,
    x1: usize,
    y1: usize,
    x2: usize,
    y2: usize,
    radius: usize,
) {
    let rect_w = x2 - x1;
    for y in y1..y2 {
        for x in x1..x2 {
            let lo = x.saturating_sub(radius).max(x1);
            let hi = (x + radius + 1).min(x2);
            let mut sum = [0u32; 3];
            for sx in lo..hi {
                let offset = y * stride + sx * 3;
                sum[0] += pixels[offset] as u32;
                sum[1] += pixels[offset + 1] as u32;
                sum[2] += pixels[offset + 2] as u32;
            }
            let n = (hi - lo) as u32;
            let out = ((y - y1) * rect_w + (x - x1)) * 3;
            scratch[out] = (sum[0] / n) as u8;
            scratch[out + 1] = (sum[1] / n) as u8;
            scratch[out + 2] = (sum[2] / n) as u8;
        }
    }
    copy_back(pixels, scratch, stride, x1, y1, x2, y2);
}

#[allow(clippy::too_many_arguments)]
fn vertical_pass(
    pixels: &mut [u8],
    scratch: &mut [u8],
    stride: usize,
    x1: usize,
    y1: usize,
    x2: usize,
    y2: usize,
    radius: usize,
) {
    let rect_w = x2 - x1;
    for y in y1..y2 {
        for x in x1..x2 {
            let lo = y.saturating_sub(radius).max(y1);
            let hi = (y + radius + 1).min(y2);
            let mut sum = [0u32; 3];
            for sy in lo..hi {
                let offset = sy * stride + x * 3;
                sum[0] += pixels[offset] as u32;
                sum[1] += pixels[offset + 1] as u32;
                sum[2] += pixels[offset + 2] as u32;
            }
            let n = (hi - lo) as u32;
            let out = ((y - y1) * rect_w + (x - x1)) * 3;
            scratch[out] = (sum[0] / n) as u8;
            scratch[out + 1] = (sum[1] / n) as u8;
            scratch[out + 2] = (sum[2] / n) as u8;
        }
    }
    copy_back(pixels, scratch, stride, x1, y1, x2, y2);
}

fn copy_back(
    pixels: &mut [u8],
    scratch: &[u8],
    stride: usize,
    x1: usize,
    y1: usize,
    x2: usize,
    y2: usize,
) {
    let rect_w = x2 - x1;
    for y in y1..y2 {
        let src = (y - y1) * rect_w * 3;
        let dst = y * stride + x1 * 3;
        pixels[dst..dst + rect_w * 3].copy_from_slice(&scratch[src..src + rect_w * 3]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: f32, y: f32, w: f32, h: f32) -> FaceRegion {
        FaceRegion {
            x,
            y,
            w,
            h,
            confidence: 1.0,
        }
    }

    #[test]
    fn radius_scales_with_region_size() {
        assert_eq!(blur_radius(6, 6), 2);
        assert_eq!(blur_radius(60, 30), 10);
        assert!(blur_radius(120, 120) > blur_radius(30, 30));
    }

    #[test]
    fn blur_flattens_high_contrast_region() {
        // Checkerboard inside the region; blur must pull values toward the mean.
        let width = 32u32;
        let height = 32u32;
        let mut pixels = vec![0u8; 32 * 32 * 3];
        for y in 8..24 {
            for x in 8..24 {
                let v = if (x + y) % 2 == 0 { 255 } else { 0 };
                let offset = (y * 32 + x) * 3;
                pixels[offset] = v;
                pixels[offset + 1] = v;
                pixels[offset + 2] = v;
            }
        }
        let r = region(0.25, 0.25, 0.5, 0.5);
        blur_region(&mut pixels, width, height, &r);

        let mut min = 255u8;
        let mut max = 0u8;
        for y in 10..22 {
            for x in 10..22 {
                let v = pixels[(y * 32 + x) * 3];
                min = min.min(v);
                max = max.max(v);
            }
        }
        // Original contrast was 255; after three passes it must collapse.
        assert!(max - min < 32, "contrast {} too high", max - min);
    }

    #[test]
    fn pixels_outside_region_untouched() {
        let width = 16u32;
        let height = 16u32;
        let mut pixels: Vec<u8> = (0..16 * 16 * 3).map(|i| (i % 256) as u8).collect();
        let before = pixels.clone();
        let r = region(0.5, 0.5, 0.25, 0.25);
        blur_region(&mut pixels, width, height, &r);

        let offset = (2 * 16 + 2) * 3;
        assert_eq!(&pixels[offset..offset + 3], &before[offset..offset + 3]);
    }

    #[test]
    fn degenerate_region_is_ignored() {
        let mut pixels = vec![7u8; 8 * 8 * 3];
        let r = region(0.9, 0.9, 0.0, 0.0);
        blur_region(&mut pixels, 8, 8, &r);
        assert!(pixels.iter().all(|&p| p == 7));
    }
}
