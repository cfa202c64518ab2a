//! Bright-spot detection inside the scan region.
//!
//! The detector is a pure decision procedure over a prepared grayscale crop:
//! threshold relative to the peak intensity, count 8-connected bright
//! components, and accept only a single blob. Ambient light or bleed from a
//! neighboring LED produces extra components and is rejected rather than
//! mislocated.

use image::{imageops, GrayImage, Luma, RgbImage};
use imageproc::filter::gaussian_blur_f32;
use imageproc::region_labelling::{connected_components, Connectivity};

use crate::models::RoiPixels;

/// Smoothing applied to the crop before thresholding, suppressing sensor
/// noise that would split the spot into multiple components.
const BLUR_SIGMA: f32 = 1.0;

/// Centroid of the detected spot, in crop-local pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Spot {
    pub x: f32,
    pub y: f32,
}

/// Crop the scan region out of a frame and prepare it for detection.
pub fn prepare_roi(frame: &RgbImage, bounds: &RoiPixels) -> GrayImage {
    let crop = imageops::crop_imm(frame, bounds.x, bounds.y, bounds.w, bounds.h).to_image();
    let gray = imageops::grayscale(&crop);
    gaussian_blur_f32(&gray, BLUR_SIGMA)
}

/// Locate a single bright spot in the prepared crop.
///
/// The threshold sits `tolerance` below the peak intensity, so only pixels
/// near the maximum survive. Exactly one surviving component yields its
/// intensity-weighted centroid; zero or several components yield `None`.
pub fn find_spot(gray: &GrayImage, tolerance: u8) -> Option<Spot> {
    let peak = gray.pixels().map(|p| p.0[0]).max()?;
    let threshold = peak.saturating_sub(tolerance);

    let mut mask = GrayImage::new(gray.width(), gray.height());
    for (masked, pixel) in mask.pixels_mut().zip(gray.pixels()) {
        if pixel.0[0] > threshold {
            masked.0[0] = 255;
        }
    }

    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));
    let blobs = labels.pixels().map(|p| p.0[0]).max().unwrap_or(0);
    if blobs != 1 {
        return None;
    }

    Some(centroid(gray, &mask))
}

/// Intensity-weighted first-order moment of the masked pixels, falling back
/// to the arithmetic mean of the mask coordinates when the weighted mass is
/// zero.
fn centroid(gray: &GrayImage, mask: &GrayImage) -> Spot {
    let mut mass = 0f64;
    let mut mx = 0f64;
    let mut my = 0f64;
    let mut count = 0u32;
    let mut sx = 0f64;
    let mut sy = 0f64;

    for (x, y, pixel) in mask.enumerate_pixels() {
        if pixel.0[0] == 0 {
            continue;
        }

        let weight = gray.get_pixel(x, y).0[0] as f64;
        mass += weight;
        mx += weight * x as f64;
        my += weight * y as f64;

        count += 1;
        sx += x as f64;
        sy += y as f64;
    }

    if mass > 0. {
        Spot {
            x: (mx / mass) as f32,
            y: (my / mass) as f32,
        }
    } else {
        Spot {
            x: (sx / count.max(1) as f64) as f32,
            y: (sy / count.max(1) as f64) as f32,
        }
    }
}
