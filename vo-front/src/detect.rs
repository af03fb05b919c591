//! Keypoint replenishment.
//!
//! After a keyframe is promoted, the tracked point set is topped back up to
//! its target density. A coverage mask marks a disk around every point that
//! is already tracked; a Shi-Tomasi (minimum eigenvalue of the structure
//! tensor) corner detector then runs only over the uncovered area, with a
//! quality cut relative to the strongest response and a greedy minimum
//! distance between accepted corners.

use image::GrayImage;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use log::debug;
use vo_core::KeyPoint;

use crate::settings::FrontendSettings;

/// Shi-Tomasi corner detector with coverage masking.
#[derive(Debug, Clone, Copy)]
pub struct CornerDetector {
    quality_level: f64,
    min_distance: u32,
    coverage_radius: u32,
}

impl CornerDetector {
    pub fn from_settings(settings: &FrontendSettings) -> Self {
        Self {
            quality_level: settings.corner_quality_level,
            min_distance: settings.corner_min_distance,
            coverage_radius: settings.keypoint_coverage_radius,
        }
    }

    /// Detects up to `maximum` new corners outside the coverage disks of
    /// `existing`. Returns an empty list without touching the image when
    /// `maximum` is zero.
    pub fn detect(
        &self,
        image: &GrayImage,
        existing: &[KeyPoint],
        maximum: usize,
    ) -> Vec<KeyPoint> {
        if maximum == 0 {
            return Vec::new();
        }
        let (width, height) = image.dimensions();
        let covered = coverage_mask(width, height, existing, self.coverage_radius);

        // Smallest eigenvalue of the 3x3-summed gradient structure tensor.
        let gx = horizontal_sobel(image);
        let gy = vertical_sobel(image);
        let mut response = vec![0.0f64; (width * height) as usize];
        let mut strongest = 0.0f64;
        for y in 2..height.saturating_sub(2) {
            for x in 2..width.saturating_sub(2) {
                if covered[(y * width + x) as usize] {
                    continue;
                }
                let (mut sxx, mut syy, mut sxy) = (0.0f64, 0.0f64, 0.0f64);
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        let px = (x as i64 + dx) as u32;
                        let py = (y as i64 + dy) as u32;
                        let ix = gx.get_pixel(px, py).0[0] as f64;
                        let iy = gy.get_pixel(px, py).0[0] as f64;
                        sxx += ix * ix;
                        syy += iy * iy;
                        sxy += ix * iy;
                    }
                }
                let trace = sxx + syy;
                let discriminant = (trace * trace - 4.0 * (sxx * syy - sxy * sxy)).max(0.0);
                let min_eigen = (trace - discriminant.sqrt()) / 2.0;
                response[(y * width + x) as usize] = min_eigen;
                strongest = strongest.max(min_eigen);
            }
        }
        if strongest <= 0.0 {
            return Vec::new();
        }

        // Strongest first, then greedy acceptance with a minimum spacing.
        let threshold = self.quality_level * strongest;
        let mut candidates: Vec<(u32, u32, f64)> = response
            .iter()
            .enumerate()
            .filter(|&(_, &r)| r >= threshold)
            .map(|(slot, &r)| (slot as u32 % width, slot as u32 / width, r))
            .collect();
        candidates.sort_unstable_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let min_distance_squared = (self.min_distance * self.min_distance) as i64;
        let mut accepted: Vec<KeyPoint> = Vec::new();
        for (x, y, _) in candidates {
            if accepted.len() >= maximum {
                break;
            }
            let spaced = accepted.iter().all(|point| {
                let dx = point.x as i64 - x as i64;
                let dy = point.y as i64 - y as i64;
                dx * dx + dy * dy >= min_distance_squared
            });
            if spaced {
                accepted.push(KeyPoint::new(x as f64, y as f64));
            }
        }
        debug!(
            "detected {} new corners of {} requested (strongest response {})",
            accepted.len(),
            maximum,
            strongest
        );
        accepted
    }
}

/// Marks a disk of `radius` around every point as covered.
fn coverage_mask(width: u32, height: u32, points: &[KeyPoint], radius: u32) -> Vec<bool> {
    let mut mask = vec![false; (width * height) as usize];
    let radius = radius as i64;
    for point in points {
        let cx = point.x.round() as i64;
        let cy = point.y.round() as i64;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy > radius * radius {
                    continue;
                }
                let x = cx + dx;
                let y = cy + dy;
                if x >= 0 && y >= 0 && x < width as i64 && y < height as i64 {
                    mask[(y as u32 * width + x as u32) as usize] = true;
                }
            }
        }
    }
    mask
}
