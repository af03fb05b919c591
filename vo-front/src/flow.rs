//! Pyramidal Lucas-Kanade optical flow.
//!
//! Tracks sparse 2d points from one grayscale frame into the next by
//! iteratively solving the window-local brightness-constancy system on an
//! image pyramid, coarse to fine. Each tracked point reports a validity flag
//! and an error magnitude (mean absolute intensity residual over the window),
//! which the pipeline thresholds to drop bad tracks.

use image::GrayImage;
use vo_core::KeyPoint;

use crate::interfaces::{PointTracker, TrackedPoint};
use crate::settings::FrontendSettings;

/// Sparse iterative Lucas-Kanade tracker over a box-filtered image pyramid.
#[derive(Debug, Clone)]
pub struct LucasKanadeTracker {
    window_radius: i64,
    levels: usize,
    iterations: usize,
    epsilon: f64,
    min_eigenvalue: f64,
}

impl LucasKanadeTracker {
    pub fn from_settings(settings: &FrontendSettings) -> Self {
        Self {
            window_radius: settings.flow_window_radius as i64,
            levels: settings.flow_pyramid_levels.max(1),
            iterations: settings.flow_iterations,
            epsilon: settings.flow_epsilon,
            min_eigenvalue: settings.flow_min_eigenvalue,
        }
    }

    /// Builds a pyramid by 2x2 box downsampling, stopping early if the
    /// image becomes too small to hold a tracking window.
    fn build_pyramid(&self, image: &GrayImage) -> Vec<GrayImage> {
        let mut pyramid = Vec::with_capacity(self.levels);
        pyramid.push(image.clone());
        for level in 1..self.levels {
            let previous = &pyramid[level - 1];
            let (width, height) = previous.dimensions();
            let (width, height) = (width / 2, height / 2);
            if (width as i64) < 4 * self.window_radius || (height as i64) < 4 * self.window_radius {
                break;
            }
            let mut shrunk = GrayImage::new(width, height);
            for y in 0..height {
                for x in 0..width {
                    let sum: u32 = [(0, 0), (1, 0), (0, 1), (1, 1)]
                        .iter()
                        .map(|&(dx, dy)| previous.get_pixel(2 * x + dx, 2 * y + dy).0[0] as u32)
                        .sum();
                    shrunk.put_pixel(x, y, image::Luma([((sum + 2) / 4) as u8]));
                }
            }
            pyramid.push(shrunk);
        }
        pyramid
    }

    fn track_point(
        &self,
        previous: &[GrayImage],
        next: &[GrayImage],
        point: KeyPoint,
    ) -> TrackedPoint {
        let lost = TrackedPoint {
            position: point,
            valid: false,
            error: f64::INFINITY,
        };
        let levels = previous.len().min(next.len());
        let mut flow = (0.0, 0.0);
        for level in (0..levels).rev() {
            let scale = (1u32 << level) as f64;
            let origin = (point.x / scale, point.y / scale);
            match self.track_at_level(
                &previous[level],
                &next[level],
                origin,
                (origin.0 + flow.0, origin.1 + flow.1),
                level == 0,
            ) {
                Some(position) => {
                    flow = (position.0 - origin.0, position.1 - origin.1);
                }
                None => return lost,
            }
            if level > 0 {
                flow = (flow.0 * 2.0, flow.1 * 2.0);
            }
        }

        let position = KeyPoint::new(point.x + flow.0, point.y + flow.1);
        let (width, height) = previous[0].dimensions();
        if !in_bounds(position.x, position.y, width, height, self.window_radius) {
            return lost;
        }
        TrackedPoint {
            position,
            valid: true,
            error: self.window_residual(&previous[0], &next[0], (point.x, point.y), (position.x, position.y)),
        }
    }

    /// One level of iterative Lucas-Kanade. Returns the refined position of
    /// the point in this level's coordinates, or `None` if the point left
    /// the image or the window is untrackable.
    fn track_at_level(
        &self,
        previous: &GrayImage,
        next: &GrayImage,
        origin: (f64, f64),
        guess: (f64, f64),
        finest: bool,
    ) -> Option<(f64, f64)> {
        let (width, height) = previous.dimensions();
        let radius = self.window_radius;
        if !in_bounds(origin.0, origin.1, width, height, radius + 1) {
            return None;
        }

        // The spatial gradients and structure tensor are fixed on the
        // previous image; only the temporal mismatch moves per iteration.
        let side = (2 * radius + 1) as usize;
        let mut gradient_x = vec![0.0f64; side * side];
        let mut gradient_y = vec![0.0f64; side * side];
        let (mut gxx, mut gyy, mut gxy) = (0.0f64, 0.0f64, 0.0f64);
        let mut slot = 0;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let x = origin.0 + dx as f64;
                let y = origin.1 + dy as f64;
                let ix = (sample(previous, x + 1.0, y) - sample(previous, x - 1.0, y)) / 2.0;
                let iy = (sample(previous, x, y + 1.0) - sample(previous, x, y - 1.0)) / 2.0;
                gradient_x[slot] = ix;
                gradient_y[slot] = iy;
                gxx += ix * ix;
                gyy += iy * iy;
                gxy += ix * iy;
                slot += 1;
            }
        }

        let determinant = gxx * gyy - gxy * gxy;
        if determinant.abs() < f64::EPSILON {
            return None;
        }
        if finest {
            // Shi-Tomasi style trackability: the smaller eigenvalue of the
            // structure tensor, normalized per pixel.
            let trace = gxx + gyy;
            let discriminant = (trace * trace - 4.0 * determinant).max(0.0);
            let min_eigen = (trace - discriminant.sqrt()) / 2.0 / (side * side) as f64;
            if min_eigen < self.min_eigenvalue {
                return None;
            }
        }

        let mut position = guess;
        for _ in 0..self.iterations {
            if !in_bounds(position.0, position.1, width, height, radius + 1) {
                return None;
            }
            let (mut bx, mut by) = (0.0f64, 0.0f64);
            let mut slot = 0;
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    let residual = sample(previous, origin.0 + dx as f64, origin.1 + dy as f64)
                        - sample(next, position.0 + dx as f64, position.1 + dy as f64);
                    bx += gradient_x[slot] * residual;
                    by += gradient_y[slot] * residual;
                    slot += 1;
                }
            }
            let du = (gyy * bx - gxy * by) / determinant;
            let dv = (gxx * by - gxy * bx) / determinant;
            position = (position.0 + du, position.1 + dv);
            if du * du + dv * dv < self.epsilon * self.epsilon {
                break;
            }
        }
        Some(position)
    }

    /// Mean absolute intensity difference over the tracking window between
    /// the source patch and the tracked patch.
    fn window_residual(
        &self,
        previous: &GrayImage,
        next: &GrayImage,
        origin: (f64, f64),
        position: (f64, f64),
    ) -> f64 {
        let radius = self.window_radius;
        let mut total = 0.0;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                total += (sample(previous, origin.0 + dx as f64, origin.1 + dy as f64)
                    - sample(next, position.0 + dx as f64, position.1 + dy as f64))
                .abs();
            }
        }
        let side = (2 * radius + 1) as f64;
        total / (side * side)
    }
}

impl PointTracker for LucasKanadeTracker {
    fn track(
        &self,
        previous: &GrayImage,
        next: &GrayImage,
        points: &[KeyPoint],
    ) -> Vec<TrackedPoint> {
        let previous_pyramid = self.build_pyramid(previous);
        let next_pyramid = self.build_pyramid(next);
        points
            .iter()
            .map(|&point| self.track_point(&previous_pyramid, &next_pyramid, point))
            .collect()
    }
}

fn in_bounds(x: f64, y: f64, width: u32, height: u32, margin: i64) -> bool {
    let margin = margin as f64;
    x >= margin && y >= margin && x < width as f64 - 1.0 - margin && y < height as f64 - 1.0 - margin
}

/// Bilinear interpolation clamped to the image bounds.
fn sample(image: &GrayImage, x: f64, y: f64) -> f64 {
    let (width, height) = image.dimensions();
    let clamp_x = |v: i64| v.clamp(0, width as i64 - 1) as u32;
    let clamp_y = |v: i64| v.clamp(0, height as i64 - 1) as u32;
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;
    let at = |px: i64, py: i64| image.get_pixel(clamp_x(px), clamp_y(py)).0[0] as f64;
    let top = at(x0, y0) * (1.0 - fx) + at(x0 + 1, y0) * fx;
    let bottom = at(x0, y0 + 1) * (1.0 - fx) + at(x0 + 1, y0 + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}
