//! Contracts between the pipeline core and its external collaborators.
//!
//! Image acquisition, calibration loading, bootstrap extraction,
//! visualization, and file export all live outside this crate; the pipeline
//! only sees them through the traits and view types defined here. The
//! observer is strictly one-way: it may inspect the per-frame report and
//! raise a save request, but nothing it does can influence a pipeline
//! decision.

use image::{GrayImage, RgbImage};
use vo_core::{KeyPoint, WorldPoint, WorldToCamera};

use crate::error::{BootstrapFailure, RejectionCause};
use crate::index::TrackTable;
use crate::map::MapStore;

/// The outcome of one tracked point.
#[derive(Debug, Clone, Copy)]
pub struct TrackedPoint {
    /// The position in the new frame. Meaningless when `valid` is false.
    pub position: KeyPoint,
    /// Whether the point could be tracked at all.
    pub valid: bool,
    /// The tracker's error magnitude for this point; the pipeline drops
    /// points whose error exceeds its configured maximum.
    pub error: f64,
}

/// Frame-to-frame sparse 2d tracking.
///
/// The production implementation is the pyramidal Lucas-Kanade tracker in
/// [`crate::flow`]; tests drive the pipeline with synthetic trackers that
/// report exact correspondences.
pub trait PointTracker {
    /// Tracks `points` from `previous` into `next`, producing exactly one
    /// result per input point, in order.
    fn track(&self, previous: &GrayImage, next: &GrayImage, points: &[KeyPoint])
        -> Vec<TrackedPoint>;
}

/// One bootstrap correspondence: a known 3d point and its detection in the
/// first frame.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapMatch {
    pub image: KeyPoint,
    pub world: WorldPoint,
}

/// Supplies the a-priori 2d-3d correspondences for the first frame, either
/// from a planar calibration pattern or from a pre-defined point cloud
/// reprojected under a known initial pose.
pub trait BootstrapProvider {
    fn bootstrap(
        &mut self,
        color: &RgbImage,
        gray: &GrayImage,
    ) -> Result<Vec<BootstrapMatch>, BootstrapFailure>;
}

/// Per-point color lookup on a color image.
pub trait ColorSampler {
    /// Returns one color per query point, in order.
    fn sample(&self, image: &RgbImage, points: &[KeyPoint]) -> Vec<[u8; 3]>;
}

/// Samples the nearest pixel, clamped to the image bounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestPixelSampler;

impl ColorSampler for NearestPixelSampler {
    fn sample(&self, image: &RgbImage, points: &[KeyPoint]) -> Vec<[u8; 3]> {
        let (width, height) = image.dimensions();
        points
            .iter()
            .map(|point| {
                let x = (point.x.round() as i64).clamp(0, width as i64 - 1) as u32;
                let y = (point.y.round() as i64).clamp(0, height as i64 - 1) as u32;
                image.get_pixel(x, y).0
            })
            .collect()
    }
}

/// How a frame left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame failed a staged check and all its state was rolled back.
    Rejected(RejectionCause),
    /// The frame was tracked and given a pose.
    Tracked,
    /// The frame was tracked and promoted to the new keyframe.
    Keyframe,
}

impl FrameStatus {
    /// The status code reported to visualization:
    /// rejected = 0, accepted = 1, accepted keyframe = 2.
    pub fn code(self) -> u8 {
        match self {
            FrameStatus::Rejected(_) => 0,
            FrameStatus::Tracked => 1,
            FrameStatus::Keyframe => 2,
        }
    }

    pub fn is_accepted(self) -> bool {
        !matches!(self, FrameStatus::Rejected(_))
    }

    pub fn rejection(self) -> Option<RejectionCause> {
        match self {
            FrameStatus::Rejected(cause) => Some(cause),
            _ => None,
        }
    }
}

/// Everything a renderer needs about the frame that just finished.
#[derive(Debug, Clone, Copy)]
pub struct FrameReport<'a> {
    /// The frame ordinal.
    pub frame: usize,
    pub status: FrameStatus,
    /// The pose of this frame; absent when rejected.
    pub pose: Option<WorldToCamera>,
    /// The track table after the frame's outcome was applied.
    pub tracks: &'a TrackTable,
    /// The whole map store.
    pub map: &'a MapStore,
}

/// A visualization sink.
///
/// Called after every frame decision, never during one. Implementations must
/// not mutate pipeline state; the only signal traveling back is the save
/// request, which the driver polls at frame boundaries to trigger an export
/// checkpoint.
pub trait FrameObserver {
    fn on_frame(&mut self, report: &FrameReport<'_>);

    /// Returns and clears the user's save-now request.
    fn take_save_request(&mut self) -> bool {
        false
    }
}
