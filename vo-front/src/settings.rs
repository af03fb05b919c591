use core::f64::consts::PI;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The settings for the front-end pipeline.
///
/// One immutable value of this is handed to every component at construction;
/// there is no ambient tuning state. The defaults reproduce the behavior the
/// pipeline was tuned with on handheld and drone footage.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone)]
pub struct FrontendSettings {
    /// The maximum per-point optical flow error (mean absolute intensity
    /// residual over the tracking window) for a track to survive.
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_max_flow_error"))]
    pub max_flow_error: f64,
    /// The fraction of tracks lost in one frame above which the whole frame
    /// is rejected.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_lost_tracks_ratio")
    )]
    pub max_lost_tracks_ratio: f64,
    /// Half-width of the optical flow tracking window.
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_flow_window_radius"))]
    pub flow_window_radius: u32,
    /// The number of pyramid levels used by the optical flow tracker.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_flow_pyramid_levels")
    )]
    pub flow_pyramid_levels: usize,
    /// The maximum number of refinement iterations per pyramid level.
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_flow_iterations"))]
    pub flow_iterations: usize,
    /// The flow update magnitude below which a level's refinement stops.
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_flow_epsilon"))]
    pub flow_epsilon: f64,
    /// The minimum eigenvalue of the tracking window's structure tensor for
    /// a point to be trackable at all.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_flow_min_eigenvalue")
    )]
    pub flow_min_eigenvalue: f64,
    /// The minimum number of triangulated correspondences required to run
    /// the pose solve, and the minimum number of inliers it must keep.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_pose_correspondences")
    )]
    pub min_pose_correspondences: usize,
    /// The inlier threshold for the sample-consensus pose stage, as a
    /// reprojection distance in normalized image coordinates.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_pose_consensus_threshold")
    )]
    pub pose_consensus_threshold: f64,
    /// The maximum tolerated ratio of outliers among the pose
    /// correspondences.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_pose_outlier_ratio")
    )]
    pub max_pose_outlier_ratio: f64,
    /// The maximum mean reprojection error of the refined pose, in pixels.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_reprojection_error")
    )]
    pub max_reprojection_error: f64,
    /// The gradient descent rate of single-view pose refinement.
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_pose_refine_rate"))]
    pub pose_refine_rate: f64,
    /// The maximum iterations of single-view pose refinement.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_pose_refine_iterations")
    )]
    pub pose_refine_iterations: usize,
    /// The singular-value condition ratio of the inter-frame homography
    /// above which a frame is promoted to a keyframe. A well-conditioned
    /// homography means the motion is explained by rotation alone, so the
    /// threshold sits just above 1.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_homography_condition_threshold")
    )]
    pub homography_condition_threshold: f64,
    /// The maximum number of point pairs fed to the keyframe homography
    /// fit; inputs are sub-sampled to this count for performance.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_homography_points")
    )]
    pub max_homography_points: usize,
    /// The radius of the disk each tracked point covers when deciding where
    /// new keypoints are still needed.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_keypoint_coverage_radius")
    )]
    pub keypoint_coverage_radius: u32,
    /// The hard cap on the number of simultaneously tracked keypoints.
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_max_keypoints"))]
    pub max_keypoints: usize,
    /// The corner response threshold relative to the strongest corner in
    /// the image; candidates below it are not detected.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_corner_quality_level")
    )]
    pub corner_quality_level: f64,
    /// The minimum pixel distance between two detected corners.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_corner_min_distance")
    )]
    pub corner_min_distance: u32,
}

impl FrontendSettings {
    /// The number of keypoints to maintain for a given image resolution:
    /// enough for the coverage disks to tile the whole image, capped at
    /// [`max_keypoints`](Self::max_keypoints).
    pub fn target_keypoints(&self, width: u32, height: u32) -> usize {
        let disk_area = PI * (self.keypoint_coverage_radius as f64).powi(2);
        let full_coverage = ((width * height) as f64 / disk_area).round() as usize;
        full_coverage.min(self.max_keypoints)
    }
}

impl Default for FrontendSettings {
    fn default() -> Self {
        Self {
            max_flow_error: default_max_flow_error(),
            max_lost_tracks_ratio: default_max_lost_tracks_ratio(),
            flow_window_radius: default_flow_window_radius(),
            flow_pyramid_levels: default_flow_pyramid_levels(),
            flow_iterations: default_flow_iterations(),
            flow_epsilon: default_flow_epsilon(),
            flow_min_eigenvalue: default_flow_min_eigenvalue(),
            min_pose_correspondences: default_min_pose_correspondences(),
            pose_consensus_threshold: default_pose_consensus_threshold(),
            max_pose_outlier_ratio: default_max_pose_outlier_ratio(),
            max_reprojection_error: default_max_reprojection_error(),
            pose_refine_rate: default_pose_refine_rate(),
            pose_refine_iterations: default_pose_refine_iterations(),
            homography_condition_threshold: default_homography_condition_threshold(),
            max_homography_points: default_max_homography_points(),
            keypoint_coverage_radius: default_keypoint_coverage_radius(),
            max_keypoints: default_max_keypoints(),
            corner_quality_level: default_corner_quality_level(),
            corner_min_distance: default_corner_min_distance(),
        }
    }
}

fn default_max_flow_error() -> f64 {
    12.0
}

fn default_max_lost_tracks_ratio() -> f64 {
    0.5
}

fn default_flow_window_radius() -> u32 {
    10
}

fn default_flow_pyramid_levels() -> usize {
    4
}

fn default_flow_iterations() -> usize {
    30
}

fn default_flow_epsilon() -> f64 {
    0.01
}

fn default_flow_min_eigenvalue() -> f64 {
    1e-4
}

fn default_min_pose_correspondences() -> usize {
    8
}

fn default_pose_consensus_threshold() -> f64 {
    0.005
}

fn default_max_pose_outlier_ratio() -> f64 {
    0.33
}

fn default_max_reprojection_error() -> f64 {
    2.0
}

fn default_pose_refine_rate() -> f64 {
    0.5
}

fn default_pose_refine_iterations() -> usize {
    200
}

fn default_homography_condition_threshold() -> f64 {
    1.04
}

fn default_max_homography_points() -> usize {
    75
}

fn default_keypoint_coverage_radius() -> u32 {
    12
}

fn default_max_keypoints() -> usize {
    300
}

fn default_corner_quality_level() -> f64 {
    0.01
}

fn default_corner_min_distance() -> u32 {
    12
}
