//! # vo-geom
//!
//! Computational geometry used by the visual odometry front-end. Everything
//! here operates on normalized image coordinates (see
//! [`vo_core::NormalizedKeyPoint`]) and is independent of the camera
//! calibration:
//!
//! * [`IterativeLsTriangulator`]: two-view triangulation by iteratively
//!   reweighted linear least squares, reporting convergence and cheirality
//!   per point.
//! * [`homography`]: planar homography fitting by DLT, used for the
//!   keyframe parallax test through its singular-value condition ratio.
//! * [`DltPnp`]: a direct-linear-transform PnP estimator pluggable into
//!   [`sample_consensus`](vo_core::sample_consensus) for robust pose
//!   estimation.
//! * [`refine_pose`]: gradient-descent single-view pose refinement used to
//!   warm-start from a consensus model and sharpen it on inliers.

pub mod homography;
mod pnp;
mod refine;
mod triangulation;

pub use homography::HomographyMatrix;
pub use pnp::*;
pub use refine::*;
pub use triangulation::*;
