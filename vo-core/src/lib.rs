//! # vo-core
//!
//! Core abstractions and types shared by the visual odometry front-end crates.
//! This includes projective 3d points, poses, pixel and normalized keypoints,
//! the pinhole camera model with radial distortion, and the match types fed
//! into sample consensus. The crate is intentionally small; anything with an
//! algorithm of its own lives in `vo-geom` or `vo-front`.
//!
//! The coordinate conventions follow the usual computer vision ones: for a
//! camera, positive X is right, positive Y is down, and positive Z is forwards
//! out of the optical center. A [`NormalizedKeyPoint`] is the intersection of
//! an observation ray with the virtual image plane at depth `1.0`, after the
//! lens distortion has been corrected, so all geometry downstream of the
//! camera model is independent of the calibration.

mod camera;
mod keypoint;
mod matches;
mod point;
mod pose;
mod se3;
mod triangulation;

pub use camera::*;
pub use keypoint::*;
pub use matches::*;
pub use nalgebra;
pub use point::*;
pub use pose::*;
pub use sample_consensus;
pub use se3::*;
pub use triangulation::*;
