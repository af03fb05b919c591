use crate::{CameraPoint, Projective};
use derive_more::{AsMut, AsRef, Deref, DerefMut, From, Into};
use nalgebra::Point2;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Allows the retrieval of the point on the image the feature came from.
pub trait ImagePoint {
    /// Retrieves the point on the image.
    fn image_point(&self) -> Point2<f64>;
}

/// A point on an image frame in pixel coordinates, neither undistorted nor
/// normalized. This is what the feature tracker and corner detector produce.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct KeyPoint(pub Point2<f64>);

impl KeyPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self(Point2::new(x, y))
    }
}

impl ImagePoint for KeyPoint {
    fn image_point(&self) -> Point2<f64> {
        self.0
    }
}

/// A keypoint in normalized image coordinates: corrected for lens distortion
/// and expressed on the virtual image plane at depth `1.0`. All the geometry
/// in `vo-geom` operates on these, so it never needs to see the calibration.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, AsMut, AsRef, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct NormalizedKeyPoint(pub Point2<f64>);

impl NormalizedKeyPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self(Point2::new(x, y))
    }

    /// Projects a [`CameraPoint`] onto the virtual image plane. Fails when
    /// the point does not lie strictly in front of the camera.
    pub fn from_camera_point(point: CameraPoint) -> Option<Self> {
        point
            .point()
            .filter(|p| p.z > 0.0)
            .map(|p| Self(Point2::new(p.x / p.z, p.y / p.z)))
    }

    /// Conceptually appends a `1.0` component to create a [`CameraPoint`] on
    /// the virtual image plane, then scales the result to the given depth.
    pub fn with_depth(self, depth: f64) -> CameraPoint {
        CameraPoint::from_point((self.coords * depth).push(depth).into())
    }
}
