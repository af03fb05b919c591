use crate::{ImagePoint, KeyPoint, NormalizedKeyPoint};
use nalgebra::{Matrix3, Point2, Vector2};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Allows conversion between the points on an image and normalized image
/// coordinates, which describe where on the virtual image plane at depth `1.0`
/// an observation ray passes through.
pub trait CameraModel {
    /// Takes in a point from an image in pixel coordinates and converts it
    /// to a [`NormalizedKeyPoint`], correcting distortion in the process.
    fn calibrate<P>(&self, point: P) -> NormalizedKeyPoint
    where
        P: ImagePoint;

    /// Converts a [`NormalizedKeyPoint`] back into pixel coordinates,
    /// re-applying the lens distortion.
    fn uncalibrate(&self, projection: NormalizedKeyPoint) -> KeyPoint;
}

/// Intrinsic camera parameters as per
/// [camera resectioning](https://en.wikipedia.org/wiki/Camera_resectioning#Intrinsic_parameters).
///
/// For a high quality camera this may be sufficient to normalize image
/// coordinates; real lenses usually also need the distortion correction of
/// [`RadialDistortionCamera`].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraIntrinsics {
    pub focals: Vector2<f64>,
    pub principal_point: Point2<f64>,
    pub skew: f64,
}

impl CameraIntrinsics {
    /// Creates camera intrinsics that would create an identity intrinsic
    /// matrix: origin at `0,0`, the focal length as the pixel distance unit,
    /// square pixels, and no skew.
    pub fn identity() -> Self {
        Self {
            focals: Vector2::new(1.0, 1.0),
            principal_point: Point2::new(0.0, 0.0),
            skew: 0.0,
        }
    }

    pub fn focals(self, focals: Vector2<f64>) -> Self {
        Self { focals, ..self }
    }

    pub fn focal(self, focal: f64) -> Self {
        Self {
            focals: Vector2::new(focal, focal),
            ..self
        }
    }

    pub fn principal_point(self, principal_point: Point2<f64>) -> Self {
        Self {
            principal_point,
            ..self
        }
    }

    pub fn skew(self, skew: f64) -> Self {
        Self { skew, ..self }
    }

    #[rustfmt::skip]
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focals.x,  self.skew,      self.principal_point.x,
            0.0,            self.focals.y,  self.principal_point.y,
            0.0,            0.0,            1.0,
        )
    }
}

impl CameraModel for CameraIntrinsics {
    /// ```
    /// use vo_core::{CameraIntrinsics, CameraModel, KeyPoint};
    /// use vo_core::nalgebra::{Point2, Vector2};
    /// let intrinsics = CameraIntrinsics {
    ///     focals: Vector2::new(800.0, 900.0),
    ///     principal_point: Point2::new(500.0, 600.0),
    ///     skew: 1.7,
    /// };
    /// let kp = KeyPoint::new(471.0, 322.0);
    /// let nkp = intrinsics.calibrate(kp);
    /// let distance = (kp.0.to_homogeneous() - intrinsics.matrix() * nkp.0.to_homogeneous()).norm();
    /// assert!(distance < 0.1);
    /// ```
    fn calibrate<P>(&self, point: P) -> NormalizedKeyPoint
    where
        P: ImagePoint,
    {
        let centered = point.image_point() - self.principal_point;
        let y = centered.y / self.focals.y;
        let x = (centered.x - self.skew * y) / self.focals.x;
        NormalizedKeyPoint::new(x, y)
    }

    fn uncalibrate(&self, projection: NormalizedKeyPoint) -> KeyPoint {
        let y = projection.y * self.focals.y;
        let x = projection.x * self.focals.x + self.skew * projection.y;
        KeyPoint(Point2::new(x, y) + self.principal_point.coords)
    }
}

/// A pinhole camera with two radial distortion coefficients (K1 and K2),
/// the leading terms of the Brown-Conrady model used by most calibration
/// tools.
///
/// Normalization inverts the distortion with a fixed-point iteration, the
/// same scheme calibration libraries use to undistort points; the forward
/// direction is closed-form.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct RadialDistortionCamera {
    pub linear: CameraIntrinsics,
    pub k1: f64,
    pub k2: f64,
}

impl RadialDistortionCamera {
    pub fn new(linear: CameraIntrinsics, k1: f64, k2: f64) -> Self {
        Self { linear, k1, k2 }
    }

    /// The radial scale factor `1 + k1 r^2 + k2 r^4` at squared radius `r2`.
    fn distortion_factor(&self, r2: f64) -> f64 {
        1.0 + self.k1 * r2 + self.k2 * r2 * r2
    }
}

impl CameraModel for RadialDistortionCamera {
    /// ```
    /// use vo_core::{CameraIntrinsics, CameraModel, KeyPoint, RadialDistortionCamera};
    /// use vo_core::nalgebra::{Point2, Vector2};
    /// let camera = RadialDistortionCamera::new(
    ///     CameraIntrinsics::identity()
    ///         .focal(800.0)
    ///         .principal_point(Point2::new(320.0, 240.0)),
    ///     -0.15,
    ///     0.02,
    /// );
    /// let kp = KeyPoint::new(471.0, 322.0);
    /// let nkp = camera.calibrate(kp);
    /// let ukp = camera.uncalibrate(nkp);
    /// assert!((kp.0 - ukp.0).norm() < 1e-9);
    /// ```
    fn calibrate<P>(&self, point: P) -> NormalizedKeyPoint
    where
        P: ImagePoint,
    {
        let NormalizedKeyPoint(distorted) = self.linear.calibrate(point);
        // Fixed-point iteration of `u = d / f(|u|^2)` starting at the
        // distorted position. Contraction slows down towards the image
        // corners of strong lenses, so iterate to tolerance rather than a
        // token fixed count.
        let mut undistorted = distorted.coords;
        for _ in 0..50 {
            let next = distorted.coords / self.distortion_factor(undistorted.norm_squared());
            let finished = (next - undistorted).norm_squared() < 1e-24;
            undistorted = next;
            if finished {
                break;
            }
        }
        NormalizedKeyPoint(undistorted.into())
    }

    fn uncalibrate(&self, projection: NormalizedKeyPoint) -> KeyPoint {
        let undistorted = projection.coords;
        let factor = self.distortion_factor(undistorted.norm_squared());
        self.linear
            .uncalibrate(NormalizedKeyPoint((undistorted * factor).into()))
    }
}
