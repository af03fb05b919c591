//! Planar homography fitting on normalized image coordinates.
//!
//! The front-end does not use the homography to map points; it uses the
//! *quality of the fit* as a parallax test between a keyframe and the current
//! frame. Rotation-only or low-parallax motion is explained exactly by a
//! planar homography, which then comes out well conditioned, while genuine 3d
//! parallax leaves the least-squares fit poorly conditioned. The
//! [`HomographyMatrix::condition_ratio`] exposes that signal.

use float_ord::FloatOrd;
use vo_core::{
    nalgebra::{Matrix3, RowSVector, SMatrix},
    FeatureMatch,
};

/// The minimum number of point pairs required to fit a homography.
pub const MIN_HOMOGRAPHY_MATCHES: usize = 4;

/// A `3x3` planar homography mapping first-frame normalized coordinates onto
/// second-frame normalized coordinates.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct HomographyMatrix(pub Matrix3<f64>);

impl HomographyMatrix {
    /// The ratio of the largest to the smallest singular value.
    ///
    /// `1.0` is a perfectly conditioned (orthogonal) homography; the ratio
    /// grows as the planar model fails to explain the motion. Returns
    /// infinity for a singular matrix.
    pub fn condition_ratio(&self) -> f64 {
        let singular_values = self.0.svd(false, false).singular_values;
        if singular_values[2] <= 0.0 {
            f64::INFINITY
        } else {
            singular_values[0] / singular_values[2]
        }
    }
}

/// Fits a homography to normalized keypoint pairs with the direct linear
/// transform, minimizing the algebraic error over all provided matches.
///
/// ```
/// use vo_core::{FeatureMatch, NormalizedKeyPoint};
/// use vo_geom::homography::DltHomography;
///
/// // Observations of a fronto-parallel plane shifted right by 0.1.
/// let matches = [(0.0, 0.0), (0.3, 0.1), (-0.2, 0.4), (0.1, -0.3), (-0.4, -0.2)]
///     .map(|(x, y)| FeatureMatch(NormalizedKeyPoint::new(x, y), NormalizedKeyPoint::new(x + 0.1, y)));
/// let homography = DltHomography::new().from_matches(matches.iter().copied()).unwrap();
/// assert!(homography.condition_ratio() < 1.3);
/// ```
#[derive(Copy, Clone, Debug)]
pub struct DltHomography {
    pub epsilon: f64,
    pub iterations: usize,
}

impl DltHomography {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_matches<I>(&self, data: I) -> Option<HomographyMatrix>
    where
        I: Iterator<Item = FeatureMatch> + Clone,
    {
        if data.clone().count() < MIN_HOMOGRAPHY_MATCHES {
            return None;
        }

        // Accumulate the normal matrix of the 2n x 9 DLT system directly.
        let mut design = SMatrix::<f64, 9, 9>::zeros();
        for FeatureMatch(a, b) in data {
            let rows = [
                RowSVector::<f64, 9>::from_row_slice(&[
                    a.x,
                    a.y,
                    1.0,
                    0.0,
                    0.0,
                    0.0,
                    -b.x * a.x,
                    -b.x * a.y,
                    -b.x,
                ]),
                RowSVector::<f64, 9>::from_row_slice(&[
                    0.0,
                    0.0,
                    0.0,
                    a.x,
                    a.y,
                    1.0,
                    -b.y * a.x,
                    -b.y * a.y,
                    -b.y,
                ]),
            ];
            for row in rows {
                design += row.transpose() * row;
            }
        }

        let eigens = design.try_symmetric_eigen(self.epsilon, self.iterations)?;
        let eigenvector = eigens
            .eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| FloatOrd(n))
            .map(|(ix, _)| eigens.eigenvectors.column(ix).into_owned())?;
        Some(HomographyMatrix(Matrix3::from_row_slice(
            eigenvector.as_slice(),
        )))
    }
}

impl Default for DltHomography {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            iterations: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vo_core::{
        nalgebra::{Point3, Rotation3, Vector3},
        NormalizedKeyPoint, Pose, Projective, WorldPoint, WorldToCamera,
    };

    fn project(pose: WorldToCamera, point: WorldPoint) -> NormalizedKeyPoint {
        NormalizedKeyPoint::from_camera_point(pose.transform(point)).unwrap()
    }

    fn scene() -> Vec<WorldPoint> {
        // Points spread over depth so that translation produces parallax.
        [
            (0.0, 0.0, 2.0),
            (0.8, 0.2, 2.5),
            (-0.6, 0.5, 4.0),
            (0.3, -0.7, 3.0),
            (-0.4, -0.3, 6.0),
            (0.9, 0.8, 5.0),
            (-0.9, 0.1, 2.2),
            (0.2, 0.6, 7.0),
        ]
        .iter()
        .map(|&(x, y, z)| WorldPoint::from_point(Point3::new(x, y, z)))
        .collect()
    }

    #[test]
    fn pure_rotation_is_well_conditioned() {
        let pose_a = WorldToCamera::identity();
        let pose_b = WorldToCamera::from_parts(
            Vector3::zeros(),
            Rotation3::from_scaled_axis(Vector3::new(0.0, 0.05, 0.01)),
        );
        let matches: Vec<FeatureMatch> = scene()
            .into_iter()
            .map(|p| FeatureMatch(project(pose_a, p), project(pose_b, p)))
            .collect();
        let homography = DltHomography::new()
            .from_matches(matches.iter().copied())
            .unwrap();
        // Rotation-only motion is explained exactly by a homography.
        assert!(homography.condition_ratio() < 1.04);
    }

    #[test]
    fn translational_parallax_breaks_the_planar_fit() {
        let pose_a = WorldToCamera::identity();
        let pose_b =
            WorldToCamera::from_parts(Vector3::new(-0.8, 0.0, 0.0), Rotation3::identity());
        let matches: Vec<FeatureMatch> = scene()
            .into_iter()
            .map(|p| FeatureMatch(project(pose_a, p), project(pose_b, p)))
            .collect();
        let homography = DltHomography::new()
            .from_matches(matches.iter().copied())
            .unwrap();
        assert!(homography.condition_ratio() > 1.04);
    }

    #[test]
    fn too_few_matches_is_rejected() {
        let matches = [
            FeatureMatch(NormalizedKeyPoint::new(0.0, 0.0), NormalizedKeyPoint::new(0.1, 0.0)),
            FeatureMatch(NormalizedKeyPoint::new(0.4, 0.2), NormalizedKeyPoint::new(0.5, 0.2)),
            FeatureMatch(NormalizedKeyPoint::new(-0.3, 0.1), NormalizedKeyPoint::new(-0.2, 0.1)),
        ];
        assert!(DltHomography::new()
            .from_matches(matches.iter().copied())
            .is_none());
    }
}
