use vo_core::{
    nalgebra::{DMatrix, Matrix3, Matrix3x4, Rotation3},
    sample_consensus::Estimator,
    FeatureWorldMatch, Pose, Projective, WorldToCamera,
};

/// Perspective-n-Point pose estimation by the direct linear transform.
///
/// Builds the classic `2n x 12` system on normalized image coordinates, takes
/// the null-space right singular vector as the projection matrix `[R|t]` up
/// to scale, and projects its left `3x3` block onto the nearest rotation.
/// The overall sign is fixed by requiring a positive-determinant rotation,
/// which places the observed points in front of the camera for physical
/// configurations.
///
/// The minimal sample is 6 correspondences; the same solve accepts any larger
/// set, which the pipeline uses both inside sample consensus and for the
/// bootstrap pose of the first frame.
///
/// ```
/// use vo_core::{FeatureWorldMatch, NormalizedKeyPoint, Pose, Projective, WorldPoint, WorldToCamera};
/// use vo_core::nalgebra::{Point3, Rotation3, Vector3};
/// use vo_geom::DltPnp;
///
/// let pose = WorldToCamera::from_parts(
///     Vector3::new(0.1, -0.1, 0.5),
///     Rotation3::from_scaled_axis(Vector3::new(0.02, 0.1, -0.05)),
/// );
/// let matches: Vec<FeatureWorldMatch> = [
///     (0.0, 0.0, 3.0), (1.0, 0.2, 2.5), (-0.7, 0.4, 4.0), (0.3, -0.8, 3.5),
///     (-0.5, -0.4, 5.0), (0.8, 0.9, 2.2), (0.2, 0.5, 6.0),
/// ]
/// .iter()
/// .map(|&(x, y, z)| {
///     let world = WorldPoint::from_point(Point3::new(x, y, z));
///     let observation = NormalizedKeyPoint::from_camera_point(pose.transform(world)).unwrap();
///     FeatureWorldMatch(observation, world)
/// })
/// .collect();
/// let estimate = DltPnp::new().from_matches(matches.iter().copied()).unwrap();
/// let rotation_error = (estimate.isometry().rotation.angle_to(&pose.isometry().rotation)).abs();
/// assert!(rotation_error < 1e-6);
/// ```
#[derive(Copy, Clone, Debug)]
pub struct DltPnp {
    pub epsilon: f64,
    pub iterations: usize,
}

impl DltPnp {
    pub fn new() -> Self {
        Default::default()
    }

    /// Estimates the pose from any number of correspondences at or above the
    /// minimal sample size.
    pub fn from_matches<I>(&self, data: I) -> Option<WorldToCamera>
    where
        I: Iterator<Item = FeatureWorldMatch> + Clone,
    {
        let count = data.clone().count();
        if count < Self::MIN_SAMPLES {
            return None;
        }

        let mut design = DMatrix::<f64>::zeros(2 * count, 12);
        for (ix, FeatureWorldMatch(observation, world)) in data.enumerate() {
            let world = world.point()?;
            let (u, v) = (observation.x, observation.y);
            let top = 2 * ix;
            let bottom = 2 * ix + 1;

            design[(top, 0)] = world.x;
            design[(top, 1)] = world.y;
            design[(top, 2)] = world.z;
            design[(top, 3)] = 1.0;
            design[(top, 8)] = -u * world.x;
            design[(top, 9)] = -u * world.y;
            design[(top, 10)] = -u * world.z;
            design[(top, 11)] = -u;

            design[(bottom, 4)] = world.x;
            design[(bottom, 5)] = world.y;
            design[(bottom, 6)] = world.z;
            design[(bottom, 7)] = 1.0;
            design[(bottom, 8)] = -v * world.x;
            design[(bottom, 9)] = -v * world.y;
            design[(bottom, 10)] = -v * world.z;
            design[(bottom, 11)] = -v;
        }

        let svd = design.try_svd(false, true, self.epsilon, self.iterations)?;
        let v_t = svd.v_t.as_ref()?;
        // Singular values come out descending, so the last row of V* spans
        // the null space.
        let p = v_t.row(11);
        let projection = Matrix3x4::from_row_slice(p.transpose().as_slice());

        self.decompose(projection)
    }

    /// Extracts a rigid pose from a projection matrix known up to scale.
    fn decompose(&self, projection: Matrix3x4<f64>) -> Option<WorldToCamera> {
        let m: Matrix3<f64> = projection.fixed_columns::<3>(0).into_owned();
        let determinant = m.determinant();
        if determinant == 0.0 || !determinant.is_finite() {
            return None;
        }
        let singular_values = m.svd(false, false).singular_values;
        let scale_magnitude = singular_values.iter().sum::<f64>() / 3.0;
        if scale_magnitude <= 0.0 {
            return None;
        }
        // The DLT null vector is only defined up to sign; a proper rotation
        // requires a positive determinant.
        let scale = determinant.signum() / scale_magnitude;

        let rotation = Rotation3::from_matrix(&(m * scale));
        let translation = projection.column(3) * scale;
        Some(WorldToCamera::from_parts(translation, rotation))
    }
}

impl Default for DltPnp {
    fn default() -> Self {
        Self {
            epsilon: 1e-12,
            iterations: 1000,
        }
    }
}

impl Estimator<FeatureWorldMatch> for DltPnp {
    type Model = WorldToCamera;
    type ModelIter = Option<WorldToCamera>;
    const MIN_SAMPLES: usize = 6;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureWorldMatch> + Clone,
    {
        self.from_matches(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vo_core::{
        nalgebra::{Point3, Vector3},
        sample_consensus::Model,
        NormalizedKeyPoint, WorldPoint,
    };

    fn synthetic_matches(pose: WorldToCamera) -> Vec<FeatureWorldMatch> {
        [
            (0.0, 0.0, 3.0),
            (1.0, 0.2, 2.5),
            (-0.7, 0.4, 4.0),
            (0.3, -0.8, 3.5),
            (-0.5, -0.4, 5.0),
            (0.8, 0.9, 2.2),
            (0.2, 0.5, 6.0),
            (-0.9, 0.7, 4.5),
        ]
        .iter()
        .map(|&(x, y, z)| {
            let world = WorldPoint::from_point(Point3::new(x, y, z));
            let observation =
                NormalizedKeyPoint::from_camera_point(pose.transform(world)).unwrap();
            FeatureWorldMatch(observation, world)
        })
        .collect()
    }

    #[test]
    fn recovers_a_known_pose() {
        let pose = WorldToCamera::from_parts(
            Vector3::new(-0.3, 0.2, 0.8),
            Rotation3::from_scaled_axis(Vector3::new(0.1, -0.2, 0.05)),
        );
        let matches = synthetic_matches(pose);
        let estimate = DltPnp::new().from_matches(matches.iter().copied()).unwrap();
        for data in &matches {
            assert!(estimate.residual(data) < 1e-8);
        }
        let translation_error = (estimate.isometry().translation.vector
            - pose.isometry().translation.vector)
            .norm();
        assert!(translation_error < 1e-7);
    }

    #[test]
    fn rejects_undersized_samples() {
        let pose = WorldToCamera::identity();
        let matches = synthetic_matches(pose);
        assert!(DltPnp::new()
            .from_matches(matches.iter().copied().take(5))
            .is_none());
    }
}
