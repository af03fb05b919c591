use vo_core::{
    nalgebra::{Matrix4x3, RowVector3, Vector4},
    NormalizedKeyPoint, Pose, Projective, Triangulation, TwoViewTriangulator, WorldPoint,
    WorldToCamera,
};

/// Two-view triangulation by iteratively reweighted linear least squares.
///
/// Each observation contributes two linear constraints on the world point;
/// the classic DLT solution minimizes an algebraic error that over-weights
/// distant points. This solver repeats the linear solve, dividing each
/// observation's constraints by the point depth from the previous iteration,
/// which turns the algebraic error into the reprojection error as the weights
/// converge (the iterative linear method of Hartley and Sturm's
/// ["Triangulation"](https://users.cecs.anu.edu.au/~hartley/Papers/triangulation/triangulation.pdf)).
///
/// The result reports whether the depth weights converged and whether the
/// point ended up in front of both cameras, so callers can filter with
/// strictness of their own choosing.
///
/// ```
/// use vo_core::{NormalizedKeyPoint, Pose, Projective, TwoViewTriangulator, WorldPoint, WorldToCamera};
/// use vo_core::nalgebra::{Point3, Rotation3, Vector3};
/// use vo_geom::IterativeLsTriangulator;
///
/// let point = WorldPoint::from_point(Point3::new(0.3, 0.1, 2.0));
/// let pose_a = WorldToCamera::identity();
/// let pose_b = WorldToCamera::from_parts(Vector3::new(-0.2, 0.0, 0.0), Rotation3::identity());
/// let a = NormalizedKeyPoint::from_camera_point(pose_a.transform(point)).unwrap();
/// let b = NormalizedKeyPoint::from_camera_point(pose_b.transform(point)).unwrap();
/// let triangulation = IterativeLsTriangulator::new()
///     .triangulate(pose_a, a, pose_b, b)
///     .unwrap();
/// assert!(triangulation.converged && triangulation.in_front);
/// let distance = (triangulation.point.point().unwrap() - point.point().unwrap()).norm();
/// assert!(distance < 1e-9);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
pub struct IterativeLsTriangulator {
    epsilon: f64,
    max_iterations: usize,
}

impl IterativeLsTriangulator {
    /// Creates an `IterativeLsTriangulator` with default values.
    ///
    /// Same as calling [`Default::default`].
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the depth-weight tolerance below which the solve is converged.
    ///
    /// Default is `1e-5`.
    #[must_use]
    pub fn epsilon(self, epsilon: f64) -> Self {
        Self { epsilon, ..self }
    }

    /// Set the maximum number of reweighting iterations.
    ///
    /// Default is `10`.
    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }
}

impl Default for IterativeLsTriangulator {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            max_iterations: 10,
        }
    }
}

impl TwoViewTriangulator for IterativeLsTriangulator {
    fn triangulate(
        &self,
        pose_a: WorldToCamera,
        a: NormalizedKeyPoint,
        pose_b: WorldToCamera,
        b: NormalizedKeyPoint,
    ) -> Option<Triangulation> {
        let proj_a = pose_a.projection();
        let proj_b = pose_b.projection();

        // Two constraints per observation: u * (P.row(2) . X) = P.row(0) . X
        // and likewise for v, split into the part acting on the point and the
        // constant column.
        let mut design = Matrix4x3::zeros();
        let mut rhs = Vector4::zeros();
        for (row, (projection, coordinate)) in [
            (proj_a, a.x),
            (proj_a, a.y),
            (proj_b, b.x),
            (proj_b, b.y),
        ]
        .iter()
        .enumerate()
        {
            let axis = if row % 2 == 0 { 0 } else { 1 };
            let constraint = projection.row(2) * *coordinate - projection.row(axis);
            design
                .row_mut(row)
                .copy_from(&RowVector3::new(constraint[0], constraint[1], constraint[2]));
            rhs[row] = -constraint[3];
        }

        let mut weights = [1.0f64, 1.0f64];
        let mut converged = false;
        let mut depths = [0.0f64, 0.0f64];
        let mut solution = Vector4::new(0.0, 0.0, 0.0, 1.0);
        for _ in 0..self.max_iterations {
            let mut weighted_design = design;
            let mut weighted_rhs = rhs;
            for row in 0..4 {
                let weight = weights[row / 2].recip();
                let mut design_row = weighted_design.row_mut(row);
                design_row *= weight;
                weighted_rhs[row] *= weight;
            }

            let svd = weighted_design.svd(true, true);
            let point = svd.solve(&weighted_rhs, 0.0).ok()?;
            solution = Vector4::new(point.x, point.y, point.z, 1.0);

            depths = [proj_a.row(2) * solution, proj_b.row(2) * solution].map(|d| d[0]);
            if (depths[0] - weights[0]).abs() <= self.epsilon
                && (depths[1] - weights[1]).abs() <= self.epsilon
            {
                converged = true;
                break;
            }
            // A vanishing depth would blow up the weights; report the last
            // solution unconverged instead.
            if depths[0].abs() < f64::EPSILON || depths[1].abs() < f64::EPSILON {
                break;
            }
            weights = depths;
        }

        let point = WorldPoint(solution);
        point.is_finite().then(|| Triangulation {
            point,
            converged,
            in_front: depths[0] > 0.0 && depths[1] > 0.0,
        })
    }
}
