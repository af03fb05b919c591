use crate::{NormalizedKeyPoint, WorldPoint, WorldToCamera};

/// The outcome of triangulating one point from two observations.
///
/// The two flags are reported separately because the pipeline filters on
/// different predicates in its two triangulation passes: the first pass
/// requires a converged solve in front of both cameras, the second accepts
/// any point in front of both cameras.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Triangulation {
    /// The triangulated point in world coordinates.
    pub point: WorldPoint,
    /// Whether the iterative solve reached its convergence tolerance.
    pub converged: bool,
    /// Whether the point lies strictly in front of both cameras.
    pub in_front: bool,
}

impl Triangulation {
    /// Whether the solve converged onto a point in front of both cameras.
    pub fn is_reliable(&self) -> bool {
        self.converged && self.in_front
    }
}

/// This trait is for algorithms which triangulate a point from two posed
/// observations in normalized image coordinates.
pub trait TwoViewTriangulator {
    /// Triangulates a single point seen at `a` by the camera posed at
    /// `pose_a` and at `b` by the camera posed at `pose_b`.
    ///
    /// Returns `None` only when the solve degenerates numerically; points
    /// behind a camera or unconverged solves are returned with their status
    /// flags cleared so the caller can choose its own filter.
    fn triangulate(
        &self,
        pose_a: WorldToCamera,
        a: NormalizedKeyPoint,
        pose_b: WorldToCamera,
        b: NormalizedKeyPoint,
    ) -> Option<Triangulation>;
}
