use core::{
    iter::Sum,
    ops::{Add, AddAssign},
};
use nalgebra::{IsometryMatrix3, Rotation3, Vector3};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Contains a small gradient translation and rotation that will be appended to
/// the reference frame of some pose.
///
/// This is a member of the lie algebra se(3). Pose refinement accumulates one
/// of these per observation and applies the scaled sum to the pose.
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Se3TangentSpace {
    pub translation: Vector3<f64>,
    pub rotation: Vector3<f64>,
}

impl Se3TangentSpace {
    #[inline(always)]
    pub fn new(mut translation: Vector3<f64>, mut rotation: Vector3<f64>) -> Self {
        // A NaN gradient contributes nothing rather than poisoning the sum.
        if translation.iter().any(|n| n.is_nan()) {
            translation = Vector3::zeros();
        }
        if rotation.iter().any(|n| n.is_nan()) {
            rotation = Vector3::zeros();
        }
        Self {
            translation,
            rotation,
        }
    }

    #[inline(always)]
    pub fn identity() -> Self {
        Self {
            translation: Vector3::zeros(),
            rotation: Vector3::zeros(),
        }
    }

    /// Gets the isometry that represents this tangent space transformation.
    #[must_use]
    #[inline(always)]
    pub fn isometry(self) -> IsometryMatrix3<f64> {
        let rotation = Rotation3::from_scaled_axis(self.rotation);
        IsometryMatrix3::from_parts((rotation * self.translation).into(), rotation)
    }

    /// Scales both the rotation and the translation.
    #[must_use]
    #[inline(always)]
    pub fn scale(mut self, scale: f64) -> Self {
        self.translation *= scale;
        self.rotation *= scale;
        self
    }
}

impl Add for Se3TangentSpace {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            translation: self.translation + rhs.translation,
            rotation: self.rotation + rhs.rotation,
        }
    }
}

impl AddAssign for Se3TangentSpace {
    fn add_assign(&mut self, rhs: Self) {
        self.translation += rhs.translation;
        self.rotation += rhs.rotation;
    }
}

impl Sum for Se3TangentSpace {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Se3TangentSpace::identity(), |a, b| a + b)
    }
}
