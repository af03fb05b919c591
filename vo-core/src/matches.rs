use crate::{NormalizedKeyPoint, WorldPoint};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A pair of corresponding normalized keypoints from two frames.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct FeatureMatch(pub NormalizedKeyPoint, pub NormalizedKeyPoint);

/// A normalized keypoint observation matched to a known world point.
/// This is the datum consumed by the PnP sample-consensus process.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct FeatureWorldMatch(pub NormalizedKeyPoint, pub WorldPoint);
