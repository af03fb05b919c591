use vo_core::WorldPoint;

use crate::index::TrackTable;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A triangulated 3d point in the sparse map.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct MapPoint {
    /// World position.
    pub position: WorldPoint,
    /// Color sampled once, from the keyframe image that created the point.
    /// Never re-sampled afterwards, so tracking drift cannot discolor it.
    pub color: [u8; 3],
    /// The replenishment batch the originating keypoint was detected in.
    /// Diagnostics only; the geometry never reads it.
    pub group: u32,
}

/// The append-only store of triangulated points.
///
/// Indices handed out by [`push`](Self::push) are stable for the lifetime of
/// the run; the bundle-adjustment export and the correspondence links both
/// rely on that. Nothing is ever removed.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct MapStore {
    points: Vec<MapPoint>,
}

/// One exported map point with its liveness at export time.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct MapPointExport {
    pub position: WorldPoint,
    pub color: [u8; 3],
    pub group: u32,
    /// Whether some currently tracked point still observes this map point.
    pub active: bool,
}

impl MapStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Appends a point, returning its stable index.
    pub fn push(&mut self, point: MapPoint) -> u32 {
        self.points.push(point);
        (self.points.len() - 1) as u32
    }

    pub fn get(&self, index: u32) -> &MapPoint {
        &self.points[index as usize]
    }

    pub fn position(&self, index: u32) -> WorldPoint {
        self.points[index as usize].position
    }

    pub fn iter(&self) -> impl Iterator<Item = &MapPoint> {
        self.points.iter()
    }

    /// Snapshots the whole map for the trajectory/map writer, marking the
    /// points still observed by the active track set as live.
    pub fn export(&self, tracks: &TrackTable) -> Vec<MapPointExport> {
        let mut active = vec![false; self.points.len()];
        for (_, _, map_index) in tracks.triangulated_observations() {
            active[map_index as usize] = true;
        }
        self.points
            .iter()
            .zip(active)
            .map(|(point, active)| MapPointExport {
                position: point.position,
                color: point.color,
                group: point.group,
                active,
            })
            .collect()
    }
}
