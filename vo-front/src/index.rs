//! The correspondence index manager.
//!
//! Between two keyframes, every tracked point is named by a *canonical id*.
//! The id space is fixed at keyframe promotion and only shrinks in between as
//! tracks are lost; at the next promotion the whole space is rebased to a
//! dense `0..n` range anchored at the current frame. Three structures are
//! kept aligned over the ids: the partition into `triangulated` and
//! `pending`, the per-id link into the 3d map store, and the 2d positions of
//! each id at the last keyframe and in the current frame.

use std::collections::BTreeSet;

use vo_core::KeyPoint;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The link from a canonical id to the 3d map store.
///
/// An id in `pending` is always `Unset`; it becomes `Point` exactly when the
/// id moves into `triangulated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum MapLink {
    /// Not triangulated yet.
    Unset,
    /// Index of the point in the map store.
    Point(u32),
}

impl MapLink {
    pub fn point(self) -> Option<u32> {
        match self {
            MapLink::Unset => None,
            MapLink::Point(ix) => Some(ix),
        }
    }
}

/// A per-frame record of where every active canonical id was observed.
/// The pipeline keeps one of these per accepted frame since the last
/// keyframe and replays them when new points triangulate.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct TrackSnapshot {
    /// The frame the snapshot was taken on.
    pub frame: usize,
    /// Current 2d positions, parallel to `ids`.
    pub points: Vec<KeyPoint>,
    /// The active canonical ids at that frame, ascending.
    pub ids: Vec<u32>,
}

impl TrackSnapshot {
    /// The recorded position of a canonical id, if it was still tracked on
    /// this frame.
    pub fn position_of(&self, id: u32) -> Option<KeyPoint> {
        self.ids
            .binary_search(&id)
            .ok()
            .map(|row| self.points[row])
    }
}

/// The three co-indexed structures of the tracked point set.
///
/// Invariants, preserved by every operation and checked in debug builds:
///
/// * `ids` is strictly ascending and `current_points` is parallel to it;
/// * `triangulated` and `pending` are disjoint and their union is exactly
///   the ids in `ids`;
/// * `links[id]` is `Point` iff `id` is in `triangulated`;
/// * `base_points` and `links` span the full canonical domain fixed at the
///   last rebase, of which `ids` is the surviving subset.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct TrackTable {
    base_points: Vec<KeyPoint>,
    links: Vec<MapLink>,
    ids: Vec<u32>,
    current_points: Vec<KeyPoint>,
    triangulated: BTreeSet<u32>,
    pending: BTreeSet<u32>,
}

impl TrackTable {
    /// Creates the table for a bootstrap frame on which every point is
    /// already triangulated, with map links starting at `first_map_index`.
    pub fn from_bootstrap(points: Vec<KeyPoint>, first_map_index: u32) -> Self {
        let ids: Vec<u32> = (0..points.len() as u32).collect();
        let table = Self {
            links: ids.iter().map(|&i| MapLink::Point(first_map_index + i)).collect(),
            triangulated: ids.iter().copied().collect(),
            pending: BTreeSet::new(),
            base_points: points.clone(),
            current_points: points,
            ids,
        };
        table.debug_validate();
        table
    }

    /// The number of active canonical ids.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The active canonical ids, ascending.
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// Current-frame positions, parallel to [`ids`](Self::ids).
    pub fn current_points(&self) -> &[KeyPoint] {
        &self.current_points
    }

    /// The position an id had at the last keyframe.
    pub fn base_point(&self, id: u32) -> KeyPoint {
        self.base_points[id as usize]
    }

    /// The map link of an id.
    pub fn link(&self, id: u32) -> MapLink {
        self.links[id as usize]
    }

    pub fn triangulated(&self) -> &BTreeSet<u32> {
        &self.triangulated
    }

    pub fn pending(&self) -> &BTreeSet<u32> {
        &self.pending
    }

    /// The current position of an id, if it is still active.
    pub fn current_point_of(&self, id: u32) -> Option<KeyPoint> {
        self.row_of(id).map(|row| self.current_points[row])
    }

    fn row_of(&self, id: u32) -> Option<usize> {
        self.ids.binary_search(&id).ok()
    }

    /// Iterates `(id, current position, map index)` over the triangulated
    /// points, in ascending id order.
    pub fn triangulated_observations(
        &self,
    ) -> impl Iterator<Item = (u32, KeyPoint, u32)> + '_ {
        self.triangulated.iter().filter_map(move |&id| {
            let position = self.current_point_of(id)?;
            let map_index = self.links[id as usize].point()?;
            Some((id, position, map_index))
        })
    }

    /// Iterates `(id, base position, current position)` over the pending
    /// points, in ascending id order.
    pub fn pending_pairs(&self) -> impl Iterator<Item = (u32, KeyPoint, KeyPoint)> + '_ {
        self.pending.iter().filter_map(move |&id| {
            let current = self.current_point_of(id)?;
            Some((id, self.base_points[id as usize], current))
        })
    }

    /// Replaces the current positions of all active ids; `positions` must be
    /// parallel to [`ids`](Self::ids).
    pub fn set_current_points(&mut self, positions: Vec<KeyPoint>) {
        assert_eq!(positions.len(), self.ids.len());
        self.current_points = positions;
    }

    /// Intersects the active id set with `survivors`, compacting the current
    /// positions to the surviving ids. The canonical domain (base positions
    /// and links) is untouched; ids keep their names until the next rebase.
    pub fn prune(&mut self, survivors: &BTreeSet<u32>) {
        let mut current_points = Vec::with_capacity(survivors.len());
        let mut ids = Vec::with_capacity(survivors.len());
        for (row, &id) in self.ids.iter().enumerate() {
            if survivors.contains(&id) {
                ids.push(id);
                current_points.push(self.current_points[row]);
            }
        }
        self.ids = ids;
        self.current_points = current_points;
        self.triangulated = self.triangulated.intersection(survivors).copied().collect();
        self.pending = self.pending.intersection(survivors).copied().collect();
        self.debug_validate();
    }

    /// Moves the given pending ids into `triangulated`, linking each to its
    /// new map store index.
    pub fn extend(&mut self, newly_triangulated: &[(u32, u32)]) {
        for &(id, map_index) in newly_triangulated {
            let was_pending = self.pending.remove(&id);
            debug_assert!(was_pending, "id {} was not pending", id);
            self.triangulated.insert(id);
            self.links[id as usize] = MapLink::Point(map_index);
        }
        self.debug_validate();
    }

    /// Rebases the canonical id space onto the current frame: surviving ids
    /// are renumbered densely to `0..n` in order, the current positions
    /// become the new base positions, and `extra` freshly detected points
    /// are appended as pending ids with unset links.
    pub fn rebase(&mut self, extra: &[KeyPoint]) {
        // Ascending ids renumber to their rank, so the partition renumbers
        // by rank lookup.
        let renumber = |set: &BTreeSet<u32>, ids: &[u32]| -> BTreeSet<u32> {
            ids.iter()
                .enumerate()
                .filter(|&(_, id)| set.contains(id))
                .map(|(rank, _)| rank as u32)
                .collect()
        };
        self.triangulated = renumber(&self.triangulated, &self.ids);
        self.pending = renumber(&self.pending, &self.ids);
        self.links = self.ids.iter().map(|&id| self.links[id as usize]).collect();

        let survivors = self.ids.len() as u32;
        self.ids = (0..survivors + extra.len() as u32).collect();
        self.current_points.extend_from_slice(extra);
        self.base_points = self.current_points.clone();
        for id in survivors..survivors + extra.len() as u32 {
            self.pending.insert(id);
            self.links.push(MapLink::Unset);
        }
        self.debug_validate();
    }

    /// Panics if any cross-structure invariant is broken. Used by tests;
    /// the mutating operations run it in debug builds.
    pub fn validate(&self) {
        assert!(self.ids.windows(2).all(|w| w[0] < w[1]), "ids not ascending");
        assert_eq!(self.ids.len(), self.current_points.len());
        assert_eq!(self.base_points.len(), self.links.len());
        let active: BTreeSet<u32> = self.ids.iter().copied().collect();
        assert!(
            self.triangulated.is_disjoint(&self.pending),
            "partition overlaps"
        );
        let union: BTreeSet<u32> = self.triangulated.union(&self.pending).copied().collect();
        assert_eq!(union, active, "partition does not cover the active ids");
        for &id in &self.ids {
            let linked = matches!(self.links[id as usize], MapLink::Point(_));
            assert_eq!(
                linked,
                self.triangulated.contains(&id),
                "link/partition mismatch at id {}",
                id
            );
        }
    }

    fn debug_validate(&self) {
        #[cfg(debug_assertions)]
        self.validate();
    }
}
