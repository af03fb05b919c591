//! Accumulation of bundle-adjustment measurements.
//!
//! The front-end never optimizes globally; it records everything an offline
//! bundle adjuster needs and hands the structures to an external writer. Data
//! is partitioned into *steps*, one per processed frame (rejected frames get
//! an empty step), and is append-only: once a later step starts, no earlier
//! step is rewritten. The single exception is that observations for *earlier
//! frames* may still be recorded into the *current* step; that is how the
//! tracking history replays observations of freshly triangulated points
//! across the frames between two keyframes.

use vo_core::{CameraToCamera, KeyPoint};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A relative-pose measurement between two keyframes.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct OdometryEdge {
    /// Takes camera points of the `from` keyframe into the `to` keyframe.
    pub relative: CameraToCamera,
    pub from_frame: usize,
    pub to_frame: usize,
}

/// One 2d observation of a 3d map point.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ObservationEdge {
    /// The frame the observation was made on.
    pub frame: usize,
    /// The slot of the 2d detection within that frame's detection list.
    pub slot: u32,
    /// The map store index of the observed 3d point.
    pub point: u32,
}

/// The measurements recorded during one step.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct StepRecord {
    pub odometry: Vec<OdometryEdge>,
    pub observations: Vec<ObservationEdge>,
    /// Map store indices created during this step.
    pub points_added: Vec<u32>,
}

/// Step-partitioned, append-only bundle-adjustment measurements.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ObservationAccumulator {
    steps: Vec<StepRecord>,
    /// Per-frame 2d detections; [`ObservationEdge::slot`] indexes into these.
    detections: Vec<Vec<KeyPoint>>,
    /// Per map point, every `(frame, slot)` that observed it.
    lookback: Vec<Vec<(usize, u32)>>,
}

impl Default for ObservationAccumulator {
    fn default() -> Self {
        // The bootstrap frame records into step 0 without an explicit
        // start_step call.
        Self {
            steps: vec![StepRecord::default()],
            detections: Vec::new(),
            lookback: Vec::new(),
        }
    }
}

impl ObservationAccumulator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Opens the accumulation bucket for the next frame.
    pub fn start_step(&mut self) {
        self.steps.push(StepRecord::default());
    }

    /// The index of the step currently accumulating.
    pub fn current_step(&self) -> usize {
        self.steps.len() - 1
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// The 2d detections recorded for a frame so far.
    pub fn detections(&self, frame: usize) -> &[KeyPoint] {
        self.detections
            .get(frame)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every `(frame, slot)` observation of a map point, across all steps.
    pub fn observations_of_point(&self, point: u32) -> &[(usize, u32)] {
        self.lookback
            .get(point as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Appends 2d detections and their 3d associations for `frame` into the
    /// current step, back-linking each 3d point to the new observation.
    /// `frame` may be earlier than the current step when the tracking
    /// history is being replayed.
    pub fn record_observation(&mut self, points: &[KeyPoint], map_indices: &[u32], frame: usize) {
        debug_assert_eq!(points.len(), map_indices.len());
        if self.detections.len() <= frame {
            self.detections.resize(frame + 1, Vec::new());
        }
        let step = self.current_step();
        for (&point, &map_index) in points.iter().zip(map_indices) {
            let slot = self.detections[frame].len() as u32;
            self.detections[frame].push(point);
            self.steps[step].observations.push(ObservationEdge {
                frame,
                slot,
                point: map_index,
            });
            if self.lookback.len() <= map_index as usize {
                self.lookback.resize(map_index as usize + 1, Vec::new());
            }
            self.lookback[map_index as usize].push((frame, slot));
        }
    }

    /// Tags the map store indices created during this step.
    pub fn record_points_added(&mut self, map_indices: impl IntoIterator<Item = u32>) {
        let step = self.current_step();
        for map_index in map_indices {
            if self.lookback.len() <= map_index as usize {
                self.lookback.resize(map_index as usize + 1, Vec::new());
            }
            self.steps[step].points_added.push(map_index);
        }
    }

    /// Logs a keyframe-to-keyframe relative transform into the current step.
    pub fn record_odometry(&mut self, relative: CameraToCamera, from_frame: usize, to_frame: usize) {
        let step = self.current_step();
        self.steps[step].odometry.push(OdometryEdge {
            relative,
            from_frame,
            to_frame,
        });
    }
}
