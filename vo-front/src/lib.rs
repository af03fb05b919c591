//! # vo-front
//!
//! The front-end of a monocular visual-SLAM pipeline. Given a sequence of
//! camera images and known intrinsics, it incrementally estimates the 6-DoF
//! camera pose of every frame and grows a sparse 3d map, deciding along the
//! way which frames carry enough parallax to triangulate from.
//!
//! Per frame the pipeline runs: optical-flow tracking, track pruning, robust
//! PnP pose consensus, gradient pose refinement, the homography-conditioning
//! keyframe test, and (on keyframes) two-pass triangulation of the pending
//! points, keypoint replenishment, and index rebasing. Every stage can reject
//! the frame with a single named [`RejectionCause`], which rolls all
//! frame-scoped index state back to its pre-frame snapshot and continues from
//! the last good state.
//!
//! Everything stochastic (consensus sampling, homography sub-sampling) draws
//! from caller-seeded RNGs, so runs are reproducible.

pub mod ba;
pub mod detect;
mod error;
pub mod flow;
pub mod index;
pub mod interfaces;
pub mod map;
mod settings;

pub use error::*;
pub use settings::*;

use std::cell::RefCell;
use std::collections::BTreeSet;

use image::{GrayImage, RgbImage};
use itertools::Itertools;
use log::{debug, info};
use rand::{seq::SliceRandom, Rng};
use vo_core::{
    sample_consensus::{Consensus, Estimator},
    CameraModel, FeatureMatch, FeatureWorldMatch, KeyPoint, NormalizedKeyPoint, Pose,
    RadialDistortionCamera, TwoViewTriangulator, WorldPoint, WorldToCamera,
};
use vo_geom::{homography::DltHomography, homography::MIN_HOMOGRAPHY_MATCHES, refine_pose, DltPnp};

use ba::ObservationAccumulator;
use detect::CornerDetector;
use index::{TrackSnapshot, TrackTable};
use interfaces::{
    BootstrapProvider, ColorSampler, FrameReport, FrameStatus, PointTracker,
};
use map::{MapPoint, MapPointExport, MapStore};

/// The monotonically growing outputs of a run: the map store, the
/// bundle-adjustment measurements, and the per-frame pose history.
#[derive(Debug, Clone, Default)]
pub struct FrontendData {
    map: MapStore,
    observations: ObservationAccumulator,
    poses: Vec<Option<WorldToCamera>>,
    keyframes: Vec<usize>,
}

impl FrontendData {
    pub fn map(&self) -> &MapStore {
        &self.map
    }

    /// The accumulated bundle-adjustment measurements, for the external
    /// file writer.
    pub fn observations(&self) -> &ObservationAccumulator {
        &self.observations
    }

    /// One entry per processed frame; `None` marks a rejected frame.
    pub fn poses(&self) -> &[Option<WorldToCamera>] {
        &self.poses
    }

    /// The frame ordinals that were promoted to keyframes.
    pub fn keyframes(&self) -> &[usize] {
        &self.keyframes
    }
}

/// The per-keyframe tracking state; replaced wholesale at keyframe
/// promotions and rolled back wholesale on frame rejection.
struct TrackingState {
    tracks: TrackTable,
    history: Vec<TrackSnapshot>,
    /// The grayscale image of the last accepted frame, the flow source.
    previous_gray: GrayImage,
    /// The color image of the last keyframe; colors of newly triangulated
    /// points are sampled from it so optical-flow drift cannot shift them.
    base_image: RgbImage,
    keyframe_pose: WorldToCamera,
    current_pose: WorldToCamera,
    /// The replenishment batch id assigned to the next triangulated points.
    group: u32,
}

/// The front-end pipeline.
///
/// Generic over the collaborators it is wired with: the point tracker `F`,
/// the consensus process `C` and PnP estimator `PE` of the robust pose
/// stage, the two-view triangulator `T`, the color sampler `S`, and the
/// RNG `R` used for homography sub-sampling.
pub struct Frontend<F, C, PE, T, S, R> {
    /// Settings variables.
    pub settings: FrontendSettings,
    /// The camera intrinsics all pixel coordinates are normalized with.
    pub camera: RadialDistortionCamera,
    /// The growing outputs of the run.
    pub data: FrontendData,
    tracker: F,
    consensus: RefCell<C>,
    pose_estimator: PE,
    triangulator: T,
    sampler: S,
    rng: RefCell<R>,
    detector: CornerDetector,
    tracking: TrackingState,
}

impl<F, C, PE, T, S, R> Frontend<F, C, PE, T, S, R>
where
    F: PointTracker,
    C: Consensus<PE, FeatureWorldMatch>,
    PE: Estimator<FeatureWorldMatch, Model = WorldToCamera>,
    T: TwoViewTriangulator,
    S: ColorSampler,
    R: Rng,
{
    /// Bootstraps the pipeline on the first frame.
    ///
    /// The [`BootstrapProvider`] supplies a-priori 2d-3d correspondences
    /// (a calibration pattern or a reprojected known point cloud); the
    /// absolute pose is solved directly over all of them and the frame
    /// becomes the first keyframe. Failure here is fatal to the run, as
    /// there is no earlier state to fall back to.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: FrontendSettings,
        camera: RadialDistortionCamera,
        tracker: F,
        consensus: C,
        pose_estimator: PE,
        triangulator: T,
        sampler: S,
        rng: R,
        color: &RgbImage,
        gray: &GrayImage,
        bootstrap: &mut dyn BootstrapProvider,
    ) -> Result<Self, BootstrapFailure> {
        let matches = bootstrap.bootstrap(color, gray)?;
        info!("bootstrapping from {} a-priori correspondences", matches.len());
        if matches.len() < <DltPnp as Estimator<FeatureWorldMatch>>::MIN_SAMPLES {
            return Err(BootstrapFailure::new("too few bootstrap correspondences"));
        }

        let world_matches = matches
            .iter()
            .map(|m| FeatureWorldMatch(camera.calibrate(m.image), m.world))
            .collect_vec();
        let pose = DltPnp::new()
            .from_matches(world_matches.iter().copied())
            .ok_or_else(|| BootstrapFailure::new("bootstrap pose solve failed"))?;
        let pose = refine_pose(
            pose,
            &world_matches,
            settings.pose_refine_rate,
            settings.pose_refine_iterations,
        );

        let image_points = matches.iter().map(|m| m.image).collect_vec();
        let mut data = FrontendData::default();
        for (sampled, m) in sampler.sample(color, &image_points).into_iter().zip(&matches) {
            data.map.push(MapPoint {
                position: m.world,
                color: sampled,
                group: 0,
            });
        }
        let mut tracks = TrackTable::from_bootstrap(image_points.clone(), 0);
        data.observations.record_points_added(0..matches.len() as u32);
        let map_indices = (0..matches.len() as u32).collect_vec();
        data.observations.record_observation(&image_points, &map_indices, 0);
        data.poses.push(Some(pose));
        data.keyframes.push(0);

        // Top the bootstrap detections up to the target density before
        // tracking begins.
        let detector = CornerDetector::from_settings(&settings);
        let (width, height) = gray.dimensions();
        let need = settings
            .target_keypoints(width, height)
            .saturating_sub(tracks.len());
        let extra = detector.detect(gray, tracks.current_points(), need);
        info!(
            "bootstrap keyframe has {} points after replenishing {}",
            tracks.len() + extra.len(),
            extra.len()
        );
        tracks.rebase(&extra);

        let history = vec![TrackSnapshot {
            frame: 0,
            points: tracks.current_points().to_vec(),
            ids: tracks.ids().to_vec(),
        }];

        Ok(Self {
            settings,
            camera,
            data,
            tracker,
            consensus: RefCell::new(consensus),
            pose_estimator,
            triangulator,
            sampler,
            rng: RefCell::new(rng),
            detector,
            tracking: TrackingState {
                tracks,
                history,
                previous_gray: gray.clone(),
                base_image: color.clone(),
                keyframe_pose: pose,
                current_pose: pose,
                group: 1,
            },
        })
    }

    /// Processes the next frame of the sequence.
    ///
    /// Returns the frame's status; a rejected frame leaves every index
    /// structure exactly as it was before the call, except for the recorded
    /// absent pose and an empty measurement step.
    pub fn process_frame(&mut self, color: &RgbImage, gray: &GrayImage) -> FrameStatus {
        let frame = self.data.poses.len();
        self.data.observations.start_step();

        // Frame-scoped state is restored wholesale if any staged check
        // rejects the frame.
        let tracks_snapshot = self.tracking.tracks.clone();
        let history_length = self.tracking.history.len();
        let pose_before = self.tracking.current_pose;

        match self.attempt_frame(color, gray, frame) {
            Ok(keyframe) => {
                self.data.poses.push(Some(self.tracking.current_pose));
                self.tracking.previous_gray = gray.clone();
                if keyframe {
                    self.data.keyframes.push(frame);
                    FrameStatus::Keyframe
                } else {
                    FrameStatus::Tracked
                }
            }
            Err(cause) => {
                info!("frame {} rejected: {}", frame, cause);
                self.tracking.tracks = tracks_snapshot;
                self.tracking.history.truncate(history_length);
                self.tracking.current_pose = pose_before;
                self.data.poses.push(None);
                FrameStatus::Rejected(cause)
            }
        }
    }

    /// The full decision chain of one frame. Mutates the tracking state
    /// freely; the caller restores the snapshot on `Err`.
    fn attempt_frame(
        &mut self,
        color: &RgbImage,
        gray: &GrayImage,
        frame: usize,
    ) -> Result<bool, RejectionCause> {
        // Advance every tracked point with optical flow and drop failures.
        let results = self.tracker.track(
            &self.tracking.previous_gray,
            gray,
            self.tracking.tracks.current_points(),
        );
        let before = results.len();
        let mut survivors = BTreeSet::new();
        let mut positions = Vec::with_capacity(before);
        for (row, result) in results.iter().enumerate() {
            if result.valid && result.error < self.settings.max_flow_error {
                survivors.insert(self.tracking.tracks.ids()[row]);
                positions.push(result.position);
            }
        }
        let lost_ratio = if before == 0 {
            1.0
        } else {
            (before - positions.len()) as f64 / before as f64
        };
        info!(
            "optical flow lost {} of {} points (ratio {:.3})",
            before - positions.len(),
            before,
            lost_ratio
        );
        if lost_ratio > self.settings.max_lost_tracks_ratio {
            return Err(RejectionCause::TrackingFailure);
        }
        self.tracking.tracks.prune(&survivors);
        self.tracking.tracks.set_current_points(positions);

        // The pose solve needs enough already-triangulated survivors.
        let minimum = self.settings.min_pose_correspondences;
        if self.tracking.tracks.triangulated().len() < minimum {
            info!(
                "only {} triangulated points survived tracking, need {}",
                self.tracking.tracks.triangulated().len(),
                minimum
            );
            return Err(RejectionCause::InsufficientCorrespondences);
        }

        // Robust stage: consensus over the PnP estimator.
        let (ids, matches) = self.triangulated_matches();
        info!("estimating pose on {} correspondences", matches.len());
        let (robust_pose, inliers) = self
            .consensus
            .borrow_mut()
            .model_inliers(&self.pose_estimator, matches.iter().copied())
            .ok_or(RejectionCause::NoPoseSolution)?;
        let inliers = inliers.into_iter().collect_vec();
        let outlier_ratio = 1.0 - inliers.len() as f64 / matches.len() as f64;
        info!(
            "pose consensus kept {} of {} correspondences (outlier ratio {:.3})",
            inliers.len(),
            matches.len(),
            outlier_ratio
        );
        if outlier_ratio > self.settings.max_pose_outlier_ratio || inliers.len() < minimum {
            return Err(RejectionCause::ExcessiveOutliers);
        }

        // The inlier set becomes the new active domain for triangulated
        // points; pending points always survive this stage.
        let inlier_matches = inliers.iter().map(|&ix| matches[ix]).collect_vec();
        let mut keep: BTreeSet<u32> = self.tracking.tracks.pending().clone();
        keep.extend(inliers.iter().map(|&ix| ids[ix]));
        self.tracking.tracks.prune(&keep);

        // Refinement stage: warm-started polish on the inliers only.
        let refined = refine_pose(
            robust_pose,
            &inlier_matches,
            self.settings.pose_refine_rate,
            self.settings.pose_refine_iterations,
        );
        let mean_error = self.mean_pixel_reprojection_error(refined);
        info!("refined pose mean reprojection error {:.3} px", mean_error);
        if mean_error > self.settings.max_reprojection_error {
            return Err(RejectionCause::ExcessiveReprojectionError);
        }
        self.tracking.current_pose = refined;

        // The frame is accepted from here on: record it into the tracking
        // history and the measurement step.
        self.push_history_snapshot(frame);
        let (observed_points, observed_indices): (Vec<KeyPoint>, Vec<u32>) = self
            .tracking
            .tracks
            .triangulated_observations()
            .map(|(_, position, map_index)| (position, map_index))
            .unzip();
        self.data
            .observations
            .record_observation(&observed_points, &observed_indices, frame);

        let keyframe = self.keyframe_test();
        debug!("keyframe test: {}", keyframe);
        if keyframe {
            self.promote_keyframe(color, gray, frame);
        }
        Ok(keyframe)
    }

    /// The parallax test deciding keyframe promotion.
    ///
    /// A planar homography is fitted between the keyframe-base positions and
    /// the current positions of the surviving points (sub-sampled for
    /// performance). A well-conditioned fit means the motion is explained by
    /// a plane or pure rotation, so the frame is *not* worth triangulating
    /// from; the frame is promoted when the condition ratio of the fit
    /// exceeds the threshold.
    fn keyframe_test(&self) -> bool {
        let tracks = &self.tracking.tracks;
        if tracks.len() < MIN_HOMOGRAPHY_MATCHES {
            debug!("too few points for the keyframe test; not a keyframe");
            return false;
        }
        let pairs = tracks
            .ids()
            .iter()
            .zip(tracks.current_points())
            .map(|(&id, &current)| {
                FeatureMatch(
                    self.camera.calibrate(tracks.base_point(id)),
                    self.camera.calibrate(current),
                )
            })
            .collect_vec();
        let sampled = pairs
            .choose_multiple(
                &mut *self.rng.borrow_mut(),
                self.settings.max_homography_points,
            )
            .copied()
            .collect_vec();
        match DltHomography::new().from_matches(sampled.iter().copied()) {
            Some(homography) => {
                let ratio = homography.condition_ratio();
                debug!(
                    "homography condition ratio {:.4} (threshold {})",
                    ratio, self.settings.homography_condition_threshold
                );
                ratio > self.settings.homography_condition_threshold
            }
            None => {
                debug!("homography fit degenerated; not a keyframe");
                false
            }
        }
    }

    /// Everything that happens when a frame becomes the new keyframe:
    /// two-pass triangulation of the pending points, a second pose
    /// refinement, history replay into the measurement accumulator,
    /// keypoint replenishment, and the index rebase.
    fn promote_keyframe(&mut self, color: &RgbImage, gray: &GrayImage, frame: usize) {
        info!("frame {} promoted to keyframe", frame);
        let keyframe_pose = self.tracking.keyframe_pose;
        let pending = self.tracking.tracks.pending_pairs().collect_vec();

        if !pending.is_empty() {
            // First pass: triangulate every pending point between the last
            // keyframe and this frame, keeping only converged solves in
            // front of both cameras. These feed the pose refinement, so the
            // filter is strict.
            let mut pose = self.tracking.current_pose;
            struct Candidate {
                id: u32,
                base: KeyPoint,
                base_normalized: NormalizedKeyPoint,
                current_normalized: NormalizedKeyPoint,
                point: WorldPoint,
            }
            let mut candidates = Vec::with_capacity(pending.len());
            for &(id, base, current) in &pending {
                let base_normalized = self.camera.calibrate(base);
                let current_normalized = self.camera.calibrate(current);
                if let Some(triangulation) = self.triangulator.triangulate(
                    keyframe_pose,
                    base_normalized,
                    pose,
                    current_normalized,
                ) {
                    if triangulation.is_reliable() {
                        candidates.push(Candidate {
                            id,
                            base,
                            base_normalized,
                            current_normalized,
                            point: triangulation.point,
                        });
                    }
                }
            }
            info!(
                "first triangulation pass kept {} of {} pending points",
                candidates.len(),
                pending.len()
            );

            // Refine the pose once more on the union of the pose inliers
            // and the freshly triangulated points.
            let (_, mut union) = self.triangulated_matches();
            union.extend(
                candidates
                    .iter()
                    .map(|c| FeatureWorldMatch(c.current_normalized, c.point)),
            );
            pose = refine_pose(
                pose,
                &union,
                self.settings.pose_refine_rate,
                self.settings.pose_refine_iterations,
            );
            self.tracking.current_pose = pose;

            // Second pass: re-triangulate the same survivors under the
            // refined pose. Only cheirality is required here; accepting
            // unconverged solves keeps the map denser.
            let mut accepted = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                if let Some(triangulation) = self.triangulator.triangulate(
                    keyframe_pose,
                    candidate.base_normalized,
                    pose,
                    candidate.current_normalized,
                ) {
                    if triangulation.in_front {
                        accepted.push((candidate.id, candidate.base, triangulation.point));
                    }
                }
            }
            info!("second triangulation pass accepted {} points", accepted.len());

            // New map points take their color from the keyframe image that
            // first saw them and the current replenishment group.
            let base_positions = accepted.iter().map(|&(_, base, _)| base).collect_vec();
            let colors = self
                .sampler
                .sample(&self.tracking.base_image, &base_positions);
            let group = self.tracking.group;
            let links = accepted
                .iter()
                .zip(colors)
                .map(|(&(id, _, point), color)| {
                    let map_index = self.data.map.push(MapPoint {
                        position: point,
                        color,
                        group,
                    });
                    (id, map_index)
                })
                .collect_vec();

            // Pending points that failed triangulation are dropped; the
            // accepted ones move into the triangulated partition.
            let mut survivors = self.tracking.tracks.triangulated().clone();
            survivors.extend(links.iter().map(|&(id, _)| id));
            self.tracking.tracks.prune(&survivors);
            self.tracking.tracks.extend(&links);

            self.data
                .observations
                .record_points_added(links.iter().map(|&(_, map_index)| map_index));

            // The snapshot taken earlier this frame predates the pruning
            // above; replace it so the history ends in the promoted state.
            self.replace_last_history_snapshot(frame);

            // Replay the tracking history so every intermediate frame that
            // saw a newly triangulated point contributes an observation.
            for snapshot in &self.tracking.history {
                let (points, indices): (Vec<KeyPoint>, Vec<u32>) = links
                    .iter()
                    .filter_map(|&(id, map_index)| {
                        snapshot.position_of(id).map(|position| (position, map_index))
                    })
                    .unzip();
                if !points.is_empty() {
                    self.data
                        .observations
                        .record_observation(&points, &indices, snapshot.frame);
                }
            }
        }

        // Replenish coverage with fresh detections; a new batch opens a new
        // point group.
        let (width, height) = gray.dimensions();
        let need = self
            .settings
            .target_keypoints(width, height)
            .saturating_sub(self.tracking.tracks.len());
        let extra = self
            .detector
            .detect(gray, self.tracking.tracks.current_points(), need);
        info!("replenished {} of {} needed keypoints", extra.len(), need);
        if !extra.is_empty() {
            self.tracking.group += 1;
        }

        // The odometry edge spans from the previous keyframe to this one.
        let from_frame = self
            .tracking
            .history
            .first()
            .map(|snapshot| snapshot.frame)
            .unwrap_or(frame);
        self.data.observations.record_odometry(
            keyframe_pose.relative_to(self.tracking.current_pose),
            from_frame,
            frame,
        );

        // Rebase the canonical id space onto this frame and restart the
        // history from it.
        self.tracking.tracks.rebase(&extra);
        self.tracking.history.clear();
        self.push_history_snapshot(frame);
        self.tracking.keyframe_pose = self.tracking.current_pose;
        self.tracking.base_image = color.clone();
    }

    /// The `(canonical id, match)` pairs of all triangulated points in the
    /// current frame, for the consensus and refinement stages.
    fn triangulated_matches(&self) -> (Vec<u32>, Vec<FeatureWorldMatch>) {
        self.tracking
            .tracks
            .triangulated_observations()
            .map(|(id, position, map_index)| {
                (
                    id,
                    FeatureWorldMatch(
                        self.camera.calibrate(position),
                        self.data.map.position(map_index),
                    ),
                )
            })
            .unzip()
    }

    /// Mean pixel-space reprojection error of the triangulated points under
    /// `pose`. Points that project behind the camera count as infinite.
    fn mean_pixel_reprojection_error(&self, pose: WorldToCamera) -> f64 {
        let mut total = 0.0;
        let mut count = 0usize;
        for (_, position, map_index) in self.tracking.tracks.triangulated_observations() {
            let projected = pose.transform(self.data.map.position(map_index));
            total += match NormalizedKeyPoint::from_camera_point(projected) {
                Some(normalized) => (self.camera.uncalibrate(normalized).0 - position.0).norm(),
                None => f64::INFINITY,
            };
            count += 1;
        }
        if count == 0 {
            f64::INFINITY
        } else {
            total / count as f64
        }
    }

    fn push_history_snapshot(&mut self, frame: usize) {
        self.tracking.history.push(TrackSnapshot {
            frame,
            points: self.tracking.tracks.current_points().to_vec(),
            ids: self.tracking.tracks.ids().to_vec(),
        });
    }

    fn replace_last_history_snapshot(&mut self, frame: usize) {
        self.tracking.history.pop();
        self.push_history_snapshot(frame);
    }

    /// The view of the current state handed to a [`interfaces::FrameObserver`]
    /// after a frame decision.
    pub fn frame_report(&self, status: FrameStatus) -> FrameReport<'_> {
        FrameReport {
            frame: self.data.poses.len().saturating_sub(1),
            status,
            pose: self.data.poses.last().copied().flatten(),
            tracks: &self.tracking.tracks,
            map: &self.data.map,
        }
    }

    /// Snapshots the map with per-point liveness for the trajectory/map
    /// writer; valid at any frame boundary.
    pub fn export_map(&self) -> Vec<MapPointExport> {
        self.data.map.export(&self.tracking.tracks)
    }

    /// The track table of the current interval, for rendering.
    pub fn tracks(&self) -> &TrackTable {
        &self.tracking.tracks
    }
}
