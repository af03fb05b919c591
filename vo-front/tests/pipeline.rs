//! End-to-end pipeline scenarios on synthetic geometry.
//!
//! The pipeline is driven by a scripted tracker that reports the exact
//! projections of a known 3d world under known ground-truth poses, which
//! makes every stage's outcome checkable: recovered poses against ground
//! truth, triangulated points against the world, the partition and rollback
//! invariants against the index manager's contract.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::rc::Rc;

use arrsac::Arrsac;
use image::{GrayImage, RgbImage};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use vo_core::{
    nalgebra::{Point2, Point3, Rotation3, Vector3},
    sample_consensus::Estimator,
    CameraIntrinsics, CameraModel, FeatureWorldMatch, KeyPoint, Pose, Projective,
    RadialDistortionCamera, WorldPoint, WorldToCamera,
};
use vo_geom::{DltPnp, IterativeLsTriangulator};
use vo_front::{
    interfaces::{
        BootstrapMatch, BootstrapProvider, FrameStatus, NearestPixelSampler, PointTracker,
        TrackedPoint,
    },
    BootstrapFailure, Frontend, FrontendSettings, RejectionCause,
};

fn init_logger() {
    let _ = pretty_env_logger::try_init();
}

fn camera() -> RadialDistortionCamera {
    RadialDistortionCamera::new(
        CameraIntrinsics::identity()
            .focal(500.0)
            .principal_point(Point2::new(320.0, 240.0)),
        0.0,
        0.0,
    )
}

/// Projects a world point to exact pixel coordinates under a pose, if it is
/// in front of the camera and inside the image.
fn project(pose: WorldToCamera, world: WorldPoint) -> Option<KeyPoint> {
    let camera_point = pose.transform(world);
    let point = camera_point.point()?;
    if point.z <= 0.0 {
        return None;
    }
    let pixel = camera().uncalibrate(vo_core::NormalizedKeyPoint::new(
        point.x / point.z,
        point.y / point.z,
    ));
    (pixel.x >= 0.0 && pixel.y >= 0.0 && pixel.x < 640.0 && pixel.y < 480.0).then(|| pixel)
}

/// Backprojects an exact pixel at a given depth under the identity pose.
fn backproject(u: f64, v: f64, depth: f64) -> WorldPoint {
    let normalized = camera().calibrate(KeyPoint::new(u, v));
    WorldPoint::from_point(Point3::new(
        normalized.x * depth,
        normalized.y * depth,
        depth,
    ))
}

/// A tracker that knows the whole synthetic world: each query point is
/// matched (within a pixel tolerance) against the projections recorded for
/// any earlier frame, and tracked to its exact projection in the target
/// frame. One `track` call advances one frame, exactly like the pipeline
/// drives a real tracker.
struct ScriptedTracker {
    /// `projections[frame][world_index]`
    projections: Vec<Vec<Option<KeyPoint>>>,
    call: Cell<usize>,
    tolerance: f64,
}

impl ScriptedTracker {
    fn new(projections: Vec<Vec<Option<KeyPoint>>>) -> Self {
        Self {
            projections,
            call: Cell::new(0),
            tolerance: 3.0,
        }
    }

    fn lost() -> TrackedPoint {
        TrackedPoint {
            position: KeyPoint::new(0.0, 0.0),
            valid: false,
            error: f64::INFINITY,
        }
    }
}

impl PointTracker for ScriptedTracker {
    fn track(
        &self,
        _previous: &GrayImage,
        _next: &GrayImage,
        points: &[KeyPoint],
    ) -> Vec<TrackedPoint> {
        let target = self.call.get() + 1;
        self.call.set(target);
        points
            .iter()
            .map(|query| {
                let mut best: Option<(f64, usize)> = None;
                for frame in self.projections[..target].iter() {
                    for (world_index, projection) in frame.iter().enumerate() {
                        if let Some(projection) = projection {
                            let distance = (projection.0 - query.0).norm();
                            if distance < self.tolerance
                                && best.map(|(d, _)| distance < d).unwrap_or(true)
                            {
                                best = Some((distance, world_index));
                            }
                        }
                    }
                }
                match best.and_then(|(_, world_index)| self.projections[target][world_index]) {
                    Some(position) => TrackedPoint {
                        position,
                        valid: true,
                        error: 0.0,
                    },
                    None => Self::lost(),
                }
            })
            .collect()
    }
}

/// Wraps a tracker and invalidates a fraction of the points on one chosen
/// call, to force a `TrackingFailure` rejection.
struct LossyTracker<F> {
    inner: F,
    fail_on_call: usize,
    keep: usize,
    call: Cell<usize>,
}

impl<F: PointTracker> PointTracker for LossyTracker<F> {
    fn track(
        &self,
        previous: &GrayImage,
        next: &GrayImage,
        points: &[KeyPoint],
    ) -> Vec<TrackedPoint> {
        let call = self.call.get() + 1;
        self.call.set(call);
        let mut results = self.inner.track(previous, next, points);
        if call == self.fail_on_call {
            for result in results.iter_mut().skip(self.keep) {
                result.valid = false;
                result.error = f64::INFINITY;
            }
        }
        results
    }
}

/// Counts how many times the consensus process actually invoked the
/// estimator.
#[derive(Clone)]
struct CountingEstimator {
    inner: DltPnp,
    calls: Rc<Cell<usize>>,
}

impl Estimator<FeatureWorldMatch> for CountingEstimator {
    type Model = WorldToCamera;
    type ModelIter = Option<WorldToCamera>;
    const MIN_SAMPLES: usize = 6;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = FeatureWorldMatch> + Clone,
    {
        self.calls.set(self.calls.get() + 1);
        self.inner.estimate(data)
    }
}

/// Hands the pipeline a fixed set of first-frame correspondences.
struct FixedBootstrap(Vec<BootstrapMatch>);

impl BootstrapProvider for FixedBootstrap {
    fn bootstrap(
        &mut self,
        _color: &RgbImage,
        _gray: &GrayImage,
    ) -> Result<Vec<BootstrapMatch>, BootstrapFailure> {
        if self.0.is_empty() {
            Err(BootstrapFailure::new("pattern not found"))
        } else {
            Ok(self.0.clone())
        }
    }
}

fn blank_color() -> RgbImage {
    RgbImage::new(640, 480)
}

fn blank_gray() -> GrayImage {
    GrayImage::new(640, 480)
}

/// A 5x5 grid of world points with varying depths, all visible from the
/// identity pose.
fn bootstrap_world() -> Vec<WorldPoint> {
    let mut points = Vec::new();
    for (i, &u) in [80.0, 180.0, 280.0, 380.0, 480.0].iter().enumerate() {
        for (j, &v) in [80.0, 140.0, 200.0, 260.0, 320.0].iter().enumerate() {
            let depth = 4.0 + ((i * 5 + j) * 37 % 17) as f64 / 4.0;
            points.push(backproject(u, v, depth));
        }
    }
    points
}

fn bootstrap_matches(world: &[WorldPoint]) -> Vec<BootstrapMatch> {
    world
        .iter()
        .map(|&point| BootstrapMatch {
            image: project(WorldToCamera::identity(), point).unwrap(),
            world: point,
        })
        .collect()
}

fn projections_for(world: &[WorldPoint], poses: &[WorldToCamera]) -> Vec<Vec<Option<KeyPoint>>> {
    poses
        .iter()
        .map(|&pose| world.iter().map(|&point| project(pose, point)).collect())
        .collect()
}

type TestFrontend<F, PE> = Frontend<
    F,
    Arrsac<Xoshiro256PlusPlus>,
    PE,
    IterativeLsTriangulator,
    NearestPixelSampler,
    Xoshiro256PlusPlus,
>;

fn build<F: PointTracker, PE>(
    settings: FrontendSettings,
    tracker: F,
    estimator: PE,
    matches: Vec<BootstrapMatch>,
    color: &RgbImage,
    gray: &GrayImage,
) -> TestFrontend<F, PE>
where
    PE: Estimator<FeatureWorldMatch, Model = WorldToCamera>,
{
    Frontend::new(
        settings,
        camera(),
        tracker,
        Arrsac::new(
            settings.pose_consensus_threshold,
            Xoshiro256PlusPlus::seed_from_u64(5),
        ),
        estimator,
        IterativeLsTriangulator::new(),
        NearestPixelSampler,
        Xoshiro256PlusPlus::seed_from_u64(5),
        color,
        gray,
        &mut FixedBootstrap(matches),
    )
    .expect("bootstrap must succeed")
}

fn translation_pose(x: f64, y: f64, z: f64) -> WorldToCamera {
    WorldToCamera::from_parts(Vector3::new(x, y, z), Rotation3::identity())
}

#[test]
fn noiseless_sequence_recovers_ground_truth_poses() {
    init_logger();
    let world = bootstrap_world();
    let poses = vec![
        WorldToCamera::identity(),
        translation_pose(-0.15, 0.0, 0.0),
        translation_pose(-0.3, 0.05, 0.0),
        translation_pose(-0.45, 0.05, -0.1),
    ];
    let mut settings = FrontendSettings::default();
    settings.max_keypoints = world.len(); // no replenishment in this scenario
    settings.homography_condition_threshold = 1.0001;
    let tracker = ScriptedTracker::new(projections_for(&world, &poses));
    let mut frontend = build(
        settings,
        tracker,
        DltPnp::new(),
        bootstrap_matches(&world),
        &blank_color(),
        &blank_gray(),
    );

    for _ in 1..poses.len() {
        let status = frontend.process_frame(&blank_color(), &blank_gray());
        assert!(status.is_accepted(), "frame rejected: {:?}", status);
    }

    assert_eq!(frontend.data.poses().len(), poses.len());
    for (recovered, truth) in frontend.data.poses().iter().zip(&poses) {
        let recovered = recovered.expect("all frames accepted");
        let translation_error = (recovered.isometry().translation.vector
            - truth.isometry().translation.vector)
            .norm();
        let rotation_error = recovered
            .isometry()
            .rotation
            .angle_to(&truth.isometry().rotation);
        assert!(
            translation_error < 1e-6 && rotation_error < 1e-6,
            "pose off by {} / {}",
            translation_error,
            rotation_error
        );
    }
    // No points were ever lost or added; the whole bootstrap set stays live.
    assert_eq!(frontend.data.map().len(), world.len());
    assert!(frontend.export_map().iter().all(|point| point.active));
    frontend.tracks().validate();
}

#[test]
fn pure_rotation_is_not_a_keyframe() {
    init_logger();
    let world = bootstrap_world();
    let poses = vec![
        WorldToCamera::identity(),
        WorldToCamera::from_parts(
            Vector3::zeros(),
            Rotation3::from_scaled_axis(Vector3::new(0.0, 0.02, 0.005)),
        ),
    ];
    let mut settings = FrontendSettings::default();
    settings.max_keypoints = world.len();
    let tracker = ScriptedTracker::new(projections_for(&world, &poses));
    let mut frontend = build(
        settings,
        tracker,
        DltPnp::new(),
        bootstrap_matches(&world),
        &blank_color(),
        &blank_gray(),
    );

    let status = frontend.process_frame(&blank_color(), &blank_gray());
    assert_eq!(status, FrameStatus::Tracked);
    assert_eq!(frontend.data.keyframes(), &[0]);
}

#[test]
fn excessive_track_loss_rejects_the_frame_and_rolls_back() {
    init_logger();
    let world = bootstrap_world();
    let poses = vec![WorldToCamera::identity(), translation_pose(-0.15, 0.0, 0.0)];
    let mut settings = FrontendSettings::default();
    settings.max_keypoints = world.len();
    let tracker = LossyTracker {
        inner: ScriptedTracker::new(projections_for(&world, &poses)),
        fail_on_call: 1,
        keep: 2, // 23 of 25 lost: ratio 0.92 > 0.5
        call: Cell::new(0),
    };
    let mut frontend = build(
        settings,
        tracker,
        DltPnp::new(),
        bootstrap_matches(&world),
        &blank_color(),
        &blank_gray(),
    );

    let ids_before = frontend.tracks().ids().to_vec();
    let map_before = frontend.data.map().len();
    let status = frontend.process_frame(&blank_color(), &blank_gray());

    assert_eq!(status, FrameStatus::Rejected(RejectionCause::TrackingFailure));
    assert_eq!(frontend.data.poses().last().unwrap(), &None);
    assert_eq!(frontend.data.map().len(), map_before);
    assert_eq!(frontend.tracks().ids(), ids_before.as_slice());
    frontend.tracks().validate();
}

#[test]
fn too_few_triangulated_points_never_invokes_the_solver() {
    init_logger();
    // Seven points bootstrap fine (the direct solve needs six) but fall
    // below the eight the robust stage requires.
    let world: Vec<WorldPoint> = bootstrap_world().into_iter().take(7).collect();
    let poses = vec![WorldToCamera::identity(), translation_pose(-0.15, 0.0, 0.0)];
    let mut settings = FrontendSettings::default();
    settings.max_keypoints = world.len();
    let calls = Rc::new(Cell::new(0));
    let tracker = ScriptedTracker::new(projections_for(&world, &poses));
    let mut frontend = build(
        settings,
        tracker,
        CountingEstimator {
            inner: DltPnp::new(),
            calls: calls.clone(),
        },
        bootstrap_matches(&world),
        &blank_color(),
        &blank_gray(),
    );

    let status = frontend.process_frame(&blank_color(), &blank_gray());
    assert_eq!(
        status,
        FrameStatus::Rejected(RejectionCause::InsufficientCorrespondences)
    );
    assert_eq!(calls.get(), 0, "the pose solver must not run");
}

#[test]
fn forced_failure_frame_leaves_no_trace() {
    init_logger();
    let world = bootstrap_world();
    let pose_1 = translation_pose(-0.15, 0.0, 0.0);
    let pose_3 = translation_pose(-0.35, 0.05, 0.0);
    let mut settings = FrontendSettings::default();
    settings.max_keypoints = world.len();
    settings.homography_condition_threshold = 1.0001;

    // Run A sees a doomed frame between the two good ones; run B never
    // sees it.
    let poses_a = vec![WorldToCamera::identity(), pose_1, pose_1, pose_3];
    let tracker_a = LossyTracker {
        inner: ScriptedTracker::new(projections_for(&world, &poses_a)),
        fail_on_call: 2,
        keep: 0,
        call: Cell::new(0),
    };
    let mut frontend_a = build(
        settings,
        tracker_a,
        DltPnp::new(),
        bootstrap_matches(&world),
        &blank_color(),
        &blank_gray(),
    );

    let poses_b = vec![WorldToCamera::identity(), pose_1, pose_3];
    let tracker_b = ScriptedTracker::new(projections_for(&world, &poses_b));
    let mut frontend_b = build(
        settings,
        tracker_b,
        DltPnp::new(),
        bootstrap_matches(&world),
        &blank_color(),
        &blank_gray(),
    );

    let mut statuses_a = Vec::new();
    for _ in 1..poses_a.len() {
        statuses_a.push(frontend_a.process_frame(&blank_color(), &blank_gray()));
    }
    for _ in 1..poses_b.len() {
        frontend_b.process_frame(&blank_color(), &blank_gray());
    }
    assert!(matches!(statuses_a[1], FrameStatus::Rejected(_)));

    // Identical index state, map, and pose values; only the rejected
    // frame's absent pose distinguishes the histories.
    assert_eq!(frontend_a.tracks().ids(), frontend_b.tracks().ids());
    assert_eq!(
        frontend_a.tracks().triangulated(),
        frontend_b.tracks().triangulated()
    );
    assert_eq!(frontend_a.tracks().pending(), frontend_b.tracks().pending());
    assert_eq!(frontend_a.data.map().len(), frontend_b.data.map().len());
    let accepted_a: Vec<WorldToCamera> =
        frontend_a.data.poses().iter().flatten().copied().collect();
    let accepted_b: Vec<WorldToCamera> =
        frontend_b.data.poses().iter().flatten().copied().collect();
    assert_eq!(accepted_a.len(), accepted_b.len());
    for (a, b) in accepted_a.iter().zip(&accepted_b) {
        let distance = (a.isometry().translation.vector - b.isometry().translation.vector).norm();
        assert!(distance < 1e-9, "pose histories diverged by {}", distance);
    }
}

/// The full keyframe path: fresh detections become pending points, the next
/// keyframe triangulates them in two passes, and the tracking history
/// replays their observations across the interval.
#[test]
fn keyframe_triangulates_replenished_points() {
    init_logger();
    let bootstrap = bootstrap_world();
    // Fifteen more points whose frame-0 projections sit on exact pixel
    // centers, where the first-frame image carries checkerboard junctions
    // for the replenisher to find.
    let mut extra = Vec::new();
    for &u in &[120.0, 220.0, 420.0, 520.0, 560.0] {
        for &v in &[110.0, 230.0, 350.0] {
            let depth = 5.0 + (u + v) % 3.0;
            extra.push(backproject(u, v, depth));
        }
    }
    let world: Vec<WorldPoint> = bootstrap.iter().chain(extra.iter()).copied().collect();

    let poses = vec![
        WorldToCamera::identity(),
        translation_pose(-0.3, 0.0, 0.0),
        translation_pose(-0.5, 0.05, 0.0),
    ];

    // Checkerboard junctions centered on the extra points' projections.
    let mut first_gray = GrayImage::from_pixel(640, 480, image::Luma([128]));
    for point in &extra {
        let pixel = project(WorldToCamera::identity(), *point).unwrap();
        let (cu, cv) = (pixel.x as i64, pixel.y as i64);
        for dy in -5i64..=5 {
            for dx in -5i64..=5 {
                let bright = (dx < 0) == (dy < 0);
                let value = if bright { 220 } else { 40 };
                first_gray.put_pixel((cu + dx) as u32, (cv + dy) as u32, image::Luma([value]));
            }
        }
    }

    let mut settings = FrontendSettings::default();
    settings.max_keypoints = world.len();
    settings.homography_condition_threshold = 1.0001;
    settings.pose_consensus_threshold = 0.01;
    settings.max_pose_outlier_ratio = 0.9;
    let tracker = ScriptedTracker::new(projections_for(&world, &poses));
    let mut frontend = build(
        settings,
        tracker,
        DltPnp::new(),
        bootstrap_matches(&bootstrap),
        &blank_color(),
        &first_gray,
    );

    // The replenisher found the junctions and queued them as pending.
    let pending_after_bootstrap = frontend.tracks().pending().len();
    assert!(
        pending_after_bootstrap >= 12,
        "only {} junctions detected",
        pending_after_bootstrap
    );
    assert_eq!(frontend.data.map().len(), bootstrap.len());

    let status_1 = frontend.process_frame(&blank_color(), &blank_gray());
    assert_eq!(status_1, FrameStatus::Keyframe);

    // Every pending point triangulated and the partition stayed sound.
    frontend.tracks().validate();
    assert!(frontend.tracks().pending().is_empty());
    let new_points = frontend.data.map().len() - bootstrap.len();
    assert_eq!(new_points, pending_after_bootstrap);

    // The triangulated points land near their ground-truth positions.
    for export in frontend.export_map().iter().skip(bootstrap.len()) {
        let position = export.position.point().unwrap();
        let closest = extra
            .iter()
            .map(|truth| (position - truth.point().unwrap()).norm())
            .fold(f64::INFINITY, f64::min);
        assert!(closest < 0.5, "triangulated point {} from truth", closest);
        assert_eq!(export.group, 1);
    }

    // History replay: every new point was observed on both frames of the
    // interval (the bootstrap keyframe and the promoting frame).
    let observations = frontend.data.observations();
    for map_index in bootstrap.len()..frontend.data.map().len() {
        let seen = observations.observations_of_point(map_index as u32);
        assert!(
            seen.len() >= 2,
            "point {} has only {} observations",
            map_index,
            seen.len()
        );
        let frames: BTreeSet<usize> = seen.iter().map(|&(frame, _)| frame).collect();
        assert!(frames.contains(&0) && frames.contains(&1));
    }

    // The odometry edge spans the two keyframes.
    let step_records = observations.steps();
    assert_eq!(step_records[1].odometry.len(), 1);
    assert_eq!(step_records[1].odometry[0].from_frame, 0);
    assert_eq!(step_records[1].odometry[0].to_frame, 1);

    // Another frame tracks against the rebased id space.
    let status_2 = frontend.process_frame(&blank_color(), &blank_gray());
    assert!(status_2.is_accepted());
    frontend.tracks().validate();
    let truth = poses[2].isometry();
    let recovered = frontend.data.poses()[2].unwrap().isometry();
    assert!(
        (recovered.translation.vector - truth.translation.vector).norm() < 0.1,
        "frame 2 pose drifted"
    );
}

#[test]
fn empty_bootstrap_is_fatal() {
    init_logger();
    let result = Frontend::new(
        FrontendSettings::default(),
        camera(),
        ScriptedTracker::new(vec![Vec::new()]),
        Arrsac::new(0.005, Xoshiro256PlusPlus::seed_from_u64(5)),
        DltPnp::new(),
        IterativeLsTriangulator::new(),
        NearestPixelSampler,
        Xoshiro256PlusPlus::seed_from_u64(5),
        &blank_color(),
        &blank_gray(),
        &mut FixedBootstrap(Vec::new()),
    );
    assert!(result.is_err());
}
