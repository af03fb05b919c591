use vo_core::{
    FeatureWorldMatch, Pose, Projective, Se3TangentSpace, WorldToCamera,
};

/// The se(3) gradient that nudges `pose` so the world point of `landmark`
/// lines up with its observed bearing.
///
/// The translation component pulls the camera-space point onto the observed
/// ray; the rotation component turns the camera towards the observation.
fn landmark_gradient(pose: WorldToCamera, landmark: FeatureWorldMatch) -> Se3TangentSpace {
    let FeatureWorldMatch(observation, world) = landmark;
    let camera_point = pose.transform(world);
    let translation = camera_point.bearing_unnormalized();
    let observed = observation.coords.push(1.0).normalize();
    let projected = translation.dot(&observed) * observed;
    Se3TangentSpace::new(
        projected - translation,
        translation.normalize().cross(&observed),
    )
}

/// Refines a camera pose against a set of 2d-3d correspondences by averaged
/// gradient descent on se(3).
///
/// This is a warm-started polish, not a from-scratch solver: it is intended
/// to take a consensus model and sharpen it against the inlier set. The step
/// size decays geometrically so the pose settles instead of oscillating, and
/// the loop exits early once the net update becomes negligible.
pub fn refine_pose(
    mut pose: WorldToCamera,
    landmarks: &[FeatureWorldMatch],
    optimization_rate: f64,
    iterations: usize,
) -> WorldToCamera {
    if landmarks.is_empty() {
        return pose;
    }
    let mut rate = optimization_rate / landmarks.len() as f64;
    for _ in 0..iterations {
        let net_delta: Se3TangentSpace = landmarks
            .iter()
            .map(|&landmark| landmark_gradient(pose, landmark))
            .sum();
        let step = net_delta.scale(rate);
        pose.0 = step.isometry() * pose.0;
        if step.translation.norm_squared() + step.rotation.norm_squared() < 1e-24 {
            break;
        }
        rate *= 0.999;
    }
    pose
}
