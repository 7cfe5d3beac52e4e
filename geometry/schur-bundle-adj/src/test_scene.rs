//! Synthetic scenes for the unit tests.

use nalgebra as na;
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};

use crate::{Camera, Observation, Point3D};

/// `num_cams` cameras roughly five units in front of `num_points` points
/// spread around the origin. Every camera observes every point and the
/// observations are exact.
pub(crate) fn synthetic_scene(
    num_cams: usize,
    num_points: usize,
    seed: u64,
) -> (Vec<Camera<f64>>, Vec<Point3D<f64>>, Vec<Observation<f64>>) {
    let mut rng = StdRng::seed_from_u64(seed);

    let cams: Vec<_> = (0..num_cams)
        .map(|_| {
            let rotation = na::Rotation3::from_euler_angles(
                rng.gen_range(-0.1..0.1),
                rng.gen_range(-0.1..0.1),
                rng.gen_range(-0.1..0.1),
            );
            let translation = na::Vector3::new(
                rng.gen_range(-0.5..0.5),
                rng.gen_range(-0.5..0.5),
                rng.gen_range(5.0..6.0),
            );
            Camera::new(
                rng.gen_range(0.9..1.1),
                [0.0, 0.0],
                rotation.into_inner(),
                translation,
            )
        })
        .collect();

    let pts: Vec<_> = (0..num_points)
        .map(|_| {
            Point3D::new(
                rng.gen_range(-1.5..1.5),
                rng.gen_range(-1.5..1.5),
                rng.gen_range(-1.0..1.0),
            )
        })
        .collect();

    let mut obs = Vec::with_capacity(num_cams * num_points);
    for (point_id, pt) in pts.iter().enumerate() {
        for (camera_id, cam) in cams.iter().enumerate() {
            obs.push(Observation::new(camera_id, point_id, cam.project(&pt.pos)));
        }
    }

    (cams, pts, obs)
}

/// Copy of `obs` with Gaussian noise of standard deviation `sigma` added.
pub(crate) fn noisy_observations(
    obs: &[Observation<f64>],
    sigma: f64,
    seed: u64,
) -> Vec<Observation<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, sigma).expect("creating normal");
    obs.iter()
        .map(|o| {
            let noise = na::Vector2::new(normal.sample(&mut rng), normal.sample(&mut rng));
            Observation::new(o.camera_id, o.point_id, o.pos + noise)
        })
        .collect()
}
