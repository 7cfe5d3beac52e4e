//! Reprojection residuals and their analytic Jacobians.
//!
//! Both are evaluated independently per observation on the current rayon
//! thread pool. Results are merged in observation order, so the output does
//! not depend on the number of worker threads.

use nalgebra as na;
use num_traits::Float;
use rayon::prelude::*;

use crate::{
    Error, Result,
    model::{
        Camera, NUM_CAM_PARAMS, NUM_POINT_PARAMS, Observation, Point3D, camera_delta, num_params,
        point_delta, radial_distortion_factor,
    },
    sparse::{SparseMatrix, Triplet},
};

type CamJacobian<F> = na::SMatrix<F, 2, NUM_CAM_PARAMS>;
type PointJacobian<F> = na::SMatrix<F, 2, NUM_POINT_PARAMS>;

pub(crate) fn check_indices<F: na::RealField>(
    num_cams: usize,
    num_points: usize,
    observations: &[Observation<F>],
) -> Result<()> {
    for (i, obs) in observations.iter().enumerate() {
        if obs.camera_id >= num_cams {
            return Err(Error::InconsistentData(format!(
                "observation {i} references camera {} of {num_cams}",
                obs.camera_id
            )));
        }
        if obs.point_id >= num_points {
            return Err(Error::InconsistentData(format!(
                "observation {i} references point {} of {num_points}",
                obs.point_id
            )));
        }
    }
    Ok(())
}

/// Compute the residual vector: predicted minus observed pixel position, `x`
/// and `y` interleaved, in observation order.
///
/// If `delta` is given, each observation is evaluated with a private copy of
/// its camera and point with the update applied. The inputs are never
/// modified.
///
/// Points on the camera plane produce non-finite residuals. Supplying sane
/// geometry is up to the caller.
pub fn evaluate_residuals<F: na::RealField + Float>(
    cameras: &[Camera<F>],
    points: &[Point3D<F>],
    observations: &[Observation<F>],
    delta: Option<&na::DVector<F>>,
) -> Result<na::DVector<F>> {
    check_indices(cameras.len(), points.len(), observations)?;
    if let Some(delta) = delta {
        if delta.len() != num_params(cameras.len(), points.len()) {
            return Err(Error::InconsistentData(format!(
                "update has {} entries, expected {}",
                delta.len(),
                num_params(cameras.len(), points.len())
            )));
        }
    }

    let errors: Vec<na::Vector2<F>> = observations
        .par_iter()
        .map(|obs| {
            let cam = &cameras[obs.camera_id];
            let pt = &points[obs.point_id];
            match delta {
                Some(delta) => {
                    let delta = delta.as_slice();
                    let cam = cam.updated(camera_delta(delta, obs.camera_id));
                    let pt = pt.updated(point_delta(delta, cameras.len(), obs.point_id));
                    cam.project(&pt.pos) - obs.pos
                }
                None => cam.project(&pt.pos) - obs.pos,
            }
        })
        .collect();

    Ok(na::DVector::from_iterator(
        errors.len() * 2,
        errors.iter().flat_map(|e| [e.x, e.y]),
    ))
}

/// Sum of squared residuals divided by the number of observations.
pub fn mean_squared_error<F: na::RealField + Float>(residuals: &na::DVector<F>) -> F {
    let num_obs = residuals.len() / 2;
    if num_obs == 0 {
        return F::zero();
    }
    let num_obs: F = na::convert(num_obs as f64);
    residuals.norm_squared() / num_obs
}

/// Compute the sparse Jacobians of the residuals with respect to the camera
/// parameters (`2N x 9M`) and the point coordinates (`2N x 3P`) for `N`
/// observations, `M` cameras and `P` points.
///
/// Each observation contributes one dense `2x9` block to the camera Jacobian
/// and one dense `2x3` block to the point Jacobian. The rotation columns are
/// derivatives with respect to the incremental rotation applied on the left
/// of the current rotation, evaluated at zero.
pub fn evaluate_jacobian<F: na::RealField + Float>(
    cameras: &[Camera<F>],
    points: &[Point3D<F>],
    observations: &[Observation<F>],
) -> Result<(SparseMatrix<F>, SparseMatrix<F>)> {
    check_indices(cameras.len(), points.len(), observations)?;

    let blocks: Vec<(CamJacobian<F>, PointJacobian<F>)> = observations
        .par_iter()
        .map(|obs| observation_jacobian(&cameras[obs.camera_id], &points[obs.point_id]))
        .collect();

    let nrows = observations.len() * 2;
    let mut cam_triplets = Vec::with_capacity(nrows * NUM_CAM_PARAMS);
    let mut point_triplets = Vec::with_capacity(nrows * NUM_POINT_PARAMS);
    for (i, (obs, (j_cam, j_pt))) in observations.iter().zip(blocks.iter()).enumerate() {
        let row = i * 2;
        let cam_col = obs.camera_id * NUM_CAM_PARAMS;
        let pt_col = obs.point_id * NUM_POINT_PARAMS;
        for axis in 0..2 {
            for j in 0..NUM_CAM_PARAMS {
                cam_triplets.push(Triplet::new(row + axis, cam_col + j, j_cam[(axis, j)]));
            }
            for j in 0..NUM_POINT_PARAMS {
                point_triplets.push(Triplet::new(row + axis, pt_col + j, j_pt[(axis, j)]));
            }
        }
    }

    let jc = SparseMatrix::from_triplets(nrows, cameras.len() * NUM_CAM_PARAMS, cam_triplets)?;
    let jp = SparseMatrix::from_triplets(nrows, points.len() * NUM_POINT_PARAMS, point_triplets)?;
    Ok((jc, jp))
}

/// Partial derivatives of the projection `(u, v)` of `pt` through `cam`.
fn observation_jacobian<F: na::RealField + Float>(
    cam: &Camera<F>,
    pt: &Point3D<F>,
) -> (CamJacobian<F>, PointJacobian<F>) {
    let two: F = na::convert(2.0);
    let f = cam.focal_length;
    let [k0, k1] = cam.distortion;

    // rotated but not yet translated
    let rp = cam.rotation * pt.pos;
    let pc = rp + cam.translation;
    let zc = pc.z;
    let x = pc.x / zc;
    let y = pc.y / zc;
    let r2 = x * x + y * y;
    let distort = radial_distortion_factor(x, y, &cam.distortion);

    // d(distort)/d(xc, yc, zc) via r2
    let distort_deriv_r2 = k0 + two * k1 * r2;
    let distort_deriv_pc = na::Vector3::new(two * x / zc, two * y / zc, -two * r2 / zc)
        * distort_deriv_r2;

    // d(u, v)/d(xc, yc, zc)
    let fd = f * distort;
    #[rustfmt::skip]
    let uv_deriv_pc = na::Matrix2x3::new(
        f*x*distort_deriv_pc.x + fd/zc, f*x*distort_deriv_pc.y,         f*x*distort_deriv_pc.z - fd*x/zc,
        f*y*distort_deriv_pc.x,         f*y*distort_deriv_pc.y + fd/zc, f*y*distort_deriv_pc.z - fd*y/zc,
    );

    let mut j_cam = CamJacobian::<F>::zeros();
    j_cam[(0, 0)] = distort * x;
    j_cam[(1, 0)] = distort * y;
    j_cam[(0, 1)] = f * x * r2;
    j_cam[(1, 1)] = f * y * r2;
    j_cam[(0, 2)] = f * x * r2 * r2;
    j_cam[(1, 2)] = f * y * r2 * r2;
    j_cam.fixed_view_mut::<2, 3>(0, 3).copy_from(&uv_deriv_pc);
    // d(dR * rp)/dw at w = 0 is -[rp]_x
    let pc_deriv_w = -rp.cross_matrix();
    j_cam
        .fixed_view_mut::<2, 3>(0, 6)
        .copy_from(&(uv_deriv_pc * pc_deriv_w));

    let j_pt = uv_deriv_pc * cam.rotation;
    (j_cam, j_pt)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_scene::{noisy_observations, synthetic_scene};
    use na::{Dyn, Owned};
    use test_log::test;

    #[test]
    fn test_zero_residual_for_exact_observation() {
        let cams = vec![Camera::new(
            1.0,
            [0.0, 0.0],
            na::Matrix3::identity(),
            na::Vector3::zeros(),
        )];
        let pts = vec![Point3D::new(0.0, 0.0, 5.0)];
        let obs = vec![Observation::new(0, 0, na::Vector2::new(0.0, 0.0))];
        let residuals = evaluate_residuals(&cams, &pts, &obs, None).unwrap();
        assert_eq!(residuals.len(), 2);
        assert_eq!(residuals, na::DVector::from_vec(vec![0.0, 0.0]));
        assert_eq!(mean_squared_error(&residuals), 0.0);
    }

    #[test]
    fn test_residual_is_predicted_minus_observed() {
        let cams = vec![Camera::new(
            2.0,
            [0.1, 0.01],
            na::Matrix3::identity(),
            na::Vector3::zeros(),
        )];
        let pts = vec![Point3D::new(1.0, 2.0, 4.0)];
        let obs = vec![Observation::new(0, 0, na::Vector2::new(0.5, 1.0))];
        let residuals = evaluate_residuals(&cams, &pts, &obs, None).unwrap();
        approx::assert_relative_eq!(residuals[0], 0.01611328125, epsilon = 1e-14);
        approx::assert_relative_eq!(residuals[1], 0.0322265625, epsilon = 1e-14);
        let expected_mse = 0.01611328125f64.powi(2) + 0.0322265625f64.powi(2);
        approx::assert_relative_eq!(mean_squared_error(&residuals), expected_mse, epsilon = 1e-16);
    }

    #[test]
    fn test_residuals_with_update_leave_inputs_untouched() {
        let (cams, pts, obs) = synthetic_scene(3, 5, 1);
        let obs = noisy_observations(&obs, 0.01, 2);
        let (cams0, pts0) = (cams.clone(), pts.clone());

        let n = num_params(cams.len(), pts.len());
        let delta = na::DVector::from_fn(n, |i, _| 1e-3 * ((i % 7) as f64 - 3.0));
        let with_delta = evaluate_residuals(&cams, &pts, &obs, Some(&delta)).unwrap();
        assert_eq!(cams, cams0);
        assert_eq!(pts, pts0);

        let mut cams1 = cams.clone();
        let mut pts1 = pts.clone();
        crate::model::update_parameters(&delta, &mut cams1, &mut pts1).unwrap();
        let updated = evaluate_residuals(&cams1, &pts1, &obs, None).unwrap();
        assert_eq!(with_delta, updated);
    }

    #[test]
    fn test_bad_indices_rejected() {
        let (cams, pts, mut obs) = synthetic_scene(2, 3, 3);
        obs[1].point_id = 3;
        assert!(matches!(
            evaluate_residuals(&cams, &pts, &obs, None),
            Err(Error::InconsistentData(_))
        ));
        assert!(matches!(
            evaluate_jacobian(&cams, &pts, &obs),
            Err(Error::InconsistentData(_))
        ));
    }

    #[test]
    fn test_jacobian_shape() {
        let (cams, pts, obs) = synthetic_scene(3, 4, 4);
        let (jc, jp) = evaluate_jacobian(&cams, &pts, &obs).unwrap();
        assert_eq!(jc.num_rows(), obs.len() * 2);
        assert_eq!(jc.num_cols(), cams.len() * NUM_CAM_PARAMS);
        assert_eq!(jc.num_non_zero(), obs.len() * 2 * NUM_CAM_PARAMS);
        assert_eq!(jp.num_rows(), obs.len() * 2);
        assert_eq!(jp.num_cols(), pts.len() * NUM_POINT_PARAMS);
        assert_eq!(jp.num_non_zero(), obs.len() * 2 * NUM_POINT_PARAMS);

        // Observation 0 is camera 0 looking at point 0. Nothing from camera 1.
        assert_eq!(obs[0].camera_id, 0);
        assert_eq!(jc.get(0, NUM_CAM_PARAMS), 0.0);
        assert!(jc.get(0, 0) != 0.0);
    }

    /// Wraps a scene so that the parameters are the update vector around the
    /// current cameras and points.
    struct UpdateProblem {
        cams: Vec<Camera<f64>>,
        pts: Vec<Point3D<f64>>,
        obs: Vec<Observation<f64>>,
        delta: na::DVector<f64>,
    }

    impl levenberg_marquardt::LeastSquaresProblem<f64, Dyn, Dyn> for UpdateProblem {
        type ParameterStorage = Owned<f64, Dyn>;
        type ResidualStorage = Owned<f64, Dyn>;
        type JacobianStorage = Owned<f64, Dyn, Dyn>;

        fn set_params(&mut self, x: &na::DVector<f64>) {
            self.delta = x.clone();
        }

        fn params(&self) -> na::DVector<f64> {
            self.delta.clone()
        }

        fn residuals(&self) -> Option<na::DVector<f64>> {
            evaluate_residuals(&self.cams, &self.pts, &self.obs, Some(&self.delta)).ok()
        }

        fn jacobian(&self) -> Option<na::Matrix<f64, Dyn, Dyn, Self::JacobianStorage>> {
            // only valid at a zero update
            let (jc, jp) = evaluate_jacobian(&self.cams, &self.pts, &self.obs).ok()?;
            let (jc, jp) = (jc.to_dense(), jp.to_dense());
            let mut j = na::DMatrix::zeros(jc.nrows(), jc.ncols() + jp.ncols());
            j.columns_mut(0, jc.ncols()).copy_from(&jc);
            j.columns_mut(jc.ncols(), jp.ncols()).copy_from(&jp);
            Some(j)
        }
    }

    #[test]
    fn test_jacobian_matches_numerical_differentiation() {
        use levenberg_marquardt::LeastSquaresProblem;

        let (mut cams, pts, obs) = synthetic_scene(3, 4, 5);
        for (i, cam) in cams.iter_mut().enumerate() {
            cam.distortion = [0.2 - 0.05 * i as f64, -0.1 + 0.03 * i as f64];
        }
        let obs = noisy_observations(&obs, 0.05, 6);
        let n = num_params(cams.len(), pts.len());
        let mut problem = UpdateProblem {
            cams,
            pts,
            obs,
            delta: na::DVector::zeros(n),
        };

        let jacobian_trait = problem.jacobian().unwrap();
        let jacobian_numerical = levenberg_marquardt::differentiate_numerically(&mut problem).unwrap();
        approx::assert_relative_eq!(jacobian_numerical, jacobian_trait, epsilon = 1e-6);
    }

    #[test]
    fn test_evaluation_independent_of_worker_count() {
        let (cams, pts, obs) = synthetic_scene(4, 30, 7);
        let obs = noisy_observations(&obs, 0.01, 8);
        let n = num_params(cams.len(), pts.len());
        let delta = na::DVector::from_fn(n, |i, _| 1e-4 * ((i % 5) as f64 - 2.0));

        let run = |num_threads: usize| {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()
                .unwrap();
            pool.install(|| {
                let r0 = evaluate_residuals(&cams, &pts, &obs, None).unwrap();
                let r1 = evaluate_residuals(&cams, &pts, &obs, Some(&delta)).unwrap();
                let (jc, jp) = evaluate_jacobian(&cams, &pts, &obs).unwrap();
                (r0, r1, jc, jp)
            })
        };

        let reference = run(1);
        for num_threads in [2, 8] {
            let result = run(num_threads);
            assert_eq!(result.0, reference.0);
            assert_eq!(result.1, reference.1);
            assert_eq!(result.2, reference.2);
            assert_eq!(result.3, reference.3);
        }
    }
}
