//! The Levenberg-Marquardt trust region loop.

use std::sync::Arc;

use nalgebra as na;
use num_traits::Float;

use crate::{
    Error, Result,
    evaluate::{check_indices, evaluate_jacobian, evaluate_residuals, mean_squared_error},
    model::{Camera, Observation, Point3D, update_parameters},
    options::Options,
    schur::{LinearSolver, LinearSolverOptions},
    sparse::SparseMatrix,
};

/// State of the optimizer. All states except [LmState::Optimizing] are
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LmState {
    Optimizing,
    /// The mean squared error fell below `lm_mse_threshold`.
    ConvergedAbsolute,
    /// A successful iteration improved the mean squared error by a smaller
    /// fraction than `lm_delta_threshold`.
    ConvergedRelative,
    /// `lm_max_iterations` iterations ran without converging.
    Exhausted,
}

impl LmState {
    pub fn was_successful(&self) -> bool {
        matches!(self, Self::ConvergedAbsolute | Self::ConvergedRelative)
    }
}

/// Statistics of a run of [BundleAdjuster::optimize].
#[derive(Clone, Debug, PartialEq)]
pub struct Report<F> {
    pub termination: LmState,
    pub initial_mse: F,
    pub final_mse: F,
    pub num_iterations: usize,
    pub num_successful_iterations: usize,
    pub num_unsuccessful_iterations: usize,
    /// Total conjugate gradient iterations over all linear solves.
    pub num_cg_iterations: usize,
    /// The initial mean squared error followed by the mean squared error
    /// after every successful iteration. Never increases.
    pub mse_history: Vec<F>,
}

/// Sparse bundle adjustment of cameras and 3D world points.
///
/// Owns the cameras, points and observations for the duration of the
/// optimization. Cameras and points are only modified by
/// [BundleAdjuster::optimize] when an iteration reduces the mean squared
/// reprojection error.
#[derive(Clone)]
pub struct BundleAdjuster<F: na::RealField + Float> {
    cameras: Vec<Camera<F>>,
    points: Vec<Point3D<F>>,
    observations: Vec<Observation<F>>,
    options: Options,
    /// Worker threads for residual and Jacobian evaluation.
    pool: Arc<rayon::ThreadPool>,
}

impl<F: na::RealField + Float> BundleAdjuster<F> {
    /// Create a new [BundleAdjuster].
    ///
    /// Fails if the options are invalid, there are no observations or an
    /// observation references a camera or point that does not exist.
    pub fn new(
        cameras: Vec<Camera<F>>,
        points: Vec<Point3D<F>>,
        observations: Vec<Observation<F>>,
        options: Options,
    ) -> Result<Self> {
        options.validate()?;
        if observations.is_empty() {
            return Err(Error::InconsistentData("no observations".into()));
        }
        check_indices(cameras.len(), points.len(), &observations)?;

        let (num_points_per_camera, num_views_per_point) =
            visibility_counts(cameras.len(), points.len(), &observations);
        if num_points_per_camera.iter().any(|&n| n < 2) {
            tracing::warn!("Some cameras have not observed multiple 3D world points.");
        }
        if num_views_per_point.iter().any(|&n| n < 2) {
            tracing::warn!("Some 3D world points were not observed multiple times.");
        }

        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(num_threads) = options.num_threads {
            builder = builder.num_threads(num_threads);
        }
        let pool = Arc::new(builder.build()?);

        Ok(Self {
            cameras,
            points,
            observations,
            options,
            pool,
        })
    }

    pub fn cameras(&self) -> &[Camera<F>] {
        &self.cameras
    }

    pub fn points(&self) -> &[Point3D<F>] {
        &self.points
    }

    pub fn observations(&self) -> &[Observation<F>] {
        &self.observations
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Return the (refined) cameras and points.
    pub fn into_parts(self) -> (Vec<Camera<F>>, Vec<Point3D<F>>) {
        (self.cameras, self.points)
    }

    /// The residual vector at the current parameters, optionally with
    /// `delta` applied.
    pub fn residuals(&self, delta: Option<&na::DVector<F>>) -> Result<na::DVector<F>> {
        self.pool
            .install(|| evaluate_residuals(&self.cameras, &self.points, &self.observations, delta))
    }

    /// The camera and point Jacobians at the current parameters.
    pub fn jacobian(&self) -> Result<(SparseMatrix<F>, SparseMatrix<F>)> {
        self.pool
            .install(|| evaluate_jacobian(&self.cameras, &self.points, &self.observations))
    }

    /// Run Levenberg-Marquardt until one of the terminal [LmState]s is
    /// reached.
    ///
    /// Failures of the linear solver only make the iteration unsuccessful.
    /// Errors are returned only for problems that indicate a bug, such as
    /// inconsistent matrix structure.
    pub fn optimize(&mut self) -> Result<Report<F>> {
        let opts = self.options.clone();
        let mse_threshold: F = na::convert(opts.lm_mse_threshold);
        let delta_threshold: F = na::convert(opts.lm_delta_threshold);
        let gain: F = na::convert(opts.trust_region_radius_gain);
        let decrement: F = na::convert(opts.trust_region_radius_decrement);

        let mut residuals = self.residuals(None)?;
        let mut current_mse = mean_squared_error(&residuals);
        let mut trust_region_radius: F = na::convert(opts.trust_region_radius_init);

        let mut report = Report {
            termination: LmState::Optimizing,
            initial_mse: current_mse,
            final_mse: current_mse,
            num_iterations: 0,
            num_successful_iterations: 0,
            num_unsuccessful_iterations: 0,
            num_cg_iterations: 0,
            mse_history: vec![current_mse],
        };

        while report.termination == LmState::Optimizing {
            let lm_iter = report.num_iterations;
            if current_mse < mse_threshold {
                tracing::debug!("BA: satisfied MSE threshold");
                report.termination = LmState::ConvergedAbsolute;
                break;
            }
            if report.num_iterations >= opts.lm_max_iterations {
                report.termination = LmState::Exhausted;
                break;
            }

            let (jc, jp) = self.jacobian()?;
            let solver = LinearSolver::new(LinearSolverOptions {
                trust_region_radius,
                cg_max_iterations: opts.cg_max_iterations,
                cg_tolerance: na::convert(opts.cg_tolerance),
                camera_block_dim: opts.camera_block_dim,
                bundle_mode: opts.bundle_mode,
            });
            let solution = match solver.solve(&jc, &jp, &residuals) {
                Ok(solution) => {
                    report.num_cg_iterations += solution.num_cg_iterations;
                    Some(solution)
                }
                Err(Error::SolverFailed {
                    reason,
                    num_cg_iterations,
                }) => {
                    tracing::debug!("BA: #{lm_iter} linear solver failed: {reason}");
                    report.num_cg_iterations += num_cg_iterations;
                    None
                }
                Err(e) => return Err(e),
            };

            let trial = match &solution {
                Some(solution) => {
                    let new_residuals = self.residuals(Some(&solution.delta))?;
                    let new_mse = mean_squared_error(&new_residuals);
                    Some((solution, new_residuals, new_mse))
                }
                None => None,
            };

            report.num_iterations += 1;
            match trial {
                // NaN never compares smaller, so it is a failure too.
                Some((solution, new_residuals, new_mse)) if new_mse < current_mse => {
                    let delta_mse_ratio = F::one() - new_mse / current_mse;
                    tracing::debug!(
                        "BA: #{lm_iter} success, MSE {current_mse:?} -> {new_mse:?}, CG {}, TRR {trust_region_radius:?}, MSE ratio {delta_mse_ratio:?}",
                        solution.num_cg_iterations,
                    );
                    update_parameters(&solution.delta, &mut self.cameras, &mut self.points)?;
                    residuals = new_residuals;
                    current_mse = new_mse;
                    report.num_successful_iterations += 1;
                    report.mse_history.push(current_mse);

                    if delta_mse_ratio < delta_threshold
                        && report.num_iterations >= opts.lm_min_iterations
                    {
                        tracing::debug!(
                            "BA: satisfied delta MSE ratio threshold of {}",
                            opts.lm_delta_threshold
                        );
                        report.termination = LmState::ConvergedRelative;
                    }
                    trust_region_radius *= gain;
                }
                _ => {
                    tracing::debug!(
                        "BA: #{lm_iter} failure, MSE {current_mse:?}, TRR {trust_region_radius:?}"
                    );
                    report.num_unsuccessful_iterations += 1;
                    trust_region_radius *= decrement;
                }
            }
            if report.termination == LmState::Optimizing
                && report.num_iterations >= opts.lm_max_iterations
            {
                tracing::debug!(
                    "BA: reached maximum LM iterations of {}",
                    opts.lm_max_iterations
                );
                report.termination = LmState::Exhausted;
            }
        }

        report.final_mse = current_mse;
        if report.termination.was_successful() {
            tracing::info!(
                "BA: {:?} after {} iterations ({} successful), MSE {:?} -> {:?}",
                report.termination,
                report.num_iterations,
                report.num_successful_iterations,
                report.initial_mse,
                report.final_mse,
            );
        } else {
            tracing::warn!(
                "BA: not converged after {} iterations ({} successful), MSE {:?} -> {:?}",
                report.num_iterations,
                report.num_successful_iterations,
                report.initial_mse,
                report.final_mse,
            );
        }
        Ok(report)
    }
}

/// Number of observations of each camera and of each point.
fn visibility_counts<F: na::RealField>(
    num_cameras: usize,
    num_points: usize,
    observations: &[Observation<F>],
) -> (Vec<usize>, Vec<usize>) {
    let mut per_camera = vec![0; num_cameras];
    let mut per_point = vec![0; num_points];
    for obs in observations.iter() {
        per_camera[obs.camera_id] += 1;
        per_point[obs.point_id] += 1;
    }
    (per_camera, per_point)
}
