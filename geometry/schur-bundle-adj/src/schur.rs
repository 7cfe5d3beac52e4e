//! Solve the damped normal equations of the bundle adjustment problem.
//!
//! With `J = [Jc | Jp]` and residual `F` the system is
//!
//! ```text
//! [ B  E ] [dc]   [v]      B = Jc^T Jc    E = Jc^T Jp    v = -Jc^T F
//! [ E^T C] [dp] = [w]      C = Jp^T Jp                   w = -Jp^T F
//! ```
//!
//! where the diagonals of `B` and `C` are multiplied by `1 + 1/radius`. The
//! points are eliminated using the Schur complement
//! `S = B - E C^-1 E^T`, the reduced camera system `S dc = v - E C^-1 w` is
//! solved with a block Jacobi preconditioned conjugate gradient and the
//! point update is recovered as `dp = C^-1 (w - E^T dc)`.
//!
//! `B` and `C` only keep the diagonal blocks of `Jc^T Jc` and `Jp^T Jp`. For
//! the points this is exact because each residual depends on one point only.

use nalgebra as na;
use num_traits::Float;

use crate::{
    BundleMode, Error, NUM_POINT_PARAMS, Result,
    cg::ConjugateGradient,
    sparse::SparseMatrix,
};

#[derive(Debug, Clone, PartialEq)]
pub struct LinearSolverOptions<F> {
    pub trust_region_radius: F,
    pub cg_max_iterations: usize,
    pub cg_tolerance: F,
    pub camera_block_dim: usize,
    pub bundle_mode: BundleMode,
}

/// The parameter update computed by [LinearSolver::solve].
#[derive(Debug, Clone, PartialEq)]
pub struct Solution<F: na::RealField> {
    /// Camera updates followed by point updates. Parameters that are held
    /// fixed by the [BundleMode] receive zero.
    pub delta: na::DVector<F>,
    pub num_cg_iterations: usize,
}

pub struct LinearSolver<F> {
    opts: LinearSolverOptions<F>,
}

impl<F: na::RealField + Float> LinearSolver<F> {
    pub fn new(opts: LinearSolverOptions<F>) -> Self {
        Self { opts }
    }

    /// Compute the update for camera Jacobian `jc`, point Jacobian `jp` and
    /// residual vector `residuals`.
    ///
    /// A non-finite system or a failed conjugate gradient solve is reported
    /// as the recoverable [Error::SolverFailed]. Inconsistent dimensions are
    /// [Error::Structural].
    pub fn solve(
        &self,
        jc: &SparseMatrix<F>,
        jp: &SparseMatrix<F>,
        residuals: &na::DVector<F>,
    ) -> Result<Solution<F>> {
        if jc.num_rows() != residuals.len() || jp.num_rows() != residuals.len() {
            return Err(Error::Structural(format!(
                "Jacobians with {} and {} rows do not match {} residuals",
                jc.num_rows(),
                jp.num_rows(),
                residuals.len()
            )));
        }
        if !jc.is_finite()
            || !jp.is_finite()
            || !residuals.iter().all(|v| Float::is_finite(*v))
        {
            return Err(Error::SolverFailed {
                reason: "non-finite Jacobian or residual",
                num_cg_iterations: 0,
            });
        }

        let mode = self.opts.bundle_mode;
        let (delta_c, delta_p, num_cg_iterations) =
            match (mode.optimizes_cameras(), mode.optimizes_points()) {
                (true, true) => self.solve_schur(jc, jp, residuals)?,
                (true, false) => {
                    let (delta_c, num_cg_iterations) = self.solve_cameras_only(jc, residuals)?;
                    (delta_c, na::DVector::zeros(jp.num_cols()), num_cg_iterations)
                }
                (false, _) => {
                    let delta_p = self.solve_points_only(jp, residuals)?;
                    (na::DVector::zeros(jc.num_cols()), delta_p, 0)
                }
            };

        let mut delta = na::DVector::zeros(delta_c.len() + delta_p.len());
        delta.rows_mut(0, delta_c.len()).copy_from(&delta_c);
        delta.rows_mut(delta_c.len(), delta_p.len()).copy_from(&delta_p);
        if !delta.iter().all(|v| Float::is_finite(*v)) {
            return Err(Error::SolverFailed {
                reason: "non-finite update",
                num_cg_iterations,
            });
        }

        Ok(Solution {
            delta,
            num_cg_iterations,
        })
    }

    fn damping_factor(&self) -> F {
        F::one() + F::one() / self.opts.trust_region_radius
    }

    fn cg(&self) -> ConjugateGradient<F> {
        ConjugateGradient::new(self.opts.cg_max_iterations, self.opts.cg_tolerance)
    }

    /// Damped `Jc^T Jc` block diagonal and its block inverse.
    fn camera_blocks(&self, jc: &SparseMatrix<F>) -> Result<(SparseMatrix<F>, SparseMatrix<F>)> {
        let mut b = jc.block_column_gram(self.opts.camera_block_dim)?;
        b.mult_diagonal(self.damping_factor());
        let mut precond = b.clone();
        let num_zeroed = precond.invert_block_diagonal_cholesky(self.opts.camera_block_dim)?;
        if num_zeroed > 0 {
            tracing::debug!("{num_zeroed} camera blocks not invertible, preconditioner degraded");
        }
        Ok((b, precond))
    }

    /// Inverse of the damped `Jp^T Jp` block diagonal.
    fn inverse_point_blocks(&self, jp: &SparseMatrix<F>) -> Result<SparseMatrix<F>> {
        let mut c = jp.block_column_gram(NUM_POINT_PARAMS)?;
        c.mult_diagonal(self.damping_factor());
        let num_zeroed = c.invert_block_diagonal_3x3()?;
        if num_zeroed > 0 {
            tracing::debug!("{num_zeroed} point blocks singular, their updates are zero");
        }
        Ok(c)
    }

    fn solve_schur(
        &self,
        jc: &SparseMatrix<F>,
        jp: &SparseMatrix<F>,
        residuals: &na::DVector<F>,
    ) -> Result<(na::DVector<F>, na::DVector<F>, usize)> {
        let jc_t = jc.transpose();
        let jp_t = jp.transpose();

        let (b, precond) = self.camera_blocks(jc)?;
        let c_inv = self.inverse_point_blocks(jp)?;
        let e = jc_t.multiply(jp)?;
        let e_t = e.transpose();
        let v = -jc_t.multiply_vector(residuals)?;
        let w = -jp_t.multiply_vector(residuals)?;

        let s = b.subtract(&e.multiply(&c_inv)?.multiply(&e_t)?)?;
        let rhs = v - e.multiply_vector(&c_inv.multiply_vector(&w)?)?;

        let (delta_c, status) = self.cg().solve(&s, &rhs, Some(&precond));
        if !status.is_success() {
            return Err(Error::SolverFailed {
                reason: "conjugate gradient rejected the reduced camera system",
                num_cg_iterations: status.num_iterations,
            });
        }

        let delta_p = c_inv.multiply_vector(&(w - e_t.multiply_vector(&delta_c)?))?;
        Ok((delta_c, delta_p, status.num_iterations))
    }

    fn solve_cameras_only(
        &self,
        jc: &SparseMatrix<F>,
        residuals: &na::DVector<F>,
    ) -> Result<(na::DVector<F>, usize)> {
        let (b, precond) = self.camera_blocks(jc)?;
        let v = -jc.transpose().multiply_vector(residuals)?;
        let (delta_c, status) = self.cg().solve(&b, &v, Some(&precond));
        if !status.is_success() {
            return Err(Error::SolverFailed {
                reason: "conjugate gradient rejected the camera system",
                num_cg_iterations: status.num_iterations,
            });
        }
        Ok((delta_c, status.num_iterations))
    }

    fn solve_points_only(
        &self,
        jp: &SparseMatrix<F>,
        residuals: &na::DVector<F>,
    ) -> Result<na::DVector<F>> {
        let c_inv = self.inverse_point_blocks(jp)?;
        let w = -jp.transpose().multiply_vector(residuals)?;
        c_inv.multiply_vector(&w)
    }
}
