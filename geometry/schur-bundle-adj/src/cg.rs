//! Preconditioned conjugate gradient for symmetric positive (semi-)definite
//! sparse systems.

use nalgebra as na;
use num_traits::Float;

use crate::sparse::SparseMatrix;

/// Outcome of [ConjugateGradient::solve].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CgInfo {
    /// The relative residual dropped below the tolerance.
    Converged,
    /// The iteration cap was reached. The returned solution is the last
    /// iterate and is usually still a useful approximate step.
    MaxIterations,
    /// Dimensions do not match or the system is not finite.
    InvalidInput,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CgStatus {
    pub info: CgInfo,
    pub num_iterations: usize,
}

impl CgStatus {
    /// Both convergence and reaching the iteration cap yield a usable
    /// solution.
    pub fn is_success(&self) -> bool {
        self.info != CgInfo::InvalidInput
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConjugateGradient<F> {
    pub max_iterations: usize,
    /// Convergence threshold on `|r|^2 / |b|^2`.
    pub tolerance: F,
}

impl<F: na::RealField + Float> ConjugateGradient<F> {
    pub fn new(max_iterations: usize, tolerance: F) -> Self {
        Self {
            max_iterations,
            tolerance,
        }
    }

    /// Solve `a * x = b`, starting from `x = 0`.
    ///
    /// `precond`, if given, is an approximation of the inverse of `a` applied
    /// to the residual every iteration.
    pub fn solve(
        &self,
        a: &SparseMatrix<F>,
        b: &na::DVector<F>,
        precond: Option<&SparseMatrix<F>>,
    ) -> (na::DVector<F>, CgStatus) {
        let n = b.len();
        let status = |info, num_iterations| CgStatus {
            info,
            num_iterations,
        };

        let shapes_ok = a.num_rows() == n
            && a.num_cols() == n
            && precond.is_none_or(|m| m.num_rows() == n && m.num_cols() == n);
        let finite = a.is_finite()
            && b.iter().all(|v| Float::is_finite(*v))
            && precond.is_none_or(|m| m.is_finite());
        if !shapes_ok || !finite {
            return (na::DVector::zeros(n), status(CgInfo::InvalidInput, 0));
        }

        let mut x = na::DVector::zeros(n);
        let b_norm2 = b.norm_squared();
        if b_norm2 == F::zero() {
            return (x, status(CgInfo::Converged, 0));
        }

        let apply_precond = |r: &na::DVector<F>| -> na::DVector<F> {
            match precond {
                // Shapes were checked above.
                Some(m) => m.multiply_vector(r).unwrap_or_else(|_| r.clone()),
                None => r.clone(),
            }
        };

        let mut r = b.clone();
        let mut z = apply_precond(&r);
        let mut p = z.clone();
        let mut rz = r.dot(&z);

        for iter in 0..self.max_iterations {
            let ap = match a.multiply_vector(&p) {
                Ok(ap) => ap,
                Err(_) => return (x, status(CgInfo::InvalidInput, iter)),
            };
            let p_ap = p.dot(&ap);
            if !(p_ap > F::zero()) {
                // No further descent possible along p. The current iterate
                // is the best available.
                tracing::trace!("CG breakdown after {iter} iterations, pAp = {p_ap:?}");
                return (x, status(CgInfo::Converged, iter));
            }

            let alpha = rz / p_ap;
            x.axpy(alpha, &p, F::one());
            r.axpy(-alpha, &ap, F::one());

            if r.norm_squared() / b_norm2 < self.tolerance {
                return (x, status(CgInfo::Converged, iter + 1));
            }

            z = apply_precond(&r);
            let rz_new = r.dot(&z);
            let beta = rz_new / rz;
            rz = rz_new;
            p = &z + &p * beta;
        }

        (x, status(CgInfo::MaxIterations, self.max_iterations))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sparse::Triplet;
    use approx::assert_relative_eq;
    use test_log::test;

    fn dense_to_sparse(m: &na::DMatrix<f64>) -> SparseMatrix<f64> {
        let mut triplets = Vec::new();
        for j in 0..m.ncols() {
            for i in 0..m.nrows() {
                if m[(i, j)] != 0.0 {
                    triplets.push(Triplet::new(i, j, m[(i, j)]));
                }
            }
        }
        SparseMatrix::from_triplets(m.nrows(), m.ncols(), triplets).unwrap()
    }

    fn spd(n: usize) -> na::DMatrix<f64> {
        let a = na::DMatrix::from_fn(n, n, |i, j| ((3 * i + 5 * j) % 11) as f64 / 11.0 - 0.5);
        a.transpose() * &a + na::DMatrix::identity(n, n)
    }

    #[test]
    fn test_solves_spd_system() {
        let m = spd(12);
        let b = na::DVector::from_fn(12, |i, _| i as f64 - 4.0);
        let cg = ConjugateGradient::new(100, 1e-24);
        let (x, status) = cg.solve(&dense_to_sparse(&m), &b, None);
        assert_eq!(status.info, CgInfo::Converged);
        assert!(status.num_iterations <= 24);
        assert_relative_eq!(&m * x, b, epsilon = 1e-9);
    }

    #[test]
    fn test_preconditioned_solve() {
        let mut m = spd(6);
        for i in 0..6 {
            m[(i, i)] *= 1.0 + 100.0 * i as f64;
        }
        let b = na::DVector::from_fn(6, |i, _| 1.0 + i as f64);
        let jacobi = dense_to_sparse(&na::DMatrix::from_diagonal(&m.diagonal().map(|v| 1.0 / v)));
        let cg = ConjugateGradient::new(100, 1e-24);
        let (x, status) = cg.solve(&dense_to_sparse(&m), &b, Some(&jacobi));
        assert!(status.is_success());
        assert_relative_eq!(&m * x, b, epsilon = 1e-8);
    }

    #[test]
    fn test_iteration_cap_is_success() {
        let m = spd(10);
        let b = na::DVector::from_element(10, 1.0);
        let cg = ConjugateGradient::new(2, 1e-30);
        let (x, status) = cg.solve(&dense_to_sparse(&m), &b, None);
        assert_eq!(status.info, CgInfo::MaxIterations);
        assert_eq!(status.num_iterations, 2);
        assert!(status.is_success());
        // two steps of CG reduce the error in the energy norm
        let exact = m.clone().cholesky().unwrap().solve(&b);
        let energy = |e: &na::DVector<f64>| e.dot(&(&m * e));
        assert!(energy(&(&x - &exact)) < energy(&exact));
    }

    #[test]
    fn test_zero_rhs() {
        let m = spd(4);
        let cg = ConjugateGradient::new(10, 1e-20);
        let (x, status) = cg.solve(&dense_to_sparse(&m), &na::DVector::zeros(4), None);
        assert_eq!(status.info, CgInfo::Converged);
        assert_eq!(status.num_iterations, 0);
        assert_eq!(x, na::DVector::zeros(4));
    }

    #[test]
    fn test_invalid_input() {
        let cg = ConjugateGradient::new(10, 1e-20);
        let m = dense_to_sparse(&spd(4));

        let (_, status) = cg.solve(&m, &na::DVector::zeros(3), None);
        assert_eq!(status.info, CgInfo::InvalidInput);
        assert!(!status.is_success());

        let mut b = na::DVector::from_element(4, 1.0);
        b[2] = f64::NAN;
        let (x, status) = cg.solve(&m, &b, None);
        assert_eq!(status.info, CgInfo::InvalidInput);
        assert_eq!(x, na::DVector::zeros(4));

        let wrong_precond = SparseMatrix::allocate(3, 3);
        let (_, status) = cg.solve(&m, &na::DVector::from_element(4, 1.0), Some(&wrong_precond));
        assert_eq!(status.info, CgInfo::InvalidInput);
    }

    #[test]
    fn test_singular_system_does_not_blow_up() {
        // Zero matrix: the first search direction has no curvature.
        let m = SparseMatrix::<f64>::allocate(3, 3);
        let b = na::DVector::from_element(3, 1.0);
        let cg = ConjugateGradient::new(10, 1e-20);
        let (x, status) = cg.solve(&m, &b, None);
        assert_eq!(status.info, CgInfo::Converged);
        assert_eq!(status.num_iterations, 0);
        assert_eq!(x, na::DVector::zeros(3));
    }
}
