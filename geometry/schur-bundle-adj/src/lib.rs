//! Sparse bundle adjustment for structure from motion.
//!
//! Cameras (single focal length, two radial distortion terms, rotation and
//! translation) and 3D world points are refined jointly so that the projected
//! points match the observed image points in the least-squares sense. The
//! damped normal equations are solved by eliminating the points with a Schur
//! complement and solving the reduced camera system with a preconditioned
//! conjugate gradient. A Levenberg-Marquardt trust-region loop drives the
//! iteration, see [BundleAdjuster].
//!
//! Residuals and Jacobians are evaluated in parallel over the observations
//! with `rayon`. Everything else runs on the calling thread.

pub mod cg;
pub mod evaluate;
pub mod lm;
pub mod model;
pub mod options;
pub mod schur;
pub mod sparse;

#[cfg(test)]
mod test_scene;

pub use evaluate::{evaluate_jacobian, evaluate_residuals, mean_squared_error};
pub use lm::{BundleAdjuster, LmState, Report};
pub use model::{Camera, NUM_CAM_PARAMS, NUM_POINT_PARAMS, Observation, Point3D};
pub use options::{BundleMode, Options};
pub use sparse::{SparseMatrix, Triplet};

/// The bundle adjustment error type.
///
/// [Error::InconsistentData] and [Error::Structural] indicate a caller or
/// programming error and abort the operation. [Error::SolverFailed] is the
/// only recoverable variant: the optimizer treats it as an unsuccessful
/// iteration and continues.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("inconsistent data: {0}")]
    InconsistentData(String),
    #[error("structural precondition violated: {0}")]
    Structural(String),
    #[error("linear solver failed: {reason} (after {num_cg_iterations} CG iterations)")]
    SolverFailed {
        reason: &'static str,
        num_cg_iterations: usize,
    },
    #[error("could not build worker thread pool: {source}")]
    ThreadPool {
        #[from]
        source: rayon::ThreadPoolBuildError,
    },
    #[error("TOML deserialization error: {source}")]
    Config {
        #[from]
        source: toml::de::Error,
    },
}

impl Error {
    /// Whether the optimizer may continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::SolverFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
