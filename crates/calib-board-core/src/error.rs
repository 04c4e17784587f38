use crate::optimizer::OptimizerError;
use crate::solver::PoseSolverError;

/// Errors surfaced by the calibration pipeline.
///
/// Per-image failures are reported as values and never abort a calibration
/// run; only `finalize`-level failures are fatal to the caller.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("invalid image: wrong pixel layout or zero-sized dimensions")]
    InvalidImage,
    #[error("no calibration board detected in the image")]
    NoBoardDetected,
    #[error("finalize called without any successful observation")]
    InsufficientObservations,
    #[error("camera optimizer failed: {0}")]
    OptimizerFailure(#[from] OptimizerError),
    #[error("arithmetic failure: {0}")]
    ArithmeticError(&'static str),
}

impl From<PoseSolverError> for CalibrationError {
    fn from(error: PoseSolverError) -> Self {
        match error {
            PoseSolverError::InsufficientCorrespondences { .. } => CalibrationError::NoBoardDetected,
            PoseSolverError::NoSolutionBelowThreshold => CalibrationError::NoBoardDetected,
            PoseSolverError::Degenerate(reason) => CalibrationError::ArithmeticError(reason),
        }
    }
}
