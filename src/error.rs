//! Error type shared by every part of the solver.

use std::time::Duration;

use thiserror::Error;

use crate::params::EwaldParams;

/// Errors raised while configuring, tuning, or evaluating the P3M solver.
#[derive(Error, Debug, Clone)]
pub enum P3mError {
    /// Non-positive box edges, or a cutoff that breaks the minimum-image convention.
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Unsupported mesh size or interpolation order, or another bad parameter.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The search space was exhausted without meeting the accuracy target.
    #[error(
        "Tuning failed: best predicted error {best_error:.3e} does not reach target {target:.3e}"
    )]
    TuningFailed {
        target: f64,
        best_error: f64,
        best_params: Option<EwaldParams>,
    },

    /// The trial or wall-clock budget ran out. Partial results are discarded.
    #[error("Tuning timed out after {trials} trials ({elapsed:?})")]
    TuningTimeout { trials: usize, elapsed: Duration },

    /// Force evaluation was requested before tuning, or after the tuned state was invalidated.
    #[error("Solver is not tuned: {0}")]
    NotTuned(String),

    /// Inconsistent caller input, e.g. position and charge slices of different lengths.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Encoding or decoding a persisted tuning result failed.
    #[error("Persistence error: {0}")]
    Persist(String),
}

impl P3mError {
    pub fn geometry(msg: impl Into<String>) -> Self {
        Self::InvalidGeometry(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_geometry() {
        let err = P3mError::geometry("edge x is -1");
        assert_eq!(err.to_string(), "Invalid geometry: edge x is -1");
    }

    #[test]
    fn display_tuning_failed() {
        let err = P3mError::TuningFailed {
            target: 1e-30,
            best_error: 2.5e-9,
            best_params: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("2.500e-9"));
        assert!(msg.contains("1.000e-30"));
    }

    #[test]
    fn display_timeout() {
        let err = P3mError::TuningTimeout {
            trials: 12,
            elapsed: Duration::from_millis(5),
        };
        assert!(err.to_string().contains("12 trials"));
    }
}
