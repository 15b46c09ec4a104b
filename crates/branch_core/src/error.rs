//! Typed failure categories.
//!
//! Functions in this crate return `anyhow::Result`; the variants below are
//! raised through it when a caller may want to match on the failure, and can
//! be recovered with `err.downcast_ref::<ContinuationError>()`.

use thiserror::Error;

use crate::continuation::types::CriticalKind;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContinuationError {
    #[error("invalid continuation settings: {0}")]
    InvalidConfig(String),
    #[error("unknown linearization mode `{given}`; expected one of {allowed:?}")]
    UnknownLinearization {
        given: String,
        allowed: &'static [&'static str],
    },
    #[error("index {index} out of range for sequence of length {len}")]
    OutOfRange { index: usize, len: usize },
    #[error("eigenvectors were not saved for step {0}; enable `save_eigenvectors`")]
    EigenvectorsNotSaved(usize),
    #[error("critical point kind mismatch: expected {expected:?}, found {found:?}")]
    KindMismatch {
        expected: CriticalKind,
        found: CriticalKind,
    },
    #[error("operator not supported by this solver: {0}")]
    UnsupportedOperator(&'static str),
    #[error("a matrix-free jacobian needs a user-supplied adjoint")]
    AdjointRequired,
    #[error("eigen solver failed: {0}")]
    EigenSolver(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn errors_survive_anyhow_round_trip() {
        let err = anyhow!(ContinuationError::OutOfRange { index: 7, len: 3 });
        assert_eq!(
            err.downcast_ref::<ContinuationError>(),
            Some(&ContinuationError::OutOfRange { index: 7, len: 3 })
        );
        assert!(format!("{err}").contains("index 7"));
    }
}
