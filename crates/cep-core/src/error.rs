//! Unified error types for the planning engine.
//!
//! This module provides a common error type [`CepError`] that can represent
//! errors from any part of the system. Domain-specific error types convert
//! to `CepError` for uniform handling at API boundaries.

use thiserror::Error;

/// Unified error type for all planning operations.
///
/// Variants follow the failure taxonomy of the engine: invalid input data,
/// singular network algebra, solver-level failures, and configuration
/// mistakes are kept distinguishable so callers can map them to statuses.
#[derive(Error, Debug)]
pub enum CepError {
    /// Malformed input data; the message names the offending entity.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Reduced network Laplacian not factorable (disconnected topology).
    #[error("Singular network: {0}")]
    Singular(String),

    /// Underlying LP/conic solver reported an internal failure.
    #[error("Solver error: {0}")]
    Solver(String),

    /// Network structure errors (dangling references, missing slack, ...)
    #[error("Network error: {0}")]
    Network(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic errors (for wrapping external errors)
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using CepError.
pub type CepResult<T> = Result<T, CepError>;

// Conversion from anyhow::Error
impl From<anyhow::Error> for CepError {
    fn from(err: anyhow::Error) -> Self {
        CepError::Other(err.to_string())
    }
}

impl From<String> for CepError {
    fn from(s: String) -> Self {
        CepError::Other(s)
    }
}

impl From<&str> for CepError {
    fn from(s: &str) -> Self {
        CepError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CepError::Solver("KKT factorization failed".into());
        assert!(err.to_string().contains("Solver error"));
        assert!(err.to_string().contains("KKT factorization failed"));
    }

    #[test]
    fn test_question_mark_operator() {
        fn inner() -> CepResult<()> {
            Err(CepError::InvalidInput("branch b7 has negative capacity".into()))
        }

        fn outer() -> CepResult<()> {
            inner()?;
            Ok(())
        }

        assert!(outer().is_err());
    }
}
