//! # Errors
//!
//! $$
//! \text{validation} \to \texttt{Err},\quad \text{non-convergence} \to \texttt{Ok}(\text{success}=\text{false})
//! $$
//!
//! Validation-level failures propagate to the immediate caller. Numerical
//! non-convergence is encoded on the result instead, see
//! [`crate::portfolio::OptimizationResult`].

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PortfolioError {
  /// Unrecognized forecasting, covariance or return-transform method name.
  #[error("unknown {kind} method: {name}")]
  UnknownMethod { kind: &'static str, name: String },

  /// Vector or matrix shape disagrees with the number of assets.
  #[error("dimension mismatch in {context}: expected {expected}, found {found}")]
  DimensionMismatch {
    context: &'static str,
    expected: usize,
    found: usize,
  },

  /// The same identifier appears twice in an asset universe.
  #[error("duplicate asset identifier: {0}")]
  DuplicateAsset(String),

  /// Too few return rows for the requested estimator.
  #[error("insufficient data for {method}: requires {required} rows, got {available}")]
  InsufficientData {
    method: &'static str,
    required: usize,
    available: usize,
  },

  /// Non-finite input or out-of-range estimator parameter.
  #[error("invalid parameter {name}: {reason}")]
  InvalidParameter { name: &'static str, reason: String },

  /// Weight bounds that are malformed or cannot sum to one.
  #[error("infeasible constraint set: {reason}")]
  InfeasibleConstraints { reason: String },

  /// Negative or non-finite volatility cap.
  #[error("invalid target volatility: {0}")]
  InvalidTarget(f64),

  /// Objective or gradient could not be evaluated to a finite value.
  #[error("solver breakdown: {0}")]
  Solver(String),
}

/// Standard result type for all portfolio operations.
pub type PortfolioResult<T> = Result<T, PortfolioError>;
