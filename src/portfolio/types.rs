//! # Portfolio Types
//!
//! $$
//! \mathbf{w}^\*=\arg\max_{\mathbf{w}} \frac{\mathbb E[R_p]-r_f}{\sigma_p}
//! $$
//!
//! Shared value types and result containers for portfolio optimization.

use std::collections::HashSet;

use argmin::core::TerminationReason;
use ndarray::Array1;
use serde::Deserialize;
use serde::Serialize;

use crate::error::PortfolioError;
use crate::error::PortfolioResult;

/// Tolerance used when checking that a constraint set admits a budget-feasible weight vector.
const FEASIBILITY_EPS: f64 = 1e-12;

/// Ordered, de-duplicated asset identifiers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetUniverse(Vec<String>);

impl AssetUniverse {
  /// Build a universe, rejecting repeated identifiers.
  pub fn new<I, S>(ids: I) -> PortfolioResult<Self>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
    let mut seen = HashSet::with_capacity(ids.len());
    for id in &ids {
      if !seen.insert(id.as_str()) {
        return Err(PortfolioError::DuplicateAsset(id.clone()));
      }
    }
    Ok(Self(ids))
  }

  /// Placeholder identifiers `asset_0 .. asset_{n-1}`.
  pub fn anonymous(n: usize) -> Self {
    Self((0..n).map(|i| format!("asset_{i}")).collect())
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.0.iter().map(String::as_str)
  }

  pub fn as_slice(&self) -> &[String] {
    &self.0
  }

  /// Index of `id` in universe order.
  pub fn position(&self, id: &str) -> Option<usize> {
    self.0.iter().position(|a| a == id)
  }
}

/// Per-asset box constraints shared by every solver.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSet {
  /// Lower weight bound. Ignored when `long_only` is false.
  pub min_weight: f64,
  /// Upper weight bound. Mirrored to `-max_weight` when `long_only` is false.
  pub max_weight: f64,
  /// Disallow short positions.
  pub long_only: bool,
}

impl Default for ConstraintSet {
  fn default() -> Self {
    Self {
      min_weight: 0.0,
      max_weight: 1.0,
      long_only: true,
    }
  }
}

impl ConstraintSet {
  /// Long-only set with explicit bounds.
  pub fn long_only(min_weight: f64, max_weight: f64) -> Self {
    Self {
      min_weight,
      max_weight,
      long_only: true,
    }
  }

  /// Sign-unconstrained set with symmetric bounds `[-max_weight, max_weight]`.
  pub fn long_short(max_weight: f64) -> Self {
    Self {
      min_weight: 0.0,
      max_weight,
      long_only: false,
    }
  }

  /// Active `(lower, upper)` bound pair.
  pub fn bounds(&self) -> (f64, f64) {
    if self.long_only {
      (self.min_weight, self.max_weight)
    } else {
      (-self.max_weight, self.max_weight)
    }
  }

  /// Check that some weight vector of length `n` sums to one inside the box.
  pub fn validate(&self, n: usize) -> PortfolioResult<()> {
    let (lo, hi) = self.bounds();
    if !lo.is_finite() || !hi.is_finite() {
      return Err(PortfolioError::InfeasibleConstraints {
        reason: format!("bounds must be finite, got [{lo}, {hi}]"),
      });
    }
    if lo > hi {
      return Err(PortfolioError::InfeasibleConstraints {
        reason: format!("lower bound {lo} exceeds upper bound {hi}"),
      });
    }
    let n = n as f64;
    if lo * n > 1.0 + FEASIBILITY_EPS {
      return Err(PortfolioError::InfeasibleConstraints {
        reason: format!("{n} assets at lower bound {lo} exceed full investment"),
      });
    }
    if hi * n < 1.0 - FEASIBILITY_EPS {
      return Err(PortfolioError::InfeasibleConstraints {
        reason: format!("{n} assets at upper bound {hi} cannot reach full investment"),
      });
    }
    Ok(())
  }
}

/// Return, risk and Sharpe ratio of a fixed weight vector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
  /// `w · mu`
  pub expected_return: f64,
  /// `sqrt(w' Sigma w)`
  pub volatility: f64,
  /// `(expected_return - risk_free) / volatility`, zero when volatility is exactly zero.
  pub sharpe_ratio: f64,
}

/// How a solve terminated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverStatus {
  Converged,
  MaxItersReached,
  /// Solver stopped early without meeting the convergence test.
  Stalled(String),
}

impl From<TerminationReason> for SolverStatus {
  fn from(reason: TerminationReason) -> Self {
    match reason {
      TerminationReason::SolverConverged => Self::Converged,
      TerminationReason::MaxItersReached => Self::MaxItersReached,
      TerminationReason::SolverExit(msg) => Self::Stalled(msg),
      other => Self::Stalled(format!("{other:?}")),
    }
  }
}

/// Output of a single optimization run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
  /// Final portfolio weights in universe order.
  pub weights: Array1<f64>,
  /// Model expected portfolio return (annualized if inputs are annualized).
  pub expected_return: f64,
  /// Model portfolio volatility.
  pub volatility: f64,
  /// Sharpe ratio computed as `(expected_return - risk_free) / volatility`.
  pub sharpe_ratio: f64,
  /// False when the solver stopped before its convergence test passed.
  pub optimization_success: bool,
  pub status: SolverStatus,
  pub iterations: u64,
}

impl OptimizationResult {
  pub fn metrics(&self) -> PortfolioMetrics {
    PortfolioMetrics {
      expected_return: self.expected_return,
      volatility: self.volatility,
      sharpe_ratio: self.sharpe_ratio,
    }
  }

  /// Pair weights with their asset identifiers.
  pub fn allocation<'a>(&'a self, assets: &'a AssetUniverse) -> Vec<(&'a str, f64)> {
    assets.iter().zip(self.weights.iter().copied()).collect()
  }
}

/// One admissible solution on the risk/return curve.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrontierPoint {
  pub volatility: f64,
  pub expected_return: f64,
  pub sharpe_ratio: f64,
}

impl From<&OptimizationResult> for FrontierPoint {
  fn from(res: &OptimizationResult) -> Self {
    Self {
      volatility: res.volatility,
      expected_return: res.expected_return,
      sharpe_ratio: res.sharpe_ratio,
    }
  }
}

/// Per-grid-point outcome of a frontier sweep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FrontierOutcome {
  Solved {
    target_volatility: f64,
    point: FrontierPoint,
  },
  Skipped {
    target_volatility: f64,
    reason: String,
  },
}

impl FrontierOutcome {
  pub fn target_volatility(&self) -> f64 {
    match self {
      Self::Solved {
        target_volatility, ..
      }
      | Self::Skipped {
        target_volatility, ..
      } => *target_volatility,
    }
  }

  pub fn point(&self) -> Option<FrontierPoint> {
    match self {
      Self::Solved { point, .. } => Some(*point),
      Self::Skipped { .. } => None,
    }
  }

  pub fn is_solved(&self) -> bool {
    matches!(self, Self::Solved { .. })
  }
}
