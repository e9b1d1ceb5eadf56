//! # Portfolio Engine
//!
//! $$
//! \mathbf{w}^\* = \operatorname{Optimize}\big(\hat\mu, \hat\Sigma, r_f\big),\qquad
//! (\hat\mu, \hat\Sigma) = P\cdot\operatorname{Forecast}(R)
//! $$
//!
//! End-to-end pipeline from a return table to an optimized allocation.

use ndarray::Array1;
use ndarray::Array2;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use super::data::ReturnSeries;
use super::estimator::Estimator;
use super::estimator::EstimatorConfig;
use super::estimator::Predictions;
use super::frontier::FrontierSweep;
use super::optimizers::PortfolioOptimizer;
use super::sqp::SolverConfig;
use super::types::AssetUniverse;
use super::types::ConstraintSet;
use super::types::FrontierPoint;
use super::types::OptimizationResult;
use crate::error::PortfolioResult;

/// Objective solved by [`PortfolioEngine::run`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Objective {
  #[default]
  MaxSharpe,
  MinVolatility,
  MaxReturn,
  MaxReturnForRisk { target_volatility: f64 },
}

/// Runtime configuration for [`PortfolioEngine`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortfolioEngineConfig {
  pub estimator: EstimatorConfig,
  /// Risk-free rate in the same units as the (annualized) expected returns.
  pub risk_free_rate: f64,
  /// Scale forecasts by `periods_per_year`.
  pub annualize: bool,
  pub periods_per_year: u32,
  pub constraints: ConstraintSet,
  pub objective: Objective,
  /// Number of frontier grid points; no frontier when `None`.
  pub frontier_points: Option<usize>,
  pub solver: SolverConfig,
}

impl Default for PortfolioEngineConfig {
  fn default() -> Self {
    Self {
      estimator: EstimatorConfig::default(),
      risk_free_rate: 0.0,
      annualize: true,
      periods_per_year: 252,
      constraints: ConstraintSet::default(),
      objective: Objective::MaxSharpe,
      frontier_points: None,
      solver: SolverConfig::default(),
    }
  }
}

/// Output of [`PortfolioEngine::run`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortfolioReport {
  pub assets: AssetUniverse,
  pub expected_returns: Array1<f64>,
  pub covariance: Array2<f64>,
  pub objective: Objective,
  pub result: OptimizationResult,
  pub frontier: Option<Vec<FrontierPoint>>,
}

impl PortfolioReport {
  /// `(asset, weight)` pairs in universe order.
  pub fn allocation(&self) -> Vec<(&str, f64)> {
    self.result.allocation(&self.assets)
  }
}

/// Which of the two reference strategies to prefer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
  MaxSharpe,
  MinVolatility,
  /// Neither dominates clearly.
  Either,
}

/// Max-Sharpe versus min-volatility allocations on the same inputs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrategyComparison {
  pub max_sharpe: OptimizationResult,
  pub min_volatility: OptimizationResult,
  /// Max-Sharpe minus min-volatility.
  pub return_difference: f64,
  pub volatility_difference: f64,
  pub sharpe_difference: f64,
  pub recommendation: Recommendation,
}

impl StrategyComparison {
  /// Sharpe advantage required to recommend the max-Sharpe allocation.
  pub const SHARPE_EDGE: f64 = 1.1;
  /// Volatility ratio below which the min-volatility allocation is recommended.
  pub const VOLATILITY_EDGE: f64 = 0.8;

  pub fn new(max_sharpe: OptimizationResult, min_volatility: OptimizationResult) -> Self {
    let sharpe_edge = Self::SHARPE_EDGE * min_volatility.sharpe_ratio;
    let recommendation = if max_sharpe.sharpe_ratio > sharpe_edge {
      Recommendation::MaxSharpe
    } else if min_volatility.volatility < Self::VOLATILITY_EDGE * max_sharpe.volatility {
      Recommendation::MinVolatility
    } else {
      Recommendation::Either
    };

    Self {
      return_difference: max_sharpe.expected_return - min_volatility.expected_return,
      volatility_difference: max_sharpe.volatility - min_volatility.volatility,
      sharpe_difference: max_sharpe.sharpe_ratio - min_volatility.sharpe_ratio,
      recommendation,
      max_sharpe,
      min_volatility,
    }
  }
}

/// Single entry point: forecast, optimize, and optionally sweep the frontier.
#[derive(Clone, Debug, Default)]
pub struct PortfolioEngine {
  config: PortfolioEngineConfig,
}

impl PortfolioEngine {
  pub fn new(config: PortfolioEngineConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &PortfolioEngineConfig {
    &self.config
  }

  /// Forecasts from the configured estimator.
  pub fn predict(&self, returns: &ReturnSeries) -> PortfolioResult<Predictions> {
    Estimator::with_config(returns.clone(), self.config.estimator)
      .get_predictions(self.config.annualize, self.config.periods_per_year)
  }

  /// Optimizer over the configured forecasts.
  pub fn optimizer(&self, returns: &ReturnSeries) -> PortfolioResult<PortfolioOptimizer> {
    let Predictions {
      assets,
      returns: mu,
      covariance,
    } = self.predict(returns)?;
    Ok(
      PortfolioOptimizer::with_assets(assets, mu, covariance, self.config.risk_free_rate)?
        .with_solver_config(self.config.solver),
    )
  }

  pub fn run(&self, returns: &ReturnSeries) -> PortfolioResult<PortfolioReport> {
    let optimizer = self.optimizer(returns)?;
    let constraints = &self.config.constraints;

    let result = match self.config.objective {
      Objective::MaxSharpe => optimizer.optimize_max_sharpe(constraints)?,
      Objective::MinVolatility => optimizer.optimize_min_volatility(constraints)?,
      Objective::MaxReturn => optimizer.optimize_max_return(constraints)?,
      Objective::MaxReturnForRisk { target_volatility } => {
        optimizer.optimize_max_return_for_risk(target_volatility, constraints)?
      }
    };

    let frontier = match self.config.frontier_points {
      Some(n_points) => {
        let points =
          FrontierSweep::new(&optimizer).par_calculate_efficient_frontier(n_points, constraints)?;
        debug!(requested = n_points, solved = points.len(), "frontier computed");
        Some(points)
      }
      None => None,
    };

    info!(
      objective = ?self.config.objective,
      expected_return = result.expected_return,
      volatility = result.volatility,
      sharpe_ratio = result.sharpe_ratio,
      success = result.optimization_success,
      "portfolio optimized"
    );

    Ok(PortfolioReport {
      assets: optimizer.assets().clone(),
      expected_returns: optimizer.expected_returns().clone(),
      covariance: optimizer.covariance().clone(),
      objective: self.config.objective,
      result,
      frontier,
    })
  }

  /// Solve both reference strategies and compare them.
  pub fn compare_strategies(&self, returns: &ReturnSeries) -> PortfolioResult<StrategyComparison> {
    let optimizer = self.optimizer(returns)?;
    let constraints = &self.config.constraints;
    Ok(StrategyComparison::new(
      optimizer.optimize_max_sharpe(constraints)?,
      optimizer.optimize_min_volatility(constraints)?,
    ))
  }
}
