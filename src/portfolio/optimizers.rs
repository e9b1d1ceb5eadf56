//! # Portfolio Optimizers
//!
//! $$
//! \max_{\mathbf{w}}\ \frac{\mathbf{w}^\top\mu-r_f}{\sqrt{\mathbf{w}^\top\Sigma\mathbf{w}}}
//! \quad\text{s.t.}\quad \mathbf 1^\top\mathbf{w}=1,\ \ l\le w_i\le u
//! $$
//!
//! Mean-variance optimizer over a fixed `(mu, Sigma, r_f)` triple.

use ndarray::Array1;
use ndarray::Array2;
use tracing::warn;

use super::data::is_symmetric;
use super::data::symmetrize;
use super::objectives::ConstrainedProblem;
use super::objectives::MeanVarianceModel;
use super::objectives::NegativeReturn;
use super::objectives::NegativeSharpe;
use super::objectives::ReturnUnderRiskCap;
use super::objectives::Volatility;
use super::sqp::SolverConfig;
use super::sqp::Sqp;
use super::types::AssetUniverse;
use super::types::ConstraintSet;
use super::types::OptimizationResult;
use super::types::PortfolioMetrics;
use super::types::SolverStatus;
use crate::error::PortfolioError;
use crate::error::PortfolioResult;

/// Relative tolerance below which a covariance matrix counts as symmetric.
const SYMMETRY_TOL: f64 = 1e-10;

/// Immutable optimizer built from expected returns, a covariance matrix and a risk-free rate.
#[derive(Clone, Debug)]
pub struct PortfolioOptimizer {
  assets: AssetUniverse,
  model: MeanVarianceModel,
  solver: SolverConfig,
}

impl PortfolioOptimizer {
  /// Validate shapes and repair an asymmetric covariance by averaging it with its transpose.
  pub fn new(
    expected_returns: Array1<f64>,
    covariance: Array2<f64>,
    risk_free_rate: f64,
  ) -> PortfolioResult<Self> {
    let assets = AssetUniverse::anonymous(expected_returns.len());
    Self::with_assets(assets, expected_returns, covariance, risk_free_rate)
  }

  /// Same as [`Self::new`] with named assets.
  pub fn with_assets(
    assets: AssetUniverse,
    expected_returns: Array1<f64>,
    covariance: Array2<f64>,
    risk_free_rate: f64,
  ) -> PortfolioResult<Self> {
    let n = expected_returns.len();
    if n == 0 {
      return Err(PortfolioError::InvalidParameter {
        name: "expected_returns",
        reason: "at least one asset is required".to_string(),
      });
    }
    if assets.len() != n {
      return Err(PortfolioError::DimensionMismatch {
        context: "asset universe",
        expected: n,
        found: assets.len(),
      });
    }
    if covariance.nrows() != n || covariance.ncols() != n {
      return Err(PortfolioError::DimensionMismatch {
        context: "covariance matrix",
        expected: n,
        found: if covariance.nrows() != n {
          covariance.nrows()
        } else {
          covariance.ncols()
        },
      });
    }
    if expected_returns.iter().chain(covariance.iter()).any(|v| !v.is_finite())
      || !risk_free_rate.is_finite()
    {
      return Err(PortfolioError::InvalidParameter {
        name: "inputs",
        reason: "expected returns, covariance and risk-free rate must be finite".to_string(),
      });
    }

    let covariance = if is_symmetric(&covariance, SYMMETRY_TOL) {
      covariance
    } else {
      warn!(n_assets = n, "covariance matrix is not symmetric, averaging with its transpose");
      symmetrize(&covariance)
    };

    Ok(Self {
      assets,
      model: MeanVarianceModel {
        mu: expected_returns,
        cov: covariance,
        risk_free: risk_free_rate,
      },
      solver: SolverConfig::default(),
    })
  }

  /// Replace the default solver settings.
  pub fn with_solver_config(mut self, solver: SolverConfig) -> Self {
    self.solver = solver;
    self
  }

  pub fn assets(&self) -> &AssetUniverse {
    &self.assets
  }

  pub fn n_assets(&self) -> usize {
    self.model.mu.len()
  }

  pub fn expected_returns(&self) -> &Array1<f64> {
    &self.model.mu
  }

  /// Covariance after symmetrization.
  pub fn covariance(&self) -> &Array2<f64> {
    &self.model.cov
  }

  pub fn risk_free_rate(&self) -> f64 {
    self.model.risk_free
  }

  /// Maximize `(w'mu - r_f) / sigma_p` from an equal-weight start.
  pub fn optimize_max_sharpe(
    &self,
    constraints: &ConstraintSet,
  ) -> PortfolioResult<OptimizationResult> {
    self.solve("max_sharpe", &NegativeSharpe(&self.model), constraints)
  }

  /// Minimize portfolio volatility; expected returns do not enter.
  pub fn optimize_min_volatility(
    &self,
    constraints: &ConstraintSet,
  ) -> PortfolioResult<OptimizationResult> {
    self.solve("min_volatility", &Volatility(&self.model), constraints)
  }

  /// Ignores risk; the solution concentrates in the highest-return assets up to `max_weight`.
  pub fn optimize_max_return(
    &self,
    constraints: &ConstraintSet,
  ) -> PortfolioResult<OptimizationResult> {
    self.solve("max_return", &NegativeReturn(&self.model), constraints)
  }

  /// Maximize expected return subject to `volatility(w) <= target_volatility`.
  pub fn optimize_max_return_for_risk(
    &self,
    target_volatility: f64,
    constraints: &ConstraintSet,
  ) -> PortfolioResult<OptimizationResult> {
    if !target_volatility.is_finite() || target_volatility < 0.0 {
      return Err(PortfolioError::InvalidTarget(target_volatility));
    }
    let problem = ReturnUnderRiskCap {
      model: &self.model,
      target_volatility,
    };
    self.solve("max_return_for_risk", &problem, constraints)
  }

  /// Metrics of an arbitrary weight vector, no solve involved.
  pub fn get_portfolio_statistics(
    &self,
    weights: &Array1<f64>,
  ) -> PortfolioResult<PortfolioMetrics> {
    if weights.len() != self.n_assets() {
      return Err(PortfolioError::DimensionMismatch {
        context: "weight vector",
        expected: self.n_assets(),
        found: weights.len(),
      });
    }
    Ok(self.model.metrics(weights))
  }

  fn solve<P>(
    &self,
    objective: &'static str,
    problem: &P,
    constraints: &ConstraintSet,
  ) -> PortfolioResult<OptimizationResult>
  where
    P: ConstrainedProblem,
  {
    let n = self.n_assets();
    constraints.validate(n)?;

    let x0 = Array1::from_elem(n, 1.0 / n as f64);
    let outcome = Sqp::new(constraints.bounds(), self.solver).minimize(problem, x0)?;

    let metrics = self.model.metrics(&outcome.x);
    let optimization_success = outcome.converged();
    if !optimization_success {
      warn!(
        objective,
        iterations = outcome.iterations,
        termination = ?outcome.termination,
        max_violation = outcome.max_violation,
        "optimization did not converge, returning last iterate"
      );
    }

    Ok(OptimizationResult {
      weights: outcome.x,
      expected_return: metrics.expected_return,
      volatility: metrics.volatility,
      sharpe_ratio: metrics.sharpe_ratio,
      optimization_success,
      status: SolverStatus::from(outcome.termination),
      iterations: outcome.iterations,
    })
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use ndarray::array;
  use tracing_test::traced_test;

  use super::*;

  fn optimizer() -> PortfolioOptimizer {
    PortfolioOptimizer::new(
      array![0.10, 0.15, 0.12],
      array![
        [0.04, 0.01, 0.015],
        [0.01, 0.09, 0.02],
        [0.015, 0.02, 0.06]
      ],
      0.02,
    )
    .unwrap()
  }

  fn assert_budget_and_bounds(res: &OptimizationResult, lo: f64, hi: f64) {
    assert_abs_diff_eq!(res.weights.sum(), 1.0, epsilon = 1e-6);
    for &w in res.weights.iter() {
      assert!(w >= lo - 1e-6 && w <= hi + 1e-6, "weight {w} outside [{lo}, {hi}]");
    }
  }

  #[test]
  fn max_sharpe_converges_with_consistent_metrics() {
    let opt = optimizer();
    let res = opt.optimize_max_sharpe(&ConstraintSet::default()).unwrap();

    assert!(res.optimization_success);
    assert_eq!(res.status, SolverStatus::Converged);
    assert_budget_and_bounds(&res, 0.0, 1.0);

    let w = &res.weights;
    let ret = w.dot(opt.expected_returns());
    let vol = w.dot(&opt.covariance().dot(w)).sqrt();
    assert_abs_diff_eq!(res.sharpe_ratio, (ret - 0.02) / vol, epsilon = 1e-6);
  }

  #[test]
  fn max_sharpe_beats_equal_weight_and_min_volatility() {
    let opt = optimizer();
    let c = ConstraintSet::default();
    let ms = opt.optimize_max_sharpe(&c).unwrap();
    let mv = opt.optimize_min_volatility(&c).unwrap();
    let eq = opt
      .get_portfolio_statistics(&Array1::from_elem(3, 1.0 / 3.0))
      .unwrap();

    assert!(ms.sharpe_ratio >= eq.sharpe_ratio - 1e-9);
    assert!(ms.sharpe_ratio >= mv.sharpe_ratio - 1e-9);
    assert!(mv.volatility <= ms.volatility + 1e-9);
    assert!(mv.volatility <= eq.volatility + 1e-9);
  }

  #[test]
  fn min_volatility_matches_closed_form_interior_solution() {
    let opt = optimizer();
    let res = opt.optimize_min_volatility(&ConstraintSet::default()).unwrap();
    assert!(res.optimization_success);

    // Sigma^{-1} 1 / (1' Sigma^{-1} 1) is strictly positive for this covariance
    let inv = nalgebra::DMatrix::from_row_slice(
      3,
      3,
      &[0.04, 0.01, 0.015, 0.01, 0.09, 0.02, 0.015, 0.02, 0.06],
    )
    .try_inverse()
    .unwrap();
    let raw = inv * nalgebra::DVector::from_element(3, 1.0);
    let total = raw.sum();
    for i in 0..3 {
      assert_abs_diff_eq!(res.weights[i], raw[i] / total, epsilon = 1e-4);
    }
  }

  /// `A A' / k + 0.01 I` with uniform expected returns.
  fn random_optimizer(n: usize, seed: u64) -> PortfolioOptimizer {
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::Normal;
    use rand_distr::Uniform;

    let mut rng = StdRng::seed_from_u64(seed);
    let k = 2 * n;
    let a = Array2::random_using((n, k), Normal::new(0.0, 0.2).unwrap(), &mut rng);
    let cov = a.dot(&a.t()) / k as f64 + Array2::<f64>::eye(n) * 0.01;
    let mu = Array1::random_using(n, Uniform::new(0.02, 0.15), &mut rng);
    PortfolioOptimizer::new(mu, cov, 0.02).unwrap()
  }

  /// Long-only minimum variance solved directly as one QP.
  fn reference_min_variance(opt: &PortfolioOptimizer) -> Array1<f64> {
    use nalgebra::DMatrix;
    use nalgebra::DVector;

    use crate::portfolio::sqp::DenseQp;

    let n = opt.n_assets();
    let cov = opt.covariance();
    let mut a_in = DMatrix::<f64>::zeros(2 * n, n);
    for i in 0..n {
      a_in[(i, i)] = -1.0;
      a_in[(n + i, i)] = 1.0;
    }
    let mut b_in = DVector::<f64>::zeros(2 * n);
    b_in.rows_mut(n, n).fill(1.0);

    let qp = DenseQp {
      p: DMatrix::from_fn(n, n, |i, j| 2.0 * cov[[i, j]]),
      q: DVector::zeros(n),
      a_eq: DMatrix::from_element(1, n, 1.0),
      b_eq: DVector::from_element(1, 1.0),
      a_in,
      b_in,
    };
    let solution = qp.solve().unwrap_or_else(|e| panic!("{e:?}"));
    solution.z.iter().copied().collect()
  }

  #[test]
  fn min_volatility_reaches_kkt_point_on_random_universes() {
    for (n, seed) in [(10, 1), (25, 2), (50, 3), (50, 4)] {
      let opt = random_optimizer(n, seed);
      let res = opt.optimize_min_volatility(&ConstraintSet::default()).unwrap();
      assert!(res.optimization_success, "n={n} stopped with {:?}", res.status);
      assert_budget_and_bounds(&res, 0.0, 1.0);

      let reference = reference_min_variance(&opt);
      let ref_vol = opt.get_portfolio_statistics(&reference).unwrap().volatility;
      assert_abs_diff_eq!(res.volatility, ref_vol, epsilon = 1e-7);
      for i in 0..n {
        assert_abs_diff_eq!(res.weights[i], reference[i], epsilon = 1e-3);
      }

      // d vol / d w_i equals the volatility on the support and exceeds it off the support
      let sigma = res.volatility;
      let grad = opt.covariance().dot(&res.weights) / sigma;
      for i in 0..n {
        let scaled = grad[i] / sigma - 1.0;
        if reference[i] > 1e-6 {
          assert!(scaled.abs() <= 2e-2, "n={n} asset {i}: stationarity residual {scaled}");
        } else {
          assert!(scaled >= -2e-2, "n={n} asset {i}: multiplier sign {scaled}");
        }
      }
    }
  }

  #[test]
  fn max_return_concentrates_in_best_asset() {
    let opt = optimizer();
    let res = opt.optimize_max_return(&ConstraintSet::default()).unwrap();
    assert_abs_diff_eq!(res.weights[1], 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(res.expected_return, 0.15, epsilon = 1e-6);

    let capped = opt
      .optimize_max_return(&ConstraintSet::long_only(0.0, 0.5))
      .unwrap();
    assert_abs_diff_eq!(capped.weights[1], 0.5, epsilon = 1e-6);
    assert_abs_diff_eq!(capped.weights[2], 0.5, epsilon = 1e-6);
    assert_budget_and_bounds(&capped, 0.0, 0.5);
  }

  #[test]
  fn max_return_for_risk_respects_target() {
    let opt = optimizer();
    let res = opt
      .optimize_max_return_for_risk(0.20, &ConstraintSet::default())
      .unwrap();
    assert!(res.volatility <= 0.21);
    assert_budget_and_bounds(&res, 0.0, 1.0);

    let tight = opt
      .optimize_max_return_for_risk(0.17, &ConstraintSet::default())
      .unwrap();
    assert!(tight.volatility <= 0.17 + 1e-4);
    assert!(tight.expected_return <= res.expected_return + 1e-9);
  }

  #[test]
  fn bounded_max_sharpe_stays_in_box() {
    let opt = optimizer();
    let res = opt
      .optimize_max_sharpe(&ConstraintSet::long_only(0.1, 0.5))
      .unwrap();
    assert_budget_and_bounds(&res, 0.1, 0.5);
  }

  #[test]
  fn long_short_allows_negative_weights() {
    let opt = PortfolioOptimizer::new(
      array![0.02, 0.12],
      array![[0.04, 0.035], [0.035, 0.04]],
      0.0,
    )
    .unwrap();
    let res = opt
      .optimize_max_sharpe(&ConstraintSet::long_short(2.0))
      .unwrap();
    assert_budget_and_bounds(&res, -2.0, 2.0);
    assert!(res.weights[0] < 0.0);
  }

  #[test]
  fn single_asset_is_trivially_optimal() {
    let opt = PortfolioOptimizer::new(array![0.08], array![[0.04]], 0.02).unwrap();
    let res = opt.optimize_max_sharpe(&ConstraintSet::default()).unwrap();
    assert!(res.optimization_success);
    assert_abs_diff_eq!(res.weights[0], 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(res.volatility, 0.2, epsilon = 1e-12);
  }

  #[test]
  fn portfolio_statistics_match_definitions() {
    let opt = optimizer();
    let single = opt.get_portfolio_statistics(&array![1.0, 0.0, 0.0]).unwrap();
    assert_eq!(single.volatility, 0.04_f64.sqrt());

    let eq = opt
      .get_portfolio_statistics(&Array1::from_elem(3, 1.0 / 3.0))
      .unwrap();
    assert_abs_diff_eq!(eq.expected_return, (0.10 + 0.15 + 0.12) / 3.0, epsilon = 1e-12);

    assert!(matches!(
      opt.get_portfolio_statistics(&array![0.5, 0.5]),
      Err(PortfolioError::DimensionMismatch { .. })
    ));
  }

  #[test]
  fn invalid_inputs_are_rejected() {
    let opt = optimizer();
    assert_eq!(
      opt
        .optimize_max_return_for_risk(-0.1, &ConstraintSet::default())
        .unwrap_err(),
      PortfolioError::InvalidTarget(-0.1)
    );
    assert!(matches!(
      opt.optimize_max_sharpe(&ConstraintSet::long_only(0.5, 1.0)),
      Err(PortfolioError::InfeasibleConstraints { .. })
    ));
    assert!(matches!(
      PortfolioOptimizer::new(array![0.1, 0.2], Array2::eye(3), 0.0),
      Err(PortfolioError::DimensionMismatch { .. })
    ));
  }

  #[test]
  #[traced_test]
  fn asymmetric_covariance_is_repaired() {
    let opt = PortfolioOptimizer::new(
      array![0.1, 0.2],
      array![[0.04, 0.012], [0.008, 0.09]],
      0.0,
    )
    .unwrap();
    assert_abs_diff_eq!(opt.covariance()[[0, 1]], 0.01, epsilon = 1e-15);
    assert_eq!(opt.covariance()[[0, 1]], opt.covariance()[[1, 0]]);
    assert!(logs_contain("not symmetric"));
  }

  #[test]
  #[traced_test]
  fn non_convergence_is_flagged_not_raised() {
    let opt = optimizer().with_solver_config(SolverConfig {
      max_iters: 1,
      ..SolverConfig::default()
    });
    let res = opt.optimize_max_sharpe(&ConstraintSet::default()).unwrap();
    assert!(!res.optimization_success);
    assert_eq!(res.status, SolverStatus::MaxItersReached);
    assert_abs_diff_eq!(res.weights.sum(), 1.0, epsilon = 1e-9);
    assert!(logs_contain("did not converge"));
  }

  #[test]
  fn result_serializes_round_trip() {
    let res = optimizer()
      .optimize_min_volatility(&ConstraintSet::default())
      .unwrap();
    let json = serde_json::to_string(&res).unwrap();
    let back: OptimizationResult = serde_json::from_str(&json).unwrap();
    assert_eq!(back, res);
  }
}
