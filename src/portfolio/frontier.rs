//! # Efficient Frontier
//!
//! $$
//! \sigma_k = \sigma_{\min} + \frac{k}{n-1}\left(2\,\sigma_{\mathrm{MS}} - \sigma_{\min}\right),
//! \qquad \mu_k = \max_{\mathbf w}\ \mathbf w^\top\mu\ \text{ s.t. }\ \sigma_p(\mathbf w)\le\sigma_k
//! $$
//!
//! Sweep of return-maximizing solves over a grid of volatility caps.

use rayon::prelude::*;
use tracing::debug;

use super::optimizers::PortfolioOptimizer;
use super::types::ConstraintSet;
use super::types::FrontierOutcome;
use super::types::FrontierPoint;
use crate::error::PortfolioResult;

/// Upper end of the volatility grid as a multiple of the max-Sharpe volatility.
pub const FRONTIER_VOLATILITY_MULTIPLIER: f64 = 2.0;

/// A solved point whose realized volatility exceeds its cap by more than this is dropped.
pub const TARGET_TOLERANCE: f64 = 1e-4;

/// Drives repeated [`PortfolioOptimizer::optimize_max_return_for_risk`] calls.
#[derive(Clone, Copy, Debug)]
pub struct FrontierSweep<'a> {
  optimizer: &'a PortfolioOptimizer,
}

impl<'a> FrontierSweep<'a> {
  pub fn new(optimizer: &'a PortfolioOptimizer) -> Self {
    Self { optimizer }
  }

  /// `n_points` evenly spaced caps from the min-volatility anchor to twice the max-Sharpe one.
  pub fn volatility_grid(
    &self,
    n_points: usize,
    constraints: &ConstraintSet,
  ) -> PortfolioResult<Vec<f64>> {
    let min_vol = self.optimizer.optimize_min_volatility(constraints)?;
    let max_sharpe = self.optimizer.optimize_max_sharpe(constraints)?;
    let lo = min_vol.volatility;
    let hi = FRONTIER_VOLATILITY_MULTIPLIER * max_sharpe.volatility;

    debug!(n_points, lo, hi, "frontier volatility grid");

    Ok(match n_points {
      0 => Vec::new(),
      1 => vec![lo],
      _ => {
        let step = (hi - lo) / (n_points - 1) as f64;
        (0..n_points).map(|k| lo + step * k as f64).collect()
      }
    })
  }

  /// Per-grid-point outcomes in grid order, skipped points included.
  pub fn sweep(
    &self,
    n_points: usize,
    constraints: &ConstraintSet,
  ) -> PortfolioResult<Vec<FrontierOutcome>> {
    let grid = self.volatility_grid(n_points, constraints)?;
    Ok(
      grid
        .into_iter()
        .map(|target| self.solve_point(target, constraints))
        .collect(),
    )
  }

  /// Same as [`Self::sweep`] with the grid solved on the rayon pool.
  pub fn par_sweep(
    &self,
    n_points: usize,
    constraints: &ConstraintSet,
  ) -> PortfolioResult<Vec<FrontierOutcome>> {
    let grid = self.volatility_grid(n_points, constraints)?;
    Ok(
      grid
        .into_par_iter()
        .map(|target| self.solve_point(target, constraints))
        .collect(),
    )
  }

  pub fn calculate_efficient_frontier(
    &self,
    n_points: usize,
    constraints: &ConstraintSet,
  ) -> PortfolioResult<Vec<FrontierPoint>> {
    Ok(solved_points(self.sweep(n_points, constraints)?))
  }

  pub fn par_calculate_efficient_frontier(
    &self,
    n_points: usize,
    constraints: &ConstraintSet,
  ) -> PortfolioResult<Vec<FrontierPoint>> {
    Ok(solved_points(self.par_sweep(n_points, constraints)?))
  }

  fn solve_point(&self, target_volatility: f64, constraints: &ConstraintSet) -> FrontierOutcome {
    let outcome = match self
      .optimizer
      .optimize_max_return_for_risk(target_volatility, constraints)
    {
      Err(err) => FrontierOutcome::Skipped {
        target_volatility,
        reason: err.to_string(),
      },
      Ok(res) if res.volatility > target_volatility + TARGET_TOLERANCE => {
        FrontierOutcome::Skipped {
          target_volatility,
          reason: format!(
            "infeasible target: realized volatility {} exceeds cap",
            res.volatility
          ),
        }
      }
      Ok(res) => FrontierOutcome::Solved {
        target_volatility,
        point: FrontierPoint::from(&res),
      },
    };

    if let FrontierOutcome::Skipped { reason, .. } = &outcome {
      debug!(target_volatility, reason = reason.as_str(), "frontier point skipped");
    }
    outcome
  }
}

/// Drop skipped outcomes, keeping grid order.
pub fn solved_points(outcomes: Vec<FrontierOutcome>) -> Vec<FrontierPoint> {
  outcomes.iter().filter_map(FrontierOutcome::point).collect()
}

impl PortfolioOptimizer {
  pub fn calculate_efficient_frontier(
    &self,
    n_points: usize,
    constraints: &ConstraintSet,
  ) -> PortfolioResult<Vec<FrontierPoint>> {
    FrontierSweep::new(self).calculate_efficient_frontier(n_points, constraints)
  }
}

#[cfg(test)]
mod tests {
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

  #[test]
  fn frontier_is_ordered_and_within_targets() {
    let opt = optimizer();
    let c = ConstraintSet::default();
    let outcomes = FrontierSweep::new(&opt).sweep(20, &c).unwrap();
    assert_eq!(outcomes.len(), 20);

    let targets: Vec<f64> = outcomes.iter().map(FrontierOutcome::target_volatility).collect();
    assert!(targets.windows(2).all(|w| w[0] <= w[1]));

    for o in &outcomes {
      if let Some(p) = o.point() {
        assert!(p.volatility <= o.target_volatility() + TARGET_TOLERANCE);
      }
    }

    let points = solved_points(outcomes);
    assert!(points.len() >= 19);
    for w in points.windows(2) {
      assert!(
        w[1].expected_return >= w[0].expected_return - 1e-6,
        "frontier return falls from {} to {}",
        w[0].expected_return,
        w[1].expected_return
      );
    }
  }

  #[test]
  fn grid_points_converge_onto_their_cap() {
    let opt = optimizer();
    let c = ConstraintSet::default();
    let grid = FrontierSweep::new(&opt).volatility_grid(30, &c).unwrap();
    // the riskiest asset alone is the unconstrained return maximizer
    let max_return_vol = 0.3;

    for (k, &target) in grid.iter().enumerate().skip(1) {
      let res = opt.optimize_max_return_for_risk(target, &c).unwrap();
      assert!(
        res.optimization_success,
        "point {k} (target {target}) stopped with {:?}",
        res.status
      );
      assert!(res.volatility <= target + 1e-6);
      if target < max_return_vol - 1e-3 {
        assert!(
          (res.volatility - target).abs() <= TARGET_TOLERANCE,
          "point {k}: volatility {} off cap {target}",
          res.volatility
        );
      } else {
        approx::assert_abs_diff_eq!(res.expected_return, 0.15, epsilon = 1e-6);
      }
    }

    let points = opt.calculate_efficient_frontier(30, &c).unwrap();
    assert!(points.len() >= 29);
  }

  #[test]
  fn grid_spans_min_vol_to_twice_max_sharpe_vol() {
    let opt = optimizer();
    let c = ConstraintSet::default();
    let grid = FrontierSweep::new(&opt).volatility_grid(5, &c).unwrap();
    let min_vol = opt.optimize_min_volatility(&c).unwrap().volatility;
    let ms_vol = opt.optimize_max_sharpe(&c).unwrap().volatility;

    assert_eq!(grid.len(), 5);
    assert_eq!(grid[0], min_vol);
    approx::assert_abs_diff_eq!(grid[4], FRONTIER_VOLATILITY_MULTIPLIER * ms_vol, epsilon = 1e-12);
  }

  #[test]
  fn top_of_frontier_reaches_max_return() {
    let opt = optimizer();
    let points = opt
      .calculate_efficient_frontier(10, &ConstraintSet::default())
      .unwrap();
    let last = points.last().unwrap();
    // grid tops out above the riskiest asset, so the cap is slack there
    approx::assert_abs_diff_eq!(last.expected_return, 0.15, epsilon = 1e-4);
  }

  #[test]
  fn parallel_sweep_matches_sequential() {
    let opt = optimizer();
    let c = ConstraintSet::long_only(0.05, 0.6);
    let sweep = FrontierSweep::new(&opt);
    let seq = sweep.sweep(8, &c).unwrap();
    let par = sweep.par_sweep(8, &c).unwrap();
    assert_eq!(seq, par);
  }

  #[test]
  fn degenerate_grid_sizes() {
    let opt = optimizer();
    let c = ConstraintSet::default();
    assert!(opt.calculate_efficient_frontier(0, &c).unwrap().is_empty());
    assert!(opt.calculate_efficient_frontier(1, &c).unwrap().len() <= 1);
  }

  #[test]
  #[traced_test]
  fn infeasible_points_are_skipped() {
    let opt = optimizer();
    let sweep = FrontierSweep::new(&opt);
    let c = ConstraintSet::default();

    // a cap below the minimum attainable volatility cannot be met
    let outcome = sweep.solve_point(0.05, &c);
    assert!(!outcome.is_solved());
    assert_eq!(outcome.target_volatility(), 0.05);
    assert!(logs_contain("frontier point skipped"));

    let solved = sweep.solve_point(0.2, &c);
    assert!(solved.is_solved());
  }

  #[test]
  fn constraint_errors_abort_the_sweep() {
    let opt = optimizer();
    assert!(opt
      .calculate_efficient_frontier(10, &ConstraintSet::long_only(0.0, 0.2))
      .is_err());
  }
}
