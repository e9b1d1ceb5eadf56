//! # Portfolio Objectives
//!
//! $$
//! \mu_p = \mathbf{w}^\top\mu,\qquad \sigma_p = \sqrt{\mathbf{w}^\top \Sigma \mathbf{w}},\qquad
//! \nabla\sigma_p = \frac{\Sigma\mathbf{w}}{\sigma_p}
//! $$
//!
//! Objective and constraint functions over the weight vector, expressed as
//! argmin problems with analytic gradients.

use argmin::core::CostFunction;
use argmin::core::Gradient;
use ndarray::Array1;
use ndarray::Array2;

use super::types::PortfolioMetrics;

/// Nonlinear inequality constraints `c_k(w) >= 0` on top of the shared box and budget.
pub trait ConstrainedProblem:
  CostFunction<Param = Array1<f64>, Output = f64>
  + Gradient<Param = Array1<f64>, Gradient = Array1<f64>>
{
  fn n_inequalities(&self) -> usize {
    0
  }

  fn inequalities(&self, _w: &Array1<f64>) -> Array1<f64> {
    Array1::zeros(0)
  }

  /// One row per constraint.
  fn inequality_jacobian(&self, w: &Array1<f64>) -> Array2<f64> {
    Array2::zeros((0, w.len()))
  }
}

/// Fixed expected-return vector, covariance and risk-free rate.
#[derive(Clone, Debug)]
pub struct MeanVarianceModel {
  pub(crate) mu: Array1<f64>,
  pub(crate) cov: Array2<f64>,
  pub(crate) risk_free: f64,
}

impl MeanVarianceModel {
  pub fn expected_return(&self, w: &Array1<f64>) -> f64 {
    w.dot(&self.mu)
  }

  pub fn variance(&self, w: &Array1<f64>) -> f64 {
    w.dot(&self.cov.dot(w))
  }

  pub fn volatility(&self, w: &Array1<f64>) -> f64 {
    self.variance(w).max(0.0).sqrt()
  }

  pub fn metrics(&self, w: &Array1<f64>) -> PortfolioMetrics {
    let expected_return = self.expected_return(w);
    let volatility = self.volatility(w);
    PortfolioMetrics {
      expected_return,
      volatility,
      sharpe_ratio: sharpe_ratio(expected_return, volatility, self.risk_free),
    }
  }

  /// `Sigma w / sigma_p`, zero at a riskless point.
  fn volatility_gradient(&self, w: &Array1<f64>) -> (f64, Array1<f64>) {
    let sigma_w = self.cov.dot(w);
    let vol = w.dot(&sigma_w).max(0.0).sqrt();
    if vol == 0.0 {
      (vol, Array1::zeros(w.len()))
    } else {
      (vol, sigma_w / vol)
    }
  }
}

pub fn sharpe_ratio(expected_return: f64, volatility: f64, risk_free: f64) -> f64 {
  if volatility == 0.0 {
    0.0
  } else {
    (expected_return - risk_free) / volatility
  }
}

/// Minimize `-(mu_p - r_f) / sigma_p`.
pub(crate) struct NegativeSharpe<'a>(pub &'a MeanVarianceModel);

impl CostFunction for NegativeSharpe<'_> {
  type Param = Array1<f64>;
  type Output = f64;

  fn cost(&self, w: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
    Ok(-self.0.metrics(w).sharpe_ratio)
  }
}

impl Gradient for NegativeSharpe<'_> {
  type Param = Array1<f64>;
  type Gradient = Array1<f64>;

  fn gradient(&self, w: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
    let (vol, dvol) = self.0.volatility_gradient(w);
    if vol == 0.0 {
      return Ok(Array1::zeros(w.len()));
    }
    let excess = self.0.expected_return(w) - self.0.risk_free;
    Ok(dvol * (excess / (vol * vol)) - &self.0.mu / vol)
  }
}

impl ConstrainedProblem for NegativeSharpe<'_> {}

/// Minimize `sigma_p`.
pub(crate) struct Volatility<'a>(pub &'a MeanVarianceModel);

impl CostFunction for Volatility<'_> {
  type Param = Array1<f64>;
  type Output = f64;

  fn cost(&self, w: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
    Ok(self.0.volatility(w))
  }
}

impl Gradient for Volatility<'_> {
  type Param = Array1<f64>;
  type Gradient = Array1<f64>;

  fn gradient(&self, w: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
    Ok(self.0.volatility_gradient(w).1)
  }
}

impl ConstrainedProblem for Volatility<'_> {}

/// Minimize `-mu_p`.
pub(crate) struct NegativeReturn<'a>(pub &'a MeanVarianceModel);

impl CostFunction for NegativeReturn<'_> {
  type Param = Array1<f64>;
  type Output = f64;

  fn cost(&self, w: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
    Ok(-self.0.expected_return(w))
  }
}

impl Gradient for NegativeReturn<'_> {
  type Param = Array1<f64>;
  type Gradient = Array1<f64>;

  fn gradient(&self, _w: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
    Ok(-&self.0.mu)
  }
}

impl ConstrainedProblem for NegativeReturn<'_> {}

/// Minimize `-mu_p` subject to `target - sigma_p >= 0`.
pub(crate) struct ReturnUnderRiskCap<'a> {
  pub model: &'a MeanVarianceModel,
  pub target_volatility: f64,
}

impl CostFunction for ReturnUnderRiskCap<'_> {
  type Param = Array1<f64>;
  type Output = f64;

  fn cost(&self, w: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
    NegativeReturn(self.model).cost(w)
  }
}

impl Gradient for ReturnUnderRiskCap<'_> {
  type Param = Array1<f64>;
  type Gradient = Array1<f64>;

  fn gradient(&self, w: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
    NegativeReturn(self.model).gradient(w)
  }
}

impl ConstrainedProblem for ReturnUnderRiskCap<'_> {
  fn n_inequalities(&self) -> usize {
    1
  }

  fn inequalities(&self, w: &Array1<f64>) -> Array1<f64> {
    Array1::from_elem(1, self.target_volatility - self.model.volatility(w))
  }

  fn inequality_jacobian(&self, w: &Array1<f64>) -> Array2<f64> {
    let (_, dvol) = self.model.volatility_gradient(w);
    let n = w.len();
    Array2::from_shape_fn((1, n), |(_, j)| -dvol[j])
  }
}
