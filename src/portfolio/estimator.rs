//! # Return & Covariance Estimator
//!
//! $$
//! \hat\mu_t = (1-\alpha)\hat\mu_{t-1} + \alpha r_t,\qquad \alpha = \frac{2}{S+1}
//! $$
//!
//! Point forecasts of expected returns and of the covariance matrix from a
//! historical return table. Forecasts are one step ahead; annualization is a
//! linear rescaling of both the mean vector and the covariance matrix.

use std::str::FromStr;

use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView1;
use ndarray::ArrayView2;
use ndarray::Axis;
use serde::Deserialize;
use serde::Serialize;
use tracing::trace;

use super::data::column_means;
use super::data::sample_covariance;
use super::data::tail;
use super::data::ReturnSeries;
use super::types::AssetUniverse;
use crate::error::PortfolioError;
use crate::error::PortfolioResult;

/// Fixed weight on the scaled-identity target of the shrinkage estimator.
pub const SHRINKAGE_INTENSITY: f64 = 0.2;

/// Expected-return forecasting method.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForecastMethod {
  /// Last value of an exponentially weighted mean with span [`ForecastParams::span`].
  #[default]
  ExponentialWeighted,
  /// Mean of the last [`ForecastParams::window`] periods.
  SimpleMovingAverage,
  /// Exponentially weighted mean using [`ForecastParams::window`] as the span.
  ExponentialMovingAverage,
  /// Arithmetic mean of the full table.
  HistoricalMean,
}

impl FromStr for ForecastMethod {
  type Err = PortfolioError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "ewma" | "exponential-weighted" => Ok(Self::ExponentialWeighted),
      "sma" | "simple-moving-average" => Ok(Self::SimpleMovingAverage),
      "ema" | "exponential-moving-average" => Ok(Self::ExponentialMovingAverage),
      "historical_mean" | "historical-mean" | "mean" => Ok(Self::HistoricalMean),
      _ => Err(PortfolioError::UnknownMethod {
        kind: "forecast",
        name: s.to_string(),
      }),
    }
  }
}

impl ForecastMethod {
  /// One-step-ahead expected return of every column.
  pub fn compute(
    &self,
    values: &ArrayView2<f64>,
    params: &ForecastParams,
  ) -> PortfolioResult<Array1<f64>> {
    match self {
      Self::ExponentialWeighted => ewm_mean(values, params.span),
      Self::SimpleMovingAverage => {
        check_positive("window", params.window)?;
        column_means(&tail(values, params.window)?.view())
      }
      Self::ExponentialMovingAverage => ewm_mean(values, params.window),
      Self::HistoricalMean => column_means(values),
    }
  }
}

/// Covariance estimation method.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovarianceMethod {
  /// Unbiased sample covariance of the full table.
  #[default]
  Sample,
  /// Most recent exponentially weighted covariance, span [`ForecastParams::span`].
  ExponentialWeighted,
  /// Blend of the sample covariance with `tr(S)/N * I`, see [`SHRINKAGE_INTENSITY`].
  Shrinkage,
}

impl FromStr for CovarianceMethod {
  type Err = PortfolioError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "sample" => Ok(Self::Sample),
      "ewma" | "exponential-weighted" => Ok(Self::ExponentialWeighted),
      "shrinkage" => Ok(Self::Shrinkage),
      _ => Err(PortfolioError::UnknownMethod {
        kind: "covariance",
        name: s.to_string(),
      }),
    }
  }
}

impl CovarianceMethod {
  /// Covariance of the columns of `values`, one row per period.
  pub fn compute(
    &self,
    values: &ArrayView2<f64>,
    params: &ForecastParams,
  ) -> PortfolioResult<Array2<f64>> {
    match self {
      Self::Sample => sample_covariance(values),
      Self::ExponentialWeighted => ewm_covariance(values, params.span),
      Self::Shrinkage => {
        let sample = sample_covariance(values)?;
        let n = sample.nrows();
        let avg_var = sample.diag().sum() / n as f64;
        let target = Array2::<f64>::eye(n) * avg_var;
        Ok(target * SHRINKAGE_INTENSITY + sample * (1.0 - SHRINKAGE_INTENSITY))
      }
    }
  }
}

/// Smoothing parameters. `span` and `window` are independent namespaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastParams {
  /// Span of the exponentially weighted estimators.
  pub span: usize,
  /// Window of the simple and exponential moving averages.
  pub window: usize,
}

impl Default for ForecastParams {
  fn default() -> Self {
    Self {
      span: 60,
      window: 30,
    }
  }
}

/// Runtime configuration for [`Estimator`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimatorConfig {
  pub method: ForecastMethod,
  pub params: ForecastParams,
  /// Covariance estimator used by [`Estimator::get_predictions`].
  pub covariance: CovarianceMethod,
}

/// Forecast pair consumed by [`super::PortfolioOptimizer`].
#[derive(Clone, Debug, PartialEq)]
pub struct Predictions {
  pub assets: AssetUniverse,
  pub returns: Array1<f64>,
  pub covariance: Array2<f64>,
}

/// Fitted forecaster over a fixed return table.
#[derive(Clone, Debug)]
pub struct Estimator {
  returns: ReturnSeries,
  config: EstimatorConfig,
}

impl Estimator {
  /// Store the return table together with the forecasting method and its parameters.
  ///
  /// Parameters are not validated here; invalid spans or windows surface on prediction.
  pub fn fit(returns: ReturnSeries, method: ForecastMethod, params: ForecastParams) -> Self {
    Self::with_config(
      returns,
      EstimatorConfig {
        method,
        params,
        ..EstimatorConfig::default()
      },
    )
  }

  /// Fit with forecasting method, parameters and covariance method taken from `config`.
  pub fn with_config(returns: ReturnSeries, config: EstimatorConfig) -> Self {
    Self { returns, config }
  }

  /// Select the covariance estimator used by [`Self::get_predictions`].
  pub fn covariance_method(mut self, method: CovarianceMethod) -> Self {
    self.config.covariance = method;
    self
  }

  /// Borrow estimator configuration.
  pub fn config(&self) -> &EstimatorConfig {
    &self.config
  }

  /// Asset identifiers of the fitted table, in column order.
  pub fn assets(&self) -> &AssetUniverse {
    self.returns.assets()
  }

  /// Per-period expected return of every asset.
  ///
  /// `horizon` is accepted for interface compatibility; the forecast is always one step ahead.
  pub fn predict_returns(&self, horizon: usize) -> PortfolioResult<Array1<f64>> {
    trace!(method = ?self.config.method, horizon, "predicting returns");
    self
      .config
      .method
      .compute(&self.returns.values(), &self.config.params)
  }

  /// Per-period covariance matrix under `method`.
  pub fn predict_covariance(&self, method: CovarianceMethod) -> PortfolioResult<Array2<f64>> {
    trace!(?method, "predicting covariance");
    method.compute(&self.returns.values(), &self.config.params)
  }

  /// Expected returns and covariance, both multiplied by `periods_per_year` when `annualize`.
  pub fn get_predictions(
    &self,
    annualize: bool,
    periods_per_year: u32,
  ) -> PortfolioResult<Predictions> {
    let mut returns = self.predict_returns(1)?;
    let mut covariance = self.predict_covariance(self.config.covariance)?;

    if annualize {
      let scale = f64::from(periods_per_year);
      returns *= scale;
      covariance *= scale;
    }

    Ok(Predictions {
      assets: self.assets().clone(),
      returns,
      covariance,
    })
  }
}

fn check_positive(name: &'static str, value: usize) -> PortfolioResult<()> {
  if value == 0 {
    return Err(PortfolioError::InvalidParameter {
      name,
      reason: "must be at least 1".to_string(),
    });
  }
  Ok(())
}

fn smoothing_factor(span: usize) -> PortfolioResult<f64> {
  check_positive("span", span)?;
  Ok(2.0 / (span as f64 + 1.0))
}

/// Recursive EWMA without bias adjustment, seeded with the first observation.
fn ewm_mean(values: &ArrayView2<f64>, span: usize) -> PortfolioResult<Array1<f64>> {
  let alpha = smoothing_factor(span)?;
  if values.nrows() == 0 {
    return Err(PortfolioError::InsufficientData {
      method: "exponentially weighted mean",
      required: 1,
      available: 0,
    });
  }

  let mut mean = values.row(0).to_owned();
  for row in values.axis_iter(Axis(0)).skip(1) {
    mean.zip_mut_with(&row, |m, &x| *m = (1.0 - alpha) * *m + alpha * x);
  }
  Ok(mean)
}

/// Final slice of the exponentially weighted covariance, with the unbiased weight correction.
fn ewm_covariance(values: &ArrayView2<f64>, span: usize) -> PortfolioResult<Array2<f64>> {
  let alpha = smoothing_factor(span)?;
  if values.nrows() < 2 {
    return Err(PortfolioError::InsufficientData {
      method: "exponentially weighted covariance",
      required: 2,
      available: values.nrows(),
    });
  }

  let n = values.ncols();
  let mut cov = Array2::<f64>::zeros((n, n));
  for i in 0..n {
    for j in i..n {
      let c = ewm_cov_pair(values.column(i), values.column(j), alpha)?;
      cov[[i, j]] = c;
      cov[[j, i]] = c;
    }
  }
  Ok(cov)
}

fn ewm_cov_pair(x: ArrayView1<f64>, y: ArrayView1<f64>, alpha: f64) -> PortfolioResult<f64> {
  let decay = 1.0 - alpha;
  let mut mean_x = x[0];
  let mut mean_y = y[0];
  let mut cov = 0.0;
  let mut sum_wt = 1.0;
  let mut sum_wt2 = 1.0;
  let mut old_wt = 1.0;

  for (&cx, &cy) in x.iter().zip(y.iter()).skip(1) {
    sum_wt *= decay;
    sum_wt2 *= decay * decay;
    old_wt *= decay;

    let (prev_x, prev_y) = (mean_x, mean_y);
    // constant series stay exact
    if mean_x != cx {
      mean_x = (old_wt * prev_x + alpha * cx) / (old_wt + alpha);
    }
    if mean_y != cy {
      mean_y = (old_wt * prev_y + alpha * cy) / (old_wt + alpha);
    }
    cov = (old_wt * (cov + (prev_x - mean_x) * (prev_y - mean_y))
      + alpha * (cx - mean_x) * (cy - mean_y))
      / (old_wt + alpha);

    sum_wt += alpha;
    sum_wt2 += alpha * alpha;
    old_wt += alpha;
    sum_wt /= old_wt;
    sum_wt2 /= old_wt * old_wt;
    old_wt = 1.0;
  }

  let numerator = sum_wt * sum_wt;
  let denominator = numerator - sum_wt2;
  if denominator <= 0.0 {
    return Err(PortfolioError::InvalidParameter {
      name: "span",
      reason: "weights collapse onto a single observation".to_string(),
    });
  }
  Ok(numerator / denominator * cov)
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use ndarray::array;

  use super::*;

  fn series(values: Array2<f64>) -> ReturnSeries {
    let n = values.ncols();
    ReturnSeries::new(AssetUniverse::anonymous(n), values).unwrap()
  }

  fn params(span: usize, window: usize) -> ForecastParams {
    ForecastParams { span, window }
  }

  #[test]
  fn ewma_is_recursive_without_adjustment() {
    let est = Estimator::fit(
      series(array![[1.0], [2.0], [3.0]]),
      ForecastMethod::ExponentialWeighted,
      params(3, 30),
    );
    // alpha = 0.5: 1 -> 1.5 -> 2.25
    let mu = est.predict_returns(1).unwrap();
    assert_abs_diff_eq!(mu[0], 2.25, epsilon = 1e-12);
  }

  #[test]
  fn ema_uses_window_as_span() {
    let table = array![[1.0, 0.0], [2.0, 1.0], [3.0, 0.0]];
    let ema = Estimator::fit(
      series(table.clone()),
      ForecastMethod::ExponentialMovingAverage,
      params(60, 3),
    );
    let ewma = Estimator::fit(series(table), ForecastMethod::ExponentialWeighted, params(3, 30));
    assert_eq!(ema.predict_returns(1).unwrap(), ewma.predict_returns(1).unwrap());
  }

  #[test]
  fn sma_averages_last_window() {
    let est = Estimator::fit(
      series(array![[1.0], [2.0], [3.0], [4.0]]),
      ForecastMethod::SimpleMovingAverage,
      params(60, 2),
    );
    assert_abs_diff_eq!(est.predict_returns(1).unwrap()[0], 3.5, epsilon = 1e-12);
  }

  #[test]
  fn sma_window_longer_than_history_fails() {
    let est = Estimator::fit(
      series(array![[1.0], [2.0]]),
      ForecastMethod::SimpleMovingAverage,
      params(60, 5),
    );
    assert!(matches!(
      est.predict_returns(1),
      Err(PortfolioError::InsufficientData {
        required: 5,
        available: 2,
        ..
      })
    ));
  }

  #[test]
  fn horizon_does_not_change_forecast() {
    let est = Estimator::fit(
      series(array![[0.01, 0.02], [0.03, -0.01], [0.0, 0.04]]),
      ForecastMethod::HistoricalMean,
      ForecastParams::default(),
    );
    let one = est.predict_returns(1).unwrap();
    assert_eq!(one, est.predict_returns(20).unwrap());
    assert_abs_diff_eq!(one[0], 0.04 / 3.0, epsilon = 1e-15);
    assert_abs_diff_eq!(one[1], 0.05 / 3.0, epsilon = 1e-15);
  }

  #[test]
  fn zero_span_is_rejected_at_prediction() {
    let est = Estimator::fit(
      series(array![[1.0], [2.0]]),
      ForecastMethod::ExponentialWeighted,
      params(0, 30),
    );
    assert!(matches!(
      est.predict_returns(1),
      Err(PortfolioError::InvalidParameter { name: "span", .. })
    ));
  }

  #[test]
  fn ewm_covariance_matches_weighted_form() {
    let est = Estimator::fit(
      series(array![[1.0, 2.0], [2.0, 1.0], [4.0, 3.0]]),
      ForecastMethod::ExponentialWeighted,
      params(3, 30),
    );
    let cov = est
      .predict_covariance(CovarianceMethod::ExponentialWeighted)
      .unwrap();

    // weights (0.25, 0.25, 0.5), sum of squared weights 0.375
    assert_abs_diff_eq!(cov[[0, 1]], 0.8125 / 0.625, epsilon = 1e-12);
    assert_abs_diff_eq!(cov[[1, 0]], cov[[0, 1]], epsilon = 1e-15);
    // var: devs (-1.75, -0.75, 1.25) -> 1.6875 / 0.625
    assert_abs_diff_eq!(cov[[0, 0]], 1.6875 / 0.625, epsilon = 1e-12);
  }

  #[test]
  fn shrinkage_blends_towards_scaled_identity() {
    let table = array![[0.01, 0.03], [0.02, -0.01], [-0.01, 0.02], [0.04, 0.00]];
    let est = Estimator::fit(series(table.clone()), ForecastMethod::HistoricalMean, params(60, 30));
    let sample = sample_covariance(&table.view()).unwrap();
    let shrunk = est.predict_covariance(CovarianceMethod::Shrinkage).unwrap();
    let avg_var = (sample[[0, 0]] + sample[[1, 1]]) / 2.0;

    assert_abs_diff_eq!(shrunk[[0, 1]], 0.8 * sample[[0, 1]], epsilon = 1e-15);
    assert_abs_diff_eq!(
      shrunk[[0, 0]],
      0.8 * sample[[0, 0]] + 0.2 * avg_var,
      epsilon = 1e-15
    );
    assert_abs_diff_eq!(shrunk.diag().sum(), sample.diag().sum(), epsilon = 1e-15);
  }

  #[test]
  fn annualization_is_linear_for_both_outputs() {
    let table = array![
      [0.001, 0.002, -0.001],
      [0.003, -0.002, 0.000],
      [-0.002, 0.001, 0.004],
      [0.000, 0.003, 0.001]
    ];
    let est = Estimator::fit(series(table), ForecastMethod::HistoricalMean, params(60, 30))
      .covariance_method(CovarianceMethod::Shrinkage);

    let raw = est.get_predictions(false, 252).unwrap();
    let ann = est.get_predictions(true, 252).unwrap();

    assert_eq!(ann.returns, &raw.returns * 252.0);
    assert_eq!(ann.covariance, &raw.covariance * 252.0);
  }

  #[test]
  fn unknown_method_names_are_configuration_errors() {
    assert_eq!(
      "arima".parse::<ForecastMethod>(),
      Err(PortfolioError::UnknownMethod {
        kind: "forecast",
        name: "arima".to_string()
      })
    );
    assert!(matches!(
      "ledoit".parse::<CovarianceMethod>(),
      Err(PortfolioError::UnknownMethod {
        kind: "covariance",
        ..
      })
    ));
    assert_eq!(
      "sma".parse::<ForecastMethod>().unwrap(),
      ForecastMethod::SimpleMovingAverage
    );
    assert_eq!(
      "historical_mean".parse::<ForecastMethod>().unwrap(),
      ForecastMethod::HistoricalMean
    );
  }
}
