//! # Portfolio Data Utilities
//!
//! $$
//! \Sigma_{ij} = \sigma_i \sigma_j \rho_{ij}
//! $$
//!
//! Return tables and the sample statistics derived from them.

use std::str::FromStr;

use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView2;
use ndarray::Axis;
use ndarray::s;

use super::types::AssetUniverse;
use crate::error::PortfolioError;
use crate::error::PortfolioResult;

/// Price-to-return transform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReturnKind {
  /// `p_t / p_{t-1} - 1`
  #[default]
  Simple,
  /// `ln(p_t / p_{t-1})`
  Log,
}

impl FromStr for ReturnKind {
  type Err = PortfolioError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "simple" | "pct" => Ok(Self::Simple),
      "log" | "ln" => Ok(Self::Log),
      _ => Err(PortfolioError::UnknownMethod {
        kind: "return",
        name: s.to_string(),
      }),
    }
  }
}

/// Gap-free table of per-period returns, one column per asset, rows ordered by time.
#[derive(Clone, Debug)]
pub struct ReturnSeries {
  assets: AssetUniverse,
  values: Array2<f64>,
}

impl ReturnSeries {
  pub fn new(assets: AssetUniverse, values: Array2<f64>) -> PortfolioResult<Self> {
    if values.ncols() != assets.len() {
      return Err(PortfolioError::DimensionMismatch {
        context: "return table columns",
        expected: assets.len(),
        found: values.ncols(),
      });
    }
    if values.iter().any(|v| !v.is_finite()) {
      return Err(PortfolioError::InvalidParameter {
        name: "returns",
        reason: "table contains non-finite values".to_string(),
      });
    }
    Ok(Self { assets, values })
  }

  /// Build a return table from a price table, dropping the undefined first row.
  pub fn from_prices(
    assets: AssetUniverse,
    prices: &Array2<f64>,
    kind: ReturnKind,
  ) -> PortfolioResult<Self> {
    if prices.iter().any(|&p| !(p.is_finite() && p > 0.0)) {
      return Err(PortfolioError::InvalidParameter {
        name: "prices",
        reason: "prices must be finite and strictly positive".to_string(),
      });
    }
    if prices.nrows() < 2 {
      return Err(PortfolioError::InsufficientData {
        method: "return transform",
        required: 2,
        available: prices.nrows(),
      });
    }

    let prev = prices.slice(s![..-1, ..]);
    let next = prices.slice(s![1.., ..]);
    let ratio = &next / &prev;
    let values = match kind {
      ReturnKind::Simple => ratio.mapv(|r| r - 1.0),
      ReturnKind::Log => ratio.mapv(f64::ln),
    };

    Self::new(assets, values)
  }

  pub fn assets(&self) -> &AssetUniverse {
    &self.assets
  }

  pub fn values(&self) -> ArrayView2<'_, f64> {
    self.values.view()
  }

  pub fn n_periods(&self) -> usize {
    self.values.nrows()
  }

  pub fn n_assets(&self) -> usize {
    self.values.ncols()
  }
}

/// Arithmetic mean of every column.
pub fn column_means(values: &ArrayView2<f64>) -> PortfolioResult<Array1<f64>> {
  values
    .mean_axis(Axis(0))
    .ok_or(PortfolioError::InsufficientData {
      method: "mean",
      required: 1,
      available: 0,
    })
}

/// Unbiased sample covariance of the columns.
pub fn sample_covariance(values: &ArrayView2<f64>) -> PortfolioResult<Array2<f64>> {
  let n = values.nrows();
  if n < 2 {
    return Err(PortfolioError::InsufficientData {
      method: "sample covariance",
      required: 2,
      available: n,
    });
  }

  let mean = column_means(values)?;
  let centered = values - &mean;
  Ok(centered.t().dot(&centered) / (n - 1) as f64)
}

/// Pearson correlation matrix of the columns.
pub fn correlation_matrix(values: &ArrayView2<f64>) -> PortfolioResult<Array2<f64>> {
  Ok(corr_from_cov(&sample_covariance(values)?))
}

/// Rescale a covariance matrix to correlations; zero-variance assets get zero correlation.
pub fn corr_from_cov(cov: &Array2<f64>) -> Array2<f64> {
  let n = cov.nrows();
  let sd: Vec<f64> = (0..n).map(|i| cov[[i, i]].max(0.0).sqrt()).collect();

  Array2::from_shape_fn((n, n), |(i, j)| {
    let denom = sd[i] * sd[j];
    if i == j {
      1.0
    } else if denom > 1e-15 {
      (cov[[i, j]] / denom).clamp(-1.0, 1.0)
    } else {
      0.0
    }
  })
}

/// Per-asset standard deviation scaled by `sqrt(periods_per_year)`.
pub fn annualized_volatility(
  values: &ArrayView2<f64>,
  periods_per_year: f64,
) -> PortfolioResult<Array1<f64>> {
  if values.nrows() < 2 {
    return Err(PortfolioError::InsufficientData {
      method: "volatility",
      required: 2,
      available: values.nrows(),
    });
  }
  Ok(values.std_axis(Axis(0), 1.0) * periods_per_year.sqrt())
}

/// Per-asset annualized Sharpe ratio; `NaN` for assets with zero dispersion.
pub fn annualized_sharpe(
  values: &ArrayView2<f64>,
  risk_free_rate: f64,
  periods_per_year: f64,
) -> PortfolioResult<Array1<f64>> {
  let mean = column_means(values)? * periods_per_year;
  let vol = annualized_volatility(values, periods_per_year)?;

  Ok(Array1::from_shape_fn(mean.len(), |i| {
    if vol[i] == 0.0 {
      f64::NAN
    } else {
      (mean[i] - risk_free_rate) / vol[i]
    }
  }))
}

/// Whether `m` equals its transpose within `tol`.
pub fn is_symmetric(m: &Array2<f64>, tol: f64) -> bool {
  m.is_square()
    && m
      .indexed_iter()
      .all(|((i, j), &v)| (v - m[[j, i]]).abs() <= tol * (1.0 + v.abs()))
}

/// `(M + M') / 2`
pub fn symmetrize(m: &Array2<f64>) -> Array2<f64> {
  (m + &m.t()) * 0.5
}

/// Last `window` rows of the table.
pub(crate) fn tail(values: &ArrayView2<f64>, window: usize) -> PortfolioResult<Array2<f64>> {
  let n = values.nrows();
  if window > n {
    return Err(PortfolioError::InsufficientData {
      method: "moving window",
      required: window,
      available: n,
    });
  }
  Ok(values.slice(s![n - window.., ..]).to_owned())
}
