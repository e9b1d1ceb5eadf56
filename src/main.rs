use anyhow::Result;
use ndarray::Array2;
use ndarray::Axis;
use ndarray_rand::RandomExt;
use portfolio_rs::portfolio::AssetUniverse;
use portfolio_rs::portfolio::ConstraintSet;
use portfolio_rs::portfolio::CovarianceMethod;
use portfolio_rs::portfolio::EstimatorConfig;
use portfolio_rs::portfolio::ForecastMethod;
use portfolio_rs::portfolio::PortfolioEngine;
use portfolio_rs::portfolio::PortfolioEngineConfig;
use portfolio_rs::portfolio::ReturnKind;
use portfolio_rs::portfolio::ReturnSeries;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use tracing_subscriber::EnvFilter;

const TICKERS: [&str; 3] = ["GLD", "SPY", "BIL"];
/// Daily drift, market loading and idiosyncratic volatility per asset.
const DRIFT: [f64; 3] = [0.0003, 0.0005, 0.00015];
const BETA: [f64; 3] = [0.2, 1.0, 0.02];
const IDIO: [f64; 3] = [0.009, 0.006, 0.0008];
const MARKET_VOL: f64 = 0.011;

fn setup_logging() {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("portfolio_rs=info")),
    )
    .with_target(false)
    .init();
}

/// Two years of one-factor daily prices.
fn synthetic_prices(days: usize, seed: u64) -> Array2<f64> {
  let mut rng = StdRng::seed_from_u64(seed);
  let shocks = Array2::<f64>::random_using((days, TICKERS.len() + 1), StandardNormal, &mut rng);

  let mut prices = Array2::<f64>::zeros((days + 1, TICKERS.len()));
  prices.row_mut(0).fill(100.0);
  for t in 0..days {
    let market = MARKET_VOL * shocks[[t, TICKERS.len()]];
    for j in 0..TICKERS.len() {
      let r = DRIFT[j] + BETA[j] * market + IDIO[j] * shocks[[t, j]];
      prices[[t + 1, j]] = prices[[t, j]] * r.exp();
    }
  }
  prices
}

fn main() -> Result<()> {
  setup_logging();

  let assets = AssetUniverse::new(TICKERS)?;
  let prices = synthetic_prices(504, 42);
  let returns = ReturnSeries::from_prices(assets, &prices, ReturnKind::Simple)?;
  let realized = returns.values().mean_axis(Axis(0));
  tracing::info!(periods = returns.n_periods(), ?realized, "synthetic returns generated");

  let config = PortfolioEngineConfig {
    estimator: EstimatorConfig {
      method: ForecastMethod::ExponentialWeighted,
      covariance: CovarianceMethod::Shrinkage,
      ..EstimatorConfig::default()
    },
    risk_free_rate: 0.04,
    constraints: ConstraintSet::long_only(0.0, 0.4),
    frontier_points: Some(25),
    ..PortfolioEngineConfig::default()
  };
  let engine = PortfolioEngine::new(config);

  let report = engine.run(&returns)?;
  println!("Optimal weights ({:?}):", report.objective);
  for (asset, weight) in report.allocation() {
    println!("  {asset:8} {:6.2}%", weight * 100.0);
  }
  println!(
    "Expected return {:.2}%  volatility {:.2}%  Sharpe {:.2}  converged {}",
    report.result.expected_return * 100.0,
    report.result.volatility * 100.0,
    report.result.sharpe_ratio,
    report.result.optimization_success,
  );

  if let Some(frontier) = &report.frontier {
    println!("\nEfficient frontier ({} points):", frontier.len());
    for p in frontier {
      println!(
        "  vol {:6.2}%  ret {:6.2}%  sharpe {:5.2}",
        p.volatility * 100.0,
        p.expected_return * 100.0,
        p.sharpe_ratio
      );
    }
  }

  let cmp = engine.compare_strategies(&returns)?;
  println!(
    "\nMax-Sharpe vs min-volatility: dReturn {:+.2}%  dVol {:+.2}%  dSharpe {:+.2}  -> {:?}",
    cmp.return_difference * 100.0,
    cmp.volatility_difference * 100.0,
    cmp.sharpe_difference,
    cmp.recommendation
  );

  Ok(())
}
