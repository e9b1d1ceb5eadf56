//! # Portfolio
//!
//! $$
//! \sigma_p^2 = \mathbf{w}^\top \Sigma \mathbf{w}
//! $$
//!
//! Return forecasting, mean-variance optimization and efficient-frontier construction.

pub mod data;
pub mod engine;
pub mod estimator;
pub mod frontier;
pub mod objectives;
pub mod optimizers;
pub mod sqp;
pub mod types;

pub use data::ReturnKind;
pub use data::ReturnSeries;
pub use data::annualized_sharpe;
pub use data::annualized_volatility;
pub use data::corr_from_cov;
pub use data::correlation_matrix;
pub use data::sample_covariance;
pub use data::symmetrize;
pub use engine::Objective;
pub use engine::PortfolioEngine;
pub use engine::PortfolioEngineConfig;
pub use engine::PortfolioReport;
pub use engine::Recommendation;
pub use engine::StrategyComparison;
pub use estimator::CovarianceMethod;
pub use estimator::Estimator;
pub use estimator::EstimatorConfig;
pub use estimator::ForecastMethod;
pub use estimator::ForecastParams;
pub use estimator::Predictions;
pub use frontier::FRONTIER_VOLATILITY_MULTIPLIER;
pub use frontier::FrontierSweep;
pub use objectives::MeanVarianceModel;
pub use optimizers::PortfolioOptimizer;
pub use sqp::SolverConfig;
pub use types::AssetUniverse;
pub use types::ConstraintSet;
pub use types::FrontierOutcome;
pub use types::FrontierPoint;
pub use types::OptimizationResult;
pub use types::PortfolioMetrics;
pub use types::SolverStatus;
