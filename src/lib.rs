//! # portfolio-rs
//!
//! $$
//! \max_{\mathbf{w}}\ \frac{\mathbf{w}^\top\mu-r_f}{\sqrt{\mathbf{w}^\top\Sigma\mathbf{w}}}
//! $$
//!
//! Mean-variance portfolio optimization: forecast expected returns and
//! covariance from a return table, solve constrained allocation problems and
//! sweep the efficient frontier.

pub mod error;
pub mod portfolio;

pub use error::PortfolioError;
pub use error::PortfolioResult;
