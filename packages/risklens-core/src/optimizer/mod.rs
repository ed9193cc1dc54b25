//! Mean-variance portfolio optimization.
//!
//! - [`qp`]: the quadratic programming capability and its Clarabel backend
//! - [`frontier`]: efficient frontier, minimum-volatility and maximum-Sharpe portfolios
//! - [`rebalance`]: trades from current holdings to target weights

pub mod frontier;
pub mod qp;
pub mod rebalance;

pub use frontier::{FrontierPoint, MeanVarianceInputs, MeanVarianceOptimizer, MeanVarianceSolution};
pub use qp::{ClarabelSolver, QpProblem, QpSolver};
pub use rebalance::{rebalancing_trades, Holding, RebalancingTrade};

use crate::types::{Period, Warning};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A fully invested, long-only portfolio.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OptimalPortfolio {
    pub weights: BTreeMap<String, f64>,
    /// Annualized expected return
    #[serde(rename = "return")]
    pub expected_return: f64,
    /// Annualized volatility
    pub volatility: f64,
    pub sharpe_ratio: Option<f64>,
}

/// Paired return / volatility arrays, ordered by increasing target return.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Frontier {
    pub returns: Vec<f64>,
    pub volatility: Vec<f64>,
}

impl Frontier {
    pub fn len(&self) -> usize {
        self.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.returns.is_empty()
    }
}

/// Output of [`RiskEngine::optimize`](crate::RiskEngine::optimize).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    /// Optimizable universe (non-cash tickers with history)
    pub tickers: Vec<String>,
    pub frontier: Frontier,
    pub max_sharpe_portfolio: OptimalPortfolio,
    pub min_vol_portfolio: OptimalPortfolio,
    /// Trades from current holdings towards `max_sharpe_portfolio`
    pub rebalancing_trades: Vec<RebalancingTrade>,
    /// Value of the optimizable positions
    pub total_value: f64,
    pub risk_free_rate: f64,
    pub period: Period,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Diagonal ridge added to the covariance, 0 when none was needed
    pub covariance_ridge: f64,
    pub warnings: Vec<Warning>,
}
