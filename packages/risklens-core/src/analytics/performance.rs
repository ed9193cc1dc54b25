//! Portfolio performance analytics.

use super::{sample_std, ZERO_VOLATILITY};
use serde::{Deserialize, Serialize};

/// Risk-adjusted performance of the current weights over the lookback window.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetrics {
    /// Arithmetic mean daily return times trading days (plus any factor shocks)
    pub annualized_return: f64,
    /// Compounded return over the window, as a fraction
    pub cumulative_return: f64,
    pub risk_free_rate: f64,
    /// `None` when volatility is zero
    pub sharpe_ratio: Option<f64>,
    /// `None` when fewer than two down days or zero downside deviation
    pub sortino_ratio: Option<f64>,
    /// Annualized standard deviation of negative daily returns
    pub downside_deviation: Option<f64>,
}

/// Compounded return of a daily return series, as a fraction.
pub fn cumulative_return(returns: &[f64]) -> f64 {
    returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0
}

/// `(annual_return - risk_free_rate) / volatility`.
pub fn sharpe_ratio(annual_return: f64, risk_free_rate: f64, volatility: f64) -> Option<f64> {
    if volatility <= ZERO_VOLATILITY || !volatility.is_finite() {
        return None;
    }
    Some((annual_return - risk_free_rate) / volatility)
}

/// Sample standard deviation of the negative daily returns, annualized.
pub fn downside_deviation(returns: &[f64], trading_days: u32) -> Option<f64> {
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    let deviation = sample_std(&downside)? * f64::from(trading_days).sqrt();
    (deviation > ZERO_VOLATILITY).then_some(deviation)
}

/// `(annual_return - risk_free_rate) / downside_deviation`.
pub fn sortino_ratio(
    returns: &[f64],
    annual_return: f64,
    risk_free_rate: f64,
    trading_days: u32,
) -> Option<f64> {
    let deviation = downside_deviation(returns, trading_days)?;
    Some((annual_return - risk_free_rate) / deviation)
}

/// Assemble [`PerformanceMetrics`] from daily portfolio returns.
pub fn performance_metrics(
    returns: &[f64],
    annualized_return: f64,
    volatility: f64,
    risk_free_rate: f64,
    trading_days: u32,
) -> PerformanceMetrics {
    PerformanceMetrics {
        annualized_return,
        cumulative_return: cumulative_return(returns),
        risk_free_rate,
        sharpe_ratio: sharpe_ratio(annualized_return, risk_free_rate, volatility),
        sortino_ratio: sortino_ratio(returns, annualized_return, risk_free_rate, trading_days),
        downside_deviation: downside_deviation(returns, trading_days),
    }
}
