//! Benchmark regression and growth-of-investment backtest.

use super::{mean, sample_covariance, sample_std, sharpe_ratio, ZERO_VOLATILITY};
use crate::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Portfolio returns regressed on a benchmark.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkComparison {
    pub benchmark_ticker: String,
    /// Annualized arithmetic return of the benchmark over the shared dates
    pub benchmark_return: f64,
    pub benchmark_volatility: f64,
    pub benchmark_sharpe: Option<f64>,
    /// `(Rp - rf) - beta * (Rb - rf)`
    pub alpha: f64,
    pub beta: f64,
    /// `None` when the portfolio series has zero variance
    pub correlation: Option<f64>,
    /// Number of shared return dates
    pub observations: usize,
}

/// Inner-join two date-sorted return series.
pub fn align_returns(a: &[(NaiveDate, f64)], b: &[(NaiveDate, f64)]) -> Vec<(NaiveDate, f64, f64)> {
    let mut joined = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                joined.push((a[i].0, a[i].1, b[j].1));
                i += 1;
                j += 1;
            }
        }
    }
    joined
}

/// Regress portfolio returns on benchmark returns over their shared dates.
///
/// `portfolio_return` is the portfolio's annualized return as reported in
/// its performance metrics.
pub fn compare_to_benchmark(
    ticker: &str,
    portfolio: &[(NaiveDate, f64)],
    benchmark: &[(NaiveDate, f64)],
    portfolio_return: f64,
    risk_free_rate: f64,
    trading_days: u32,
    min_observations: usize,
) -> Result<BenchmarkComparison> {
    let joined = align_returns(portfolio, benchmark);
    if joined.len() < min_observations.max(2) {
        return Err(Error::InsufficientHistory(format!(
            "{} shares {} return dates with the portfolio, at least {} required",
            ticker,
            joined.len(),
            min_observations.max(2)
        )));
    }

    let p: Vec<f64> = joined.iter().map(|(_, rp, _)| *rp).collect();
    let b: Vec<f64> = joined.iter().map(|(_, _, rb)| *rb).collect();

    let days = f64::from(trading_days);
    let benchmark_std = sample_std(&b).unwrap_or(0.0);
    if benchmark_std <= ZERO_VOLATILITY {
        return Err(Error::NumericInstability(format!(
            "{} has zero variance over the shared window",
            ticker
        )));
    }

    let covariance = sample_covariance(&p, &b).unwrap_or(0.0);
    let beta = covariance / benchmark_std.powi(2);
    let portfolio_std = sample_std(&p).unwrap_or(0.0);
    let correlation = (portfolio_std > ZERO_VOLATILITY)
        .then(|| (covariance / (portfolio_std * benchmark_std)).clamp(-1.0, 1.0));

    let benchmark_return = mean(&b) * days;
    let benchmark_volatility = benchmark_std * days.sqrt();
    let alpha = (portfolio_return - risk_free_rate) - beta * (benchmark_return - risk_free_rate);

    Ok(BenchmarkComparison {
        benchmark_ticker: ticker.to_string(),
        benchmark_return,
        benchmark_volatility,
        benchmark_sharpe: sharpe_ratio(benchmark_return, risk_free_rate, benchmark_volatility),
        alpha,
        beta,
        correlation,
        observations: joined.len(),
    })
}

/// Growth of an initial investment in the portfolio and the benchmark.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BacktestSeries {
    pub initial_value: f64,
    /// First entry is the starting point before any return is applied
    pub dates: Vec<NaiveDate>,
    pub portfolio: Vec<f64>,
    pub benchmark: Vec<f64>,
}

impl BacktestSeries {
    pub fn final_portfolio_value(&self) -> f64 {
        self.portfolio.last().copied().unwrap_or(self.initial_value)
    }

    pub fn final_benchmark_value(&self) -> f64 {
        self.benchmark.last().copied().unwrap_or(self.initial_value)
    }
}

/// Compound `initial_value` through both return series over their shared dates.
///
/// `start` labels the starting point. Returns `None` when the series share
/// no dates.
pub fn growth_of_investment(
    start: NaiveDate,
    portfolio: &[(NaiveDate, f64)],
    benchmark: &[(NaiveDate, f64)],
    initial_value: f64,
) -> Option<BacktestSeries> {
    let joined = align_returns(portfolio, benchmark);
    if joined.is_empty() {
        return None;
    }

    let mut dates = Vec::with_capacity(joined.len() + 1);
    let mut portfolio_values = Vec::with_capacity(joined.len() + 1);
    let mut benchmark_values = Vec::with_capacity(joined.len() + 1);
    dates.push(start.min(joined[0].0));
    portfolio_values.push(initial_value);
    benchmark_values.push(initial_value);

    let (mut pv, mut bv) = (initial_value, initial_value);
    for (date, rp, rb) in joined {
        pv *= 1.0 + rp;
        bv *= 1.0 + rb;
        dates.push(date);
        portfolio_values.push(pv);
        benchmark_values.push(bv);
    }

    Some(BacktestSeries {
        initial_value,
        dates,
        portfolio: portfolio_values,
        benchmark: benchmark_values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn dated(values: &[f64]) -> Vec<(NaiveDate, f64)> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (start + chrono::Days::new(i as u64), *v))
            .collect()
    }

    #[test]
    fn test_align_returns_inner_join() {
        let a = dated(&[0.01, 0.02, 0.03, 0.04]);
        let b: Vec<_> = dated(&[0.1, 0.2, 0.3, 0.4])
            .into_iter()
            .filter(|(d, _)| *d != a[1].0)
            .collect();
        let joined = align_returns(&a, &b);
        assert_eq!(joined.len(), 3);
        assert_eq!(joined[1], (a[2].0, 0.03, 0.3));
    }

    #[test]
    fn test_beta_of_scaled_series() {
        let bench = vec![0.01, -0.02, 0.015, 0.005, -0.01, 0.02, -0.005, 0.012];
        let port: Vec<f64> = bench.iter().map(|r| 1.5 * r).collect();
        let annual = mean(&port) * 252.0;

        let cmp = compare_to_benchmark("^GSPC", &dated(&port), &dated(&bench), annual, 0.04, 252, 5)
            .unwrap();
        assert_relative_eq!(cmp.beta, 1.5, epsilon = 1e-12);
        assert_relative_eq!(cmp.correlation.unwrap(), 1.0, epsilon = 1e-12);
        // Rp - rf = 1.5 * Rb - rf and beta * (Rb - rf) = 1.5 * Rb - 0.06
        assert_relative_eq!(cmp.alpha, 0.02, epsilon = 1e-12);
        assert_eq!(cmp.observations, 8);
        assert!(cmp.benchmark_sharpe.is_some());
    }

    #[test]
    fn test_flat_benchmark_fails() {
        let port = dated(&[0.01, -0.01, 0.02, 0.0]);
        let bench = dated(&[0.0, 0.0, 0.0, 0.0]);
        let result = compare_to_benchmark("FLAT", &port, &bench, 0.1, 0.04, 252, 2);
        assert!(matches!(result, Err(Error::NumericInstability(_))));
    }

    #[test]
    fn test_too_few_shared_dates() {
        let port = dated(&[0.01, -0.01, 0.02]);
        let result = compare_to_benchmark("^GSPC", &port, &port[..1], 0.1, 0.04, 252, 2);
        assert!(matches!(result, Err(Error::InsufficientHistory(_))));
    }

    #[test]
    fn test_growth_of_investment() {
        let port = dated(&[0.10, -0.10]);
        let bench = dated(&[0.05, 0.05]);
        let start = port[0].0.pred_opt().unwrap();
        let series = growth_of_investment(start, &port, &bench, 10_000.0).unwrap();

        assert_eq!(series.dates.len(), 3);
        assert_eq!(series.dates[0], start);
        assert_relative_eq!(series.final_portfolio_value(), 9_900.0, epsilon = 1e-9);
        assert_relative_eq!(series.final_benchmark_value(), 11_025.0, epsilon = 1e-9);
        assert!(growth_of_investment(start, &port, &[], 10_000.0).is_none());
    }
}
