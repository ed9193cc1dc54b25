//! Portfolio analytics.
//!
//! Each stage consumes aligned returns (or values derived from them) and
//! emits a typed result. Stages never mutate shared state.

mod benchmark;
mod decomposition;
mod drawdown;
mod explanation;
mod exposure;
mod monte_carlo;
mod performance;
mod returns;
mod var;

pub use benchmark::{align_returns, compare_to_benchmark, growth_of_investment, BacktestSeries, BenchmarkComparison};
pub use decomposition::{decompose, portfolio_variance, RiskDecomposition};
pub use drawdown::{drawdown_metrics, wealth_index, DrawdownMetrics, DrawdownPoint, Recovery};
pub use explanation::{explain, Explanation, RiskDriver, RiskLevel};
pub use exposure::{sector_breakdown, SectorBreakdown};
pub use monte_carlo::{
    compare_var_methods, percentile, simulate, DistributionStats, MonteCarloParams, MonteCarloResult,
    SimulationInputs, VarComparison,
};
pub use performance::{
    cumulative_return, downside_deviation, performance_metrics, sharpe_ratio, sortino_ratio,
    PerformanceMetrics,
};
pub use returns::{
    daily_returns, dated_returns, regularize, AssetReturns, CorrelationEntry, CorrelationMatrix,
    CovarianceMatrix, RegularizedCovariance,
};
pub use var::{norm_ppf, parametric_var};

use crate::types::{Warning, WarningCode};

/// Volatilities at or below this are treated as zero.
pub(crate) const ZERO_VOLATILITY: f64 = 1e-12;

/// Arithmetic mean; 0 for an empty slice.
pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator); `None` below two values.
pub(crate) fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(variance.max(0.0).sqrt())
}

/// Sample covariance of two equally long series; `None` below two values.
pub(crate) fn sample_covariance(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let ma = mean(a);
    let mb = mean(b);
    let sum: f64 = a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum();
    Some(sum / (a.len() - 1) as f64)
}

/// Pass finite values through; record a warning and return `None` otherwise.
pub(crate) fn finite_or_warn(value: f64, field: &str, warnings: &mut Vec<Warning>) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        warnings.push(Warning::new(
            WarningCode::NonFiniteValue,
            format!("{} evaluated to {} and was reported as null", field, value),
        ));
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sample_std() {
        // 2, 4, 4, 4, 5, 5, 7, 9 -> sample variance 32 / 7
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_relative_eq!(sample_std(&values).unwrap(), (32.0_f64 / 7.0).sqrt());
        assert!(sample_std(&[1.0]).is_none());
    }

    #[test]
    fn test_sample_covariance() {
        let a = [1.0, 2.0, 3.0];
        let b = [2.0, 4.0, 6.0];
        assert_relative_eq!(sample_covariance(&a, &b).unwrap(), 2.0);
        assert!(sample_covariance(&a, &b[..2]).is_none());
    }

    #[test]
    fn test_finite_or_warn() {
        let mut warnings = Vec::new();
        assert_eq!(finite_or_warn(1.5, "x", &mut warnings), Some(1.5));
        assert_eq!(finite_or_warn(f64::NAN, "sharpe_ratio", &mut warnings), None);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, WarningCode::NonFiniteValue);
    }
}
