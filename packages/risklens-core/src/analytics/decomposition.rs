//! Euler decomposition of portfolio volatility.

use super::ZERO_VOLATILITY;
use nalgebra::{DMatrix, DVector};

/// Per-position split of portfolio volatility.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskDecomposition {
    pub variance: f64,
    pub volatility: f64,
    /// d(sigma)/d(w_i) = (Sigma w)_i / sigma
    pub marginal_risk: Vec<f64>,
    /// w_i * marginal_i / sigma, in percent; sums to 100
    pub contribution_pct: Vec<f64>,
}

impl RiskDecomposition {
    pub fn is_degenerate(&self) -> bool {
        self.volatility <= ZERO_VOLATILITY
    }
}

/// `w^T Sigma w`, floored at zero.
pub fn portfolio_variance(weights: &DVector<f64>, covariance: &DMatrix<f64>) -> f64 {
    weights.dot(&(covariance * weights)).max(0.0)
}

/// Decompose volatility into marginal and percentage contributions.
///
/// When volatility is zero every marginal and contribution is zero.
pub fn decompose(weights: &DVector<f64>, covariance: &DMatrix<f64>) -> RiskDecomposition {
    let n = weights.len();
    let sigma_w = covariance * weights;
    let variance = weights.dot(&sigma_w).max(0.0);
    let volatility = variance.sqrt();

    if volatility <= ZERO_VOLATILITY {
        return RiskDecomposition {
            variance,
            volatility,
            marginal_risk: vec![0.0; n],
            contribution_pct: vec![0.0; n],
        };
    }

    let marginal_risk: Vec<f64> = sigma_w.iter().map(|m| m / volatility).collect();
    let contribution_pct = weights
        .iter()
        .zip(&marginal_risk)
        .map(|(w, m)| w * m / volatility * 100.0)
        .collect();

    RiskDecomposition {
        variance,
        volatility,
        marginal_risk,
        contribution_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_contributions_sum_to_hundred() {
        let cov = DMatrix::from_row_slice(
            3,
            3,
            &[0.04, 0.006, 0.002, 0.006, 0.09, -0.01, 0.002, -0.01, 0.0625],
        );
        let weights = DVector::from_vec(vec![0.5, 0.3, 0.2]);
        let d = decompose(&weights, &cov);

        let total: f64 = d.contribution_pct.iter().sum();
        assert_relative_eq!(total, 100.0, epsilon = 1e-9);
        assert_relative_eq!(d.volatility, portfolio_variance(&weights, &cov).sqrt());
    }

    #[test]
    fn test_uncorrelated_contributions() {
        let cov = DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.09]);
        let weights = DVector::from_vec(vec![0.5, 0.5]);
        let d = decompose(&weights, &cov);

        // variance = 0.25 * 0.04 + 0.25 * 0.09 = 0.0325
        assert_relative_eq!(d.variance, 0.0325, epsilon = 1e-12);
        assert_relative_eq!(d.contribution_pct[0], 0.01 / 0.0325 * 100.0, epsilon = 1e-9);
        assert_relative_eq!(d.marginal_risk[1], 0.045 / 0.0325_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_cash_position_contributes_nothing() {
        // Second position is cash: zero row and column
        let cov = DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.0]);
        let weights = DVector::from_vec(vec![0.6, 0.4]);
        let d = decompose(&weights, &cov);
        assert_relative_eq!(d.contribution_pct[0], 100.0, epsilon = 1e-9);
        assert_eq!(d.contribution_pct[1], 0.0);
        assert_eq!(d.marginal_risk[1], 0.0);
    }

    #[test]
    fn test_zero_volatility_is_all_zero() {
        let cov = DMatrix::zeros(2, 2);
        let weights = DVector::from_vec(vec![0.5, 0.5]);
        let d = decompose(&weights, &cov);
        assert!(d.is_degenerate());
        assert_eq!(d.contribution_pct, vec![0.0, 0.0]);
        assert_eq!(d.marginal_risk, vec![0.0, 0.0]);
    }
}
