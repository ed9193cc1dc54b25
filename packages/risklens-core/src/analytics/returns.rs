//! Daily returns, annualized moments and covariance repair.

use crate::config::{AnalyticsConfig, ReturnKind};
use crate::market::{AlignedPanel, PricePoint};
use crate::types::Warning;
use crate::{Error, Result};
use chrono::NaiveDate;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Returns derived from a price series, in order.
pub fn daily_returns(prices: &[f64], kind: ReturnKind) -> Vec<f64> {
    prices
        .windows(2)
        .map(|pair| match kind {
            ReturnKind::Simple => pair[1] / pair[0] - 1.0,
            ReturnKind::Log => (pair[1] / pair[0]).ln(),
        })
        .collect()
}

/// Returns keyed by the date of the later observation.
pub fn dated_returns(points: &[PricePoint], kind: ReturnKind) -> Vec<(NaiveDate, f64)> {
    let closes: Vec<f64> = points.iter().map(|p| p.close).collect();
    points
        .iter()
        .skip(1)
        .map(|p| p.date)
        .zip(daily_returns(&closes, kind))
        .collect()
}

/// Aligned daily returns for a set of tickers plus their annualized moments.
#[derive(Debug, Clone)]
pub struct AssetReturns {
    pub tickers: Vec<String>,
    /// Dates of the aligned price index (one more than `return_dates`)
    pub price_dates: Vec<NaiveDate>,
    pub return_dates: Vec<NaiveDate>,
    /// Rows are return dates, columns are tickers, measured per `return_kind`
    pub returns: DMatrix<f64>,
    /// Simple returns on the same grid, used for anything that compounds
    pub simple_returns: DMatrix<f64>,
    pub last_prices: Vec<f64>,
    /// Annualized mean return per ticker
    pub mean_returns: DVector<f64>,
    pub covariance: CovarianceMatrix,
    pub warnings: Vec<Warning>,
}

impl AssetReturns {
    /// Derive returns and moments from an aligned panel.
    pub fn from_aligned(panel: AlignedPanel, config: &AnalyticsConfig) -> Result<Self> {
        let rows = panel.prices.nrows();
        let cols = panel.prices.ncols();
        if rows < 2 || cols == 0 {
            return Err(Error::InsufficientHistory(format!(
                "{} aligned prices for {} tickers, need at least 2",
                rows, cols
            )));
        }

        let simple_returns = DMatrix::from_fn(rows - 1, cols, |row, col| {
            panel.prices[(row + 1, col)] / panel.prices[(row, col)] - 1.0
        });
        let returns = match config.return_kind {
            ReturnKind::Simple => simple_returns.clone(),
            ReturnKind::Log => simple_returns.map(f64::ln_1p),
        };

        let trading_days = f64::from(config.trading_days);
        let mean_returns = DVector::from_iterator(
            cols,
            (0..cols).map(|col| returns.column(col).sum() / (rows - 1) as f64 * trading_days),
        );
        let covariance = CovarianceMatrix::from_returns(&panel.tickers, &returns, trading_days);
        let last_prices = panel.last_prices();

        debug!(
            tickers = cols,
            observations = rows - 1,
            "computed asset returns"
        );

        Ok(Self {
            tickers: panel.tickers,
            return_dates: panel.dates[1..].to_vec(),
            price_dates: panel.dates,
            returns,
            simple_returns,
            last_prices,
            mean_returns,
            covariance,
            warnings: panel.warnings,
        })
    }

    pub fn observations(&self) -> usize {
        self.returns.nrows()
    }

    pub fn column_of(&self, ticker: &str) -> Option<usize> {
        self.tickers.iter().position(|t| t == ticker)
    }

    /// Simple daily returns of a constant-weight portfolio over these tickers.
    ///
    /// `weights` has one entry per ticker and need not sum to one; the
    /// remainder is assumed to sit in a zero-return asset.
    pub fn portfolio_returns(&self, weights: &DVector<f64>) -> Vec<f64> {
        (&self.simple_returns * weights).iter().copied().collect()
    }

    /// Portfolio returns paired with their dates.
    pub fn dated_portfolio_returns(&self, weights: &DVector<f64>) -> Vec<(NaiveDate, f64)> {
        self.return_dates
            .iter()
            .copied()
            .zip(self.portfolio_returns(weights))
            .collect()
    }
}

/// Annualized sample covariance of daily returns.
#[derive(Debug, Clone, PartialEq)]
pub struct CovarianceMatrix {
    pub tickers: Vec<String>,
    pub matrix: DMatrix<f64>,
}

impl CovarianceMatrix {
    /// Sample covariance (n - 1 denominator) scaled by `trading_days`.
    pub fn from_returns(tickers: &[String], returns: &DMatrix<f64>, trading_days: f64) -> Self {
        let rows = returns.nrows();
        let cols = returns.ncols();
        let mut centered = returns.clone();
        for col in 0..cols {
            let mean = returns.column(col).sum() / rows as f64;
            for row in 0..rows {
                centered[(row, col)] -= mean;
            }
        }

        let denominator = rows.saturating_sub(1).max(1) as f64;
        let matrix = centered.transpose() * &centered * (trading_days / denominator);

        Self {
            tickers: tickers.to_vec(),
            matrix,
        }
    }

    pub fn len(&self) -> usize {
        self.tickers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty()
    }

    /// Annualized volatility of ticker `i`.
    pub fn volatility(&self, i: usize) -> f64 {
        self.matrix[(i, i)].max(0.0).sqrt()
    }

    /// Embed into a larger matrix whose rows map to `columns`.
    ///
    /// `None` entries (cash) get zero rows and columns.
    pub fn expand(&self, columns: &[Option<usize>]) -> DMatrix<f64> {
        let n = columns.len();
        DMatrix::from_fn(n, n, |i, j| match (columns[i], columns[j]) {
            (Some(a), Some(b)) => self.matrix[(a, b)],
            _ => 0.0,
        })
    }

    /// Pairwise Pearson correlations.
    pub fn correlation(&self) -> CorrelationMatrix {
        let n = self.len();
        let mut entries = Vec::with_capacity(n * n.saturating_sub(1) / 2);
        for i in 0..n {
            for j in (i + 1)..n {
                let denominator = self.volatility(i) * self.volatility(j);
                let correlation = if denominator > 0.0 {
                    Some((self.matrix[(i, j)] / denominator).clamp(-1.0, 1.0))
                } else {
                    None
                };
                entries.push(CorrelationEntry {
                    ticker1: self.tickers[i].clone(),
                    ticker2: self.tickers[j].clone(),
                    correlation,
                });
            }
        }
        CorrelationMatrix {
            tickers: self.tickers.clone(),
            entries,
        }
    }
}

/// One unordered ticker pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrelationEntry {
    pub ticker1: String,
    pub ticker2: String,
    /// `None` when either series has zero variance
    pub correlation: Option<f64>,
}

/// Upper triangle of the correlation matrix.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CorrelationMatrix {
    pub tickers: Vec<String>,
    pub entries: Vec<CorrelationEntry>,
}

impl CorrelationMatrix {
    /// Correlation of two tickers in either order; 1 on the diagonal.
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        if a == b && self.tickers.iter().any(|t| t == a) {
            return Some(1.0);
        }
        self.entries
            .iter()
            .find(|e| (e.ticker1 == a && e.ticker2 == b) || (e.ticker1 == b && e.ticker2 == a))
            .and_then(|e| e.correlation)
    }
}

/// A positive-definite covariance and its factorization.
#[derive(Clone)]
pub struct RegularizedCovariance {
    pub matrix: DMatrix<f64>,
    pub cholesky: Cholesky<f64, Dyn>,
    /// Absolute ridge added to the diagonal; 0 when none was needed
    pub ridge: f64,
}

impl RegularizedCovariance {
    pub fn was_regularized(&self) -> bool {
        self.ridge > 0.0
    }

    /// Lower-triangular factor `L` with `L * L^T = matrix`.
    pub fn lower(&self) -> DMatrix<f64> {
        self.cholesky.l()
    }
}

const MAX_RIDGE_ATTEMPTS: usize = 12;

/// Squared pivots below this fraction of the largest variance count as singular.
const PIVOT_FLOOR: f64 = 1e-12;

/// Cholesky factorization that also rejects numerically singular pivots.
fn try_factor(matrix: &DMatrix<f64>) -> Option<Cholesky<f64, Dyn>> {
    let floor = matrix.diagonal().amax() * PIVOT_FLOOR;
    let cholesky = matrix.clone().cholesky()?;
    let lower = cholesky.l();
    let sound = lower.iter().all(|v| v.is_finite())
        && lower.diagonal().iter().all(|d| d * d > floor);
    sound.then_some(cholesky)
}

/// Symmetrize and, if needed, add a growing diagonal ridge until the matrix
/// admits a Cholesky factorization.
///
/// The first ridge is `relative_ridge` times the mean diagonal; each failed
/// attempt multiplies it by ten.
pub fn regularize(matrix: &DMatrix<f64>, relative_ridge: f64) -> Result<RegularizedCovariance> {
    let n = matrix.nrows();
    if n == 0 || n != matrix.ncols() {
        return Err(Error::NumericInstability(format!(
            "covariance must be square and non-empty, got {}x{}",
            matrix.nrows(),
            matrix.ncols()
        )));
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(Error::NumericInstability(
            "covariance contains non-finite entries".to_string(),
        ));
    }

    let symmetric = (matrix + matrix.transpose()) * 0.5;
    if let Some(cholesky) = try_factor(&symmetric) {
        return Ok(RegularizedCovariance {
            matrix: symmetric,
            cholesky,
            ridge: 0.0,
        });
    }

    let scale = symmetric.diagonal().iter().map(|v| v.abs()).sum::<f64>() / n as f64;
    let mut ridge = relative_ridge * scale.max(f64::MIN_POSITIVE.sqrt());
    for _ in 0..MAX_RIDGE_ATTEMPTS {
        let candidate = &symmetric + DMatrix::identity(n, n) * ridge;
        if let Some(cholesky) = try_factor(&candidate) {
            warn!(ridge, "covariance was not positive definite, added diagonal ridge");
            return Ok(RegularizedCovariance {
                matrix: candidate,
                cholesky,
                ridge,
            });
        }
        ridge *= 10.0;
    }

    Err(Error::NumericInstability(format!(
        "covariance could not be made positive definite (last ridge {:e})",
        ridge / 10.0
    )))
}
