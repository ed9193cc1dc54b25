//! Core data types for the RiskLens analytics engine.

use crate::analytics::{
    BacktestSeries, BenchmarkComparison, CorrelationMatrix, DrawdownMetrics, Explanation,
    MonteCarloResult, PerformanceMetrics, SectorBreakdown,
};
use crate::{Error, Result};
use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Asset classification of a position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssetClass {
    Equity,
    Bond,
    Cash,
}

impl AssetClass {
    /// Cash carries no market risk and is never priced through market data.
    pub fn is_cash(self) -> bool {
        matches!(self, AssetClass::Cash)
    }
}

/// A holding in the portfolio.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    /// Ticker symbol (uppercase)
    pub ticker: String,
    /// Number of shares/units held
    pub quantity: f64,
    /// Asset classification
    pub asset_class: AssetClass,
    /// Average purchase price per unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_price: Option<f64>,
    /// Date the position was opened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_date: Option<NaiveDate>,
}

impl Position {
    /// Create a new position with the given ticker, quantity, and asset class.
    pub fn new(ticker: &str, quantity: f64, asset_class: AssetClass) -> Self {
        Self {
            ticker: ticker.trim().to_uppercase(),
            quantity,
            asset_class,
            avg_price: None,
            purchase_date: None,
        }
    }

    /// Attach an average purchase price.
    pub fn with_avg_price(mut self, avg_price: f64) -> Self {
        self.avg_price = Some(avg_price);
        self
    }

    /// Attach a purchase date.
    pub fn with_purchase_date(mut self, date: NaiveDate) -> Self {
        self.purchase_date = Some(date);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.ticker.is_empty() {
            return Err(Error::Validation("ticker must not be empty".to_string()));
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(Error::Validation(format!(
                "quantity for {} must be positive, got {}",
                self.ticker, self.quantity
            )));
        }
        if let Some(price) = self.avg_price {
            if !price.is_finite() || price < 0.0 {
                return Err(Error::Validation(format!(
                    "avg_price for {} must be non-negative, got {}",
                    self.ticker, price
                )));
            }
        }
        Ok(())
    }
}

/// A validated, ordered set of positions with unique tickers.
///
/// Construct with [`Portfolio::new`] (rejects duplicate tickers) or
/// [`Portfolio::merging`] (folds duplicates into one position).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "PortfolioInput")]
pub struct Portfolio {
    positions: Vec<Position>,
}

/// Unvalidated wire shape of a portfolio.
#[derive(Debug, Deserialize)]
struct PortfolioInput {
    positions: Vec<Position>,
}

impl TryFrom<PortfolioInput> for Portfolio {
    type Error = Error;

    fn try_from(input: PortfolioInput) -> Result<Self> {
        Portfolio::new(input.positions)
    }
}

impl Portfolio {
    /// Build a portfolio, rejecting empty input, invalid quantities and duplicate tickers.
    pub fn new(positions: Vec<Position>) -> Result<Self> {
        if positions.is_empty() {
            return Err(Error::Validation(
                "portfolio must contain at least one position".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut normalized = Vec::with_capacity(positions.len());
        for position in positions {
            let position = Position {
                ticker: position.ticker.trim().to_uppercase(),
                ..position
            };
            position.validate()?;
            if !seen.insert(position.ticker.clone()) {
                return Err(Error::Validation(format!(
                    "duplicate ticker: {}",
                    position.ticker
                )));
            }
            normalized.push(position);
        }

        Ok(Self {
            positions: normalized,
        })
    }

    /// Build a portfolio, merging duplicate tickers.
    ///
    /// Quantities are summed and `avg_price` becomes the quantity-weighted
    /// average of the known prices. The earliest purchase date is kept.
    /// First-seen order is preserved.
    pub fn merging(positions: Vec<Position>) -> Result<Self> {
        let mut merged: Vec<Position> = Vec::with_capacity(positions.len());

        for position in positions {
            let position = Position {
                ticker: position.ticker.trim().to_uppercase(),
                ..position
            };
            position.validate()?;

            match merged.iter_mut().find(|p| p.ticker == position.ticker) {
                Some(existing) => {
                    if existing.asset_class != position.asset_class {
                        return Err(Error::Validation(format!(
                            "conflicting asset classes for {}",
                            position.ticker
                        )));
                    }
                    let total = existing.quantity + position.quantity;
                    existing.avg_price = match (existing.avg_price, position.avg_price) {
                        (Some(a), Some(b)) => {
                            Some((existing.quantity * a + position.quantity * b) / total)
                        }
                        (a, b) => a.or(b),
                    };
                    existing.purchase_date = match (existing.purchase_date, position.purchase_date) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                    existing.quantity = total;
                }
                None => merged.push(position),
            }
        }

        Self::new(merged)
    }

    /// All positions in input order.
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// Find a position by ticker (case-insensitive).
    pub fn find(&self, ticker: &str) -> Option<&Position> {
        let ticker = ticker.to_uppercase();
        self.positions.iter().find(|p| p.ticker == ticker)
    }

    /// Tickers of the positions that need market prices.
    pub fn risky_tickers(&self) -> Vec<String> {
        self.positions
            .iter()
            .filter(|p| !p.asset_class.is_cash())
            .map(|p| p.ticker.clone())
            .collect()
    }

    pub fn holds_cash(&self) -> bool {
        self.positions.iter().any(|p| p.asset_class.is_cash())
    }

    /// Get the number of positions.
    pub fn position_count(&self) -> usize {
        self.positions.len()
    }
}

/// Historical lookback window for an analysis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Period {
    #[serde(rename = "1M")]
    OneMonth,
    #[serde(rename = "3M")]
    ThreeMonths,
    #[serde(rename = "6M")]
    SixMonths,
    #[default]
    #[serde(rename = "1Y")]
    OneYear,
    #[serde(rename = "3Y")]
    ThreeYears,
    #[serde(rename = "5Y")]
    FiveYears,
    #[serde(rename = "YTD")]
    YearToDate,
    #[serde(rename = "MAX")]
    Max,
}

impl Period {
    /// All supported periods.
    pub const ALL: [Period; 8] = [
        Period::OneMonth,
        Period::ThreeMonths,
        Period::SixMonths,
        Period::OneYear,
        Period::ThreeYears,
        Period::FiveYears,
        Period::YearToDate,
        Period::Max,
    ];

    /// Short code used on the wire.
    pub fn code(self) -> &'static str {
        match self {
            Period::OneMonth => "1M",
            Period::ThreeMonths => "3M",
            Period::SixMonths => "6M",
            Period::OneYear => "1Y",
            Period::ThreeYears => "3Y",
            Period::FiveYears => "5Y",
            Period::YearToDate => "YTD",
            Period::Max => "MAX",
        }
    }

    /// First calendar date inside the window that ends at `end`.
    ///
    /// Returns `None` for [`Period::Max`] (no lower bound).
    pub fn start_date(self, end: NaiveDate) -> Option<NaiveDate> {
        let months = match self {
            Period::OneMonth => 1,
            Period::ThreeMonths => 3,
            Period::SixMonths => 6,
            Period::OneYear => 12,
            Period::ThreeYears => 36,
            Period::FiveYears => 60,
            Period::YearToDate => return NaiveDate::from_ymd_opt(end.year(), 1, 1),
            Period::Max => return None,
        };
        end.checked_sub_months(Months::new(months))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Period {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        Period::ALL
            .into_iter()
            .find(|p| p.code() == upper)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "unknown period '{}', expected one of 1M, 3M, 6M, 1Y, 3Y, 5Y, YTD, MAX",
                    s
                ))
            })
    }
}

/// Trade direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

/// Category of a non-fatal condition reported alongside a result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarningCode {
    TickerNotFound,
    TickerExcluded,
    CovarianceRegularized,
    ZeroVolatility,
    NonFiniteValue,
    BenchmarkUnavailable,
    MonteCarloUnavailable,
    MonteCarloTruncated,
    DrawdownUnavailable,
    BacktestUnavailable,
    SectorBreakdownUnavailable,
    FrontierPointSkipped,
    MaxSharpeFallback,
}

/// A non-fatal condition encountered while building a result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Warning {
    pub code: WarningCode,
    pub message: String,
}

impl Warning {
    pub fn new(code: WarningCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Per-position risk breakdown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionRisk {
    pub ticker: String,
    pub asset_class: AssetClass,
    pub quantity: f64,
    /// Last known price (1.0 for cash)
    pub current_price: f64,
    /// Market value (quantity * current_price)
    pub value: f64,
    /// Share of total portfolio value
    pub weight: f64,
    /// Annualized standalone volatility
    pub volatility: f64,
    /// Euler risk contribution as a percentage of total portfolio risk
    pub risk_contribution_pct: f64,
    /// Marginal contribution to portfolio volatility, (Σw)_i / σ_p
    pub marginal_risk: f64,
}

/// Complete risk analysis output.
///
/// Produced fresh per request. Optional blocks are `None` when the
/// corresponding sub-metric could not be computed; the reason is listed in
/// `warnings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskOutput {
    /// Total portfolio value
    pub total_value: f64,
    /// Annualized portfolio volatility (decimal, e.g. 0.18)
    pub volatility_annualized: f64,
    /// Parametric 1-day Value at Risk at `confidence_level`, in currency units
    pub var_95: f64,
    pub confidence_level: f64,
    pub period: Period,
    /// First and last price dates used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    pub positions: Vec<PositionRisk>,
    pub performance: PerformanceMetrics,
    pub correlation_matrix: CorrelationMatrix,
    pub benchmark: Option<BenchmarkComparison>,
    pub monte_carlo: Option<MonteCarloResult>,
    pub drawdown: Option<DrawdownMetrics>,
    pub backtest: Option<BacktestSeries>,
    pub sector_breakdown: Option<SectorBreakdown>,
    pub explanation: Explanation,
    /// Applied factor shocks, if any
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub factor_shocks: BTreeMap<String, f64>,
    #[serde(default)]
    pub warnings: Vec<Warning>,
}

/// API response wrapper used by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response.
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response.
    pub fn err(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}
