//! RiskLens Core - portfolio risk and performance analytics.
//!
//! This crate turns a list of positions plus a historical price panel into
//! risk and performance metrics:
//!
//! - **Returns & covariance**: aligned daily returns, annualized covariance and correlation
//! - **Risk decomposition**: portfolio volatility, marginal and Euler risk contributions
//! - **Value at Risk**: parametric (closed form) and Monte Carlo (VaR, CVaR)
//! - **Performance**: Sharpe, Sortino, benchmark alpha/beta, drawdowns, growth backtest
//! - **Stress testing**: historical crisis scenarios
//! - **Optimization**: efficient frontier, max-Sharpe / min-volatility portfolios, rebalancing
//!
//! Market data, asset metadata and the scenario catalog are collaborators
//! behind traits; the crate itself performs no network I/O.
//!
//! # Example
//!
//! ```rust,no_run
//! use risklens_core::{
//!     AnalyticsConfig, AssetClass, InMemoryMarketData, Period, Portfolio, Position, RiskEngine,
//! };
//!
//! let portfolio = Portfolio::new(vec![
//!     Position::new("AAPL", 100.0, AssetClass::Equity),
//!     Position::new("MSFT", 50.0, AssetClass::Equity),
//! ])?;
//!
//! let market = InMemoryMarketData::from_json_file("prices.json")?;
//! let engine = RiskEngine::new(market, AnalyticsConfig::default());
//!
//! let output = engine.analyze(&portfolio, Period::OneYear, 0.04)?;
//! println!("1-day VaR (95%): ${:.2}", output.var_95);
//! # Ok::<(), risklens_core::Error>(())
//! ```

pub mod analytics;
pub mod config;
pub mod engine;
pub mod market;
pub mod optimizer;
pub mod scenarios;
pub mod types;

// Re-export commonly used types
pub use config::{AnalyticsConfig, ReturnKind};
pub use engine::{AnalysisRequest, OptimizationRequest, RiskEngine};
pub use market::{
    AssetMetadata, AssetMetadataSource, InMemoryMarketData, MarketDataSource, PanelFetch,
    PricePanel, PricePoint, TimedSource,
};
pub use optimizer::{
    ClarabelSolver, Frontier, OptimalPortfolio, OptimizationResult, QpProblem, QpSolver,
    RebalancingTrade,
};
pub use scenarios::{
    CustomScenarioCatalog, Scenario, ScenarioCatalog, ScenarioImpact, Severity,
    StaticScenarioCatalog,
};
pub use types::{
    ApiResponse, AssetClass, Period, Portfolio, Position, PositionRisk, RiskOutput, TradeAction,
    Warning, WarningCode,
};

/// Error types for risklens-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Ticker not found: {0}")]
    TickerNotFound(String),

    #[error("Insufficient history: {0}")]
    InsufficientHistory(String),

    #[error("Market data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Numeric instability: {0}")]
    NumericInstability(String),

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("Computation budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type for risklens-core operations.
pub type Result<T> = std::result::Result<T, Error>;
