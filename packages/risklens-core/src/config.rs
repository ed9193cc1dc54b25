//! Analytics configuration and its on-disk location.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How daily returns are derived from prices.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReturnKind {
    /// p_t / p_{t-1} - 1
    #[default]
    Simple,
    /// ln(p_t / p_{t-1})
    Log,
}

/// Tunables for every analytics stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Trading days per year used for annualization
    pub trading_days: u32,
    /// Minimum number of daily returns a ticker needs to be included
    pub min_observations: usize,
    pub return_kind: ReturnKind,
    /// One-tailed VaR confidence level
    pub confidence_level: f64,
    /// Annual risk-free rate used when a request does not supply one
    pub risk_free_rate: f64,
    pub num_simulations: usize,
    /// Upper bound on simulated values returned for histogram rendering
    pub simulation_sample_size: usize,
    pub frontier_points: usize,
    pub top_drivers: usize,
    pub benchmark_ticker: String,
    /// Initial ridge factor (relative to the mean variance) for covariance repair
    pub ridge: f64,
    /// Trades below either threshold are not suggested
    pub min_trade_amount: f64,
    pub min_trade_shares: f64,
    pub backtest_initial_value: f64,
    /// Interior-point iteration cap
    pub solver_max_iterations: u32,
    pub solver_tolerance: f64,
    pub fetch_timeout_secs: u64,
    /// Run Monte Carlo chunks and frontier solves on the rayon pool
    pub parallel: bool,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            trading_days: 252,
            min_observations: 20,
            return_kind: ReturnKind::Simple,
            confidence_level: 0.95,
            risk_free_rate: 0.04,
            num_simulations: 10_000,
            simulation_sample_size: 1_000,
            frontier_points: 20,
            top_drivers: 3,
            benchmark_ticker: "^GSPC".to_string(),
            ridge: 1e-8,
            min_trade_amount: 10.0,
            min_trade_shares: 0.1,
            backtest_initial_value: 10_000.0,
            solver_max_iterations: 200,
            solver_tolerance: 1e-8,
            fetch_timeout_secs: 30,
            parallel: true,
        }
    }
}

impl AnalyticsConfig {
    /// Load the config from the default path, falling back to defaults when absent.
    ///
    /// Default path: `<config dir>/risklens/config.json`.
    /// Can be overridden with `RISKLENS_CONFIG` environment variable.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::default_path())
    }

    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = env::var("RISKLENS_CONFIG") {
            return PathBuf::from(path);
        }

        directories::ProjectDirs::from("", "", "risklens")
            .map(|dirs| dirs.config_dir().join("config.json"))
            .unwrap_or_else(|| PathBuf::from("risklens.json"))
    }

    /// Load from a specific path. A missing file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON, creating parent directories.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject values that would make the analytics meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.trading_days == 0 {
            return Err(Error::Config("trading_days must be positive".to_string()));
        }
        if self.min_observations < 2 {
            return Err(Error::Config(
                "min_observations must be at least 2".to_string(),
            ));
        }
        if !(self.confidence_level > 0.5 && self.confidence_level < 1.0) {
            return Err(Error::Config(format!(
                "confidence_level must be in (0.5, 1), got {}",
                self.confidence_level
            )));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(Error::Config("risk_free_rate must be finite".to_string()));
        }
        if self.num_simulations == 0 {
            return Err(Error::Config("num_simulations must be positive".to_string()));
        }
        if self.frontier_points < 2 {
            return Err(Error::Config(
                "frontier_points must be at least 2".to_string(),
            ));
        }
        if !(self.ridge.is_finite() && self.ridge > 0.0) {
            return Err(Error::Config("ridge must be positive".to_string()));
        }
        if !(self.solver_tolerance.is_finite() && self.solver_tolerance > 0.0) {
            return Err(Error::Config("solver_tolerance must be positive".to_string()));
        }
        if self.solver_max_iterations == 0 {
            return Err(Error::Config(
                "solver_max_iterations must be positive".to_string(),
            ));
        }
        if !(self.backtest_initial_value.is_finite() && self.backtest_initial_value > 0.0) {
            return Err(Error::Config(
                "backtest_initial_value must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
