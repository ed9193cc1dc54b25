//! RiskLens CLI - portfolio risk analytics from the command line.
//!
//! Every command prints one pretty JSON `ApiResponse` on stdout. Logs go to
//! stderr and are controlled with `RUST_LOG`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use risklens_core::{
    AnalysisRequest, AnalyticsConfig, ApiResponse, InMemoryMarketData, OptimizationRequest, Period,
    Portfolio, RiskEngine,
};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "risklens")]
#[command(about = "RiskLens - portfolio risk, performance and optimization analytics")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $RISKLENS_CONFIG or the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze portfolio risk and performance
    Analyze {
        /// Portfolio JSON file ({"positions": [...]})
        #[arg(short, long)]
        portfolio: PathBuf,
        /// Market data JSON file ({"prices": {...}, "metadata": {...}})
        #[arg(long)]
        prices: PathBuf,
        /// Lookback period (1M, 3M, 6M, 1Y, 3Y, 5Y, YTD, MAX)
        #[arg(long, default_value = "1Y")]
        period: Period,
        /// Annual risk-free rate (defaults to the configured rate)
        #[arg(long)]
        risk_free_rate: Option<f64>,
        /// Monte Carlo seed for reproducible output
        #[arg(long)]
        seed: Option<u64>,
        /// Factor shock as TICKER=SHOCK, repeatable (e.g. AAPL=-0.1)
        #[arg(long = "shock", value_parser = parse_shock)]
        shocks: Vec<(String, f64)>,
        /// Time budget for Monte Carlo, in milliseconds
        #[arg(long)]
        budget_ms: Option<u64>,
    },
    /// Efficient frontier and rebalancing suggestions
    Optimize {
        #[arg(short, long)]
        portfolio: PathBuf,
        #[arg(long)]
        prices: PathBuf,
        #[arg(long, default_value = "1Y")]
        period: Period,
        #[arg(long)]
        risk_free_rate: Option<f64>,
        /// Time budget for frontier solves, in milliseconds
        #[arg(long)]
        budget_ms: Option<u64>,
    },
    /// Historical stress scenarios
    Scenarios {
        #[command(subcommand)]
        action: ScenarioAction,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum ScenarioAction {
    /// List available scenarios
    List,
    /// Apply a scenario to a portfolio value
    Test {
        /// Scenario ID
        #[arg(short, long)]
        id: String,
        /// Current portfolio value
        #[arg(short, long)]
        value: f64,
    },
}

fn parse_shock(raw: &str) -> std::result::Result<(String, f64), String> {
    let (ticker, shock) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected TICKER=SHOCK, got '{}'", raw))?;
    let shock: f64 = shock
        .trim()
        .parse()
        .map_err(|e| format!("invalid shock '{}': {}", shock, e))?;
    Ok((ticker.trim().to_uppercase(), shock))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let outcome = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Analyze {
            portfolio,
            prices,
            period,
            risk_free_rate,
            seed,
            shocks,
            budget_ms,
        } => {
            let mut request = AnalysisRequest::new(period);
            request.risk_free_rate = risk_free_rate;
            request.seed = seed;
            request.factor_shocks = shocks.into_iter().collect();
            if let Some(ms) = budget_ms {
                request = request.with_budget(Duration::from_millis(ms));
            }
            handle_analyze(&portfolio, &prices, &request, config)
        }
        Commands::Optimize {
            portfolio,
            prices,
            period,
            risk_free_rate,
            budget_ms,
        } => {
            let mut request = OptimizationRequest::new(period);
            request.risk_free_rate = risk_free_rate;
            if let Some(ms) = budget_ms {
                request = request.with_budget(Duration::from_millis(ms));
            }
            handle_optimize(&portfolio, &prices, &request, config)
        }
        Commands::Scenarios { action } => handle_scenarios(action, config),
        Commands::Config => to_json(&config),
    });

    let (body, code) = match outcome {
        Ok(data) => (render(&ApiResponse::ok(data)), ExitCode::SUCCESS),
        Err(e) => (
            render(&ApiResponse::<()>::err(format!("{:#}", e))),
            ExitCode::FAILURE,
        ),
    };
    println!("{}", body);
    code
}

fn render<T: Serialize>(response: &ApiResponse<T>) -> String {
    serde_json::to_string_pretty(response)
        .unwrap_or_else(|e| format!(r#"{{"ok":false,"error":"serialization failed: {}"}}"#, e))
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).context("failed to serialize result")
}

fn load_config(path: Option<&Path>) -> Result<AnalyticsConfig> {
    match path {
        Some(path) => AnalyticsConfig::load_from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => AnalyticsConfig::load().context("failed to load config"),
    }
}

fn load_portfolio(path: &Path) -> Result<Portfolio> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read portfolio {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid portfolio {}", path.display()))
}

fn build_engine(prices: &Path, config: AnalyticsConfig) -> Result<RiskEngine> {
    let market = Arc::new(
        InMemoryMarketData::from_json_file(prices)
            .with_context(|| format!("failed to load market data {}", prices.display()))?,
    );
    Ok(RiskEngine::from_shared(market.clone(), config).with_metadata_source(market))
}

fn handle_analyze(
    portfolio: &Path,
    prices: &Path,
    request: &AnalysisRequest,
    config: AnalyticsConfig,
) -> Result<serde_json::Value> {
    let portfolio = load_portfolio(portfolio)?;
    let engine = build_engine(prices, config)?;
    let output = engine.analyze_with(&portfolio, request)?;
    to_json(&output)
}

fn handle_optimize(
    portfolio: &Path,
    prices: &Path,
    request: &OptimizationRequest,
    config: AnalyticsConfig,
) -> Result<serde_json::Value> {
    let portfolio = load_portfolio(portfolio)?;
    let engine = build_engine(prices, config)?;
    let result = engine.optimize_with(&portfolio, request)?;
    to_json(&result)
}

fn handle_scenarios(action: ScenarioAction, config: AnalyticsConfig) -> Result<serde_json::Value> {
    let engine = RiskEngine::new(InMemoryMarketData::default(), config);
    match action {
        ScenarioAction::List => {
            let scenarios = engine.list_scenarios();
            Ok(json!({
                "count": scenarios.len(),
                "scenarios": scenarios,
            }))
        }
        ScenarioAction::Test { id, value } => to_json(&engine.test_scenario(&id, value)?),
    }
}
