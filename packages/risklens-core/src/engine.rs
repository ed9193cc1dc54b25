//! Request orchestration.
//!
//! [`RiskEngine`] fetches history for a portfolio, runs the analytics stages
//! and assembles one [`RiskOutput`] or [`OptimizationResult`]. Returns,
//! covariance and decomposition always run; every other block degrades to
//! `None` plus a warning when it cannot be computed.

use crate::analytics::{
    compare_to_benchmark, decompose, drawdown_metrics, dated_returns, explain, finite_or_warn,
    growth_of_investment, parametric_var, performance_metrics, regularize, sector_breakdown,
    simulate, wealth_index, AssetReturns, BacktestSeries, BenchmarkComparison, CorrelationMatrix,
    DrawdownMetrics, Explanation, MonteCarloParams, MonteCarloResult, PerformanceMetrics,
    SectorBreakdown, SimulationInputs,
};
use crate::config::{AnalyticsConfig, ReturnKind};
use crate::market::{clean_series, AssetMetadataSource, MarketDataSource, TimedSource};
use crate::optimizer::{
    rebalancing_trades, ClarabelSolver, Holding, MeanVarianceInputs, MeanVarianceOptimizer,
    OptimizationResult, QpSolver,
};
use crate::scenarios::{Scenario, ScenarioCatalog, ScenarioImpact, StaticScenarioCatalog};
use crate::types::{
    AssetClass, Period, Portfolio, Position, PositionRisk, RiskOutput, Warning, WarningCode,
};
use crate::{Error, Result};
use chrono::NaiveDate;
use nalgebra::{DMatrix, DVector};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Options for [`RiskEngine::analyze_with`].
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub period: Period,
    /// Falls back to [`AnalyticsConfig::risk_free_rate`]
    pub risk_free_rate: Option<f64>,
    /// Monte Carlo seed; a fresh one is drawn when `None`
    pub seed: Option<u64>,
    /// Annual return shocks per ticker, added to expected returns before
    /// performance metrics
    pub factor_shocks: BTreeMap<String, f64>,
    pub deadline: Option<Instant>,
    pub include_monte_carlo: bool,
    pub include_benchmark: bool,
    pub include_drawdown: bool,
    pub include_backtest: bool,
    pub include_sectors: bool,
}

impl Default for AnalysisRequest {
    fn default() -> Self {
        Self {
            period: Period::default(),
            risk_free_rate: None,
            seed: None,
            factor_shocks: BTreeMap::new(),
            deadline: None,
            include_monte_carlo: true,
            include_benchmark: true,
            include_drawdown: true,
            include_backtest: true,
            include_sectors: true,
        }
    }
}

impl AnalysisRequest {
    pub fn new(period: Period) -> Self {
        Self {
            period,
            ..Self::default()
        }
    }

    pub fn with_risk_free_rate(mut self, rate: f64) -> Self {
        self.risk_free_rate = Some(rate);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_factor_shock(mut self, ticker: &str, shock: f64) -> Self {
        self.factor_shocks.insert(ticker.trim().to_uppercase(), shock);
        self
    }

    /// Bound Monte Carlo work to `budget` from now.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.deadline = Some(Instant::now() + budget);
        self
    }
}

/// Options for [`RiskEngine::optimize_with`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationRequest {
    pub period: Period,
    pub risk_free_rate: Option<f64>,
    /// Frontier points are not started after this instant
    pub deadline: Option<Instant>,
}

impl OptimizationRequest {
    pub fn new(period: Period) -> Self {
        Self {
            period,
            ..Self::default()
        }
    }

    pub fn with_risk_free_rate(mut self, rate: f64) -> Self {
        self.risk_free_rate = Some(rate);
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.deadline = Some(Instant::now() + budget);
        self
    }
}

/// A position that made it into the analysis.
struct Valued<'a> {
    position: &'a Position,
    price: f64,
    value: f64,
    /// Column in [`AssetReturns`]; `None` for cash
    column: Option<usize>,
}

/// Portfolio risk analytics over a market data collaborator.
///
/// The engine holds no per-request state and can be shared across threads.
#[derive(Clone)]
pub struct RiskEngine {
    market: Arc<dyn MarketDataSource>,
    benchmark: Option<Arc<dyn MarketDataSource>>,
    metadata: Option<Arc<dyn AssetMetadataSource>>,
    scenarios: Arc<dyn ScenarioCatalog>,
    solver: Arc<dyn QpSolver>,
    config: AnalyticsConfig,
}

impl RiskEngine {
    pub fn new(market: impl MarketDataSource + 'static, config: AnalyticsConfig) -> Self {
        Self::from_shared(Arc::new(market), config)
    }

    /// Build around a shared source. Requests are bounded by
    /// `config.fetch_timeout_secs` unless it is zero.
    pub fn from_shared(market: Arc<dyn MarketDataSource>, config: AnalyticsConfig) -> Self {
        let market: Arc<dyn MarketDataSource> = if config.fetch_timeout_secs > 0 {
            Arc::new(TimedSource::new(market, config.fetch_timeout()))
        } else {
            market
        };
        Self {
            market,
            benchmark: None,
            metadata: None,
            scenarios: Arc::new(StaticScenarioCatalog),
            solver: Arc::new(ClarabelSolver::from_config(&config)),
            config,
        }
    }

    /// Fetch the benchmark from a different source than portfolio prices.
    pub fn with_benchmark_source(mut self, source: Arc<dyn MarketDataSource>) -> Self {
        self.benchmark = Some(source);
        self
    }

    /// Enable the sector/country exposure block.
    pub fn with_metadata_source(mut self, source: Arc<dyn AssetMetadataSource>) -> Self {
        self.metadata = Some(source);
        self
    }

    pub fn with_scenario_catalog(mut self, catalog: Arc<dyn ScenarioCatalog>) -> Self {
        self.scenarios = catalog;
        self
    }

    pub fn with_solver(mut self, solver: Arc<dyn QpSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    /// Full analysis with default options.
    pub fn analyze(
        &self,
        portfolio: &Portfolio,
        period: Period,
        risk_free_rate: f64,
    ) -> Result<RiskOutput> {
        self.analyze_with(
            portfolio,
            &AnalysisRequest::new(period).with_risk_free_rate(risk_free_rate),
        )
    }

    pub fn analyze_with(
        &self,
        portfolio: &Portfolio,
        request: &AnalysisRequest,
    ) -> Result<RiskOutput> {
        let config = &self.config;
        let risk_free_rate = self.risk_free_rate(request.risk_free_rate)?;
        for (ticker, shock) in &request.factor_shocks {
            if !shock.is_finite() {
                return Err(Error::Validation(format!(
                    "factor shock for {} must be finite, got {}",
                    ticker, shock
                )));
            }
        }

        let mut warnings = Vec::new();
        let history = match self.load_history(portfolio, request.period, &mut warnings) {
            // Unresolved tickers are already in the warnings; the cash remains.
            Err(Error::TickerNotFound(missing)) if portfolio.holds_cash() => {
                warn!(%missing, "no risky ticker resolved, analyzing cash only");
                None
            }
            other => other?,
        };
        let (valued, total_value) = value_positions(portfolio, history.as_ref())?;

        info!(
            positions = valued.len(),
            total_value,
            period = %request.period,
            "analyzing portfolio"
        );

        // Decomposition over every valued position, cash rows zeroed.
        let weights =
            DVector::from_iterator(valued.len(), valued.iter().map(|v| v.value / total_value));
        let covariance = match &history {
            Some(h) => h
                .covariance
                .expand(&valued.iter().map(|v| v.column).collect::<Vec<_>>()),
            None => DMatrix::zeros(valued.len(), valued.len()),
        };
        let decomposition = decompose(&weights, &covariance);
        let volatility =
            finite_or_warn(decomposition.volatility, "volatility_annualized", &mut warnings)
                .unwrap_or(0.0);
        if history.is_some() && decomposition.is_degenerate() {
            warnings.push(Warning::new(
                WarningCode::ZeroVolatility,
                "portfolio volatility is zero; risk contributions are reported as 0",
            ));
        }

        let var = finite_or_warn(
            parametric_var(total_value, volatility, config.confidence_level, config.trading_days),
            "var_95",
            &mut warnings,
        )
        .unwrap_or(0.0);

        let mut positions = Vec::with_capacity(valued.len());
        for (i, v) in valued.iter().enumerate() {
            let ticker = &v.position.ticker;
            let asset_volatility = match (&history, v.column) {
                (Some(h), Some(col)) => h.covariance.volatility(col),
                _ => 0.0,
            };
            positions.push(PositionRisk {
                ticker: ticker.clone(),
                asset_class: v.position.asset_class,
                quantity: v.position.quantity,
                current_price: v.price,
                value: v.value,
                weight: weights[i],
                volatility: finite_or_warn(
                    asset_volatility,
                    &format!("{} volatility", ticker),
                    &mut warnings,
                )
                .unwrap_or(0.0),
                risk_contribution_pct: finite_or_warn(
                    decomposition.contribution_pct[i],
                    &format!("{} risk_contribution_pct", ticker),
                    &mut warnings,
                )
                .unwrap_or(0.0),
                marginal_risk: finite_or_warn(
                    decomposition.marginal_risk[i],
                    &format!("{} marginal_risk", ticker),
                    &mut warnings,
                )
                .unwrap_or(0.0),
            });
        }

        let mut output = RiskOutput {
            total_value,
            volatility_annualized: volatility,
            var_95: var,
            confidence_level: config.confidence_level,
            period: request.period,
            start_date: None,
            end_date: None,
            positions,
            performance: PerformanceMetrics {
                risk_free_rate,
                ..PerformanceMetrics::default()
            },
            correlation_matrix: CorrelationMatrix::default(),
            benchmark: None,
            monte_carlo: None,
            drawdown: None,
            backtest: None,
            sector_breakdown: None,
            explanation: Explanation::default(),
            factor_shocks: request.factor_shocks.clone(),
            warnings: Vec::new(),
        };

        match &history {
            Some(h) => self.history_blocks(
                h,
                &valued,
                total_value,
                volatility,
                risk_free_rate,
                request,
                &mut output,
                &mut warnings,
            ),
            None => {
                debug!("cash-only portfolio, skipping history-based metrics");
                if request.include_drawdown {
                    warnings.push(Warning::new(
                        WarningCode::DrawdownUnavailable,
                        "portfolio has no priced positions",
                    ));
                }
                if request.include_monte_carlo {
                    output.monte_carlo = self.monte_carlo(
                        SimulationInputs {
                            values: DVector::zeros(0),
                            mean_daily: DVector::zeros(0),
                            covariance_daily: DMatrix::zeros(0, 0),
                            fixed_value: total_value,
                            return_kind: config.return_kind,
                        },
                        request,
                        &mut warnings,
                    );
                }
            }
        }

        if request.include_sectors {
            output.sector_breakdown = self.sectors(&valued, total_value, &mut warnings);
        }

        output.explanation = explain(
            &output.positions,
            total_value,
            volatility,
            var,
            config.confidence_level,
            config.top_drivers,
        );
        output.warnings = warnings;
        Ok(output)
    }

    /// Blocks that need return history: performance, correlation, Monte
    /// Carlo, benchmark, backtest and drawdown.
    #[allow(clippy::too_many_arguments)]
    fn history_blocks(
        &self,
        history: &AssetReturns,
        valued: &[Valued<'_>],
        total_value: f64,
        volatility: f64,
        risk_free_rate: f64,
        request: &AnalysisRequest,
        output: &mut RiskOutput,
        warnings: &mut Vec<Warning>,
    ) {
        let config = &self.config;
        output.start_date = history.price_dates.first().copied();
        output.end_date = history.price_dates.last().copied();
        output.correlation_matrix = history.covariance.correlation();

        // Weights per history column; the cash share earns nothing.
        let mut column_values = DVector::zeros(history.tickers.len());
        for v in valued {
            if let Some(col) = v.column {
                column_values[col] = v.value;
            }
        }
        let column_weights = &column_values / total_value;
        let daily = history.dated_portfolio_returns(&column_weights);
        let daily_values: Vec<f64> = daily.iter().map(|(_, r)| *r).collect();

        let mut expected = history.mean_returns.clone();
        for (ticker, shock) in &request.factor_shocks {
            match history.column_of(ticker) {
                Some(col) => expected[col] += shock,
                None => warnings.push(Warning::new(
                    WarningCode::TickerNotFound,
                    format!("factor shock for {} ignored, not a priced position", ticker),
                )),
            }
        }
        let annual_return = column_weights.dot(&expected);

        output.performance = sanitize_performance(
            performance_metrics(
                &daily_values,
                annual_return,
                volatility,
                risk_free_rate,
                config.trading_days,
            ),
            warnings,
        );

        if request.include_monte_carlo {
            let cash: f64 = valued.iter().filter(|v| v.column.is_none()).map(|v| v.value).sum();
            let inputs = SimulationInputs::from_annual(
                column_values.clone(),
                &history.mean_returns,
                &history.covariance.matrix,
                cash,
                config.trading_days,
            )
            .with_return_kind(config.return_kind);
            output.monte_carlo = self.monte_carlo(inputs, request, warnings);
        }

        if request.include_benchmark || request.include_backtest {
            let benchmark = self.benchmark_returns(request.period);
            let portfolio_return = output.performance.annualized_return;

            if request.include_benchmark {
                output.benchmark = benchmark
                    .as_ref()
                    .map_err(|e| Error::DataUnavailable(e.to_string()))
                    .and_then(|series| {
                        compare_to_benchmark(
                            &config.benchmark_ticker,
                            &daily,
                            series,
                            portfolio_return,
                            risk_free_rate,
                            config.trading_days,
                            config.min_observations,
                        )
                    })
                    .and_then(|comparison| sanitize_benchmark(comparison, warnings))
                    .map_err(|e| {
                        warn!(
                            benchmark = %config.benchmark_ticker,
                            error = %e,
                            "benchmark comparison unavailable"
                        );
                        warnings.push(Warning::new(
                            WarningCode::BenchmarkUnavailable,
                            format!("benchmark {} unavailable: {}", config.benchmark_ticker, e),
                        ));
                    })
                    .ok();
            }

            if request.include_backtest {
                output.backtest =
                    self.backtest(history, &daily, benchmark.as_deref().ok(), warnings);
            }
        }

        if request.include_drawdown {
            output.drawdown = drawdown_metrics(&history.price_dates, &wealth_index(&daily_values))
                .map_err(|e| {
                    warn!(error = %e, "drawdown unavailable");
                    warnings.push(Warning::new(
                        WarningCode::DrawdownUnavailable,
                        format!("drawdown unavailable: {}", e),
                    ));
                })
                .ok()
                .map(|metrics| sanitize_drawdown(metrics, warnings));
        }
    }

    fn monte_carlo(
        &self,
        inputs: SimulationInputs,
        request: &AnalysisRequest,
        warnings: &mut Vec<Warning>,
    ) -> Option<MonteCarloResult> {
        let params = MonteCarloParams::from_config(&self.config)
            .with_seed(request.seed)
            .with_deadline(request.deadline);

        let result = match simulate(&inputs, &params) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Monte Carlo simulation unavailable");
                warnings.push(Warning::new(
                    WarningCode::MonteCarloUnavailable,
                    format!("Monte Carlo simulation unavailable: {}", e),
                ));
                return None;
            }
        };

        if result.truncated {
            warnings.push(Warning::new(
                WarningCode::MonteCarloTruncated,
                format!(
                    "deadline reached after {} of {} simulations",
                    result.num_simulations, result.requested_simulations
                ),
            ));
        }
        if result.covariance_ridge > 0.0 {
            warnings.push(Warning::new(
                WarningCode::CovarianceRegularized,
                format!(
                    "covariance regularized with ridge {:e} before simulation",
                    result.covariance_ridge
                ),
            ));
        }

        let stats = [
            result.mc_var,
            result.mc_cvar,
            result.distribution.mean,
            result.distribution.std,
        ];
        let finite = stats.iter().all(|v| v.is_finite());
        if !finite {
            warnings.push(Warning::new(
                WarningCode::NonFiniteValue,
                "Monte Carlo produced non-finite statistics and was reported as null",
            ));
            return None;
        }
        Some(result)
    }

    /// Benchmark daily returns, or the reason they are missing.
    fn benchmark_returns(&self, period: Period) -> Result<Vec<(NaiveDate, f64)>> {
        let source = self.benchmark.as_ref().unwrap_or(&self.market);
        let series = source.price_series(&self.config.benchmark_ticker, period)?;
        let returns = dated_returns(&clean_series(&series), ReturnKind::Simple);
        if returns.is_empty() {
            return Err(Error::InsufficientHistory(format!(
                "{} has fewer than two prices",
                self.config.benchmark_ticker
            )));
        }
        Ok(returns)
    }

    fn backtest(
        &self,
        history: &AssetReturns,
        portfolio: &[(NaiveDate, f64)],
        benchmark: Option<&[(NaiveDate, f64)]>,
        warnings: &mut Vec<Warning>,
    ) -> Option<BacktestSeries> {
        let series = benchmark.zip(history.price_dates.first()).and_then(|(benchmark, start)| {
            growth_of_investment(*start, portfolio, benchmark, self.config.backtest_initial_value)
        });
        match series {
            Some(series)
                if series
                    .portfolio
                    .iter()
                    .chain(&series.benchmark)
                    .all(|v| v.is_finite()) =>
            {
                Some(series)
            }
            Some(_) => {
                warnings.push(Warning::new(
                    WarningCode::NonFiniteValue,
                    "backtest produced non-finite values and was reported as null",
                ));
                None
            }
            None => {
                warnings.push(Warning::new(
                    WarningCode::BacktestUnavailable,
                    format!(
                        "no return dates shared with benchmark {}",
                        self.config.benchmark_ticker
                    ),
                ));
                None
            }
        }
    }

    fn sectors(
        &self,
        valued: &[Valued<'_>],
        total_value: f64,
        warnings: &mut Vec<Warning>,
    ) -> Option<SectorBreakdown> {
        let source = self.metadata.as_ref()?;
        let holdings: Vec<(String, AssetClass, f64)> = valued
            .iter()
            .map(|v| (v.position.ticker.clone(), v.position.asset_class, v.value / total_value))
            .collect();
        sector_breakdown(&holdings, source.as_ref(), warnings)
            .map_err(|e| {
                warnings.push(Warning::new(
                    WarningCode::SectorBreakdownUnavailable,
                    format!("sector breakdown unavailable: {}", e),
                ));
            })
            .ok()
    }

    pub fn optimize(&self, portfolio: &Portfolio, period: Period) -> Result<OptimizationResult> {
        self.optimize_with(portfolio, &OptimizationRequest::new(period))
    }

    /// Efficient frontier, optimal portfolios and rebalancing trades over the
    /// non-cash positions.
    pub fn optimize_with(
        &self,
        portfolio: &Portfolio,
        request: &OptimizationRequest,
    ) -> Result<OptimizationResult> {
        let config = &self.config;
        let risk_free_rate = self.risk_free_rate(request.risk_free_rate)?;
        let mut warnings = Vec::new();

        let history = self
            .load_history(portfolio, request.period, &mut warnings)?
            .ok_or_else(|| {
                Error::Validation("portfolio has no positions to optimize".to_string())
            })?;

        let mut holdings = BTreeMap::new();
        for (col, ticker) in history.tickers.iter().enumerate() {
            if let Some(position) = portfolio.find(ticker) {
                holdings.insert(
                    ticker.clone(),
                    Holding {
                        quantity: position.quantity,
                        price: history.last_prices[col],
                    },
                );
            }
        }
        let total_value: f64 = holdings.values().map(|h| h.quantity * h.price).sum();
        if !(total_value.is_finite() && total_value > 0.0) {
            return Err(Error::Validation(format!(
                "optimizable positions have no value ({})",
                total_value
            )));
        }

        let regularized = regularize(&history.covariance.matrix, config.ridge)?;
        if regularized.was_regularized() {
            warnings.push(Warning::new(
                WarningCode::CovarianceRegularized,
                format!(
                    "covariance regularized with ridge {:e} before optimization",
                    regularized.ridge
                ),
            ));
        }

        let inputs = MeanVarianceInputs {
            tickers: history.tickers.clone(),
            mean_returns: history.mean_returns.clone(),
            covariance: regularized.matrix,
        };
        info!(
            assets = inputs.len(),
            points = config.frontier_points,
            "optimizing portfolio"
        );
        let solution = MeanVarianceOptimizer::new(self.solver.as_ref(), &inputs)
            .parallel(config.parallel)
            .solve(risk_free_rate, config.frontier_points, request.deadline)?;
        warnings.extend(solution.warnings);

        let trades = rebalancing_trades(
            &holdings,
            &solution.max_sharpe.weights,
            &BTreeMap::new(),
            config.min_trade_amount,
            config.min_trade_shares,
        );

        Ok(OptimizationResult {
            tickers: history.tickers.clone(),
            frontier: solution.frontier,
            max_sharpe_portfolio: solution.max_sharpe,
            min_vol_portfolio: solution.min_volatility,
            rebalancing_trades: trades,
            total_value,
            risk_free_rate,
            period: request.period,
            start_date: history.price_dates[0],
            end_date: history.price_dates[history.price_dates.len() - 1],
            covariance_ridge: regularized.ridge,
            warnings,
        })
    }

    pub fn list_scenarios(&self) -> Vec<Scenario> {
        self.scenarios.list_scenarios()
    }

    /// Apply a scenario's aggregate shock to `current_value`.
    pub fn test_scenario(&self, scenario_id: &str, current_value: f64) -> Result<ScenarioImpact> {
        self.scenarios.get_scenario(scenario_id)?.apply(current_value)
    }

    /// Apply a scenario per asset class to the positions of an analysis.
    pub fn stress_positions(
        &self,
        scenario_id: &str,
        output: &RiskOutput,
    ) -> Result<ScenarioImpact> {
        let scenario = self.scenarios.get_scenario(scenario_id)?;
        let mut by_class: BTreeMap<AssetClass, f64> = BTreeMap::new();
        for position in &output.positions {
            *by_class.entry(position.asset_class).or_insert(0.0) += position.value;
        }
        scenario.apply_by_class(&by_class)
    }

    fn risk_free_rate(&self, requested: Option<f64>) -> Result<f64> {
        let rate = requested.unwrap_or(self.config.risk_free_rate);
        if rate.is_finite() {
            Ok(rate)
        } else {
            Err(Error::Validation(format!("risk-free rate must be finite, got {}", rate)))
        }
    }

    /// Aligned returns for the non-cash positions; `None` when there are none.
    ///
    /// Tickers the source cannot resolve, or with too little history, are
    /// dropped with a warning. Fails only when none survive.
    fn load_history(
        &self,
        portfolio: &Portfolio,
        period: Period,
        warnings: &mut Vec<Warning>,
    ) -> Result<Option<AssetReturns>> {
        let requested = portfolio.risky_tickers();
        if requested.is_empty() {
            return Ok(None);
        }

        let request: BTreeSet<String> = requested.iter().cloned().collect();
        let fetch = self.market.price_panel(&request, period)?;
        for (ticker, error) in &fetch.failures {
            warn!(ticker = %ticker, error = %error, "market data unavailable for ticker");
            warnings.push(Warning::new(
                WarningCode::TickerNotFound,
                format!("{}: {}", ticker, error),
            ));
        }

        let candidates: Vec<String> = requested
            .into_iter()
            .filter(|t| !fetch.failures.contains_key(t))
            .collect();
        if candidates.is_empty() {
            return Err(Error::TickerNotFound(
                fetch.failures.keys().cloned().collect::<Vec<_>>().join(", "),
            ));
        }

        let aligned = fetch
            .panel
            .align(&candidates, period, self.config.min_observations + 1)?;
        let mut history = AssetReturns::from_aligned(aligned, &self.config)?;
        warnings.append(&mut history.warnings);

        debug!(
            tickers = history.tickers.len(),
            observations = history.observations(),
            "loaded history"
        );
        Ok(Some(history))
    }
}

/// Value every position that has a price; cash is valued at 1 per unit.
fn value_positions<'a>(
    portfolio: &'a Portfolio,
    history: Option<&AssetReturns>,
) -> Result<(Vec<Valued<'a>>, f64)> {
    let mut valued = Vec::with_capacity(portfolio.position_count());
    for position in portfolio.positions() {
        let (price, column) = if position.asset_class.is_cash() {
            (1.0, None)
        } else {
            let priced = history.and_then(|h| {
                h.column_of(&position.ticker)
                    .map(|col| (h.last_prices[col], col))
            });
            match priced {
                Some((price, col)) => (price, Some(col)),
                None => continue,
            }
        };
        valued.push(Valued {
            position,
            price,
            value: position.quantity * price,
            column,
        });
    }

    let total_value: f64 = valued.iter().map(|v| v.value).sum();
    if !(total_value.is_finite() && total_value > 0.0) {
        return Err(Error::Validation(format!(
            "portfolio has no value ({})",
            total_value
        )));
    }
    Ok((valued, total_value))
}

fn sanitize_performance(
    metrics: PerformanceMetrics,
    warnings: &mut Vec<Warning>,
) -> PerformanceMetrics {
    PerformanceMetrics {
        annualized_return: finite_or_warn(metrics.annualized_return, "annualized_return", warnings)
            .unwrap_or(0.0),
        cumulative_return: finite_or_warn(metrics.cumulative_return, "cumulative_return", warnings)
            .unwrap_or(0.0),
        risk_free_rate: metrics.risk_free_rate,
        sharpe_ratio: metrics
            .sharpe_ratio
            .and_then(|v| finite_or_warn(v, "sharpe_ratio", warnings)),
        sortino_ratio: metrics
            .sortino_ratio
            .and_then(|v| finite_or_warn(v, "sortino_ratio", warnings)),
        downside_deviation: metrics
            .downside_deviation
            .and_then(|v| finite_or_warn(v, "downside_deviation", warnings)),
    }
}

fn sanitize_benchmark(
    comparison: BenchmarkComparison,
    warnings: &mut Vec<Warning>,
) -> Result<BenchmarkComparison> {
    let required = [
        comparison.alpha,
        comparison.beta,
        comparison.benchmark_return,
        comparison.benchmark_volatility,
    ];
    if required.iter().any(|v| !v.is_finite()) {
        return Err(Error::NumericInstability(
            "benchmark statistics are not finite".to_string(),
        ));
    }
    Ok(BenchmarkComparison {
        benchmark_sharpe: comparison
            .benchmark_sharpe
            .and_then(|v| finite_or_warn(v, "benchmark_sharpe", warnings)),
        correlation: comparison
            .correlation
            .and_then(|v| finite_or_warn(v, "benchmark correlation", warnings)),
        ..comparison
    })
}

fn sanitize_drawdown(metrics: DrawdownMetrics, warnings: &mut Vec<Warning>) -> DrawdownMetrics {
    DrawdownMetrics {
        max_drawdown: finite_or_warn(metrics.max_drawdown, "max_drawdown", warnings).unwrap_or(0.0),
        current_drawdown: finite_or_warn(metrics.current_drawdown, "current_drawdown", warnings)
            .unwrap_or(0.0),
        ..metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{AssetMetadata, InMemoryMarketData, PanelFetch, PricePanel, PricePoint};
    use crate::types::TradeAction;
    use approx::assert_relative_eq;
    use chrono::{Datelike, Weekday};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    /// Business-day random walks driven by a shared market factor.
    fn synthetic_panel(days: usize, seed: u64) -> PricePanel {
        // (ticker, start price, market beta, idiosyncratic daily vol, drift)
        let specs = [
            ("AAPL", 185.0, 1.2, 0.012, 0.0006),
            ("MSFT", 370.0, 1.0, 0.010, 0.0005),
            ("GOOGL", 140.0, 1.1, 0.014, 0.0004),
            ("TLT", 95.0, -0.2, 0.006, 0.0001),
            ("^GSPC", 4_700.0, 1.0, 0.002, 0.0003),
        ];
        let mut rng = StdRng::seed_from_u64(seed);
        let mut dates = Vec::with_capacity(days);
        let mut date = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        while dates.len() < days {
            if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                dates.push(date);
            }
            date = date.succ_opt().unwrap();
        }

        let mut prices: Vec<Vec<PricePoint>> =
            specs.iter().map(|_| Vec::with_capacity(days)).collect();
        let mut levels: Vec<f64> = specs.iter().map(|s| s.1).collect();
        for (i, date) in dates.iter().enumerate() {
            let market: f64 = rng.sample::<f64, _>(StandardNormal) * 0.009;
            for (k, (_, _, beta, idio, drift)) in specs.iter().enumerate() {
                if i > 0 {
                    let noise: f64 = rng.sample(StandardNormal);
                    levels[k] *= 1.0 + drift + beta * market + idio * noise;
                }
                prices[k].push(PricePoint::new(*date, levels[k]));
            }
        }

        let mut panel = PricePanel::new();
        for ((ticker, ..), series) in specs.iter().zip(prices) {
            panel.insert(ticker, series);
        }
        panel
    }

    fn sample_portfolio() -> Portfolio {
        Portfolio::new(vec![
            Position::new("AAPL", 100.0, AssetClass::Equity),
            Position::new("MSFT", 50.0, AssetClass::Equity),
            Position::new("GOOGL", 30.0, AssetClass::Equity),
        ])
        .unwrap()
    }

    fn test_config() -> AnalyticsConfig {
        AnalyticsConfig {
            num_simulations: 4_000,
            fetch_timeout_secs: 0,
            ..AnalyticsConfig::default()
        }
    }

    fn engine() -> RiskEngine {
        RiskEngine::new(InMemoryMarketData::new(synthetic_panel(320, 7)), test_config())
    }

    fn seeded(seed: u64) -> AnalysisRequest {
        AnalysisRequest::new(Period::OneYear)
            .with_risk_free_rate(0.04)
            .with_seed(seed)
    }

    #[test]
    fn test_end_to_end_analysis() {
        let output = engine().analyze_with(&sample_portfolio(), &seeded(42)).unwrap();

        assert_eq!(output.positions.len(), 3);
        let expected_value: f64 = output
            .positions
            .iter()
            .map(|p| p.quantity * p.current_price)
            .sum();
        assert_relative_eq!(output.total_value, expected_value, epsilon = 1e-9);
        assert!(output.volatility_annualized > 0.05 && output.volatility_annualized < 0.6);
        assert!(output.var_95 > 0.0);

        let weights: f64 = output.positions.iter().map(|p| p.weight).sum();
        assert_relative_eq!(weights, 1.0, epsilon = 1e-12);
        let contributions: f64 = output.positions.iter().map(|p| p.risk_contribution_pct).sum();
        assert_relative_eq!(contributions, 100.0, epsilon = 1e-6);

        assert!(output.start_date.unwrap() < output.end_date.unwrap());
        assert_eq!(output.correlation_matrix.entries.len(), 3);
        assert!(output.benchmark.is_some());
        assert!(output.backtest.is_some());
        assert!(output.drawdown.is_some());
        // No metadata source configured
        assert!(output.sector_breakdown.is_none());
        assert_eq!(output.explanation.top_drivers.len(), 3);
        assert!(output.warnings.is_empty(), "{:?}", output.warnings);

        let mc = output.monte_carlo.unwrap();
        assert_eq!(mc.seed, 42);
        assert_eq!(mc.num_simulations, 4_000);
        // Simulated and closed-form VaR describe the same model
        assert!((mc.mc_var - output.var_95).abs() / output.var_95 < 0.25);
    }

    #[test]
    fn test_seeded_analysis_is_bit_identical() {
        let engine = engine();
        let first = engine.analyze_with(&sample_portfolio(), &seeded(99)).unwrap();
        let second = engine.analyze_with(&sample_portfolio(), &seeded(99)).unwrap();

        assert_eq!(first.total_value.to_bits(), second.total_value.to_bits());
        assert_eq!(
            first.volatility_annualized.to_bits(),
            second.volatility_annualized.to_bits()
        );
        assert_eq!(first.var_95.to_bits(), second.var_95.to_bits());
        assert_eq!(first.monte_carlo, second.monte_carlo);
    }

    #[test]
    fn test_parametric_var_matches_closed_form() {
        let output = engine().analyze_with(&sample_portfolio(), &seeded(1)).unwrap();
        let expected =
            output.total_value * 1.6448536 * output.volatility_annualized / 252f64.sqrt();
        assert_relative_eq!(output.var_95, expected, max_relative = 1e-6);
    }

    #[test]
    fn test_cash_only_portfolio() {
        let portfolio = Portfolio::new(vec![Position::new("USD", 10_000.0, AssetClass::Cash)]).unwrap();
        let output = engine().analyze_with(&portfolio, &seeded(3)).unwrap();

        assert_eq!(output.total_value, 10_000.0);
        assert_eq!(output.volatility_annualized, 0.0);
        assert_eq!(output.var_95, 0.0);
        assert_eq!(output.positions[0].risk_contribution_pct, 0.0);
        assert!(output.benchmark.is_none());
        assert!(output.explanation.top_drivers.is_empty());
        let mc = output.monte_carlo.unwrap();
        assert_eq!(mc.mc_var, 0.0);
    }

    #[test]
    fn test_cash_dilutes_risk_without_contributing() {
        let mut positions = sample_portfolio().positions().to_vec();
        positions.push(Position::new("USD", 20_000.0, AssetClass::Cash));
        let with_cash = Portfolio::new(positions).unwrap();

        let engine = engine();
        let base = engine.analyze_with(&sample_portfolio(), &seeded(5)).unwrap();
        let diluted = engine.analyze_with(&with_cash, &seeded(5)).unwrap();

        assert!(diluted.volatility_annualized < base.volatility_annualized);
        let cash = diluted.positions.iter().find(|p| p.ticker == "USD").unwrap();
        assert_eq!(cash.current_price, 1.0);
        assert_eq!(cash.risk_contribution_pct, 0.0);
        let contributions: f64 = diluted.positions.iter().map(|p| p.risk_contribution_pct).sum();
        assert_relative_eq!(contributions, 100.0, epsilon = 1e-6);
    }

    #[test]
    fn test_missing_ticker_is_excluded_with_warning() {
        let mut positions = sample_portfolio().positions().to_vec();
        positions.push(Position::new("NOPE", 10.0, AssetClass::Equity));
        let portfolio = Portfolio::new(positions).unwrap();

        let output = engine().analyze_with(&portfolio, &seeded(11)).unwrap();
        assert_eq!(output.positions.len(), 3);
        assert!(output
            .warnings
            .iter()
            .any(|w| w.code == WarningCode::TickerNotFound && w.message.contains("NOPE")));
    }

    #[test]
    fn test_no_valid_tickers_is_an_error() {
        let portfolio = Portfolio::new(vec![Position::new("NOPE", 10.0, AssetClass::Equity)]).unwrap();
        let result = engine().analyze(&portfolio, Period::OneYear, 0.04);
        assert!(matches!(result, Err(Error::TickerNotFound(t)) if t == "NOPE"));
    }

    #[test]
    fn test_unresolved_tickers_fall_back_to_cash() {
        let portfolio = Portfolio::new(vec![
            Position::new("NOPE", 10.0, AssetClass::Equity),
            Position::new("USD", 2_500.0, AssetClass::Cash),
        ])
        .unwrap();
        let output = engine().analyze_with(&portfolio, &seeded(3)).unwrap();

        assert_relative_eq!(output.total_value, 2_500.0, epsilon = 1e-12);
        assert_eq!(output.volatility_annualized, 0.0);
        assert_eq!(output.var_95, 0.0);
        assert!(output
            .warnings
            .iter()
            .any(|w| w.code == WarningCode::TickerNotFound && w.message.contains("NOPE")));

        // Optimizing still needs at least one priced asset
        assert!(engine().optimize(&portfolio, Period::OneYear).is_err());
    }

    #[test]
    fn test_short_history_is_insufficient() {
        let engine = RiskEngine::new(InMemoryMarketData::new(synthetic_panel(10, 7)), test_config());
        let result = engine.analyze(&sample_portfolio(), Period::OneYear, 0.04);
        assert!(matches!(result, Err(Error::InsufficientHistory(_))));
    }

    /// 41 business days swinging 100 -> 150 -> 100, ending back at 100.
    fn swinging_panel() -> PricePanel {
        let mut panel = PricePanel::new();
        let mut date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let mut swing = Vec::new();
        let mut index = Vec::new();
        while swing.len() < 41 {
            if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                let i = swing.len();
                swing.push(PricePoint::new(date, if i % 2 == 0 { 100.0 } else { 150.0 }));
                index.push(PricePoint::new(date, 4_000.0 * 1.001_f64.powi(i as i32)));
            }
            date = date.succ_opt().unwrap();
        }
        panel.insert("SWING", swing);
        panel.insert("^GSPC", index);
        panel
    }

    #[test]
    fn test_log_returns_compound_along_the_price_path() {
        let config = AnalyticsConfig {
            return_kind: ReturnKind::Log,
            ..test_config()
        };
        let engine = RiskEngine::new(InMemoryMarketData::new(swinging_panel()), config);
        let portfolio =
            Portfolio::new(vec![Position::new("SWING", 10.0, AssetClass::Equity)]).unwrap();
        let request = AnalysisRequest::new(Period::Max)
            .with_risk_free_rate(0.0)
            .with_seed(5);

        let output = engine.analyze_with(&portfolio, &request).unwrap();
        assert_relative_eq!(output.total_value, 1_000.0, epsilon = 1e-9);
        // Log moments: twenty +ln(1.5) days cancel twenty -ln(1.5) days
        assert_relative_eq!(output.performance.annualized_return, 0.0, epsilon = 1e-9);
        assert_relative_eq!(output.performance.cumulative_return, 0.0, epsilon = 1e-9);

        let drawdown = output.drawdown.unwrap();
        assert_relative_eq!(drawdown.max_drawdown, -1.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(drawdown.current_drawdown, -1.0 / 3.0, epsilon = 1e-9);

        let backtest = output.backtest.unwrap();
        assert_relative_eq!(
            backtest.final_portfolio_value(),
            backtest.initial_value,
            epsilon = 1e-6
        );
        assert_relative_eq!(
            backtest.final_benchmark_value(),
            backtest.initial_value * 1.001_f64.powi(40),
            epsilon = 1e-6
        );

        let mc = output.monte_carlo.unwrap();
        assert!(mc.distribution.min > 0.0);
    }

    #[test]
    fn test_missing_benchmark_degrades() {
        let mut panel = synthetic_panel(320, 7);
        panel.remove("^GSPC");
        let engine = RiskEngine::new(InMemoryMarketData::new(panel), test_config());

        let output = engine.analyze_with(&sample_portfolio(), &seeded(2)).unwrap();
        assert!(output.benchmark.is_none());
        assert!(output.backtest.is_none());
        assert!(output.drawdown.is_some());
        let codes: Vec<WarningCode> = output.warnings.iter().map(|w| w.code).collect();
        assert!(codes.contains(&WarningCode::BenchmarkUnavailable));
        assert!(codes.contains(&WarningCode::BacktestUnavailable));
    }

    #[test]
    fn test_factor_shock_raises_expected_return() {
        let engine = engine();
        let base = engine.analyze_with(&sample_portfolio(), &seeded(8)).unwrap();
        let shocked = engine
            .analyze_with(&sample_portfolio(), &seeded(8).with_factor_shock("aapl", 0.10))
            .unwrap();

        let aapl_weight = base.positions[0].weight;
        assert_relative_eq!(
            shocked.performance.annualized_return - base.performance.annualized_return,
            0.10 * aapl_weight,
            epsilon = 1e-12
        );
        assert_eq!(shocked.factor_shocks["AAPL"], 0.10);
        assert_eq!(shocked.volatility_annualized, base.volatility_annualized);
    }

    #[test]
    fn test_sector_breakdown_with_metadata() {
        let meta = |sector: &str| AssetMetadata {
            sector: sector.into(),
            country: "United States".into(),
            industry: None,
        };
        let market = InMemoryMarketData::new(synthetic_panel(320, 7))
            .with_metadata("AAPL", meta("Technology"))
            .with_metadata("MSFT", meta("Technology"))
            .with_metadata("GOOGL", meta("Communication Services"));
        let engine = RiskEngine::new(market.clone(), test_config())
            .with_metadata_source(Arc::new(market));

        let output = engine.analyze_with(&sample_portfolio(), &seeded(4)).unwrap();
        let sectors = output.sector_breakdown.unwrap();
        let total: f64 = sectors.sectors.values().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
        assert_relative_eq!(sectors.countries["United States"], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_expired_budget_drops_monte_carlo() {
        let request = AnalysisRequest {
            deadline: Some(Instant::now()),
            ..seeded(6)
        };
        let output = engine().analyze_with(&sample_portfolio(), &request).unwrap();
        assert!(output.monte_carlo.is_none());
        assert!(output
            .warnings
            .iter()
            .any(|w| w.code == WarningCode::MonteCarloUnavailable));
        assert!(output.var_95 > 0.0);
    }

    #[test]
    fn test_optimize_portfolio() {
        let result = engine().optimize(&sample_portfolio(), Period::OneYear).unwrap();

        assert_eq!(result.tickers, vec!["AAPL", "MSFT", "GOOGL"]);
        assert!(!result.frontier.is_empty());
        for portfolio in [&result.max_sharpe_portfolio, &result.min_vol_portfolio] {
            let total: f64 = portfolio.weights.values().sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-6);
            assert!(portfolio.weights.values().all(|w| *w >= 0.0));
        }
        assert!(
            result.min_vol_portfolio.volatility <= result.max_sharpe_portfolio.volatility + 1e-6
        );

        let vols = &result.frontier.volatility;
        assert!(vols.windows(2).all(|w| w[1] >= w[0] - 1e-6));

        let amounts: Vec<f64> = result.rebalancing_trades.iter().map(|t| t.amount).collect();
        assert!(amounts.windows(2).all(|w| w[0] >= w[1]));
        for trade in &result.rebalancing_trades {
            assert!(trade.amount > 10.0);
            let expected = if trade.target_weight > trade.current_weight {
                TradeAction::Buy
            } else {
                TradeAction::Sell
            };
            assert_eq!(trade.action, expected);
        }
    }

    #[test]
    fn test_optimize_ignores_cash() {
        let mut positions = sample_portfolio().positions().to_vec();
        positions.push(Position::new("USD", 5_000.0, AssetClass::Cash));
        let portfolio = Portfolio::new(positions).unwrap();

        let result = engine().optimize(&portfolio, Period::OneYear).unwrap();
        assert!(!result.max_sharpe_portfolio.weights.contains_key("USD"));
        assert!(result.rebalancing_trades.iter().all(|t| t.ticker != "USD"));

        let cash_only = Portfolio::new(vec![Position::new("USD", 5_000.0, AssetClass::Cash)]).unwrap();
        assert!(matches!(
            engine().optimize(&cash_only, Period::OneYear),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_scenarios() {
        let engine = engine();
        assert_eq!(engine.list_scenarios().len(), 4);

        let impact = engine.test_scenario("2008_financial_crisis", 100_000.0).unwrap();
        assert_relative_eq!(impact.projected_value, 62_000.0, epsilon = 1e-9);
        assert_relative_eq!(impact.projected_loss, 38_000.0, epsilon = 1e-9);
        assert_relative_eq!(impact.loss_pct, -38.0, epsilon = 1e-9);

        assert!(matches!(
            engine.test_scenario("nope", 1.0),
            Err(Error::UnknownScenario(_))
        ));
    }

    #[test]
    fn test_stress_positions_spares_cash() {
        let mut positions = sample_portfolio().positions().to_vec();
        positions.push(Position::new("USD", 10_000.0, AssetClass::Cash));
        let portfolio = Portfolio::new(positions).unwrap();

        let engine = engine();
        let output = engine.analyze_with(&portfolio, &seeded(9)).unwrap();
        let impact = engine.stress_positions("covid_crash", &output).unwrap();

        let equity: f64 = output
            .positions
            .iter()
            .filter(|p| p.asset_class == AssetClass::Equity)
            .map(|p| p.value)
            .sum();
        assert_relative_eq!(impact.projected_value, equity * 0.66 + 10_000.0, epsilon = 1e-6);
    }

    struct DownSource;

    impl MarketDataSource for DownSource {
        fn price_panel(&self, _tickers: &BTreeSet<String>, _period: Period) -> Result<PanelFetch> {
            Err(Error::DataUnavailable("provider offline".to_string()))
        }
    }

    #[test]
    fn test_outage_is_surfaced() {
        let engine = RiskEngine::new(DownSource, test_config());
        let result = engine.analyze(&sample_portfolio(), Period::OneYear, 0.04);
        assert!(matches!(result, Err(Error::DataUnavailable(_))));
    }
}
