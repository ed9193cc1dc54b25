//! Monte Carlo simulation of next-day portfolio value.
//!
//! Daily asset returns are drawn from a multivariate normal distribution
//! `N(mu, Sigma)` using the Cholesky factor of the (regularized) covariance.
//! Log-return draws are converted with `exp(r) - 1` before valuing holdings.
//! Simulations run in fixed-size chunks, each with its own generator seeded
//! from the run seed and the chunk index, so a seeded run is reproducible
//! regardless of how rayon schedules the chunks.

use super::returns::regularize;
use super::var::parametric_var;
use super::{mean, ZERO_VOLATILITY};
use crate::config::{AnalyticsConfig, ReturnKind};
use crate::{Error, Result};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 1_024;

/// Percentiles reported in [`DistributionStats`].
const REPORTED_PERCENTILES: [u32; 7] = [1, 5, 25, 50, 75, 95, 99];

/// Run settings for one simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct MonteCarloParams {
    pub num_simulations: usize,
    pub confidence_level: f64,
    /// Maximum number of simulated values kept for histogram rendering
    pub sample_size: usize,
    /// Fixed seed for reproducible runs; a fresh seed is drawn when `None`
    pub seed: Option<u64>,
    /// Chunks are not started after this instant
    pub deadline: Option<Instant>,
    pub parallel: bool,
    /// Starting ridge factor for covariance repair
    pub ridge: f64,
}

impl MonteCarloParams {
    pub fn from_config(config: &AnalyticsConfig) -> Self {
        Self {
            num_simulations: config.num_simulations,
            confidence_level: config.confidence_level,
            sample_size: config.simulation_sample_size,
            seed: None,
            deadline: None,
            parallel: config.parallel,
            ridge: config.ridge,
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Current holdings and the daily return model they are exposed to.
#[derive(Debug, Clone)]
pub struct SimulationInputs {
    /// Value held in each risky asset
    pub values: DVector<f64>,
    pub mean_daily: DVector<f64>,
    pub covariance_daily: DMatrix<f64>,
    /// Value that does not move (cash)
    pub fixed_value: f64,
    /// How `mean_daily` and `covariance_daily` were measured
    pub return_kind: ReturnKind,
}

impl SimulationInputs {
    /// Build inputs from annualized moments.
    pub fn from_annual(
        values: DVector<f64>,
        mean_annual: &DVector<f64>,
        covariance_annual: &DMatrix<f64>,
        fixed_value: f64,
        trading_days: u32,
    ) -> Self {
        let days = f64::from(trading_days);
        Self {
            values,
            mean_daily: mean_annual / days,
            covariance_daily: covariance_annual / days,
            fixed_value,
            return_kind: ReturnKind::Simple,
        }
    }

    pub fn with_return_kind(mut self, kind: ReturnKind) -> Self {
        self.return_kind = kind;
        self
    }

    pub fn total_value(&self) -> f64 {
        self.values.sum() + self.fixed_value
    }
}

/// Summary of the simulated value distribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionStats {
    pub mean: f64,
    /// Population standard deviation
    pub std: f64,
    pub min: f64,
    pub max: f64,
    /// Keyed `p1`, `p5`, ..., `p99`
    pub percentiles: BTreeMap<String, f64>,
}

impl DistributionStats {
    /// Statistics of an ascending-sorted sample.
    fn from_sorted(sorted: &[f64]) -> Self {
        let m = mean(sorted);
        let variance = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().map(|v| (v - m).powi(2)).sum::<f64>() / sorted.len() as f64
        };
        Self {
            mean: m,
            std: variance.sqrt(),
            min: sorted.first().copied().unwrap_or(0.0),
            max: sorted.last().copied().unwrap_or(0.0),
            percentiles: REPORTED_PERCENTILES
                .iter()
                .map(|&p| (format!("p{}", p), percentile(sorted, f64::from(p))))
                .collect(),
        }
    }
}

/// Simulated VaR, CVaR and distribution of next-day portfolio value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonteCarloResult {
    /// `total_value - q` where `q` is the `(1 - confidence)` quantile
    pub mc_var: f64,
    /// `total_value - mean` of simulated values below `q`
    pub mc_cvar: f64,
    pub confidence_level: f64,
    pub total_value: f64,
    /// Simulations actually completed
    pub num_simulations: usize,
    pub requested_simulations: usize,
    pub seed: u64,
    /// The deadline cut the run short
    pub truncated: bool,
    /// Ridge added to the daily covariance; 0 when none was needed
    pub covariance_ridge: f64,
    pub distribution: DistributionStats,
    /// First `sample_size` simulated values, in generation order
    pub simulations: Vec<f64>,
}

/// Linear-interpolated percentile of an ascending-sorted slice, `q` in [0, 100].
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (q / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
        }
    }
}

/// Simulate next-day portfolio values.
pub fn simulate(inputs: &SimulationInputs, params: &MonteCarloParams) -> Result<MonteCarloResult> {
    let n_assets = inputs.values.len();
    if inputs.mean_daily.len() != n_assets
        || inputs.covariance_daily.nrows() != n_assets
        || inputs.covariance_daily.ncols() != n_assets
    {
        return Err(Error::Validation(format!(
            "simulation inputs disagree on asset count: {} values, {} means, {}x{} covariance",
            n_assets,
            inputs.mean_daily.len(),
            inputs.covariance_daily.nrows(),
            inputs.covariance_daily.ncols()
        )));
    }
    if params.num_simulations == 0 {
        return Err(Error::Validation("num_simulations must be positive".to_string()));
    }

    let seed = params.seed.unwrap_or_else(rand::random::<u64>);
    let total_value = inputs.total_value();

    // With nothing at risk every simulated value equals the current value.
    let (lower, mean_daily, ridge) = if n_assets == 0 || inputs.values.amax() == 0.0 {
        (DMatrix::zeros(n_assets, n_assets), DVector::zeros(n_assets), 0.0)
    } else {
        let regularized = regularize(&inputs.covariance_daily, params.ridge)?;
        (regularized.lower(), inputs.mean_daily.clone(), regularized.ridge)
    };

    let chunks = params.num_simulations.div_ceil(CHUNK_SIZE);
    let simulate_chunk = |chunk: usize| -> Option<Vec<f64>> {
        if params.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return None;
        }
        let len = CHUNK_SIZE.min(params.num_simulations - chunk * CHUNK_SIZE);
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(chunk as u64));
        let mut z: DVector<f64> = DVector::zeros(n_assets);
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            for zk in z.iter_mut() {
                *zk = StandardNormal.sample(&mut rng);
            }
            let mut returns = &lower * &z + &mean_daily;
            if inputs.return_kind == ReturnKind::Log {
                returns.apply(|r| *r = r.exp_m1());
            }
            values.push(total_value + inputs.values.dot(&returns));
        }
        Some(values)
    };

    let completed: Vec<Option<Vec<f64>>> = if params.parallel {
        (0..chunks).into_par_iter().map(simulate_chunk).collect()
    } else {
        (0..chunks).map(simulate_chunk).collect()
    };

    let truncated = completed.iter().any(Option::is_none);
    let simulations: Vec<f64> = completed.into_iter().flatten().flatten().collect();
    if simulations.is_empty() {
        return Err(Error::BudgetExhausted(
            "deadline passed before any Monte Carlo chunk completed".to_string(),
        ));
    }
    if truncated {
        warn!(
            completed = simulations.len(),
            requested = params.num_simulations,
            "Monte Carlo run truncated by deadline"
        );
    }

    let mut sorted = simulations.clone();
    sorted.sort_by(f64::total_cmp);

    let threshold = percentile(&sorted, (1.0 - params.confidence_level) * 100.0);
    let tail: Vec<f64> = sorted.iter().copied().take_while(|v| *v < threshold).collect();
    let mc_var = total_value - threshold;
    let mc_cvar = if tail.is_empty() {
        mc_var
    } else {
        total_value - mean(&tail)
    };

    debug!(
        seed,
        simulations = simulations.len(),
        mc_var,
        mc_cvar,
        "Monte Carlo simulation complete"
    );

    let mut sample = simulations;
    let num_simulations = sample.len();
    sample.truncate(params.sample_size);

    Ok(MonteCarloResult {
        mc_var,
        mc_cvar,
        confidence_level: params.confidence_level,
        total_value,
        num_simulations,
        requested_simulations: params.num_simulations,
        seed,
        truncated,
        covariance_ridge: ridge,
        distribution: DistributionStats::from_sorted(&sorted),
        simulations: sample,
    })
}

/// Parametric and simulated VaR side by side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VarComparison {
    pub parametric_var: f64,
    pub monte_carlo_var: f64,
    pub monte_carlo_cvar: f64,
    /// `monte_carlo_var - parametric_var`
    pub difference: f64,
    /// Difference relative to the parametric figure; `None` when that is zero
    pub difference_pct: Option<f64>,
}

/// Compare the closed-form VaR against a simulation of the same model.
pub fn compare_var_methods(
    inputs: &SimulationInputs,
    params: &MonteCarloParams,
    trading_days: u32,
) -> Result<VarComparison> {
    let simulated = simulate(inputs, params)?;
    let daily_variance = inputs.values.dot(&(&inputs.covariance_daily * &inputs.values)).max(0.0);
    let total_value = inputs.total_value();
    let annual_volatility = if total_value > 0.0 {
        daily_variance.sqrt() / total_value * f64::from(trading_days).sqrt()
    } else {
        0.0
    };
    let parametric = parametric_var(total_value, annual_volatility, params.confidence_level, trading_days);
    let difference = simulated.mc_var - parametric;

    Ok(VarComparison {
        parametric_var: parametric,
        monte_carlo_var: simulated.mc_var,
        monte_carlo_cvar: simulated.mc_cvar,
        difference,
        difference_pct: (parametric > ZERO_VOLATILITY).then(|| difference / parametric * 100.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::time::Duration;

    fn two_asset_inputs(mean_daily: f64) -> SimulationInputs {
        let cov_annual = DMatrix::from_row_slice(2, 2, &[0.04, 0.01, 0.01, 0.09]);
        let mean_annual = DVector::from_element(2, mean_daily * 252.0);
        SimulationInputs::from_annual(
            DVector::from_vec(vec![60_000.0, 40_000.0]),
            &mean_annual,
            &cov_annual,
            0.0,
            252,
        )
    }

    fn params(seed: u64, n: usize) -> MonteCarloParams {
        MonteCarloParams {
            num_simulations: n,
            seed: Some(seed),
            ..MonteCarloParams::from_config(&AnalyticsConfig::default())
        }
    }

    #[test]
    fn test_percentile_linear_interpolation() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 50.0), 3.0);
        assert_eq!(percentile(&sorted, 100.0), 5.0);
        assert_relative_eq!(percentile(&sorted, 5.0), 1.2, epsilon = 1e-12);
        assert_eq!(percentile(&[7.0], 5.0), 7.0);
    }

    #[test]
    fn test_seeded_runs_are_identical() {
        let inputs = two_asset_inputs(0.0005);
        let a = simulate(&inputs, &params(42, 5_000)).unwrap();
        let b = simulate(&inputs, &params(42, 5_000)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.seed, 42);

        let c = simulate(&inputs, &params(7, 5_000)).unwrap();
        assert_ne!(a.simulations, c.simulations);
    }

    #[test]
    fn test_parallel_and_sequential_agree() {
        let inputs = two_asset_inputs(0.0);
        let parallel = simulate(&inputs, &params(11, 4_000)).unwrap();
        let sequential = simulate(
            &inputs,
            &MonteCarloParams {
                parallel: false,
                ..params(11, 4_000)
            },
        )
        .unwrap();
        assert_eq!(parallel.simulations, sequential.simulations);
        assert_eq!(parallel.mc_var, sequential.mc_var);
    }

    #[test]
    fn test_var_and_cvar_ordering() {
        let inputs = two_asset_inputs(0.0003);
        let result = simulate(&inputs, &params(3, 10_000)).unwrap();
        assert!(result.mc_var > 0.0);
        assert!(result.mc_cvar >= result.mc_var);
        assert_eq!(result.num_simulations, 10_000);
        assert_eq!(result.simulations.len(), 1_000);
        assert!(!result.truncated);

        let d = &result.distribution;
        assert!(d.min <= d.percentiles["p1"]);
        assert!(d.percentiles["p1"] <= d.percentiles["p50"]);
        assert!(d.percentiles["p99"] <= d.max);
    }

    #[test]
    fn test_converges_to_parametric_var() {
        let inputs = two_asset_inputs(0.0);
        let comparison = compare_var_methods(&inputs, &params(2024, 50_000), 252).unwrap();
        let relative = comparison.difference.abs() / comparison.parametric_var;
        assert!(relative < 0.03, "relative difference {}", relative);
    }

    #[test]
    fn test_cash_only_is_degenerate() {
        let inputs = SimulationInputs::from_annual(
            DVector::zeros(0),
            &DVector::zeros(0),
            &DMatrix::zeros(0, 0),
            25_000.0,
            252,
        );
        let result = simulate(&inputs, &params(1, 2_000)).unwrap();
        assert_eq!(result.mc_var, 0.0);
        assert_eq!(result.mc_cvar, 0.0);
        assert_eq!(result.distribution.std, 0.0);
        assert_eq!(result.distribution.mean, 25_000.0);
    }

    #[test]
    fn test_singular_covariance_is_regularized() {
        let cov_annual = DMatrix::from_row_slice(2, 2, &[0.04, 0.04, 0.04, 0.04]);
        let inputs = SimulationInputs::from_annual(
            DVector::from_vec(vec![1_000.0, 1_000.0]),
            &DVector::zeros(2),
            &cov_annual,
            0.0,
            252,
        );
        let result = simulate(&inputs, &params(5, 2_000)).unwrap();
        assert!(result.covariance_ridge > 0.0);
        assert!(result.mc_var.is_finite());
    }

    #[test]
    fn test_expired_deadline_exhausts_budget() {
        let inputs = two_asset_inputs(0.0);
        let expired = Instant::now()
            .checked_sub(Duration::from_millis(1))
            .unwrap_or_else(Instant::now);
        let result = simulate(&inputs, &params(1, 2_000).with_deadline(Some(expired)));
        assert!(matches!(result, Err(Error::BudgetExhausted(_))));
    }

    #[test]
    fn test_mismatched_inputs_rejected() {
        let inputs = SimulationInputs {
            values: DVector::from_vec(vec![1.0, 2.0]),
            mean_daily: DVector::zeros(1),
            covariance_daily: DMatrix::zeros(2, 2),
            fixed_value: 0.0,
            return_kind: ReturnKind::Simple,
        };
        assert!(matches!(
            simulate(&inputs, &params(1, 10)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_simulated_log_draws_are_converted() {
        // Degenerate model: every draw is the mean daily log return ln(2)
        let inputs = SimulationInputs {
            values: DVector::from_element(1, 100.0),
            mean_daily: DVector::from_element(1, 2.0_f64.ln()),
            covariance_daily: DMatrix::zeros(1, 1),
            fixed_value: 0.0,
            return_kind: ReturnKind::Log,
        };
        let params = MonteCarloParams {
            num_simulations: 10,
            seed: Some(1),
            parallel: false,
            ..MonteCarloParams::from_config(&AnalyticsConfig::default())
        };
        let result = simulate(&inputs, &params).unwrap();
        for value in &result.simulations {
            assert_relative_eq!(*value, 200.0, epsilon = 1e-6);
        }
    }
}
