//! Long-only mean-variance optimization.
//!
//! Every problem is posed over weights `w >= 0, sum(w) = 1` and handed to a
//! [`QpSolver`]:
//!
//! - minimum volatility: `min w^T S w`
//! - target return: the same, plus `w^T mu = target`
//! - maximum Sharpe: `min y^T S y` subject to `(mu - rf)^T y = 1, y >= 0`,
//!   then `w = y / sum(y)`

use super::qp::{QpProblem, QpSolver};
use super::{Frontier, OptimalPortfolio};
use crate::analytics::sharpe_ratio;
use crate::types::{Warning, WarningCode};
use crate::{Error, Result};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, warn};

/// Weights below this after solving are treated as zero.
const WEIGHT_FLOOR: f64 = 1e-10;

/// Expected returns and covariance over the optimizable universe.
#[derive(Debug, Clone)]
pub struct MeanVarianceInputs {
    pub tickers: Vec<String>,
    /// Annualized expected returns
    pub mean_returns: DVector<f64>,
    /// Annualized covariance, positive definite
    pub covariance: DMatrix<f64>,
}

impl MeanVarianceInputs {
    pub fn len(&self) -> usize {
        self.tickers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty()
    }

    /// `(expected return, volatility)` of a weight vector.
    pub fn evaluate(&self, weights: &DVector<f64>) -> (f64, f64) {
        let ret = self.mean_returns.dot(weights);
        let variance = weights.dot(&(&self.covariance * weights)).max(0.0);
        (ret, variance.sqrt())
    }

    pub fn portfolio(&self, weights: &DVector<f64>, risk_free_rate: f64) -> OptimalPortfolio {
        let (expected_return, volatility) = self.evaluate(weights);
        OptimalPortfolio {
            weights: self
                .tickers
                .iter()
                .cloned()
                .zip(weights.iter().copied())
                .collect::<BTreeMap<_, _>>(),
            expected_return,
            volatility,
            sharpe_ratio: sharpe_ratio(expected_return, risk_free_rate, volatility),
        }
    }
}

/// One solved point on the frontier.
#[derive(Debug, Clone)]
pub struct FrontierPoint {
    pub target_return: f64,
    pub weights: DVector<f64>,
    pub expected_return: f64,
    pub volatility: f64,
}

/// Everything the optimizer derives from one set of inputs.
#[derive(Debug, Clone)]
pub struct MeanVarianceSolution {
    pub frontier: Frontier,
    pub max_sharpe: OptimalPortfolio,
    pub min_volatility: OptimalPortfolio,
    pub warnings: Vec<Warning>,
}

/// Solves the long-only mean-variance problems with a pluggable QP solver.
pub struct MeanVarianceOptimizer<'a> {
    solver: &'a dyn QpSolver,
    inputs: &'a MeanVarianceInputs,
    parallel: bool,
}

impl<'a> MeanVarianceOptimizer<'a> {
    pub fn new(solver: &'a dyn QpSolver, inputs: &'a MeanVarianceInputs) -> Self {
        Self {
            solver,
            inputs,
            parallel: true,
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Budget constraint and long-only box, plus optional extra equality rows.
    fn fully_invested(&self, extra: &[(&DVector<f64>, f64)]) -> QpProblem {
        let n = self.inputs.len();
        let m = 1 + extra.len() + n;
        let mut constraints = DMatrix::zeros(m, n);
        let mut lower = DVector::zeros(m);
        let mut upper = DVector::from_element(m, 1.0);

        constraints.row_mut(0).fill(1.0);
        lower[0] = 1.0;
        for (k, (row, value)) in extra.iter().enumerate() {
            constraints.row_mut(1 + k).tr_copy_from(*row);
            lower[1 + k] = *value;
            upper[1 + k] = *value;
        }
        for i in 0..n {
            constraints[(1 + extra.len() + i, i)] = 1.0;
        }

        QpProblem {
            quadratic: self.inputs.covariance.clone(),
            linear: DVector::zeros(n),
            constraints,
            lower,
            upper,
        }
    }

    /// Global minimum-variance weights.
    pub fn min_volatility(&self) -> Result<DVector<f64>> {
        let x = self.solver.solve(&self.fully_invested(&[]))?;
        polish(x)
    }

    /// Minimum-variance weights achieving `target` expected return.
    pub fn for_target_return(&self, target: f64) -> Result<DVector<f64>> {
        let x = self
            .solver
            .solve(&self.fully_invested(&[(&self.inputs.mean_returns, target)]))?;
        polish(x)
    }

    /// Tangency portfolio for `risk_free_rate`.
    ///
    /// Fails when no asset earns more than the risk-free rate.
    pub fn max_sharpe(&self, risk_free_rate: f64) -> Result<DVector<f64>> {
        let n = self.inputs.len();
        let excess = self.inputs.mean_returns.add_scalar(-risk_free_rate);
        if excess.iter().all(|e| *e <= 0.0) {
            return Err(Error::NumericInstability(format!(
                "no asset has expected return above the risk-free rate {}",
                risk_free_rate
            )));
        }

        let mut constraints = DMatrix::zeros(n + 1, n);
        constraints.row_mut(0).tr_copy_from(&excess);
        for i in 0..n {
            constraints[(1 + i, i)] = 1.0;
        }
        let mut lower = DVector::zeros(n + 1);
        let mut upper = DVector::from_element(n + 1, f64::INFINITY);
        lower[0] = 1.0;
        upper[0] = 1.0;

        let y = self.solver.solve(&QpProblem {
            quadratic: self.inputs.covariance.clone(),
            linear: DVector::zeros(n),
            constraints,
            lower,
            upper,
        })?;
        polish(y)
    }

    /// Solve the frontier on an evenly spaced return grid.
    ///
    /// The grid runs from `min_return` to the highest single-asset expected
    /// return. Points that fail to solve, or that are reached after
    /// `deadline`, are skipped with a warning.
    pub fn frontier(
        &self,
        min_return: f64,
        points: usize,
        deadline: Option<Instant>,
        warnings: &mut Vec<Warning>,
    ) -> Result<Vec<FrontierPoint>> {
        let max_return = self.inputs.mean_returns.max();
        let targets: Vec<f64> = if points < 2 || max_return - min_return <= 1e-12 {
            vec![min_return]
        } else {
            let step = (max_return - min_return) / (points - 1) as f64;
            (0..points).map(|i| min_return + step * i as f64).collect()
        };

        let solve_point = |target: &f64| -> std::result::Result<FrontierPoint, String> {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err("deadline reached".to_string());
            }
            let weights = self.for_target_return(*target).map_err(|e| e.to_string())?;
            let (expected_return, volatility) = self.inputs.evaluate(&weights);
            Ok(FrontierPoint {
                target_return: *target,
                weights,
                expected_return,
                volatility,
            })
        };

        let solved: Vec<std::result::Result<FrontierPoint, String>> = if self.parallel {
            targets.par_iter().map(solve_point).collect()
        } else {
            targets.iter().map(solve_point).collect()
        };

        let mut frontier = Vec::with_capacity(solved.len());
        let mut expired = 0;
        for (target, outcome) in targets.iter().zip(solved) {
            match outcome {
                Ok(point) => frontier.push(point),
                Err(reason) => {
                    if reason.starts_with("deadline") {
                        expired += 1;
                    }
                    warn!(target, reason = %reason, "skipping frontier point");
                    warnings.push(Warning::new(
                        WarningCode::FrontierPointSkipped,
                        format!("frontier point at target return {:.4} skipped: {}", target, reason),
                    ));
                }
            }
        }

        if frontier.is_empty() {
            return Err(if expired == targets.len() {
                Error::BudgetExhausted("deadline passed before any frontier point was solved".to_string())
            } else {
                Error::NumericInstability("optimizer failed on every frontier point".to_string())
            });
        }
        debug!(points = frontier.len(), requested = targets.len(), "frontier solved");
        Ok(frontier)
    }

    /// Minimum-volatility, frontier and maximum-Sharpe portfolios.
    pub fn solve(
        &self,
        risk_free_rate: f64,
        points: usize,
        deadline: Option<Instant>,
    ) -> Result<MeanVarianceSolution> {
        if self.inputs.is_empty() {
            return Err(Error::Validation("optimization universe is empty".to_string()));
        }
        let mut warnings = Vec::new();

        let min_weights = self.min_volatility()?;
        let min_volatility = self.inputs.portfolio(&min_weights, risk_free_rate);

        let points = self.frontier(min_volatility.expected_return, points, deadline, &mut warnings)?;

        let max_sharpe = match self.max_sharpe(risk_free_rate) {
            Ok(weights) => self.inputs.portfolio(&weights, risk_free_rate),
            Err(e) => {
                warn!(error = %e, "tangency portfolio unavailable, scanning frontier");
                warnings.push(Warning::new(
                    WarningCode::MaxSharpeFallback,
                    format!("max-Sharpe portfolio taken from the frontier: {}", e),
                ));
                best_sharpe_point(&points, &min_weights, self.inputs, risk_free_rate)
            }
        };

        Ok(MeanVarianceSolution {
            frontier: Frontier {
                returns: points.iter().map(|p| p.expected_return).collect(),
                volatility: points.iter().map(|p| p.volatility).collect(),
            },
            max_sharpe,
            min_volatility,
            warnings,
        })
    }
}

/// Highest-Sharpe candidate among the frontier points and the min-vol weights.
fn best_sharpe_point(
    points: &[FrontierPoint],
    min_weights: &DVector<f64>,
    inputs: &MeanVarianceInputs,
    risk_free_rate: f64,
) -> OptimalPortfolio {
    let mut best = inputs.portfolio(min_weights, risk_free_rate);
    for point in points {
        let candidate = inputs.portfolio(&point.weights, risk_free_rate);
        let better = match (candidate.sharpe_ratio, best.sharpe_ratio) {
            (Some(c), Some(b)) => c > b,
            (Some(_), None) => true,
            _ => false,
        };
        if better {
            best = candidate;
        }
    }
    best
}

/// Clip negative solver noise and renormalize to a fully invested portfolio.
fn polish(mut x: DVector<f64>) -> Result<DVector<f64>> {
    for v in x.iter_mut() {
        if *v < WEIGHT_FLOOR {
            *v = 0.0;
        }
    }
    let total = x.sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(Error::NumericInstability(
            "optimizer returned no positive weights".to_string(),
        ));
    }
    Ok(x / total)
}
