//! Convex quadratic programming.
//!
//! Problems have the form
//!
//! ```text
//! minimize    1/2 x^T P x + q^T x
//! subject to  l <= A x <= u
//! ```
//!
//! which covers equality rows (`l == u`), one-sided rows (infinite bounds)
//! and box constraints (identity rows in `A`).

use crate::config::AnalyticsConfig;
use crate::{Error, Result};
use clarabel::algebra::CscMatrix;
use clarabel::solver::*;
use nalgebra::{DMatrix, DVector};
use tracing::{debug, trace};

/// A convex QP in standard form.
#[derive(Debug, Clone)]
pub struct QpProblem {
    /// `P`, symmetric positive semi-definite (n x n)
    pub quadratic: DMatrix<f64>,
    /// `q` (n)
    pub linear: DVector<f64>,
    /// `A` (m x n)
    pub constraints: DMatrix<f64>,
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
}

impl QpProblem {
    pub fn dimension(&self) -> usize {
        self.linear.len()
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.linear.len();
        let m = self.constraints.nrows();
        if n == 0 {
            return Err(Error::Validation("QP has no variables".to_string()));
        }
        if self.quadratic.shape() != (n, n) || self.constraints.ncols() != n {
            return Err(Error::Validation(format!(
                "QP shape mismatch: P {:?}, q {}, A {:?}",
                self.quadratic.shape(),
                n,
                self.constraints.shape()
            )));
        }
        if self.lower.len() != m || self.upper.len() != m {
            return Err(Error::Validation(format!(
                "QP bounds have {} / {} rows, A has {}",
                self.lower.len(),
                self.upper.len(),
                m
            )));
        }
        let finite = self.quadratic.iter().all(|v| v.is_finite())
            && self.linear.iter().all(|v| v.is_finite())
            && self.constraints.iter().all(|v| v.is_finite());
        if !finite {
            return Err(Error::NumericInstability(
                "QP data contains non-finite values".to_string(),
            ));
        }
        for (l, u) in self.lower.iter().zip(self.upper.iter()) {
            if l.is_nan() || u.is_nan() || l > u || (l == u && !l.is_finite()) {
                return Err(Error::Validation(format!("invalid QP bounds [{}, {}]", l, u)));
            }
        }
        Ok(())
    }

    pub fn objective(&self, x: &DVector<f64>) -> f64 {
        0.5 * x.dot(&(&self.quadratic * x)) + self.linear.dot(x)
    }
}

/// Solves [`QpProblem`]s.
pub trait QpSolver: Send + Sync {
    fn solve(&self, problem: &QpProblem) -> Result<DVector<f64>>;
}

/// Interior-point backend built on Clarabel.
///
/// `l <= A x <= u` is split into Clarabel's `A x + s = b` form: rows with
/// `l == u` go to the zero cone, finite upper bounds become `A x <= u` and
/// finite lower bounds become `-A x <= -l`, both in the nonnegative cone.
#[derive(Debug, Clone, PartialEq)]
pub struct ClarabelSolver {
    pub max_iterations: u32,
    /// Feasibility and duality-gap tolerance
    pub tolerance: f64,
}

impl Default for ClarabelSolver {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-8,
        }
    }
}

impl ClarabelSolver {
    pub fn from_config(config: &AnalyticsConfig) -> Self {
        Self {
            max_iterations: config.solver_max_iterations,
            tolerance: config.solver_tolerance,
        }
    }
}

/// Column-compressed copy of the upper triangle of `P`.
fn upper_triangle_csc(matrix: &DMatrix<f64>) -> CscMatrix<f64> {
    let n = matrix.ncols();
    let mut colptr = Vec::with_capacity(n + 1);
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();
    colptr.push(0);
    for j in 0..n {
        for i in 0..=j {
            let value = 0.5 * (matrix[(i, j)] + matrix[(j, i)]);
            if value != 0.0 {
                rowval.push(i);
                nzval.push(value);
            }
        }
        colptr.push(nzval.len());
    }
    CscMatrix::new(n, n, colptr, rowval, nzval)
}

/// Constraint rows in Clarabel form, equality rows first.
struct ConicRows {
    rows: Vec<(DVector<f64>, f64)>,
    equalities: usize,
}

impl ConicRows {
    fn from_bounds(problem: &QpProblem) -> Self {
        let a = &problem.constraints;
        let mut equalities = Vec::new();
        let mut inequalities = Vec::new();
        for i in 0..a.nrows() {
            let row: DVector<f64> = a.row(i).transpose();
            let (l, u) = (problem.lower[i], problem.upper[i]);
            if l == u {
                equalities.push((row, u));
                continue;
            }
            if u.is_finite() {
                inequalities.push((row.clone(), u));
            }
            if l.is_finite() {
                inequalities.push((-row, -l));
            }
        }
        let count = equalities.len();
        equalities.extend(inequalities);
        Self {
            rows: equalities,
            equalities: count,
        }
    }

    fn cones(&self) -> Vec<SupportedConeT<f64>> {
        let inequalities = self.rows.len() - self.equalities;
        let mut cones = Vec::with_capacity(2);
        if self.equalities > 0 {
            cones.push(ZeroConeT(self.equalities));
        }
        if inequalities > 0 {
            cones.push(NonnegativeConeT(inequalities));
        }
        cones
    }

    fn matrix(&self, n: usize) -> CscMatrix<f64> {
        let m = self.rows.len();
        let mut colptr = Vec::with_capacity(n + 1);
        let mut rowval = Vec::new();
        let mut nzval = Vec::new();
        colptr.push(0);
        for j in 0..n {
            for (i, (row, _)) in self.rows.iter().enumerate() {
                if row[j] != 0.0 {
                    rowval.push(i);
                    nzval.push(row[j]);
                }
            }
            colptr.push(nzval.len());
        }
        CscMatrix::new(m, n, colptr, rowval, nzval)
    }

    fn rhs(&self) -> Vec<f64> {
        self.rows.iter().map(|(_, b)| *b).collect()
    }
}

impl QpSolver for ClarabelSolver {
    fn solve(&self, problem: &QpProblem) -> Result<DVector<f64>> {
        problem.validate()?;

        let n = problem.dimension();
        let rows = ConicRows::from_bounds(problem);
        let p = upper_triangle_csc(&problem.quadratic);
        let q: Vec<f64> = problem.linear.iter().copied().collect();
        let a = rows.matrix(n);
        let b = rows.rhs();
        let cones = rows.cones();

        let settings = DefaultSettingsBuilder::default()
            .max_iter(self.max_iterations)
            .tol_gap_abs(self.tolerance)
            .tol_gap_rel(self.tolerance)
            .tol_feas(self.tolerance)
            .verbose(false)
            .build()
            .map_err(|e| Error::Validation(format!("invalid QP solver settings: {}", e)))?;

        let mut solver = DefaultSolver::new(&p, &q, &a, &b, &cones, settings)
            .map_err(|e| Error::Validation(format!("QP rejected by solver: {:?}", e)))?;
        solver.solve();

        let status = &solver.solution.status;
        trace!(?status, iterations = solver.solution.iterations, "QP finished");
        match status {
            SolverStatus::Solved | SolverStatus::AlmostSolved => {
                let x = DVector::from_column_slice(&solver.solution.x);
                if x.iter().any(|v| !v.is_finite()) {
                    return Err(Error::NumericInstability(
                        "QP solution contains non-finite values".to_string(),
                    ));
                }
                debug!(?status, objective = problem.objective(&x), "QP solved");
                Ok(x)
            }
            other => Err(Error::NumericInstability(format!(
                "QP solver stopped with status {:?}",
                other
            ))),
        }
    }
}
