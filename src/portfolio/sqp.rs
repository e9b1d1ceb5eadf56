//! # Sequential Quadratic Programming
//!
//! $$
//! \min_{d}\ \tfrac12 d^\top B d + \nabla f^\top d
//! \quad\text{s.t.}\quad \mathbf 1^\top d = 0,\ \ l - x \le d \le u - x,\ \
//! c(x) + \nabla c(x)^\top d \ge 0
//! $$
//!
//! Dense SQP for problems on the budget hyperplane `sum(w) = 1` with a uniform
//! box and optional nonlinear inequalities `c(w) >= 0`. Each subproblem is a
//! strictly convex QP handed to the clarabel interior-point solver. Steps are
//! globalized by backtracking on the l1 merit function `f + rho * sum(max(0, -c))`
//! and `B` is a damped BFGS approximation of the Lagrangian Hessian.
//!
//! For concave `c` (a convex feasible set) the linearized subproblem is feasible
//! whenever the original problem is, so an infeasible subproblem ends the run as
//! incompatible constraints.

use argmin::core::TerminationReason;
use clarabel::algebra::CscMatrix;
use nalgebra::DMatrix;
use nalgebra::DVector;
use ndarray::Array1;
use ndarray::Array2;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::trace;

use super::objectives::ConstrainedProblem;
use crate::error::PortfolioError;
use crate::error::PortfolioResult;

/// Armijo sufficient-decrease fraction.
const ARMIJO: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 40;
/// A search direction shorter than this (max-norm) counts as a stationary point.
const STEP_TOL: f64 = 1e-10;
/// Interior-point gap and feasibility tolerance for the QP subproblems.
const QP_TOL: f64 = 1e-10;
const QP_MAX_ITERS: u32 = 200;
/// Budget slack below which the box meets the hyperplane in a single point.
const DEGENERATE_BOX_TOL: f64 = 1e-12;

/// Iteration and tolerance settings of [`Sqp`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
  pub max_iters: u64,
  /// Predicted decrease, or objective change over a full step, below which a feasible
  /// iterate is accepted.
  pub ftol: f64,
  /// Maximum tolerated violation of the nonlinear inequalities.
  pub feasibility_tol: f64,
}

impl Default for SolverConfig {
  fn default() -> Self {
    Self {
      max_iters: 1000,
      ftol: 1e-9,
      feasibility_tol: 1e-8,
    }
  }
}

/// Final iterate of an SQP run.
#[derive(Clone, Debug)]
pub struct SqpOutcome {
  pub x: Array1<f64>,
  pub cost: f64,
  pub iterations: u64,
  /// Largest violation `max(0, -c_k)` at `x`.
  pub max_violation: f64,
  pub termination: TerminationReason,
}

impl SqpOutcome {
  pub fn converged(&self) -> bool {
    self.termination == TerminationReason::SolverConverged
  }
}

/// SQP solver over `{ w : sum(w) = 1, lower <= w_i <= upper }`.
#[derive(Clone, Debug)]
pub struct Sqp {
  lower: f64,
  upper: f64,
  config: SolverConfig,
}

impl Sqp {
  pub fn new(bounds: (f64, f64), config: SolverConfig) -> Self {
    Self {
      lower: bounds.0,
      upper: bounds.1,
      config,
    }
  }

  pub fn config(&self) -> &SolverConfig {
    &self.config
  }

  /// Run SQP from `x0`. `x0` is moved into the box and back onto the budget hyperplane first.
  pub fn minimize<P>(&self, problem: &P, x0: Array1<f64>) -> PortfolioResult<SqpOutcome>
  where
    P: ConstrainedProblem,
  {
    let n = x0.len();
    let m = problem.n_inequalities();

    let mut x = self.retract(to_dvector(&x0));
    let mut state = self.evaluate(problem, &x)?;

    let n_f = n as f64;
    if (n_f * self.upper - 1.0).abs() <= DEGENERATE_BOX_TOL
      || (n_f * self.lower - 1.0).abs() <= DEGENERATE_BOX_TOL
    {
      // only the equal-weight point is feasible
      let termination = if l1_violation(&state.c) <= self.config.feasibility_tol {
        TerminationReason::SolverConverged
      } else {
        incompatible()
      };
      return Ok(self.finish(problem, x, &state, 0, termination));
    }

    let mut hessian = DMatrix::<f64>::identity(n, n);
    let mut rho = 0.0_f64;

    for iter in 1..=self.config.max_iters {
      let solution = match self.subproblem(&x, &state, &hessian).solve() {
        Ok(solution) => solution,
        Err(QpFailure::Infeasible) => {
          return Ok(self.finish(problem, x, &state, iter, incompatible()));
        }
        Err(QpFailure::Unsolved(status)) => {
          return Ok(self.finish(
            problem,
            x,
            &state,
            iter,
            TerminationReason::SolverExit(format!("QP subproblem not solved: {status}")),
          ));
        }
      };
      let d = solution.z;
      let lambda = solution.multipliers.rows(2 * n, m).into_owned();

      let violation = l1_violation(&state.c);
      let predicted = state.g.dot(&d);
      let step = max_abs(&d);

      trace!(iter, cost = state.f, violation, predicted, step, "sqp iteration");

      if violation <= self.config.feasibility_tol
        && (predicted.abs() < self.config.ftol || step <= STEP_TOL)
      {
        return Ok(self.finish(problem, x, &state, iter, TerminationReason::SolverConverged));
      }

      rho = rho.max(2.0 * max_abs(&lambda) + 1e-3);
      let linearized = &state.c + &state.jac * &d;
      let merit0 = state.f + rho * violation;
      let slope = (predicted + rho * (l1_violation(&linearized) - violation)).min(0.0);

      let mut alpha = 1.0;
      let mut accepted = None;
      for _ in 0..MAX_BACKTRACKS {
        let trial = self.retract(&x + &d * alpha);
        let f = problem
          .cost(&to_array(&trial))
          .map_err(|e| PortfolioError::Solver(e.to_string()))?;
        let c = to_dvector(&problem.inequalities(&to_array(&trial)));
        if f + rho * l1_violation(&c) <= merit0 + ARMIJO * alpha * slope {
          accepted = Some((trial, f));
          break;
        }
        alpha *= 0.5;
      }

      let Some((x_new, f_new)) = accepted else {
        return Ok(self.finish(
          problem,
          x,
          &state,
          iter,
          TerminationReason::SolverExit("line search failed".to_string()),
        ));
      };

      let next = self.evaluate(problem, &x_new)?;
      let s = &x_new - &x;
      let mut y = &next.g - &state.g;
      for k in 0..m {
        let dj = next.jac.row(k) - state.jac.row(k);
        y -= dj.transpose() * lambda[k];
      }
      damped_bfgs_update(&mut hessian, &s, &y);

      let df = (f_new - state.f).abs();
      x = x_new;
      state = next;

      // a backtracked step says nothing about stationarity
      let feasible = l1_violation(&state.c) <= self.config.feasibility_tol;
      if alpha == 1.0 && feasible && df < self.config.ftol {
        return Ok(self.finish(problem, x, &state, iter, TerminationReason::SolverConverged));
      }
    }

    Ok(self.finish(
      problem,
      x,
      &state,
      self.config.max_iters,
      TerminationReason::MaxItersReached,
    ))
  }

  fn evaluate<P>(&self, problem: &P, x: &DVector<f64>) -> PortfolioResult<Evaluation>
  where
    P: ConstrainedProblem,
  {
    let w = to_array(x);
    let f = problem
      .cost(&w)
      .map_err(|e| PortfolioError::Solver(e.to_string()))?;
    let g = problem
      .gradient(&w)
      .map_err(|e| PortfolioError::Solver(e.to_string()))?;
    if !f.is_finite() || g.iter().any(|v| !v.is_finite()) {
      return Err(PortfolioError::Solver(
        "objective is not finite at the current iterate".to_string(),
      ));
    }
    Ok(Evaluation {
      f,
      g: to_dvector(&g),
      c: to_dvector(&problem.inequalities(&w)),
      jac: to_dmatrix(&problem.inequality_jacobian(&w)),
    })
  }

  /// Clamp into the box, then spread the budget residual over the coordinates strictly inside it.
  fn retract(&self, x: DVector<f64>) -> DVector<f64> {
    let mut x = x.map(|v| v.clamp(self.lower, self.upper));
    let free: Vec<usize> = (0..x.len())
      .filter(|&i| x[i] > self.lower && x[i] < self.upper)
      .collect();
    if !free.is_empty() {
      let shift = (1.0 - x.sum()) / free.len() as f64;
      for i in free {
        x[i] = (x[i] + shift).clamp(self.lower, self.upper);
      }
    }
    x
  }

  /// Inequality rows: lower bounds, upper bounds, linearized constraints.
  fn subproblem(&self, x: &DVector<f64>, state: &Evaluation, hessian: &DMatrix<f64>) -> DenseQp {
    let n = x.len();
    let m = state.c.len();

    let mut a_in = DMatrix::<f64>::zeros(2 * n + m, n);
    let mut b_in = DVector::<f64>::zeros(2 * n + m);
    for i in 0..n {
      a_in[(i, i)] = -1.0;
      b_in[i] = x[i] - self.lower;
      a_in[(n + i, i)] = 1.0;
      b_in[n + i] = self.upper - x[i];
    }
    for k in 0..m {
      for j in 0..n {
        a_in[(2 * n + k, j)] = -state.jac[(k, j)];
      }
      b_in[2 * n + k] = state.c[k];
    }

    DenseQp {
      p: hessian.clone(),
      q: state.g.clone(),
      a_eq: DMatrix::from_element(1, n, 1.0),
      b_eq: DVector::zeros(1),
      a_in,
      b_in,
    }
  }

  fn finish<P>(
    &self,
    problem: &P,
    x: DVector<f64>,
    state: &Evaluation,
    iterations: u64,
    termination: TerminationReason,
  ) -> SqpOutcome
  where
    P: ConstrainedProblem,
  {
    let max_violation = state.c.iter().fold(0.0_f64, |acc, &c| acc.max(-c));
    debug!(
      iterations,
      cost = state.f,
      max_violation,
      constraints = problem.n_inequalities(),
      termination = ?termination,
      "sqp finished"
    );
    SqpOutcome {
      x: to_array(&x),
      cost: state.f,
      iterations,
      max_violation,
      termination,
    }
  }
}

struct Evaluation {
  f: f64,
  g: DVector<f64>,
  c: DVector<f64>,
  jac: DMatrix<f64>,
}

/// `min 1/2 z'Pz + q'z  s.t.  A_eq z = b_eq,  A_in z <= b_in` with `P` positive semidefinite.
pub(crate) struct DenseQp {
  pub(crate) p: DMatrix<f64>,
  pub(crate) q: DVector<f64>,
  pub(crate) a_eq: DMatrix<f64>,
  pub(crate) b_eq: DVector<f64>,
  pub(crate) a_in: DMatrix<f64>,
  pub(crate) b_in: DVector<f64>,
}

pub(crate) struct QpSolution {
  pub(crate) z: DVector<f64>,
  /// One non-negative multiplier per row of `A_in`.
  pub(crate) multipliers: DVector<f64>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum QpFailure {
  Infeasible,
  Unsolved(String),
}

impl DenseQp {
  pub(crate) fn solve(&self) -> Result<QpSolution, QpFailure> {
    use clarabel::solver::*;

    let n_eq = self.a_eq.nrows();
    let n_in = self.a_in.nrows();

    let nz = self.q.len();
    let mut stacked = DMatrix::<f64>::zeros(n_eq + n_in, nz);
    stacked.view_mut((0, 0), (n_eq, nz)).copy_from(&self.a_eq);
    stacked.view_mut((n_eq, 0), (n_in, nz)).copy_from(&self.a_in);

    // clarabel reads the upper triangle of P
    let p = to_csc(&self.p, |i, j| i <= j);
    let a = to_csc(&stacked, |_, _| true);
    let q: Vec<f64> = self.q.iter().copied().collect();
    let b: Vec<f64> = self.b_eq.iter().chain(self.b_in.iter()).copied().collect();

    let mut cones = Vec::with_capacity(2);
    if n_eq > 0 {
      cones.push(ZeroConeT(n_eq));
    }
    if n_in > 0 {
      cones.push(NonnegativeConeT(n_in));
    }

    let settings = DefaultSettingsBuilder::default()
      .max_iter(QP_MAX_ITERS)
      .tol_gap_abs(QP_TOL)
      .tol_gap_rel(QP_TOL)
      .tol_feas(QP_TOL)
      .verbose(false)
      .build()
      .map_err(|e| QpFailure::Unsolved(e.to_string()))?;

    let mut solver = DefaultSolver::new(&p, &q, &a, &b, &cones, settings)
      .map_err(|e| QpFailure::Unsolved(format!("{e:?}")))?;
    solver.solve();

    match solver.solution.status {
      SolverStatus::Solved | SolverStatus::AlmostSolved => Ok(QpSolution {
        z: DVector::from_column_slice(&solver.solution.x),
        multipliers: DVector::from_column_slice(&solver.solution.z[n_eq..]),
      }),
      SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
        Err(QpFailure::Infeasible)
      }
      status => Err(QpFailure::Unsolved(format!("{status:?}"))),
    }
  }
}

fn incompatible() -> TerminationReason {
  TerminationReason::SolverExit("inequality constraints incompatible".to_string())
}

/// Powell-damped BFGS update keeping `b` positive definite.
fn damped_bfgs_update(b: &mut DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>) {
  let bs = &*b * s;
  let sbs = s.dot(&bs);
  if sbs <= 1e-16 {
    return;
  }
  let sy = s.dot(y);
  let r = if sy >= 0.2 * sbs {
    y.clone()
  } else {
    let theta = 0.8 * sbs / (sbs - sy);
    y * theta + &bs * (1.0 - theta)
  };
  let sr = s.dot(&r);
  if sr <= 1e-16 {
    return;
  }
  *b -= &bs * bs.transpose() / sbs;
  *b += &r * r.transpose() / sr;
}

fn max_abs(v: &DVector<f64>) -> f64 {
  v.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}

fn l1_violation(c: &DVector<f64>) -> f64 {
  c.iter().map(|&v| (-v).max(0.0)).sum()
}

/// Column-compressed copy of the non-zero entries of `m` selected by `keep`.
fn to_csc(m: &DMatrix<f64>, keep: impl Fn(usize, usize) -> bool) -> CscMatrix<f64> {
  let mut colptr = Vec::with_capacity(m.ncols() + 1);
  let mut rowval = Vec::new();
  let mut nzval = Vec::new();
  colptr.push(0);
  for j in 0..m.ncols() {
    for i in 0..m.nrows() {
      let v = m[(i, j)];
      if v != 0.0 && keep(i, j) {
        rowval.push(i);
        nzval.push(v);
      }
    }
    colptr.push(nzval.len());
  }
  CscMatrix::new(m.nrows(), m.ncols(), colptr, rowval, nzval)
}

fn to_dvector(a: &Array1<f64>) -> DVector<f64> {
  DVector::from_iterator(a.len(), a.iter().copied())
}

fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
  DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

fn to_array(v: &DVector<f64>) -> Array1<f64> {
  v.iter().copied().collect()
}
