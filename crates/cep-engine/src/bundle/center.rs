//! Analytic center of the level set.
//!
//! The next bundle iterate is the analytic center of
//! `{x ∈ X : cᵀx + Σ τ_ω ≤ L_k + α·(U_k − L_k)}`, the minimizer of the
//! negative log-barrier over all level-set inequalities. Compared with a
//! proximal-quadratic step this tolerates degenerate LP duals and keeps
//! iterates interior, which conditions the next master LP.
//!
//! Two stages: a small anchor LP maximizes the common slack to find a
//! strictly interior start (and detects an empty interior, in which case
//! the master optimum is used as the iterate); then a damped Newton method
//! minimizes the barrier, with a fraction-to-boundary line search.

use crate::bundle::master::MasterSolution;
use crate::bundle::{Cut, CuttingPlaneModel};
use good_lp::solvers::clarabel::clarabel;
use good_lp::{constraint, variable, variables, Expression, Solution, SolverModel, Variable};
use std::ops::Range;

const MIN_INTERIOR_SLACK: f64 = 1e-7;
const NEWTON_TOL: f64 = 1e-9;
const MAX_NEWTON_ITERS: usize = 50;

/// One inequality `aᵀy ≤ b` in sparse form over the stacked variable
/// vector y = (free capacity slots, epigraph variables).
struct BarrierRow {
    coeffs: Vec<(usize, f64)>,
    bound: f64,
}

impl BarrierRow {
    fn slack(&self, y: &[f64]) -> f64 {
        self.bound - self.coeffs.iter().map(|&(v, a)| a * y[v]).sum::<f64>()
    }

    fn direction(&self, d: &[f64]) -> f64 {
        self.coeffs.iter().map(|&(v, a)| a * d[v]).sum::<f64>()
    }
}

/// Compute the analytic center of the level set and return the capacity
/// part (flat slot layout). Falls back to the master optimum when the
/// level set has an empty interior or the barrier system degenerates.
#[allow(clippy::too_many_arguments)]
pub fn analytic_center(
    costs: &[f64],
    upper: &[f64],
    emissions_slots: Range<usize>,
    emissions_total: f64,
    models: &[CuttingPlaneModel],
    level: f64,
    master: &MasterSolution,
) -> Vec<f64> {
    let n_slots = costs.len();
    let n_scen = models.len();

    // Capacity slots with a zero upper bound are fixed at zero and carry
    // no barrier terms.
    let free: Vec<usize> = (0..n_slots).filter(|&c| upper[c] > 0.0).collect();
    let var_of_slot: Vec<Option<usize>> = {
        let mut map = vec![None; n_slots];
        for (v, &c) in free.iter().enumerate() {
            map[c] = Some(v);
        }
        map
    };
    let n_y = free.len() + n_scen;
    let tau_var = |omega: usize| free.len() + omega;

    // Assemble the level-set inequalities
    let mut rows: Vec<BarrierRow> = Vec::new();
    for (v, &c) in free.iter().enumerate() {
        rows.push(BarrierRow {
            coeffs: vec![(v, -1.0)],
            bound: 0.0,
        });
        if upper[c].is_finite() {
            rows.push(BarrierRow {
                coeffs: vec![(v, 1.0)],
                bound: upper[c],
            });
        }
    }
    if emissions_total.is_finite() {
        let coeffs: Vec<(usize, f64)> = emissions_slots
            .clone()
            .filter_map(|slot| var_of_slot[slot].map(|v| (v, 1.0)))
            .collect();
        rows.push(BarrierRow {
            coeffs,
            bound: emissions_total,
        });
    }
    for (omega, model) in models.iter().enumerate() {
        for cut in &model.cuts {
            match cut {
                Cut::Optimality {
                    value,
                    gradient,
                    reference,
                } => {
                    // gᵀx − τ_ω ≤ gᵀx_ref − value
                    let mut coeffs = Vec::new();
                    let mut bound = -value;
                    for (c, g) in gradient.iter().enumerate() {
                        if *g != 0.0 {
                            bound += g * reference[c];
                            if let Some(v) = var_of_slot[c] {
                                coeffs.push((v, *g));
                            }
                        }
                    }
                    coeffs.push((tau_var(omega), -1.0));
                    rows.push(BarrierRow { coeffs, bound });
                }
                Cut::Feasibility { gradient, rhs } => {
                    let coeffs: Vec<(usize, f64)> = gradient
                        .iter()
                        .enumerate()
                        .filter(|(_, g)| **g != 0.0)
                        .filter_map(|(c, g)| var_of_slot[c].map(|v| (v, -*g)))
                        .collect();
                    rows.push(BarrierRow {
                        coeffs,
                        bound: -rhs,
                    });
                }
            }
        }
    }
    if level.is_finite() {
        // Level constraint: cᵀx + Σ τ ≤ level
        let mut coeffs: Vec<(usize, f64)> = free
            .iter()
            .enumerate()
            .filter(|(_, &c)| costs[c] != 0.0)
            .map(|(v, &c)| (v, costs[c]))
            .collect();
        for omega in 0..n_scen {
            coeffs.push((tau_var(omega), 1.0));
        }
        rows.push(BarrierRow {
            coeffs,
            bound: level,
        });
    }

    // Anchor LP: maximize the common slack s ≤ 1
    let Some(mut y) = interior_anchor(&rows, n_y) else {
        return master.x.clone();
    };

    // Damped Newton on F(y) = −Σ ln(slack_i)
    let barrier = |y: &[f64]| -> f64 {
        rows.iter().map(|row| -row.slack(y).ln()).sum()
    };
    for _ in 0..MAX_NEWTON_ITERS {
        let slacks: Vec<f64> = rows.iter().map(|row| row.slack(&y)).collect();
        if slacks.iter().any(|&s| s <= 0.0) {
            break;
        }

        let mut gradient = vec![0.0; n_y];
        let mut hessian = vec![vec![0.0; n_y]; n_y];
        for (row, &s) in rows.iter().zip(&slacks) {
            let inv = 1.0 / s;
            let inv2 = inv * inv;
            for &(v, a) in &row.coeffs {
                gradient[v] += a * inv;
                for &(w, b) in &row.coeffs {
                    hessian[v][w] += a * b * inv2;
                }
            }
        }
        for (v, row) in hessian.iter_mut().enumerate() {
            row[v] += 1e-12;
        }

        let Some(direction) = cholesky_solve(hessian, gradient.iter().map(|g| -g).collect())
        else {
            break;
        };
        let decrement: f64 = gradient
            .iter()
            .zip(&direction)
            .map(|(g, d)| -g * d)
            .sum();
        if decrement < NEWTON_TOL {
            break;
        }

        // Fraction-to-boundary, then backtrack on the barrier value
        let mut step = 1.0_f64;
        for (row, &s) in rows.iter().zip(&slacks) {
            let along = row.direction(&direction);
            if along > 0.0 {
                step = step.min(0.99 * s / along);
            }
        }
        let current = barrier(&y);
        let mut candidate: Vec<f64>;
        loop {
            candidate = y
                .iter()
                .zip(&direction)
                .map(|(yi, di)| yi + step * di)
                .collect();
            if barrier(&candidate) <= current || step < 1e-12 {
                break;
            }
            step *= 0.5;
        }
        if step < 1e-12 {
            break;
        }
        y = candidate;
    }

    // Reassemble the full capacity vector
    let mut x = vec![0.0; n_slots];
    for (v, &c) in free.iter().enumerate() {
        let ub = if upper[c].is_finite() { upper[c] } else { f64::MAX };
        x[c] = y[v].clamp(0.0, ub);
    }
    x
}

/// Maximize a common slack over all rows; returns a strictly interior
/// point, or None when no interior exists.
fn interior_anchor(rows: &[BarrierRow], n_y: usize) -> Option<Vec<f64>> {
    let mut vars = variables!();
    let y_vars: Vec<Variable> = (0..n_y).map(|_| vars.add(variable())).collect();
    let s_var = vars.add(variable().max(1.0));

    let mut lp = vars.maximise(s_var).using(clarabel);
    for row in rows {
        let mut lhs = Expression::from(s_var);
        for &(v, a) in &row.coeffs {
            lhs += a * y_vars[v];
        }
        lp = lp.with(constraint!(lhs <= row.bound));
    }

    match lp.solve() {
        Ok(solution) => {
            if solution.value(s_var) <= MIN_INTERIOR_SLACK {
                None
            } else {
                Some(y_vars.iter().map(|v| solution.value(*v)).collect())
            }
        }
        Err(_) => None,
    }
}

/// Solve H·x = rhs for symmetric positive definite H by Cholesky
/// factorization. Returns None when a pivot degenerates.
fn cholesky_solve(mut h: Vec<Vec<f64>>, rhs: Vec<f64>) -> Option<Vec<f64>> {
    let n = h.len();
    // Factor H = L·Lᵀ in place (lower triangle)
    for k in 0..n {
        let mut pivot = h[k][k];
        for j in 0..k {
            pivot -= h[k][j] * h[k][j];
        }
        if pivot <= 0.0 || !pivot.is_finite() {
            return None;
        }
        let pivot = pivot.sqrt();
        h[k][k] = pivot;
        for i in (k + 1)..n {
            let mut value = h[i][k];
            for j in 0..k {
                value -= h[i][j] * h[k][j];
            }
            h[i][k] = value / pivot;
        }
    }

    // Forward substitution (L·z = rhs)
    let mut z = rhs;
    for i in 0..n {
        for j in 0..i {
            z[i] -= h[i][j] * z[j];
        }
        z[i] /= h[i][i];
    }

    // Back substitution (Lᵀ·x = z)
    for i in (0..n).rev() {
        for j in (i + 1)..n {
            z[i] -= h[j][i] * z[j];
        }
        z[i] /= h[i][i];
    }
    Some(z)
}
