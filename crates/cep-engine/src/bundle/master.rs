//! Master LP of the level-bundle method.
//!
//! Over the capacity polyhedron X (componentwise bounds plus the total
//! emissions cap), minimize `cᵀx + Σ_ω τ_ω` subject to every recorded cut:
//! optimality cuts bound each scenario's epigraph variable from below,
//! feasibility cuts exclude capacity regions certified operationally
//! infeasible. The optimal value is a valid lower bound on the planning
//! optimum; only primal values are needed here, so the model is built
//! through good_lp on the same conic backend as the subproblems.

use crate::bundle::{Cut, CuttingPlaneModel};
use good_lp::solvers::clarabel::clarabel;
use good_lp::{constraint, variable, variables, Expression, ResolutionError, Solution, SolverModel, Variable};
use std::ops::Range;
use thiserror::Error;

/// A scenario with no optimality cuts yet leaves its epigraph variable
/// supported only by this floor; the resulting lower bound is useless but
/// finite, and tightens as soon as the scenario produces a cut.
const TAU_FLOOR: f64 = -1.0e12;

/// Errors from the master LP
#[derive(Debug, Error)]
pub enum MasterError {
    /// Every capacity decision in X violates some feasibility cut: the
    /// planning problem itself is infeasible.
    #[error("master LP infeasible")]
    Infeasible,

    #[error("master LP solver failure: {0}")]
    Solver(String),
}

/// Optimal master iterate.
#[derive(Debug, Clone)]
pub struct MasterSolution {
    /// Valid lower bound `L_k` on the planning optimum
    pub lower_bound: f64,
    /// Minimizing capacity vector (flat slot layout)
    pub x: Vec<f64>,
    /// Epigraph values per scenario
    pub tau: Vec<f64>,
}

/// Solve the master LP over the accumulated cutting-plane models.
///
/// Cuts are added in insertion order per scenario, which fixes the
/// tie-breaking among equally good vertices for a deterministic iterate.
pub fn solve_master(
    costs: &[f64],
    upper: &[f64],
    emissions_slots: Range<usize>,
    emissions_total: f64,
    models: &[CuttingPlaneModel],
) -> Result<MasterSolution, MasterError> {
    let n = costs.len();
    let mut vars = variables!();

    let x_vars: Vec<Variable> = (0..n)
        .map(|c| {
            let def = variable().min(0.0);
            if upper[c].is_finite() {
                vars.add(def.max(upper[c]))
            } else {
                vars.add(def)
            }
        })
        .collect();
    let tau_vars: Vec<Variable> = models
        .iter()
        .map(|_| vars.add(variable().min(TAU_FLOOR)))
        .collect();

    let mut objective = Expression::from(0.0);
    for c in 0..n {
        if costs[c] != 0.0 {
            objective += costs[c] * x_vars[c];
        }
    }
    for tau in &tau_vars {
        objective += *tau;
    }

    let mut lp = vars.minimise(objective).using(clarabel);

    if emissions_total.is_finite() {
        let mut allocation = Expression::from(0.0);
        for slot in emissions_slots {
            allocation += x_vars[slot];
        }
        lp = lp.with(constraint!(allocation <= emissions_total));
    }

    for (omega, model) in models.iter().enumerate() {
        for cut in &model.cuts {
            match cut {
                Cut::Optimality {
                    value,
                    gradient,
                    reference,
                } => {
                    // τ_ω ≥ value + gᵀ(x − x_ref)
                    let mut lhs = Expression::from(tau_vars[omega]);
                    let mut constant = *value;
                    for (c, g) in gradient.iter().enumerate() {
                        if *g != 0.0 {
                            lhs -= *g * x_vars[c];
                            constant -= g * reference[c];
                        }
                    }
                    lp = lp.with(constraint!(lhs >= constant));
                }
                Cut::Feasibility { gradient, rhs } => {
                    let mut lhs = Expression::from(0.0);
                    for (c, g) in gradient.iter().enumerate() {
                        if *g != 0.0 {
                            lhs += *g * x_vars[c];
                        }
                    }
                    lp = lp.with(constraint!(lhs >= *rhs));
                }
            }
        }
    }

    match lp.solve() {
        Ok(solution) => {
            let x: Vec<f64> = x_vars
                .iter()
                .map(|v| solution.value(*v).max(0.0))
                .collect();
            let tau: Vec<f64> = tau_vars.iter().map(|v| solution.value(*v)).collect();
            let lower_bound = costs.iter().zip(&x).map(|(c, xi)| c * xi).sum::<f64>()
                + tau.iter().sum::<f64>();
            Ok(MasterSolution {
                lower_bound,
                x,
                tau,
            })
        }
        Err(ResolutionError::Infeasible) => Err(MasterError::Infeasible),
        Err(other) => Err(MasterError::Solver(format!("{:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_cut_model(value: f64, gradient: Vec<f64>, reference: Vec<f64>) -> CuttingPlaneModel {
        let mut model = CuttingPlaneModel::new();
        model.push(Cut::Optimality {
            value,
            gradient,
            reference,
        });
        model
    }

    #[test]
    fn test_tradeoff_between_investment_and_operation() {
        // h(x) ≥ 5 − x (one cut), investment cost 0.5·x on x ∈ [0, 10]:
        // total 0.5x + 5 − x decreases until the second cut τ ≥ 0 binds at
        // x = 5, giving the optimum 2.5.
        let mut model = single_cut_model(5.0, vec![-1.0], vec![0.0]);
        model.push(Cut::Optimality {
            value: 0.0,
            gradient: vec![0.0],
            reference: vec![5.0],
        });

        let solution = solve_master(&[0.5], &[10.0], 1..1, f64::INFINITY, &[model]).unwrap();
        assert!((solution.lower_bound - 2.5).abs() < 1e-4);
        assert!((solution.x[0] - 5.0).abs() < 1e-3);
    }

    #[test]
    fn test_feasibility_cut_forces_expansion() {
        let mut model = single_cut_model(1.0, vec![0.0], vec![0.0]);
        model.push(Cut::Feasibility {
            gradient: vec![1.0],
            rhs: 3.0,
        });

        let solution = solve_master(&[2.0], &[10.0], 1..1, f64::INFINITY, &[model]).unwrap();
        assert!(solution.x[0] >= 3.0 - 1e-4);
        assert!((solution.lower_bound - (2.0 * 3.0 + 1.0)).abs() < 1e-3);
    }

    #[test]
    fn test_infeasible_when_cut_exceeds_bounds() {
        let mut model = single_cut_model(0.0, vec![0.0], vec![0.0]);
        model.push(Cut::Feasibility {
            gradient: vec![1.0],
            rhs: 20.0, // demands x ≥ 20 but the bound is 10
        });

        assert!(matches!(
            solve_master(&[1.0], &[10.0], 1..1, f64::INFINITY, &[model]),
            Err(MasterError::Infeasible)
        ));
    }

    #[test]
    fn test_emissions_allocation_capped() {
        // Two emission slots, each individually allowed 10, jointly 12.
        // Cuts reward allocation at $2/ton in both scenarios; prices are
        // $1/ton, so the master saturates the joint cap.
        let model_a = single_cut_model(100.0, vec![-2.0, 0.0], vec![0.0, 0.0]);
        let model_b = single_cut_model(100.0, vec![0.0, -2.0], vec![0.0, 0.0]);

        let solution = solve_master(
            &[1.0, 1.0],
            &[10.0, 10.0],
            0..2,
            12.0,
            &[model_a, model_b],
        )
        .unwrap();
        let total: f64 = solution.x.iter().sum();
        assert!((total - 12.0).abs() < 1e-3);
    }

    #[test]
    fn test_lower_bound_grows_with_cuts() {
        let weak = single_cut_model(1.0, vec![0.0], vec![0.0]);
        let first = solve_master(&[0.0], &[1.0], 1..1, f64::INFINITY, &[weak.clone()]).unwrap();

        let mut stronger = weak;
        stronger.push(Cut::Optimality {
            value: 4.0,
            gradient: vec![0.0],
            reference: vec![0.0],
        });
        let second = solve_master(&[0.0], &[1.0], 1..1, f64::INFINITY, &[stronger]).unwrap();
        assert!(second.lower_bound >= first.lower_bound);
        assert!((second.lower_bound - 4.0).abs() < 1e-5);
    }
}
