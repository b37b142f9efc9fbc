//! Level-bundle method with interleaved contingency generation.
//!
//! The outer planning objective is `F(x) = cᵀx + Σ_ω weight_ω·h_ω(x)` over
//! the capacity polyhedron X, where each scenario cost h_ω is convex,
//! piecewise linear, and known only through the operational LP oracle. Per
//! iteration:
//!
//! 1. solve every scenario subproblem at the current iterate (worker pool);
//! 2. screen each dispatch for post-outage overloads; scenarios with new
//!    contingencies are re-solved once against the grown set, so their
//!    cuts and cost values reflect the raised operational floor;
//! 3. append one cut per scenario, update the upper bound and incumbent;
//! 4. solve the master LP over all cuts for the lower bound;
//! 5. stop on the relative-gap target, else step to the analytic center of
//!    the level set.
//!
//! Contingency sets only grow; cutting-plane models live for one call of
//! [`BundleEngine::run`] (the facade clears them between phases, because
//! cuts collected under one LODF matrix are invalid under another).

pub mod center;
pub mod master;

use crate::cycles::CycleBasis;
use crate::network::NetworkModel;
use crate::problem::{CapacityDecision, ContingencyKey, PlanningProblem, SolverConfig};
use crate::screening::ContingencyScreener;
use crate::sensitivity::LodfMatrix;
use crate::solve::CancelToken;
use crate::subproblem::{
    OperationalSubproblem, SubproblemError, SubproblemOutcome, SubproblemSolution,
};
use master::{solve_master, MasterError};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

/// One supporting plane of a scenario cost function.
#[derive(Debug, Clone)]
pub enum Cut {
    /// `τ_ω ≥ value + gradientᵀ(x − reference)`; value and gradient are
    /// scenario-weight scaled.
    Optimality {
        value: f64,
        gradient: Vec<f64>,
        reference: Vec<f64>,
    },
    /// Farkas cut `gradientᵀx ≥ rhs` excluding operationally infeasible
    /// capacity decisions.
    Feasibility { gradient: Vec<f64>, rhs: f64 },
}

/// Insertion-ordered cut sequence for one scenario.
#[derive(Debug, Clone, Default)]
pub struct CuttingPlaneModel {
    pub cuts: Vec<Cut>,
}

impl CuttingPlaneModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cut: Cut) {
        self.cuts.push(cut);
    }

    pub fn len(&self) -> usize {
        self.cuts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cuts.is_empty()
    }
}

/// Errors from the bundle engine
#[derive(Debug, Error)]
pub enum BundleError {
    #[error(transparent)]
    Subproblem(#[from] SubproblemError),

    #[error(transparent)]
    Master(MasterError),
}

/// Why a bundle run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Converged,
    IterationCap,
    Timeout,
    Cancelled,
    /// The master LP is infeasible: no capacity decision in X admits a
    /// feasible dispatch in every scenario.
    Infeasible,
}

/// Per-iteration history entry.
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub upper_bound: f64,
    pub lower_bound: f64,
    pub gap: f64,
    pub elapsed_seconds: f64,
}

/// Best solution found so far: the capacity decision, its objective, and
/// the scenario dispatches realizing it.
#[derive(Debug, Clone)]
pub struct Incumbent {
    pub x: CapacityDecision,
    pub objective: f64,
    pub solutions: Vec<SubproblemSolution>,
}

/// Result of one bundle run.
#[derive(Debug)]
pub struct BundleOutcome {
    pub stop: StopReason,
    pub iterations: usize,
    pub upper_bound: f64,
    pub lower_bound: f64,
    pub gap: f64,
    pub incumbent: Option<Incumbent>,
    pub history: Vec<IterationRecord>,
}

/// Coordinates cuts, bounds, and iterates for one sensitivity snapshot.
pub struct BundleEngine<'a> {
    model: &'a NetworkModel,
    basis: &'a CycleBasis,
    problem: &'a PlanningProblem,
    config: &'a SolverConfig,
    pool: &'a rayon::ThreadPool,
    costs: Vec<f64>,
    upper_bounds: Vec<f64>,
    emissions_capped: bool,
}

impl<'a> BundleEngine<'a> {
    pub fn new(
        model: &'a NetworkModel,
        basis: &'a CycleBasis,
        problem: &'a PlanningProblem,
        config: &'a SolverConfig,
        pool: &'a rayon::ThreadPool,
    ) -> Self {
        let n_scen = problem.scenarios.len();
        let costs = model
            .investment_costs(problem.emissions_price, n_scen)
            .to_flat();
        let mut upper_bounds = model
            .capacity_limits(
                problem.emissions_cap,
                problem.emissions_cap_per_scenario.as_deref(),
                n_scen,
            )
            .to_flat();
        if !problem.emissions_cap.is_finite() {
            // No emissions policy: the allocation block is inert (the
            // subproblems see an unbounded allocation), so pin the master
            // variables instead of leaving an unconstrained direction.
            let dims = model.dims(n_scen);
            for omega in 0..n_scen {
                upper_bounds[dims.emissions_slot(omega)] = 0.0;
            }
        }
        Self {
            model,
            basis,
            problem,
            config,
            pool,
            costs,
            upper_bounds,
            emissions_capped: problem.emissions_cap.is_finite(),
        }
    }

    /// Run the bundle loop from `x0` against fixed sensitivity matrices.
    ///
    /// `contingencies` is the per-scenario contingency set; it grows
    /// monotonically and survives across phases. `on_iteration` fires once
    /// per iteration from the coordinator thread.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        x0: CapacityDecision,
        lodf: &LodfMatrix,
        chi_hat: &[f64],
        contingencies: &mut [BTreeSet<ContingencyKey>],
        start: Instant,
        deadline: Option<Instant>,
        cancel: &CancelToken,
        mut on_iteration: impl FnMut(&IterationRecord),
    ) -> Result<BundleOutcome, BundleError> {
        let n_scen = self.problem.scenarios.len();
        let dims = self.model.dims(n_scen);
        let emissions_slots = dims.emissions_slot(0)..dims.total();
        let screener = ContingencyScreener::new(
            self.model,
            lodf,
            self.problem.contingency_rating,
            self.config.oracle_budget,
        );

        let mut cut_models = vec![CuttingPlaneModel::new(); n_scen];
        let mut upper = f64::INFINITY;
        let mut lower = f64::NEG_INFINITY;
        let mut incumbent: Option<Incumbent> = None;
        let mut history = Vec::new();
        let mut x_k = x0;

        let finish = |stop: StopReason,
                      iterations: usize,
                      upper: f64,
                      lower: f64,
                      incumbent: Option<Incumbent>,
                      history: Vec<IterationRecord>| BundleOutcome {
            stop,
            iterations,
            upper_bound: upper,
            lower_bound: lower,
            gap: relative_gap(upper, lower),
            incumbent,
            history,
        };

        for k in 1..=self.config.max_bundle_iters {
            if cancel.is_cancelled() {
                return Ok(finish(StopReason::Cancelled, k - 1, upper, lower, incumbent, history));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(finish(StopReason::Timeout, k - 1, upper, lower, incumbent, history));
            }

            // Without an emissions policy the allocation block is inert:
            // the subproblems see an unbounded allocation and contribute
            // no emissions rows.
            if !self.emissions_capped {
                x_k.emissions = vec![f64::INFINITY; n_scen];
            }

            // Scenario fan-out (workers return by value; the cut and
            // contingency bookkeeping below stays on this thread)
            let mut outcomes = self.solve_all(&x_k, contingencies, lodf, chi_hat, cancel)?;
            if cancel.is_cancelled() {
                return Ok(finish(StopReason::Cancelled, k - 1, upper, lower, incumbent, history));
            }

            // Interleaved contingency generation: extend each scenario's
            // set from its own dispatch, then re-solve flagged scenarios
            // once so their cuts account for the new rows.
            let mut flagged = Vec::new();
            for omega in 0..n_scen {
                if let Some(SubproblemOutcome::Optimal(sol)) = &outcomes[omega] {
                    let violations = screener.screen(&sol.branch_flow, &x_k.branch);
                    let mut added = 0;
                    for violation in violations {
                        if contingencies[omega].insert(violation.key) {
                            added += 1;
                        }
                    }
                    if added > 0 {
                        debug!(iteration = k, scenario = omega, added, "new contingencies");
                        flagged.push(omega);
                    }
                }
            }
            if !flagged.is_empty() {
                let refreshed = self.solve_some(&x_k, contingencies, lodf, chi_hat, &flagged)?;
                for (omega, outcome) in flagged.into_iter().zip(refreshed) {
                    outcomes[omega] = Some(outcome);
                }
            }

            // Cuts and the upper bound
            let reference = sanitized_flat(&x_k);
            let mut operating = 0.0;
            let mut all_feasible = true;
            let mut solutions = Vec::with_capacity(n_scen);
            for (omega, outcome) in outcomes.into_iter().enumerate() {
                let weight = self.problem.scenarios[omega].weight;
                match outcome.expect("no scenario skipped past the cancel check") {
                    SubproblemOutcome::Optimal(sol) => {
                        cut_models[omega].push(Cut::Optimality {
                            value: weight * sol.objective,
                            gradient: sol.subgradient.iter().map(|g| weight * g).collect(),
                            reference: reference.clone(),
                        });
                        operating += weight * sol.objective;
                        solutions.push(sol);
                    }
                    SubproblemOutcome::Infeasible(cut) => {
                        cut_models[omega].push(Cut::Feasibility {
                            gradient: cut.gradient,
                            rhs: cut.rhs,
                        });
                        all_feasible = false;
                    }
                }
            }

            if all_feasible {
                let investment: f64 = self
                    .costs
                    .iter()
                    .zip(&reference)
                    .map(|(c, xi)| c * xi)
                    .sum();
                let f_k = investment + operating;
                if f_k < upper {
                    upper = f_k;
                    let mut x_inc = x_k.clone();
                    if !self.emissions_capped {
                        // Report the realized emissions as the allocation
                        for (omega, sol) in solutions.iter().enumerate() {
                            x_inc.emissions[omega] = sol.emissions;
                        }
                    }
                    incumbent = Some(Incumbent {
                        x: x_inc,
                        objective: f_k,
                        solutions,
                    });
                }
            }

            // Master LP: lower bound
            let master = match solve_master(
                &self.costs,
                &self.upper_bounds,
                emissions_slots.clone(),
                self.problem.emissions_cap,
                &cut_models,
            ) {
                Ok(master) => master,
                Err(MasterError::Infeasible) => {
                    return Ok(finish(StopReason::Infeasible, k, upper, lower, incumbent, history));
                }
                Err(other) => return Err(BundleError::Master(other)),
            };
            lower = lower.max(master.lower_bound);

            let gap = relative_gap(upper, lower);
            let record = IterationRecord {
                iteration: k,
                upper_bound: upper,
                lower_bound: lower,
                gap,
                elapsed_seconds: start.elapsed().as_secs_f64(),
            };
            debug!(
                iteration = k,
                upper, lower, gap, "bundle iteration complete"
            );
            on_iteration(&record);
            history.push(record);

            if gap < self.config.epsilon {
                return Ok(finish(StopReason::Converged, k, upper, lower, incumbent, history));
            }

            // Next iterate: analytic center of the level set (the master
            // optimum when no finite upper bound exists yet)
            let next_flat = if upper.is_finite() {
                let level = lower + self.config.level_alpha * (upper - lower);
                center::analytic_center(
                    &self.costs,
                    &self.upper_bounds,
                    emissions_slots.clone(),
                    self.problem.emissions_cap,
                    &cut_models,
                    level,
                    &master,
                )
            } else {
                master.x.clone()
            };
            x_k = CapacityDecision::from_flat(dims, &next_flat);
        }

        let iterations = self.config.max_bundle_iters;
        Ok(finish(StopReason::IterationCap, iterations, upper, lower, incumbent, history))
    }

    fn solve_all(
        &self,
        x: &CapacityDecision,
        contingencies: &[BTreeSet<ContingencyKey>],
        lodf: &LodfMatrix,
        chi_hat: &[f64],
        cancel: &CancelToken,
    ) -> Result<Vec<Option<SubproblemOutcome>>, SubproblemError> {
        use rayon::prelude::*;
        self.pool.install(|| {
            self.problem
                .scenarios
                .par_iter()
                .enumerate()
                .map(|(omega, scenario)| {
                    if cancel.is_cancelled() {
                        return Ok(None);
                    }
                    let keys: Vec<ContingencyKey> =
                        contingencies[omega].iter().copied().collect();
                    let subproblem = OperationalSubproblem::new(
                        self.model,
                        self.basis,
                        scenario,
                        omega,
                        lodf,
                        chi_hat,
                        self.problem.reserve_margin,
                        self.problem.contingency_rating,
                    );
                    subproblem.solve(x, &keys).map(Some)
                })
                .collect()
        })
    }

    fn solve_some(
        &self,
        x: &CapacityDecision,
        contingencies: &[BTreeSet<ContingencyKey>],
        lodf: &LodfMatrix,
        chi_hat: &[f64],
        scenarios: &[usize],
    ) -> Result<Vec<SubproblemOutcome>, SubproblemError> {
        use rayon::prelude::*;
        self.pool.install(|| {
            scenarios
                .par_iter()
                .map(|&omega| {
                    let keys: Vec<ContingencyKey> =
                        contingencies[omega].iter().copied().collect();
                    let subproblem = OperationalSubproblem::new(
                        self.model,
                        self.basis,
                        &self.problem.scenarios[omega],
                        omega,
                        lodf,
                        chi_hat,
                        self.problem.reserve_margin,
                        self.problem.contingency_rating,
                    );
                    subproblem.solve(x, &keys)
                })
                .collect()
        })
    }
}

fn relative_gap(upper: f64, lower: f64) -> f64 {
    if !upper.is_finite() || !lower.is_finite() {
        f64::INFINITY
    } else {
        (upper - lower) / upper.abs().max(1.0)
    }
}

/// Flatten a capacity decision, replacing the sentinel infinite emissions
/// allocation (no emissions policy) with zero so cut references and cost
/// dot products stay finite.
fn sanitized_flat(x: &CapacityDecision) -> Vec<f64> {
    x.to_flat()
        .into_iter()
        .map(|v| if v.is_finite() { v } else { 0.0 })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_gap() {
        assert!((relative_gap(110.0, 100.0) - 10.0 / 110.0).abs() < 1e-12);
        // Small magnitudes normalize against 1
        assert!((relative_gap(0.5, 0.2) - 0.3).abs() < 1e-12);
        assert_eq!(relative_gap(f64::INFINITY, 0.0), f64::INFINITY);
    }

    #[test]
    fn test_sanitized_flat_strips_sentinel() {
        let x = CapacityDecision {
            gen: vec![1.0],
            storage_power: vec![],
            storage_energy: vec![],
            branch: vec![2.0],
            emissions: vec![f64::INFINITY],
        };
        assert_eq!(sanitized_flat(&x), vec![1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_cutting_plane_model_orders_cuts() {
        let mut model = CuttingPlaneModel::new();
        assert!(model.is_empty());
        model.push(Cut::Optimality {
            value: 1.0,
            gradient: vec![0.0],
            reference: vec![0.0],
        });
        model.push(Cut::Feasibility {
            gradient: vec![1.0],
            rhs: 2.0,
        });
        assert_eq!(model.len(), 2);
        assert!(matches!(model.cuts[0], Cut::Optimality { .. }));
        assert!(matches!(model.cuts[1], Cut::Feasibility { .. }));
    }
}
