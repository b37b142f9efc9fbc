//! Planning solver facade.
//!
//! Sequences the full solve: compile and validate, build the cycle basis,
//! run the bundle method at nominal impedances, correct the transmission
//! capacities through the impedance-feedback fixed point, then re-run the
//! bundle as a polishing pass with the contingency sets carried over and
//! the cutting planes cleared (they were valid only under the old LODF
//! matrix). Progress events are pushed from the coordinator thread;
//! cancellation and the wall-clock budget are honored at iteration
//! boundaries, always returning the best incumbent found.

use crate::bundle::{BundleEngine, BundleError, IterationRecord, StopReason};
use crate::correction::{correct_transmission, CorrectionRecord};
use crate::cycles::CycleBasis;
use crate::network::{ModelError, NetworkModel};
use crate::problem::{CapacityDecision, ContingencyKey, PlanningProblem, SolverConfig};
use crate::sensitivity::{PowerTransferKernel, SensitivityError};
use crate::validation::validate_problem;
use cep_core::{CepError, CepResult};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Cooperative cancellation flag, checked at bundle iteration boundaries
/// and between scenario dispatches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Terminal status of a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    Optimal,
    Timeout,
    Cancelled,
    Infeasible,
    NonConverged,
}

/// Which loop is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SolvePhase {
    Bundle,
    Corrector,
    Polish,
}

/// Progress callback payload. During the corrector phase the bounds carry
/// over from the preceding bundle phase and `gap` holds the iteration's
/// maximum relative capacity change.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub phase: SolvePhase,
    pub iteration: usize,
    pub upper_bound: f64,
    pub lower_bound: f64,
    pub gap: f64,
    pub elapsed_seconds: f64,
}

/// Per-iteration history for offline analysis.
#[derive(Debug, Default, Serialize)]
pub struct SolveDiagnostics {
    pub bundle: Vec<IterationRecord>,
    pub corrector: Vec<CorrectionRecord>,
    pub polish: Vec<IterationRecord>,
}

/// Final solve result.
#[derive(Debug, Serialize)]
pub struct PlanResult {
    /// Annualized investment plus expected operating cost ($/yr)
    pub total_cost: f64,
    /// Final objective upper bound ($/yr)
    pub objective_value: f64,
    /// Relative optimality gap at termination
    pub gap: f64,
    /// Bundle iterations across both bundle phases
    pub iterations: usize,
    pub elapsed_seconds: f64,
    pub status: SolveStatus,
    pub capacity_decision: CapacityDecision,
    pub diagnostics: Option<SolveDiagnostics>,
}

impl PlanResult {
    /// Human-readable report.
    pub fn summary(&self) -> String {
        let x = &self.capacity_decision;
        format!(
            "status: {:?}\n\
             total cost: ${:.3}M/yr (gap {:.2}%)\n\
             iterations: {} in {:.1}s\n\
             new generation: {:.2} GW\n\
             new storage: {:.2} GW / {:.2} GWh\n\
             new transmission: {:.2} GW\n\
             emissions allocation: {:.0} t",
            self.status,
            self.total_cost / 1.0e6,
            self.gap * 100.0,
            self.iterations,
            self.elapsed_seconds,
            x.total_generation_gw(),
            x.total_storage_power_gw(),
            x.total_storage_energy_gwh(),
            x.total_transmission_gw(),
            x.total_emissions(),
        )
    }
}

/// Entry point for a capacity expansion solve.
pub struct PlanningSolver {
    config: SolverConfig,
}

impl PlanningSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    /// Solve without progress reporting or cancellation.
    pub fn solve(&self, problem: &PlanningProblem) -> CepResult<PlanResult> {
        self.solve_with(problem, &mut |_| {}, &CancelToken::new())
    }

    /// Solve with a progress sink and a cancellation token. The sink is
    /// invoked from the coordinator thread and must be lightweight; it is
    /// not retried on failure.
    pub fn solve_with(
        &self,
        problem: &PlanningProblem,
        progress: &mut dyn FnMut(&ProgressEvent),
        cancel: &CancelToken,
    ) -> CepResult<PlanResult> {
        let start = Instant::now();
        let deadline = self
            .config
            .wall_clock_seconds
            .map(|seconds| start + Duration::from_secs_f64(seconds));

        let model = NetworkModel::compile(&problem.network).map_err(map_model_error)?;
        validate_problem(problem, &model)?;
        let basis =
            CycleBasis::build(&model).map_err(|e| CepError::Network(e.to_string()))?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .map_err(|e| CepError::Config(e.to_string()))?;
        let engine = BundleEngine::new(&model, &basis, problem, &self.config, &pool);

        let n_scen = problem.scenarios.len();
        let dims = model.dims(n_scen);
        let mut contingencies: Vec<BTreeSet<ContingencyKey>> = vec![BTreeSet::new(); n_scen];
        let mut diagnostics = SolveDiagnostics::default();
        let keep_history = self.config.keep_history;

        let finalize = |status: SolveStatus,
                        objective: f64,
                        gap: f64,
                        iterations: usize,
                        x: CapacityDecision,
                        diagnostics: SolveDiagnostics| {
            let result = PlanResult {
                total_cost: objective,
                objective_value: objective,
                gap,
                iterations,
                elapsed_seconds: start.elapsed().as_secs_f64(),
                status,
                capacity_decision: x,
                diagnostics: keep_history.then_some(diagnostics),
            };
            info!(status = ?result.status, cost = result.total_cost, "solve finished");
            Ok(result)
        };

        // Phase 1: bundle at nominal impedances (x̂_br = 0 additions)
        let x_hat = vec![0.0; model.n_branches()];
        let (_, lodf) = PowerTransferKernel::compute(&model, &x_hat).map_err(map_sensitivity)?;
        let chi = model.effective_impedance(&x_hat);
        let outcome = engine
            .run(
                CapacityDecision::zeros(dims),
                &lodf,
                &chi,
                &mut contingencies,
                start,
                deadline,
                cancel,
                |record| {
                    progress(&ProgressEvent {
                        phase: SolvePhase::Bundle,
                        iteration: record.iteration,
                        upper_bound: record.upper_bound,
                        lower_bound: record.lower_bound,
                        gap: record.gap,
                        elapsed_seconds: record.elapsed_seconds,
                    });
                    if keep_history {
                        diagnostics.bundle.push(record.clone());
                    }
                },
            )
            .map_err(map_bundle_error)?;

        let mut iterations = outcome.iterations;
        match outcome.stop {
            StopReason::Cancelled | StopReason::Timeout => {
                let status = if outcome.stop == StopReason::Cancelled {
                    SolveStatus::Cancelled
                } else {
                    SolveStatus::Timeout
                };
                let (objective, x) = match outcome.incumbent {
                    Some(incumbent) => (incumbent.objective, incumbent.x),
                    None => (f64::INFINITY, CapacityDecision::zeros(dims)),
                };
                return finalize(status, objective, outcome.gap, iterations, x, diagnostics);
            }
            StopReason::Infeasible => {
                return finalize(
                    SolveStatus::Infeasible,
                    f64::INFINITY,
                    outcome.gap,
                    iterations,
                    CapacityDecision::zeros(dims),
                    diagnostics,
                );
            }
            StopReason::Converged | StopReason::IterationCap => {}
        }
        let Some(mut incumbent) = outcome.incumbent else {
            // Iteration cap exhausted without one feasible iterate
            return finalize(
                SolveStatus::NonConverged,
                f64::INFINITY,
                outcome.gap,
                iterations,
                CapacityDecision::zeros(dims),
                diagnostics,
            );
        };

        // Phase 2: transmission correction at the incumbent dispatch
        let injections: Vec<Vec<Vec<f64>>> = incumbent
            .solutions
            .iter()
            .map(|sol| sol.nodal_injection.clone())
            .collect();
        let correction = correct_transmission(
            &model,
            problem,
            &injections,
            &incumbent.x.branch,
            &self.config,
        )
        .map_err(map_sensitivity)?;
        for record in &correction.history {
            progress(&ProgressEvent {
                phase: SolvePhase::Corrector,
                iteration: record.iteration,
                upper_bound: outcome.upper_bound,
                lower_bound: outcome.lower_bound,
                gap: record.relative_change,
                elapsed_seconds: start.elapsed().as_secs_f64(),
            });
        }
        if keep_history {
            diagnostics.corrector = correction.history.clone();
        }
        let corrector_converged = correction.converged;
        incumbent.x.branch = correction.x_br.clone();

        // Phase 3: polishing bundle pass under the corrected impedances.
        // Contingency sets carry over; cutting planes start fresh.
        let (_, lodf) =
            PowerTransferKernel::compute(&model, &correction.x_br).map_err(map_sensitivity)?;
        let chi = model.effective_impedance(&correction.x_br);
        let polish = engine
            .run(
                incumbent.x.clone(),
                &lodf,
                &chi,
                &mut contingencies,
                start,
                deadline,
                cancel,
                |record| {
                    progress(&ProgressEvent {
                        phase: SolvePhase::Polish,
                        iteration: record.iteration,
                        upper_bound: record.upper_bound,
                        lower_bound: record.lower_bound,
                        gap: record.gap,
                        elapsed_seconds: record.elapsed_seconds,
                    });
                    if keep_history {
                        diagnostics.polish.push(record.clone());
                    }
                },
            )
            .map_err(map_bundle_error)?;
        iterations += polish.iterations;

        let status = match polish.stop {
            StopReason::Cancelled => SolveStatus::Cancelled,
            StopReason::Timeout => SolveStatus::Timeout,
            StopReason::Infeasible => SolveStatus::Infeasible,
            StopReason::IterationCap => SolveStatus::NonConverged,
            StopReason::Converged => {
                if corrector_converged {
                    SolveStatus::Optimal
                } else {
                    SolveStatus::NonConverged
                }
            }
        };
        let (objective, x) = match polish.incumbent {
            Some(best) => (best.objective, best.x),
            None => (incumbent.objective, incumbent.x),
        };
        finalize(status, objective, polish.gap, iterations, x, diagnostics)
    }
}

fn map_model_error(error: ModelError) -> CepError {
    match error {
        ModelError::Disconnected { .. } => CepError::Singular(error.to_string()),
        other => CepError::InvalidInput(other.to_string()),
    }
}

fn map_sensitivity(error: SensitivityError) -> CepError {
    match error {
        SensitivityError::Singular => CepError::Singular(error.to_string()),
        other => CepError::Network(other.to_string()),
    }
}

fn map_bundle_error(error: BundleError) -> CepError {
    CepError::Solver(error.to_string())
}
