//! Planning problem data structures.
//!
//! Defines the input data for a capacity expansion solve: the operational
//! scenarios, the capacity decision vector and its feasibility polyhedron,
//! investment costs, and the solver configuration.

use cep_core::Network;
use serde::{Deserialize, Serialize};

/// One operational scenario ξ_ω: an hourly (or otherwise discretized)
/// realization of demand, availability, and fuel cost over a horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioData {
    /// Human-readable name for diagnostics
    pub name: String,
    /// Probability weight; the outer objective is the weighted sum of
    /// scenario operating costs
    pub weight: f64,
    /// Horizon length T (periods)
    pub horizon: usize,
    /// Per-period per-generator operating cost `c_g[t][g]` ($/MWh)
    pub cost: Vec<Vec<f64>>,
    /// Per-period per-generator availability fraction `a_g[t][g]` in [0, 1]
    pub availability: Vec<Vec<f64>>,
    /// Per-period per-load demand `p_d[t][d]` (MW)
    pub demand: Vec<Vec<f64>>,
    /// Load-shedding penalty ($/MWh)
    pub shed_penalty: f64,
    /// Contingency-violation penalty ($/MWh)
    pub violation_penalty: f64,
}

impl ScenarioData {
    /// Total system demand in period t.
    pub fn total_demand(&self, t: usize) -> f64 {
        self.demand[t].iter().sum()
    }
}

/// A contingency index (t, i, j): in period `t`, the post-outage flow on
/// monitored branch `i` when branch `j` trips.
///
/// Lexicographic `Ord` on (t, monitored, outaged) is load-bearing: it is
/// the deterministic tie-break order of the screening oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContingencyKey {
    pub t: usize,
    pub monitored: usize,
    pub outaged: usize,
}

/// Dimensions of the capacity decision vector and the flat slot layout
/// `[gen | storage power | storage energy | branch | emissions]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityDims {
    pub gens: usize,
    pub storages: usize,
    pub branches: usize,
    pub scenarios: usize,
}

impl CapacityDims {
    pub fn total(&self) -> usize {
        self.gens + 2 * self.storages + self.branches + self.scenarios
    }

    pub fn gen_slot(&self, g: usize) -> usize {
        g
    }

    pub fn storage_power_slot(&self, s: usize) -> usize {
        self.gens + s
    }

    pub fn storage_energy_slot(&self, s: usize) -> usize {
        self.gens + self.storages + s
    }

    pub fn branch_slot(&self, j: usize) -> usize {
        self.gens + 2 * self.storages + j
    }

    pub fn emissions_slot(&self, omega: usize) -> usize {
        self.gens + 2 * self.storages + self.branches + omega
    }
}

/// Capacity expansion decision: non-negative additions on top of existing
/// assets, plus the per-scenario emissions allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityDecision {
    /// New generation capacity per generator (MW)
    pub gen: Vec<f64>,
    /// New storage power capacity per device (MW)
    pub storage_power: Vec<f64>,
    /// New storage energy capacity per device (MWh)
    pub storage_energy: Vec<f64>,
    /// Transmission capacity additions per AC branch (MW)
    pub branch: Vec<f64>,
    /// Emissions allocation per scenario (tons)
    pub emissions: Vec<f64>,
}

impl CapacityDecision {
    pub fn zeros(dims: CapacityDims) -> Self {
        Self {
            gen: vec![0.0; dims.gens],
            storage_power: vec![0.0; dims.storages],
            storage_energy: vec![0.0; dims.storages],
            branch: vec![0.0; dims.branches],
            emissions: vec![0.0; dims.scenarios],
        }
    }

    pub fn dims(&self) -> CapacityDims {
        CapacityDims {
            gens: self.gen.len(),
            storages: self.storage_power.len(),
            branches: self.branch.len(),
            scenarios: self.emissions.len(),
        }
    }

    /// Flatten into the slot layout used by the master model and the
    /// subgradient vector.
    pub fn to_flat(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.dims().total());
        flat.extend_from_slice(&self.gen);
        flat.extend_from_slice(&self.storage_power);
        flat.extend_from_slice(&self.storage_energy);
        flat.extend_from_slice(&self.branch);
        flat.extend_from_slice(&self.emissions);
        flat
    }

    pub fn from_flat(dims: CapacityDims, flat: &[f64]) -> Self {
        debug_assert_eq!(flat.len(), dims.total());
        let mut cursor = 0;
        let mut take = |len: usize| {
            let block = flat[cursor..cursor + len].to_vec();
            cursor += len;
            block
        };
        Self {
            gen: take(dims.gens),
            storage_power: take(dims.storages),
            storage_energy: take(dims.storages),
            branch: take(dims.branches),
            emissions: take(dims.scenarios),
        }
    }

    /// Total new generation capacity in GW
    pub fn total_generation_gw(&self) -> f64 {
        self.gen.iter().sum::<f64>() / 1000.0
    }

    /// Total new storage power capacity in GW
    pub fn total_storage_power_gw(&self) -> f64 {
        self.storage_power.iter().sum::<f64>() / 1000.0
    }

    /// Total new storage energy capacity in GWh
    pub fn total_storage_energy_gwh(&self) -> f64 {
        self.storage_energy.iter().sum::<f64>() / 1000.0
    }

    /// Total transmission capacity additions in GW
    pub fn total_transmission_gw(&self) -> f64 {
        self.branch.iter().sum::<f64>() / 1000.0
    }

    /// Total emissions allocation across scenarios (tons)
    pub fn total_emissions(&self) -> f64 {
        self.emissions.iter().sum()
    }
}

/// Upper bounds defining the capacity feasibility polyhedron X:
/// componentwise bounds plus the total emissions cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityLimits {
    pub gen: Vec<f64>,
    pub storage_power: Vec<f64>,
    pub storage_energy: Vec<f64>,
    pub branch: Vec<f64>,
    /// Per-scenario emissions allocation bound (tons)
    pub emissions: Vec<f64>,
    /// Cap on the total emissions allocation Σ_ω x_em[ω] (tons)
    pub emissions_total: f64,
}

impl CapacityLimits {
    pub fn to_flat(&self) -> Vec<f64> {
        let mut flat = Vec::new();
        flat.extend_from_slice(&self.gen);
        flat.extend_from_slice(&self.storage_power);
        flat.extend_from_slice(&self.storage_energy);
        flat.extend_from_slice(&self.branch);
        flat.extend_from_slice(&self.emissions);
        flat
    }

    /// Componentwise bounds plus the total-emissions cap, with a small
    /// numerical slack.
    pub fn is_feasible(&self, x: &CapacityDecision) -> bool {
        const TOL: f64 = 1e-6;
        let within = |values: &[f64], bounds: &[f64]| {
            values
                .iter()
                .zip(bounds)
                .all(|(v, ub)| *v >= -TOL && *v <= ub + TOL)
        };
        within(&x.gen, &self.gen)
            && within(&x.storage_power, &self.storage_power)
            && within(&x.storage_energy, &self.storage_energy)
            && within(&x.branch, &self.branch)
            && within(&x.emissions, &self.emissions)
            && x.total_emissions() <= self.emissions_total + TOL
    }
}

/// Annualized investment cost coefficients `c` in `cᵀx`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestmentCosts {
    /// Generation capex ($/MW/yr)
    pub gen: Vec<f64>,
    /// Storage power capex ($/MW/yr)
    pub storage_power: Vec<f64>,
    /// Storage energy capex ($/MWh/yr)
    pub storage_energy: Vec<f64>,
    /// Transmission capex ($/MW/yr)
    pub branch: Vec<f64>,
    /// Per-scenario emissions allocation price ($/ton)
    pub emissions: Vec<f64>,
}

impl InvestmentCosts {
    pub fn to_flat(&self) -> Vec<f64> {
        let mut flat = Vec::new();
        flat.extend_from_slice(&self.gen);
        flat.extend_from_slice(&self.storage_power);
        flat.extend_from_slice(&self.storage_energy);
        flat.extend_from_slice(&self.branch);
        flat.extend_from_slice(&self.emissions);
        flat
    }

    /// Total annualized investment cost cᵀx.
    pub fn evaluate(&self, x: &CapacityDecision) -> f64 {
        let dot = |c: &[f64], v: &[f64]| c.iter().zip(v).map(|(a, b)| a * b).sum::<f64>();
        dot(&self.gen, &x.gen)
            + dot(&self.storage_power, &x.storage_power)
            + dot(&self.storage_energy, &x.storage_energy)
            + dot(&self.branch, &x.branch)
            + dot(&self.emissions, &x.emissions)
    }

    /// Capital recovery factor for annualizing overnight costs:
    /// CRF = r(1+r)^n / ((1+r)^n − 1).
    ///
    /// Callers that have overnight rather than annualized capex can scale
    /// with this before constructing the cost vectors.
    pub fn capital_recovery_factor(discount_rate: f64, years: usize) -> f64 {
        let r = discount_rate;
        let n = years as f64;
        if r < 1e-10 {
            1.0 / n
        } else {
            r * (1.0 + r).powf(n) / ((1.0 + r).powf(n) - 1.0)
        }
    }
}

/// Numeric tolerances, iteration caps, and resource knobs, with the engine
/// defaults. All fields have builder-style setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Relative-gap convergence target ε for the bundle method
    pub epsilon: f64,
    /// Relative-change convergence target τ for the transmission correction
    pub tau: f64,
    /// Bundle iteration cap (per phase)
    pub max_bundle_iters: usize,
    /// Transmission correction iteration cap
    pub max_corrector_iters: usize,
    /// Level parameter α ∈ (0, 1) placing the level set between bounds
    pub level_alpha: f64,
    /// Screening budget: violations returned per oracle call per scenario
    pub oracle_budget: usize,
    /// Damping β for the correction update
    pub damping: f64,
    /// Worker pool size for scenario subproblems (0 = one per core)
    pub workers: usize,
    /// Wall-clock budget in seconds; None = unbounded
    pub wall_clock_seconds: Option<f64>,
    /// Retain per-iteration history in the result diagnostics
    pub keep_history: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.01,
            tau: 1e-3,
            max_bundle_iters: 200,
            max_corrector_iters: 10,
            level_alpha: 0.3,
            oracle_budget: 50,
            damping: 0.5,
            workers: 0,
            wall_clock_seconds: None,
            keep_history: true,
        }
    }
}

impl SolverConfig {
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_tau(mut self, tau: f64) -> Self {
        self.tau = tau;
        self
    }

    pub fn with_max_bundle_iters(mut self, iters: usize) -> Self {
        self.max_bundle_iters = iters;
        self
    }

    pub fn with_max_corrector_iters(mut self, iters: usize) -> Self {
        self.max_corrector_iters = iters;
        self
    }

    pub fn with_level_alpha(mut self, alpha: f64) -> Self {
        self.level_alpha = alpha;
        self
    }

    pub fn with_oracle_budget(mut self, budget: usize) -> Self {
        self.oracle_budget = budget;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_wall_clock_seconds(mut self, seconds: f64) -> Self {
        self.wall_clock_seconds = Some(seconds);
        self
    }
}

/// The full planning problem: topology plus scenarios plus system-level
/// policy parameters.
#[derive(Debug)]
pub struct PlanningProblem {
    pub network: Network,
    pub scenarios: Vec<ScenarioData>,
    /// Reserve margin γ_d as a fraction of per-period demand
    pub reserve_margin: f64,
    /// Post-contingency rating multiplier η_c
    pub contingency_rating: f64,
    /// Cap on total emissions allocation Σ_ω x_em[ω] (tons)
    pub emissions_cap: f64,
    /// Optional per-scenario allocation caps; defaults to the total cap
    pub emissions_cap_per_scenario: Option<Vec<f64>>,
    /// Carbon price on the emissions allocation ($/ton)
    pub emissions_price: f64,
}

/// Builder for constructing planning problems.
pub struct PlanningProblemBuilder {
    problem: PlanningProblem,
}

impl PlanningProblemBuilder {
    pub fn new(network: Network) -> Self {
        Self {
            problem: PlanningProblem {
                network,
                scenarios: Vec::new(),
                reserve_margin: 0.15,
                contingency_rating: 1.0,
                emissions_cap: f64::INFINITY,
                emissions_cap_per_scenario: None,
                emissions_price: 0.0,
            },
        }
    }

    pub fn scenario(mut self, scenario: ScenarioData) -> Self {
        self.problem.scenarios.push(scenario);
        self
    }

    pub fn reserve_margin(mut self, gamma_d: f64) -> Self {
        self.problem.reserve_margin = gamma_d;
        self
    }

    pub fn contingency_rating(mut self, eta_c: f64) -> Self {
        self.problem.contingency_rating = eta_c;
        self
    }

    pub fn emissions_cap(mut self, total_tons: f64) -> Self {
        self.problem.emissions_cap = total_tons;
        self
    }

    pub fn emissions_price(mut self, dollars_per_ton: f64) -> Self {
        self.problem.emissions_price = dollars_per_ton;
        self
    }

    pub fn build(self) -> PlanningProblem {
        self.problem
    }
}
