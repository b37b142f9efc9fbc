//! # cep-engine: Capacity Expansion Planning Engine
//!
//! Solves capacity expansion planning for interconnected transmission
//! networks: given existing generation, storage, and AC transmission assets,
//! a set of operational scenarios, and caps on investment and emissions, it
//! chooses capacity additions minimizing annualized investment cost plus
//! expected operating cost, subject to DC power flow, N−1 transmission
//! contingency feasibility, reserve margin, ramp, storage dynamics, and
//! emissions constraints.
//!
//! ## Architecture
//!
//! | Stage | Module | Responsibility |
//! |-------|--------|----------------|
//! | compile | [`network`] | Index-space model: incidence, bridges, impedance feedback |
//! | basis | [`cycles`] | Minimal fundamental cycle basis for the KVL formulation |
//! | sensitivity | [`sensitivity`] | PTDF Φ and LODF Λ at a given transmission capacity |
//! | inner | [`subproblem`] | Per-scenario multi-period DC-OPF LP with lazy contingencies |
//! | oracle | [`screening`] | Post-outage violation screening over (period, branch, outage) |
//! | outer | [`bundle`] | Level-bundle method with analytic-center stabilization |
//! | fixpoint | [`correction`] | Transmission correction resolving the impedance feedback |
//! | entry | [`solve`] | Facade sequencing the phases; progress, cancellation, result |
//!
//! ## Decomposition scheme
//!
//! The capacity decision `x` lives in the outer problem; each scenario's
//! operating cost `h_ω(x)` is known only through an LP oracle returning a
//! value and a subgradient. The bundle engine accumulates these cuts,
//! bounds the optimum from both sides, and steps to the analytic center of
//! the level set. Contingency constraints are generated lazily: a screening
//! pass after each subproblem solve finds post-outage overloads and feeds
//! them back as new LP rows. Because line susceptance depends on chosen
//! capacity, the sensitivity matrices are held fixed inside the bundle (at
//! the impedance-defining capacity) and refreshed by an outer fixed-point
//! correction.
//!
//! ## Example
//!
//! ```ignore
//! use cep_engine::{PlanningProblemBuilder, PlanningSolver, SolverConfig};
//!
//! let problem = PlanningProblemBuilder::new(network)
//!     .scenario(summer_peak)
//!     .scenario(winter_peak)
//!     .reserve_margin(0.15)
//!     .emissions_cap(2.5e6)
//!     .build();
//!
//! let result = PlanningSolver::new(SolverConfig::default()).solve(&problem)?;
//! println!("{}", result.summary());
//! ```

pub mod bundle;
pub mod correction;
pub mod cycles;
pub mod input;
pub mod network;
pub mod problem;
pub mod screening;
pub mod sensitivity;
pub mod solve;
pub mod subproblem;
pub mod validation;

pub use bundle::{BundleEngine, BundleError, BundleOutcome, Cut, CuttingPlaneModel};
pub use correction::{correct_transmission, CorrectionOutcome};
pub use cycles::{CycleBasis, CycleBasisError};
pub use input::{
    BranchRecord, BusRecord, GeneratorRecord, LoadRecord, ScenarioRecord, StorageRecord,
    SystemRecord,
};
pub use network::{NetworkModel, ModelError};
pub use problem::{
    CapacityDecision, CapacityDims, CapacityLimits, ContingencyKey, InvestmentCosts,
    PlanningProblem, PlanningProblemBuilder, ScenarioData, SolverConfig,
};
pub use screening::{ContingencyScreener, Violation};
pub use sensitivity::{LodfMatrix, PowerTransferKernel, PtdfMatrix, SensitivityError};
pub use solve::{
    CancelToken, PlanResult, PlanningSolver, ProgressEvent, SolveDiagnostics, SolvePhase,
    SolveStatus,
};
pub use subproblem::{
    FeasibilityCut, OperationalSubproblem, SubproblemError, SubproblemOutcome,
    SubproblemSolution,
};
pub use validation::validate_problem;
