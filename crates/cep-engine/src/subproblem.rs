//! Per-scenario operational subproblem.
//!
//! For one scenario ω and a fixed capacity decision x, solves the
//! multi-period DC-OPF linear program
//!
//! ```text
//! minimize    Σ_t Σ_g c_g[t,g]·p_g + c_sh·Σ p_sh + c_vio·Σ s_c
//! subject to  generation capacity with reserve, ramp limits,
//!             the scenario emissions cap,
//!             storage power/energy bounds and state-of-charge dynamics,
//!             the system reserve requirement,
//!             nodal balance with explicit branch and HVDC flow variables,
//!             cycle-based KVL (no bus angle variables),
//!             base branch limits, and
//!             the lazily grown set of N−1 contingency rows.
//! ```
//!
//! The LP is assembled directly in Clarabel's conic form `Ax + s = b`,
//! `s ∈ K`: the good_lp abstraction used elsewhere does not expose dual
//! variables, and everything the bundle method needs beyond the optimum
//! (the subgradient with respect to x, and Farkas certificates on
//! infeasibility) is recovered from the dual vector.
//!
//! ## Subgradient recovery
//!
//! Every constraint row whose right-hand side depends on a capacity
//! component is recorded as a `(row, slot, coefficient)` triple during
//! assembly. With `z` the optimal dual, the sensitivity of the optimum to
//! the right-hand side is `−z`, so the subgradient is
//! `g[slot] = −Σ_rows coeff · z[row]`. On primal infeasibility the same
//! triples applied to the Farkas certificate yield the feasibility cut
//! `Σ_slot (Σ_r coeff·z_r) · x[slot] ≥ −b(0)ᵀz`.

use crate::cycles::CycleBasis;
use crate::network::NetworkModel;
use crate::problem::{CapacityDecision, ContingencyKey, ScenarioData};
use crate::sensitivity::LodfMatrix;
use clarabel::algebra::CscMatrix;
use clarabel::solver::{DefaultSettingsBuilder, IPSolver, SolverStatus, SupportedConeT};
use thiserror::Error;

/// Errors from the operational LP
#[derive(Debug, Error)]
pub enum SubproblemError {
    #[error("Clarabel settings error: {0}")]
    Settings(String),

    #[error("Clarabel initialization failed: {0}")]
    Init(String),

    #[error("LP solver returned status {0}")]
    Solver(String),

    #[error("Capacity decision dimensions do not match the model")]
    Dimension,
}

/// Optimal primal/dual information for one scenario solve.
#[derive(Debug, Clone)]
pub struct SubproblemSolution {
    /// Operating cost for this scenario (unweighted)
    pub objective: f64,
    /// Subgradient of the operating cost with respect to the flat capacity
    /// vector (unweighted)
    pub subgradient: Vec<f64>,
    /// Generator output `p_g[t][g]` (MW)
    pub gen_output: Vec<Vec<f64>>,
    /// Generator reserve `r_g[t][g]` (MW)
    pub gen_reserve: Vec<Vec<f64>>,
    /// AC branch flow `p_br[t][j]` (MW, positive from→to)
    pub branch_flow: Vec<Vec<f64>>,
    /// HVDC flow `p_dc[t][h]` (MW)
    pub hvdc_flow: Vec<Vec<f64>>,
    /// Load shedding `p_sh[t][d]` (MW)
    pub shed: Vec<Vec<f64>>,
    /// Storage charge / discharge / reserve / state of charge, T × S
    pub storage_charge: Vec<Vec<f64>>,
    pub storage_discharge: Vec<Vec<f64>>,
    pub storage_reserve: Vec<Vec<f64>>,
    pub storage_soc: Vec<Vec<f64>>,
    /// Contingency slacks aligned with the contingency set passed in
    pub contingency_slack: Vec<f64>,
    /// Net nodal injection `p_ni[t][bus]` with HVDC transfers folded in:
    /// exactly the vector whose PTDF image is the AC branch flow
    pub nodal_injection: Vec<Vec<f64>>,
    /// Total emissions Σ e_g · p_g (tons)
    pub emissions: f64,
}

/// Farkas-certificate feasibility cut `gradientᵀ x ≥ rhs`.
#[derive(Debug, Clone)]
pub struct FeasibilityCut {
    pub gradient: Vec<f64>,
    pub rhs: f64,
}

/// Outcome of a scenario solve: an optimal solution, or a certificate that
/// no dispatch is feasible under the given capacity decision (the bundle
/// treats the latter as +∞ cost).
#[derive(Debug, Clone)]
pub enum SubproblemOutcome {
    Optimal(SubproblemSolution),
    Infeasible(FeasibilityCut),
}

/// One scenario's operational LP, parameterized by the capacity decision.
///
/// The LODF matrix and effective impedances are taken at the
/// impedance-defining capacity `x̂_br`, not at the current `x_br`; holding
/// them fixed keeps the scenario cost convex in x. The outer correction
/// loop refreshes them.
pub struct OperationalSubproblem<'a> {
    model: &'a NetworkModel,
    basis: &'a CycleBasis,
    scenario: &'a ScenarioData,
    scenario_index: usize,
    lodf: &'a LodfMatrix,
    /// Effective impedance χ(x̂_br) used by the KVL rows
    chi_hat: &'a [f64],
    reserve_margin: f64,
    contingency_rating: f64,
}

impl<'a> OperationalSubproblem<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: &'a NetworkModel,
        basis: &'a CycleBasis,
        scenario: &'a ScenarioData,
        scenario_index: usize,
        lodf: &'a LodfMatrix,
        chi_hat: &'a [f64],
        reserve_margin: f64,
        contingency_rating: f64,
    ) -> Self {
        Self {
            model,
            basis,
            scenario,
            scenario_index,
            lodf,
            chi_hat,
            reserve_margin,
            contingency_rating,
        }
    }

    /// Solve the LP for the given capacity decision and contingency set.
    /// The contingency slice must be sorted; the caller (the bundle engine)
    /// maintains it as an ordered set.
    pub fn solve(
        &self,
        x: &CapacityDecision,
        contingencies: &[ContingencyKey],
    ) -> Result<SubproblemOutcome, SubproblemError> {
        let model = self.model;
        let scenario = self.scenario;
        let t_len = scenario.horizon;
        let n_gen = model.n_gens();
        let n_sto = model.n_storages();
        let n_load = model.n_loads();
        let n_br = model.n_branches();
        let n_dc = model.n_hvdc();
        let n_con = contingencies.len();
        let dims = model.dims(x.emissions.len());

        if x.gen.len() != n_gen
            || x.storage_power.len() != n_sto
            || x.branch.len() != n_br
            || self.scenario_index >= x.emissions.len()
        {
            return Err(SubproblemError::Dimension);
        }

        // === Variable layout ===
        let off_pg = 0;
        let off_rg = off_pg + t_len * n_gen;
        let off_chg = off_rg + t_len * n_gen;
        let off_dis = off_chg + t_len * n_sto;
        let off_rdis = off_dis + t_len * n_sto;
        let off_q = off_rdis + t_len * n_sto;
        let off_br = off_q + t_len * n_sto;
        let off_dc = off_br + t_len * n_br;
        let off_sh = off_dc + t_len * n_dc;
        let off_sc = off_sh + t_len * n_load;
        let n_var = off_sc + n_con;

        let pg = |t: usize, g: usize| off_pg + t * n_gen + g;
        let rg = |t: usize, g: usize| off_rg + t * n_gen + g;
        let chg = |t: usize, s: usize| off_chg + t * n_sto + s;
        let dis = |t: usize, s: usize| off_dis + t * n_sto + s;
        let rdis = |t: usize, s: usize| off_rdis + t * n_sto + s;
        let q = |t: usize, s: usize| off_q + t * n_sto + s;
        let br = |t: usize, j: usize| off_br + t * n_br + j;
        let dc = |t: usize, h: usize| off_dc + t * n_dc + h;
        let sh = |t: usize, d: usize| off_sh + t * n_load + d;
        let sc = |k: usize| off_sc + k;

        // === Objective ===
        let mut obj = vec![0.0; n_var];
        for t in 0..t_len {
            for g in 0..n_gen {
                obj[pg(t, g)] = scenario.cost[t][g];
            }
            for d in 0..n_load {
                obj[sh(t, d)] = scenario.shed_penalty;
            }
        }
        for k in 0..n_con {
            obj[sc(k)] = scenario.violation_penalty;
        }

        // === Constraint assembly (column-wise, cone-ordered) ===
        let mut columns: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n_var];
        let mut rhs: Vec<f64> = Vec::new();
        let mut cones: Vec<SupportedConeT<f64>> = Vec::new();
        // Rows whose RHS carries a capacity term: (row, slot, coefficient)
        let mut cap_rows: Vec<(usize, usize, f64)> = Vec::new();

        let push_eq = |coeffs: &[(usize, f64)],
                       b: f64,
                       columns: &mut Vec<Vec<(usize, f64)>>,
                       rhs: &mut Vec<f64>,
                       cones: &mut Vec<SupportedConeT<f64>>|
         -> usize {
            let row = rhs.len();
            for &(col, val) in coeffs {
                columns[col].push((row, val));
            }
            rhs.push(b);
            match cones.last_mut() {
                Some(SupportedConeT::ZeroConeT(n)) => *n += 1,
                _ => cones.push(SupportedConeT::ZeroConeT(1)),
            }
            row
        };

        let push_leq = |coeffs: &[(usize, f64)],
                        b: f64,
                        columns: &mut Vec<Vec<(usize, f64)>>,
                        rhs: &mut Vec<f64>,
                        cones: &mut Vec<SupportedConeT<f64>>|
         -> usize {
            let row = rhs.len();
            for &(col, val) in coeffs {
                columns[col].push((row, val));
            }
            rhs.push(b);
            match cones.last_mut() {
                Some(SupportedConeT::NonnegativeConeT(n)) => *n += 1,
                _ => cones.push(SupportedConeT::NonnegativeConeT(1)),
            }
            row
        };

        // Non-negativity of the one-sided variables
        for t in 0..t_len {
            for g in 0..n_gen {
                push_leq(&[(pg(t, g), -1.0)], 0.0, &mut columns, &mut rhs, &mut cones);
                push_leq(&[(rg(t, g), -1.0)], 0.0, &mut columns, &mut rhs, &mut cones);
            }
            for s in 0..n_sto {
                push_leq(&[(chg(t, s), -1.0)], 0.0, &mut columns, &mut rhs, &mut cones);
                push_leq(&[(dis(t, s), -1.0)], 0.0, &mut columns, &mut rhs, &mut cones);
                push_leq(&[(rdis(t, s), -1.0)], 0.0, &mut columns, &mut rhs, &mut cones);
                push_leq(&[(q(t, s), -1.0)], 0.0, &mut columns, &mut rhs, &mut cones);
            }
            for d in 0..n_load {
                push_leq(&[(sh(t, d), -1.0)], 0.0, &mut columns, &mut rhs, &mut cones);
            }
        }
        for k in 0..n_con {
            push_leq(&[(sc(k), -1.0)], 0.0, &mut columns, &mut rhs, &mut cones);
        }

        // Generation capacity with reserve: p_g + r_g ≤ a·(w_g + x_g)
        for t in 0..t_len {
            for g in 0..n_gen {
                let a = scenario.availability[t][g];
                let row = push_leq(
                    &[(pg(t, g), 1.0), (rg(t, g), 1.0)],
                    a * (model.gen_existing[g] + x.gen[g]),
                    &mut columns,
                    &mut rhs,
                    &mut cones,
                );
                cap_rows.push((row, dims.gen_slot(g), a));
            }
        }

        // Ramp limits: |p_g[t] − p_g[t−1]| ≤ R·(w_g + x_g)
        for t in 1..t_len {
            for g in 0..n_gen {
                let r = model.gen_ramp[g];
                let cap = r * (model.gen_existing[g] + x.gen[g]);
                let up = push_leq(
                    &[(pg(t, g), 1.0), (pg(t - 1, g), -1.0)],
                    cap,
                    &mut columns,
                    &mut rhs,
                    &mut cones,
                );
                cap_rows.push((up, dims.gen_slot(g), r));
                let down = push_leq(
                    &[(pg(t, g), -1.0), (pg(t - 1, g), 1.0)],
                    cap,
                    &mut columns,
                    &mut rhs,
                    &mut cones,
                );
                cap_rows.push((down, dims.gen_slot(g), r));
            }
        }

        // Scenario emissions cap: Σ e_g·p_g ≤ x_em[ω]. An unbounded
        // allocation (no cap configured) adds no row.
        let em_cap = x.emissions[self.scenario_index];
        if em_cap.is_finite() {
            let mut coeffs = Vec::new();
            for t in 0..t_len {
                for g in 0..n_gen {
                    if model.gen_emissions[g] != 0.0 {
                        coeffs.push((pg(t, g), model.gen_emissions[g]));
                    }
                }
            }
            let row = push_leq(&coeffs, em_cap, &mut columns, &mut rhs, &mut cones);
            cap_rows.push((row, dims.emissions_slot(self.scenario_index), 1.0));
        }

        // Storage
        for t in 0..t_len {
            for s in 0..n_sto {
                let power_cap = model.storage_power[s] + x.storage_power[s];
                let energy_cap = model.storage_energy[s] + x.storage_energy[s];
                let eta = model.storage_efficiency[s];
                let gamma = model.storage_soc[s];

                // All active uses within power capacity
                let row = push_leq(
                    &[(chg(t, s), 1.0), (dis(t, s), 1.0), (rdis(t, s), 1.0)],
                    power_cap,
                    &mut columns,
                    &mut rhs,
                    &mut cones,
                );
                cap_rows.push((row, dims.storage_power_slot(s), 1.0));

                // State-of-charge bounds: r_dis ≤ q ≤ w_es_e + x_es_e
                let row = push_leq(
                    &[(q(t, s), 1.0)],
                    energy_cap,
                    &mut columns,
                    &mut rhs,
                    &mut cones,
                );
                cap_rows.push((row, dims.storage_energy_slot(s), 1.0));
                push_leq(
                    &[(rdis(t, s), 1.0), (q(t, s), -1.0)],
                    0.0,
                    &mut columns,
                    &mut rhs,
                    &mut cones,
                );

                // Dynamics: q[t] = q[t−1] + η·p_chg − p_dis/η,
                // with q[−1] = γ·(w_es_e + x_es_e)
                if t == 0 {
                    let row = push_eq(
                        &[(q(0, s), 1.0), (chg(0, s), -eta), (dis(0, s), 1.0 / eta)],
                        gamma * energy_cap,
                        &mut columns,
                        &mut rhs,
                        &mut cones,
                    );
                    cap_rows.push((row, dims.storage_energy_slot(s), gamma));
                } else {
                    push_eq(
                        &[
                            (q(t, s), 1.0),
                            (q(t - 1, s), -1.0),
                            (chg(t, s), -eta),
                            (dis(t, s), 1.0 / eta),
                        ],
                        0.0,
                        &mut columns,
                        &mut rhs,
                        &mut cones,
                    );
                }
            }
        }
        // Endpoint continuity: q[T−1] = γ·(w_es_e + x_es_e)
        for s in 0..n_sto {
            let energy_cap = model.storage_energy[s] + x.storage_energy[s];
            let gamma = model.storage_soc[s];
            let row = push_eq(
                &[(q(t_len - 1, s), 1.0)],
                gamma * energy_cap,
                &mut columns,
                &mut rhs,
                &mut cones,
            );
            cap_rows.push((row, dims.storage_energy_slot(s), gamma));
        }

        // System reserve: Σ r_g + Σ r_dis ≥ γ_d · Σ p_d
        for t in 0..t_len {
            let mut coeffs = Vec::new();
            for g in 0..n_gen {
                coeffs.push((rg(t, g), -1.0));
            }
            for s in 0..n_sto {
                coeffs.push((rdis(t, s), -1.0));
            }
            push_leq(
                &coeffs,
                -self.reserve_margin * scenario.total_demand(t),
                &mut columns,
                &mut rhs,
                &mut cones,
            );
        }

        // Nodal balance at every bus and period:
        // gen + discharge − charge + shed − net AC outflow − net HVDC
        // outflow = demand
        for t in 0..t_len {
            for bus in 0..model.n_bus {
                let mut coeffs = Vec::new();
                for g in 0..n_gen {
                    if model.gen_bus[g] == bus {
                        coeffs.push((pg(t, g), 1.0));
                    }
                }
                for s in 0..n_sto {
                    if model.storage_bus[s] == bus {
                        coeffs.push((dis(t, s), 1.0));
                        coeffs.push((chg(t, s), -1.0));
                    }
                }
                let mut demand = 0.0;
                for d in 0..n_load {
                    if model.load_bus[d] == bus {
                        coeffs.push((sh(t, d), 1.0));
                        demand += scenario.demand[t][d];
                    }
                }
                for j in 0..n_br {
                    if model.branch_from[j] == bus {
                        coeffs.push((br(t, j), -1.0));
                    }
                    if model.branch_to[j] == bus {
                        coeffs.push((br(t, j), 1.0));
                    }
                }
                for h in 0..n_dc {
                    if model.hvdc_from[h] == bus {
                        coeffs.push((dc(t, h), -1.0));
                    }
                    if model.hvdc_to[h] == bus {
                        coeffs.push((dc(t, h), 1.0));
                    }
                }
                push_eq(&coeffs, demand, &mut columns, &mut rhs, &mut cones);
            }
        }

        // Base branch limits: |p_br| ≤ w_br + x_br
        for t in 0..t_len {
            for j in 0..n_br {
                let cap = model.branch_capacity[j] + x.branch[j];
                let row = push_leq(&[(br(t, j), 1.0)], cap, &mut columns, &mut rhs, &mut cones);
                cap_rows.push((row, dims.branch_slot(j), 1.0));
                let row = push_leq(&[(br(t, j), -1.0)], cap, &mut columns, &mut rhs, &mut cones);
                cap_rows.push((row, dims.branch_slot(j), 1.0));
            }
            for h in 0..n_dc {
                let cap = model.hvdc_capacity[h];
                push_leq(&[(dc(t, h), 1.0)], cap, &mut columns, &mut rhs, &mut cones);
                push_leq(&[(dc(t, h), -1.0)], cap, &mut columns, &mut rhs, &mut cones);
            }
        }

        // Cycle-based KVL: Σ_j D[c,j]·χ_j·p_br[t,j] = 0
        for t in 0..t_len {
            for row_d in &self.basis.rows {
                let coeffs: Vec<(usize, f64)> = row_d
                    .iter()
                    .enumerate()
                    .filter(|(_, &d)| d != 0)
                    .map(|(j, &d)| (br(t, j), d as f64 * self.chi_hat[j]))
                    .collect();
                push_eq(&coeffs, 0.0, &mut columns, &mut rhs, &mut cones);
            }
        }

        // N−1 contingency rows, both signs:
        // |p_br[t,i] + Λ[i,j]·p_br[t,j]| ≤ η_c·(w_br[i] + x_br[i]) + s_c
        let eta_c = self.contingency_rating;
        for (k, key) in contingencies.iter().enumerate() {
            let (t, i, j) = (key.t, key.monitored, key.outaged);
            debug_assert!(t < t_len && i != j);
            debug_assert!(self.lodf.contingent[j] && self.lodf.contingent[i]);
            let lambda = self.lodf.get(i, j);
            let cap = eta_c * (model.branch_capacity[i] + x.branch[i]);
            let row = push_leq(
                &[(br(t, i), 1.0), (br(t, j), lambda), (sc(k), -1.0)],
                cap,
                &mut columns,
                &mut rhs,
                &mut cones,
            );
            cap_rows.push((row, dims.branch_slot(i), eta_c));
            let row = push_leq(
                &[(br(t, i), -1.0), (br(t, j), -lambda), (sc(k), -1.0)],
                cap,
                &mut columns,
                &mut rhs,
                &mut cones,
            );
            cap_rows.push((row, dims.branch_slot(i), eta_c));
        }

        // === CSC conversion ===
        let n_rows = rhs.len();
        let mut col_ptr = Vec::with_capacity(n_var + 1);
        let mut row_idx = Vec::new();
        let mut values = Vec::new();
        let mut nnz = 0;
        for col in 0..n_var {
            col_ptr.push(nnz);
            columns[col].sort_by_key(|(r, _)| *r);
            for &(r, v) in &columns[col] {
                row_idx.push(r);
                values.push(v);
                nnz += 1;
            }
        }
        col_ptr.push(nnz);

        let a_mat = CscMatrix::new(n_rows, n_var, col_ptr, row_idx, values);
        let p_mat = CscMatrix::new(n_var, n_var, vec![0; n_var + 1], vec![], vec![]);

        let settings = DefaultSettingsBuilder::default()
            .verbose(false)
            .build()
            .map_err(|e| SubproblemError::Settings(format!("{:?}", e)))?;

        let mut solver =
            clarabel::solver::DefaultSolver::new(&p_mat, &obj, &a_mat, &rhs, &cones, settings)
                .map_err(|e| SubproblemError::Init(format!("{:?}", e)))?;
        solver.solve();
        let sol = solver.solution;

        match sol.status {
            SolverStatus::Solved | SolverStatus::AlmostSolved => {}
            SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
                // Farkas certificate: b(x)ᵀz < 0 with Aᵀz = 0, z ∈ K*.
                // Requiring b(x)ᵀz ≥ 0 is the affine feasibility cut.
                let z = &sol.z;
                let mut gradient = vec![0.0; dims.total()];
                for &(row, slot, coeff) in &cap_rows {
                    gradient[slot] += coeff * z[row];
                }
                let bz: f64 = rhs.iter().zip(z.iter()).map(|(b, zi)| b * zi).sum();
                let x_flat = x.to_flat();
                let b0z = bz
                    - gradient
                        .iter()
                        .zip(&x_flat)
                        .map(|(g, xi)| g * xi)
                        .sum::<f64>();
                return Ok(SubproblemOutcome::Infeasible(FeasibilityCut {
                    gradient,
                    rhs: -b0z,
                }));
            }
            other => {
                return Err(SubproblemError::Solver(format!("{:?}", other)));
            }
        }

        let xs = &sol.x;
        let z = &sol.z;

        let objective: f64 = obj.iter().zip(xs.iter()).map(|(c, v)| c * v).sum();

        let mut subgradient = vec![0.0; dims.total()];
        for &(row, slot, coeff) in &cap_rows {
            subgradient[slot] -= coeff * z[row];
        }

        let grid = |off: usize, cols: usize| -> Vec<Vec<f64>> {
            (0..t_len)
                .map(|t| (0..cols).map(|c| xs[off + t * cols + c]).collect())
                .collect()
        };

        let gen_output = grid(off_pg, n_gen);
        let gen_reserve = grid(off_rg, n_gen);
        let storage_charge = grid(off_chg, n_sto);
        let storage_discharge = grid(off_dis, n_sto);
        let storage_reserve = grid(off_rdis, n_sto);
        let storage_soc = grid(off_q, n_sto);
        let branch_flow = grid(off_br, n_br);
        let hvdc_flow = grid(off_dc, n_dc);
        let shed = grid(off_sh, n_load);
        let contingency_slack: Vec<f64> = (0..n_con).map(|k| xs[sc(k)]).collect();

        // Net nodal injection with HVDC folded in: the vector whose PTDF
        // image reproduces the AC flows. Used by the correction loop.
        let mut nodal_injection = vec![vec![0.0; model.n_bus]; t_len];
        for t in 0..t_len {
            for g in 0..n_gen {
                nodal_injection[t][model.gen_bus[g]] += gen_output[t][g];
            }
            for s in 0..n_sto {
                nodal_injection[t][model.storage_bus[s]] +=
                    storage_discharge[t][s] - storage_charge[t][s];
            }
            for d in 0..n_load {
                nodal_injection[t][model.load_bus[d]] += shed[t][d] - scenario.demand[t][d];
            }
            for h in 0..n_dc {
                nodal_injection[t][model.hvdc_from[h]] -= hvdc_flow[t][h];
                nodal_injection[t][model.hvdc_to[h]] += hvdc_flow[t][h];
            }
        }

        let emissions: f64 = (0..t_len)
            .map(|t| {
                (0..n_gen)
                    .map(|g| model.gen_emissions[g] * gen_output[t][g])
                    .sum::<f64>()
            })
            .sum();

        Ok(SubproblemOutcome::Optimal(SubproblemSolution {
            objective,
            subgradient,
            gen_output,
            gen_reserve,
            branch_flow,
            hvdc_flow,
            shed,
            storage_charge,
            storage_discharge,
            storage_reserve,
            storage_soc,
            contingency_slack,
            nodal_injection,
            emissions,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensitivity::PowerTransferKernel;
    use cep_core::{
        Branch, BranchId, Bus, BusId, Edge, Gen, GenId, Kilovolts, Load, LoadId, MegawattHours,
        Megawatts, Network, Node, PerUnit, Storage, StorageId,
    };

    fn triangle_network(direct_capacity: f64) -> Network {
        let mut network = Network::new();
        let nodes: Vec<_> = (0..3)
            .map(|i| {
                network.graph.add_node(Node::Bus(Bus {
                    id: BusId::new(i),
                    name: format!("bus{}", i),
                    base_kv: Kilovolts(230.0),
                    slack: i == 0,
                    ..Bus::default()
                }))
            })
            .collect();
        let caps = [50.0, 50.0, direct_capacity];
        for (id, &(a, b)) in [(0usize, 1usize), (1, 2), (0, 2)].iter().enumerate() {
            network.graph.add_edge(
                nodes[a],
                nodes[b],
                Edge::Branch(Branch::new(
                    BranchId::new(id),
                    format!("br{}", id),
                    BusId::new(a),
                    BusId::new(b),
                    Megawatts(caps[id]),
                    PerUnit(0.1),
                )),
            );
        }
        network.graph.add_node(Node::Gen(
            Gen::new(GenId::new(0), "g0".to_string(), BusId::new(0))
                .with_existing(Megawatts(100.0)),
        ));
        network.graph.add_node(Node::Load(Load {
            id: LoadId::new(0),
            name: "l0".to_string(),
            bus: BusId::new(2),
        }));
        network
    }

    fn single_period_scenario(demand: f64) -> ScenarioData {
        ScenarioData {
            name: "peak".to_string(),
            weight: 1.0,
            horizon: 1,
            cost: vec![vec![10.0]],
            availability: vec![vec![1.0]],
            demand: vec![vec![demand]],
            shed_penalty: 1.0e4,
            violation_penalty: 2.0e3,
        }
    }

    struct Fixture {
        model: NetworkModel,
        basis: CycleBasis,
        lodf: LodfMatrix,
        chi: Vec<f64>,
    }

    fn fixture(network: &Network) -> Fixture {
        let model = NetworkModel::compile(network).unwrap();
        let basis = CycleBasis::build(&model).unwrap();
        let x_hat = vec![0.0; model.n_branches()];
        let (_, lodf) = PowerTransferKernel::compute(&model, &x_hat).unwrap();
        let chi = model.effective_impedance(&x_hat);
        Fixture {
            model,
            basis,
            lodf,
            chi,
        }
    }

    fn check_balance(fx: &Fixture, scenario: &ScenarioData, sol: &SubproblemSolution) {
        for t in 0..scenario.horizon {
            for bus in 0..fx.model.n_bus {
                let mut residual = sol.nodal_injection[t][bus];
                for j in 0..fx.model.n_branches() {
                    if fx.model.branch_from[j] == bus {
                        residual -= sol.branch_flow[t][j];
                    }
                    if fx.model.branch_to[j] == bus {
                        residual += sol.branch_flow[t][j];
                    }
                }
                assert!(
                    residual.abs() < 1e-6,
                    "nodal imbalance {residual} at bus {bus}, period {t}"
                );
            }
        }
    }

    #[test]
    fn test_uncongested_dispatch() {
        let network = triangle_network(50.0);
        let fx = fixture(&network);
        let scenario = single_period_scenario(60.0);
        let mut x = CapacityDecision::zeros(fx.model.dims(1));
        x.emissions[0] = f64::INFINITY;

        let sub = OperationalSubproblem::new(
            &fx.model, &fx.basis, &scenario, 0, &fx.lodf, &fx.chi, 0.15, 1.0,
        );
        let outcome = sub.solve(&x, &[]).unwrap();
        let sol = match outcome {
            SubproblemOutcome::Optimal(sol) => sol,
            SubproblemOutcome::Infeasible(_) => panic!("expected optimal"),
        };

        assert!((sol.objective - 600.0).abs() < 1.0);
        assert!((sol.gen_output[0][0] - 60.0).abs() < 1e-3);
        assert!(sol.shed[0][0].abs() < 1e-6);
        // PTDF split on the equal-impedance triangle
        assert!((sol.branch_flow[0][2] - 40.0).abs() < 1e-2);
        assert!((sol.branch_flow[0][0] - 20.0).abs() < 1e-2);
        assert!((sol.branch_flow[0][1] - 20.0).abs() < 1e-2);
        check_balance(&fx, &scenario, &sol);

        // More capacity can never increase the optimal cost
        for g in &sol.subgradient {
            assert!(*g <= 1e-6, "subgradient entry {g} is positive");
        }
    }

    #[test]
    fn test_congested_branch_sheds_and_prices_expansion() {
        // Direct branch derated to 15 MW: KVL forces flows proportional to
        // the dispatch, so serving L MW puts 2L/3 on the direct branch and
        // at most 22.5 MW can be served.
        let network = triangle_network(15.0);
        let fx = fixture(&network);
        let scenario = single_period_scenario(60.0);
        let mut x = CapacityDecision::zeros(fx.model.dims(1));
        x.emissions[0] = f64::INFINITY;

        let sub = OperationalSubproblem::new(
            &fx.model, &fx.basis, &scenario, 0, &fx.lodf, &fx.chi, 0.0, 1.0,
        );
        let sol = match sub.solve(&x, &[]).unwrap() {
            SubproblemOutcome::Optimal(sol) => sol,
            SubproblemOutcome::Infeasible(_) => panic!("expected optimal"),
        };

        assert!((sol.shed[0][0] - 37.5).abs() < 0.1);
        assert!((sol.objective - (22.5 * 10.0 + 37.5 * 1.0e4)).abs() < 20.0);
        check_balance(&fx, &scenario, &sol);

        // The dual prices transmission expansion on the congested corridor:
        // one extra MW there lets 1.5 MW of shedding be served instead.
        let dims = fx.model.dims(1);
        let g_br = sol.subgradient[dims.branch_slot(2)];
        assert!(
            g_br < -1.0e3,
            "expected strongly negative branch subgradient, got {g_br}"
        );
    }

    #[test]
    fn test_storage_arbitrage_and_cycle_constraint() {
        // Single-bus system: cheap energy in period 0, expensive in period
        // 1; storage shifts it. Unit efficiency keeps the arithmetic exact.
        let mut network = Network::new();
        network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(0),
            name: "hub".to_string(),
            base_kv: Kilovolts(230.0),
            slack: true,
            ..Bus::default()
        }));
        network.graph.add_node(Node::Gen(
            Gen::new(GenId::new(0), "g0".to_string(), BusId::new(0))
                .with_existing(Megawatts(200.0)),
        ));
        network.graph.add_node(Node::Storage(
            Storage::new(StorageId::new(0), "bess".to_string(), BusId::new(0))
                .with_existing(Megawatts(100.0), MegawattHours(100.0))
                .with_efficiency(1.0),
        ));
        network.graph.add_node(Node::Load(Load {
            id: LoadId::new(0),
            name: "l0".to_string(),
            bus: BusId::new(0),
        }));

        let model = NetworkModel::compile(&network).unwrap();
        let basis = CycleBasis::build(&model).unwrap();
        let lodf = LodfMatrix {
            values: vec![],
            contingent: vec![],
        };
        let chi: Vec<f64> = vec![];

        let scenario = ScenarioData {
            name: "spread".to_string(),
            weight: 1.0,
            horizon: 2,
            cost: vec![vec![5.0], vec![50.0]],
            availability: vec![vec![1.0], vec![1.0]],
            demand: vec![vec![0.0], vec![50.0]],
            shed_penalty: 1.0e4,
            violation_penalty: 2.0e3,
        };
        let mut x = CapacityDecision::zeros(model.dims(1));
        x.emissions[0] = f64::INFINITY;

        let sub = OperationalSubproblem::new(&model, &basis, &scenario, 0, &lodf, &chi, 0.0, 1.0);
        let sol = match sub.solve(&x, &[]).unwrap() {
            SubproblemOutcome::Optimal(sol) => sol,
            SubproblemOutcome::Infeasible(_) => panic!("expected optimal"),
        };

        // Charge 50 MW of cheap energy, discharge it at the peak
        assert!((sol.objective - 250.0).abs() < 1.0);
        assert!((sol.storage_charge[0][0] - 50.0).abs() < 0.1);
        assert!((sol.storage_discharge[1][0] - 50.0).abs() < 0.1);
        // Endpoint continuity at γ_es = 0.5 of the 100 MWh device
        assert!((sol.storage_soc[1][0] - 50.0).abs() < 0.1);
    }

    #[test]
    fn test_contingency_row_with_slack() {
        // Monitor br1 under outage of br2 at base-case-tight ratings: the
        // redistributed flow exceeds the emergency rating, so the slack
        // variable absorbs the excess at the violation penalty.
        let network = triangle_network(50.0);
        let fx = fixture(&network);
        let scenario = single_period_scenario(60.0);
        let mut x = CapacityDecision::zeros(fx.model.dims(1));
        x.emissions[0] = f64::INFINITY;

        let keys = vec![
            ContingencyKey {
                t: 0,
                monitored: 0,
                outaged: 2,
            },
            ContingencyKey {
                t: 0,
                monitored: 1,
                outaged: 2,
            },
        ];
        let sub = OperationalSubproblem::new(
            &fx.model, &fx.basis, &scenario, 0, &fx.lodf, &fx.chi, 0.0, 1.0,
        );
        let sol = match sub.solve(&x, &keys).unwrap() {
            SubproblemOutcome::Optimal(sol) => sol,
            SubproblemOutcome::Infeasible(_) => panic!("expected optimal"),
        };

        // With br2 out the whole 60 MW transfer rides the 0-1-2 path; the
        // LP weighs slack at c_vio against shedding at c_sh and keeps
        // serving load (c_vio < c_sh), so some slack must be positive.
        for (k, key) in keys.iter().enumerate() {
            let post = sol.branch_flow[0][key.monitored]
                + fx.lodf.get(key.monitored, key.outaged) * sol.branch_flow[0][key.outaged];
            let cap = fx.model.branch_capacity[key.monitored];
            assert!(
                post.abs() <= cap + sol.contingency_slack[k] + 1e-4,
                "contingency row violated beyond slack"
            );
        }
        assert!(sol.contingency_slack.iter().any(|&s| s > 1.0));
        check_balance(&fx, &scenario, &sol);
    }

    #[test]
    fn test_infeasible_reserve_produces_cut() {
        // Reserve requirement above total installed capability is
        // infeasible no matter how much load is shed.
        let network = triangle_network(50.0);
        let fx = fixture(&network);
        let mut scenario = single_period_scenario(200.0);
        scenario.availability = vec![vec![0.25]]; // 25 MW of 100 MW usable
        let mut x = CapacityDecision::zeros(fx.model.dims(1));
        x.emissions[0] = f64::INFINITY;

        let sub = OperationalSubproblem::new(
            &fx.model, &fx.basis, &scenario, 0, &fx.lodf, &fx.chi, 0.5, 1.0,
        );
        let cut = match sub.solve(&x, &[]).unwrap() {
            SubproblemOutcome::Infeasible(cut) => cut,
            SubproblemOutcome::Optimal(sol) => {
                panic!("expected infeasible, got objective {}", sol.objective)
            }
        };

        let dims = fx.model.dims(1);
        // The certificate must be violated at x = 0 and point along the
        // generator capacity direction that restores feasibility.
        assert!(cut.rhs > 1e-6);
        assert!(cut.gradient[dims.gen_slot(0)] > 1e-9);
    }

    #[test]
    fn test_emissions_cap_binds() {
        let network = triangle_network(50.0);
        let mut fx_network = network;
        // Make the generator emitting
        for node in fx_network.graph.node_weights_mut() {
            if let Node::Gen(gen) = node {
                gen.emissions_per_mwh = 1.0;
            }
        }
        let fx = fixture(&fx_network);
        let scenario = single_period_scenario(60.0);
        let mut x = CapacityDecision::zeros(fx.model.dims(1));
        x.emissions[0] = 25.0; // tons; at 1 t/MWh only 25 MWh may be generated

        let sub = OperationalSubproblem::new(
            &fx.model, &fx.basis, &scenario, 0, &fx.lodf, &fx.chi, 0.0, 1.0,
        );
        let sol = match sub.solve(&x, &[]).unwrap() {
            SubproblemOutcome::Optimal(sol) => sol,
            SubproblemOutcome::Infeasible(_) => panic!("expected optimal"),
        };

        assert!(sol.emissions <= 25.0 + 1e-4);
        assert!((sol.shed[0][0] - 35.0).abs() < 0.1);
        // Loosening the emissions allocation substitutes generation at $10
        // for shedding at $10⁴
        let dims = fx.model.dims(1);
        let g_em = sol.subgradient[dims.emissions_slot(0)];
        assert!(g_em < -1.0e3, "emissions subgradient {g_em}");
    }
}
