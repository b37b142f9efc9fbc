//! Power transfer sensitivity matrices at a given transmission capacity.
//!
//! ## Power Transfer Distribution Factors (PTDF)
//!
//! PTDF[ℓ,n] = sensitivity of flow on branch ℓ to injection at bus n
//! (withdrawn at the slack):
//! ```text
//! ΔP_ℓ = PTDF[ℓ,n] × ΔP_injection_n
//! ```
//!
//! ## Line Outage Distribution Factors (LODF)
//!
//! LODF[ℓ,m] = fraction of branch m's flow that shifts to branch ℓ when m
//! trips:
//! ```text
//! P_ℓ_post = P_ℓ_pre + LODF[ℓ,m] × P_m_pre
//! ```
//!
//! Both matrices are functions of the transmission capacity additions
//! through the impedance-feedback rule: adding capacity on a line lowers
//! its impedance and changes the flow distribution across the whole
//! network. One LU factorization of the reduced weighted Laplacian
//! supports all PTDF columns and all LODF entries.

use crate::network::NetworkModel;
use faer::prelude::*;
use faer::Mat;
use sprs::TriMat;
use thiserror::Error;

/// Errors from sensitivity matrix computation
#[derive(Debug, Error)]
pub enum SensitivityError {
    #[error("Network must have at least 2 buses")]
    TooFewBuses,

    #[error("Network must have at least 1 AC branch")]
    NoBranches,

    #[error("Reduced Laplacian is singular (disconnected topology?)")]
    Singular,

    #[error("Capacity vector length {0} does not match branch count {1}")]
    DimensionMismatch(usize, usize),
}

/// PTDF matrix: sensitivity of branch flows to bus injections.
///
/// Dense storage: PTDF matrices are dense in practice (every branch sees
/// every injection to some degree). Columns span all buses; the slack
/// column is identically zero. Flow is positive in the branch's reference
/// (from → to) orientation.
#[derive(Debug, Clone)]
pub struct PtdfMatrix {
    /// values[branch][bus]
    pub values: Vec<Vec<f64>>,
    pub n_bus: usize,
    pub slack: usize,
}

impl PtdfMatrix {
    #[inline]
    pub fn get(&self, branch: usize, bus: usize) -> f64 {
        self.values[branch][bus]
    }

    pub fn num_branches(&self) -> usize {
        self.values.len()
    }

    /// Sensitivity of branch ℓ to a unit transfer injected at `from` and
    /// withdrawn at `to`.
    #[inline]
    pub fn transfer(&self, branch: usize, from: usize, to: usize) -> f64 {
        self.values[branch][from] - self.values[branch][to]
    }

    /// Base-case flows for a reduced nodal injection pattern (one value per
    /// bus, slack entry ignored).
    pub fn flows(&self, injections: &[f64]) -> Vec<f64> {
        self.values
            .iter()
            .map(|row| {
                row.iter()
                    .zip(injections)
                    .map(|(phi, p)| phi * p)
                    .sum::<f64>()
            })
            .collect()
    }
}

/// LODF matrix: flow redistribution factors for single-branch outages.
#[derive(Debug, Clone)]
pub struct LodfMatrix {
    /// values[monitored][outaged]; diagonal and bridge columns are zero
    pub values: Vec<Vec<f64>>,
    /// false where outaging the branch would island the system; such
    /// branches are excluded from contingency analysis entirely
    pub contingent: Vec<bool>,
}

impl LodfMatrix {
    #[inline]
    pub fn get(&self, monitored: usize, outaged: usize) -> f64 {
        self.values[monitored][outaged]
    }

    pub fn num_branches(&self) -> usize {
        self.values.len()
    }

    /// Estimate post-contingency flow on the monitored branch after the
    /// outaged branch trips.
    #[inline]
    pub fn post_outage_flow(
        &self,
        monitored: usize,
        outaged: usize,
        flow_monitored: f64,
        flow_outaged: f64,
    ) -> f64 {
        flow_monitored + self.values[monitored][outaged] * flow_outaged
    }
}

/// Self-sensitivity denominators below this threshold mark a bridge.
const BRIDGE_TOL: f64 = 1e-9;

/// Computes Φ and Λ for a [`NetworkModel`] at a given capacity addition
/// vector, factoring the reduced weighted Laplacian once.
pub struct PowerTransferKernel;

impl PowerTransferKernel {
    /// Compute both matrices at the impedance-defining capacity `x_br`.
    pub fn compute(
        model: &NetworkModel,
        x_br: &[f64],
    ) -> Result<(PtdfMatrix, LodfMatrix), SensitivityError> {
        let ptdf = Self::compute_ptdf(model, x_br)?;
        let lodf = Self::compute_lodf(model, &ptdf);
        Ok((ptdf, lodf))
    }

    /// Compute the PTDF matrix.
    ///
    /// Algorithm:
    /// 1. Build the susceptance-weighted Laplacian with the slack row and
    ///    column removed (symmetric positive definite when connected)
    /// 2. Factor once, solve for X = L⁻¹, extend with a zero slack row/col
    /// 3. For each branch ℓ from bus f to bus t with susceptance b_ℓ:
    ///    `PTDF[ℓ,n] = b_ℓ · (X[f,n] − X[t,n])`
    pub fn compute_ptdf(
        model: &NetworkModel,
        x_br: &[f64],
    ) -> Result<PtdfMatrix, SensitivityError> {
        let n_bus = model.n_bus;
        let n_branch = model.n_branches();
        if n_bus < 2 {
            return Err(SensitivityError::TooFewBuses);
        }
        if n_branch == 0 {
            return Err(SensitivityError::NoBranches);
        }
        if x_br.len() != n_branch {
            return Err(SensitivityError::DimensionMismatch(x_br.len(), n_branch));
        }

        let susceptance = model.susceptance(x_br);

        // Reduced index map skipping the slack bus
        let reduced: Vec<Option<usize>> = {
            let mut map = vec![None; n_bus];
            let mut next = 0;
            for (bus, slot) in map.iter_mut().enumerate() {
                if bus != model.slack {
                    *slot = Some(next);
                    next += 1;
                }
            }
            map
        };
        let m = n_bus - 1;

        // Sparse assembly, then a dense factorization. Dense is fine for
        // the few-hundred-bus models this engine targets; the assembly
        // stays sparse so a sparse Cholesky can slot in for larger cases.
        let mut triplets = TriMat::new((m, m));
        for j in 0..n_branch {
            let b = susceptance[j];
            let f = reduced[model.branch_from[j]];
            let t = reduced[model.branch_to[j]];
            if let Some(fi) = f {
                triplets.add_triplet(fi, fi, b);
            }
            if let Some(ti) = t {
                triplets.add_triplet(ti, ti, b);
            }
            if let (Some(fi), Some(ti)) = (f, t) {
                triplets.add_triplet(fi, ti, -b);
                triplets.add_triplet(ti, fi, -b);
            }
        }
        let laplacian: sprs::CsMat<f64> = triplets.to_csr();

        let mut dense = Mat::<f64>::zeros(m, m);
        for (value, (i, j)) in laplacian.iter() {
            dense.write(i, j, *value);
        }

        // One factorization, m right-hand sides
        let lu = dense.partial_piv_lu();
        let mut identity = Mat::<f64>::zeros(m, m);
        for i in 0..m {
            identity.write(i, i, 1.0);
        }
        let inverse = lu.solve(&identity);
        for i in 0..m {
            for j in 0..m {
                if !inverse.read(i, j).is_finite() {
                    return Err(SensitivityError::Singular);
                }
            }
        }

        // Extend to full bus space: slack row/column stays zero
        let x_of = |bus: usize, col: usize| -> f64 {
            match (reduced[bus], reduced[col]) {
                (Some(i), Some(j)) => inverse.read(i, j),
                _ => 0.0,
            }
        };

        let mut values = vec![vec![0.0; n_bus]; n_branch];
        for j in 0..n_branch {
            let (f, t) = (model.branch_from[j], model.branch_to[j]);
            let b = susceptance[j];
            for bus in 0..n_bus {
                values[j][bus] = b * (x_of(f, bus) - x_of(t, bus));
            }
        }

        Ok(PtdfMatrix {
            values,
            n_bus,
            slack: model.slack,
        })
    }

    /// Compute the LODF matrix from a PTDF matrix.
    ///
    /// `LODF[ℓ,m] = PTDF_transfer[ℓ, f_m→t_m] / (1 − PTDF_transfer[m, f_m→t_m])`
    ///
    /// where (f_m, t_m) are the terminal buses of branch m. A denominator
    /// within `BRIDGE_TOL` of zero means the branch is a bridge: its column
    /// is zeroed and it is marked non-contingent. Branches the topology
    /// already classifies as bridges are masked the same way.
    pub fn compute_lodf(model: &NetworkModel, ptdf: &PtdfMatrix) -> LodfMatrix {
        let n = ptdf.num_branches();
        let mut values = vec![vec![0.0; n]; n];
        let mut contingent = vec![true; n];

        for m_idx in 0..n {
            let (f, t) = (model.branch_from[m_idx], model.branch_to[m_idx]);
            let self_transfer = ptdf.transfer(m_idx, f, t);
            let denom = 1.0 - self_transfer;
            if !model.non_bridge[m_idx] || denom.abs() < BRIDGE_TOL {
                contingent[m_idx] = false;
                continue;
            }
            for l_idx in 0..n {
                if l_idx == m_idx {
                    continue;
                }
                values[l_idx][m_idx] = ptdf.transfer(l_idx, f, t) / denom;
            }
        }

        LodfMatrix { values, contingent }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cep_core::{
        Branch, BranchId, Bus, BusId, Edge, Kilovolts, Megawatts, Network, Node, PerUnit,
    };

    fn build(edges: &[(usize, usize, f64)], n: usize) -> NetworkModel {
        let mut network = Network::new();
        let nodes: Vec<_> = (0..n)
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
        for (id, &(a, b, chi)) in edges.iter().enumerate() {
            network.graph.add_edge(
                nodes[a],
                nodes[b],
                Edge::Branch(Branch::new(
                    BranchId::new(id),
                    format!("br{}", id),
                    BusId::new(a),
                    BusId::new(b),
                    Megawatts(100.0),
                    PerUnit(chi),
                )),
            );
        }
        NetworkModel::compile(&network).unwrap()
    }

    fn triangle() -> NetworkModel {
        build(&[(0, 1, 0.1), (1, 2, 0.1), (0, 2, 0.1)], 3)
    }

    #[test]
    fn test_slack_column_is_zero() {
        let model = triangle();
        let ptdf = PowerTransferKernel::compute_ptdf(&model, &[0.0; 3]).unwrap();
        for j in 0..3 {
            assert!(ptdf.get(j, 0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_ptdf_nodal_conservation() {
        // A unit injection at bus k (withdrawn at slack) must leave bus k
        // with net flow 1 and pass through intermediate buses untouched.
        let model = triangle();
        let ptdf = PowerTransferKernel::compute_ptdf(&model, &[0.0; 3]).unwrap();

        for k in 1..3 {
            for bus in 0..3 {
                let mut net_out = 0.0;
                for j in 0..3 {
                    if model.branch_from[j] == bus {
                        net_out += ptdf.get(j, k);
                    }
                    if model.branch_to[j] == bus {
                        net_out -= ptdf.get(j, k);
                    }
                }
                let expected = if bus == k {
                    1.0
                } else if bus == model.slack {
                    -1.0
                } else {
                    0.0
                };
                assert!(
                    (net_out - expected).abs() < 1e-9,
                    "bus {} for injection at {}: {} vs {}",
                    bus,
                    k,
                    net_out,
                    expected
                );
            }
        }
    }

    #[test]
    fn test_equal_impedance_triangle_split() {
        // Injection at bus 2: two-thirds flows on the direct slack-2 branch,
        // one third takes the two-hop path.
        let model = triangle();
        let ptdf = PowerTransferKernel::compute_ptdf(&model, &[0.0; 3]).unwrap();

        // A withdrawal of 60 MW at bus 2 (supplied from the slack) pulls
        // 40 MW over the direct branch and 20 MW over each two-hop leg.
        let flows = ptdf.flows(&[0.0, 0.0, -60.0]);
        assert!((flows[2] - 40.0).abs() < 1e-6);
        assert!((flows[0] - 20.0).abs() < 1e-6);
        assert!((flows[1] - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_lodf_diagonal_and_range() {
        let model = triangle();
        let (_ptdf, lodf) = PowerTransferKernel::compute(&model, &[0.0; 3]).unwrap();
        for j in 0..3 {
            assert_eq!(lodf.get(j, j), 0.0);
            assert!(lodf.contingent[j]);
        }
    }

    #[test]
    fn test_lodf_matches_reduced_network() {
        // Post-outage flows predicted by LODF must equal the base-case flows
        // of the network with the branch physically removed.
        let model = triangle();
        let (ptdf, lodf) = PowerTransferKernel::compute(&model, &[0.0; 3]).unwrap();
        let injections = vec![0.0, 25.0, -60.0];
        let base = ptdf.flows(&injections);

        // Outage branch 1 (1-2); remaining network: br0 (0-1), br2 (0-2)
        let reduced = build(&[(0, 1, 0.1), (0, 2, 0.1)], 3);
        let reduced_ptdf = PowerTransferKernel::compute_ptdf(&reduced, &[0.0; 2]).unwrap();
        let reduced_flows = reduced_ptdf.flows(&injections);

        let post0 = lodf.post_outage_flow(0, 1, base[0], base[1]);
        let post2 = lodf.post_outage_flow(2, 1, base[2], base[1]);
        assert!((post0 - reduced_flows[0]).abs() < 1e-6);
        assert!((post2 - reduced_flows[1]).abs() < 1e-6);
    }

    #[test]
    fn test_bridge_column_zeroed() {
        // Triangle plus a spur: the spur branch is a bridge
        let model = build(&[(0, 1, 0.1), (1, 2, 0.1), (0, 2, 0.1), (2, 3, 0.2)], 4);
        let (_, lodf) = PowerTransferKernel::compute(&model, &[0.0; 4]).unwrap();
        assert!(!lodf.contingent[3]);
        for l in 0..4 {
            assert_eq!(lodf.get(l, 3), 0.0);
        }
        // Triangle branches remain contingent
        assert!(lodf.contingent[0] && lodf.contingent[1] && lodf.contingent[2]);
    }

    #[test]
    fn test_capacity_addition_shifts_flow() {
        // Reinforcing br2 (0-2) lowers its impedance and attracts flow
        let model = triangle();
        let before = PowerTransferKernel::compute_ptdf(&model, &[0.0, 0.0, 0.0]).unwrap();
        let after = PowerTransferKernel::compute_ptdf(&model, &[0.0, 0.0, 100.0]).unwrap();
        let flow_before = before.flows(&[0.0, 0.0, -60.0])[2].abs();
        let flow_after = after.flows(&[0.0, 0.0, -60.0])[2].abs();
        assert!(flow_after > flow_before);
    }
}
