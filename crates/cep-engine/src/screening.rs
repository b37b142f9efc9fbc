//! Lazy contingency screening over a realized dispatch.
//!
//! Materializing every (t, i, j) contingency row up front would grow each
//! scenario LP by T·b² rows. Instead, after every subproblem solve the
//! screener estimates all post-outage flows from the base-case dispatch via
//! LODF, and returns the worst violations for the bundle engine to feed
//! back as new LP rows. Repeated screening across bundle iterations
//! converges to the active contingency set, typically a few hundred rows.

use crate::network::NetworkModel;
use crate::problem::ContingencyKey;
use crate::sensitivity::LodfMatrix;
use rayon::prelude::*;

/// Violations below this magnitude (MW) are noise, not contingencies.
const VIOLATION_TOL: f64 = 1e-6;

/// One screened violation: post-outage flow on the monitored branch
/// exceeds its emergency rating by `magnitude` MW.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub key: ContingencyKey,
    /// Overload δ = |p^c| − η_c·(w_br + x_br) in MW
    pub magnitude: f64,
    /// The estimated post-outage flow itself
    pub post_flow: f64,
}

/// Screens a dispatch against all single-branch outages.
pub struct ContingencyScreener<'a> {
    model: &'a NetworkModel,
    lodf: &'a LodfMatrix,
    /// Post-contingency rating multiplier η_c
    contingency_rating: f64,
    /// Top-K violations returned per call
    budget: usize,
}

impl<'a> ContingencyScreener<'a> {
    pub fn new(
        model: &'a NetworkModel,
        lodf: &'a LodfMatrix,
        contingency_rating: f64,
        budget: usize,
    ) -> Self {
        Self {
            model,
            lodf,
            contingency_rating,
            budget,
        }
    }

    /// Scan every (period, monitored, outaged) triple over non-bridge
    /// branch pairs and return the worst `budget` violations, ordered by
    /// decreasing magnitude with (t, i, j) lexicographic tie-break.
    ///
    /// `flows` is the base-case branch flow per period (T × b);
    /// `x_br` the transmission additions the ratings are evaluated at.
    pub fn screen(&self, flows: &[Vec<f64>], x_br: &[f64]) -> Vec<Violation> {
        let n_br = self.model.n_branches();
        let eta_c = self.contingency_rating;

        let mut violations: Vec<Violation> = flows
            .par_iter()
            .enumerate()
            .flat_map_iter(|(t, period_flows)| {
                let mut found = Vec::new();
                for i in 0..n_br {
                    if !self.lodf.contingent[i] {
                        continue;
                    }
                    let rating = eta_c * (self.model.branch_capacity[i] + x_br[i]);
                    for j in 0..n_br {
                        if j == i || !self.lodf.contingent[j] {
                            continue;
                        }
                        let post = self.lodf.post_outage_flow(
                            i,
                            j,
                            period_flows[i],
                            period_flows[j],
                        );
                        let magnitude = post.abs() - rating;
                        if magnitude > VIOLATION_TOL {
                            found.push(Violation {
                                key: ContingencyKey {
                                    t,
                                    monitored: i,
                                    outaged: j,
                                },
                                magnitude,
                                post_flow: post,
                            });
                        }
                    }
                }
                found
            })
            .collect();

        violations.sort_by(|a, b| {
            b.magnitude
                .partial_cmp(&a.magnitude)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        violations.truncate(self.budget);
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensitivity::PowerTransferKernel;
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
        for (id, &(a, b, cap)) in edges.iter().enumerate() {
            network.graph.add_edge(
                nodes[a],
                nodes[b],
                Edge::Branch(Branch::new(
                    BranchId::new(id),
                    format!("br{}", id),
                    BusId::new(a),
                    BusId::new(b),
                    Megawatts(cap),
                    PerUnit(0.1),
                )),
            );
        }
        NetworkModel::compile(&network).unwrap()
    }

    #[test]
    fn test_finds_triangle_outage_violations() {
        let model = build(&[(0, 1, 50.0), (1, 2, 50.0), (0, 2, 50.0)], 3);
        let (ptdf, lodf) = PowerTransferKernel::compute(&model, &[0.0; 3]).unwrap();
        // 60 MW from the slack to bus 2
        let flows = vec![ptdf.flows(&[0.0, 0.0, -60.0])];

        let screener = ContingencyScreener::new(&model, &lodf, 1.0, 50);
        let violations = screener.screen(&flows, &[0.0; 3]);

        // Any single outage forces the whole 60 MW transfer onto a 50 MW
        // path: the direct branch outage overloads both legs, and either
        // leg outage overloads the direct branch. Four violations of 10 MW.
        assert_eq!(violations.len(), 4);
        for violation in &violations {
            assert!((violation.magnitude - 10.0).abs() < 1e-6);
        }
        // Lexicographic tie-break at equal magnitude
        for pair in violations.windows(2) {
            assert!(pair[0].key < pair[1].key);
        }
    }

    #[test]
    fn test_budget_truncates_worst_first() {
        let model = build(&[(0, 1, 50.0), (1, 2, 50.0), (0, 2, 10.0)], 3);
        let (ptdf, lodf) = PowerTransferKernel::compute(&model, &[0.0; 3]).unwrap();
        let flows = vec![ptdf.flows(&[0.0, 0.0, -60.0])];

        let screener = ContingencyScreener::new(&model, &lodf, 1.0, 1);
        let violations = screener.screen(&flows, &[0.0; 3]);
        assert_eq!(violations.len(), 1);

        let unbudgeted = ContingencyScreener::new(&model, &lodf, 1.0, 100).screen(&flows, &[0.0; 3]);
        assert!(unbudgeted.len() > 1);
        assert_eq!(violations[0], unbudgeted[0]);
    }

    #[test]
    fn test_bridges_never_screened() {
        // Triangle with a loaded spur: the spur is a bridge and must appear
        // neither as monitored nor as outaged branch.
        let model = build(&[(0, 1, 50.0), (1, 2, 50.0), (0, 2, 50.0), (2, 3, 10.0)], 4);
        let (ptdf, lodf) = PowerTransferKernel::compute(&model, &[0.0; 4]).unwrap();
        // Heavy transfer to the spur bus overloads the spur itself
        let flows = vec![ptdf.flows(&[0.0, 0.0, 0.0, -80.0])];

        let screener = ContingencyScreener::new(&model, &lodf, 1.0, 50);
        let violations = screener.screen(&flows, &[0.0; 4]);
        for violation in &violations {
            assert_ne!(violation.key.monitored, 3);
            assert_ne!(violation.key.outaged, 3);
        }
    }

    #[test]
    fn test_expansion_raises_rating() {
        let model = build(&[(0, 1, 50.0), (1, 2, 50.0), (0, 2, 50.0)], 3);
        let (ptdf, lodf) = PowerTransferKernel::compute(&model, &[0.0; 3]).unwrap();
        let flows = vec![ptdf.flows(&[0.0, 0.0, -60.0])];

        // 20 MW of expansion everywhere clears the 10 MW violations
        let screener = ContingencyScreener::new(&model, &lodf, 1.0, 50);
        let violations = screener.screen(&flows, &[20.0, 20.0, 20.0]);
        assert!(violations.is_empty());
    }
}
