//! Compiled index-space network model.
//!
//! The planning engine never works on the graph directly: a [`NetworkModel`]
//! is compiled once per solve, re-indexing every element to contiguous
//! integers sorted by ID, extracting capacity/impedance arrays, locating the
//! slack bus, and classifying bridge branches. The compiled model is
//! immutable and shared read-only across scenario workers.

use crate::problem::{CapacityDims, CapacityLimits, InvestmentCosts};
use cep_core::{find_ac_bridges, find_islands, BusId, Edge, Network, Node};
use sprs::{CsMat, TriMat};
use std::collections::HashMap;
use thiserror::Error;

/// Errors from network compilation
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Network has no buses")]
    NoBuses,

    #[error("No bus is marked slack")]
    MissingSlack,

    #[error("More than one bus is marked slack (first two: {0}, {1})")]
    MultipleSlack(String, String),

    #[error("Duplicate {kind} id on '{name}'")]
    DuplicateId { kind: &'static str, name: String },

    #[error("{kind} '{name}' references unknown bus id {bus}")]
    DanglingEndpoint {
        kind: &'static str,
        name: String,
        bus: usize,
    },

    #[error("Branch '{0}' has non-positive impedance")]
    NonPositiveImpedance(String),

    #[error("{kind} '{name}' has negative capacity")]
    NegativeCapacity { kind: &'static str, name: String },

    #[error("Network is disconnected: {islands} islands (e.g. around bus '{sample}')")]
    Disconnected { islands: usize, sample: String },
}

/// Immutable index-space view of the topology.
///
/// Element order is ascending by ID within each kind; `slack` is the bus
/// index of the reference bus. `non_bridge[j]` marks branches eligible for
/// contingency analysis: outaging a bridge islands the system and the
/// remaining model is infeasible by construction, so bridges are excluded.
#[derive(Debug, Clone)]
pub struct NetworkModel {
    pub n_bus: usize,
    pub slack: usize,
    pub bus_names: Vec<String>,

    pub branch_from: Vec<usize>,
    pub branch_to: Vec<usize>,
    /// Existing thermal capacity `w_br` (MW)
    pub branch_capacity: Vec<f64>,
    /// Nominal impedance `χ₀` (per-unit)
    pub branch_impedance: Vec<f64>,
    pub branch_expansion_max: Vec<f64>,
    pub branch_capex: Vec<f64>,
    pub branch_names: Vec<String>,
    pub non_bridge: Vec<bool>,

    pub hvdc_from: Vec<usize>,
    pub hvdc_to: Vec<usize>,
    pub hvdc_capacity: Vec<f64>,

    pub gen_bus: Vec<usize>,
    pub gen_existing: Vec<f64>,
    pub gen_ramp: Vec<f64>,
    pub gen_emissions: Vec<f64>,
    pub gen_expansion_max: Vec<f64>,
    pub gen_capex: Vec<f64>,
    pub gen_names: Vec<String>,

    pub storage_bus: Vec<usize>,
    pub storage_power: Vec<f64>,
    pub storage_energy: Vec<f64>,
    pub storage_power_expansion_max: Vec<f64>,
    pub storage_energy_expansion_max: Vec<f64>,
    pub storage_power_capex: Vec<f64>,
    pub storage_energy_capex: Vec<f64>,
    pub storage_efficiency: Vec<f64>,
    pub storage_soc: Vec<f64>,
    pub storage_names: Vec<String>,

    pub load_bus: Vec<usize>,
    pub load_names: Vec<String>,
}

impl NetworkModel {
    /// Compile a network graph into index space, validating structure along
    /// the way. Out-of-service branches are dropped.
    pub fn compile(network: &Network) -> Result<Self, ModelError> {
        // Buses first: everything else references them
        let mut buses: Vec<&cep_core::Bus> = network
            .graph
            .node_weights()
            .filter_map(|node| match node {
                Node::Bus(bus) => Some(bus),
                _ => None,
            })
            .collect();
        if buses.is_empty() {
            return Err(ModelError::NoBuses);
        }
        buses.sort_by_key(|bus| bus.id);

        let mut bus_index: HashMap<BusId, usize> = HashMap::new();
        for (idx, bus) in buses.iter().enumerate() {
            if bus_index.insert(bus.id, idx).is_some() {
                return Err(ModelError::DuplicateId {
                    kind: "bus",
                    name: bus.name.clone(),
                });
            }
        }

        let mut slack: Option<usize> = None;
        for (idx, bus) in buses.iter().enumerate() {
            if bus.slack {
                if let Some(prev) = slack {
                    return Err(ModelError::MultipleSlack(
                        buses[prev].name.clone(),
                        bus.name.clone(),
                    ));
                }
                slack = Some(idx);
            }
        }
        let slack = slack.ok_or(ModelError::MissingSlack)?;

        let resolve = |kind: &'static str, name: &str, bus: BusId| {
            bus_index
                .get(&bus)
                .copied()
                .ok_or(ModelError::DanglingEndpoint {
                    kind,
                    name: name.to_string(),
                    bus: bus.value(),
                })
        };

        // AC branches and HVDC links
        let mut branches = Vec::new();
        let mut hvdc = Vec::new();
        for edge in network.graph.edge_weights() {
            match edge {
                Edge::Branch(branch) if branch.status => branches.push(branch),
                Edge::Branch(_) => {}
                Edge::Hvdc(link) => hvdc.push(link),
            }
        }
        branches.sort_by_key(|branch| branch.id);
        hvdc.sort_by_key(|link| link.id);

        let mut branch_from = Vec::with_capacity(branches.len());
        let mut branch_to = Vec::with_capacity(branches.len());
        let mut branch_capacity = Vec::with_capacity(branches.len());
        let mut branch_impedance = Vec::with_capacity(branches.len());
        let mut branch_expansion_max = Vec::with_capacity(branches.len());
        let mut branch_capex = Vec::with_capacity(branches.len());
        let mut branch_names = Vec::with_capacity(branches.len());
        {
            let mut seen = HashMap::new();
            for branch in &branches {
                if seen.insert(branch.id, ()).is_some() {
                    return Err(ModelError::DuplicateId {
                        kind: "branch",
                        name: branch.name.clone(),
                    });
                }
                if branch.impedance.value() <= 0.0 {
                    return Err(ModelError::NonPositiveImpedance(branch.name.clone()));
                }
                if branch.capacity.value() < 0.0 || branch.expansion_max.value() < 0.0 {
                    return Err(ModelError::NegativeCapacity {
                        kind: "branch",
                        name: branch.name.clone(),
                    });
                }
                branch_from.push(resolve("branch", &branch.name, branch.from_bus)?);
                branch_to.push(resolve("branch", &branch.name, branch.to_bus)?);
                branch_capacity.push(branch.capacity.value());
                branch_impedance.push(branch.impedance.value());
                branch_expansion_max.push(branch.expansion_max.value());
                branch_capex.push(branch.capex_per_mw);
                branch_names.push(branch.name.clone());
            }
        }

        let mut hvdc_from = Vec::with_capacity(hvdc.len());
        let mut hvdc_to = Vec::with_capacity(hvdc.len());
        let mut hvdc_capacity = Vec::with_capacity(hvdc.len());
        for link in &hvdc {
            if link.capacity.value() < 0.0 {
                return Err(ModelError::NegativeCapacity {
                    kind: "hvdc link",
                    name: link.name.clone(),
                });
            }
            hvdc_from.push(resolve("hvdc link", &link.name, link.from_bus)?);
            hvdc_to.push(resolve("hvdc link", &link.name, link.to_bus)?);
            hvdc_capacity.push(link.capacity.value());
        }

        // Generators, storage, loads
        let mut gens: Vec<&cep_core::Gen> = network
            .graph
            .node_weights()
            .filter_map(|node| match node {
                Node::Gen(gen) => Some(gen),
                _ => None,
            })
            .collect();
        gens.sort_by_key(|gen| gen.id);

        let mut gen_bus = Vec::with_capacity(gens.len());
        let mut gen_existing = Vec::with_capacity(gens.len());
        let mut gen_ramp = Vec::with_capacity(gens.len());
        let mut gen_emissions = Vec::with_capacity(gens.len());
        let mut gen_expansion_max = Vec::with_capacity(gens.len());
        let mut gen_capex = Vec::with_capacity(gens.len());
        let mut gen_names = Vec::with_capacity(gens.len());
        for gen in &gens {
            if gen.existing.value() < 0.0 || gen.expansion_max.value() < 0.0 {
                return Err(ModelError::NegativeCapacity {
                    kind: "generator",
                    name: gen.name.clone(),
                });
            }
            gen_bus.push(resolve("generator", &gen.name, gen.bus)?);
            gen_existing.push(gen.existing.value());
            gen_ramp.push(gen.ramp_fraction);
            gen_emissions.push(gen.emissions_per_mwh);
            gen_expansion_max.push(gen.expansion_max.value());
            gen_capex.push(gen.capex_per_mw);
            gen_names.push(gen.name.clone());
        }

        let mut storages: Vec<&cep_core::Storage> = network
            .graph
            .node_weights()
            .filter_map(|node| match node {
                Node::Storage(storage) => Some(storage),
                _ => None,
            })
            .collect();
        storages.sort_by_key(|storage| storage.id);

        let mut storage_bus = Vec::with_capacity(storages.len());
        let mut storage_power = Vec::with_capacity(storages.len());
        let mut storage_energy = Vec::with_capacity(storages.len());
        let mut storage_power_expansion_max = Vec::with_capacity(storages.len());
        let mut storage_energy_expansion_max = Vec::with_capacity(storages.len());
        let mut storage_power_capex = Vec::with_capacity(storages.len());
        let mut storage_energy_capex = Vec::with_capacity(storages.len());
        let mut storage_efficiency = Vec::with_capacity(storages.len());
        let mut storage_soc = Vec::with_capacity(storages.len());
        let mut storage_names = Vec::with_capacity(storages.len());
        for storage in &storages {
            if storage.power.value() < 0.0 || storage.energy.value() < 0.0 {
                return Err(ModelError::NegativeCapacity {
                    kind: "storage",
                    name: storage.name.clone(),
                });
            }
            storage_bus.push(resolve("storage", &storage.name, storage.bus)?);
            storage_power.push(storage.power.value());
            storage_energy.push(storage.energy.value());
            storage_power_expansion_max.push(storage.power_expansion_max.value());
            storage_energy_expansion_max.push(storage.energy_expansion_max.value());
            storage_power_capex.push(storage.power_capex_per_mw);
            storage_energy_capex.push(storage.energy_capex_per_mwh);
            storage_efficiency.push(storage.efficiency);
            storage_soc.push(storage.soc_fraction);
            storage_names.push(storage.name.clone());
        }

        let mut loads: Vec<&cep_core::Load> = network
            .graph
            .node_weights()
            .filter_map(|node| match node {
                Node::Load(load) => Some(load),
                _ => None,
            })
            .collect();
        loads.sort_by_key(|load| load.id);

        let mut load_bus = Vec::with_capacity(loads.len());
        let mut load_names = Vec::with_capacity(loads.len());
        for load in &loads {
            load_bus.push(resolve("load", &load.name, load.bus)?);
            load_names.push(load.name.clone());
        }

        // Connectivity: a disconnected graph makes the reduced Laplacian
        // singular, so reject it here with a topological diagnosis.
        let islands = find_islands(network).map_err(|_| ModelError::NoBuses)?;
        if islands.len() > 1 {
            return Err(ModelError::Disconnected {
                islands: islands.len(),
                sample: islands[1].sample_bus.clone(),
            });
        }

        // Bridge classification for contingency eligibility
        let bridges = find_ac_bridges(network).map_err(|_| ModelError::NoBuses)?;
        let non_bridge: Vec<bool> = branches
            .iter()
            .map(|branch| !bridges.contains(&branch.id))
            .collect();

        Ok(Self {
            n_bus: buses.len(),
            slack,
            bus_names: buses.iter().map(|bus| bus.name.clone()).collect(),
            branch_from,
            branch_to,
            branch_capacity,
            branch_impedance,
            branch_expansion_max,
            branch_capex,
            branch_names,
            non_bridge,
            hvdc_from,
            hvdc_to,
            hvdc_capacity,
            gen_bus,
            gen_existing,
            gen_ramp,
            gen_emissions,
            gen_expansion_max,
            gen_capex,
            gen_names,
            storage_bus,
            storage_power,
            storage_energy,
            storage_power_expansion_max,
            storage_energy_expansion_max,
            storage_power_capex,
            storage_energy_capex,
            storage_efficiency,
            storage_soc,
            storage_names,
            load_bus,
            load_names,
        })
    }

    pub fn n_branches(&self) -> usize {
        self.branch_from.len()
    }

    pub fn n_hvdc(&self) -> usize {
        self.hvdc_from.len()
    }

    pub fn n_gens(&self) -> usize {
        self.gen_bus.len()
    }

    pub fn n_storages(&self) -> usize {
        self.storage_bus.len()
    }

    pub fn n_loads(&self) -> usize {
        self.load_bus.len()
    }

    /// Capacity decision layout for this topology and scenario count.
    pub fn dims(&self, n_scenarios: usize) -> CapacityDims {
        CapacityDims {
            gens: self.n_gens(),
            storages: self.n_storages(),
            branches: self.n_branches(),
            scenarios: n_scenarios,
        }
    }

    /// Signed incidence matrix A (n × b): column j has −1 at the from-bus
    /// row and +1 at the to-bus row.
    pub fn incidence(&self) -> CsMat<f64> {
        let mut triplets = TriMat::new((self.n_bus, self.n_branches()));
        for j in 0..self.n_branches() {
            triplets.add_triplet(self.branch_from[j], j, -1.0);
            triplets.add_triplet(self.branch_to[j], j, 1.0);
        }
        triplets.to_csr()
    }

    /// Effective impedance under the impedance-feedback rule
    /// `χ_j(x) = χ₀_j · w_j / (w_j + x_br[j])`.
    ///
    /// A branch with zero existing capacity keeps its nominal impedance
    /// (the feedback factor w/(w+x) is undefined at w = 0).
    pub fn effective_impedance(&self, x_br: &[f64]) -> Vec<f64> {
        (0..self.n_branches())
            .map(|j| {
                let w = self.branch_capacity[j];
                let chi0 = self.branch_impedance[j];
                if w <= 0.0 {
                    chi0
                } else {
                    chi0 * w / (w + x_br[j])
                }
            })
            .collect()
    }

    /// Branch susceptances `1/χ_j(x)` at the given capacity additions.
    pub fn susceptance(&self, x_br: &[f64]) -> Vec<f64> {
        self.effective_impedance(x_br)
            .iter()
            .map(|chi| 1.0 / chi)
            .collect()
    }

    /// Annualized investment cost vector for this topology.
    pub fn investment_costs(&self, emissions_price: f64, n_scenarios: usize) -> InvestmentCosts {
        InvestmentCosts {
            gen: self.gen_capex.clone(),
            storage_power: self.storage_power_capex.clone(),
            storage_energy: self.storage_energy_capex.clone(),
            branch: self.branch_capex.clone(),
            emissions: vec![emissions_price; n_scenarios],
        }
    }

    /// Capacity bounds for this topology plus the emissions policy.
    pub fn capacity_limits(
        &self,
        emissions_cap: f64,
        per_scenario: Option<&[f64]>,
        n_scenarios: usize,
    ) -> CapacityLimits {
        let emissions = match per_scenario {
            Some(caps) => caps.to_vec(),
            None => vec![emissions_cap; n_scenarios],
        };
        CapacityLimits {
            gen: self.gen_expansion_max.clone(),
            storage_power: self.storage_power_expansion_max.clone(),
            storage_energy: self.storage_energy_expansion_max.clone(),
            branch: self.branch_expansion_max.clone(),
            emissions,
            emissions_total: emissions_cap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cep_core::{
        Branch, BranchId, Bus, BusId, Gen, GenId, Kilovolts, Load, LoadId, Megawatts, PerUnit,
    };

    fn triangle() -> Network {
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
        for (id, (a, b)) in [(0, 1), (1, 2), (0, 2)].iter().enumerate() {
            network.graph.add_edge(
                nodes[*a],
                nodes[*b],
                Edge::Branch(Branch::new(
                    BranchId::new(id),
                    format!("br{}", id),
                    BusId::new(*a),
                    BusId::new(*b),
                    Megawatts(50.0),
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

    #[test]
    fn test_compile_triangle() {
        let model = NetworkModel::compile(&triangle()).unwrap();
        assert_eq!(model.n_bus, 3);
        assert_eq!(model.n_branches(), 3);
        assert_eq!(model.slack, 0);
        assert_eq!(model.gen_bus, vec![0]);
        assert_eq!(model.load_bus, vec![2]);
        assert!(model.non_bridge.iter().all(|&nb| nb));
    }

    #[test]
    fn test_incidence_signs() {
        let model = NetworkModel::compile(&triangle()).unwrap();
        let a = model.incidence();
        // Branch 0: bus0 → bus1
        assert_eq!(a.get(0, 0), Some(&-1.0));
        assert_eq!(a.get(1, 0), Some(&1.0));
        // Each column sums to zero
        for j in 0..3 {
            let col_sum: f64 = (0..3).map(|i| a.get(i, j).copied().unwrap_or(0.0)).sum();
            assert_eq!(col_sum, 0.0);
        }
    }

    #[test]
    fn test_impedance_feedback() {
        let model = NetworkModel::compile(&triangle()).unwrap();
        let nominal = model.effective_impedance(&[0.0, 0.0, 0.0]);
        assert!((nominal[0] - 0.1).abs() < 1e-12);

        // Doubling capacity halves the impedance
        let reinforced = model.effective_impedance(&[50.0, 0.0, 0.0]);
        assert!((reinforced[0] - 0.05).abs() < 1e-12);
        assert!((reinforced[1] - 0.1).abs() < 1e-12);

        let b = model.susceptance(&[50.0, 0.0, 0.0]);
        assert!((b[0] - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_slack_rejected() {
        let mut network = triangle();
        for node in network.graph.node_weights_mut() {
            if let Node::Bus(bus) = node {
                bus.slack = false;
            }
        }
        assert!(matches!(
            NetworkModel::compile(&network),
            Err(ModelError::MissingSlack)
        ));
    }

    #[test]
    fn test_dangling_generator_rejected() {
        let mut network = triangle();
        network.graph.add_node(Node::Gen(Gen::new(
            GenId::new(1),
            "ghost".to_string(),
            BusId::new(99),
        )));
        let err = NetworkModel::compile(&network).unwrap_err();
        assert!(err.to_string().contains("ghost"));
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn test_zero_impedance_rejected() {
        let mut network = triangle();
        for edge in network.graph.edge_weights_mut() {
            if let Edge::Branch(branch) = edge {
                branch.impedance = PerUnit(0.0);
            }
        }
        assert!(matches!(
            NetworkModel::compile(&network),
            Err(ModelError::NonPositiveImpedance(_))
        ));
    }

    #[test]
    fn test_disconnected_rejected() {
        let mut network = triangle();
        network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(7),
            name: "island".to_string(),
            ..Bus::default()
        }));
        let err = NetworkModel::compile(&network).unwrap_err();
        assert!(matches!(err, ModelError::Disconnected { islands: 2, .. }));
    }
}
