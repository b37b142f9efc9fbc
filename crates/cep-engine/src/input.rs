//! Structured ingestion records.
//!
//! External collaborators supply the topology and scenario data as records
//! with opaque string identifiers; the engine re-indexes everything to
//! contiguous integer indices. Matrix columns follow record order: the g-th
//! generator record owns column g of the cost and availability matrices,
//! the d-th load record owns column d of the demand matrix.

use crate::problem::{PlanningProblem, ScenarioData};
use cep_core::{
    Branch, BranchId, Bus, BusId, CepError, CepResult, Gen, GenId, HvdcId, HvdcLink, Kilovolts,
    Load, LoadId, MegawattHours, Megawatts, Network, Node, PerUnit, StorageId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusRecord {
    pub id: String,
    #[serde(default)]
    pub slack: bool,
    pub voltage_kv: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRecord {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    pub capacity_mw: f64,
    pub impedance_pu: f64,
    pub voltage_kv: f64,
    #[serde(default)]
    pub is_hvdc: bool,
    #[serde(default)]
    pub max_expansion_mw: f64,
    #[serde(default)]
    pub annualized_capex_per_mw: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorRecord {
    pub id: String,
    pub bus_id: String,
    pub existing_mw: f64,
    #[serde(default)]
    pub max_expansion_mw: f64,
    #[serde(default = "default_ramp")]
    pub ramp_fraction: f64,
    #[serde(default)]
    pub emissions_per_mwh: f64,
    #[serde(default)]
    pub annualized_capex_per_mw: f64,
    #[serde(default)]
    pub tech_tag: String,
}

fn default_ramp() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRecord {
    pub id: String,
    pub bus_id: String,
    pub existing_power_mw: f64,
    pub existing_energy_mwh: f64,
    #[serde(default)]
    pub max_power_expansion_mw: f64,
    #[serde(default)]
    pub max_energy_expansion_mwh: f64,
    /// One-way charge/discharge efficiency η
    #[serde(default = "default_efficiency")]
    pub efficiency: f64,
    /// Initial and terminal state-of-charge fraction γ_es
    #[serde(default = "default_soc")]
    pub soc_fraction: f64,
    #[serde(default)]
    pub power_capex_per_mw: f64,
    #[serde(default)]
    pub energy_capex_per_mwh: f64,
}

fn default_efficiency() -> f64 {
    0.90
}

fn default_soc() -> f64 {
    0.50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRecord {
    pub id: String,
    pub bus_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioRecord {
    pub id: String,
    pub weight: f64,
    pub horizon: usize,
    /// T × G operating cost ($/MWh)
    pub cost_matrix: Vec<Vec<f64>>,
    /// T × G availability fraction
    pub availability_matrix: Vec<Vec<f64>>,
    /// T × D demand (MW)
    pub demand_matrix: Vec<Vec<f64>>,
    #[serde(default = "default_shed_penalty")]
    pub shed_penalty: f64,
    #[serde(default = "default_violation_penalty")]
    pub violation_penalty: f64,
}

fn default_shed_penalty() -> f64 {
    1.0e4
}

fn default_violation_penalty() -> f64 {
    2.0e3
}

/// Complete system description as supplied by the ingestion collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemRecord {
    pub buses: Vec<BusRecord>,
    pub branches: Vec<BranchRecord>,
    #[serde(default)]
    pub generators: Vec<GeneratorRecord>,
    #[serde(default)]
    pub storage: Vec<StorageRecord>,
    #[serde(default)]
    pub loads: Vec<LoadRecord>,
    pub scenarios: Vec<ScenarioRecord>,
    #[serde(default = "default_reserve_margin")]
    pub reserve_margin: f64,
    #[serde(default = "default_contingency_rating")]
    pub contingency_rating: f64,
    #[serde(default = "default_emissions_cap")]
    pub emissions_cap_total: f64,
    #[serde(default)]
    pub emissions_price_per_ton: f64,
}

fn default_reserve_margin() -> f64 {
    0.15
}

fn default_contingency_rating() -> f64 {
    1.0
}

fn default_emissions_cap() -> f64 {
    f64::INFINITY
}

impl SystemRecord {
    pub fn from_json(text: &str) -> CepResult<Self> {
        serde_json::from_str(text).map_err(|e| CepError::InvalidInput(e.to_string()))
    }

    /// Re-index the records to contiguous integer IDs and assemble the
    /// planning problem. Identifier errors name the offending entity.
    pub fn into_problem(self) -> CepResult<PlanningProblem> {
        let mut network = Network::new();

        let mut bus_lookup: HashMap<String, (BusId, cep_core::NodeIndex)> = HashMap::new();
        for (idx, record) in self.buses.iter().enumerate() {
            if bus_lookup.contains_key(&record.id) {
                return Err(CepError::InvalidInput(format!(
                    "duplicate bus id '{}'",
                    record.id
                )));
            }
            let bus_id = BusId::new(idx);
            let node = network.graph.add_node(Node::Bus(Bus {
                id: bus_id,
                name: record.id.clone(),
                base_kv: Kilovolts(record.voltage_kv),
                slack: record.slack,
                ..Bus::default()
            }));
            bus_lookup.insert(record.id.clone(), (bus_id, node));
        }

        let resolve = |kind: &str, name: &str, bus: &str| -> CepResult<(BusId, cep_core::NodeIndex)> {
            bus_lookup.get(bus).copied().ok_or_else(|| {
                CepError::InvalidInput(format!(
                    "{kind} '{name}' references unknown bus '{bus}'"
                ))
            })
        };

        let mut next_branch = 0;
        let mut next_hvdc = 0;
        for record in &self.branches {
            let (from_id, from_node) = resolve("branch", &record.id, &record.from_id)?;
            let (to_id, to_node) = resolve("branch", &record.id, &record.to_id)?;
            if record.is_hvdc {
                network.graph.add_edge(
                    from_node,
                    to_node,
                    cep_core::Edge::Hvdc(HvdcLink {
                        id: HvdcId::new(next_hvdc),
                        name: record.id.clone(),
                        from_bus: from_id,
                        to_bus: to_id,
                        capacity: Megawatts(record.capacity_mw),
                    }),
                );
                next_hvdc += 1;
            } else {
                let mut branch = Branch::new(
                    BranchId::new(next_branch),
                    record.id.clone(),
                    from_id,
                    to_id,
                    Megawatts(record.capacity_mw),
                    PerUnit(record.impedance_pu),
                );
                branch.voltage_kv = Kilovolts(record.voltage_kv);
                let branch = branch
                    .with_expansion(Megawatts(record.max_expansion_mw), record.annualized_capex_per_mw);
                network.graph.add_edge(from_node, to_node, cep_core::Edge::Branch(branch));
                next_branch += 1;
            }
        }

        for (idx, record) in self.generators.iter().enumerate() {
            let (bus_id, _) = resolve("generator", &record.id, &record.bus_id)?;
            network.graph.add_node(Node::Gen(
                Gen::new(GenId::new(idx), record.id.clone(), bus_id)
                    .with_existing(Megawatts(record.existing_mw))
                    .with_expansion(
                        Megawatts(record.max_expansion_mw),
                        record.annualized_capex_per_mw,
                    )
                    .with_tech(record.tech_tag.clone())
                    .with_ramp(record.ramp_fraction)
                    .with_emissions(record.emissions_per_mwh),
            ));
        }

        for (idx, record) in self.storage.iter().enumerate() {
            let (bus_id, _) = resolve("storage", &record.id, &record.bus_id)?;
            let mut storage = cep_core::Storage::new(StorageId::new(idx), record.id.clone(), bus_id)
                .with_existing(
                    Megawatts(record.existing_power_mw),
                    MegawattHours(record.existing_energy_mwh),
                )
                .with_expansion(
                    Megawatts(record.max_power_expansion_mw),
                    MegawattHours(record.max_energy_expansion_mwh),
                    record.power_capex_per_mw,
                    record.energy_capex_per_mwh,
                )
                .with_efficiency(record.efficiency);
            storage.soc_fraction = record.soc_fraction;
            network.graph.add_node(Node::Storage(storage));
        }

        for (idx, record) in self.loads.iter().enumerate() {
            let (bus_id, _) = resolve("load", &record.id, &record.bus_id)?;
            network.graph.add_node(Node::Load(Load {
                id: LoadId::new(idx),
                name: record.id.clone(),
                bus: bus_id,
            }));
        }

        let scenarios = self
            .scenarios
            .into_iter()
            .map(|record| ScenarioData {
                name: record.id,
                weight: record.weight,
                horizon: record.horizon,
                cost: record.cost_matrix,
                availability: record.availability_matrix,
                demand: record.demand_matrix,
                shed_penalty: record.shed_penalty,
                violation_penalty: record.violation_penalty,
            })
            .collect();

        Ok(PlanningProblem {
            network,
            scenarios,
            reserve_margin: self.reserve_margin,
            contingency_rating: self.contingency_rating,
            emissions_cap: self.emissions_cap_total,
            emissions_cap_per_scenario: None,
            emissions_price: self.emissions_price_per_ton,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkModel;

    fn sample_json() -> &'static str {
        r#"{
            "buses": [
                {"id": "north", "slack": true, "voltage_kv": 345.0},
                {"id": "south", "voltage_kv": 345.0},
                {"id": "east", "voltage_kv": 230.0}
            ],
            "branches": [
                {"id": "n_s", "from_id": "north", "to_id": "south",
                 "capacity_mw": 400.0, "impedance_pu": 0.05, "voltage_kv": 345.0},
                {"id": "s_e", "from_id": "south", "to_id": "east",
                 "capacity_mw": 250.0, "impedance_pu": 0.08, "voltage_kv": 230.0,
                 "max_expansion_mw": 200.0, "annualized_capex_per_mw": 1.0e5},
                {"id": "n_e_dc", "from_id": "north", "to_id": "east",
                 "capacity_mw": 100.0, "impedance_pu": 0.0, "voltage_kv": 230.0,
                 "is_hvdc": true}
            ],
            "generators": [
                {"id": "ccgt", "bus_id": "north", "existing_mw": 500.0,
                 "emissions_per_mwh": 0.35, "tech_tag": "gas"}
            ],
            "storage": [
                {"id": "bess", "bus_id": "south", "existing_power_mw": 50.0,
                 "existing_energy_mwh": 200.0}
            ],
            "loads": [
                {"id": "city", "bus_id": "east"}
            ],
            "scenarios": [
                {"id": "peak", "weight": 1.0, "horizon": 2,
                 "cost_matrix": [[12.0], [14.0]],
                 "availability_matrix": [[1.0], [1.0]],
                 "demand_matrix": [[180.0], [220.0]]}
            ],
            "emissions_cap_total": 1.0e6
        }"#
    }

    #[test]
    fn test_roundtrip_and_reindex() {
        let record = SystemRecord::from_json(sample_json()).unwrap();
        let problem = record.into_problem().unwrap();
        let model = NetworkModel::compile(&problem.network).unwrap();

        assert_eq!(model.n_bus, 3);
        assert_eq!(model.n_branches(), 2); // the HVDC record is not an AC branch
        assert_eq!(model.n_hvdc(), 1);
        assert_eq!(model.n_gens(), 1);
        assert_eq!(model.n_storages(), 1);
        assert_eq!(model.n_loads(), 1);
        assert_eq!(model.slack, 0);
        assert_eq!(model.branch_names, vec!["n_s", "s_e"]);
        assert!((model.branch_expansion_max[1] - 200.0).abs() < 1e-12);
        assert_eq!(problem.scenarios[0].horizon, 2);
        assert!((problem.emissions_cap - 1.0e6).abs() < 1e-3);
    }

    #[test]
    fn test_defaults_applied() {
        let record = SystemRecord::from_json(sample_json()).unwrap();
        assert_eq!(record.reserve_margin, 0.15);
        assert_eq!(record.contingency_rating, 1.0);
        assert_eq!(record.scenarios[0].shed_penalty, 1.0e4);
        assert_eq!(record.scenarios[0].violation_penalty, 2.0e3);
        assert_eq!(record.generators[0].ramp_fraction, 1.0);
        assert_eq!(record.storage[0].efficiency, 0.90);
    }

    #[test]
    fn test_unknown_bus_named_in_error() {
        let mut record = SystemRecord::from_json(sample_json()).unwrap();
        record.loads[0].bus_id = "nowhere".to_string();
        let err = record.into_problem().unwrap_err();
        assert!(err.to_string().contains("'city'"));
        assert!(err.to_string().contains("'nowhere'"));
    }

    #[test]
    fn test_duplicate_bus_rejected() {
        let mut record = SystemRecord::from_json(sample_json()).unwrap();
        record.buses.push(BusRecord {
            id: "north".to_string(),
            slack: false,
            voltage_kv: 345.0,
        });
        let err = record.into_problem().unwrap_err();
        assert!(err.to_string().contains("duplicate bus id"));
    }
}
