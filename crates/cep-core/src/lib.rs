//! # cep-core: Transmission Planning Core Model
//!
//! Provides the fundamental data structures and graph-based network model for
//! capacity expansion planning.
//!
//! ## Design Philosophy
//!
//! Networks are modeled as **undirected multigraphs** where:
//! - **Nodes**: Buses, Generators, Storage devices, Loads
//! - **Edges**: AC branches and HVDC links
//!
//! This graph-based approach enables:
//! - Fast topological queries (connectivity, island and bridge detection)
//! - Type-safe element access with newtype IDs
//! - Support for parallel circuits between the same pair of buses
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cep_core::*;
//!
//! let mut network = Network::new();
//!
//! let b1 = network.graph.add_node(Node::Bus(Bus {
//!     id: BusId::new(0),
//!     name: "north".to_string(),
//!     base_kv: Kilovolts(345.0),
//!     slack: true,
//!     ..Bus::default()
//! }));
//! let b2 = network.graph.add_node(Node::Bus(Bus {
//!     id: BusId::new(1),
//!     name: "south".to_string(),
//!     base_kv: Kilovolts(345.0),
//!     ..Bus::default()
//! }));
//!
//! network.graph.add_node(Node::Gen(
//!     Gen::new(GenId::new(0), "ccgt_north".to_string(), BusId::new(0))
//!         .with_existing(Megawatts(400.0)),
//! ));
//!
//! network.graph.add_edge(
//!     b1,
//!     b2,
//!     Edge::Branch(Branch {
//!         id: BranchId::new(0),
//!         name: "north_south".to_string(),
//!         from_bus: BusId::new(0),
//!         to_bus: BusId::new(1),
//!         capacity: Megawatts(300.0),
//!         impedance: PerUnit(0.08),
//!         ..Branch::default()
//!     }),
//! );
//! ```
//!
//! ## Core Data Structures
//!
//! - [`Network`] - The main network container (petgraph `UnGraph<Node, Edge>`)
//! - [`Node`] - Enum for Bus, Gen, Storage, Load elements
//! - [`Edge`] - Enum for AC Branch and HVDC link connections
//! - Type-safe IDs: [`BusId`], [`BranchId`], [`HvdcId`], [`GenId`],
//!   [`StorageId`], [`LoadId`]
//!
//! The engine crate compiles a [`Network`] into contiguous index space
//! (incidence matrix, capacity and impedance arrays) before optimization;
//! the graph itself is never mutated during a solve.

use petgraph::prelude::*;
use serde::{Deserialize, Serialize};

pub mod error;
pub mod graph_utils;
pub mod units;

pub use error::{CepError, CepResult};
pub use graph_utils::*;
pub use petgraph::graph::NodeIndex;
pub use units::{Kilovolts, MegawattHours, Megawatts, PerUnit};

// Newtype wrappers for IDs for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HvdcId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageId(usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoadId(usize);

impl BusId {
    #[inline]
    pub fn new(value: usize) -> Self {
        BusId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

impl BranchId {
    #[inline]
    pub fn new(value: usize) -> Self {
        BranchId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

impl HvdcId {
    #[inline]
    pub fn new(value: usize) -> Self {
        HvdcId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

impl GenId {
    #[inline]
    pub fn new(value: usize) -> Self {
        GenId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

impl StorageId {
    #[inline]
    pub fn new(value: usize) -> Self {
        StorageId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

impl LoadId {
    #[inline]
    pub fn new(value: usize) -> Self {
        LoadId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

// Basic component structs
#[derive(Debug, Clone)]
pub struct Bus {
    pub id: BusId,
    pub name: String,
    /// Nominal voltage in kilovolts
    pub base_kv: Kilovolts,
    /// Reference bus for the DC angle model; exactly one per network
    pub slack: bool,
    /// Optional geographic tag
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            id: BusId(0),
            name: String::new(),
            base_kv: Kilovolts(0.0),
            slack: false,
            latitude: None,
            longitude: None,
        }
    }
}

/// AC transmission line or transformer.
///
/// The (from, to) pair fixes an arbitrary reference orientation used by the
/// incidence matrix and the sign convention of flows. AC branches participate
/// in KVL and are contingency-eligible unless they are bridges.
#[derive(Debug, Clone)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    pub from_bus: BusId,
    pub to_bus: BusId,
    /// Nominal thermal capacity (the existing rating `w`)
    pub capacity: Megawatts,
    /// Nominal series impedance on the system base
    pub impedance: PerUnit,
    /// Voltage class
    pub voltage_kv: Kilovolts,
    /// Upper bound on capacity addition along this corridor
    pub expansion_max: Megawatts,
    /// Annualized investment cost ($/MW/yr)
    pub capex_per_mw: f64,
    /// Operational status flag
    pub status: bool,
}

impl Default for Branch {
    fn default() -> Self {
        Self {
            id: BranchId(0),
            name: String::new(),
            from_bus: BusId(0),
            to_bus: BusId(0),
            capacity: Megawatts(0.0),
            impedance: PerUnit(0.0),
            voltage_kv: Kilovolts(0.0),
            expansion_max: Megawatts(0.0),
            capex_per_mw: 0.0,
            status: true,
        }
    }
}

impl Branch {
    pub fn new(
        id: BranchId,
        name: String,
        from_bus: BusId,
        to_bus: BusId,
        capacity: Megawatts,
        impedance: PerUnit,
    ) -> Self {
        Self {
            id,
            name,
            from_bus,
            to_bus,
            capacity,
            impedance,
            ..Self::default()
        }
    }

    /// Allow capacity expansion up to `max` at the given annualized cost.
    pub fn with_expansion(mut self, max: Megawatts, capex_per_mw: f64) -> Self {
        self.expansion_max = max;
        self.capex_per_mw = capex_per_mw;
        self
    }
}

/// High-voltage DC link: flow is a free decision variable bounded by
/// capacity, no KVL participation, never contingent, no expansion.
#[derive(Debug, Clone)]
pub struct HvdcLink {
    pub id: HvdcId,
    pub name: String,
    pub from_bus: BusId,
    pub to_bus: BusId,
    pub capacity: Megawatts,
}

#[derive(Debug, Clone)]
pub struct Gen {
    pub id: GenId,
    pub name: String,
    pub bus: BusId,
    /// Technology tag (e.g. "wind", "ccgt")
    pub tech: String,
    /// Existing capacity `w_g`
    pub existing: Megawatts,
    /// Upper bound on capacity addition
    pub expansion_max: Megawatts,
    /// Ramp limit per period as a fraction of total capacity
    pub ramp_fraction: f64,
    /// Emissions intensity (tons/MWh)
    pub emissions_per_mwh: f64,
    /// Annualized investment cost ($/MW/yr)
    pub capex_per_mw: f64,
}

impl Gen {
    pub fn new(id: GenId, name: String, bus: BusId) -> Self {
        Self {
            id,
            name,
            bus,
            tech: String::new(),
            existing: Megawatts(0.0),
            expansion_max: Megawatts(0.0),
            ramp_fraction: 1.0,
            emissions_per_mwh: 0.0,
            capex_per_mw: 0.0,
        }
    }

    pub fn with_existing(mut self, existing: Megawatts) -> Self {
        self.existing = existing;
        self
    }

    pub fn with_expansion(mut self, max: Megawatts, capex_per_mw: f64) -> Self {
        self.expansion_max = max;
        self.capex_per_mw = capex_per_mw;
        self
    }

    pub fn with_tech(mut self, tech: impl Into<String>) -> Self {
        self.tech = tech.into();
        self
    }

    pub fn with_ramp(mut self, fraction: f64) -> Self {
        self.ramp_fraction = fraction;
        self
    }

    pub fn with_emissions(mut self, tons_per_mwh: f64) -> Self {
        self.emissions_per_mwh = tons_per_mwh;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Storage {
    pub id: StorageId,
    pub name: String,
    pub bus: BusId,
    /// Existing power capacity `w_es_p`
    pub power: Megawatts,
    /// Existing energy capacity `w_es_e`
    pub energy: MegawattHours,
    /// Upper bound on power capacity addition
    pub power_expansion_max: Megawatts,
    /// Upper bound on energy capacity addition
    pub energy_expansion_max: MegawattHours,
    /// One-way charge/discharge efficiency η, applied symmetrically in the
    /// state-of-charge dynamics (round trip is η²)
    pub efficiency: f64,
    /// Initial and terminal state-of-charge fraction γ_es
    pub soc_fraction: f64,
    /// Annualized investment cost for power capacity ($/MW/yr)
    pub power_capex_per_mw: f64,
    /// Annualized investment cost for energy capacity ($/MWh/yr)
    pub energy_capex_per_mwh: f64,
}

impl Storage {
    pub fn new(id: StorageId, name: String, bus: BusId) -> Self {
        Self {
            id,
            name,
            bus,
            power: Megawatts(0.0),
            energy: MegawattHours(0.0),
            power_expansion_max: Megawatts(0.0),
            energy_expansion_max: MegawattHours(0.0),
            efficiency: 0.90,
            soc_fraction: 0.50,
            power_capex_per_mw: 0.0,
            energy_capex_per_mwh: 0.0,
        }
    }

    pub fn with_existing(mut self, power: Megawatts, energy: MegawattHours) -> Self {
        self.power = power;
        self.energy = energy;
        self
    }

    pub fn with_expansion(
        mut self,
        power_max: Megawatts,
        energy_max: MegawattHours,
        power_capex_per_mw: f64,
        energy_capex_per_mwh: f64,
    ) -> Self {
        self.power_expansion_max = power_max;
        self.energy_expansion_max = energy_max;
        self.power_capex_per_mw = power_capex_per_mw;
        self.energy_capex_per_mwh = energy_capex_per_mwh;
        self
    }

    pub fn with_efficiency(mut self, efficiency: f64) -> Self {
        self.efficiency = efficiency;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Load {
    pub id: LoadId,
    pub name: String,
    pub bus: BusId,
}

/// Node types in the network graph
#[derive(Debug, Clone)]
pub enum Node {
    Bus(Bus),
    Gen(Gen),
    Storage(Storage),
    Load(Load),
}

impl Node {
    /// Human-readable label for diagnostics and graph export.
    pub fn label(&self) -> &str {
        match self {
            Node::Bus(bus) => &bus.name,
            Node::Gen(gen) => &gen.name,
            Node::Storage(storage) => &storage.name,
            Node::Load(load) => &load.name,
        }
    }
}

/// Edge types in the network graph
#[derive(Debug, Clone)]
pub enum Edge {
    Branch(Branch),
    Hvdc(HvdcLink),
}

/// Summary counts of network elements.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkStats {
    pub num_buses: usize,
    pub num_branches: usize,
    pub num_hvdc: usize,
    pub num_gens: usize,
    pub num_storage: usize,
    pub num_loads: usize,
}

/// The main network container.
///
/// The `graph` field is public to keep element insertion direct; the
/// planning engine treats a constructed network as immutable.
#[derive(Debug, Clone, Default)]
pub struct Network {
    pub graph: UnGraph<Node, Edge>,
}

impl Network {
    pub fn new() -> Self {
        Self {
            graph: UnGraph::new_undirected(),
        }
    }

    /// Count elements by type.
    pub fn stats(&self) -> NetworkStats {
        let mut stats = NetworkStats::default();
        for node in self.graph.node_weights() {
            match node {
                Node::Bus(_) => stats.num_buses += 1,
                Node::Gen(_) => stats.num_gens += 1,
                Node::Storage(_) => stats.num_storage += 1,
                Node::Load(_) => stats.num_loads += 1,
            }
        }
        for edge in self.graph.edge_weights() {
            match edge {
                Edge::Branch(_) => stats.num_branches += 1,
                Edge::Hvdc(_) => stats.num_hvdc += 1,
            }
        }
        stats
    }

    /// The graph index of the slack bus, if exactly one is marked.
    pub fn slack_bus(&self) -> Option<NodeIndex> {
        let mut found = None;
        for idx in self.graph.node_indices() {
            if let Node::Bus(bus) = &self.graph[idx] {
                if bus.slack {
                    if found.is_some() {
                        return None;
                    }
                    found = Some(idx);
                }
            }
        }
        found
    }
}
