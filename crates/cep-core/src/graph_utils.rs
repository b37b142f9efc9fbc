//! Topological analysis over the bus-branch graph.
//!
//! The planning engine needs two structural facts before any algebra runs:
//! whether the transmission graph is connected (a disconnected graph makes
//! the reduced Laplacian singular), and which AC branches are bridges
//! (outaging a bridge islands the system, so bridges are excluded from
//! contingency screening).

use crate::{BranchId, Edge, Network, Node};
use anyhow::Result;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet, VecDeque};

/// Island summary for connectivity reporting.
#[derive(Debug)]
pub struct IslandSummary {
    pub island_id: usize,
    pub bus_count: usize,
    /// Name of one member bus, for error messages
    pub sample_bus: String,
}

/// Labels connected components of the bus graph (breadth-first search over
/// AC branches and HVDC links). Generator/storage/load nodes attach to buses
/// by reference, not by graph edges, so they are ignored here.
pub fn find_islands(network: &Network) -> Result<Vec<IslandSummary>> {
    let mut visited: HashSet<NodeIndex> = HashSet::new();
    let mut islands = Vec::new();
    let mut island_id = 0;

    for start in network.graph.node_indices() {
        if !matches!(network.graph[start], Node::Bus(_)) || visited.contains(&start) {
            continue;
        }
        let mut queue = VecDeque::new();
        queue.push_back(start);
        let mut members = Vec::new();
        while let Some(node) = queue.pop_front() {
            if !visited.insert(node) {
                continue;
            }
            members.push(node);
            for neighbor in network.graph.neighbors(node) {
                if matches!(network.graph[neighbor], Node::Bus(_)) && !visited.contains(&neighbor)
                {
                    queue.push_back(neighbor);
                }
            }
        }
        islands.push(IslandSummary {
            island_id,
            bus_count: members.len(),
            sample_bus: network.graph[start].label().to_string(),
        });
        island_id += 1;
    }

    Ok(islands)
}

/// Finds bridge branches of the AC transmission graph.
///
/// An AC branch is a bridge when its removal disconnects the bus graph
/// restricted to in-service AC branches. HVDC links do not participate:
/// they carry no KVL and are never outaged, and the Laplacian the
/// sensitivity matrices are built from contains AC branches only.
///
/// Iterative lowlink search; parallel circuits are handled by skipping only
/// the specific edge used to enter a node, so a doubled corridor is never
/// reported as a bridge.
pub fn find_ac_bridges(network: &Network) -> Result<HashSet<BranchId>> {
    // Adjacency restricted to buses and in-service AC branches
    let mut adjacency: HashMap<NodeIndex, Vec<(NodeIndex, usize, BranchId)>> = HashMap::new();
    let mut edge_counter = 0;
    for edge in network.graph.edge_references() {
        if let Edge::Branch(branch) = edge.weight() {
            if !branch.status {
                continue;
            }
            let (u, v) = (edge.source(), edge.target());
            adjacency.entry(u).or_default().push((v, edge_counter, branch.id));
            adjacency.entry(v).or_default().push((u, edge_counter, branch.id));
            edge_counter += 1;
        }
    }

    let mut bridges = HashSet::new();
    let mut disc: HashMap<NodeIndex, usize> = HashMap::new();
    let mut low: HashMap<NodeIndex, usize> = HashMap::new();
    let mut timer = 0;

    for root in network.graph.node_indices() {
        if !matches!(network.graph[root], Node::Bus(_)) || disc.contains_key(&root) {
            continue;
        }

        // Explicit stack of (node, entering edge, next neighbor offset)
        let mut stack: Vec<(NodeIndex, Option<usize>, usize)> = vec![(root, None, 0)];
        disc.insert(root, timer);
        low.insert(root, timer);
        timer += 1;

        while !stack.is_empty() {
            let frame = stack.len() - 1;
            let (node, entering, offset) = stack[frame];
            let neighbors = adjacency.get(&node).map(Vec::as_slice).unwrap_or(&[]);
            if offset < neighbors.len() {
                stack[frame].2 += 1;
                let (next, edge_idx, _) = neighbors[offset];
                if Some(edge_idx) == entering {
                    continue;
                }
                if let Some(&next_disc) = disc.get(&next) {
                    let low_node = low[&node].min(next_disc);
                    low.insert(node, low_node);
                } else {
                    disc.insert(next, timer);
                    low.insert(next, timer);
                    timer += 1;
                    stack.push((next, Some(edge_idx), 0));
                }
            } else {
                stack.pop();
                if let Some(&(parent, _, _)) = stack.last() {
                    let low_child = low[&node];
                    let low_parent = low[&parent].min(low_child);
                    low.insert(parent, low_parent);
                    if low_child > disc[&parent] {
                        // The entering edge of `node` is a bridge; recover it
                        if let Some(edge_idx) = entering {
                            if let Some(branch_id) = adjacency[&node]
                                .iter()
                                .find(|(_, e, _)| *e == edge_idx)
                                .map(|(_, _, id)| *id)
                            {
                                bridges.insert(branch_id);
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(bridges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Branch, Bus, BusId, Kilovolts, Megawatts, PerUnit};

    fn add_bus(network: &mut Network, id: usize, slack: bool) -> NodeIndex {
        network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(id),
            name: format!("bus{}", id),
            base_kv: Kilovolts(230.0),
            slack,
            ..Bus::default()
        }))
    }

    fn add_branch(network: &mut Network, id: usize, from: NodeIndex, to: NodeIndex) {
        let from_id = match &network.graph[from] {
            Node::Bus(b) => b.id,
            _ => unreachable!(),
        };
        let to_id = match &network.graph[to] {
            Node::Bus(b) => b.id,
            _ => unreachable!(),
        };
        network.graph.add_edge(
            from,
            to,
            Edge::Branch(Branch::new(
                BranchId::new(id),
                format!("br{}", id),
                from_id,
                to_id,
                Megawatts(100.0),
                PerUnit(0.1),
            )),
        );
    }

    #[test]
    fn test_single_island() {
        let mut network = Network::new();
        let b0 = add_bus(&mut network, 0, true);
        let b1 = add_bus(&mut network, 1, false);
        let b2 = add_bus(&mut network, 2, false);
        add_branch(&mut network, 0, b0, b1);
        add_branch(&mut network, 1, b1, b2);

        let islands = find_islands(&network).unwrap();
        assert_eq!(islands.len(), 1);
        assert_eq!(islands[0].bus_count, 3);
    }

    #[test]
    fn test_disconnected_buses_form_islands() {
        let mut network = Network::new();
        let b0 = add_bus(&mut network, 0, true);
        let b1 = add_bus(&mut network, 1, false);
        add_bus(&mut network, 2, false); // isolated
        add_branch(&mut network, 0, b0, b1);

        let islands = find_islands(&network).unwrap();
        assert_eq!(islands.len(), 2);
    }

    #[test]
    fn test_triangle_has_no_bridges() {
        let mut network = Network::new();
        let b0 = add_bus(&mut network, 0, true);
        let b1 = add_bus(&mut network, 1, false);
        let b2 = add_bus(&mut network, 2, false);
        add_branch(&mut network, 0, b0, b1);
        add_branch(&mut network, 1, b1, b2);
        add_branch(&mut network, 2, b0, b2);

        let bridges = find_ac_bridges(&network).unwrap();
        assert!(bridges.is_empty());
    }

    #[test]
    fn test_spur_branch_is_bridge() {
        let mut network = Network::new();
        let b0 = add_bus(&mut network, 0, true);
        let b1 = add_bus(&mut network, 1, false);
        let b2 = add_bus(&mut network, 2, false);
        let b3 = add_bus(&mut network, 3, false);
        add_branch(&mut network, 0, b0, b1);
        add_branch(&mut network, 1, b1, b2);
        add_branch(&mut network, 2, b0, b2);
        add_branch(&mut network, 3, b2, b3); // spur

        let bridges = find_ac_bridges(&network).unwrap();
        assert_eq!(bridges.len(), 1);
        assert!(bridges.contains(&BranchId::new(3)));
    }

    #[test]
    fn test_parallel_circuit_is_not_bridge() {
        let mut network = Network::new();
        let b0 = add_bus(&mut network, 0, true);
        let b1 = add_bus(&mut network, 1, false);
        add_branch(&mut network, 0, b0, b1);
        add_branch(&mut network, 1, b0, b1); // parallel circuit

        let bridges = find_ac_bridges(&network).unwrap();
        assert!(bridges.is_empty());
    }

    #[test]
    fn test_chain_all_bridges() {
        let mut network = Network::new();
        let b0 = add_bus(&mut network, 0, true);
        let b1 = add_bus(&mut network, 1, false);
        let b2 = add_bus(&mut network, 2, false);
        add_branch(&mut network, 0, b0, b1);
        add_branch(&mut network, 1, b1, b2);

        let bridges = find_ac_bridges(&network).unwrap();
        assert_eq!(bridges.len(), 2);
    }
}
