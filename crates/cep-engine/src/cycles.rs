//! Minimal fundamental cycle basis of the AC branch graph.
//!
//! The operational LP expresses Kirchhoff's voltage law without bus angle
//! variables: for every basis cycle, the impedance-weighted signed sum of
//! branch flows around the cycle is zero. The sparser the basis, the fewer
//! nonzeros in T × n_c KVL rows, so each fundamental cycle is shortened by
//! the integer program
//!
//! ```text
//! minimize Σ_j v_j
//! s.t.     Σ_κ C[κ,j] · w_κ = 2u_j + v_j   for all branches j
//!          w ∈ {0,1}^{n_c}, w_κ̂ = 1, u integer, v binary
//! ```
//!
//! i.e. find the lightest mod-2 combination of basis cycles that still
//! contains cycle κ̂ (which keeps the replacement linearly independent of
//! the others). Because `u` and `v` are determined by `w`, the IP reduces
//! to a minimum-weight search over the 2^(n_c−1) member coset, which is
//! enumerated exactly for moderate n_c and by a bounded combination search
//! beyond that.

use crate::network::NetworkModel;
use thiserror::Error;

/// Errors from cycle basis construction and validation
#[derive(Debug, Error)]
pub enum CycleBasisError {
    #[error("Cycle basis has rank {got}, expected {expected}")]
    RankDeficient { expected: usize, got: usize },

    #[error("Cycle {0} is not closed under the incidence matrix")]
    OpenCycle(usize),

    #[error("Cycle {0} touches branch {1} with odd degree at a bus")]
    OddDegree(usize, usize),
}

/// Exhaustive coset enumeration is used up to this cycle-space dimension;
/// beyond it, combinations of at most three companion cycles are tried.
const EXACT_ENUMERATION_LIMIT: usize = 20;

/// Edge subset of the branch graph as a bitset.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EdgeSet {
    blocks: Vec<u64>,
    n_edges: usize,
}

impl EdgeSet {
    fn new(n_edges: usize) -> Self {
        Self {
            blocks: vec![0; n_edges.div_ceil(64)],
            n_edges,
        }
    }

    fn insert(&mut self, j: usize) {
        self.blocks[j / 64] ^= 1u64 << (j % 64);
    }

    fn contains(&self, j: usize) -> bool {
        self.blocks[j / 64] >> (j % 64) & 1 == 1
    }

    fn xor_assign(&mut self, other: &EdgeSet) {
        for (a, b) in self.blocks.iter_mut().zip(&other.blocks) {
            *a ^= b;
        }
    }

    fn weight(&self) -> usize {
        self.blocks.iter().map(|b| b.count_ones() as usize).sum()
    }

    fn is_empty(&self) -> bool {
        self.blocks.iter().all(|&b| b == 0)
    }

    fn ones(&self) -> Vec<usize> {
        (0..self.n_edges).filter(|&j| self.contains(j)).collect()
    }
}

/// A signed cycle basis D ∈ {−1, 0, 1}^{n_c × b}.
///
/// Row c gives the orientation of each branch around basis cycle c; the KVL
/// row for period t is `Σ_j D[c,j] · χ_j · p_br[t,j] = 0`.
#[derive(Debug, Clone)]
pub struct CycleBasis {
    pub rows: Vec<Vec<i8>>,
}

impl CycleBasis {
    pub fn n_cycles(&self) -> usize {
        self.rows.len()
    }

    /// Total number of branch memberships across all cycles.
    pub fn total_length(&self) -> usize {
        self.rows
            .iter()
            .map(|row| row.iter().filter(|&&d| d != 0).count())
            .sum()
    }

    /// Build a minimal cycle basis: fundamental cycles from a depth-first
    /// spanning tree rooted at the slack bus, then one shortening pass over
    /// every cycle, then orientation and validation.
    pub fn build(model: &NetworkModel) -> Result<Self, CycleBasisError> {
        let n_c = model.n_branches() + 1 - model.n_bus;
        let mut supports = fundamental_supports(model);
        debug_assert_eq!(supports.len(), n_c);

        shorten_supports(&mut supports);

        let rows = supports
            .iter()
            .map(|support| orient_support(model, support))
            .collect::<Vec<_>>();

        let basis = Self { rows };
        basis.validate(model)?;
        Ok(basis)
    }

    /// Check the defining invariants: every entry in {−1, 0, 1} by
    /// construction, every row a circulation (D·Aᵀ = 0 row-wise), and rank
    /// equal to b − n + 1.
    pub fn validate(&self, model: &NetworkModel) -> Result<(), CycleBasisError> {
        for (c, row) in self.rows.iter().enumerate() {
            let mut net = vec![0i32; model.n_bus];
            for (j, &d) in row.iter().enumerate() {
                if d != 0 {
                    net[model.branch_from[j]] -= d as i32;
                    net[model.branch_to[j]] += d as i32;
                }
            }
            if net.iter().any(|&v| v != 0) {
                return Err(CycleBasisError::OpenCycle(c));
            }
        }

        let expected = model.n_branches() + 1 - model.n_bus;
        let got = gf2_rank(
            self.rows
                .iter()
                .map(|row| {
                    let mut set = EdgeSet::new(model.n_branches());
                    for (j, &d) in row.iter().enumerate() {
                        if d != 0 {
                            set.insert(j);
                        }
                    }
                    set
                })
                .collect(),
        );
        if got != expected {
            return Err(CycleBasisError::RankDeficient { expected, got });
        }
        Ok(())
    }
}

/// Fundamental cycle supports from a depth-first spanning tree rooted at
/// the slack bus: each non-tree branch closes a unique cycle through the
/// tree, obtained as the symmetric difference of the two root paths plus
/// the branch itself.
fn fundamental_supports(model: &NetworkModel) -> Vec<EdgeSet> {
    let b = model.n_branches();
    let mut adjacency: Vec<Vec<(usize, usize)>> = vec![Vec::new(); model.n_bus];
    for j in 0..b {
        adjacency[model.branch_from[j]].push((model.branch_to[j], j));
        adjacency[model.branch_to[j]].push((model.branch_from[j], j));
    }

    // Iterative DFS from the slack; parent_edge[v] is the tree branch used
    // to reach v.
    let mut parent: Vec<Option<(usize, usize)>> = vec![None; model.n_bus]; // (bus, branch)
    let mut visited = vec![false; model.n_bus];
    let mut tree_edge = vec![false; b];
    let mut stack = vec![model.slack];
    visited[model.slack] = true;
    while let Some(v) = stack.pop() {
        for &(w, j) in &adjacency[v] {
            if !visited[w] {
                visited[w] = true;
                parent[w] = Some((v, j));
                tree_edge[j] = true;
                stack.push(w);
            }
        }
    }

    let path_to_root = |mut bus: usize| -> EdgeSet {
        let mut path = EdgeSet::new(b);
        while let Some((up, j)) = parent[bus] {
            path.insert(j);
            bus = up;
        }
        path
    };

    let mut supports = Vec::new();
    for j in 0..b {
        if tree_edge[j] {
            continue;
        }
        let mut support = path_to_root(model.branch_from[j]);
        support.xor_assign(&path_to_root(model.branch_to[j]));
        support.insert(j);
        supports.push(support);
    }
    supports
}

/// One improvement pass: for each cycle κ̂, search its coset (all mod-2
/// combinations with the other cycles that include κ̂) for a strictly
/// lighter member and replace in place if one exists.
fn shorten_supports(supports: &mut [EdgeSet]) {
    let n_c = supports.len();
    if n_c < 2 {
        return;
    }

    for kappa in 0..n_c {
        let others: Vec<usize> = (0..n_c).filter(|&k| k != kappa).collect();
        let mut best = supports[kappa].clone();

        let mut consider = |mask_members: &[usize], best: &mut EdgeSet| {
            let mut candidate = supports[kappa].clone();
            for &k in mask_members {
                candidate.xor_assign(&supports[k]);
            }
            if !candidate.is_empty() && candidate.weight() < best.weight() {
                *best = candidate;
            }
        };

        if others.len() <= EXACT_ENUMERATION_LIMIT {
            for mask in 1u64..(1u64 << others.len()) {
                let members: Vec<usize> = others
                    .iter()
                    .enumerate()
                    .filter(|(bit, _)| mask >> bit & 1 == 1)
                    .map(|(_, &k)| k)
                    .collect();
                consider(&members, &mut best);
            }
        } else {
            // Screening budget: pairs and triples of companions
            for a in 0..others.len() {
                consider(&[others[a]], &mut best);
                for b in (a + 1)..others.len() {
                    consider(&[others[a], others[b]], &mut best);
                    for c in (b + 1)..others.len() {
                        consider(&[others[a], others[b], others[c]], &mut best);
                    }
                }
            }
        }

        supports[kappa] = best;
    }
}

/// Assign ±1 orientations to a cycle support by walking an Eulerian circuit
/// of each connected component. Every vertex of an even subgraph has even
/// degree, so the circuit exists, and orienting each edge in traversal
/// direction yields in-degree = out-degree at every vertex, which is
/// exactly the circulation property the KVL rows need.
fn orient_support(model: &NetworkModel, support: &EdgeSet) -> Vec<i8> {
    let b = model.n_branches();
    let mut row = vec![0i8; b];

    let mut incident: Vec<Vec<(usize, usize)>> = vec![Vec::new(); model.n_bus];
    for j in support.ones() {
        incident[model.branch_from[j]].push((model.branch_to[j], j));
        incident[model.branch_to[j]].push((model.branch_from[j], j));
    }

    let mut used = vec![false; b];
    for j in support.ones() {
        if used[j] {
            continue;
        }
        // Hierholzer walk starting anywhere on this component
        let mut stack = vec![model.branch_from[j]];
        while let Some(&v) = stack.last() {
            let next = incident[v].iter().find(|&&(_, e)| !used[e]).copied();
            match next {
                Some((w, e)) => {
                    used[e] = true;
                    row[e] = if model.branch_from[e] == v { 1 } else { -1 };
                    stack.push(w);
                }
                None => {
                    stack.pop();
                }
            }
        }
    }
    row
}

/// Rank of a set of edge subsets over GF(2).
fn gf2_rank(mut sets: Vec<EdgeSet>) -> usize {
    let mut rank = 0;
    let n_edges = sets.first().map(|s| s.n_edges).unwrap_or(0);
    for pivot in 0..n_edges {
        let Some(pos) = (rank..sets.len()).find(|&r| sets[r].contains(pivot)) else {
            continue;
        };
        sets.swap(rank, pos);
        let pivot_row = sets[rank].clone();
        for (r, set) in sets.iter_mut().enumerate() {
            if r != rank && set.contains(pivot) {
                set.xor_assign(&pivot_row);
            }
        }
        rank += 1;
        if rank == sets.len() {
            break;
        }
    }
    rank
}
