//! Pairwise cost graph over strategy choices.
//!
//! Vertices are nodes (by position in graph order), each carrying a cost per
//! strategy. Edges join producers to consumers and carry the resharding cost
//! for every pair of strategies. `simplify_graph` eliminates low-degree
//! vertices exactly, remembering how to recover their choice.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rayon::prelude::*;

use crate::device_mesh::DeviceMesh;
use crate::error::{AutoShardError, Result};
use crate::graph::NodeId;
use crate::shape_consistency::plan_conversion;
use crate::sharding::ShardingSpec;
use crate::strategy::StrategiesVector;

/// Row-major `rows x cols` table, rows indexing the lower vertex's strategies.
#[derive(Clone, Debug, PartialEq)]
pub struct EdgeCost {
    rows: usize,
    cols: usize,
    costs: Vec<f64>,
}

impl EdgeCost {
    fn zeros(rows: usize, cols: usize) -> Self {
        EdgeCost {
            rows,
            cols,
            costs: vec![0.0; rows * cols],
        }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.costs[row * self.cols + col]
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    fn add(&mut self, other: &EdgeCost) {
        for (c, o) in self.costs.iter_mut().zip(&other.costs) {
            *c += o;
        }
    }

    pub fn min(&self) -> f64 {
        self.costs.iter().copied().fold(f64::INFINITY, f64::min)
    }
}

#[derive(Clone, Debug)]
enum Elimination {
    Isolated { node: usize, choice: usize },
    /// `choice[a]` for each strategy `a` of `neighbor`.
    Leaf { node: usize, neighbor: usize, choice: Vec<usize> },
    /// `choice[a * |right| + c]` for strategies `a` of `left` and `c` of `right`.
    Series {
        node: usize,
        left: usize,
        right: usize,
        right_len: usize,
        choice: Vec<usize>,
    },
}

fn argmin(values: impl Iterator<Item = f64>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (i, v) in values.enumerate() {
        // strict: ties go to the lowest index
        if v < best.1 {
            best = (i, v);
        }
    }
    best
}

#[derive(Clone, Debug)]
pub struct CostGraph {
    node_costs: Vec<Vec<f64>>,
    edges: BTreeMap<(usize, usize), EdgeCost>,
    adjacency: Vec<BTreeSet<usize>>,
    alive: Vec<bool>,
    constant: f64,
    eliminations: Vec<Elimination>,
    original_node_costs: Vec<Vec<f64>>,
    original_edges: BTreeMap<(usize, usize), EdgeCost>,
}

fn edge_table(
    producer: &StrategiesVector,
    consumer: &StrategiesVector,
    operand: &str,
    mesh: &DeviceMesh,
    forward_only: bool,
) -> Result<EdgeCost> {
    let element_bytes = consumer
        .mapping()
        .get(operand)
        .map(|d| d.dtype.size_in_bytes())
        .unwrap_or(4);
    let missing = |node: NodeId, key: &str| {
        AutoShardError::IncompatibleLayout(format!("node {} has a strategy without a '{}' spec", node.index(), key))
    };
    let mut cache: HashMap<(&ShardingSpec, &ShardingSpec), f64> = HashMap::new();
    let mut table = EdgeCost::zeros(producer.len(), consumer.len());
    for (a, produced) in producer.iter().enumerate() {
        let src = produced.spec("output").ok_or_else(|| missing(producer.node(), "output"))?;
        for (b, consumed) in consumer.iter().enumerate() {
            let dst = consumed.spec(operand).ok_or_else(|| missing(consumer.node(), operand))?;
            let cost = match cache.get(&(src, dst)) {
                Some(&cost) => cost,
                None => {
                    let cost = plan_conversion(src, dst, mesh, element_bytes)?.cost().select(forward_only);
                    cache.insert((src, dst), cost);
                    cost
                }
            };
            table.costs[a * table.cols + b] = cost;
        }
    }
    Ok(table)
}

impl CostGraph {
    /// Builds vertex costs and one edge per producer/consumer pair. A consumer
    /// reading one producer through several operands gets their costs summed.
    pub fn build(strategies: &[StrategiesVector], mesh: &DeviceMesh, forward_only: bool) -> Result<Self> {
        let position: BTreeMap<NodeId, usize> = strategies.iter().enumerate().map(|(i, s)| (s.node(), i)).collect();

        let mut dependencies = Vec::new();
        for (consumer, vector) in strategies.iter().enumerate() {
            for (operand, _, src) in vector.mapping().arguments() {
                let producer = *position.get(&src).ok_or_else(|| {
                    AutoShardError::Trace(format!("node {} has no strategies", src.index()))
                })?;
                if producer >= consumer {
                    return Err(AutoShardError::Trace(format!(
                        "node {} consumes node {} which comes later",
                        consumer, producer
                    )));
                }
                dependencies.push((producer, consumer, operand.to_string()));
            }
        }

        let tables = dependencies
            .par_iter()
            .map(|(producer, consumer, operand)| {
                edge_table(&strategies[*producer], &strategies[*consumer], operand, mesh, forward_only)
                    .map(|table| ((*producer, *consumer), table))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut edges: BTreeMap<(usize, usize), EdgeCost> = BTreeMap::new();
        let mut adjacency = vec![BTreeSet::new(); strategies.len()];
        for (key, table) in tables {
            adjacency[key.0].insert(key.1);
            adjacency[key.1].insert(key.0);
            match edges.get_mut(&key) {
                Some(existing) => existing.add(&table),
                None => {
                    edges.insert(key, table);
                }
            }
        }

        let node_costs: Vec<Vec<f64>> = strategies
            .iter()
            .map(|v| v.iter().map(|s| s.node_cost(forward_only)).collect())
            .collect();
        tracing::debug!(nodes = node_costs.len(), edges = edges.len(), "built cost graph");
        Ok(CostGraph {
            original_node_costs: node_costs.clone(),
            original_edges: edges.clone(),
            alive: vec![true; node_costs.len()],
            node_costs,
            edges,
            adjacency,
            constant: 0.0,
            eliminations: Vec::new(),
        })
    }

    pub fn node_count(&self) -> usize {
        self.node_costs.len()
    }

    pub fn node_lens(&self) -> Vec<usize> {
        self.node_costs.iter().map(Vec::len).collect()
    }

    pub fn alive_nodes(&self) -> Vec<usize> {
        (0..self.node_count()).filter(|&v| self.alive[v]).collect()
    }

    pub fn is_alive(&self, node: usize) -> bool {
        self.alive[node]
    }

    pub fn node_costs(&self, node: usize) -> &[f64] {
        &self.node_costs[node]
    }

    pub fn neighbors(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.adjacency[node].iter().copied()
    }

    pub fn edge(&self, u: usize, v: usize) -> Option<&EdgeCost> {
        self.edges.get(&(u.min(v), u.max(v)))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Cost on edge `u`-`v` when `u` picks `a` and `v` picks `b`.
    pub fn edge_cost(&self, u: usize, a: usize, v: usize, b: usize) -> f64 {
        Self::lookup(&self.edges, u, a, v, b)
    }

    fn lookup(edges: &BTreeMap<(usize, usize), EdgeCost>, u: usize, a: usize, v: usize, b: usize) -> f64 {
        if u < v {
            edges.get(&(u, v)).map(|e| e.get(a, b)).unwrap_or(0.0)
        } else {
            edges.get(&(v, u)).map(|e| e.get(b, a)).unwrap_or(0.0)
        }
    }

    /// Cost folded out of eliminated vertices.
    pub fn constant(&self) -> f64 {
        self.constant
    }

    pub fn eliminated(&self) -> usize {
        self.eliminations.len()
    }

    fn remove_edge(&mut self, u: usize, v: usize) -> Option<EdgeCost> {
        self.adjacency[u].remove(&v);
        self.adjacency[v].remove(&u);
        self.edges.remove(&(u.min(v), u.max(v)))
    }

    fn eliminate_isolated(&mut self, v: usize) {
        let (choice, cost) = argmin(self.node_costs[v].iter().copied());
        self.constant += cost;
        self.alive[v] = false;
        self.eliminations.push(Elimination::Isolated { node: v, choice });
    }

    fn eliminate_leaf(&mut self, v: usize, u: usize) {
        let mut choice = Vec::with_capacity(self.node_costs[u].len());
        for a in 0..self.node_costs[u].len() {
            let (b, cost) = argmin(
                self.node_costs[v]
                    .iter()
                    .enumerate()
                    .map(|(b, c)| c + self.edge_cost(u, a, v, b)),
            );
            self.node_costs[u][a] += cost;
            choice.push(b);
        }
        self.remove_edge(u, v);
        self.alive[v] = false;
        self.eliminations.push(Elimination::Leaf { node: v, neighbor: u, choice });
    }

    fn eliminate_series(&mut self, v: usize, left: usize, right: usize) {
        let (rows, cols) = (self.node_costs[left].len(), self.node_costs[right].len());
        let mut merged = EdgeCost::zeros(rows, cols);
        let mut choice = Vec::with_capacity(rows * cols);
        for a in 0..rows {
            for c in 0..cols {
                let (b, cost) = argmin(self.node_costs[v].iter().enumerate().map(|(b, cv)| {
                    cv + self.edge_cost(left, a, v, b) + self.edge_cost(v, b, right, c)
                }));
                merged.costs[a * cols + c] = cost;
                choice.push(b);
            }
        }
        self.remove_edge(left, v);
        self.remove_edge(v, right);
        self.adjacency[left].insert(right);
        self.adjacency[right].insert(left);
        match self.edges.get_mut(&(left, right)) {
            Some(existing) => existing.add(&merged),
            None => {
                self.edges.insert((left, right), merged);
            }
        }
        self.alive[v] = false;
        self.eliminations.push(Elimination::Series {
            node: v,
            left,
            right,
            right_len: cols,
            choice,
        });
    }

    /// Eliminates isolated, degree-1 and degree-2 vertices until none remain.
    /// Returns the number of vertices removed. Minimum total cost is preserved.
    pub fn simplify_graph(&mut self) -> usize {
        let before = self.eliminations.len();
        loop {
            let mut changed = false;
            for v in 0..self.node_count() {
                if !self.alive[v] {
                    continue;
                }
                let neighbors: Vec<usize> = self.neighbors(v).collect();
                match neighbors.as_slice() {
                    [] => self.eliminate_isolated(v),
                    [u] => self.eliminate_leaf(v, *u),
                    [u, w] => self.eliminate_series(v, *u, *w),
                    _ => continue,
                }
                changed = true;
            }
            if !changed {
                break;
            }
        }
        let removed = self.eliminations.len() - before;
        tracing::debug!(removed, remaining = self.alive_nodes().len(), "simplified cost graph");
        removed
    }

    /// Expands an assignment of the remaining vertices into a full solution.
    /// Entries of eliminated vertices in `core` are ignored.
    pub fn reconstruct(&self, core: &[usize]) -> Result<Vec<usize>> {
        if core.len() != self.node_count() {
            return Err(AutoShardError::InvalidSolution(format!(
                "expected {} entries, got {}",
                self.node_count(),
                core.len()
            )));
        }
        let mut solution = core.to_vec();
        for elimination in self.eliminations.iter().rev() {
            match elimination {
                Elimination::Isolated { node, choice } => solution[*node] = *choice,
                Elimination::Leaf { node, neighbor, choice } => solution[*node] = choice[solution[*neighbor]],
                Elimination::Series {
                    node,
                    left,
                    right,
                    right_len,
                    choice,
                } => solution[*node] = choice[solution[*left] * right_len + solution[*right]],
            }
        }
        Ok(solution)
    }

    /// Cost of the remaining vertices under `core`, plus the folded constant.
    pub fn core_cost(&self, core: &[usize]) -> f64 {
        let nodes: f64 = self.alive_nodes().iter().map(|&v| self.node_costs[v][core[v]]).sum();
        let edges: f64 = self.edges.iter().map(|(&(u, v), e)| e.get(core[u], core[v])).sum();
        self.constant + nodes + edges
    }

    /// Total cost of a full solution against the unsimplified graph.
    pub fn evaluate(&self, solution: &[usize]) -> f64 {
        let nodes: f64 = self
            .original_node_costs
            .iter()
            .zip(solution)
            .map(|(costs, &s)| costs[s])
            .sum();
        let edges: f64 = self
            .original_edges
            .iter()
            .map(|(&(u, v), e)| e.get(solution[u], solution[v]))
            .sum();
        nodes + edges
    }

    /// Resharding part of a full solution's cost.
    pub fn resharding_cost(&self, solution: &[usize]) -> f64 {
        self.original_edges
            .iter()
            .map(|(&(u, v), e)| e.get(solution[u], solution[v]))
            .sum()
    }
}

impl CostGraph {
    /// A graph straight from cost tables. Edge `(u, v)` needs `u < v` and a
    /// `|u| x |v|` table.
    pub fn from_tables(node_costs: Vec<Vec<f64>>, edges: Vec<((usize, usize), Vec<Vec<f64>>)>) -> Result<Self> {
        let mut adjacency = vec![BTreeSet::new(); node_costs.len()];
        let mut map = BTreeMap::new();
        for ((u, v), rows) in edges {
            let shape_ok = u < v
                && v < node_costs.len()
                && rows.len() == node_costs[u].len()
                && rows.iter().all(|r| r.len() == node_costs[v].len());
            if !shape_ok {
                return Err(AutoShardError::InvalidSolution(format!("malformed edge table ({}, {})", u, v)));
            }
            adjacency[u].insert(v);
            adjacency[v].insert(u);
            map.insert(
                (u, v),
                EdgeCost {
                    rows: node_costs[u].len(),
                    cols: node_costs[v].len(),
                    costs: rows.into_iter().flatten().collect(),
                },
            );
        }
        Ok(CostGraph {
            original_node_costs: node_costs.clone(),
            original_edges: map.clone(),
            alive: vec![true; node_costs.len()],
            node_costs,
            edges: map,
            adjacency,
            constant: 0.0,
            eliminations: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    fn brute_force(graph: &CostGraph) -> f64 {
        graph
            .node_lens()
            .into_iter()
            .map(|n| 0..n)
            .multi_cartesian_product()
            .map(|s| graph.evaluate(&s))
            .fold(f64::INFINITY, f64::min)
    }

    fn chain() -> CostGraph {
        CostGraph::from_tables(
            vec![vec![1.0, 3.0], vec![2.0, 0.5, 4.0], vec![0.0, 1.0]],
            vec![
                ((0, 1), vec![vec![0.0, 5.0, 1.0], vec![2.0, 0.0, 3.0]]),
                ((1, 2), vec![vec![0.0, 1.0], vec![3.0, 0.0], vec![1.0, 1.0]]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_chain_collapses_completely() {
        let mut graph = chain();
        assert_eq!(graph.simplify_graph(), 3);
        assert!(graph.alive_nodes().is_empty());
        let solution = graph.reconstruct(&[0, 0, 0]).unwrap();
        assert!((graph.evaluate(&solution) - brute_force(&graph)).abs() < 1e-9);
        assert!((graph.constant() - brute_force(&graph)).abs() < 1e-9);
    }

    #[test]
    fn test_clique_is_left_alone() {
        let table = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        let mut graph = CostGraph::from_tables(
            vec![vec![0.0, 0.0]; 4],
            (0..4)
                .tuple_combinations()
                .map(|(u, v)| ((u, v), table.clone()))
                .collect(),
        )
        .unwrap();
        assert_eq!(graph.simplify_graph(), 0);
        assert_eq!(graph.alive_nodes().len(), 4);
    }

    #[test]
    fn test_series_merges_into_existing_edge() {
        // triangle: eliminating 0 (degree 2) adds onto edge 1-2
        let mut graph = CostGraph::from_tables(
            vec![vec![0.0, 1.0], vec![0.0, 0.0], vec![0.0, 0.0]],
            vec![
                ((0, 1), vec![vec![0.0, 2.0], vec![2.0, 0.0]]),
                ((0, 2), vec![vec![0.0, 2.0], vec![2.0, 0.0]]),
                ((1, 2), vec![vec![0.0, 1.0], vec![1.0, 0.0]]),
            ],
        )
        .unwrap();
        let optimum = brute_force(&graph);
        graph.simplify_graph();
        let solution = graph.reconstruct(&[0, 0, 0]).unwrap();
        assert!((graph.evaluate(&solution) - optimum).abs() < 1e-9);
    }

    #[test]
    fn test_malformed_table_rejected() {
        let err = CostGraph::from_tables(vec![vec![0.0], vec![0.0, 1.0]], vec![((0, 1), vec![vec![0.0]])]);
        assert!(err.is_err());
    }

    #[test]
    fn test_reconstruct_checks_length() {
        let graph = chain();
        assert!(matches!(
            graph.reconstruct(&[0]),
            Err(AutoShardError::InvalidSolution(_))
        ));
    }
}
