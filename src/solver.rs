//! Picks one strategy per node.
//!
//! [`Solver`] runs a depth-first branch and bound over the vertices left in
//! the cost graph after simplification. Eliminated vertices are recovered
//! from the cost graph's elimination records at every complete assignment,
//! which is also where the memory budget is checked exactly.

use itertools::Itertools;
use serde::Serialize;

use crate::cost_graph::CostGraph;
use crate::error::{AutoShardError, Result};
use crate::graph_analysis::{peak_memory, LiveStage, MemoryTable};
use crate::options::SolverOptions;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Solution {
    /// Strategy index per node, in graph order.
    pub assignment: Vec<usize>,
    pub total_cost: f64,
    pub peak_memory: f64,
    pub iterations: u64,
    /// False when the iteration budget ran out before the search finished.
    pub proven_optimal: bool,
}

struct MemoryBound<'a> {
    budget: f64,
    table: &'a MemoryTable,
    stages: &'a [LiveStage],
    /// Stages each node's output is live in.
    stages_of: Vec<Vec<usize>>,
    stage_lb: Vec<f64>,
    param_lb: f64,
}

impl<'a> MemoryBound<'a> {
    fn new(budget: f64, table: &'a MemoryTable, stages: &'a [LiveStage]) -> Self {
        let n = table.activation.len();
        let mut stages_of = vec![Vec::new(); n];
        let mut stage_lb = Vec::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            let mut lb = 0.0;
            for p in &stage.live {
                stages_of[p.index()].push(i);
                lb += table.min_activation(p.index());
            }
            stage_lb.push(lb);
        }
        let param_lb = (0..n).map(|v| table.min_parameters(v)).sum();
        MemoryBound {
            budget,
            table,
            stages,
            stages_of,
            stage_lb,
            param_lb,
        }
    }

    /// Moves node `v` from its minimum to strategy `s` (or back with `sign = -1`).
    fn shift(&mut self, v: usize, s: usize, sign: f64) {
        let act = self.table.activation[v][s] - self.table.min_activation(v);
        for &stage in &self.stages_of[v] {
            self.stage_lb[stage] += sign * act;
        }
        self.param_lb += sign * (self.table.parameters[v][s] - self.table.min_parameters(v));
    }

    fn violated(&self) -> bool {
        let peak = self.stage_lb.iter().copied().fold(0.0, f64::max);
        self.param_lb + peak > self.budget
    }
}

struct Search<'a> {
    graph: &'a CostGraph,
    /// Remaining vertices, in graph order.
    order: Vec<usize>,
    /// Strategies of `order[k]`, cheapest first.
    ranked: Vec<Vec<usize>>,
    /// Neighbours of `order[k]` that come earlier in `order`.
    earlier: Vec<Vec<usize>>,
    /// Admissible bound on the cost of `order[k..]`.
    suffix_lb: Vec<f64>,
    memory: Option<MemoryBound<'a>>,
    assignment: Vec<usize>,
    best: Option<(f64, Vec<usize>)>,
    iterations: u64,
    max_iterations: u64,
    exhausted: bool,
}

impl<'a> Search<'a> {
    fn new(graph: &'a CostGraph, memory: Option<MemoryBound<'a>>, max_iterations: u64) -> Self {
        let order = graph.alive_nodes();
        let position: Vec<Option<usize>> = {
            let mut position = vec![None; graph.node_count()];
            for (k, &v) in order.iter().enumerate() {
                position[v] = Some(k);
            }
            position
        };
        let ranked = order
            .iter()
            .map(|&v| {
                let costs = graph.node_costs(v);
                (0..costs.len())
                    .sorted_by(|&a, &b| costs[a].total_cmp(&costs[b]).then(a.cmp(&b)))
                    .collect_vec()
            })
            .collect_vec();
        let earlier = order
            .iter()
            .enumerate()
            .map(|(k, &v)| {
                graph
                    .neighbors(v)
                    .filter(|&u| position[u].is_some_and(|pu| pu < k))
                    .collect_vec()
            })
            .collect_vec();

        // every edge is charged to its later endpoint at its cheapest entry
        let node_lb = order
            .iter()
            .zip(&earlier)
            .map(|(&v, earlier)| {
                (0..graph.node_costs(v).len())
                    .map(|s| {
                        graph.node_costs(v)[s]
                            + earlier
                                .iter()
                                .map(|&u| {
                                    (0..graph.node_costs(u).len())
                                        .map(|a| graph.edge_cost(u, a, v, s))
                                        .fold(f64::INFINITY, f64::min)
                                })
                                .sum::<f64>()
                    })
                    .fold(f64::INFINITY, f64::min)
            })
            .collect_vec();
        let mut suffix_lb = vec![0.0; order.len() + 1];
        for k in (0..order.len()).rev() {
            suffix_lb[k] = suffix_lb[k + 1] + node_lb[k];
        }

        Search {
            graph,
            assignment: vec![0; graph.node_count()],
            order,
            ranked,
            earlier,
            suffix_lb,
            memory,
            best: None,
            iterations: 0,
            max_iterations,
            exhausted: false,
        }
    }

    fn step_cost(&self, depth: usize, s: usize) -> f64 {
        let v = self.order[depth];
        self.graph.node_costs(v)[s]
            + self.earlier[depth]
                .iter()
                .map(|&u| self.graph.edge_cost(u, self.assignment[u], v, s))
                .sum::<f64>()
    }

    /// Records a complete assignment if it fits in memory and beats the incumbent.
    fn accept(&mut self, cost: f64) -> Result<()> {
        let total = cost + self.graph.constant();
        if self.best.as_ref().is_some_and(|(best, _)| total >= *best) {
            return Ok(());
        }
        if let Some(memory) = &self.memory {
            let full = self.graph.reconstruct(&self.assignment)?;
            if peak_memory(memory.stages, memory.table, &full) > memory.budget {
                return Ok(());
            }
        }
        self.best = Some((total, self.assignment.clone()));
        Ok(())
    }

    /// Cheapest strategy per vertex given the ones already picked.
    fn greedy(&mut self) -> Result<()> {
        let mut cost = 0.0;
        for depth in 0..self.order.len() {
            let (s, c) = self.ranked[depth]
                .iter()
                .map(|&s| (s, self.step_cost(depth, s)))
                .fold((0, f64::INFINITY), |best, (s, c)| if c < best.1 { (s, c) } else { best });
            self.assignment[self.order[depth]] = s;
            cost += c;
        }
        self.accept(cost)
    }

    fn dfs(&mut self, depth: usize, partial: f64) -> Result<()> {
        if depth == self.order.len() {
            return self.accept(partial);
        }
        let v = self.order[depth];
        for i in 0..self.ranked[depth].len() {
            if self.exhausted {
                return Ok(());
            }
            self.iterations += 1;
            if self.iterations > self.max_iterations {
                self.exhausted = true;
                return Ok(());
            }
            let s = self.ranked[depth][i];
            let cost = partial + self.step_cost(depth, s);
            let bound = cost + self.suffix_lb[depth + 1] + self.graph.constant();
            if self.best.as_ref().is_some_and(|(best, _)| bound >= *best) {
                continue;
            }
            if let Some(memory) = self.memory.as_mut() {
                memory.shift(v, s, 1.0);
                if memory.violated() {
                    memory.shift(v, s, -1.0);
                    continue;
                }
            }
            self.assignment[v] = s;
            self.dfs(depth + 1, cost)?;
            if let Some(memory) = self.memory.as_mut() {
                memory.shift(v, s, -1.0);
            }
        }
        Ok(())
    }
}

pub struct Solver<'a> {
    cost_graph: &'a CostGraph,
    stages: &'a [LiveStage],
    memory: &'a MemoryTable,
    options: &'a SolverOptions,
}

impl<'a> Solver<'a> {
    pub fn new(
        cost_graph: &'a CostGraph,
        stages: &'a [LiveStage],
        memory: &'a MemoryTable,
        options: &'a SolverOptions,
    ) -> Self {
        Solver {
            cost_graph,
            stages,
            memory,
            options,
        }
    }

    pub fn solve(&self) -> Result<Solution> {
        let bound = self
            .options
            .memory_budget
            .map(|budget| MemoryBound::new(budget as f64, self.memory, self.stages));
        let mut search = Search::new(self.cost_graph, bound, self.options.max_iterations);
        tracing::debug!(
            core = search.order.len(),
            eliminated = self.cost_graph.eliminated(),
            "solving"
        );
        search.greedy()?;
        search.assignment.iter_mut().for_each(|s| *s = 0);
        search.dfs(0, 0.0)?;

        let Some((_, core)) = search.best else {
            return Err(AutoShardError::InfeasibleSolution(match self.options.memory_budget {
                Some(budget) if search.exhausted => format!(
                    "no assignment within {} bytes found in {} iterations",
                    budget, self.options.max_iterations
                ),
                Some(budget) => format!("no assignment fits within {} bytes per device", budget),
                None => "search ended without an assignment".to_string(),
            }));
        };
        if search.exhausted {
            tracing::warn!(
                iterations = search.iterations,
                "iteration budget exhausted, returning best assignment found"
            );
        }
        let assignment = self.cost_graph.reconstruct(&core)?;
        let solution = Solution {
            total_cost: self.cost_graph.evaluate(&assignment),
            peak_memory: peak_memory(self.stages, self.memory, &assignment),
            assignment,
            iterations: search.iterations,
            proven_optimal: !search.exhausted,
        };
        tracing::info!(
            cost = solution.total_cost,
            peak_memory = solution.peak_memory,
            iterations = solution.iterations,
            "solved"
        );
        Ok(solution)
    }
}

/// Exhaustive reference solver for tiny graphs. Ignores simplification and
/// scores every combination against the original cost tables.
pub struct DenseSolver;

impl DenseSolver {
    pub fn solve(
        cost_graph: &CostGraph,
        stages: &[LiveStage],
        memory: &MemoryTable,
        memory_budget: Option<u64>,
    ) -> Result<Solution> {
        let lens = cost_graph.node_lens();
        tracing::debug!(combinations = lens.iter().product::<usize>(), "evaluating combinations");
        let mut best: Option<(f64, Vec<usize>)> = None;
        let mut iterations = 0;
        for assignment in lens.iter().map(|&n| 0..n).multi_cartesian_product() {
            iterations += 1;
            let peak = peak_memory(stages, memory, &assignment);
            if memory_budget.is_some_and(|budget| peak > budget as f64) {
                continue;
            }
            let cost = cost_graph.evaluate(&assignment);
            if best.as_ref().map_or(true, |(b, _)| cost < *b) {
                best = Some((cost, assignment));
            }
        }
        let (total_cost, assignment) =
            best.ok_or_else(|| AutoShardError::InfeasibleSolution("no combination fits the budget".to_string()))?;
        Ok(Solution {
            peak_memory: peak_memory(stages, memory, &assignment),
            total_cost,
            assignment,
            iterations,
            proven_optimal: true,
        })
    }
}
