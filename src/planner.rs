//! End-to-end planning: strategies, cost graph, solve, then the runtime passes.

use serde::Serialize;

use crate::constructor::StrategiesConstructor;
use crate::cost_graph::CostGraph;
use crate::device_mesh::DeviceMesh;
use crate::error::Result;
use crate::graph::ComputationGraph;
use crate::graph_analysis::{GraphAnalyser, MemoryTable};
use crate::handlers::HandlerRegistry;
use crate::options::SolverOptions;
use crate::passes::{apply, prepare, PreparedGraph, ShardedGraph};
use crate::solver::{Solution, Solver};
use crate::strategy::StrategiesVector;

pub struct Plan<'g> {
    pub strategies: Vec<StrategiesVector>,
    pub solution: Solution,
    pub prepared: PreparedGraph<'g>,
    pub sharded: ShardedGraph,
    /// Whether the solution came from the simplified cost graph.
    pub simplified: bool,
}

pub fn plan<'g>(
    graph: &'g ComputationGraph,
    mesh: &DeviceMesh,
    registry: &HandlerRegistry,
    options: &SolverOptions,
) -> Result<Plan<'g>> {
    let strategies = StrategiesConstructor::new(graph, mesh, registry).build_strategies_and_cost()?;
    let stages = GraphAnalyser::new(graph).liveness_analysis();
    let memory = MemoryTable::new(&strategies, mesh, options.forward_only);
    let cost_graph = CostGraph::build(&strategies, mesh, options.forward_only)?;

    let (solution, simplified) = if options.simplify {
        let mut reduced = cost_graph.clone();
        reduced.simplify_graph();
        match Solver::new(&reduced, &stages, &memory, options).solve() {
            Ok(solution) => (solution, true),
            // eliminated vertices were fixed without regard to memory
            Err(e) if e.is_retryable() && options.memory_budget.is_some() => {
                tracing::warn!(error = %e, "retrying without graph simplification");
                (Solver::new(&cost_graph, &stages, &memory, options).solve()?, false)
            }
            Err(e) => return Err(e),
        }
    } else {
        (Solver::new(&cost_graph, &stages, &memory, options).solve()?, false)
    };

    let prepared = prepare(graph, &strategies, &solution.assignment, mesh)?;
    let sharded = apply(&prepared);
    Ok(Plan {
        strategies,
        solution,
        prepared,
        sharded,
        simplified,
    })
}

#[derive(Debug, Serialize)]
pub struct NodeReport {
    pub name: String,
    pub family: String,
    pub strategy: String,
    pub candidates: usize,
    pub cost_us: f64,
}

#[derive(Debug, Serialize)]
pub struct ReshardReport {
    pub tensor: String,
    pub consumer: String,
    pub operand: String,
    pub from: String,
    pub to: String,
    pub steps: Vec<String>,
    pub cost_us: f64,
}

/// Name-keyed summary of a plan for printing and JSON dumps.
#[derive(Debug, Serialize)]
pub struct PlanReport {
    pub mesh: Vec<usize>,
    pub total_cost_us: f64,
    pub peak_memory_bytes: f64,
    pub estimated_time_us: f64,
    pub iterations: u64,
    pub proven_optimal: bool,
    pub simplified: bool,
    pub nodes: Vec<NodeReport>,
    pub reshards: Vec<ReshardReport>,
}

impl PlanReport {
    pub fn new(plan: &Plan<'_>, mesh: &DeviceMesh, forward_only: bool) -> Self {
        let graph = plan.prepared.graph();
        let nodes = plan
            .strategies
            .iter()
            .filter_map(|vector| {
                let resolved = plan.prepared.strategies.get(&vector.node())?;
                Some(NodeReport {
                    name: resolved.name.clone(),
                    family: format!("{:?}", graph.node(vector.node()).family),
                    strategy: resolved.strategy.clone(),
                    candidates: vector.len(),
                    cost_us: resolved.cost.select(forward_only),
                })
            })
            .collect();
        let reshards = plan
            .prepared
            .communication_actions
            .iter()
            .map(|(edge, action)| ReshardReport {
                tensor: graph.node(edge.producer).name.clone(),
                consumer: graph.node(edge.consumer).name.clone(),
                operand: edge.operand.clone(),
                from: action.source.to_string(),
                to: action.target.to_string(),
                steps: action.steps.iter().map(|s| s.to_string()).collect(),
                cost_us: action.cost().select(forward_only),
            })
            .collect();
        PlanReport {
            mesh: mesh.shape().to_vec(),
            total_cost_us: plan.solution.total_cost,
            peak_memory_bytes: plan.solution.peak_memory,
            estimated_time_us: plan.sharded.estimated_time_us(forward_only),
            iterations: plan.solution.iterations,
            proven_optimal: plan.solution.proven_optimal,
            simplified: plan.simplified,
            nodes,
            reshards,
        }
    }
}
