//! Liveness of activations over execution steps and the peak memory of a solution.

use serde::Serialize;

use crate::device_mesh::DeviceMesh;
use crate::graph::{ComputationGraph, NodeId};
use crate::strategy::{OperationDataType, StrategiesVector};

/// Tensors resident while the node at `step` runs. Tensors are named by
/// their producing node.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LiveStage {
    pub step: usize,
    #[serde(skip)]
    pub node: NodeId,
    #[serde(skip)]
    pub live: Vec<NodeId>,
}

/// Per-device bytes each strategy keeps resident, indexed `[node][strategy]`.
#[derive(Clone, Debug, Default)]
pub struct MemoryTable {
    /// The node's output activation.
    pub activation: Vec<Vec<f64>>,
    /// Parameters (and their gradients when training), resident throughout.
    pub parameters: Vec<Vec<f64>>,
}

impl MemoryTable {
    pub fn new(strategies: &[StrategiesVector], mesh: &DeviceMesh, forward_only: bool) -> Self {
        let grad_factor = if forward_only { 1.0 } else { 2.0 };
        let mut table = MemoryTable::default();
        for vector in strategies {
            let mapping = vector.mapping();
            let mut activation = Vec::with_capacity(vector.len());
            let mut parameters = Vec::with_capacity(vector.len());
            for strategy in vector {
                let mut act = 0.0;
                let mut params = 0.0;
                for (key, data) in mapping.iter() {
                    let Some(spec) = strategy.spec(key) else { continue };
                    let bytes = data.bytes_for(spec, mesh) as f64;
                    match data.role {
                        OperationDataType::Output => act += bytes,
                        OperationDataType::Parameter => params += grad_factor * bytes,
                        OperationDataType::Argument => {}
                    }
                }
                activation.push(act);
                parameters.push(params);
            }
            table.activation.push(activation);
            table.parameters.push(parameters);
        }
        table
    }

    pub fn min_activation(&self, node: usize) -> f64 {
        self.activation[node].iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn min_parameters(&self, node: usize) -> f64 {
        self.parameters[node].iter().copied().fold(f64::INFINITY, f64::min)
    }
}

pub struct GraphAnalyser<'a> {
    graph: &'a ComputationGraph,
}

impl<'a> GraphAnalyser<'a> {
    pub fn new(graph: &'a ComputationGraph) -> Self {
        GraphAnalyser { graph }
    }

    /// One stage per node in execution order. A tensor is live from the step
    /// producing it through the step of its last consumer.
    pub fn liveness_analysis(&self) -> Vec<LiveStage> {
        let order = self.graph.node_ids();
        let last_use: Vec<Option<usize>> = order
            .iter()
            .map(|&id| {
                self.graph.node(id).output.as_ref()?;
                Some(self.graph.users(id).last().map(|u| u.index()).unwrap_or(id.index()))
            })
            .collect();
        order
            .iter()
            .enumerate()
            .map(|(step, &node)| LiveStage {
                step,
                node,
                live: order[..=step]
                    .iter()
                    .filter(|p| last_use[p.index()].is_some_and(|end| end >= step))
                    .copied()
                    .collect(),
            })
            .collect()
    }
}

/// Peak per-device memory of a full solution: resident parameters plus the
/// largest live activation set.
pub fn peak_memory(stages: &[LiveStage], memory: &MemoryTable, solution: &[usize]) -> f64 {
    let parameters: f64 = solution
        .iter()
        .enumerate()
        .map(|(v, &s)| memory.parameters[v][s])
        .sum();
    let activations = stages
        .iter()
        .map(|stage| {
            stage
                .live
                .iter()
                .map(|p| memory.activation[p.index()][solution[p.index()]])
                .sum::<f64>()
        })
        .fold(0.0, f64::max);
    parameters + activations
}
