use std::collections::BTreeMap;

use serde::Serialize;

use crate::device_mesh::DeviceMesh;
use crate::error::{AutoShardError, Result};
use crate::graph::{ComputationGraph, NodeId};
use crate::shape_consistency::{plan_conversion, CommunicationAction};
use crate::sharding::ShardingSpec;
use crate::strategy::{OperandCollective, OperationDataType, StrategiesVector, TrainCost};

/// The strategy a node runs with, resolved from a solution.
#[derive(Clone, Debug, Serialize)]
pub struct ResolvedNode {
    pub name: String,
    pub strategy: String,
    pub index: usize,
    pub specs: BTreeMap<String, ShardingSpec>,
    pub collectives: Vec<OperandCollective>,
    /// Compute plus the node's own collectives.
    pub cost: TrainCost,
}

/// Layout one consumer expects for a tensor.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConsumerSpec {
    pub consumer: String,
    pub operand: String,
    pub spec: ShardingSpec,
}

/// A data edge: `consumer` reads `producer`'s output as `operand`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeKey {
    pub producer: NodeId,
    pub consumer: NodeId,
    pub operand: String,
}

/// Side tables describing a sharded graph. The traced graph is untouched.
pub struct PreparedGraph<'g> {
    graph: &'g ComputationGraph,
    pub strategies: BTreeMap<NodeId, ResolvedNode>,
    /// Tensor name to the layouts its consumers read it in.
    pub sharding_specs: BTreeMap<String, Vec<ConsumerSpec>>,
    /// Tensor name to the layout its producer materializes.
    pub origin_specs: BTreeMap<String, ShardingSpec>,
    /// Parameter name to the layout the runtime shards it into.
    pub parameter_specs: BTreeMap<String, ShardingSpec>,
    /// Resharding to run before a consumer. Edges needing none are absent.
    pub communication_actions: BTreeMap<EdgeKey, CommunicationAction>,
}

impl<'g> PreparedGraph<'g> {
    pub fn graph(&self) -> &'g ComputationGraph {
        self.graph
    }

    /// Actions feeding `consumer`, in operand order.
    pub fn actions_for(&self, consumer: NodeId) -> Vec<(&EdgeKey, &CommunicationAction)> {
        let mut actions: Vec<_> = self
            .communication_actions
            .iter()
            .filter(|(k, _)| k.consumer == consumer)
            .collect();
        actions.sort_by(|a, b| a.0.operand.cmp(&b.0.operand));
        actions
    }
}

/// Resolves `solution` against `graph` and synthesizes every resharding action.
pub fn prepare<'g>(
    graph: &'g ComputationGraph,
    strategies: &[StrategiesVector],
    solution: &[usize],
    mesh: &DeviceMesh,
) -> Result<PreparedGraph<'g>> {
    if strategies.len() != graph.len() || solution.len() != graph.len() {
        return Err(AutoShardError::InvalidSolution(format!(
            "graph has {} nodes, got {} strategy vectors and {} choices",
            graph.len(),
            strategies.len(),
            solution.len()
        )));
    }

    let mut prepared = PreparedGraph {
        graph,
        strategies: BTreeMap::new(),
        sharding_specs: BTreeMap::new(),
        origin_specs: BTreeMap::new(),
        parameter_specs: BTreeMap::new(),
        communication_actions: BTreeMap::new(),
    };

    for (vector, &index) in strategies.iter().zip(solution) {
        let node = vector.node();
        let name = &graph.node(node).name;
        let strategy = vector.get(index).ok_or_else(|| {
            AutoShardError::InvalidSolution(format!(
                "strategy {} out of range for '{}' with {} strategies",
                index,
                name,
                vector.len()
            ))
        })?;

        for (key, data) in vector.mapping().iter() {
            let Some(spec) = strategy.spec(key) else { continue };
            match data.role {
                OperationDataType::Output => {
                    prepared.origin_specs.insert(data.name.clone(), spec.clone());
                }
                OperationDataType::Parameter => {
                    prepared
                        .parameter_specs
                        .entry(data.name.clone())
                        .or_insert_with(|| spec.clone());
                }
                OperationDataType::Argument => {}
            }
        }

        for (operand, data, producer) in vector.mapping().arguments() {
            let target = strategy.spec(operand).ok_or_else(|| {
                AutoShardError::IncompatibleLayout(format!("'{}' has no layout for '{}'", name, operand))
            })?;
            // producers run first, so their layout is already known
            let source = prepared.origin_specs.get(&data.name).ok_or_else(|| {
                AutoShardError::InvalidSolution(format!("'{}' reads '{}' before it is produced", name, data.name))
            })?;
            let action = plan_conversion(source, target, mesh, data.dtype.size_in_bytes())?;
            prepared
                .sharding_specs
                .entry(data.name.clone())
                .or_default()
                .push(ConsumerSpec {
                    consumer: name.clone(),
                    operand: operand.to_string(),
                    spec: target.clone(),
                });
            if !action.is_noop() {
                tracing::debug!(producer = %data.name, consumer = %name, operand, steps = action.steps.len(), "resharding");
                prepared.communication_actions.insert(
                    EdgeKey {
                        producer,
                        consumer: node,
                        operand: operand.to_string(),
                    },
                    action,
                );
            }
        }

        prepared.strategies.insert(
            node,
            ResolvedNode {
                name: name.clone(),
                strategy: strategy.name.clone(),
                index,
                specs: strategy.sharding_specs.clone(),
                collectives: strategy.collectives.clone(),
                cost: strategy.compute_cost + strategy.communication_cost,
            },
        );
    }
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constructor::StrategiesConstructor;
    use crate::handlers::HandlerRegistry;

    fn linear_graph() -> ComputationGraph {
        let mut g = ComputationGraph::new();
        let x = g.placeholder("x", [8, 16]).unwrap();
        let fc = g.linear("fc", x, 16, 16, false).unwrap();
        g.output(fc).unwrap();
        g
    }

    #[test]
    fn test_prepare_records_actions_on_mismatch() {
        let g = linear_graph();
        let mesh = DeviceMesh::new([2, 2]).unwrap();
        let registry = HandlerRegistry::standard();
        let strategies = StrategiesConstructor::new(&g, &mesh, &registry)
            .build_strategies_and_cost()
            .unwrap();
        let fc = strategies[1].position("S0S1 = S0R x RS1").unwrap();
        let prepared = prepare(&g, &strategies, &[0, fc, 0], &mesh).unwrap();

        let x = g.find("x").unwrap();
        let fc_id = g.find("fc").unwrap();
        let out = g.find("output").unwrap();
        assert_eq!(prepared.origin_specs["x"].to_string(), "RR");
        assert_eq!(prepared.origin_specs["fc"].to_string(), "S0S1");
        assert_eq!(prepared.parameter_specs["fc_weight"].to_string(), "S1R");
        assert_eq!(prepared.sharding_specs["x"][0].spec.to_string(), "S0R");

        // x is split into place, the output is gathered back
        let split = &prepared.communication_actions[&EdgeKey {
            producer: x,
            consumer: fc_id,
            operand: "input".to_string(),
        }];
        assert_eq!(split.cost().fwd, 0.0);
        assert_eq!(prepared.actions_for(out).len(), 1);
        assert_eq!(prepared.strategies[&fc_id].strategy, "S0S1 = S0R x RS1");
    }

    #[test]
    fn test_prepare_rejects_out_of_range() {
        let g = linear_graph();
        let mesh = DeviceMesh::new([2]).unwrap();
        let registry = HandlerRegistry::standard();
        let strategies = StrategiesConstructor::new(&g, &mesh, &registry)
            .build_strategies_and_cost()
            .unwrap();
        assert!(matches!(
            prepare(&g, &strategies, &[0, 999, 0], &mesh).err(),
            Some(AutoShardError::InvalidSolution(_))
        ));
        assert!(prepare(&g, &strategies, &[0, 0], &mesh).is_err());
    }
}
