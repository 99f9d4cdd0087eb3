use std::collections::BTreeMap;
use std::fmt;

use petgraph::{graph::NodeIndex, visit::EdgeRef, Direction, Graph};

use crate::graph::NodeId;
use crate::passes::preparation::{EdgeKey, PreparedGraph};
use crate::shape_consistency::CommunicationAction;
use crate::strategy::{OperandCollective, TrainCost};

pub enum ShardedOp {
    /// An original node running its chosen strategy.
    Compute {
        node: NodeId,
        name: String,
        strategy: String,
        collectives: Vec<OperandCollective>,
        cost: TrainCost,
    },
    /// Resharding of one input, run right before its consumer.
    Reshard {
        edge: EdgeKey,
        tensor: String,
        action: CommunicationAction,
    },
}

impl ShardedOp {
    pub fn cost(&self) -> TrainCost {
        match self {
            ShardedOp::Compute { cost, .. } => *cost,
            ShardedOp::Reshard { action, .. } => action.cost(),
        }
    }

    pub fn is_reshard(&self) -> bool {
        matches!(self, ShardedOp::Reshard { .. })
    }
}

impl fmt::Debug for ShardedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardedOp::Compute { name, strategy, .. } => f
                .debug_struct("Compute")
                .field("name", name)
                .field("strategy", strategy)
                .finish(),
            ShardedOp::Reshard { tensor, action, .. } => f
                .debug_struct("Reshard")
                .field("tensor", tensor)
                .field("from", &action.source.to_string())
                .field("to", &action.target.to_string())
                .finish(),
        }
    }
}

impl fmt::Display for ShardedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardedOp::Compute { name, strategy, .. } => write!(f, "{} [{}]", name, strategy),
            ShardedOp::Reshard { tensor, action, .. } => {
                write!(f, "reshard {}: {} -> {}", tensor, action.source, action.target)?;
                for step in &action.steps {
                    write!(f, "; {}", step)?;
                }
                Ok(())
            }
        }
    }
}

/// The executable graph: original nodes in their original order, with
/// resharding steps spliced in front of the nodes that need them.
pub struct ShardedGraph {
    graph: Graph<ShardedOp, ()>,
    order: Vec<NodeIndex>,
}

impl ShardedGraph {
    /// Operations in execution order.
    pub fn ops(&self) -> impl Iterator<Item = &ShardedOp> + '_ {
        self.order.iter().map(|&i| &self.graph[i])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn reshard_count(&self) -> usize {
        self.ops().filter(|op| op.is_reshard()).count()
    }

    pub fn predecessors(&self, index: usize) -> Vec<usize> {
        let position: BTreeMap<NodeIndex, usize> = self.order.iter().enumerate().map(|(i, &n)| (n, i)).collect();
        let mut preds: Vec<usize> = self
            .graph
            .edges_directed(self.order[index], Direction::Incoming)
            .map(|e| position[&e.source()])
            .collect();
        preds.sort();
        preds
    }

    /// Critical path length in microseconds, every op starting once all of its
    /// inputs are ready.
    pub fn estimated_time_us(&self, forward_only: bool) -> f64 {
        let mut finish: BTreeMap<NodeIndex, f64> = BTreeMap::new();
        let mut total: f64 = 0.0;
        for &node_id in &self.order {
            let input_time = self
                .graph
                .neighbors_directed(node_id, Direction::Incoming)
                .map(|n| finish[&n])
                .fold(0.0, f64::max);
            let done = input_time + self.graph[node_id].cost().select(forward_only);
            finish.insert(node_id, done);
            total = total.max(done);
        }
        total
    }
}

/// Builds the sharded graph. Evaluation order is unchanged apart from the
/// inserted resharding steps.
pub fn apply(prepared: &PreparedGraph<'_>) -> ShardedGraph {
    let traced = prepared.graph();
    let mut graph = Graph::new();
    let mut order = Vec::new();
    let mut compute: BTreeMap<NodeId, NodeIndex> = BTreeMap::new();

    for node in traced.node_ids() {
        let mut inputs = Vec::new();
        for producer in traced.args(node) {
            // args may repeat, one edge per distinct producer is enough
            if !inputs.contains(&compute[&producer]) {
                inputs.push(compute[&producer]);
            }
        }
        let mut resharded = Vec::new();
        for (edge, action) in prepared.actions_for(node) {
            let step = graph.add_node(ShardedOp::Reshard {
                edge: edge.clone(),
                tensor: traced.node(edge.producer).name.clone(),
                action: action.clone(),
            });
            graph.add_edge(compute[&edge.producer], step, ());
            order.push(step);
            resharded.push((edge.producer, step));
        }

        let op = match prepared.strategies.get(&node) {
            Some(resolved) => ShardedOp::Compute {
                node,
                name: resolved.name.clone(),
                strategy: resolved.strategy.clone(),
                collectives: resolved.collectives.clone(),
                cost: resolved.cost,
            },
            None => ShardedOp::Compute {
                node,
                name: traced.node(node).name.clone(),
                strategy: String::new(),
                collectives: Vec::new(),
                cost: TrainCost::default(),
            },
        };
        let id = graph.add_node(op);
        for input in inputs {
            graph.add_edge(input, id, ());
        }
        for (_, step) in resharded {
            graph.add_edge(step, id, ());
        }
        order.push(id);
        compute.insert(node, id);
    }
    tracing::debug!(ops = order.len(), "applied sharding");
    ShardedGraph { graph, order }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constructor::StrategiesConstructor;
    use crate::device_mesh::DeviceMesh;
    use crate::graph::ComputationGraph;
    use crate::handlers::HandlerRegistry;
    use crate::passes::prepare;

    #[test]
    fn test_reshard_inserted_before_consumer() {
        let mut g = ComputationGraph::new();
        let x = g.placeholder("x", [8, 16]).unwrap();
        let fc = g.linear("fc", x, 16, 16, false).unwrap();
        g.output(fc).unwrap();

        let mesh = DeviceMesh::new([2, 2]).unwrap();
        let registry = HandlerRegistry::standard();
        let strategies = StrategiesConstructor::new(&g, &mesh, &registry)
            .build_strategies_and_cost()
            .unwrap();
        let choice = strategies[1].position("S0S1 = S0R x RS1").unwrap();
        let prepared = prepare(&g, &strategies, &[0, choice, 0], &mesh).unwrap();
        let sharded = apply(&prepared);

        let ops: Vec<String> = sharded
            .ops()
            .map(|op| match op {
                ShardedOp::Compute { name, .. } => name.clone(),
                ShardedOp::Reshard { tensor, .. } => format!("reshard {}", tensor),
            })
            .collect();
        assert_eq!(ops, vec!["x", "reshard x", "fc", "reshard fc", "output"]);
        assert_eq!(sharded.reshard_count(), 2);
        assert_eq!(sharded.predecessors(2), vec![0, 1]);
        assert!(sharded.estimated_time_us(false) > 0.0);
    }
}
