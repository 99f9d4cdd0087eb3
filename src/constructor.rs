//! Runs every node handler over the graph to build its strategies vectors.

use rayon::prelude::*;

use crate::device_mesh::DeviceMesh;
use crate::error::Result;
use crate::graph::ComputationGraph;
use crate::handlers::HandlerRegistry;
use crate::strategy::StrategiesVector;

/// Builds the strategies of every node of a graph.
pub struct StrategiesConstructor<'a> {
    graph: &'a ComputationGraph,
    mesh: &'a DeviceMesh,
    registry: &'a HandlerRegistry,
}

impl<'a> StrategiesConstructor<'a> {
    pub fn new(graph: &'a ComputationGraph, mesh: &'a DeviceMesh, registry: &'a HandlerRegistry) -> Self {
        StrategiesConstructor { graph, mesh, registry }
    }

    /// One vector per node, in graph order. Nodes are independent here, so
    /// they are generated in parallel.
    pub fn build_strategies_and_cost(&self) -> Result<Vec<StrategiesVector>> {
        let strategies = self
            .graph
            .node_ids()
            .into_par_iter()
            .map(|node| {
                let traced = self.graph.node(node);
                let handler = self.registry.get(traced.family)?;
                let vector = handler.register_strategies(self.graph, node, self.mesh)?;
                tracing::debug!(node = %traced.name, family = ?traced.family, strategies = vector.len(), "registered strategies");
                Ok(vector)
            })
            .collect::<Result<Vec<_>>>()?;
        let total: usize = strategies.iter().map(StrategiesVector::len).sum();
        tracing::info!(nodes = strategies.len(), strategies = total, "built strategies");
        Ok(strategies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AutoShardError;
    use crate::graph::OpFamily;
    use crate::handlers::PlaceholderHandler;

    #[test]
    fn test_strategies_in_graph_order() {
        let mut g = ComputationGraph::new();
        let x = g.placeholder("x", [8, 16]).unwrap();
        let fc = g.linear("fc", x, 16, 16, false).unwrap();
        let act = g.unary("relu", "relu", fc).unwrap();
        g.output(act).unwrap();

        let mesh = DeviceMesh::new([2, 2]).unwrap();
        let registry = HandlerRegistry::standard();
        let strategies = StrategiesConstructor::new(&g, &mesh, &registry)
            .build_strategies_and_cost()
            .unwrap();
        assert_eq!(strategies.len(), 4);
        assert_eq!(strategies.iter().map(|s| s.node()).collect::<Vec<_>>(), g.node_ids());
        assert_eq!(strategies[0].names(), vec!["RR"]);
        assert_eq!(strategies[3].names(), vec!["RR"]);
        assert_eq!(strategies[2].predecessors(), vec![fc]);
    }

    #[test]
    fn test_unregistered_family_fails() {
        let mut g = ComputationGraph::new();
        let x = g.placeholder("x", [8]).unwrap();
        g.unary("relu", "relu", x).unwrap();
        let mesh = DeviceMesh::new([2]).unwrap();
        let registry = HandlerRegistry::empty().with(PlaceholderHandler);
        let err = StrategiesConstructor::new(&g, &mesh, &registry)
            .build_strategies_and_cost()
            .unwrap_err();
        assert!(matches!(err, AutoShardError::UnsupportedOperation(ref f) if f == &format!("{:?}", OpFamily::UnaryElementwise)));
    }
}
