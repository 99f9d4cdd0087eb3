//! The traced computation graph the planner reads.
//!
//! Nodes live in a petgraph arena and refer to each other only through
//! [`NodeId`] handles. Nodes are appended in execution order, so a node's
//! index is also its position in the program.

use std::collections::BTreeMap;

use petgraph::{graph::NodeIndex as PetNodeIndex, visit::EdgeRef, Directed, Direction, Graph};

use crate::error::{AutoShardError, Result};
use crate::strategy::DataType;

pub mod fx;

pub type NodeId = PetNodeIndex<u32>;

/// Operation families the planner knows how to shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpFamily {
    Placeholder,
    Output,
    Linear,
    Conv2d,
    MatMul,
    UnaryElementwise,
    BinaryElementwise,
    LayerNorm,
    Softmax,
}

impl OpFamily {
    /// Maps a tracer target to its family.
    pub fn from_target(target: &str) -> Option<Self> {
        let family = match target {
            "placeholder" => OpFamily::Placeholder,
            "output" => OpFamily::Output,
            "linear" | "torch.nn.Linear" | "torch.nn.functional.linear" => OpFamily::Linear,
            "conv2d" | "torch.nn.Conv2d" | "torch.conv2d" => OpFamily::Conv2d,
            "bmm" | "matmul" | "torch.bmm" | "torch.matmul" => OpFamily::MatMul,
            "relu" | "gelu" | "tanh" | "sigmoid" | "silu" | "dropout" | "neg" | "exp" => {
                OpFamily::UnaryElementwise
            }
            "add" | "sub" | "mul" | "div" | "operator.add" | "operator.mul" | "torch.add" | "torch.mul" => {
                OpFamily::BinaryElementwise
            }
            "layer_norm" | "torch.nn.LayerNorm" => OpFamily::LayerNorm,
            "softmax" | "torch.softmax" => OpFamily::Softmax,
            _ => return None,
        };
        Some(family)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TensorMeta {
    pub shape: Vec<u64>,
    pub dtype: DataType,
}

impl TensorMeta {
    pub fn new(shape: impl Into<Vec<u64>>) -> Self {
        TensorMeta {
            shape: shape.into(),
            dtype: DataType::F32,
        }
    }

    pub fn numel(&self) -> u64 {
        self.shape.iter().product()
    }
}

/// A parameter owned by a module node, e.g. a linear layer's weight.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamMeta {
    pub name: String,
    pub meta: TensorMeta,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TracedNode {
    pub name: String,
    pub family: OpFamily,
    pub target: String,
    /// Output tensor; `None` for the graph output node.
    pub output: Option<TensorMeta>,
    /// Role ("weight", "bias") to parameter.
    pub params: BTreeMap<String, ParamMeta>,
    pub attrs: BTreeMap<String, i64>,
}

impl TracedNode {
    pub fn new(name: impl ToString, family: OpFamily, output: Option<TensorMeta>) -> Self {
        TracedNode {
            name: name.to_string(),
            family,
            target: String::new(),
            output,
            params: BTreeMap::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_target(mut self, target: impl ToString) -> Self {
        self.target = target.to_string();
        self
    }

    pub fn with_param(mut self, role: impl ToString, name: impl ToString, shape: Vec<u64>) -> Self {
        self.params.insert(
            role.to_string(),
            ParamMeta {
                name: name.to_string(),
                meta: TensorMeta::new(shape),
            },
        );
        self
    }

    pub fn with_attr(mut self, key: impl ToString, value: i64) -> Self {
        self.attrs.insert(key.to_string(), value);
        self
    }

    pub fn output_shape(&self) -> Option<&[u64]> {
        self.output.as_ref().map(|m| m.shape.as_slice())
    }
}

/// Immutable-once-built traced graph. Edge weights are argument positions.
#[derive(Default, Debug)]
pub struct ComputationGraph {
    graph: Graph<TracedNode, usize, Directed>,
    by_name: BTreeMap<String, NodeId>,
}

impl ComputationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `node` consuming `args` in order. Arguments must already exist
    /// and names must be unique, which keeps the graph acyclic and ordered.
    pub fn add_node(&mut self, node: TracedNode, args: impl AsRef<[NodeId]>) -> Result<NodeId> {
        if self.by_name.contains_key(&node.name) {
            return Err(AutoShardError::Trace(format!("duplicate node name '{}'", node.name)));
        }
        for &arg in args.as_ref() {
            match self.graph.node_weight(arg) {
                None => {
                    return Err(AutoShardError::Trace(format!(
                        "node '{}' references unknown node {}",
                        node.name,
                        arg.index()
                    )))
                }
                Some(producer) if producer.output.is_none() => {
                    return Err(AutoShardError::Trace(format!(
                        "node '{}' consumes '{}', which produces no tensor",
                        node.name, producer.name
                    )))
                }
                Some(_) => {}
            }
        }
        let name = node.name.clone();
        let node_id = self.graph.add_node(node);
        for (position, &arg) in args.as_ref().iter().enumerate() {
            self.graph.add_edge(arg, node_id, position);
        }
        self.by_name.insert(name, node_id);
        Ok(node_id)
    }

    pub fn node(&self, id: NodeId) -> &TracedNode {
        &self.graph[id]
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Node handles in program order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.graph.node_indices().collect()
    }

    /// Producers of `id`'s arguments, in argument order.
    pub fn args(&self, id: NodeId) -> Vec<NodeId> {
        let mut args: Vec<(usize, NodeId)> = self
            .graph
            .edges_directed(id, Direction::Incoming)
            .map(|e| (*e.weight(), e.source()))
            .collect();
        args.sort();
        args.into_iter().map(|(_, src)| src).collect()
    }

    /// Consumers of `id`'s output, ascending and deduplicated.
    pub fn users(&self, id: NodeId) -> Vec<NodeId> {
        let mut users: Vec<NodeId> = self
            .graph
            .neighbors_directed(id, Direction::Outgoing)
            .collect();
        users.sort();
        users.dedup();
        users
    }

    pub fn arg_meta(&self, id: NodeId, position: usize) -> Option<(&TracedNode, &TensorMeta)> {
        let producer = self.node(*self.args(id).get(position)?);
        producer.output.as_ref().map(|meta| (producer, meta))
    }

    pub fn placeholder(&mut self, name: impl ToString, shape: impl Into<Vec<u64>>) -> Result<NodeId> {
        let node = TracedNode::new(name, OpFamily::Placeholder, Some(TensorMeta::new(shape)))
            .with_target("placeholder");
        self.add_node(node, [])
    }

    /// `nn.Linear(in_features, out_features)` applied to `input`.
    pub fn linear(
        &mut self,
        name: impl ToString,
        input: NodeId,
        in_features: u64,
        out_features: u64,
        bias: bool,
    ) -> Result<NodeId> {
        let name = name.to_string();
        let mut shape = self.output_shape_of(input)?;
        if let Some(last) = shape.last_mut() {
            *last = out_features;
        }
        let mut node = TracedNode::new(&name, OpFamily::Linear, Some(TensorMeta::new(shape)))
            .with_target("linear")
            .with_param("weight", format!("{}_weight", name), vec![out_features, in_features]);
        if bias {
            node = node.with_param("bias", format!("{}_bias", name), vec![out_features]);
        }
        self.add_node(node, [input])
    }

    /// `nn.Conv2d` with square stride and padding applied to an NCHW `input`.
    #[allow(clippy::too_many_arguments)]
    pub fn conv2d(
        &mut self,
        name: impl ToString,
        input: NodeId,
        in_channels: u64,
        out_channels: u64,
        kernel: (u64, u64),
        stride: u64,
        padding: u64,
        bias: bool,
    ) -> Result<NodeId> {
        let name = name.to_string();
        let shape = self.output_shape_of(input)?;
        if shape.len() != 4 {
            return Err(AutoShardError::shape_mismatch(
                &name,
                format!("conv2d expects an NCHW input, got {:?}", shape),
            ));
        }
        let spatial = |size: u64, k: u64| (size + 2 * padding).saturating_sub(k) / stride.max(1) + 1;
        let out = vec![
            shape[0],
            out_channels,
            spatial(shape[2], kernel.0),
            spatial(shape[3], kernel.1),
        ];
        let mut node = TracedNode::new(&name, OpFamily::Conv2d, Some(TensorMeta::new(out)))
            .with_target("conv2d")
            .with_param(
                "weight",
                format!("{}_weight", name),
                vec![out_channels, in_channels, kernel.0, kernel.1],
            );
        if bias {
            node = node.with_param("bias", format!("{}_bias", name), vec![out_channels]);
        }
        self.add_node(node, [input])
    }

    pub fn bmm(&mut self, name: impl ToString, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.contraction(name, "bmm", lhs, rhs)
    }

    /// `torch.matmul` on two rank-2 or two rank-3 operands.
    pub fn matmul(&mut self, name: impl ToString, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.contraction(name, "matmul", lhs, rhs)
    }

    fn contraction(&mut self, name: impl ToString, target: &str, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        let lhs_shape = self.output_shape_of(lhs)?;
        let rhs_shape = self.output_shape_of(rhs)?;
        let mut shape = lhs_shape.clone();
        if let (Some(last), Some(&n)) = (shape.last_mut(), rhs_shape.last()) {
            *last = n;
        }
        let node = TracedNode::new(name, OpFamily::MatMul, Some(TensorMeta::new(shape))).with_target(target);
        self.add_node(node, [lhs, rhs])
    }

    pub fn unary(&mut self, name: impl ToString, target: &str, input: NodeId) -> Result<NodeId> {
        let shape = self.output_shape_of(input)?;
        let node = TracedNode::new(name, OpFamily::UnaryElementwise, Some(TensorMeta::new(shape)))
            .with_target(target);
        self.add_node(node, [input])
    }

    pub fn binary(&mut self, name: impl ToString, target: &str, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        let name = name.to_string();
        let lhs_shape = self.output_shape_of(lhs)?;
        let rhs_shape = self.output_shape_of(rhs)?;
        let shape = broadcast_shape(&lhs_shape, &rhs_shape).ok_or_else(|| {
            AutoShardError::shape_mismatch(
                &name,
                format!("cannot broadcast {:?} with {:?}", lhs_shape, rhs_shape),
            )
        })?;
        let node = TracedNode::new(&name, OpFamily::BinaryElementwise, Some(TensorMeta::new(shape)))
            .with_target(target);
        self.add_node(node, [lhs, rhs])
    }

    pub fn layer_norm(&mut self, name: impl ToString, input: NodeId, normalized_ndim: usize) -> Result<NodeId> {
        let name = name.to_string();
        let shape = self.output_shape_of(input)?;
        let normalized = shape[shape.len().saturating_sub(normalized_ndim)..].to_vec();
        let node = TracedNode::new(&name, OpFamily::LayerNorm, Some(TensorMeta::new(shape)))
            .with_target("layer_norm")
            .with_param("weight", format!("{}_weight", name), normalized.clone())
            .with_param("bias", format!("{}_bias", name), normalized)
            .with_attr("normalized_ndim", normalized_ndim as i64);
        self.add_node(node, [input])
    }

    pub fn softmax(&mut self, name: impl ToString, input: NodeId, dim: i64) -> Result<NodeId> {
        let shape = self.output_shape_of(input)?;
        let node = TracedNode::new(name, OpFamily::Softmax, Some(TensorMeta::new(shape)))
            .with_target("softmax")
            .with_attr("dim", dim);
        self.add_node(node, [input])
    }

    pub fn output(&mut self, input: NodeId) -> Result<NodeId> {
        let node = TracedNode::new("output", OpFamily::Output, None).with_target("output");
        self.add_node(node, [input])
    }

    fn output_shape_of(&self, id: NodeId) -> Result<Vec<u64>> {
        self.graph
            .node_weight(id)
            .and_then(|n| n.output_shape())
            .map(<[u64]>::to_vec)
            .ok_or_else(|| AutoShardError::Trace(format!("node {} produces no tensor", id.index())))
    }

    /// Checks the arena is a DAG whose index order is a valid execution order.
    pub fn validate(&self) -> Result<()> {
        let sorted = petgraph::algo::toposort(&self.graph, None)
            .map_err(|cycle| AutoShardError::Trace(format!("cycle through node {}", cycle.node_id().index())))?;
        debug_assert_eq!(sorted.len(), self.len());
        for edge in self.graph.edge_references() {
            if edge.source() >= edge.target() {
                return Err(AutoShardError::Trace(format!(
                    "node '{}' runs before its producer '{}'",
                    self.graph[edge.target()].name,
                    self.graph[edge.source()].name
                )));
            }
        }
        Ok(())
    }
}

/// Right-aligned numpy-style broadcast of two shapes.
pub fn broadcast_shape(a: &[u64], b: &[u64]) -> Option<Vec<u64>> {
    let rank = a.len().max(b.len());
    (0..rank)
        .map(|i| {
            let x = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
            let y = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
            match (x, y) {
                (x, y) if x == y => Some(x),
                (1, y) => Some(y),
                (x, 1) => Some(x),
                _ => None,
            }
        })
        .collect()
}
