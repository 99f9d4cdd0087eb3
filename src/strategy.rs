//! Operand descriptions and the candidate strategies attached to graph nodes.

use std::collections::BTreeMap;
use std::ops::{Add, AddAssign, Index};

use serde::Serialize;

use crate::device_mesh::CollectiveType;
use crate::graph::NodeId;
use crate::sharding::ShardingSpec;

/// Forward/backward split of a cost, as seen over one training step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct TrainCost {
    pub fwd: f64,
    pub bwd: f64,
}

impl TrainCost {
    pub fn new(fwd: f64, bwd: f64) -> Self {
        TrainCost { fwd, bwd }
    }

    pub fn total(&self) -> f64 {
        self.fwd + self.bwd
    }

    pub fn select(&self, forward_only: bool) -> f64 {
        if forward_only {
            self.fwd
        } else {
            self.total()
        }
    }
}

impl Add for TrainCost {
    type Output = TrainCost;

    fn add(self, rhs: Self) -> Self::Output {
        TrainCost {
            fwd: self.fwd + rhs.fwd,
            bwd: self.bwd + rhs.bwd,
        }
    }
}

impl AddAssign for TrainCost {
    fn add_assign(&mut self, rhs: Self) {
        self.fwd += rhs.fwd;
        self.bwd += rhs.bwd;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum DataType {
    F32,
    F16,
    BF16,
}

impl DataType {
    pub fn size_in_bytes(&self) -> u64 {
        match self {
            DataType::F32 => 4,
            DataType::F16 | DataType::BF16 => 2,
        }
    }

    pub fn from_torch(dtype: &str) -> Option<Self> {
        match dtype {
            "torch.float32" | "float32" | "" => Some(DataType::F32),
            "torch.float16" | "float16" => Some(DataType::F16),
            "torch.bfloat16" | "bfloat16" => Some(DataType::BF16),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum OperationDataType {
    Argument,
    Parameter,
    Output,
}

/// One operand of a node as strategy generation sees it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OperationData {
    /// Tensor identity: the producing node's name for arguments and outputs,
    /// the parameter's name for parameters.
    pub name: String,
    pub role: OperationDataType,
    pub logical_shape: Vec<u64>,
    pub concrete_shape: Vec<u64>,
    pub dtype: DataType,
    /// Producing node of an argument.
    #[serde(skip)]
    pub source: Option<NodeId>,
}

impl OperationData {
    pub fn argument(name: impl ToString, source: NodeId, shape: Vec<u64>, dtype: DataType) -> Self {
        OperationData {
            name: name.to_string(),
            role: OperationDataType::Argument,
            logical_shape: shape.clone(),
            concrete_shape: shape,
            dtype,
            source: Some(source),
        }
    }

    pub fn parameter(name: impl ToString, shape: Vec<u64>, dtype: DataType) -> Self {
        OperationData {
            name: name.to_string(),
            role: OperationDataType::Parameter,
            logical_shape: shape.clone(),
            concrete_shape: shape,
            dtype,
            source: None,
        }
    }

    pub fn output(name: impl ToString, shape: Vec<u64>, dtype: DataType) -> Self {
        OperationData {
            name: name.to_string(),
            role: OperationDataType::Output,
            logical_shape: shape.clone(),
            concrete_shape: shape,
            dtype,
            source: None,
        }
    }

    pub fn with_logical_shape(mut self, logical_shape: Vec<u64>) -> Self {
        self.logical_shape = logical_shape;
        self
    }

    pub fn bytes_for(&self, spec: &ShardingSpec, mesh: &crate::device_mesh::DeviceMesh) -> u64 {
        spec.local_numel(mesh) * self.dtype.size_in_bytes()
    }
}

/// Canonical operand key ("input", "other", "bias", "output", ...) to operand.
///
/// Operands absent from a model instance, such as the bias of a bias-free
/// linear layer, have no entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OperationDataMapping {
    operands: BTreeMap<String, OperationData>,
}

impl OperationDataMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl ToString, data: OperationData) {
        self.operands.insert(key.to_string(), data);
    }

    pub fn with(mut self, key: impl ToString, data: OperationData) -> Self {
        self.insert(key, data);
        self
    }

    pub fn get(&self, key: &str) -> Option<&OperationData> {
        self.operands.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.operands.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OperationData)> {
        self.operands.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Operand key holding the tensor called `name`.
    pub fn key_of(&self, name: &str) -> Option<&str> {
        self.iter().find(|(_, d)| d.name == name).map(|(k, _)| k)
    }

    /// Argument operands, with the node producing each.
    pub fn arguments(&self) -> impl Iterator<Item = (&str, &OperationData, NodeId)> {
        self.iter()
            .filter_map(|(k, d)| d.source.map(|src| (k, d, src)))
    }

    pub fn len(&self) -> usize {
        self.operands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operands.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    Forward,
    Backward,
}

/// A collective a strategy needs on one of its own operands to be correct,
/// e.g. the all-reduce of a partial-sum output.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OperandCollective {
    pub operand: String,
    pub ctype: CollectiveType,
    pub axes: Vec<usize>,
    pub phase: Phase,
    pub cost: f64,
}

/// One candidate layout for every operand of a node.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ShardingStrategy {
    pub name: String,
    /// Operand key to its physical (concrete-shape) spec.
    pub sharding_specs: BTreeMap<String, ShardingSpec>,
    pub compute_cost: TrainCost,
    pub communication_cost: TrainCost,
    pub memory_cost: TrainCost,
    pub collectives: Vec<OperandCollective>,
}

impl ShardingStrategy {
    pub fn spec(&self, key: &str) -> Option<&ShardingSpec> {
        self.sharding_specs.get(key)
    }

    /// Cost of running the node under this strategy, excluding resharding of its inputs.
    pub fn node_cost(&self, forward_only: bool) -> f64 {
        self.compute_cost.select(forward_only) + self.communication_cost.select(forward_only)
    }
}

/// The ordered candidates of one node. A strategy's position is its identifier
/// in a solution.
#[derive(Clone, Debug, Serialize)]
pub struct StrategiesVector {
    #[serde(skip)]
    node: NodeId,
    mapping: OperationDataMapping,
    strategies: Vec<ShardingStrategy>,
}

impl StrategiesVector {
    pub fn new(node: NodeId, mapping: OperationDataMapping, strategies: Vec<ShardingStrategy>) -> Self {
        StrategiesVector {
            node,
            mapping,
            strategies,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn mapping(&self) -> &OperationDataMapping {
        &self.mapping
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ShardingStrategy> {
        self.strategies.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ShardingStrategy> {
        self.strategies.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.strategies.iter().position(|s| s.name == name)
    }

    /// Spec the strategy at `index` gives the tensor called `name`.
    pub fn sharding_spec_by_name(&self, index: usize, name: &str) -> Option<&ShardingSpec> {
        let key = self.mapping.key_of(name)?;
        self.strategies.get(index)?.spec(key)
    }

    /// Producer nodes of this node's arguments, deduplicated, ascending.
    pub fn predecessors(&self) -> Vec<NodeId> {
        let mut preds: Vec<NodeId> = self.mapping.arguments().map(|(_, _, src)| src).collect();
        preds.sort();
        preds.dedup();
        preds
    }
}

impl Index<usize> for StrategiesVector {
    type Output = ShardingStrategy;

    fn index(&self, index: usize) -> &Self::Output {
        &self.strategies[index]
    }
}

impl<'a> IntoIterator for &'a StrategiesVector {
    type Item = &'a ShardingStrategy;
    type IntoIter = std::slice::Iter<'a, ShardingStrategy>;

    fn into_iter(self) -> Self::IntoIter {
        self.strategies.iter()
    }
}
