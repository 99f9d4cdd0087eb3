//! Per-family node handlers.
//!
//! A handler reads one traced node, describes its operands as an
//! [`OperationDataMapping`], picks a [`StrategyGenerator`] and maps the
//! generated logical layouts back onto concrete tensor shapes.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::device_mesh::DeviceMesh;
use crate::error::{AutoShardError, Result};
use crate::generators::{ContractionDims, StrategyGenerator};
use crate::graph::{broadcast_shape, ComputationGraph, NodeId, OpFamily, TensorMeta, TracedNode};
use crate::options::SolverOptions;
use crate::sharding::ShardingSpec;
use crate::strategy::{OperationData, OperationDataMapping, ShardingStrategy, StrategiesVector};

pub trait NodeHandler: Send + Sync {
    fn family(&self) -> OpFamily;

    fn operation_data_mapping(&self, graph: &ComputationGraph, node: NodeId) -> Result<OperationDataMapping>;

    fn strategy_generator(
        &self,
        graph: &ComputationGraph,
        node: NodeId,
        mapping: &OperationDataMapping,
    ) -> Result<StrategyGenerator>;

    /// Translates a strategy over logical shapes into one or more strategies
    /// over concrete shapes.
    fn post_process(
        &self,
        _mapping: &OperationDataMapping,
        strategy: ShardingStrategy,
        _mesh: &DeviceMesh,
    ) -> Result<Vec<ShardingStrategy>> {
        Ok(vec![strategy])
    }

    fn register_strategies(&self, graph: &ComputationGraph, node: NodeId, mesh: &DeviceMesh) -> Result<StrategiesVector> {
        let mapping = self.operation_data_mapping(graph, node)?;
        let generator = self.strategy_generator(graph, node, &mapping)?;
        let name = &graph.node(node).name;
        let mut strategies = Vec::new();
        for strategy in generator.generate(name, &mapping, mesh)? {
            strategies.extend(self.post_process(&mapping, strategy, mesh)?);
        }
        if strategies.is_empty() {
            return Err(AutoShardError::shape_mismatch(name, "no layout is valid on this mesh"));
        }
        Ok(StrategiesVector::new(node, mapping, strategies))
    }
}

fn argument(graph: &ComputationGraph, node: NodeId, position: usize) -> Result<OperationData> {
    let traced = graph.node(node);
    let src = *graph.args(node).get(position).ok_or_else(|| {
        AutoShardError::shape_mismatch(&traced.name, format!("missing argument {}", position))
    })?;
    let producer = graph.node(src);
    let meta = producer.output.as_ref().ok_or_else(|| {
        AutoShardError::shape_mismatch(&traced.name, format!("argument '{}' is not a tensor", producer.name))
    })?;
    Ok(OperationData::argument(&producer.name, src, meta.shape.clone(), meta.dtype))
}

fn output_of(traced: &TracedNode) -> Result<OperationData> {
    let meta: &TensorMeta = traced
        .output
        .as_ref()
        .ok_or_else(|| AutoShardError::shape_mismatch(&traced.name, "node has no output tensor"))?;
    Ok(OperationData::output(&traced.name, meta.shape.clone(), meta.dtype))
}

fn param(traced: &TracedNode, role: &str) -> Option<OperationData> {
    traced
        .params
        .get(role)
        .map(|p| OperationData::parameter(&p.name, p.meta.shape.clone(), p.meta.dtype))
}

fn require_param(traced: &TracedNode, role: &str) -> Result<OperationData> {
    param(traced, role)
        .ok_or_else(|| AutoShardError::shape_mismatch(&traced.name, format!("missing parameter '{}'", role)))
}

pub struct PlaceholderHandler;

impl NodeHandler for PlaceholderHandler {
    fn family(&self) -> OpFamily {
        OpFamily::Placeholder
    }

    fn operation_data_mapping(&self, graph: &ComputationGraph, node: NodeId) -> Result<OperationDataMapping> {
        Ok(OperationDataMapping::new().with("output", output_of(graph.node(node))?))
    }

    fn strategy_generator(&self, _: &ComputationGraph, _: NodeId, _: &OperationDataMapping) -> Result<StrategyGenerator> {
        Ok(StrategyGenerator::Replica)
    }
}

/// The graph output. Replicated unless `distributed` lets it keep any layout.
pub struct OutputHandler {
    pub distributed: bool,
}

impl NodeHandler for OutputHandler {
    fn family(&self) -> OpFamily {
        OpFamily::Output
    }

    fn operation_data_mapping(&self, graph: &ComputationGraph, node: NodeId) -> Result<OperationDataMapping> {
        Ok(OperationDataMapping::new().with("input", argument(graph, node, 0)?))
    }

    fn strategy_generator(&self, _: &ComputationGraph, _: NodeId, _: &OperationDataMapping) -> Result<StrategyGenerator> {
        if self.distributed {
            Ok(StrategyGenerator::Elementwise { frozen: Vec::new() })
        } else {
            Ok(StrategyGenerator::Replica)
        }
    }
}

/// `nn.Linear`: leading input dims fold into one row dim, and the `[out, in]`
/// weight is viewed as `[in, out]`.
pub struct LinearHandler;

impl LinearHandler {
    /// Places the folded row axes of a logical `[M, X]` spec onto concrete
    /// batch dim `row_dim` of `concrete`.
    fn unfold(
        logical: &ShardingSpec,
        concrete: &[u64],
        row_dim: Option<usize>,
        mesh: &DeviceMesh,
    ) -> Result<ShardingSpec> {
        let last = concrete.len() - 1;
        let mut dim_partition = BTreeMap::new();
        if let Some(row_dim) = row_dim {
            dim_partition.insert(row_dim, logical.axes_of(0).to_vec());
        }
        if !logical.axes_of(1).is_empty() {
            dim_partition.insert(last, logical.axes_of(1).to_vec());
        }
        ShardingSpec::new(concrete.to_vec(), dim_partition, mesh)
    }
}

impl NodeHandler for LinearHandler {
    fn family(&self) -> OpFamily {
        OpFamily::Linear
    }

    fn operation_data_mapping(&self, graph: &ComputationGraph, node: NodeId) -> Result<OperationDataMapping> {
        let traced = graph.node(node);
        let input = argument(graph, node, 0)?;
        let weight = require_param(traced, "weight")?;
        let output = output_of(traced)?;
        let bias = param(traced, "bias");

        let shape_err = |reason: String| AutoShardError::shape_mismatch(&traced.name, reason);
        let (in_shape, out_shape, w_shape) = (&input.concrete_shape, &output.concrete_shape, &weight.concrete_shape);
        if in_shape.is_empty() || w_shape.len() != 2 {
            return Err(shape_err(format!(
                "linear needs a non-scalar input and a 2-d weight, got {:?} and {:?}",
                in_shape, w_shape
            )));
        }
        let (out_features, in_features) = (w_shape[0], w_shape[1]);
        let k = in_shape[in_shape.len() - 1];
        if k != in_features {
            return Err(shape_err(format!("input features {} != weight in_features {}", k, in_features)));
        }
        let batch = &in_shape[..in_shape.len() - 1];
        if out_shape.len() != in_shape.len()
            || out_shape[..batch.len()] != *batch
            || out_shape[out_shape.len() - 1] != out_features
        {
            return Err(shape_err(format!(
                "output {:?} does not match input {:?} and weight {:?}",
                out_shape, in_shape, w_shape
            )));
        }
        if let Some(bias) = &bias {
            if bias.concrete_shape != [out_features] {
                return Err(shape_err(format!(
                    "bias {:?} does not match out_features {}",
                    bias.concrete_shape, out_features
                )));
            }
        }

        let m: u64 = batch.iter().product();
        let mut mapping = OperationDataMapping::new()
            .with("input", input.with_logical_shape(vec![m, in_features]))
            .with("other", weight.with_logical_shape(vec![in_features, out_features]))
            .with("output", output.with_logical_shape(vec![m, out_features]));
        if let Some(bias) = bias {
            mapping.insert("bias", bias);
        }
        Ok(mapping)
    }

    fn strategy_generator(&self, _: &ComputationGraph, _: NodeId, _: &OperationDataMapping) -> Result<StrategyGenerator> {
        Ok(StrategyGenerator::Contraction(ContractionDims::MATMUL))
    }

    /// The folded row dim is realized on each concrete batch dim that can hold
    /// the whole shard. The first realization keeps the logical name.
    fn post_process(
        &self,
        mapping: &OperationDataMapping,
        strategy: ShardingStrategy,
        mesh: &DeviceMesh,
    ) -> Result<Vec<ShardingStrategy>> {
        let (Some(input), Some(output)) = (mapping.get("input"), mapping.get("output")) else {
            return Ok(Vec::new());
        };
        let (Some(logical_in), Some(logical_out)) = (strategy.spec("input"), strategy.spec("output")) else {
            return Ok(Vec::new());
        };
        let row_axes = logical_in.axes_of(0);
        let n_batch = input.concrete_shape.len() - 1;
        let row_dims: Vec<Option<usize>> = if row_axes.is_empty() {
            vec![None]
        } else {
            let factor = mesh.shard_factor(row_axes) as u64;
            (0..n_batch)
                .filter(|&d| input.concrete_shape[d] % factor == 0)
                .map(Some)
                .collect()
        };

        let mut realized = Vec::with_capacity(row_dims.len());
        for (i, row_dim) in row_dims.into_iter().enumerate() {
            let mut physical = strategy.clone();
            if i > 0 {
                if let Some(d) = row_dim {
                    physical.name = format!("{}_{}", strategy.name, d);
                }
            }
            let specs = &mut physical.sharding_specs;
            specs.insert(
                "input".to_string(),
                Self::unfold(logical_in, &input.concrete_shape, row_dim, mesh)?,
            );
            specs.insert(
                "output".to_string(),
                Self::unfold(logical_out, &output.concrete_shape, row_dim, mesh)?,
            );
            if let Some(other) = strategy.spec("other") {
                specs.insert("other".to_string(), other.transpose(0, 1));
            }
            realized.push(physical);
        }
        Ok(realized)
    }
}

/// `nn.Conv2d` over NCHW. The `[O, C, kh, kw]` weight is viewed as `[C, O, kh, kw]`.
pub struct ConvHandler;

impl NodeHandler for ConvHandler {
    fn family(&self) -> OpFamily {
        OpFamily::Conv2d
    }

    fn operation_data_mapping(&self, graph: &ComputationGraph, node: NodeId) -> Result<OperationDataMapping> {
        let traced = graph.node(node);
        let input = argument(graph, node, 0)?;
        let weight = require_param(traced, "weight")?;
        let output = output_of(traced)?;
        let bias = param(traced, "bias");

        let (x, w, y) = (&input.concrete_shape, &weight.concrete_shape, &output.concrete_shape);
        if x.len() != 4 || w.len() != 4 || y.len() != 4 {
            return Err(AutoShardError::shape_mismatch(
                &traced.name,
                format!("conv2d needs 4-d tensors, got {:?}, {:?}, {:?}", x, w, y),
            ));
        }
        if x[1] != w[1] || y[0] != x[0] || y[1] != w[0] {
            return Err(AutoShardError::shape_mismatch(
                &traced.name,
                format!("channels disagree: input {:?}, weight {:?}, output {:?}", x, w, y),
            ));
        }
        if let Some(bias) = &bias {
            if bias.concrete_shape != [w[0]] {
                return Err(AutoShardError::shape_mismatch(
                    &traced.name,
                    format!("bias {:?} does not match {} output channels", bias.concrete_shape, w[0]),
                ));
            }
        }
        let logical_weight = vec![w[1], w[0], w[2], w[3]];
        let mut mapping = OperationDataMapping::new()
            .with("input", input)
            .with("other", weight.with_logical_shape(logical_weight))
            .with("output", output);
        if let Some(bias) = bias {
            mapping.insert("bias", bias);
        }
        Ok(mapping)
    }

    fn strategy_generator(&self, _: &ComputationGraph, _: NodeId, _: &OperationDataMapping) -> Result<StrategyGenerator> {
        Ok(StrategyGenerator::Contraction(ContractionDims::MATMUL))
    }

    fn post_process(
        &self,
        _mapping: &OperationDataMapping,
        mut strategy: ShardingStrategy,
        _mesh: &DeviceMesh,
    ) -> Result<Vec<ShardingStrategy>> {
        if let Some(other) = strategy.sharding_specs.get_mut("other") {
            *other = other.transpose(0, 1);
        }
        Ok(vec![strategy])
    }
}

/// `torch.matmul` on `[M, K] x [K, N]` and `torch.bmm` on `[B, M, K] x [B, K, N]`.
pub struct MatMulHandler;

impl NodeHandler for MatMulHandler {
    fn family(&self) -> OpFamily {
        OpFamily::MatMul
    }

    fn operation_data_mapping(&self, graph: &ComputationGraph, node: NodeId) -> Result<OperationDataMapping> {
        let traced = graph.node(node);
        let input = argument(graph, node, 0)?;
        let other = argument(graph, node, 1)?;
        let output = output_of(traced)?;
        let (a, b, c) = (&input.concrete_shape, &other.concrete_shape, &output.concrete_shape);
        let consistent = match (a.as_slice(), b.as_slice()) {
            ([m, k], [k2, n]) => k == k2 && *c == [*m, *n],
            ([batch, m, k], [batch2, k2, n]) => batch == batch2 && k == k2 && *c == [*batch, *m, *n],
            _ => false,
        };
        if !consistent {
            return Err(AutoShardError::shape_mismatch(
                &traced.name,
                format!("matmul shapes disagree: {:?} x {:?} -> {:?}", a, b, c),
            ));
        }
        Ok(OperationDataMapping::new()
            .with("input", input)
            .with("other", other)
            .with("output", output))
    }

    fn strategy_generator(
        &self,
        graph: &ComputationGraph,
        node: NodeId,
        mapping: &OperationDataMapping,
    ) -> Result<StrategyGenerator> {
        let rank = mapping
            .get("input")
            .map(|input| input.logical_shape.len())
            .ok_or_else(|| AutoShardError::shape_mismatch(&graph.node(node).name, "missing 'input' operand"))?;
        let dims = if rank == 2 { ContractionDims::MATMUL } else { ContractionDims::BATCHED };
        Ok(StrategyGenerator::Contraction(dims))
    }
}

pub struct UnaryElementwiseHandler;

impl NodeHandler for UnaryElementwiseHandler {
    fn family(&self) -> OpFamily {
        OpFamily::UnaryElementwise
    }

    fn operation_data_mapping(&self, graph: &ComputationGraph, node: NodeId) -> Result<OperationDataMapping> {
        let traced = graph.node(node);
        let input = argument(graph, node, 0)?;
        let output = output_of(traced)?;
        if input.concrete_shape != output.concrete_shape {
            return Err(AutoShardError::shape_mismatch(
                &traced.name,
                format!("{:?} -> {:?} changes shape", input.concrete_shape, output.concrete_shape),
            ));
        }
        Ok(OperationDataMapping::new().with("input", input).with("output", output))
    }

    fn strategy_generator(&self, _: &ComputationGraph, _: NodeId, _: &OperationDataMapping) -> Result<StrategyGenerator> {
        Ok(StrategyGenerator::Elementwise { frozen: Vec::new() })
    }
}

pub struct BinaryElementwiseHandler;

impl NodeHandler for BinaryElementwiseHandler {
    fn family(&self) -> OpFamily {
        OpFamily::BinaryElementwise
    }

    fn operation_data_mapping(&self, graph: &ComputationGraph, node: NodeId) -> Result<OperationDataMapping> {
        let traced = graph.node(node);
        let input = argument(graph, node, 0)?;
        let other = argument(graph, node, 1)?;
        let output = output_of(traced)?;
        if broadcast_shape(&input.concrete_shape, &other.concrete_shape).as_ref() != Some(&output.concrete_shape) {
            return Err(AutoShardError::shape_mismatch(
                &traced.name,
                format!(
                    "{:?} and {:?} do not broadcast to {:?}",
                    input.concrete_shape, other.concrete_shape, output.concrete_shape
                ),
            ));
        }
        Ok(OperationDataMapping::new()
            .with("input", input)
            .with("other", other)
            .with("output", output))
    }

    fn strategy_generator(&self, _: &ComputationGraph, _: NodeId, _: &OperationDataMapping) -> Result<StrategyGenerator> {
        Ok(StrategyGenerator::Elementwise { frozen: Vec::new() })
    }
}

pub struct LayerNormHandler;

impl LayerNormHandler {
    fn normalized_ndim(traced: &TracedNode) -> usize {
        traced.attrs.get("normalized_ndim").copied().unwrap_or(1).max(0) as usize
    }
}

impl NodeHandler for LayerNormHandler {
    fn family(&self) -> OpFamily {
        OpFamily::LayerNorm
    }

    fn operation_data_mapping(&self, graph: &ComputationGraph, node: NodeId) -> Result<OperationDataMapping> {
        let traced = graph.node(node);
        let input = argument(graph, node, 0)?;
        let output = output_of(traced)?;
        let ndim = Self::normalized_ndim(traced);
        let shape = &input.concrete_shape;
        if ndim > shape.len() || *shape != output.concrete_shape {
            return Err(AutoShardError::shape_mismatch(
                &traced.name,
                format!("cannot normalize the last {} dims of {:?}", ndim, shape),
            ));
        }
        let normalized = &shape[shape.len() - ndim..];
        let mut mapping = OperationDataMapping::new().with("input", input.clone()).with("output", output);
        for role in ["weight", "bias"] {
            if let Some(p) = param(traced, role) {
                if p.concrete_shape != normalized {
                    return Err(AutoShardError::shape_mismatch(
                        &traced.name,
                        format!("{} {:?} does not match normalized shape {:?}", role, p.concrete_shape, normalized),
                    ));
                }
                mapping.insert(role, p);
            }
        }
        Ok(mapping)
    }

    fn strategy_generator(
        &self,
        graph: &ComputationGraph,
        node: NodeId,
        mapping: &OperationDataMapping,
    ) -> Result<StrategyGenerator> {
        let rank = mapping.get("output").map(|o| o.logical_shape.len()).unwrap_or(0);
        let ndim = Self::normalized_ndim(graph.node(node)).min(rank);
        Ok(StrategyGenerator::Elementwise {
            frozen: (rank - ndim..rank).collect(),
        })
    }
}

pub struct SoftmaxHandler;

impl NodeHandler for SoftmaxHandler {
    fn family(&self) -> OpFamily {
        OpFamily::Softmax
    }

    fn operation_data_mapping(&self, graph: &ComputationGraph, node: NodeId) -> Result<OperationDataMapping> {
        let traced = graph.node(node);
        let input = argument(graph, node, 0)?;
        let output = output_of(traced)?;
        if input.concrete_shape != output.concrete_shape {
            return Err(AutoShardError::shape_mismatch(
                &traced.name,
                format!("{:?} -> {:?} changes shape", input.concrete_shape, output.concrete_shape),
            ));
        }
        Ok(OperationDataMapping::new().with("input", input).with("output", output))
    }

    fn strategy_generator(
        &self,
        graph: &ComputationGraph,
        node: NodeId,
        mapping: &OperationDataMapping,
    ) -> Result<StrategyGenerator> {
        let traced = graph.node(node);
        let rank = mapping.get("output").map(|o| o.logical_shape.len()).unwrap_or(0) as i64;
        let dim = traced.attrs.get("dim").copied().unwrap_or(-1);
        let normalized = if dim < 0 { dim + rank } else { dim };
        if !(0..rank).contains(&normalized) {
            return Err(AutoShardError::shape_mismatch(
                &traced.name,
                format!("softmax dim {} out of range for rank {}", dim, rank),
            ));
        }
        Ok(StrategyGenerator::Elementwise {
            frozen: vec![normalized as usize],
        })
    }
}

/// Immutable family-to-handler table, built once and passed in.
pub struct HandlerRegistry {
    handlers: BTreeMap<OpFamily, Box<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        HandlerRegistry {
            handlers: BTreeMap::new(),
        }
    }

    pub fn standard() -> Self {
        Self::from_options(&SolverOptions::default())
    }

    pub fn from_options(options: &SolverOptions) -> Self {
        Self::empty()
            .with(PlaceholderHandler)
            .with(OutputHandler {
                distributed: options.distributed_output,
            })
            .with(LinearHandler)
            .with(ConvHandler)
            .with(MatMulHandler)
            .with(UnaryElementwiseHandler)
            .with(BinaryElementwiseHandler)
            .with(LayerNormHandler)
            .with(SoftmaxHandler)
    }

    pub fn with(mut self, handler: impl NodeHandler + 'static) -> Self {
        self.handlers.insert(handler.family(), Box::new(handler));
        self
    }

    pub fn get(&self, family: OpFamily) -> Result<&dyn NodeHandler> {
        self.handlers
            .get(&family)
            .map(|h| h.as_ref())
            .ok_or_else(|| AutoShardError::UnsupportedOperation(format!("{:?}", family)))
    }

    pub fn families(&self) -> Vec<OpFamily> {
        self.handlers.keys().copied().collect_vec()
    }
}
