//! Strategy generators: enumerate every valid layout combination for the
//! operands of one node and price it.
//!
//! Generators work on logical shapes only. Handlers translate the resulting
//! specs back onto concrete shapes afterwards.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::device_mesh::{CollectiveType, DeviceMesh};
use crate::error::{AutoShardError, Result};
use crate::sharding::{enumerate_layouts, ShardingSpec};
use crate::strategy::{
    OperandCollective, OperationData, OperationDataMapping, OperationDataType, Phase, ShardingStrategy,
    TrainCost,
};

/// Which logical dimension of each operand plays each role of a contraction
/// `output[b, m, n] = sum_k input[b, m, k] * other[b, k, n]`.
///
/// Pairs list the dims in the order the operands appear in the formula.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContractionDims {
    /// input, other, output
    pub batch: Option<[usize; 3]>,
    /// input, output
    pub row: [usize; 2],
    /// input, other
    pub contract: [usize; 2],
    /// other, output
    pub col: [usize; 2],
}

impl ContractionDims {
    /// `[M, K] x [K, N]`, also used for conv with `[N, C, ..] x [C, O, ..]`.
    pub const MATMUL: ContractionDims = ContractionDims {
        batch: None,
        row: [0, 0],
        contract: [1, 0],
        col: [1, 1],
    };

    /// `[B, M, K] x [B, K, N]`.
    pub const BATCHED: ContractionDims = ContractionDims {
        batch: Some([0, 0, 0]),
        row: [1, 1],
        contract: [2, 1],
        col: [2, 2],
    };

    fn input_dims(&self) -> Vec<usize> {
        let mut dims = vec![self.row[0], self.contract[0]];
        dims.extend(self.batch.map(|b| b[0]));
        dims.into_iter().sorted().collect()
    }

    fn other_dims(&self) -> Vec<usize> {
        let mut dims = vec![self.contract[1], self.col[0]];
        dims.extend(self.batch.map(|b| b[1]));
        dims.into_iter().sorted().collect()
    }

    fn output_dims(&self) -> Vec<usize> {
        let mut dims = vec![self.row[1], self.col[1]];
        dims.extend(self.batch.map(|b| b[2]));
        dims.into_iter().sorted().collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Unused,
    Batch,
    Row,
    Contract,
    Col,
}

/// The closed set of generators handlers choose from.
#[derive(Clone, Debug, PartialEq)]
pub enum StrategyGenerator {
    /// Everything replicated, a single strategy.
    Replica,
    Contraction(ContractionDims),
    /// Every operand follows the output layout. `frozen` output dims stay replicated.
    Elementwise { frozen: Vec<usize> },
}

impl StrategyGenerator {
    pub fn generate(
        &self,
        node: &str,
        mapping: &OperationDataMapping,
        mesh: &DeviceMesh,
    ) -> Result<Vec<ShardingStrategy>> {
        match self {
            StrategyGenerator::Replica => replica_strategies(node, mapping, mesh),
            StrategyGenerator::Contraction(dims) => contraction_strategies(node, dims, mapping, mesh),
            StrategyGenerator::Elementwise { frozen } => elementwise_strategies(node, frozen, mapping, mesh),
        }
    }
}

/// `"{output} = {input} x {other}"`, dropping whichever parts are absent.
pub fn compose_name(output: Option<&str>, inputs: &[String]) -> String {
    let rhs = inputs.join(" x ");
    match output {
        Some(out) if !rhs.is_empty() => format!("{} = {}", out, rhs),
        Some(out) => out.to_string(),
        None => rhs,
    }
}

fn require<'a>(node: &str, mapping: &'a OperationDataMapping, key: &str) -> Result<&'a OperationData> {
    mapping
        .get(key)
        .ok_or_else(|| AutoShardError::shape_mismatch(node, format!("missing '{}' operand", key)))
}

fn name_from_specs(specs: &BTreeMap<String, ShardingSpec>) -> String {
    let inputs = ["input", "other"]
        .iter()
        .filter_map(|k| specs.get(*k))
        .map(|s| s.to_string())
        .collect_vec();
    compose_name(specs.get("output").map(|s| s.to_string()).as_deref(), &inputs)
}

fn memory_cost(mapping: &OperationDataMapping, specs: &BTreeMap<String, ShardingSpec>, mesh: &DeviceMesh) -> TrainCost {
    let mut memory = TrainCost::default();
    for (key, data) in mapping.iter() {
        let Some(spec) = specs.get(key) else { continue };
        let bytes = data.bytes_for(spec, mesh) as f64;
        memory.fwd += bytes;
        if data.role != OperationDataType::Output {
            memory.bwd += bytes;
        }
    }
    memory
}

fn communication_cost(collectives: &[OperandCollective]) -> TrainCost {
    collectives.iter().fold(TrainCost::default(), |mut acc, c| {
        match c.phase {
            Phase::Forward => acc.fwd += c.cost,
            Phase::Backward => acc.bwd += c.cost,
        }
        acc
    })
}

fn all_reduce(
    mapping: &OperationDataMapping,
    specs: &BTreeMap<String, ShardingSpec>,
    mesh: &DeviceMesh,
    key: &str,
    axes: &[usize],
    phase: Phase,
) -> Option<OperandCollective> {
    if axes.is_empty() {
        return None;
    }
    let data = mapping.get(key)?;
    let bytes = data.bytes_for(specs.get(key)?, mesh);
    Some(OperandCollective {
        operand: key.to_string(),
        ctype: CollectiveType::AllReduce,
        axes: axes.to_vec(),
        phase,
        cost: mesh.collective_cost(CollectiveType::AllReduce, axes, bytes),
    })
}

fn replica_strategies(node: &str, mapping: &OperationDataMapping, mesh: &DeviceMesh) -> Result<Vec<ShardingStrategy>> {
    if mapping.is_empty() {
        return Err(AutoShardError::shape_mismatch(node, "node has no operands"));
    }
    let specs: BTreeMap<String, ShardingSpec> = mapping
        .iter()
        .map(|(key, data)| (key.to_string(), ShardingSpec::replicated(data.logical_shape.clone())))
        .collect();
    Ok(vec![ShardingStrategy {
        name: name_from_specs(&specs),
        memory_cost: memory_cost(mapping, &specs, mesh),
        sharding_specs: specs,
        compute_cost: TrainCost::default(),
        communication_cost: TrainCost::default(),
        collectives: Vec::new(),
    }])
}

fn partition(entries: &[(Option<usize>, &Vec<usize>)]) -> BTreeMap<usize, Vec<usize>> {
    entries
        .iter()
        .filter_map(|(dim, axes)| dim.filter(|_| !axes.is_empty()).map(|d| (d, axes.to_vec())))
        .collect()
}

fn contraction_strategies(
    node: &str,
    dims: &ContractionDims,
    mapping: &OperationDataMapping,
    mesh: &DeviceMesh,
) -> Result<Vec<ShardingStrategy>> {
    let input = require(node, mapping, "input")?;
    let other = require(node, mapping, "other")?;
    let output = require(node, mapping, "output")?;
    let bias = mapping.get("bias");

    let mut roles = vec![Role::Unused];
    if dims.batch.is_some() {
        roles.push(Role::Batch);
    }
    roles.extend([Role::Row, Role::Contract, Role::Col]);

    let batch_dims = dims.batch.map(|b| b.map(Some)).unwrap_or([None; 3]);
    let (input_sem, other_sem, output_sem) = (dims.input_dims(), dims.other_dims(), dims.output_dims());

    let mut strategies = Vec::new();
    for assignment in itertools::repeat_n(roles.iter().copied(), mesh.n_axes()).multi_cartesian_product() {
        let axes_for = |role: Role| -> Vec<usize> {
            assignment
                .iter()
                .enumerate()
                .filter(|(_, r)| **r == role)
                .map(|(axis, _)| axis)
                .collect()
        };
        let (batch, row, contract, col) = (
            axes_for(Role::Batch),
            axes_for(Role::Row),
            axes_for(Role::Contract),
            axes_for(Role::Col),
        );

        let layouts = [
            (
                "input",
                input,
                partition(&[
                    (batch_dims[0], &batch),
                    (Some(dims.row[0]), &row),
                    (Some(dims.contract[0]), &contract),
                ]),
            ),
            (
                "other",
                other,
                partition(&[
                    (batch_dims[1], &batch),
                    (Some(dims.contract[1]), &contract),
                    (Some(dims.col[0]), &col),
                ]),
            ),
            (
                "output",
                output,
                partition(&[
                    (batch_dims[2], &batch),
                    (Some(dims.row[1]), &row),
                    (Some(dims.col[1]), &col),
                ]),
            ),
        ];
        let mut specs = BTreeMap::new();
        let mut valid = true;
        for (key, data, dim_partition) in layouts {
            match ShardingSpec::new(data.logical_shape.clone(), dim_partition, mesh) {
                Ok(spec) => {
                    specs.insert(key.to_string(), spec);
                }
                Err(_) => {
                    valid = false;
                    break;
                }
            }
        }
        if let Some(bias) = bias {
            match ShardingSpec::new(bias.logical_shape.clone(), partition(&[(Some(0), &col)]), mesh) {
                Ok(spec) => {
                    specs.insert("bias".to_string(), spec);
                }
                Err(_) => valid = false,
            }
        }
        if !valid {
            continue;
        }

        let (input_spec, other_spec, output_spec) = (&specs["input"], &specs["other"], &specs["output"]);
        let local = |spec: &ShardingSpec, dim: Option<usize>| {
            dim.map(|d| spec.local_shape(mesh)[d]).unwrap_or(1)
        };
        // per output element: contraction length times any kernel window
        let per_output = other_spec.local_numel(mesh)
            / (local(other_spec, Some(dims.col[0])) * local(other_spec, batch_dims[1])).max(1);
        let flops = 2u64
            .saturating_mul(output_spec.local_numel(mesh))
            .saturating_mul(per_output);
        let fwd = mesh.compute_cost(flops);

        let collectives = [
            all_reduce(mapping, &specs, mesh, "output", &contract, Phase::Forward),
            all_reduce(mapping, &specs, mesh, "input", &col, Phase::Backward),
            all_reduce(mapping, &specs, mesh, "other", &row, Phase::Backward),
            all_reduce(mapping, &specs, mesh, "bias", &row, Phase::Backward),
        ]
        .into_iter()
        .flatten()
        .collect_vec();

        let name = format!(
            "{} = {} x {}",
            output_spec.project(&output_sem),
            input_spec.project(&input_sem),
            other_spec.project(&other_sem)
        );
        strategies.push(ShardingStrategy {
            name,
            compute_cost: TrainCost::new(fwd, 2.0 * fwd),
            communication_cost: communication_cost(&collectives),
            memory_cost: memory_cost(mapping, &specs, mesh),
            sharding_specs: specs,
            collectives,
        });
    }
    Ok(strategies)
}

/// Lays `anchor` onto an operand of `shape`, aligning trailing dims.
/// Broadcast dims stay replicated.
fn follow(node: &str, anchor: &ShardingSpec, shape: &[u64], mesh: &DeviceMesh) -> Result<ShardingSpec> {
    let anchor_shape = anchor.entire_shape();
    if shape.len() > anchor_shape.len() {
        return Err(AutoShardError::shape_mismatch(
            node,
            format!("operand {:?} has higher rank than {:?}", shape, anchor_shape),
        ));
    }
    let offset = anchor_shape.len() - shape.len();
    let dim_partition = (0..shape.len())
        .filter(|&d| shape[d] == anchor_shape[d + offset])
        .filter_map(|d| match anchor.axes_of(d + offset) {
            [] => None,
            axes => Some((d, axes.to_vec())),
        })
        .collect();
    ShardingSpec::new(shape.to_vec(), dim_partition, mesh)
}

fn elementwise_strategies(
    node: &str,
    frozen: &[usize],
    mapping: &OperationDataMapping,
    mesh: &DeviceMesh,
) -> Result<Vec<ShardingStrategy>> {
    let anchor_key = if mapping.contains("output") { "output" } else { "input" };
    let anchor = require(node, mapping, anchor_key)?;

    let mut strategies = Vec::new();
    for layout in enumerate_layouts(&anchor.logical_shape, mesh, frozen) {
        let mut specs = BTreeMap::new();
        let mut collectives = Vec::new();
        for (key, data) in mapping.iter() {
            if key == anchor_key {
                specs.insert(key.to_string(), layout.clone());
                continue;
            }
            let spec = follow(node, &layout, &data.logical_shape, mesh)?;
            let used = spec.used_axes();
            // gradient of a broadcast operand is partial over the axes it misses
            let partial = layout
                .used_axes()
                .into_iter()
                .filter(|a| !used.contains(a))
                .collect_vec();
            specs.insert(key.to_string(), spec);
            if data.role != OperationDataType::Output {
                collectives.extend(all_reduce(mapping, &specs, mesh, key, &partial, Phase::Backward));
            }
        }
        let fwd = mesh.compute_cost(layout.local_numel(mesh));
        strategies.push(ShardingStrategy {
            name: name_from_specs(&specs),
            compute_cost: TrainCost::new(fwd, fwd),
            communication_cost: communication_cost(&collectives),
            memory_cost: memory_cost(mapping, &specs, mesh),
            sharding_specs: specs,
            collectives,
        });
    }
    Ok(strategies)
}
