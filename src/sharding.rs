use std::collections::BTreeMap;

use itertools::Itertools;
use serde::Serialize;

use crate::device_mesh::DeviceMesh;
use crate::error::{AutoShardError, Result};

/// Layout of one logical tensor dimension.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
pub enum DimSpec {
    Replicated,
    /// Split along these mesh axes, outermost first.
    Sharded(Vec<usize>),
}

impl std::fmt::Display for DimSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DimSpec::Replicated => write!(f, "R"),
            DimSpec::Sharded(axes) => {
                write!(f, "S")?;
                for axis in axes {
                    write!(f, "{}", axis)?;
                }
                Ok(())
            }
        }
    }
}

/// How a tensor of `entire_shape` is laid out over a device mesh.
///
/// Each mesh axis shards at most one dimension, and every sharded dimension
/// divides evenly by the product of its axes' sizes. Dimensions absent from
/// the partition map are replicated.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct ShardingSpec {
    entire_shape: Vec<u64>,
    dim_partition: BTreeMap<usize, Vec<usize>>,
}

impl ShardingSpec {
    pub fn new(
        entire_shape: impl Into<Vec<u64>>,
        dim_partition: BTreeMap<usize, Vec<usize>>,
        mesh: &DeviceMesh,
    ) -> Result<Self> {
        let entire_shape = entire_shape.into();
        let mut used = vec![false; mesh.n_axes()];
        for (&dim, axes) in &dim_partition {
            if dim >= entire_shape.len() {
                return Err(AutoShardError::InvalidShardingSpec(format!(
                    "dim {} out of range for shape {:?}",
                    dim, entire_shape
                )));
            }
            if axes.is_empty() {
                return Err(AutoShardError::InvalidShardingSpec(format!(
                    "dim {} has an empty mesh axis list",
                    dim
                )));
            }
            for &axis in axes {
                if axis >= mesh.n_axes() {
                    return Err(AutoShardError::InvalidShardingSpec(format!(
                        "mesh axis {} out of range for mesh {:?}",
                        axis,
                        mesh.shape()
                    )));
                }
                if std::mem::replace(&mut used[axis], true) {
                    return Err(AutoShardError::InvalidShardingSpec(format!(
                        "mesh axis {} shards more than one dimension",
                        axis
                    )));
                }
            }
            let factor = mesh.shard_factor(axes) as u64;
            if entire_shape[dim] % factor != 0 {
                return Err(AutoShardError::InvalidShardingSpec(format!(
                    "dim {} of size {} is not divisible by {}",
                    dim, entire_shape[dim], factor
                )));
            }
        }
        Ok(ShardingSpec {
            entire_shape,
            dim_partition,
        })
    }

    pub fn replicated(entire_shape: impl Into<Vec<u64>>) -> Self {
        ShardingSpec {
            entire_shape: entire_shape.into(),
            dim_partition: BTreeMap::new(),
        }
    }

    pub fn entire_shape(&self) -> &[u64] {
        &self.entire_shape
    }

    pub fn rank(&self) -> usize {
        self.entire_shape.len()
    }

    pub fn dim_partition(&self) -> &BTreeMap<usize, Vec<usize>> {
        &self.dim_partition
    }

    pub fn axes_of(&self, dim: usize) -> &[usize] {
        self.dim_partition.get(&dim).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_replicated(&self) -> bool {
        self.dim_partition.is_empty()
    }

    /// Mesh axes used by any dimension, ascending.
    pub fn used_axes(&self) -> Vec<usize> {
        self.dim_partition.values().flatten().copied().sorted().collect()
    }

    pub fn sharding_sequence(&self) -> Vec<DimSpec> {
        (0..self.rank()).map(|dim| self.dim_spec(dim)).collect()
    }

    pub fn dim_spec(&self, dim: usize) -> DimSpec {
        match self.dim_partition.get(&dim) {
            Some(axes) => DimSpec::Sharded(axes.clone()),
            None => DimSpec::Replicated,
        }
    }

    pub fn shard_factor(&self, dim: usize, mesh: &DeviceMesh) -> u64 {
        mesh.shard_factor(self.axes_of(dim)) as u64
    }

    pub fn local_shape(&self, mesh: &DeviceMesh) -> Vec<u64> {
        self.entire_shape
            .iter()
            .enumerate()
            .map(|(dim, &size)| size / self.shard_factor(dim, mesh))
            .collect()
    }

    pub fn local_numel(&self, mesh: &DeviceMesh) -> u64 {
        self.local_shape(mesh).iter().product()
    }

    /// Sequence string restricted to `dims`, e.g. the semantic dims of a conv.
    pub fn project(&self, dims: &[usize]) -> String {
        dims.iter().map(|&d| self.dim_spec(d).to_string()).collect()
    }

    /// Swaps two dimensions, moving their shardings with them.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Self {
        let mut entire_shape = self.entire_shape.clone();
        entire_shape.swap(dim0, dim1);
        let dim_partition = self
            .dim_partition
            .iter()
            .map(|(&dim, axes)| {
                let dim = match dim {
                    d if d == dim0 => dim1,
                    d if d == dim1 => dim0,
                    d => d,
                };
                (dim, axes.clone())
            })
            .collect();
        ShardingSpec {
            entire_shape,
            dim_partition,
        }
    }
}

impl std::fmt::Display for ShardingSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for dim_spec in self.sharding_sequence() {
            write!(f, "{}", dim_spec)?;
        }
        Ok(())
    }
}

/// Every valid layout of `shape` on `mesh` that leaves `frozen` dims replicated.
///
/// Each mesh axis is either unused or assigned to one dimension; axes sharing
/// a dimension are ordered ascending. The fully replicated layout comes first.
pub fn enumerate_layouts(shape: &[u64], mesh: &DeviceMesh, frozen: &[usize]) -> Vec<ShardingSpec> {
    let choices = (0..shape.len())
        .filter(|d| !frozen.contains(d))
        .map(Some)
        .collect_vec();
    itertools::repeat_n(
        std::iter::once(None).chain(choices.iter().copied()),
        mesh.n_axes(),
    )
    .multi_cartesian_product()
    .filter_map(|assignment| {
        let mut dim_partition: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (axis, dim) in assignment.into_iter().enumerate() {
            if let Some(dim) = dim {
                dim_partition.entry(dim).or_default().push(axis);
            }
        }
        ShardingSpec::new(shape.to_vec(), dim_partition, mesh).ok()
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh() -> DeviceMesh {
        DeviceMesh::new([2, 2]).unwrap()
    }

    #[test]
    fn test_sharding_sequence_display() {
        let spec = ShardingSpec::new(
            vec![16, 32],
            BTreeMap::from([(0, vec![0, 1])]),
            &mesh(),
        )
        .unwrap();
        assert_eq!(spec.to_string(), "S01R");
        assert_eq!(spec.local_shape(&mesh()), vec![4, 32]);
        assert_eq!(ShardingSpec::replicated(vec![4, 4]).to_string(), "RR");
    }

    #[test]
    fn test_spec_rejects_invalid_partitions() {
        let m = mesh();
        // axis reused
        assert!(ShardingSpec::new(vec![4, 4], BTreeMap::from([(0, vec![0]), (1, vec![0])]), &m).is_err());
        // not divisible
        assert!(ShardingSpec::new(vec![3, 4], BTreeMap::from([(0, vec![0])]), &m).is_err());
        // dim out of range
        assert!(ShardingSpec::new(vec![4], BTreeMap::from([(1, vec![0])]), &m).is_err());
        // unknown mesh axis
        assert!(ShardingSpec::new(vec![4], BTreeMap::from([(0, vec![2])]), &m).is_err());
    }

    #[test]
    fn test_transpose_moves_sharding() {
        let spec = ShardingSpec::new(vec![16, 32], BTreeMap::from([(1, vec![1])]), &mesh()).unwrap();
        let t = spec.transpose(0, 1);
        assert_eq!(t.entire_shape(), &[32, 16]);
        assert_eq!(t.to_string(), "S1R");
    }

    #[test]
    fn test_enumerate_layouts() {
        let layouts = enumerate_layouts(&[4, 4], &mesh(), &[]);
        let names = layouts.iter().map(|s| s.to_string()).collect_vec();
        assert_eq!(names.len(), 9);
        assert_eq!(names[0], "RR");
        assert!(names.contains(&"S01R".to_string()));
        assert!(names.contains(&"S1S0".to_string()));
        assert!(!names.contains(&"S10R".to_string()));

        let frozen = enumerate_layouts(&[4, 4], &mesh(), &[1]);
        assert!(frozen.iter().all(|s| s.axes_of(1).is_empty()));
        assert_eq!(frozen.len(), 4);

        // dimension of size 2 can't take both axes
        let small = enumerate_layouts(&[2], &mesh(), &[]);
        assert_eq!(small.len(), 3);
    }
}
