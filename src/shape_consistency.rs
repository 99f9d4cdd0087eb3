//! Converting a tensor from one sharding layout to another.
//!
//! A conversion is a sequence of single-axis steps:
//!
//! ```text
//! S01 R  --all-gather(axis 1, dim 0)-->  S0 R  --all-to-all(axis 0, 0 -> 1)-->  R S0
//! ```
//!
//! Axes are peeled off a dimension innermost first, since gathering an outer
//! axis while an inner one is still split would not leave a contiguous block.
//! An axis leaving one dimension is moved straight into another with an
//! all-to-all when it lands as that dimension's next inner axis; otherwise it
//! is gathered and later re-split. Splits are local slicing and cost nothing
//! on the forward pass.

use serde::Serialize;

use crate::device_mesh::{CollectiveType, DeviceMesh};
use crate::error::{AutoShardError, Result};
use crate::sharding::ShardingSpec;
use crate::strategy::TrainCost;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum CommPrimitive {
    AllGather { dim: usize },
    Split { dim: usize },
    AllToAll { from_dim: usize, to_dim: usize },
}

impl std::fmt::Display for CommPrimitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommPrimitive::AllGather { dim } => write!(f, "all-gather(dim {})", dim),
            CommPrimitive::Split { dim } => write!(f, "split(dim {})", dim),
            CommPrimitive::AllToAll { from_dim, to_dim } => {
                write!(f, "all-to-all(dim {} -> {})", from_dim, to_dim)
            }
        }
    }
}

/// One primitive applied along one mesh axis.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CommStep {
    pub primitive: CommPrimitive,
    pub axis: usize,
    /// Rank groups that run the primitive together.
    pub groups: Vec<Vec<usize>>,
    pub cost: TrainCost,
}

impl std::fmt::Display for CommStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on axis {}", self.primitive, self.axis)
    }
}

/// Everything needed to turn `source` into `target` at runtime.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CommunicationAction {
    pub source: ShardingSpec,
    pub target: ShardingSpec,
    pub steps: Vec<CommStep>,
}

impl CommunicationAction {
    pub fn cost(&self) -> TrainCost {
        self.steps
            .iter()
            .fold(TrainCost::default(), |acc, step| acc + step.cost)
    }

    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }
}

fn is_prefix(current: &[usize], target: &[usize]) -> bool {
    current.len() <= target.len() && target[..current.len()] == *current
}

/// Plans the steps converting `source` into `target`, both describing a
/// tensor whose elements are `element_bytes` wide.
pub fn plan_conversion(
    source: &ShardingSpec,
    target: &ShardingSpec,
    mesh: &DeviceMesh,
    element_bytes: u64,
) -> Result<CommunicationAction> {
    if source.rank() != target.rank() {
        return Err(AutoShardError::IncompatibleLayout(format!(
            "cannot convert rank {} layout {} into rank {} layout {}",
            source.rank(),
            source,
            target.rank(),
            target
        )));
    }
    if source.entire_shape() != target.entire_shape() {
        return Err(AutoShardError::IncompatibleLayout(format!(
            "cannot convert shape {:?} into shape {:?}",
            source.entire_shape(),
            target.entire_shape()
        )));
    }

    let rank = source.rank();
    let mut current: Vec<Vec<usize>> = (0..rank).map(|d| source.axes_of(d).to_vec()).collect();
    let wanted: Vec<Vec<usize>> = (0..rank).map(|d| target.axes_of(d).to_vec()).collect();
    let mut local_bytes = source.local_numel(mesh) * element_bytes;
    let mut steps = Vec::new();

    loop {
        let mut changed = false;
        for dim in 0..rank {
            while !is_prefix(&current[dim], &wanted[dim]) {
                let Some(axis) = current[dim].pop() else {
                    break;
                };
                let n = mesh.axis_size(axis) as u64;
                let destination = wanted.iter().position(|w| w.contains(&axis)).filter(|&to| {
                    to != dim
                        && is_prefix(&current[to], &wanted[to])
                        && wanted[to].get(current[to].len()) == Some(&axis)
                });
                let step = match destination {
                    Some(to_dim) => {
                        current[to_dim].push(axis);
                        let cost = mesh.collective_cost(CollectiveType::AllToAll, &[axis], local_bytes);
                        CommStep {
                            primitive: CommPrimitive::AllToAll { from_dim: dim, to_dim },
                            axis,
                            groups: mesh.process_groups_along(axis),
                            cost: TrainCost::new(cost, cost),
                        }
                    }
                    None => {
                        let fwd = mesh.collective_cost(CollectiveType::AllGather, &[axis], local_bytes);
                        local_bytes *= n;
                        CommStep {
                            primitive: CommPrimitive::AllGather { dim },
                            axis,
                            groups: mesh.process_groups_along(axis),
                            // the gradient is split back out locally
                            cost: TrainCost::new(fwd, 0.0),
                        }
                    }
                };
                steps.push(step);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    for dim in 0..rank {
        let missing = wanted[dim][current[dim].len()..].to_vec();
        for axis in missing {
            let n = mesh.axis_size(axis) as u64;
            local_bytes /= n;
            current[dim].push(axis);
            // gradients of a split are gathered on the way back
            let bwd = mesh.collective_cost(CollectiveType::AllGather, &[axis], local_bytes);
            steps.push(CommStep {
                primitive: CommPrimitive::Split { dim },
                axis,
                groups: mesh.process_groups_along(axis),
                cost: TrainCost::new(0.0, bwd),
            });
        }
    }

    debug_assert_eq!(current, wanted);
    Ok(CommunicationAction {
        source: source.clone(),
        target: target.clone(),
        steps,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn mesh() -> DeviceMesh {
        DeviceMesh::new([2, 2]).unwrap()
    }

    fn spec(shape: &[u64], partition: &[(usize, &[usize])]) -> ShardingSpec {
        let dims = partition
            .iter()
            .map(|(d, axes)| (*d, axes.to_vec()))
            .collect::<BTreeMap<_, _>>();
        ShardingSpec::new(shape.to_vec(), dims, &mesh()).unwrap()
    }

    #[test]
    fn test_identical_specs_need_nothing() {
        let s = spec(&[8, 8], &[(0, &[0])]);
        let action = plan_conversion(&s, &s, &mesh(), 4).unwrap();
        assert!(action.is_noop());
        assert_eq!(action.cost().total(), 0.0);
    }

    #[test]
    fn test_gather_to_replicated() {
        let src = spec(&[8, 8], &[(0, &[0, 1])]);
        let dst = ShardingSpec::replicated(vec![8, 8]);
        let action = plan_conversion(&src, &dst, &mesh(), 4).unwrap();
        let prims = action.steps.iter().map(|s| (s.primitive.clone(), s.axis)).collect::<Vec<_>>();
        assert_eq!(
            prims,
            vec![
                (CommPrimitive::AllGather { dim: 0 }, 1),
                (CommPrimitive::AllGather { dim: 0 }, 0)
            ]
        );
        assert!(action.cost().fwd > 0.0);
    }

    #[test]
    fn test_replicated_to_sharded_is_free_forward() {
        let src = ShardingSpec::replicated(vec![8, 8]);
        let dst = spec(&[8, 8], &[(0, &[0]), (1, &[1])]);
        let action = plan_conversion(&src, &dst, &mesh(), 4).unwrap();
        assert_eq!(action.steps.len(), 2);
        assert_eq!(action.cost().fwd, 0.0);
        assert!(action.cost().bwd > 0.0);
    }

    #[test]
    fn test_move_axis_uses_all_to_all() {
        let src = spec(&[8, 8], &[(0, &[0])]);
        let dst = spec(&[8, 8], &[(1, &[0])]);
        let action = plan_conversion(&src, &dst, &mesh(), 4).unwrap();
        assert_eq!(action.steps.len(), 1);
        assert_eq!(
            action.steps[0].primitive,
            CommPrimitive::AllToAll { from_dim: 0, to_dim: 1 }
        );
        assert_eq!(action.steps[0].groups, vec![vec![0, 2], vec![1, 3]]);
    }

    #[test]
    fn test_reordering_axes_regathers() {
        let src = spec(&[8, 8], &[(0, &[0, 1])]);
        let dst = spec(&[8, 8], &[(0, &[1, 0])]);
        let action = plan_conversion(&src, &dst, &mesh(), 4).unwrap();
        let gathers = action
            .steps
            .iter()
            .filter(|s| matches!(s.primitive, CommPrimitive::AllGather { .. }))
            .count();
        assert_eq!(gathers, 2);
        assert_eq!(action.steps.len(), 4);
    }

    #[test]
    fn test_rank_mismatch_is_incompatible() {
        let src = ShardingSpec::replicated(vec![8, 8]);
        let dst = ShardingSpec::replicated(vec![64]);
        let err = plan_conversion(&src, &dst, &mesh(), 4).unwrap_err();
        assert!(matches!(err, AutoShardError::IncompatibleLayout(_)));
    }
}
