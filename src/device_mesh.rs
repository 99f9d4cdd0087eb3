//! Logical N-dimensional grid of devices and the alpha-beta model used to
//! price collectives along its axes.

use std::path::Path;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{AutoShardError, Result};

/// Default sustained throughput of one device.
pub const FLOPS_PER_US: f64 = 0.5 * 312e6;

/// Latency and inverse bandwidth of the links along one mesh axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisLink {
    pub alpha_us: f64,
    pub beta_us_per_byte: f64,
}

impl Default for AxisLink {
    fn default() -> Self {
        // ~5us launch latency, ~100 GB/s
        AxisLink {
            alpha_us: 5.0,
            beta_us_per_byte: 1e-5,
        }
    }
}

#[derive(Deserialize, Debug)]
struct ProfileRow {
    axis: usize,
    alpha_us: f64,
    beta_us_per_byte: f64,
}

/// Per-axis link model plus per-device compute throughput.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommProfile {
    pub links: Vec<AxisLink>,
    pub flops_per_us: f64,
}

impl CommProfile {
    pub fn uniform(n_axes: usize) -> Self {
        CommProfile {
            links: vec![AxisLink::default(); n_axes],
            flops_per_us: FLOPS_PER_US,
        }
    }

    /// Reads `axis,alpha_us,beta_us_per_byte` rows. Every axis must appear exactly once.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            let row: ProfileRow = row?;
            rows.push(row);
        }
        rows.sort_by_key(|r| r.axis);
        if rows.iter().enumerate().any(|(i, r)| r.axis != i) {
            return Err(AutoShardError::InvalidMesh(
                "communication profile must list axes 0..n exactly once".to_string(),
            ));
        }
        Ok(CommProfile {
            links: rows
                .into_iter()
                .map(|r| AxisLink {
                    alpha_us: r.alpha_us,
                    beta_us_per_byte: r.beta_us_per_byte,
                })
                .collect(),
            flops_per_us: FLOPS_PER_US,
        })
    }
}

/// Collectives the cost model knows how to price.
#[derive(Eq, PartialEq, Debug, Hash, Clone, Copy, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CollectiveType {
    AllGather,
    AllReduce,
    ReduceScatter,
    AllToAll,
}

/// A logical mesh of devices. Ranks are laid out row-major over `shape`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMesh {
    shape: Vec<usize>,
    profile: CommProfile,
}

impl DeviceMesh {
    pub fn new(shape: impl Into<Vec<usize>>) -> Result<Self> {
        let shape = shape.into();
        if shape.is_empty() {
            return Err(AutoShardError::InvalidMesh(
                "mesh must have at least one axis".to_string(),
            ));
        }
        if let Some(axis) = shape.iter().position(|&n| n == 0) {
            return Err(AutoShardError::InvalidMesh(format!(
                "axis {} has size 0 in mesh {:?}",
                axis, shape
            )));
        }
        let profile = CommProfile::uniform(shape.len());
        Ok(DeviceMesh { shape, profile })
    }

    pub fn with_profile(mut self, profile: CommProfile) -> Result<Self> {
        if profile.links.len() != self.shape.len() {
            return Err(AutoShardError::InvalidMesh(format!(
                "profile describes {} axes, mesh has {}",
                profile.links.len(),
                self.shape.len()
            )));
        }
        self.profile = profile;
        Ok(self)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn n_axes(&self) -> usize {
        self.shape.len()
    }

    pub fn num_devices(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn axis_size(&self, axis: usize) -> usize {
        self.shape[axis]
    }

    /// Number of devices taking part when sharding along all of `axes`.
    pub fn shard_factor(&self, axes: &[usize]) -> usize {
        axes.iter().map(|&a| self.shape[a]).product()
    }

    pub fn profile(&self) -> &CommProfile {
        &self.profile
    }

    pub fn coordinates(&self, rank: usize) -> Vec<usize> {
        let mut coords = vec![0; self.shape.len()];
        let mut rest = rank;
        for (axis, &size) in self.shape.iter().enumerate().rev() {
            coords[axis] = rest % size;
            rest /= size;
        }
        coords
    }

    pub fn rank_of(&self, coords: &[usize]) -> usize {
        coords
            .iter()
            .zip(&self.shape)
            .fold(0, |acc, (&c, &size)| acc * size + c)
    }

    /// Communication groups along `axes`: every group holds the ranks that
    /// differ only in those axes, ordered with `axes[0]` outermost.
    pub fn process_groups(&self, axes: &[usize]) -> Vec<Vec<usize>> {
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut seen = vec![false; self.num_devices()];
        for rank in 0..self.num_devices() {
            if seen[rank] {
                continue;
            }
            let base = self.coordinates(rank);
            let group = axes
                .iter()
                .map(|&a| 0..self.shape[a])
                .multi_cartesian_product()
                .map(|offsets| {
                    let mut coords = base.clone();
                    for (&a, o) in axes.iter().zip(offsets) {
                        coords[a] = o;
                    }
                    self.rank_of(&coords)
                })
                .collect_vec();
            // multi_cartesian_product yields nothing for an empty axis list
            let group = if axes.is_empty() { vec![rank] } else { group };
            for &r in &group {
                seen[r] = true;
            }
            groups.push(group);
        }
        groups
    }

    pub fn process_groups_along(&self, axis: usize) -> Vec<Vec<usize>> {
        self.process_groups(&[axis])
    }

    fn link_for(&self, axes: &[usize]) -> AxisLink {
        // a flattened group is bound by its slowest axis
        axes.iter()
            .map(|&a| self.profile.links[a])
            .fold(
                AxisLink {
                    alpha_us: 0.0,
                    beta_us_per_byte: 0.0,
                },
                |acc, l| AxisLink {
                    alpha_us: acc.alpha_us.max(l.alpha_us),
                    beta_us_per_byte: acc.beta_us_per_byte.max(l.beta_us_per_byte),
                },
            )
    }

    /// Time in microseconds of a collective over `axes`, where `local_bytes`
    /// is the per-device tensor size handed to the collective.
    pub fn collective_cost(&self, ctype: CollectiveType, axes: &[usize], local_bytes: u64) -> f64 {
        let n = self.shard_factor(axes) as f64;
        if n <= 1.0 {
            return 0.0;
        }
        let AxisLink {
            alpha_us,
            beta_us_per_byte,
        } = self.link_for(axes);
        let bytes = local_bytes as f64;
        match ctype {
            CollectiveType::AllGather => alpha_us + beta_us_per_byte * (n - 1.0) * bytes,
            CollectiveType::AllReduce => alpha_us + 2.0 * beta_us_per_byte * (n - 1.0) / n * bytes,
            CollectiveType::ReduceScatter | CollectiveType::AllToAll => {
                alpha_us + beta_us_per_byte * (n - 1.0) / n * bytes
            }
        }
    }

    pub fn compute_cost(&self, flops: u64) -> f64 {
        flops as f64 / self.profile.flops_per_us
    }
}

impl std::str::FromStr for DeviceMesh {
    type Err = AutoShardError;

    /// Parses a comma separated shape such as `2,4`.
    fn from_str(s: &str) -> Result<Self> {
        let shape = s
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<usize>()
                    .map_err(|e| AutoShardError::InvalidMesh(format!("bad axis size '{}': {}", part, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        DeviceMesh::new(shape)
    }
}
