//! Shared helpers: a per-device tensor simulator.
#![allow(dead_code)]

use autoshard::device_mesh::DeviceMesh;
use autoshard::shape_consistency::{CommPrimitive, CommunicationAction};
use autoshard::sharding::ShardingSpec;

/// Dense row-major tensor of any rank.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl Tensor {
    pub fn arange(shape: &[usize]) -> Self {
        let n = shape.iter().product();
        Tensor {
            shape: shape.to_vec(),
            data: (0..n).map(|i| i as f64).collect(),
        }
    }

    fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.shape.len()];
        for d in (0..self.shape.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * self.shape[d + 1];
        }
        strides
    }

    /// Block `index` of `parts` equal blocks along `dim`.
    pub fn chunk(&self, dim: usize, parts: usize, index: usize) -> Tensor {
        let len = self.shape[dim] / parts;
        let mut shape = self.shape.clone();
        shape[dim] = len;
        let strides = self.strides();
        let n: usize = shape.iter().product();
        let mut data = Vec::with_capacity(n);
        for flat in 0..n {
            let mut rem = flat;
            let mut offset = 0;
            for d in (0..shape.len()).rev() {
                let mut i = rem % shape[d];
                rem /= shape[d];
                if d == dim {
                    i += index * len;
                }
                offset += i * strides[d];
            }
            data.push(self.data[offset]);
        }
        Tensor { shape, data }
    }

    /// Concatenation along `dim`.
    pub fn concat(parts: &[Tensor], dim: usize) -> Tensor {
        let mut shape = parts[0].shape.clone();
        shape[dim] = parts.iter().map(|p| p.shape[dim]).sum();
        let outer: usize = shape[..dim].iter().product();
        let mut data = Vec::with_capacity(shape.iter().product());
        for o in 0..outer {
            for part in parts {
                let inner: usize = part.shape[dim..].iter().product();
                data.extend_from_slice(&part.data[o * inner..(o + 1) * inner]);
            }
        }
        Tensor { shape, data }
    }

    /// `[m, k] x [k, n]`.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        let (m, k, n) = (self.shape[0], self.shape[1], other.shape[1]);
        assert_eq!(k, other.shape[0]);
        let mut data = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                data[i * n + j] = (0..k).map(|p| self.data[i * k + p] * other.data[p * n + j]).sum();
            }
        }
        Tensor { shape: vec![m, n], data }
    }

    pub fn transpose(&self) -> Tensor {
        let (m, n) = (self.shape[0], self.shape[1]);
        let mut data = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                data[j * m + i] = self.data[i * n + j];
            }
        }
        Tensor { shape: vec![n, m], data }
    }

    pub fn add(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape, other.shape);
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().zip(&other.data).map(|(a, b)| a + b).collect(),
        }
    }

    /// Small signed integers with no symmetry, so gradients stay exact.
    pub fn pattern(shape: &[usize]) -> Self {
        let n = shape.iter().product();
        Tensor {
            shape: shape.to_vec(),
            data: (0..n).map(|i| ((i * 5 + 3) % 11) as f64 - 5.0).collect(),
        }
    }

    pub fn reshape(&self, shape: &[usize]) -> Tensor {
        assert_eq!(shape.iter().product::<usize>(), self.data.len());
        Tensor {
            shape: shape.to_vec(),
            data: self.data.clone(),
        }
    }

    /// Folds every leading dim into rows, keeping the last dim.
    pub fn flatten_rows(&self) -> Tensor {
        let cols = self.shape[self.shape.len() - 1];
        self.reshape(&[self.data.len() / cols, cols])
    }

    pub fn mul(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape, other.shape);
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().zip(&other.data).map(|(a, b)| a * b).collect(),
        }
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// `[m, n]` summed over rows into `[n]`.
    pub fn sum_rows(&self) -> Tensor {
        let n = self.shape[1];
        let mut data = vec![0.0; n];
        for (i, v) in self.data.iter().enumerate() {
            data[i % n] += v;
        }
        Tensor { shape: vec![n], data }
    }

    /// `[m, n]` plus a `[n]` row broadcast over every row.
    pub fn add_row(&self, row: &Tensor) -> Tensor {
        let n = self.shape[1];
        assert_eq!(row.shape, vec![n]);
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().enumerate().map(|(i, v)| v + row.data[i % n]).collect(),
        }
    }

    /// Applies `f` to each `[m, n]` slice of a `[b, m, n]` tensor and stacks the results.
    pub fn per_batch(&self, other: &Tensor, f: impl Fn(&Tensor, &Tensor) -> Tensor) -> Tensor {
        let b = self.shape[0];
        assert_eq!(b, other.shape[0]);
        let slice = |t: &Tensor, i: usize| t.chunk(0, b, i).reshape(&t.shape[1..]);
        let parts: Vec<Tensor> = (0..b)
            .map(|i| {
                let out = f(&slice(self, i), &slice(other, i));
                let mut shape = vec![1];
                shape.extend(&out.shape);
                out.reshape(&shape)
            })
            .collect();
        Tensor::concat(&parts, 0)
    }

    /// `[b, m, n]` with the last two dims swapped.
    pub fn transpose_batch(&self) -> Tensor {
        self.per_batch(self, |t, _| t.transpose())
    }
}

/// The block of `global` device `rank` holds under `spec`.
pub fn shard(global: &Tensor, spec: &ShardingSpec, mesh: &DeviceMesh, rank: usize) -> Tensor {
    let coords = mesh.coordinates(rank);
    let mut local = global.clone();
    for dim in 0..spec.rank() {
        let mut parts = 1;
        let mut index = 0;
        // outermost axis first
        for &axis in spec.axes_of(dim) {
            parts *= mesh.axis_size(axis);
            index = index * mesh.axis_size(axis) + coords[axis];
        }
        if parts > 1 {
            local = local.chunk(dim, parts, index);
        }
    }
    local
}

/// Ranks sharing every coordinate with `rank` except along `axis`, ordered by
/// their coordinate on `axis`.
fn group_of(mesh: &DeviceMesh, rank: usize, axis: usize) -> Vec<usize> {
    let coords = mesh.coordinates(rank);
    (0..mesh.axis_size(axis))
        .map(|i| {
            let mut c = coords.clone();
            c[axis] = i;
            mesh.rank_of(&c)
        })
        .collect()
}

/// Sums blocks across ranks that differ only along `axes`.
pub fn all_reduce(blocks: &[Tensor], axes: &[usize], mesh: &DeviceMesh) -> Vec<Tensor> {
    (0..blocks.len())
        .map(|rank| {
            let coords = mesh.coordinates(rank);
            (0..blocks.len())
                .filter(|&peer| {
                    let other = mesh.coordinates(peer);
                    (0..coords.len()).all(|a| axes.contains(&a) || coords[a] == other[a])
                })
                .map(|peer| blocks[peer].clone())
                .reduce(|acc, b| acc.add(&b))
                .unwrap()
        })
        .collect()
}

/// Runs every step of `action` on per-device blocks.
pub fn run_action(blocks: Vec<Tensor>, action: &CommunicationAction, mesh: &DeviceMesh) -> Vec<Tensor> {
    let mut blocks = blocks;
    for step in &action.steps {
        let axis = step.axis;
        let gather = |blocks: &[Tensor], dim: usize| -> Vec<Tensor> {
            (0..blocks.len())
                .map(|rank| {
                    let parts: Vec<Tensor> = group_of(mesh, rank, axis).iter().map(|&r| blocks[r].clone()).collect();
                    Tensor::concat(&parts, dim)
                })
                .collect()
        };
        let split = |blocks: Vec<Tensor>, dim: usize| -> Vec<Tensor> {
            blocks
                .into_iter()
                .enumerate()
                .map(|(rank, b)| b.chunk(dim, mesh.axis_size(axis), mesh.coordinates(rank)[axis]))
                .collect()
        };
        blocks = match step.primitive {
            CommPrimitive::AllGather { dim } => gather(&blocks, dim),
            CommPrimitive::Split { dim } => split(blocks, dim),
            CommPrimitive::AllToAll { from_dim, to_dim } => split(gather(&blocks, from_dim), to_dim),
        };
    }
    blocks
}
