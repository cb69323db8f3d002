//! Shard descriptors
//!
//! A [`ShardedTensor`] places one rank's fragment inside a logical global
//! tensor. The global tensor may carry `prepend_axis_num` leading axes that
//! come from an enclosing structure (for example a stack of layers); those
//! axes have local size 1 in every fragment.
//!
//! Fragments are normally built from rank offsets, i.e. `(axis, rank_offset,
//! fragmentation)` triples, rather than from raw element offsets:
//!
//! ```text
//! global_shape[axis]  = fragmentation * local_size(axis)
//! global_offset[axis] = rank_offset   * local_size(axis)
//! ```

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, Result};
use crate::tensor::{shape, HostTensor};

/// Replica identity of a fragment
///
/// Fragments that differ only in replica id hold identical data. The main
/// replica (all components zero) is the one the writer persists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(pub Vec<usize>);

impl ReplicaId {
    /// The main replica `(0,)`
    pub fn main() -> Self {
        Self(vec![0])
    }

    pub fn is_main(&self) -> bool {
        self.0.iter().all(|&id| id == 0)
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::main()
    }
}

impl From<usize> for ReplicaId {
    fn from(id: usize) -> Self {
        Self(vec![id])
    }
}

impl From<(usize, usize, usize)> for ReplicaId {
    fn from((a, b, c): (usize, usize, usize)) -> Self {
        Self(vec![a, b, c])
    }
}

/// Position of a fragment along one global axis, in units of fragments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankOffset {
    /// Global axis index, counting prepended axes
    pub axis: usize,
    /// Index of this fragment along the axis
    pub rank_offset: usize,
    /// Number of fragments the axis is divided into
    pub fragmentation: usize,
}

impl RankOffset {
    pub fn new(axis: usize, rank_offset: usize, fragmentation: usize) -> Self {
        Self {
            axis,
            rank_offset,
            fragmentation,
        }
    }
}

impl From<(usize, usize, usize)> for RankOffset {
    fn from((axis, rank_offset, fragmentation): (usize, usize, usize)) -> Self {
        Self::new(axis, rank_offset, fragmentation)
    }
}

/// One fragment of a logical tensor together with its placement
#[derive(Debug, Clone)]
pub struct ShardedTensor {
    /// Stable identity of the logical tensor
    pub key: String,
    /// Fragment data: `local_shape` block, or 1-D when flattened
    pub data: HostTensor,
    /// Non-flat shape of the fragment (tensor axes only)
    pub local_shape: Vec<usize>,
    /// Shape of the logical tensor, prepended axes first
    pub global_shape: Vec<usize>,
    /// Element offset of the fragment along each global axis
    pub global_offset: Vec<usize>,
    /// Fragment count along each global axis
    pub axis_fragmentations: Vec<usize>,
    pub replica_id: ReplicaId,
    /// Number of leading axes inherited from the enclosing structure
    pub prepend_axis_num: usize,
    /// Slice of the row-major flattened `local_shape` held in `data`
    pub flattened_range: Option<Range<usize>>,
}

impl ShardedTensor {
    /// Descriptor for a full `data` block placed by rank offsets
    pub fn from_rank_offsets(
        key: impl Into<String>,
        data: HostTensor,
        rank_offsets: &[RankOffset],
        replica_id: ReplicaId,
        prepend_axis_num: usize,
    ) -> Result<Self> {
        let key = key.into();
        let local_shape = data.shape().to_vec();
        let (global_shape, global_offset, axis_fragmentations) =
            layout_from_rank_offsets(&key, &local_shape, rank_offsets, prepend_axis_num)?;

        Ok(Self {
            key,
            data,
            local_shape,
            global_shape,
            global_offset,
            axis_fragmentations,
            replica_id,
            prepend_axis_num,
            flattened_range: None,
        })
    }

    /// Descriptor for a 1-D slice of a `local_shape` block placed by rank offsets
    pub fn from_rank_offsets_flat(
        key: impl Into<String>,
        data: HostTensor,
        local_shape: Vec<usize>,
        rank_offsets: &[RankOffset],
        replica_id: ReplicaId,
        prepend_axis_num: usize,
        flattened_range: Range<usize>,
    ) -> Result<Self> {
        let key = key.into();
        let numel = shape::numel(&local_shape);
        if flattened_range.start >= flattened_range.end || flattened_range.end > numel {
            return Err(CheckpointError::InvalidFlattenedRange {
                key,
                start: flattened_range.start,
                stop: flattened_range.end,
                numel,
            });
        }
        let expected = vec![flattened_range.len()];
        if data.shape() != expected.as_slice() {
            return Err(CheckpointError::ShapeMismatch {
                key,
                expected,
                got: data.shape().to_vec(),
            });
        }
        let (global_shape, global_offset, axis_fragmentations) =
            layout_from_rank_offsets(&key, &local_shape, rank_offsets, prepend_axis_num)?;

        Ok(Self {
            key,
            data,
            local_shape,
            global_shape,
            global_offset,
            axis_fragmentations,
            replica_id,
            prepend_axis_num,
            flattened_range: Some(flattened_range),
        })
    }

    /// Number of global axes, prepended ones included
    pub fn ndim(&self) -> usize {
        self.prepend_axis_num + self.local_shape.len()
    }

    pub fn is_flattened(&self) -> bool {
        self.flattened_range.is_some()
    }

    /// Elements of the non-flat local block
    pub fn local_numel(&self) -> usize {
        shape::numel(&self.local_shape)
    }

    /// Local extent of a global axis (1 on prepended axes)
    pub fn local_size(&self, axis: usize) -> usize {
        if axis < self.prepend_axis_num {
            1
        } else {
            self.local_shape[axis - self.prepend_axis_num]
        }
    }

    /// Rank offsets of every prepended axis and every fragmented tensor axis
    ///
    /// Feeding the result back into [`ShardedTensor::from_rank_offsets`]
    /// reproduces this descriptor's layout.
    pub fn rank_offsets(&self) -> Result<Vec<RankOffset>> {
        if self.global_offset.len() != self.ndim() || self.axis_fragmentations.len() != self.ndim() {
            return Err(CheckpointError::InvalidRankOffset {
                key: self.key.clone(),
                reason: format!(
                    "{} axes, but {} global offsets and {} fragmentations",
                    self.ndim(),
                    self.global_offset.len(),
                    self.axis_fragmentations.len()
                ),
            });
        }
        let mut offsets = Vec::new();
        for axis in 0..self.ndim() {
            let fragmentation = self.axis_fragmentations[axis];
            if axis >= self.prepend_axis_num && fragmentation == 1 {
                continue;
            }
            let local = self.local_size(axis);
            let offset = self.global_offset[axis];
            if local == 0 || offset % local != 0 {
                return Err(CheckpointError::MisalignedOffset {
                    key: self.key.clone(),
                    axis,
                    offset,
                    local_size: local,
                });
            }
            offsets.push(RankOffset::new(axis, offset / local, fragmentation));
        }
        Ok(offsets)
    }

    /// Global coordinates covered by the non-flat local block
    pub fn global_box(&self) -> Vec<Range<usize>> {
        (0..self.ndim())
            .map(|axis| {
                let start = self.global_offset[axis];
                start..start + self.local_size(axis)
            })
            .collect()
    }

    /// Replace the fragment data, keeping the placement
    ///
    /// Used by a loader to fill a descriptor produced at load time.
    pub fn with_data(mut self, data: HostTensor) -> Result<Self> {
        let expected = match &self.flattened_range {
            Some(range) => vec![range.len()],
            None => self.local_shape.clone(),
        };
        if data.shape() != expected.as_slice() {
            return Err(CheckpointError::ShapeMismatch {
                key: self.key,
                expected,
                got: data.shape().to_vec(),
            });
        }
        if data.dtype() != self.data.dtype() {
            return Err(CheckpointError::DtypeMismatch {
                expected: self.data.dtype(),
                got: data.dtype(),
            });
        }
        self.data = data;
        Ok(self)
    }
}

fn layout_from_rank_offsets(
    key: &str,
    local_shape: &[usize],
    rank_offsets: &[RankOffset],
    prepend_axis_num: usize,
) -> Result<(Vec<usize>, Vec<usize>, Vec<usize>)> {
    let ndim = prepend_axis_num + local_shape.len();
    let mut global_shape: Vec<usize> = std::iter::repeat(1)
        .take(prepend_axis_num)
        .chain(local_shape.iter().copied())
        .collect();
    let mut global_offset = vec![0; ndim];
    let mut axis_fragmentations = vec![1; ndim];
    let mut seen = vec![false; ndim];

    let invalid = |reason: String| CheckpointError::InvalidRankOffset {
        key: key.to_string(),
        reason,
    };

    for ro in rank_offsets {
        if ro.axis >= ndim {
            return Err(invalid(format!("axis {} out of range for {} axes", ro.axis, ndim)));
        }
        if seen[ro.axis] {
            return Err(invalid(format!("axis {} given more than once", ro.axis)));
        }
        if ro.fragmentation == 0 || ro.rank_offset >= ro.fragmentation {
            return Err(invalid(format!(
                "rank offset {} outside fragmentation {} on axis {}",
                ro.rank_offset, ro.fragmentation, ro.axis
            )));
        }
        seen[ro.axis] = true;

        let local = if ro.axis < prepend_axis_num {
            1
        } else {
            local_shape[ro.axis - prepend_axis_num]
        };
        global_shape[ro.axis] = ro.fragmentation * local;
        global_offset[ro.axis] = ro.rank_offset * local;
        axis_fragmentations[ro.axis] = ro.fragmentation;
    }

    Ok((global_shape, global_offset, axis_fragmentations))
}
