//! Gate/value resharding for gated linear unit weights
//!
//! A gated projection (SwiGLU, GeGLU) fuses two weights into one tensor: on
//! every tensor-parallel rank the local fc1 shard is `[gate_r; value_r]`
//! stacked along axis 0. Written as-is, the checkpoint would interleave gate
//! and value blocks in a rank-count dependent order. Instead each half is
//! saved as its own set of fragments:
//!
//! ```text
//! fused axis fragmentation f, rank offset r
//!   gate  -> slot r     of 2f
//!   value -> slot r + f of 2f
//! ```
//!
//! so the logical tensor on disk is always `[gate_all; value_all]` and can be
//! reloaded under any tensor-parallel size.

use std::cmp::{max, min};
use std::ops::Range;
use std::sync::Arc;

use crate::error::{CheckpointError, Result};
use crate::factory::{ShardTransform, ShardedTensorFactory};
use crate::sharded::{RankOffset, ReplicaId, ShardedTensor};
use crate::tensor::{shape, HostTensor};

/// Geometry of one fused gate/value fragment, captured before any split
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GluContext {
    /// Global index of the fused axis (tensor axis 0)
    pub axis: usize,
    pub prepend_axis_num: usize,
    /// Non-flat shape of the fused local fragment
    pub local_shape: Vec<usize>,
    /// Fragment index along the fused axis before the split
    pub rank_offset: usize,
    /// Fragmentation of the fused axis before the split
    pub axis_frag: usize,
    /// Placement along every other axis, carried over unchanged
    pub other_offsets: Vec<RankOffset>,
}

impl GluContext {
    /// Capture the geometry of `original`, checking the layout is splittable
    pub fn from_descriptor(original: &ShardedTensor) -> Result<Self> {
        let key = &original.key;
        let axis = original.prepend_axis_num;

        let local_axis_size = match original.local_shape.first() {
            Some(&size) => size,
            None => {
                return Err(CheckpointError::UnsupportedFusion {
                    key: key.clone(),
                    reason: "scalar tensors have no fused axis".to_string(),
                })
            }
        };
        if local_axis_size == 0 || local_axis_size % 2 != 0 {
            return Err(CheckpointError::UnsupportedFusion {
                key: key.clone(),
                reason: format!(
                    "fused axis of size {} cannot be split into two equal halves",
                    local_axis_size
                ),
            });
        }

        let (offset, axis_frag) = match (
            original.global_offset.get(axis),
            original.axis_fragmentations.get(axis),
        ) {
            (Some(&offset), Some(&frag)) => (offset, frag),
            _ => {
                return Err(CheckpointError::InvalidRankOffset {
                    key: key.clone(),
                    reason: format!(
                        "fused axis {} is outside the global offset or fragmentation of the descriptor",
                        axis
                    ),
                })
            }
        };
        if offset % local_axis_size != 0 {
            return Err(CheckpointError::MisalignedOffset {
                key: key.clone(),
                axis,
                offset,
                local_size: local_axis_size,
            });
        }

        let other_offsets = original
            .rank_offsets()?
            .into_iter()
            .filter(|ro| ro.axis != axis)
            .collect();

        Ok(Self {
            axis,
            prepend_axis_num: original.prepend_axis_num,
            local_shape: original.local_shape.clone(),
            rank_offset: offset / local_axis_size,
            axis_frag,
            other_offsets,
        })
    }

    /// Rank offsets of the gate half
    pub fn offsets_w(&self) -> Vec<RankOffset> {
        self.with_fused_axis(RankOffset::new(self.axis, self.rank_offset, self.axis_frag * 2))
    }

    /// Rank offsets of the value half
    pub fn offsets_v(&self) -> Vec<RankOffset> {
        self.with_fused_axis(RankOffset::new(
            self.axis,
            self.rank_offset + self.axis_frag,
            self.axis_frag * 2,
        ))
    }

    /// Local shape of one half
    pub fn half_local_shape(&self) -> Vec<usize> {
        let mut half = self.local_shape.clone();
        half[0] /= 2;
        half
    }

    /// Elements in one half of the fused local fragment
    pub fn chunk_numel(&self) -> usize {
        shape::numel(&self.local_shape) / 2
    }

    fn with_fused_axis(&self, fused: RankOffset) -> Vec<RankOffset> {
        let mut offsets = self.other_offsets.clone();
        offsets.push(fused);
        offsets.sort_by_key(|ro| ro.axis);
        offsets
    }
}

/// Split a fused fragment into its gate and value fragments
///
/// Natural-shape fragments always yield `[w, v]`. Flattened fragments yield
/// only the halves their range overlaps, in `w`, `v` order.
pub fn split_gate_value(
    ctx: &GluContext,
    key: &str,
    data: &HostTensor,
    replica_id: &ReplicaId,
    flattened_range: Option<&Range<usize>>,
) -> Result<Vec<ShardedTensor>> {
    let result = match flattened_range {
        None => split_natural(ctx, key, data, replica_id)?,
        Some(range) => split_flattened(ctx, key, data, replica_id, range)?,
    };

    tracing::debug!(
        "Split {} into {} fragment(s): rank offset {} of {} -> fragmentation {}",
        key,
        result.len(),
        ctx.rank_offset,
        ctx.axis_frag,
        ctx.axis_frag * 2
    );
    Ok(result)
}

fn split_natural(
    ctx: &GluContext,
    key: &str,
    data: &HostTensor,
    replica_id: &ReplicaId,
) -> Result<Vec<ShardedTensor>> {
    if data.shape() != ctx.local_shape.as_slice() {
        return Err(CheckpointError::ShapeMismatch {
            key: key.to_string(),
            expected: ctx.local_shape.clone(),
            got: data.shape().to_vec(),
        });
    }

    let half = ctx.local_shape[0] / 2;
    let tensor_w = data.narrow_rows(0, half)?;
    let tensor_v = data.narrow_rows(half, half)?;

    Ok(vec![
        ShardedTensor::from_rank_offsets(
            key,
            tensor_w,
            &ctx.offsets_w(),
            replica_id.clone(),
            ctx.prepend_axis_num,
        )?,
        ShardedTensor::from_rank_offsets(
            key,
            tensor_v,
            &ctx.offsets_v(),
            replica_id.clone(),
            ctx.prepend_axis_num,
        )?,
    ])
}

/// Map a slice of the flattened fused fragment onto slices of the two
/// flattened halves.
///
/// For a `(16, 5)` fragment (`chunk_numel = 40`) holding `[8, 64)`, the 56
/// elements split into `w = [8, 40)` (first 32) and `v = [0, 24)` (last 24).
fn split_flattened(
    ctx: &GluContext,
    key: &str,
    data: &HostTensor,
    replica_id: &ReplicaId,
    range: &Range<usize>,
) -> Result<Vec<ShardedTensor>> {
    if data.ndim() != 1 {
        return Err(CheckpointError::UnsupportedFusion {
            key: key.to_string(),
            reason: format!("flattened fragment must be 1-D, got shape {:?}", data.shape()),
        });
    }

    let chunk_numel = ctx.chunk_numel();
    let (start, stop) = (range.start, range.end);
    if start >= stop || stop > 2 * chunk_numel {
        return Err(CheckpointError::InvalidFlattenedRange {
            key: key.to_string(),
            start,
            stop,
            numel: 2 * chunk_numel,
        });
    }
    let len = data.numel();
    if len != stop - start {
        return Err(CheckpointError::ShapeMismatch {
            key: key.to_string(),
            expected: vec![stop - start],
            got: data.shape().to_vec(),
        });
    }

    let half_shape = ctx.half_local_shape();
    let mut result = Vec::with_capacity(2);

    if start < chunk_numel {
        let range_w = start..min(chunk_numel, stop);
        let tensor_w = data.flat_slice(0, range_w.len())?;
        result.push(ShardedTensor::from_rank_offsets_flat(
            key,
            tensor_w,
            half_shape.clone(),
            &ctx.offsets_w(),
            replica_id.clone(),
            ctx.prepend_axis_num,
            range_w,
        )?);
    }

    if stop > chunk_numel {
        let range_v = max(chunk_numel, start) - chunk_numel..stop - chunk_numel;
        let tensor_v = data.flat_slice(len - range_v.len(), range_v.len())?;
        result.push(ShardedTensor::from_rank_offsets_flat(
            key,
            tensor_v,
            half_shape,
            &ctx.offsets_v(),
            replica_id.clone(),
            ctx.prepend_axis_num,
            range_v,
        )?);
    }

    let produced: usize = result.iter().map(|sh| sh.data.numel()).sum();
    if produced != len {
        return Err(CheckpointError::ElementCountMismatch {
            key: key.to_string(),
            expected: len,
            produced,
        });
    }
    Ok(result)
}

/// Check that `fragments` are non-empty blocks of one dtype and shape
pub fn check_gate_value_blocks(key: &str, fragments: &[&HostTensor]) -> Result<()> {
    let first = fragments
        .first()
        .ok_or_else(|| CheckpointError::EmptyMerge(key.to_string()))?;
    if first.ndim() == 0 {
        return Err(CheckpointError::UnsupportedFusion {
            key: key.to_string(),
            reason: "cannot stack scalar fragments".to_string(),
        });
    }
    for fragment in &fragments[1..] {
        if fragment.dtype() != first.dtype() {
            return Err(CheckpointError::DtypeMismatch {
                expected: first.dtype(),
                got: fragment.dtype(),
            });
        }
        if fragment.shape() != first.shape() {
            return Err(CheckpointError::ShapeMismatch {
                key: key.to_string(),
                expected: first.shape().to_vec(),
                got: fragment.shape().to_vec(),
            });
        }
    }
    Ok(())
}

/// Stack `n` equal row blocks into one tensor, growing block 0 in place
///
/// Each later block is freed right after its rows are copied.
pub fn merge_gate_value(key: &str, fragments: Vec<HostTensor>) -> Result<HostTensor> {
    check_gate_value_blocks(key, &fragments.iter().collect::<Vec<_>>())?;
    let block_shape = fragments[0].shape().to_vec();
    let dtype = fragments[0].dtype();
    let block_bytes = fragments[0].size_bytes();

    let n = fragments.len();
    let mut fragments = fragments.into_iter();
    let mut merged = match fragments.next() {
        Some(first) => {
            let (bytes, copied) = first.into_owned_bytes();
            if copied {
                tracing::warn!("{}: first fragment is shared, merging into a copy", key);
            }
            bytes
        }
        None => return Err(CheckpointError::EmptyMerge(key.to_string())),
    };
    merged.resize(n * block_bytes, 0);

    for (i, fragment) in fragments.enumerate() {
        let row = i + 1;
        tracing::trace!("{}: copying block {}/{}", key, row + 1, n);
        merged[row * block_bytes..(row + 1) * block_bytes].copy_from_slice(fragment.as_bytes());
        // `fragment` is freed here, before the next block is touched
    }

    let mut shape = block_shape;
    shape[0] *= n;
    tracing::debug!("Merged {} fragment(s) of {} into {:?}", n, key, shape);
    Ok(HostTensor::from_owned_bytes(shape, dtype, merged))
}

/// The gate/value [`ShardTransform`]
#[derive(Debug, Clone)]
pub struct GluTransform {
    ctx: GluContext,
}

impl GluTransform {
    pub fn new(ctx: GluContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &GluContext {
        &self.ctx
    }
}

impl ShardTransform for GluTransform {
    fn split(
        &self,
        key: &str,
        data: &HostTensor,
        replica_id: &ReplicaId,
        flattened_range: Option<&Range<usize>>,
    ) -> Result<Vec<ShardedTensor>> {
        split_gate_value(&self.ctx, key, data, replica_id, flattened_range)
    }

    fn check_merge(
        &self,
        key: &str,
        flattened_range: Option<&Range<usize>>,
        fragments: &[&HostTensor],
    ) -> Result<()> {
        if flattened_range.is_some() {
            return Err(CheckpointError::UnsupportedFlattenedMerge {
                key: key.to_string(),
            });
        }
        check_gate_value_blocks(key, fragments)
    }

    fn merge(
        &self,
        key: &str,
        flattened_range: Option<&Range<usize>>,
        fragments: Vec<HostTensor>,
    ) -> Result<HostTensor> {
        if flattened_range.is_some() {
            return Err(CheckpointError::UnsupportedFlattenedMerge {
                key: key.to_string(),
            });
        }
        merge_gate_value(key, fragments)
    }
}

/// Wrap a fused gate/value fragment in a factory that saves the halves separately
///
/// Layout preconditions are checked here, before anything is split.
pub fn apply_glu_factory(original: ShardedTensor) -> Result<ShardedTensorFactory> {
    let ctx = GluContext::from_descriptor(&original)?;
    Ok(ShardedTensorFactory::new(
        original.key,
        original.data,
        Arc::new(GluTransform::new(ctx)),
        original.replica_id,
        original.flattened_range,
    ))
}
