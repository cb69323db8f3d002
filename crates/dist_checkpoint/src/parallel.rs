//! Tensor-parallel rank layout
//!
//! Placement conventions used by the linear layers that hand their weights
//! to the checkpoint layer:
//!
//! ## Column parallel (fc1)
//! - weight: [out, in] -> rows split across ranks: [out / tp, in]
//! - bias: [out] -> split: [out / tp]
//! - gated fc1 holds `[gate_r; value_r]`, i.e. [2 * ffn / tp, hidden]
//!
//! ## Row parallel (fc2)
//! - weight: [out, in] -> columns split across ranks: [out, in / tp]
//! - bias: replicated on every rank (only rank 0 is the main replica)
//!
//! Weights are identical across data-parallel ranks, which is expressed
//! through the replica id `(0, 0, dp_rank)`.

use serde::{Deserialize, Serialize};

use crate::config::MlpConfig;
use crate::error::{CheckpointError, Result};
use crate::sharded::{RankOffset, ReplicaId, ShardedTensor};
use crate::tensor::HostTensor;

/// Tensor-parallel position of the current process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorParallelConfig {
    /// Number of tensor-parallel ranks
    pub tp_size: usize,
    /// This process's tensor-parallel rank
    pub tp_rank: usize,
    /// This process's data-parallel rank
    pub dp_rank: usize,
}

impl Default for TensorParallelConfig {
    fn default() -> Self {
        Self {
            tp_size: 1,
            tp_rank: 0,
            dp_rank: 0,
        }
    }
}

impl TensorParallelConfig {
    pub fn new(tp_size: usize, tp_rank: usize) -> Self {
        Self {
            tp_size,
            tp_rank,
            dp_rank: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tp_size == 0 || self.tp_rank >= self.tp_size {
            return Err(CheckpointError::InvalidConfig(format!(
                "tp_rank ({}) must be below tp_size ({})",
                self.tp_rank, self.tp_size
            )));
        }
        Ok(())
    }

    /// Validate configuration against the MLP sizes
    pub fn validate_mlp(&self, mlp: &MlpConfig) -> Result<()> {
        self.validate()?;

        // Each rank holds a whole number of gate and value rows
        if mlp.ffn_hidden_size % self.tp_size != 0 {
            return Err(CheckpointError::InvalidConfig(format!(
                "FFN hidden size ({}) must be divisible by tp_size ({})",
                mlp.ffn_hidden_size, self.tp_size
            )));
        }

        Ok(())
    }

    /// Replica id of weights sharded over tensor-parallel ranks
    pub fn replica_id(&self) -> ReplicaId {
        ReplicaId::from((0, 0, self.dp_rank))
    }

    /// Replica id of weights replicated on every tensor-parallel rank
    pub fn replicated_id(&self) -> ReplicaId {
        ReplicaId::from((0, self.tp_rank, self.dp_rank))
    }
}

/// Rows of `full` owned by shard `shard_id` of `num_shards`
pub fn slice_rows(full: &HostTensor, shard_id: usize, num_shards: usize) -> Result<HostTensor> {
    let rows = full.shape().first().copied().unwrap_or(0);
    if num_shards == 0 || shard_id >= num_shards || rows % num_shards != 0 {
        return Err(CheckpointError::InvalidConfig(format!(
            "cannot take shard {} of {} from {} rows",
            shard_id, num_shards, rows
        )));
    }
    let shard_rows = rows / num_shards;
    full.narrow_rows(shard_id * shard_rows, shard_rows)
}

/// Local fc1 block of a gated MLP: this rank's gate rows stacked on its value rows
pub fn shard_gated_weight(
    gate: &HostTensor,
    value: &HostTensor,
    tp: &TensorParallelConfig,
) -> Result<HostTensor> {
    if gate.shape() != value.shape() || gate.dtype() != value.dtype() {
        return Err(CheckpointError::ShapeMismatch {
            key: "gate/value".to_string(),
            expected: gate.shape().to_vec(),
            got: value.shape().to_vec(),
        });
    }
    let gate_rows = slice_rows(gate, tp.tp_rank, tp.tp_size)?;
    let value_rows = slice_rows(value, tp.tp_rank, tp.tp_size)?;

    let mut data = Vec::with_capacity(gate_rows.size_bytes() * 2);
    data.extend_from_slice(gate_rows.as_bytes());
    data.extend_from_slice(value_rows.as_bytes());

    let mut shape = gate_rows.shape().to_vec();
    shape[0] *= 2;
    HostTensor::new(shape, gate.dtype(), data)
}

/// Descriptor of a column-parallel fragment (split along tensor axis 0)
pub fn column_parallel_tensor(
    key: impl Into<String>,
    local: HostTensor,
    tp: &TensorParallelConfig,
    sharded_offsets: &[RankOffset],
) -> Result<ShardedTensor> {
    let prepend_axis_num = sharded_offsets.len();
    let mut offsets = sharded_offsets.to_vec();
    offsets.push(RankOffset::new(prepend_axis_num, tp.tp_rank, tp.tp_size));
    ShardedTensor::from_rank_offsets(key, local, &offsets, tp.replica_id(), prepend_axis_num)
}

/// Descriptor of a row-parallel weight fragment (split along tensor axis 1)
pub fn row_parallel_tensor(
    key: impl Into<String>,
    local: HostTensor,
    tp: &TensorParallelConfig,
    sharded_offsets: &[RankOffset],
) -> Result<ShardedTensor> {
    let prepend_axis_num = sharded_offsets.len();
    let mut offsets = sharded_offsets.to_vec();
    offsets.push(RankOffset::new(prepend_axis_num + 1, tp.tp_rank, tp.tp_size));
    ShardedTensor::from_rank_offsets(key, local, &offsets, tp.replica_id(), prepend_axis_num)
}

/// Descriptor of a fragment replicated on every tensor-parallel rank
pub fn replicated_tensor(
    key: impl Into<String>,
    local: HostTensor,
    tp: &TensorParallelConfig,
    sharded_offsets: &[RankOffset],
) -> Result<ShardedTensor> {
    ShardedTensor::from_rank_offsets(
        key,
        local,
        sharded_offsets,
        tp.replicated_id(),
        sharded_offsets.len(),
    )
}
