//! ShardLM distributed checkpoint resharding
//!
//! Saving and restoring tensor-parallel weights whose local layout is not a
//! plain slice of one logical tensor.
//!
//! # Gated MLP weights
//!
//! A gated fc1 projection stores `[gate_r; value_r]` on every rank. Saving
//! that block as one fragment ties the checkpoint to the tensor-parallel size
//! it was written with. The GLU transform instead persists the gate and value
//! halves as independent fragments of one logical `[gate; value]` tensor:
//!
//! | Stage | Natural-shape fragment | Flattened fragment |
//! |-------|------------------------|--------------------|
//! | Save  | split into `w`, `v` row blocks | split the flat range at the half boundary |
//! | Load  | stack loaded `w`, `v` blocks in place | unsupported, reassembled upstream |
//!
//! # Flow
//!
//! - Model code builds a [`ShardedStateDict`] (see [`mlp::Mlp`])
//! - [`ShardedStateDict::apply_factories`] expands deferred transforms
//! - The checkpoint writer persists [`ShardedStateDict::fragments`]
//! - On load the reader fills [`ShardedStateDict::fragments_mut`] and calls
//!   [`ShardedStateDict::apply_factory_merges`]

pub mod config;
pub mod error;
pub mod factory;
pub mod glu;
pub mod mlp;
pub mod parallel;
pub mod sharded;
pub mod state_dict;
pub mod tensor;

pub use config::{CheckpointConfig, MlpConfig};
pub use error::{CheckpointError, Result};
pub use factory::{ShardTransform, ShardedTensorFactory};
pub use glu::{apply_glu_factory, merge_gate_value, split_gate_value, GluContext, GluTransform};
pub use mlp::{Mlp, ShardedModule};
pub use parallel::TensorParallelConfig;
pub use sharded::{RankOffset, ReplicaId, ShardedTensor};
pub use state_dict::{validate_tiling, ShardedStateDict, StateDictEntry};
pub use tensor::{DType, HostTensor};
