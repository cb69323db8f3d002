//! Checkpoint layout of a gated MLP block
//!
//! The block itself (projections, activation, bias fusion) lives with the
//! model. Here it is only a pair of [`ShardedModule`]s whose state dicts are
//! gathered under `linear_fc1.` and `linear_fc2.`; when the block is gated,
//! fc1's weight and bias are wrapped so each half is saved on its own.

use crate::config::MlpConfig;
use crate::error::{CheckpointError, Result};
use crate::glu::apply_glu_factory;
use crate::sharded::RankOffset;
use crate::state_dict::{ShardedStateDict, StateDictEntry};

/// A module that can describe its parameters as sharded fragments
pub trait ShardedModule {
    /// Fragments of this module's parameters, named `{prefix}{param}`
    ///
    /// `sharded_offsets` places the module inside enclosing structures and
    /// becomes the leading axes of every fragment.
    fn sharded_state_dict(&self, prefix: &str, sharded_offsets: &[RankOffset]) -> Result<ShardedStateDict>;
}

/// MLP block as seen by the checkpoint layer
pub struct Mlp<'a> {
    config: &'a MlpConfig,
    linear_fc1: &'a dyn ShardedModule,
    linear_fc2: &'a dyn ShardedModule,
}

impl<'a> Mlp<'a> {
    pub fn new(
        config: &'a MlpConfig,
        linear_fc1: &'a dyn ShardedModule,
        linear_fc2: &'a dyn ShardedModule,
    ) -> Self {
        Self {
            config,
            linear_fc1,
            linear_fc2,
        }
    }
}

impl ShardedModule for Mlp<'_> {
    fn sharded_state_dict(&self, prefix: &str, sharded_offsets: &[RankOffset]) -> Result<ShardedStateDict> {
        let mut state_dict = ShardedStateDict::new();

        for (name, module) in [("linear_fc1", self.linear_fc1), ("linear_fc2", self.linear_fc2)] {
            let sub_prefix = format!("{}{}.", prefix, name);
            let mut sub = module.sharded_state_dict(&sub_prefix, sharded_offsets)?;

            if self.config.gated_linear_unit && name == "linear_fc1" {
                let weight = format!("{}weight", sub_prefix);
                if !sub.contains(&weight) {
                    return Err(CheckpointError::MissingKey(weight));
                }
                for param in [weight, format!("{}bias", sub_prefix)] {
                    if let Some(entry) = sub.remove(&param) {
                        let factory = glu_entry(&param, entry, sharded_offsets)?;
                        sub.insert(param, factory);
                    }
                }
            }
            state_dict.extend(sub);
        }

        tracing::debug!(
            "MLP state dict under '{}': {} entries (gated: {})",
            prefix,
            state_dict.len(),
            self.config.gated_linear_unit
        );
        Ok(state_dict)
    }
}

fn glu_entry(name: &str, entry: StateDictEntry, sharded_offsets: &[RankOffset]) -> Result<StateDictEntry> {
    match entry {
        StateDictEntry::Tensor(tensor) => {
            if tensor.prepend_axis_num != sharded_offsets.len() {
                return Err(CheckpointError::InvalidRankOffset {
                    key: tensor.key,
                    reason: format!(
                        "{} prepended axes, but the block sits under {} enclosing offsets",
                        tensor.prepend_axis_num,
                        sharded_offsets.len()
                    ),
                });
            }
            Ok(StateDictEntry::Factory(apply_glu_factory(tensor)?))
        }
        _ => Err(CheckpointError::UnexpectedEntry(name.to_string())),
    }
}
