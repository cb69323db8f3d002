//! Sharded state dicts and the save/load factory passes
//!
//! Save: `apply_factories` replaces every factory with the fragments it
//! builds, and the writer persists everything `fragments()` yields.
//!
//! Load: the same dict is built for the live model, `apply_factories` turns
//! factories into the fragments to read, the loader fills them through
//! `fragments_mut()`, and `apply_factory_merges` folds each group back into
//! the live layout.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::error::{CheckpointError, Result};
use crate::factory::ShardedTensorFactory;
use crate::sharded::ShardedTensor;
use crate::tensor::{shape, HostTensor};

/// One named entry of a [`ShardedStateDict`]
#[derive(Debug, Clone)]
pub enum StateDictEntry {
    /// Fragment persisted as-is
    Tensor(ShardedTensor),
    /// Fragment persisted through a transform, not yet expanded
    Factory(ShardedTensorFactory),
    /// Factory together with the fragments it built
    Expanded {
        factory: ShardedTensorFactory,
        fragments: Vec<ShardedTensor>,
    },
    /// Result of merging an expanded factory after load
    Loaded(HostTensor),
}

/// Named fragments of one rank's model state
#[derive(Debug, Clone, Default)]
pub struct ShardedStateDict {
    entries: BTreeMap<String, StateDictEntry>,
}

impl ShardedStateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: StateDictEntry) -> Option<StateDictEntry> {
        self.entries.insert(name.into(), entry)
    }

    pub fn insert_tensor(&mut self, name: impl Into<String>, tensor: ShardedTensor) {
        self.entries.insert(name.into(), StateDictEntry::Tensor(tensor));
    }

    pub fn get(&self, name: &str) -> Option<&StateDictEntry> {
        self.entries.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<StateDictEntry> {
        self.entries.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StateDictEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Move all entries of `other` into this dict
    pub fn extend(&mut self, other: ShardedStateDict) {
        self.entries.extend(other.entries);
    }

    /// Expand every factory into the fragments it builds
    ///
    /// Returns the number of factories expanded.
    pub fn apply_factories(&mut self) -> Result<usize> {
        let mut expanded = 0;
        for entry in self.entries.values_mut() {
            if let StateDictEntry::Factory(factory) = entry {
                let fragments = factory.build()?;
                *entry = StateDictEntry::Expanded {
                    factory: factory.clone(),
                    fragments,
                };
                expanded += 1;
            }
        }
        tracing::debug!("Expanded {} sharded tensor factories", expanded);
        Ok(expanded)
    }

    /// Every fragment that is written on save or read on load
    pub fn fragments(&self) -> impl Iterator<Item = &ShardedTensor> {
        self.entries.values().flat_map(|entry| match entry {
            StateDictEntry::Tensor(t) => std::slice::from_ref(t),
            StateDictEntry::Expanded { fragments, .. } => fragments.as_slice(),
            StateDictEntry::Factory(_) | StateDictEntry::Loaded(_) => Default::default(),
        })
    }

    /// Mutable access for a loader filling fragments with stored data
    pub fn fragments_mut(&mut self) -> impl Iterator<Item = &mut ShardedTensor> {
        self.entries.values_mut().flat_map(|entry| match entry {
            StateDictEntry::Tensor(t) => std::slice::from_mut(t),
            StateDictEntry::Expanded { fragments, .. } => fragments.as_mut_slice(),
            StateDictEntry::Factory(_) | StateDictEntry::Loaded(_) => Default::default(),
        })
    }

    /// Merge every expanded factory from its loaded fragments
    ///
    /// Fails on any factory that was never expanded. A factory that rejects
    /// its fragments keeps them, so the entry stays `Expanded`. Returns the
    /// number of merged entries.
    pub fn apply_factory_merges(&mut self) -> Result<usize> {
        let mut merged = 0;
        for (name, entry) in self.entries.iter_mut() {
            match entry {
                StateDictEntry::Expanded { factory, fragments } => {
                    let loaded: Vec<&HostTensor> = fragments.iter().map(|f| &f.data).collect();
                    factory.check_merge(&loaded)?;
                    let data = std::mem::take(fragments)
                        .into_iter()
                        .map(|fragment| fragment.data)
                        .collect();
                    let tensor = factory.merge(data)?;
                    *entry = StateDictEntry::Loaded(tensor);
                    merged += 1;
                }
                StateDictEntry::Factory(_) => {
                    return Err(CheckpointError::UnexpectedEntry(name.clone()));
                }
                StateDictEntry::Tensor(_) | StateDictEntry::Loaded(_) => {}
            }
        }
        tracing::debug!("Merged {} sharded tensor factories", merged);
        Ok(merged)
    }

    /// Loaded tensor for `name`: merged factories and plain fragments alike
    pub fn loaded_tensor(&self, name: &str) -> Result<&HostTensor> {
        match self.entries.get(name) {
            Some(StateDictEntry::Loaded(t)) => Ok(t),
            Some(StateDictEntry::Tensor(t)) => Ok(&t.data),
            Some(_) => Err(CheckpointError::UnexpectedEntry(name.to_string())),
            None => Err(CheckpointError::MissingKey(name.to_string())),
        }
    }
}

/// Check that the main-replica fragments of every key tile its global shape
///
/// Fragments must agree on the global shape, stay inside it, and cover it
/// without overlap. Flattened fragments are first grouped by the local block
/// they slice; their ranges must cover that block exactly.
pub fn validate_tiling<'a>(fragments: impl IntoIterator<Item = &'a ShardedTensor>) -> Result<()> {
    let mut by_key: BTreeMap<&str, Vec<&ShardedTensor>> = BTreeMap::new();
    for fragment in fragments {
        if fragment.replica_id.is_main() {
            by_key.entry(fragment.key.as_str()).or_default().push(fragment);
        }
    }

    for (key, fragments) in by_key {
        validate_key(key, &fragments)?;
    }
    Ok(())
}

fn validate_key(key: &str, fragments: &[&ShardedTensor]) -> Result<()> {
    let invalid = |reason: String| CheckpointError::InvalidTiling {
        key: key.to_string(),
        reason,
    };

    let global_shape = &fragments[0].global_shape;
    if let Some(other) = fragments.iter().find(|f| &f.global_shape != global_shape) {
        return Err(invalid(format!(
            "global shapes {:?} and {:?} disagree",
            global_shape, other.global_shape
        )));
    }

    let mut boxes: Vec<Vec<Range<usize>>> = Vec::new();
    let mut flat_groups: BTreeMap<Vec<usize>, Vec<&ShardedTensor>> = BTreeMap::new();
    for &fragment in fragments {
        if fragment.is_flattened() {
            flat_groups
                .entry(fragment.global_offset.clone())
                .or_default()
                .push(fragment);
        } else {
            boxes.push(fragment.global_box());
        }
    }

    for (offset, mut group) in flat_groups {
        group.sort_by_key(|f| f.flattened_range.as_ref().map_or(0, |r| r.start));
        let numel = group[0].local_numel();
        let mut covered = 0;
        for fragment in &group {
            if let Some(range) = &fragment.flattened_range {
                if range.start != covered {
                    return Err(invalid(format!(
                        "flattened block at {:?} has a gap or overlap at element {}",
                        offset, covered
                    )));
                }
                covered = range.end;
            }
        }
        if covered != numel {
            return Err(invalid(format!(
                "flattened block at {:?} covers {} of {} elements",
                offset, covered, numel
            )));
        }
        boxes.push(group[0].global_box());
    }

    for b in &boxes {
        if b.iter().zip(global_shape).any(|(r, &dim)| r.end > dim) {
            return Err(invalid(format!("fragment {:?} exceeds global shape", b)));
        }
    }
    for (i, a) in boxes.iter().enumerate() {
        for b in &boxes[i + 1..] {
            if a.iter().zip(b).all(|(x, y)| x.start < y.end && y.start < x.end) {
                return Err(invalid(format!("fragments {:?} and {:?} overlap", a, b)));
            }
        }
    }

    let covered: usize = boxes
        .iter()
        .map(|b| b.iter().map(|r| r.len()).product::<usize>())
        .sum();
    let total = shape::numel(global_shape);
    if covered != total {
        return Err(invalid(format!("fragments cover {} of {} elements", covered, total)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::glu::{apply_glu_factory, GluContext, GluTransform};
    use crate::sharded::{RankOffset, ReplicaId};

    fn fused(rank: usize, tp: usize) -> ShardedTensor {
        let values: Vec<f32> = (0..8).map(|v| (rank * 100 + v) as f32).collect();
        let data = HostTensor::from_f32(vec![4, 2], &values).unwrap();
        ShardedTensor::from_rank_offsets(
            "mlp.linear_fc1.weight",
            data,
            &[RankOffset::new(0, rank, tp)],
            ReplicaId::main(),
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_save_then_load_pass() {
        let mut sd = ShardedStateDict::new();
        let original = fused(0, 1);
        let expected = original.data.clone();
        sd.insert(
            "mlp.linear_fc1.weight",
            StateDictEntry::Factory(apply_glu_factory(original).unwrap()),
        );
        sd.insert_tensor(
            "mlp.linear_fc2.weight",
            ShardedTensor::from_rank_offsets(
                "mlp.linear_fc2.weight",
                HostTensor::from_f32(vec![2, 2], &[1.0; 4]).unwrap(),
                &[],
                ReplicaId::main(),
                0,
            )
            .unwrap(),
        );

        assert_eq!(sd.apply_factories().unwrap(), 1);
        assert_eq!(sd.fragments().count(), 3);
        validate_tiling(sd.fragments()).unwrap();

        // loader: replace every fragment with a fresh copy of its bytes
        for fragment in sd.fragments_mut() {
            let copy = HostTensor::new(
                fragment.data.shape().to_vec(),
                fragment.data.dtype(),
                fragment.data.as_bytes().to_vec(),
            )
            .unwrap();
            *fragment = fragment.clone().with_data(copy).unwrap();
        }

        assert_eq!(sd.apply_factory_merges().unwrap(), 1);
        assert_eq!(sd.loaded_tensor("mlp.linear_fc1.weight").unwrap(), &expected);
        assert_eq!(sd.loaded_tensor("mlp.linear_fc2.weight").unwrap().numel(), 4);
        assert!(matches!(
            sd.loaded_tensor("missing"),
            Err(CheckpointError::MissingKey(_))
        ));
    }

    #[test]
    fn test_merge_pass_rejects_unexpanded_factory() {
        let mut sd = ShardedStateDict::new();
        sd.insert(
            "w",
            StateDictEntry::Factory(apply_glu_factory(fused(0, 1)).unwrap()),
        );
        assert!(matches!(
            sd.apply_factory_merges(),
            Err(CheckpointError::UnexpectedEntry(_))
        ));
    }

    #[test]
    fn test_rejected_merge_keeps_loaded_fragments() {
        let ctx = GluContext::from_descriptor(&fused(0, 1)).unwrap();
        let values: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let factory = ShardedTensorFactory::new(
            "w",
            HostTensor::from_f32(vec![8], &values).unwrap(),
            Arc::new(GluTransform::new(ctx)),
            ReplicaId::main(),
            Some(0..8),
        );
        let mut sd = ShardedStateDict::new();
        sd.insert("w", StateDictEntry::Factory(factory));
        sd.apply_factories().unwrap();
        assert_eq!(sd.fragments().count(), 2);

        for _ in 0..2 {
            assert!(matches!(
                sd.apply_factory_merges(),
                Err(CheckpointError::UnsupportedFlattenedMerge { .. })
            ));
            assert_eq!(sd.fragments().count(), 2);
        }
        let gate: Vec<f32> = sd.fragments().next().unwrap().data.to_f32_vec().unwrap();
        assert_eq!(gate, vec![0.0, 1.0, 2.0, 3.0]);

        let mut sd = ShardedStateDict::new();
        sd.insert("w", StateDictEntry::Factory(apply_glu_factory(fused(0, 1)).unwrap()));
        sd.apply_factories().unwrap();
        if let Some(fragment) = sd.fragments_mut().nth(1) {
            fragment.data = HostTensor::from_f32(vec![1, 2], &[0.0, 0.0]).unwrap();
        }
        assert!(matches!(
            sd.apply_factory_merges(),
            Err(CheckpointError::ShapeMismatch { .. })
        ));
        assert_eq!(sd.fragments().count(), 2);
        assert!(matches!(sd.get("w"), Some(StateDictEntry::Expanded { .. })));
    }

    #[test]
    fn test_tiling_across_ranks() {
        let tp = 4;
        let fragments: Vec<ShardedTensor> = (0..tp)
            .flat_map(|rank| apply_glu_factory(fused(rank, tp)).unwrap().build().unwrap())
            .collect();
        assert_eq!(fragments.len(), 8);
        validate_tiling(&fragments).unwrap();

        // dropping one rank leaves a gap
        let partial: Vec<&ShardedTensor> = fragments.iter().skip(2).collect();
        assert!(matches!(
            validate_tiling(partial),
            Err(CheckpointError::InvalidTiling { .. })
        ));
    }

    #[test]
    fn test_tiling_detects_overlap_and_ignores_replicas() {
        let a = fused(0, 2);
        let mut b = fused(0, 2);
        assert!(validate_tiling([&a, &b]).is_err());

        b.replica_id = ReplicaId::from((0, 0, 1));
        let c = fused(1, 2);
        validate_tiling([&a, &b, &c]).unwrap();
    }

    #[test]
    fn test_tiling_of_flattened_fragments() {
        let ctx = GluContext::from_descriptor(&fused(0, 1)).unwrap();
        let transform = GluTransform::new(ctx);
        let whole: Vec<f32> = (0..8).map(|v| v as f32).collect();

        let mut fragments = Vec::new();
        for range in [0..3, 3..8] {
            let data = HostTensor::from_f32(vec![range.len()], &whole[range.clone()]).unwrap();
            let factory = ShardedTensorFactory::new(
                "w",
                data,
                Arc::new(transform.clone()),
                ReplicaId::main(),
                Some(range),
            );
            fragments.extend(factory.build().unwrap());
        }
        assert_eq!(fragments.len(), 3);
        validate_tiling(&fragments).unwrap();

        fragments.remove(1);
        assert!(validate_tiling(&fragments).is_err());
    }
}
