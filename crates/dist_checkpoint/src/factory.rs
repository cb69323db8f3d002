//! Deferred save/load transforms
//!
//! A [`ShardedTensorFactory`] stands in for a fragment whose on-disk layout
//! differs from the layout the live model holds. The checkpoint writer calls
//! [`ShardedTensorFactory::build`] to obtain the fragments to persist; the
//! reader fills those fragments and calls [`ShardedTensorFactory::merge`] to
//! get the tensor back in the live layout.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::error::Result;
use crate::sharded::{ReplicaId, ShardedTensor};
use crate::tensor::HostTensor;

/// Split/merge pair for one kind of fused layout
///
/// Implementations hold only immutable geometry, so one transform may be
/// shared by several factories and used from several threads.
pub trait ShardTransform: Send + Sync + fmt::Debug {
    /// Split `data` into the fragments written to the checkpoint.
    ///
    /// `data` may be sliced but is never modified.
    fn split(
        &self,
        key: &str,
        data: &HostTensor,
        replica_id: &ReplicaId,
        flattened_range: Option<&Range<usize>>,
    ) -> Result<Vec<ShardedTensor>>;

    /// Check that `merge` would accept these fragments, without consuming them.
    fn check_merge(
        &self,
        _key: &str,
        _flattened_range: Option<&Range<usize>>,
        _fragments: &[&HostTensor],
    ) -> Result<()> {
        Ok(())
    }

    /// Combine loaded fragments, ordered as `split` emitted them, into one tensor.
    fn merge(
        &self,
        key: &str,
        flattened_range: Option<&Range<usize>>,
        fragments: Vec<HostTensor>,
    ) -> Result<HostTensor>;
}

/// A fragment whose persisted form is produced by a [`ShardTransform`]
#[derive(Clone)]
pub struct ShardedTensorFactory {
    pub key: String,
    /// Live tensor: the source on save, the destination layout on load
    pub data: HostTensor,
    pub replica_id: ReplicaId,
    pub flattened_range: Option<Range<usize>>,
    transform: Arc<dyn ShardTransform>,
}

impl ShardedTensorFactory {
    pub fn new(
        key: impl Into<String>,
        data: HostTensor,
        transform: Arc<dyn ShardTransform>,
        replica_id: ReplicaId,
        flattened_range: Option<Range<usize>>,
    ) -> Self {
        Self {
            key: key.into(),
            data,
            replica_id,
            flattened_range,
            transform,
        }
    }

    /// Fragments to persist (save) or to fill from storage (load)
    pub fn build(&self) -> Result<Vec<ShardedTensor>> {
        self.transform.split(
            &self.key,
            &self.data,
            &self.replica_id,
            self.flattened_range.as_ref(),
        )
    }

    /// Fail early if `merge` would reject these fragments
    pub fn check_merge(&self, fragments: &[&HostTensor]) -> Result<()> {
        self.transform
            .check_merge(&self.key, self.flattened_range.as_ref(), fragments)
    }

    /// Reassemble fragments loaded for the descriptors `build` returned
    pub fn merge(&self, fragments: Vec<HostTensor>) -> Result<HostTensor> {
        self.transform
            .merge(&self.key, self.flattened_range.as_ref(), fragments)
    }

    pub fn transform(&self) -> &Arc<dyn ShardTransform> {
        &self.transform
    }
}

impl fmt::Debug for ShardedTensorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedTensorFactory")
            .field("key", &self.key)
            .field("shape", &self.data.shape())
            .field("replica_id", &self.replica_id)
            .field("flattened_range", &self.flattened_range)
            .field("transform", &self.transform)
            .finish()
    }
}
