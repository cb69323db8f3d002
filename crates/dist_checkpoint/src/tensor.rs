//! Host tensor buffers handed between the model and the checkpoint layer

use std::sync::Arc;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::{CheckpointError, Result};

/// Tensor data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    BF16,
    I32,
    I8,
}

impl DType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I8 => 1,
        }
    }
}

/// Row-major tensor resident in host memory
///
/// Storage is shared, so slicing along axis 0 or over the flattened view
/// produces a view without copying. The original buffer is never written
/// through a view; mutation only happens on uniquely owned storage.
#[derive(Debug, Clone)]
pub struct HostTensor {
    shape: Vec<usize>,
    dtype: DType,
    storage: Arc<Vec<u8>>,
    /// Byte offset of element 0 within `storage`
    byte_offset: usize,
}

impl HostTensor {
    /// Wrap raw little-endian bytes
    pub fn new(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = shape::numel(&shape) * dtype.size_bytes();
        if data.len() != expected {
            return Err(CheckpointError::DataLength {
                shape,
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            shape,
            dtype,
            storage: Arc::new(data),
            byte_offset: 0,
        })
    }

    /// Zero-filled tensor
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
        let len = shape::numel(&shape) * dtype.size_bytes();
        Self {
            shape,
            dtype,
            storage: Arc::new(vec![0u8; len]),
            byte_offset: 0,
        }
    }

    /// Build an F32 tensor from values
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(shape, DType::F32, data)
    }

    /// Build a BF16 tensor from values
    pub fn from_bf16(shape: Vec<usize>, values: &[bf16]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(shape, DType::BF16, data)
    }

    /// Decode float data to `f32`; `None` for integer types
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        let bytes = self.as_bytes();
        match self.dtype {
            DType::F32 => Some(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::BF16 => Some(
                bytes
                    .chunks_exact(2)
                    .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect(),
            ),
            DType::F16 => Some(
                bytes
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect(),
            ),
            DType::I32 | DType::I8 => None,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get the number of elements
    pub fn numel(&self) -> usize {
        shape::numel(&self.shape)
    }

    /// Get size in bytes
    pub fn size_bytes(&self) -> usize {
        self.numel() * self.dtype.size_bytes()
    }

    /// Get data as slice
    pub fn as_bytes(&self) -> &[u8] {
        &self.storage[self.byte_offset..self.byte_offset + self.size_bytes()]
    }

    /// Whether both tensors view the same allocation
    pub fn shares_storage_with(&self, other: &HostTensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Elements in one axis-0 row (1 for vectors)
    pub fn row_numel(&self) -> usize {
        shape::numel(self.shape.get(1..).unwrap_or(&[]))
    }

    /// View of rows `[start, start + len)` along axis 0
    pub fn narrow_rows(&self, start: usize, len: usize) -> Result<HostTensor> {
        let rows = self.shape.first().copied().unwrap_or(0);
        if self.shape.is_empty() || start + len > rows {
            return Err(CheckpointError::ShapeMismatch {
                key: format!("rows {}..{}", start, start + len),
                expected: vec![start + len],
                got: self.shape.clone(),
            });
        }
        let row_bytes = self.row_numel() * self.dtype.size_bytes();
        let mut shape = self.shape.clone();
        shape[0] = len;
        Ok(HostTensor {
            shape,
            dtype: self.dtype,
            storage: Arc::clone(&self.storage),
            byte_offset: self.byte_offset + start * row_bytes,
        })
    }

    /// 1-D view of elements `[start, start + len)` of the flattened tensor
    pub fn flat_slice(&self, start: usize, len: usize) -> Result<HostTensor> {
        if start + len > self.numel() {
            return Err(CheckpointError::ShapeMismatch {
                key: format!("elements {}..{}", start, start + len),
                expected: vec![start + len],
                got: vec![self.numel()],
            });
        }
        Ok(HostTensor {
            shape: vec![len],
            dtype: self.dtype,
            storage: Arc::clone(&self.storage),
            byte_offset: self.byte_offset + start * self.dtype.size_bytes(),
        })
    }

    /// Same data under a new shape with equal element count
    pub fn reshape(&self, shape: Vec<usize>) -> Result<HostTensor> {
        if shape::numel(&shape) != self.numel() {
            return Err(CheckpointError::ShapeMismatch {
                key: "reshape".to_string(),
                expected: shape,
                got: self.shape.clone(),
            });
        }
        Ok(HostTensor {
            shape,
            dtype: self.dtype,
            storage: Arc::clone(&self.storage),
            byte_offset: self.byte_offset,
        })
    }

    /// Take the bytes out, reusing the allocation when it is uniquely owned.
    ///
    /// The flag is `true` when the storage was shared and had to be copied.
    pub(crate) fn into_owned_bytes(self) -> (Vec<u8>, bool) {
        let len = self.size_bytes();
        let start = self.byte_offset;
        match Arc::try_unwrap(self.storage) {
            Ok(mut data) => {
                data.truncate(start + len);
                data.drain(..start);
                (data, false)
            }
            Err(shared) => (shared[start..start + len].to_vec(), true),
        }
    }

    pub(crate) fn from_owned_bytes(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), shape::numel(&shape) * dtype.size_bytes());
        Self {
            shape,
            dtype,
            storage: Arc::new(data),
            byte_offset: 0,
        }
    }
}

impl PartialEq for HostTensor {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype && self.shape == other.shape && self.as_bytes() == other.as_bytes()
    }
}

/// Tensor shape utilities
pub mod shape {
    /// Calculate the product of dimensions
    pub fn numel(shape: &[usize]) -> usize {
        shape.iter().product()
    }

    /// Compute strides for row-major layout
    pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Multi-index of a row-major flat position
    pub fn unravel(mut flat: usize, shape: &[usize]) -> Vec<usize> {
        let strides = compute_strides(shape);
        strides
            .iter()
            .map(|&stride| {
                let idx = flat / stride;
                flat %= stride;
                idx
            })
            .collect()
    }
}
