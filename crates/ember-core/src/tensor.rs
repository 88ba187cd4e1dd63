//! Typed, shaped tensor buffers.

use crate::allocator::Allocator;
use crate::element::Element;
use crate::memory::DeviceMemory;
use ember_common::{DataType, DeviceType, EmberError, Result, TensorError};
use std::fmt;
use std::sync::Arc;

/// A typed buffer with shape metadata.
///
/// The buffer is allocated lazily on the first [`Tensor::resize`] and is
/// always returned to the allocator that produced it, either when the tensor
/// is dropped or when a resize needs more capacity. Once allocated, the
/// buffer capacity is never smaller than `nbytes()`. Until then the tensor
/// reports its shape but holds no data, and reading it is an error.
pub struct Tensor {
    allocator: Arc<dyn Allocator>,
    dtype: DataType,
    shape: Vec<usize>,
    buffer: Option<Box<dyn DeviceMemory>>,
}

impl Tensor {
    /// Empty tensor bound to `allocator`; no memory is allocated yet.
    pub fn new(allocator: Arc<dyn Allocator>, dtype: DataType) -> Self {
        Self { allocator, dtype, shape: Vec::new(), buffer: None }
    }

    /// Tensor holding a copy of `data` with the given shape.
    pub fn from_slice<T: Element>(
        allocator: Arc<dyn Allocator>,
        shape: &[usize],
        data: &[T],
    ) -> Result<Self> {
        let mut tensor = Self::new(allocator, T::DTYPE);
        tensor.resize(shape)?;
        tensor.copy_from_slice(data)?;
        Ok(tensor)
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dim_size(&self) -> usize {
        self.shape.len()
    }

    /// Size of dimension `index`, if it exists.
    pub fn dim(&self, index: usize) -> Option<usize> {
        self.shape.get(index).copied()
    }

    /// Number of elements. A rank-0 tensor holds a single element.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bytes covered by the current shape.
    pub fn nbytes(&self) -> usize {
        self.size() * self.dtype.element_size()
    }

    /// Bytes available in the backing buffer.
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.len())
    }

    pub fn device_type(&self) -> DeviceType {
        self.allocator.device_type()
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn is_allocated(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn buffer(&self) -> Option<&dyn DeviceMemory> {
        self.buffer.as_deref()
    }

    pub fn buffer_mut(&mut self) -> Option<&mut dyn DeviceMemory> {
        self.buffer.as_deref_mut()
    }

    /// Set the shape, growing the buffer if the new shape needs more bytes.
    ///
    /// Existing contents are kept when the buffer is large enough; a grown
    /// buffer starts zeroed.
    pub fn resize(&mut self, shape: &[usize]) -> Result<()> {
        let elements = shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
        let nbytes = elements
            .and_then(|n| n.checked_mul(self.dtype.element_size()))
            .ok_or_else(|| TensorError::ShapeMismatch {
                reason: format!("shape {shape:?} overflows the addressable size"),
            })?;
        self.reserve(nbytes)?;
        self.shape = shape.to_vec();
        Ok(())
    }

    /// Give this tensor the shape of `other`.
    pub fn resize_like(&mut self, other: &Tensor) -> Result<()> {
        self.resize(other.shape())
    }

    /// Ensure at least `nbytes` bytes of capacity.
    pub fn reserve(&mut self, nbytes: usize) -> Result<()> {
        if self.buffer.is_some() && self.capacity() >= nbytes {
            return Ok(());
        }
        let fresh = self.allocator.allocate(nbytes)?;
        if let Some(old) = self.buffer.replace(fresh) {
            self.allocator.free(old);
        }
        Ok(())
    }

    /// Overwrite the leading `bytes.len()` bytes of the buffer.
    pub fn copy_from_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.nbytes() {
            return Err(TensorError::ShapeMismatch {
                reason: format!(
                    "{} bytes supplied for a tensor of {} bytes (shape {:?}, {})",
                    bytes.len(),
                    self.nbytes(),
                    self.shape,
                    self.dtype
                ),
            }
            .into());
        }
        match self.buffer.as_deref_mut() {
            Some(buffer) => buffer.write(0, bytes),
            None if bytes.is_empty() => Ok(()),
            None => Err(TensorError::Unallocated { name: String::new() }.into()),
        }
    }

    /// Copy typed host data into the tensor. The element count must match.
    pub fn copy_from_slice<T: Element>(&mut self, data: &[T]) -> Result<()> {
        self.check_dtype::<T>()?;
        self.copy_from_bytes(bytemuck::cast_slice(data))
    }

    /// Read the tensor contents back into raw bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.nbytes()];
        self.read_into(&mut out)?;
        Ok(out)
    }

    /// Read the tensor contents back as typed host data.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.check_dtype::<T>()?;
        let mut out = vec![T::zeroed(); self.size()];
        self.read_into(bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    fn read_into(&self, out: &mut [u8]) -> Result<()> {
        match self.buffer.as_deref() {
            Some(buffer) => buffer.read(0, out),
            None if out.is_empty() => Ok(()),
            None => Err(TensorError::Unallocated { name: String::new() }.into()),
        }
    }

    fn check_dtype<T: Element>(&self) -> Result<()> {
        if T::DTYPE != self.dtype {
            return Err(EmberError::Tensor(TensorError::DTypeMismatch {
                expected: self.dtype,
                actual: T::DTYPE,
            }));
        }
        Ok(())
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.allocator.free(buffer);
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("device", &self.device_type())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::HostAllocator;

    fn host() -> Arc<HostAllocator> {
        Arc::new(HostAllocator::new())
    }

    #[test]
    fn allocation_is_deferred_until_resize() {
        let alloc = host();
        let mut t = Tensor::new(alloc.clone(), DataType::F32);
        assert!(!t.is_allocated());
        assert_eq!(alloc.stats().allocations, 0);

        t.resize(&[2, 3]).unwrap();
        assert_eq!(t.size(), 6);
        assert_eq!(t.nbytes(), 24);
        assert!(t.capacity() >= t.nbytes());
        assert_eq!(alloc.stats().allocations, 1);
    }

    #[test]
    fn shrinking_resize_reuses_buffer() {
        let alloc = host();
        let mut t = Tensor::new(alloc.clone(), DataType::F32);
        t.resize(&[4, 4]).unwrap();
        t.resize(&[2, 2]).unwrap();
        assert_eq!(alloc.stats().allocations, 1);
        assert_eq!(t.shape(), &[2, 2]);

        t.resize(&[8, 8]).unwrap();
        let stats = alloc.stats();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.frees, 1);
        assert!(t.capacity() >= 256);
    }

    #[test]
    fn drop_returns_buffer_to_allocator() {
        let alloc = host();
        {
            let mut t = Tensor::new(alloc.clone(), DataType::I32);
            t.resize(&[10]).unwrap();
        }
        assert_eq!(alloc.stats().frees, 1);
        assert_eq!(alloc.stats().live_bytes, 0);
    }

    #[test]
    fn typed_round_trip_and_dtype_check() {
        let t = Tensor::from_slice(host(), &[3], &[1.0f32, -2.0, 3.5]).unwrap();
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, -2.0, 3.5]);
        assert!(t.to_vec::<i32>().is_err());
    }

    #[test]
    fn copy_with_wrong_length_is_rejected() {
        let mut t = Tensor::new(host(), DataType::F32);
        t.resize(&[4]).unwrap();
        let err = t.copy_from_slice(&[1.0f32, 2.0]).unwrap_err();
        assert!(err.to_string().contains("8 bytes supplied"));
    }

    #[test]
    fn overflowing_shape_is_rejected() {
        let mut t = Tensor::new(host(), DataType::F32);
        assert!(t.resize(&[usize::MAX, 2]).is_err());
        assert!(!t.is_allocated());
    }

    #[test]
    fn reading_before_allocation_is_an_error() {
        let mut t = Tensor::new(host(), DataType::F32);
        assert_eq!((t.size(), t.nbytes(), t.capacity()), (1, 4, 0));
        assert!(matches!(t.to_vec::<f32>(), Err(EmberError::Tensor(TensorError::Unallocated { .. }))));
        assert!(matches!(t.to_bytes(), Err(EmberError::Tensor(TensorError::Unallocated { .. }))));

        t.resize(&[1]).unwrap();
        assert!(t.capacity() >= t.nbytes());
        assert_eq!(t.to_vec::<f32>().unwrap().len(), 1);
    }

    #[test]
    fn dims_accessors() {
        let mut t = Tensor::new(host(), DataType::U8);
        t.resize(&[1, 8, 4, 4]).unwrap();
        assert_eq!(t.dim_size(), 4);
        assert_eq!(t.dim(1), Some(8));
        assert_eq!(t.dim(4), None);
    }
}
