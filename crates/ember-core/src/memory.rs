//! Backing memory of a tensor.
//!
//! [`DeviceMemory`] is the opaque buffer handle an [`Allocator`](crate::Allocator)
//! hands out. Host-resident buffers are [`HostMemory`]; device backends
//! provide their own implementations and recover them by downcasting.

use ember_common::{Result, TensorError};
use std::any::Any;
use std::fmt;

/// A byte buffer owned by a tensor and released by the allocator that
/// created it.
pub trait DeviceMemory: Any + Send + Sync + fmt::Debug {
    /// Capacity in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Copy `src` into the buffer starting at `offset`.
    fn write(&mut self, offset: usize, src: &[u8]) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Check that `[offset, offset + len)` lies inside a buffer of `capacity` bytes.
pub fn check_range(offset: usize, len: usize, capacity: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(TensorError::OutOfBounds { offset, len, capacity }.into()),
    }
}

/// Plain host-resident bytes.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HostMemory {
    bytes: Vec<u8>,
}

impl HostMemory {
    /// Zero-initialised buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self { bytes: vec![0u8; len] }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory").field("len", &self.bytes.len()).finish()
    }
}

impl DeviceMemory for HostMemory {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        check_range(offset, dst.len(), self.bytes.len())?;
        dst.copy_from_slice(&self.bytes[offset..offset + dst.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        check_range(offset, src.len(), self.bytes.len())?;
        self.bytes[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Borrow the host bytes behind `memory`, if it is host-resident.
pub fn host_bytes(memory: &dyn DeviceMemory) -> Option<&[u8]> {
    memory.as_any().downcast_ref::<HostMemory>().map(HostMemory::as_slice)
}

/// Mutably borrow the host bytes behind `memory`, if it is host-resident.
pub fn host_bytes_mut(memory: &mut dyn DeviceMemory) -> Option<&mut [u8]> {
    memory.as_any_mut().downcast_mut::<HostMemory>().map(HostMemory::as_mut_slice)
}
