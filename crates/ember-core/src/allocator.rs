//! Allocation strategies for tensor buffers.

use crate::memory::{DeviceMemory, HostMemory};
use ember_common::{DeviceType, EmberError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Strategy that provides and reclaims tensor memory on one class of device.
///
/// A tensor keeps a handle to the allocator that produced its buffer and
/// returns the buffer through [`Allocator::free`] when it is dropped or
/// resized.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Device class the returned buffers live on.
    fn device_type(&self) -> DeviceType;

    /// Allocate a buffer of at least `nbytes` bytes.
    fn allocate(&self, nbytes: usize) -> Result<Box<dyn DeviceMemory>>;

    /// Release a buffer previously returned by [`Allocator::allocate`].
    fn free(&self, memory: Box<dyn DeviceMemory>);
}

/// Running totals an allocator keeps about its own traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub allocations: u64,
    pub frees: u64,
    pub live_bytes: usize,
}

#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicU64,
    frees: AtomicU64,
    live_bytes: AtomicUsize,
}

impl Counters {
    fn on_alloc(&self, bytes: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn on_free(&self, bytes: usize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn snapshot(&self) -> AllocationStats {
        AllocationStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Zero-initialised host memory.
///
/// Besides backing CPU tensors, the host allocator also serves the reference
/// OpenCL device, which runs kernels over host buffers; construct it with
/// [`HostAllocator::for_device`] in that case.
#[derive(Debug)]
pub struct HostAllocator {
    device_type: DeviceType,
    max_bytes: Option<usize>,
    counters: Counters,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::for_device(DeviceType::Cpu)
    }

    pub fn for_device(device_type: DeviceType) -> Self {
        Self { device_type, max_bytes: None, counters: Counters::default() }
    }

    /// Refuse single allocations larger than `max_bytes`.
    pub fn with_limit(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    pub fn stats(&self) -> AllocationStats {
        self.counters.snapshot()
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for HostAllocator {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn allocate(&self, nbytes: usize) -> Result<Box<dyn DeviceMemory>> {
        if let Some(limit) = self.max_bytes
            && nbytes > limit
        {
            return Err(EmberError::Validation(format!(
                "allocation of {nbytes} bytes exceeds the {limit} byte limit"
            )));
        }
        self.counters.on_alloc(nbytes);
        Ok(Box::new(HostMemory::zeroed(nbytes)))
    }

    fn free(&self, memory: Box<dyn DeviceMemory>) {
        self.counters.on_free(memory.len());
    }
}

/// Allocator lookup by device class, consulted when deserializing model
/// tensors for a target device.
#[derive(Debug, Clone, Default)]
pub struct AllocatorRegistry {
    allocators: HashMap<DeviceType, Arc<dyn Allocator>>,
}

impl AllocatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a [`HostAllocator`] serving CPU tensors.
    pub fn with_host() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HostAllocator::new()));
        registry
    }

    /// Register `allocator` for its device class, replacing any previous one.
    pub fn register(&mut self, allocator: Arc<dyn Allocator>) {
        self.allocators.insert(allocator.device_type(), allocator);
    }

    pub fn get(&self, device: DeviceType) -> Option<Arc<dyn Allocator>> {
        self.allocators.get(&device).cloned()
    }

    pub fn require(&self, device: DeviceType) -> Result<Arc<dyn Allocator>> {
        self.get(device)
            .ok_or_else(|| EmberError::Config(format!("no allocator registered for {device}")))
    }
}
