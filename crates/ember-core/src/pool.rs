//! Size-bucketed host allocator that recycles freed tensor buffers.
//!
//! Allocations are rounded up to the nearest power-of-two *size class*,
//! which limits internal fragmentation while maximising reuse across
//! tensors that are repeatedly created and removed.

use crate::allocator::Allocator;
use crate::memory::{DeviceMemory, HostMemory};
use ember_common::{DeviceType, EmberError, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

// ── Statistics ───────────────────────────────────────────────────────

/// Cumulative statistics for a [`PoolAllocator`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Allocations served from a recycled buffer.
    pub hits: u64,
    /// Allocations that created a new buffer.
    pub misses: u64,
    /// Bytes idle inside the pool.
    pub pooled_bytes: usize,
    /// Bytes currently held by tensors.
    pub active_bytes: usize,
}

impl PoolStats {
    pub fn total_allocations(&self) -> u64 {
        self.hits + self.misses
    }
}

// ── PoolAllocator ────────────────────────────────────────────────────

struct PoolInner {
    max_pooled_bytes: usize,
    buckets: HashMap<usize, Vec<Vec<u8>>>,
    stats: PoolStats,
}

/// Host allocator with per-size-class free lists.
///
/// A freed buffer goes back to its bucket unless the pool already holds
/// `max_pooled_bytes` of idle memory, in which case it is released.
pub struct PoolAllocator {
    device_type: DeviceType,
    inner: Mutex<PoolInner>,
}

impl PoolAllocator {
    /// Pool for CPU tensors caching at most `max_pooled_bytes` of idle memory.
    pub fn new(max_pooled_bytes: usize) -> Self {
        Self::for_device(DeviceType::Cpu, max_pooled_bytes)
    }

    pub fn for_device(device_type: DeviceType, max_pooled_bytes: usize) -> Self {
        Self {
            device_type,
            inner: Mutex::new(PoolInner {
                max_pooled_bytes,
                buckets: HashMap::new(),
                stats: PoolStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats.clone()
    }

    /// Drop all idle buffers.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.buckets.clear();
        inner.stats.pooled_bytes = 0;
    }
}

impl std::fmt::Debug for PoolAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("device_type", &self.device_type)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Round `size` up to the next power of two, with a minimum of 64 bytes.
/// `None` when no such size class fits in `usize`.
fn bucket_for(size: usize) -> Option<usize> {
    size.max(64).checked_next_power_of_two()
}

impl Allocator for PoolAllocator {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn allocate(&self, nbytes: usize) -> Result<Box<dyn DeviceMemory>> {
        let bucket_size = bucket_for(nbytes).ok_or_else(|| {
            EmberError::Validation(format!("allocation of {nbytes} bytes has no size class"))
        })?;
        let mut inner = self.lock();

        let recycled = inner.buckets.get_mut(&bucket_size).and_then(Vec::pop);
        let bytes = match recycled {
            Some(mut v) => {
                inner.stats.hits += 1;
                inner.stats.pooled_bytes -= bucket_size;
                v.fill(0);
                v
            }
            None => {
                inner.stats.misses += 1;
                vec![0u8; bucket_size]
            }
        };
        inner.stats.active_bytes += bucket_size;
        Ok(Box::new(HostMemory::from_vec(bytes)))
    }

    fn free(&self, memory: Box<dyn DeviceMemory>) {
        let Ok(host) = memory.into_any().downcast::<HostMemory>() else {
            return;
        };
        let bytes = (*host).into_vec();
        let bucket_size = bytes.len();
        let mut inner = self.lock();
        inner.stats.active_bytes = inner.stats.active_bytes.saturating_sub(bucket_size);

        if inner.stats.pooled_bytes + bucket_size <= inner.max_pooled_bytes {
            inner.stats.pooled_bytes += bucket_size;
            inner.buckets.entry(bucket_size).or_default().push(bytes);
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
