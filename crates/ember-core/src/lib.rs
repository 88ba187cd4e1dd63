//! Tensor ownership for the Ember runtime
//!
//! A [`Workspace`] owns every [`Tensor`] of one execution context by name.
//! Tensors draw their memory from an [`Allocator`] chosen by the caller and
//! hand it back to that allocator when they are dropped. Serialized model
//! records are turned into tensors by the [`Serializer`].

pub mod allocator;
pub mod element;
pub mod memory;
pub mod pool;
pub mod proto;
pub mod serializer;
pub mod tensor;
pub mod workspace;

pub use allocator::{AllocationStats, Allocator, AllocatorRegistry, HostAllocator};
pub use element::Element;
pub use memory::{DeviceMemory, HostMemory};
pub use pool::{PoolAllocator, PoolStats};
pub use proto::{NetDef, OperatorDef, TensorProto};
pub use serializer::Serializer;
pub use tensor::Tensor;
pub use workspace::Workspace;
