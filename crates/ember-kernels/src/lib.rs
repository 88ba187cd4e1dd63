//! Device runtime and operators for the Ember tensor runtime
//!
//! A [`DeviceRuntime`] wraps one [`ComputeDevice`] and caches every program
//! and kernel compiled on it. Operators are looked up in an
//! [`OperatorRegistry`] by operator type, device class, and element type,
//! and run against a [`Workspace`](ember_core::Workspace) inside an
//! [`ExecutionContext`].
//!
//! Two devices are provided:
//!
//! - [`ReferenceDevice`] executes kernels with host implementations that
//!   follow the OpenCL work-group model. It needs no driver.
//! - `cl::ClDevice` talks to a real OpenCL implementation and is only built
//!   with the `opencl` feature.

pub mod batch_norm;
#[cfg(feature = "opencl")]
pub mod cl;
pub mod context;
pub mod device;
pub mod kernels;
pub mod reference;
pub mod registry;
pub mod runtime;

pub use batch_norm::{
    BatchNormCpu, BatchNormInputs, BatchNormOpenCl, DEFAULT_EPSILON, LocalSize,
    LocalSizeCandidates,
};
pub use context::ExecutionContext;
pub use device::{
    CommandQueue, ComputeDevice, DeviceInfo, DeviceKernel, DeviceProgram, KernelArg, ScalarArg,
};
pub use kernels::KernelLibrary;
pub use reference::{HostLaunch, ReferenceDevice};
pub use registry::{BatchNormCpuOp, BatchNormOpenClOp, Operator, OperatorKey, OperatorRegistry};
pub use runtime::{DeviceRuntime, KernelBuildKey, RuntimeStats};
