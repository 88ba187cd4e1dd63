//! Error types for the Ember runtime.

use crate::config::ConfigError;
use crate::types::{DataType, DeviceType};
use std::fmt;
use thiserror::Error;

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, EmberError>;

/// Top-level error for every Ember crate.
#[derive(Error, Debug)]
pub enum EmberError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Tuning error: {0}")]
    Tuning(#[from] TuningError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for EmberError {
    fn from(e: ConfigError) -> Self {
        EmberError::Config(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    #[error("tensor '{name}' not found")]
    NotFound { name: String },
    #[error("tensor '{name}' has no backing buffer")]
    Unallocated { name: String },
    #[error("data type mismatch: expected {expected}, found {actual}")]
    DTypeMismatch { expected: DataType, actual: DataType },
    #[error("shape mismatch: {reason}")]
    ShapeMismatch { reason: String },
    #[error("access of {len} bytes at offset {offset} exceeds capacity {capacity}")]
    OutOfBounds { offset: usize, len: usize, capacity: usize },
    #[error("tensor '{name}' is used both as input and output")]
    AliasedOperands { name: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("No kernel registered for {op} on {device} with {dtype}")]
    NoProvider { op: String, device: DeviceType, dtype: DataType },
    #[error("No source available for program '{program}'")]
    SourceNotFound { program: String },
    #[error("Failed to build kernel '{kernel}' of program '{program}': {log}")]
    BuildFailed { program: String, kernel: String, log: String },
    #[error("Launch of kernel '{kernel}' failed with status {status}")]
    LaunchFailed { kernel: String, status: DeviceStatus },
    #[error("Invalid arguments for kernel '{kernel}': {reason}")]
    InvalidArguments { kernel: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("no OpenCL platforms found")]
    NoPlatforms,
    #[error("no suitable device: {reason}")]
    NoDevice { reason: String },
    #[error("feature not supported by this build: {feature}")]
    Unsupported { feature: String },
    #[error("device memory fault: {reason}")]
    MemoryFault { reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TuningError {
    #[error("no candidates were produced for '{key}'")]
    EmptyCandidateSet { key: String },
    #[error("all {attempted} candidates failed for '{key}'; last failure: {last_failure}")]
    NoViableCandidate { key: String, attempted: usize, last_failure: String },
}

/// Raw status code reported by a device call.
///
/// Codes follow the OpenCL numbering so that both the native and the
/// reference device report identical diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceStatus(pub i32);

impl DeviceStatus {
    pub const SUCCESS: DeviceStatus = DeviceStatus(0);
    pub const OUT_OF_RESOURCES: DeviceStatus = DeviceStatus(-5);
    pub const INVALID_VALUE: DeviceStatus = DeviceStatus(-30);
    pub const INVALID_MEM_OBJECT: DeviceStatus = DeviceStatus(-38);
    pub const INVALID_KERNEL: DeviceStatus = DeviceStatus(-48);
    pub const INVALID_ARG_INDEX: DeviceStatus = DeviceStatus(-49);
    pub const INVALID_ARG_VALUE: DeviceStatus = DeviceStatus(-50);
    pub const INVALID_ARG_SIZE: DeviceStatus = DeviceStatus(-51);
    pub const INVALID_KERNEL_ARGS: DeviceStatus = DeviceStatus(-52);
    pub const INVALID_WORK_DIMENSION: DeviceStatus = DeviceStatus(-53);
    pub const INVALID_WORK_GROUP_SIZE: DeviceStatus = DeviceStatus(-54);
    pub const INVALID_WORK_ITEM_SIZE: DeviceStatus = DeviceStatus(-55);
    pub const INVALID_GLOBAL_WORK_SIZE: DeviceStatus = DeviceStatus(-63);

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Symbolic OpenCL name of the code, if known.
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "CL_SUCCESS",
            -4 => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
            -5 => "CL_OUT_OF_RESOURCES",
            -6 => "CL_OUT_OF_HOST_MEMORY",
            -11 => "CL_BUILD_PROGRAM_FAILURE",
            -30 => "CL_INVALID_VALUE",
            -38 => "CL_INVALID_MEM_OBJECT",
            -44 => "CL_INVALID_PROGRAM",
            -45 => "CL_INVALID_PROGRAM_EXECUTABLE",
            -46 => "CL_INVALID_KERNEL_NAME",
            -48 => "CL_INVALID_KERNEL",
            -49 => "CL_INVALID_ARG_INDEX",
            -50 => "CL_INVALID_ARG_VALUE",
            -51 => "CL_INVALID_ARG_SIZE",
            -52 => "CL_INVALID_KERNEL_ARGS",
            -53 => "CL_INVALID_WORK_DIMENSION",
            -54 => "CL_INVALID_WORK_GROUP_SIZE",
            -55 => "CL_INVALID_WORK_ITEM_SIZE",
            -63 => "CL_INVALID_GLOBAL_WORK_SIZE",
            _ => "CL_UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}
