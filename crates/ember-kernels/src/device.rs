//! Compute device abstraction.
//!
//! A [`ComputeDevice`] compiles programs, hands out an allocator for its
//! memory, and owns one in-order [`CommandQueue`]. The execution model is
//! OpenCL's: kernels run over a 3-D global range split into work-groups.

use ember_common::{DeviceStatus, DeviceType, Result};
use ember_core::{Allocator, DeviceMemory};
use ember_tuner::DeviceFingerprint;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Static properties of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device name (e.g., "Intel(R) Arc(TM) A770 Graphics")
    pub name: String,
    pub vendor: String,
    pub driver_version: String,
    /// Upper bound on work-items in one work-group
    pub max_work_group_size: usize,
    /// Upper bound on the work-group extent per dimension
    pub max_work_item_sizes: [usize; 3],
    /// Local memory available to one work-group, in bytes
    pub local_mem_bytes: usize,
}

impl DeviceInfo {
    /// Identity under which tuning results are stored.
    pub fn fingerprint(&self) -> DeviceFingerprint {
        DeviceFingerprint::new(self.name.clone(), self.driver_version.clone())
    }
}

/// Scalar kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarArg {
    U32(u32),
    I32(i32),
    F32(f32),
}

/// One positional kernel argument.
#[derive(Debug)]
pub enum KernelArg<'a> {
    /// Read-only global buffer.
    Buffer(&'a dyn DeviceMemory),
    /// Writable global buffer.
    BufferMut(&'a mut dyn DeviceMemory),
    Scalar(ScalarArg),
    /// Work-group local scratch of the given size in bytes.
    Local(usize),
}

impl KernelArg<'_> {
    pub fn u32(value: u32) -> Self {
        KernelArg::Scalar(ScalarArg::U32(value))
    }

    pub fn f32(value: f32) -> Self {
        KernelArg::Scalar(ScalarArg::F32(value))
    }
}

/// A compiled kernel entry point.
pub trait DeviceKernel: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Largest work-group this kernel can be launched with on its device.
    fn max_work_group_size(&self) -> usize;

    fn as_any(&self) -> &dyn Any;
}

/// A compiled program from which kernels are created.
pub trait DeviceProgram: Send + Sync + fmt::Debug {
    /// Create the entry point `name`; on failure returns the driver's log.
    fn create_kernel(&self, name: &str) -> std::result::Result<Arc<dyn DeviceKernel>, String>;
}

/// In-order queue of device commands.
pub trait CommandQueue: Send + Sync + fmt::Debug {
    /// Launch `kernel` over `global` with work-groups of `local` and wait for
    /// completion, returning the execution time.
    ///
    /// Failures come back as the raw device status so callers can decide
    /// whether they are fatal.
    fn enqueue_nd_range(
        &self,
        kernel: &dyn DeviceKernel,
        args: &mut [KernelArg<'_>],
        global: [usize; 3],
        local: [usize; 3],
    ) -> std::result::Result<Duration, DeviceStatus>;

    /// Block until all queued work has completed.
    fn finish(&self) -> Result<()>;
}

/// A device able to build and run kernels.
pub trait ComputeDevice: Send + Sync + fmt::Debug {
    fn info(&self) -> &DeviceInfo;

    fn device_type(&self) -> DeviceType;

    /// Compile `source` under `options` into a program called `name`.
    /// On failure returns the build log.
    fn build_program(
        &self,
        name: &str,
        source: &str,
        options: &str,
    ) -> std::result::Result<Arc<dyn DeviceProgram>, String>;

    /// Allocator producing memory kernels on this device can bind.
    fn allocator(&self) -> Arc<dyn Allocator>;

    fn queue(&self) -> &dyn CommandQueue;
}

/// Parse `-DNAME` / `-DNAME=VALUE` definitions out of a build option string.
pub fn parse_defines(options: &str) -> Vec<(String, String)> {
    options
        .split_whitespace()
        .filter_map(|opt| opt.strip_prefix("-D"))
        .filter(|def| !def.is_empty())
        .map(|def| match def.split_once('=') {
            Some((name, value)) => (name.to_owned(), value.to_owned()),
            None => (def.to_owned(), "1".to_owned()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defines_are_extracted_from_options() {
        let defs = parse_defines("-cl-mad-enable -DDATA_TYPE=half  -DENABLE_FP16 -D");
        assert_eq!(
            defs,
            vec![
                ("DATA_TYPE".to_string(), "half".to_string()),
                ("ENABLE_FP16".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn fingerprint_uses_name_and_driver() {
        let info = DeviceInfo {
            name: "gpu".into(),
            vendor: "acme".into(),
            driver_version: "2.1".into(),
            max_work_group_size: 256,
            max_work_item_sizes: [256, 256, 256],
            local_mem_bytes: 32 * 1024,
        };
        assert_eq!(info.fingerprint(), DeviceFingerprint::new("gpu", "2.1"));
    }
}
