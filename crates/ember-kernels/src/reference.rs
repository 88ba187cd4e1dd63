//! Host emulation of an OpenCL device.
//!
//! [`ReferenceDevice`] accepts the same programs, build options, and launch
//! geometry a GPU would, enforces the same limits, and executes registered
//! host implementations of each kernel. It stands in for hardware wherever
//! no OpenCL platform is available.

use crate::device::{
    CommandQueue, ComputeDevice, DeviceInfo, DeviceKernel, DeviceProgram, KernelArg, ScalarArg,
    parse_defines,
};
use ember_common::{DataType, DeviceStatus, DeviceType, Result};
use ember_core::element::load_f32;
use ember_core::memory::{host_bytes, host_bytes_mut};
use ember_core::{AllocationStats, Allocator, HostAllocator};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Host implementation of one kernel entry point.
pub type HostKernelFn =
    dyn Fn(&mut HostLaunch<'_, '_>) -> std::result::Result<(), DeviceStatus> + Send + Sync;

// ---------------------------------------------------------------------------
// Launch view handed to host kernels
// ---------------------------------------------------------------------------

/// One work-group of a launch. Trailing groups may be smaller than the
/// requested local size when the global range is not a multiple of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkGroup {
    pub id: [usize; 3],
    /// Global id of the group's first work-item.
    pub origin: [usize; 3],
    pub size: [usize; 3],
}

/// Arguments and geometry of a launch, as seen by a host kernel.
pub struct HostLaunch<'a, 'b> {
    pub global: [usize; 3],
    pub local: [usize; 3],
    defines: &'a [(String, String)],
    args: &'a mut [KernelArg<'b>],
}

impl<'a, 'b> HostLaunch<'a, 'b> {
    pub fn define(&self, name: &str) -> Option<&str> {
        self.defines.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Element type selected by `-DDATA_TYPE=<cl type>`.
    pub fn data_type(&self) -> std::result::Result<DataType, DeviceStatus> {
        let cl_type = self.define("DATA_TYPE").ok_or(DeviceStatus::INVALID_KERNEL)?;
        DataType::ALL
            .into_iter()
            .find(|dt| dt.cl_type() == cl_type)
            .ok_or(DeviceStatus::INVALID_KERNEL)
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    fn arg(&self, index: usize) -> std::result::Result<&KernelArg<'b>, DeviceStatus> {
        self.args.get(index).ok_or(DeviceStatus::INVALID_ARG_INDEX)
    }

    pub fn buffer(&self, index: usize) -> std::result::Result<&[u8], DeviceStatus> {
        let memory = match self.arg(index)? {
            KernelArg::Buffer(m) => *m,
            KernelArg::BufferMut(m) => &**m,
            _ => return Err(DeviceStatus::INVALID_ARG_VALUE),
        };
        host_bytes(memory).ok_or(DeviceStatus::INVALID_MEM_OBJECT)
    }

    pub fn buffer_mut(&mut self, index: usize) -> std::result::Result<&mut [u8], DeviceStatus> {
        match self.args.get_mut(index) {
            Some(KernelArg::BufferMut(m)) => {
                host_bytes_mut(&mut **m).ok_or(DeviceStatus::INVALID_MEM_OBJECT)
            }
            Some(_) => Err(DeviceStatus::INVALID_ARG_VALUE),
            None => Err(DeviceStatus::INVALID_ARG_INDEX),
        }
    }

    /// Decode the first `count` elements of buffer `index` to `f32`.
    pub fn read_f32(
        &self,
        index: usize,
        dtype: DataType,
        count: usize,
    ) -> std::result::Result<Vec<f32>, DeviceStatus> {
        let bytes = self.buffer(index)?;
        if bytes.len() < count * dtype.element_size() {
            return Err(DeviceStatus::INVALID_MEM_OBJECT);
        }
        Ok((0..count).map(|i| load_f32(bytes, dtype, i)).collect())
    }

    pub fn scalar_u32(&self, index: usize) -> std::result::Result<u32, DeviceStatus> {
        match self.arg(index)? {
            KernelArg::Scalar(ScalarArg::U32(v)) => Ok(*v),
            _ => Err(DeviceStatus::INVALID_ARG_VALUE),
        }
    }

    pub fn scalar_f32(&self, index: usize) -> std::result::Result<f32, DeviceStatus> {
        match self.arg(index)? {
            KernelArg::Scalar(ScalarArg::F32(v)) => Ok(*v),
            _ => Err(DeviceStatus::INVALID_ARG_VALUE),
        }
    }

    /// Size in bytes of local argument `index`.
    pub fn local_bytes(&self, index: usize) -> std::result::Result<usize, DeviceStatus> {
        match self.arg(index)? {
            KernelArg::Local(bytes) => Ok(*bytes),
            _ => Err(DeviceStatus::INVALID_ARG_VALUE),
        }
    }

    /// All work-groups of the launch in dimension-0-fastest order.
    pub fn work_groups(&self) -> impl Iterator<Item = WorkGroup> + use<> {
        let (global, local) = (self.global, self.local);
        let counts: [usize; 3] = std::array::from_fn(|d| global[d].div_ceil(local[d]));
        (0..counts[2]).flat_map(move |g2| {
            (0..counts[1]).flat_map(move |g1| {
                (0..counts[0]).map(move |g0| {
                    let id = [g0, g1, g2];
                    let origin: [usize; 3] = std::array::from_fn(|d| id[d] * local[d]);
                    let size = std::array::from_fn(|d| local[d].min(global[d] - origin[d]));
                    WorkGroup { id, origin, size }
                })
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Host-emulated OpenCL device.
pub struct ReferenceDevice {
    info: DeviceInfo,
    host_kernels: HashMap<(String, String), Arc<HostKernelFn>>,
    allocator: Arc<HostAllocator>,
    queue: ReferenceQueue,
    builds: AtomicU64,
}

impl ReferenceDevice {
    /// Device with default limits and the built-in kernels registered.
    pub fn new() -> Self {
        Self::with_info(Self::default_info())
    }

    /// Device with custom limits and the built-in kernels registered.
    pub fn with_info(info: DeviceInfo) -> Self {
        let mut device = Self::empty(info);
        crate::batch_norm::register_host_kernels(&mut device);
        device
    }

    /// Device with no kernels registered.
    pub fn empty(info: DeviceInfo) -> Self {
        let queue = ReferenceQueue {
            max_work_item_sizes: info.max_work_item_sizes,
            local_mem_bytes: info.local_mem_bytes,
            launches: AtomicU64::new(0),
        };
        Self {
            info,
            host_kernels: HashMap::new(),
            allocator: Arc::new(HostAllocator::for_device(DeviceType::OpenCl)),
            queue,
            builds: AtomicU64::new(0),
        }
    }

    pub fn default_info() -> DeviceInfo {
        DeviceInfo {
            name: "Ember Reference Device".to_string(),
            vendor: "Ember".to_string(),
            driver_version: format!("reference-{}", env!("CARGO_PKG_VERSION")),
            max_work_group_size: 1024,
            max_work_item_sizes: [1024, 1024, 1024],
            local_mem_bytes: 65536,
        }
    }

    /// Register the host implementation of `program`/`kernel`.
    pub fn register_kernel<F>(&mut self, program: &str, kernel: &str, f: F)
    where
        F: Fn(&mut HostLaunch<'_, '_>) -> std::result::Result<(), DeviceStatus>
            + Send
            + Sync
            + 'static,
    {
        self.host_kernels.insert((program.to_owned(), kernel.to_owned()), Arc::new(f));
    }

    /// Number of successful program builds.
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    /// Number of launches that passed validation and ran.
    pub fn launch_count(&self) -> u64 {
        self.queue.launches.load(Ordering::Relaxed)
    }

    pub fn allocation_stats(&self) -> AllocationStats {
        self.allocator.stats()
    }
}

impl Default for ReferenceDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReferenceDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceDevice")
            .field("info", &self.info)
            .field("kernels", &self.host_kernels.len())
            .field("builds", &self.build_count())
            .finish()
    }
}

impl ComputeDevice for ReferenceDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::OpenCl
    }

    fn build_program(
        &self,
        name: &str,
        source: &str,
        options: &str,
    ) -> std::result::Result<Arc<dyn DeviceProgram>, String> {
        let defines = parse_defines(options);
        if source.contains("DATA_TYPE") && !defines.iter().any(|(k, _)| k == "DATA_TYPE") {
            return Err(format!("{name}.cl: error: use of undeclared identifier 'DATA_TYPE'"));
        }
        let kernels: HashMap<String, Arc<HostKernelFn>> = self
            .host_kernels
            .iter()
            .filter(|((program, _), _)| program == name)
            .map(|((_, kernel), f)| (kernel.clone(), Arc::clone(f)))
            .collect();
        if kernels.is_empty() {
            return Err(format!("{name}.cl: error: no host implementation for program"));
        }
        self.builds.fetch_add(1, Ordering::Relaxed);
        trace!(program = name, options, "reference program built");
        Ok(Arc::new(ReferenceProgram {
            source: source.to_owned(),
            defines: Arc::new(defines),
            kernels,
            max_work_group_size: self.info.max_work_group_size,
        }))
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }

    fn queue(&self) -> &dyn CommandQueue {
        &self.queue
    }
}

// ---------------------------------------------------------------------------
// Program / kernel / queue
// ---------------------------------------------------------------------------

struct ReferenceProgram {
    source: String,
    defines: Arc<Vec<(String, String)>>,
    kernels: HashMap<String, Arc<HostKernelFn>>,
    max_work_group_size: usize,
}

impl fmt::Debug for ReferenceProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceProgram")
            .field("defines", &self.defines)
            .field("kernels", &self.kernels.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DeviceProgram for ReferenceProgram {
    fn create_kernel(&self, name: &str) -> std::result::Result<Arc<dyn DeviceKernel>, String> {
        if !self.source.contains(&format!("__kernel void {name}(")) {
            return Err(format!("CL_INVALID_KERNEL_NAME: no kernel '{name}' in program"));
        }
        let host = self
            .kernels
            .get(name)
            .ok_or_else(|| format!("no host implementation for kernel '{name}'"))?;
        Ok(Arc::new(ReferenceKernel {
            name: name.to_owned(),
            max_work_group_size: self.max_work_group_size,
            defines: Arc::clone(&self.defines),
            host: Arc::clone(host),
        }))
    }
}

struct ReferenceKernel {
    name: String,
    max_work_group_size: usize,
    defines: Arc<Vec<(String, String)>>,
    host: Arc<HostKernelFn>,
}

impl fmt::Debug for ReferenceKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceKernel").field("name", &self.name).finish()
    }
}

impl DeviceKernel for ReferenceKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct ReferenceQueue {
    max_work_item_sizes: [usize; 3],
    local_mem_bytes: usize,
    launches: AtomicU64,
}

impl ReferenceQueue {
    fn validate(
        &self,
        kernel: &ReferenceKernel,
        args: &[KernelArg<'_>],
        global: [usize; 3],
        local: [usize; 3],
    ) -> std::result::Result<(), DeviceStatus> {
        if global.contains(&0) {
            return Err(DeviceStatus::INVALID_GLOBAL_WORK_SIZE);
        }
        if local.contains(&0) {
            return Err(DeviceStatus::INVALID_WORK_GROUP_SIZE);
        }
        if local.iter().zip(&self.max_work_item_sizes).any(|(l, max)| l > max) {
            return Err(DeviceStatus::INVALID_WORK_ITEM_SIZE);
        }
        let group: usize = local.iter().product();
        if group > kernel.max_work_group_size {
            return Err(DeviceStatus::INVALID_WORK_GROUP_SIZE);
        }
        let mut local_total = 0usize;
        for arg in args {
            match arg {
                KernelArg::Local(0) => return Err(DeviceStatus::INVALID_ARG_SIZE),
                KernelArg::Local(bytes) => local_total = local_total.saturating_add(*bytes),
                KernelArg::Buffer(m) if host_bytes(*m).is_none() => {
                    return Err(DeviceStatus::INVALID_MEM_OBJECT);
                }
                KernelArg::BufferMut(m) if host_bytes(&**m).is_none() => {
                    return Err(DeviceStatus::INVALID_MEM_OBJECT);
                }
                _ => {}
            }
        }
        if local_total > self.local_mem_bytes {
            return Err(DeviceStatus::OUT_OF_RESOURCES);
        }
        Ok(())
    }
}

impl CommandQueue for ReferenceQueue {
    fn enqueue_nd_range(
        &self,
        kernel: &dyn DeviceKernel,
        args: &mut [KernelArg<'_>],
        global: [usize; 3],
        local: [usize; 3],
    ) -> std::result::Result<Duration, DeviceStatus> {
        let kernel = kernel
            .as_any()
            .downcast_ref::<ReferenceKernel>()
            .ok_or(DeviceStatus::INVALID_KERNEL)?;
        self.validate(kernel, args, global, local)?;

        let start = Instant::now();
        let mut launch = HostLaunch { global, local, defines: &kernel.defines, args };
        (kernel.host)(&mut launch)?;
        let elapsed = start.elapsed();

        self.launches.fetch_add(1, Ordering::Relaxed);
        trace!(kernel = %kernel.name, ?global, ?local, ?elapsed, "reference launch");
        Ok(elapsed)
    }

    fn finish(&self) -> Result<()> {
        Ok(())
    }
}
