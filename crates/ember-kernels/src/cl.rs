//! OpenCL device backed by `opencl3`.
//!
//! Selects the platform and device by index from [`EngineConfig`], creates
//! one context and one in-order queue, and maps every driver failure onto
//! Ember errors or raw [`DeviceStatus`] codes.

use crate::device::{
    CommandQueue, ComputeDevice, DeviceInfo, DeviceKernel, DeviceProgram, KernelArg, ScalarArg,
};
use ember_common::{DeviceError, DeviceStatus, DeviceType, EmberError, EngineConfig, Result};
use ember_core::memory::check_range;
use ember_core::{Allocator, DeviceMemory};
use opencl3::command_queue::{CL_QUEUE_PROFILING_ENABLE, CommandQueue as ClQueue};
use opencl3::context::Context;
use opencl3::device::{CL_DEVICE_TYPE_ALL, Device};
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_READ_WRITE, ClMem};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{CL_BLOCKING, cl_device_id, cl_mem};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Context and queue shared by the device, its programs, and its buffers.
struct ClShared {
    device_id: cl_device_id,
    context: Context,
    queue: ClQueue,
    profiling: bool,
    // Serializes argument binding and enqueue; kernels are not reentrant.
    launch: Mutex<()>,
}

// SAFETY: OpenCL handles are thread-safe when used with proper synchronization.
// The command queue serializes operations internally and launches hold `launch`.
unsafe impl Send for ClShared {}
unsafe impl Sync for ClShared {}

fn device_error(what: &str, e: impl fmt::Display) -> EmberError {
    DeviceError::NoDevice { reason: format!("{what}: {e}") }.into()
}

/// A GPU or other OpenCL device.
pub struct ClDevice {
    info: DeviceInfo,
    shared: Arc<ClShared>,
    allocator: Arc<ClAllocator>,
    queue: ClCommandQueue,
}

impl ClDevice {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let platforms = get_platforms().map_err(|e| device_error("get platforms", e))?;
        if platforms.is_empty() {
            return Err(DeviceError::NoPlatforms.into());
        }
        let platform = platforms.get(config.platform_index as usize).ok_or_else(|| {
            DeviceError::NoDevice {
                reason: format!(
                    "platform index {} out of range ({} platforms)",
                    config.platform_index,
                    platforms.len()
                ),
            }
        })?;
        let ids = platform
            .get_devices(CL_DEVICE_TYPE_ALL)
            .map_err(|e| device_error("get devices", e))?;
        let device_id = *ids.get(config.device_index as usize).ok_or_else(|| {
            DeviceError::NoDevice {
                reason: format!(
                    "device index {} out of range ({} devices)",
                    config.device_index,
                    ids.len()
                ),
            }
        })?;
        let device = Device::new(device_id);

        let sizes = device.max_work_item_sizes().unwrap_or_default();
        let dim = |i: usize| sizes.get(i).copied().unwrap_or(1);
        let info = DeviceInfo {
            name: device.name().unwrap_or_default(),
            vendor: device.vendor().unwrap_or_default(),
            driver_version: device.driver_version().unwrap_or_default(),
            max_work_group_size: device.max_work_group_size().unwrap_or(1),
            max_work_item_sizes: [dim(0), dim(1), dim(2)],
            local_mem_bytes: usize::try_from(device.local_mem_size().unwrap_or(0))
                .unwrap_or(usize::MAX),
        };

        let context =
            Context::from_device(&device).map_err(|e| device_error("create context", e))?;
        let properties = if config.enable_profiling { CL_QUEUE_PROFILING_ENABLE } else { 0 };
        #[allow(deprecated)]
        let queue = ClQueue::create_default_with_properties(&context, properties, 0)
            .map_err(|e| device_error("create command queue", e))?;

        info!(device = %info.name, driver = %info.driver_version, "OpenCL device selected");
        let shared = Arc::new(ClShared {
            device_id,
            context,
            queue,
            profiling: config.enable_profiling,
            launch: Mutex::new(()),
        });
        Ok(Self {
            info,
            allocator: Arc::new(ClAllocator { shared: Arc::clone(&shared) }),
            queue: ClCommandQueue { shared: Arc::clone(&shared) },
            shared,
        })
    }
}

impl fmt::Debug for ClDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClDevice").field("info", &self.info).finish()
    }
}

impl ComputeDevice for ClDevice {
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
        let program = Program::create_and_build_from_source(&self.shared.context, source, options)?;
        debug!(program = name, "OpenCL program compiled");
        Ok(Arc::new(ClProgram { program, shared: Arc::clone(&self.shared) }))
    }

    fn allocator(&self) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }

    fn queue(&self) -> &dyn CommandQueue {
        &self.queue
    }
}

// ---------------------------------------------------------------------------
// Programs and kernels
// ---------------------------------------------------------------------------

struct ClProgram {
    program: Program,
    shared: Arc<ClShared>,
}

// SAFETY: see `ClShared`.
unsafe impl Send for ClProgram {}
unsafe impl Sync for ClProgram {}

impl fmt::Debug for ClProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClProgram").finish_non_exhaustive()
    }
}

impl DeviceProgram for ClProgram {
    fn create_kernel(&self, name: &str) -> std::result::Result<Arc<dyn DeviceKernel>, String> {
        let kernel = Kernel::create(&self.program, name).map_err(|e| e.to_string())?;
        let max_work_group_size =
            kernel.get_work_group_size(self.shared.device_id).map_err(|e| e.to_string())?;
        Ok(Arc::new(ClKernel { name: name.to_owned(), kernel, max_work_group_size }))
    }
}

struct ClKernel {
    name: String,
    kernel: Kernel,
    max_work_group_size: usize,
}

// SAFETY: see `ClShared`. Argument binding happens under `ClShared::launch`.
unsafe impl Send for ClKernel {}
unsafe impl Sync for ClKernel {}

impl fmt::Debug for ClKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClKernel").field("name", &self.name).finish()
    }
}

impl DeviceKernel for ClKernel {
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

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct ClCommandQueue {
    shared: Arc<ClShared>,
}

impl fmt::Debug for ClCommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClCommandQueue").field("profiling", &self.shared.profiling).finish()
    }
}

fn mem_handle(memory: &dyn DeviceMemory) -> std::result::Result<cl_mem, DeviceStatus> {
    memory
        .as_any()
        .downcast_ref::<ClMemory>()
        .map(|m| m.buffer.get())
        .ok_or(DeviceStatus::INVALID_MEM_OBJECT)
}

impl CommandQueue for ClCommandQueue {
    fn enqueue_nd_range(
        &self,
        kernel: &dyn DeviceKernel,
        args: &mut [KernelArg<'_>],
        global: [usize; 3],
        local: [usize; 3],
    ) -> std::result::Result<Duration, DeviceStatus> {
        let kernel =
            kernel.as_any().downcast_ref::<ClKernel>().ok_or(DeviceStatus::INVALID_KERNEL)?;
        let handles = args
            .iter()
            .map(|arg| match arg {
                KernelArg::Buffer(m) => mem_handle(*m).map(Some),
                KernelArg::BufferMut(m) => mem_handle(&**m).map(Some),
                _ => Ok(None),
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let _launch = self.shared.launch.lock().unwrap_or_else(PoisonError::into_inner);
        let start = Instant::now();
        let mut exec = ExecuteKernel::new(&kernel.kernel);
        // SAFETY: argument kinds and order match the kernel signature, and
        // the buffers outlive the blocking wait below.
        let event = unsafe {
            for (arg, handle) in args.iter().zip(&handles) {
                match (arg, handle) {
                    (_, Some(mem)) => exec.set_arg(mem),
                    (KernelArg::Scalar(ScalarArg::U32(v)), None) => exec.set_arg(v),
                    (KernelArg::Scalar(ScalarArg::I32(v)), None) => exec.set_arg(v),
                    (KernelArg::Scalar(ScalarArg::F32(v)), None) => exec.set_arg(v),
                    (KernelArg::Local(bytes), None) => exec.set_arg_local_buffer(*bytes),
                    _ => return Err(DeviceStatus::INVALID_ARG_VALUE),
                };
            }
            exec.set_global_work_sizes(&global)
                .set_local_work_sizes(&local)
                .enqueue_nd_range(&self.shared.queue)
                .map_err(|e| DeviceStatus(e.0))?
        };
        event.wait().map_err(|e| DeviceStatus(e.0))?;

        if self.shared.profiling
            && let (Ok(begin), Ok(end)) =
                (event.profiling_command_start(), event.profiling_command_end())
        {
            return Ok(Duration::from_nanos(end.saturating_sub(begin)));
        }
        Ok(start.elapsed())
    }

    fn finish(&self) -> Result<()> {
        self.shared.queue.finish().map_err(|e| device_error("finish", e))
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// A device buffer. Host access goes through blocking transfers on the
/// owning queue.
pub struct ClMemory {
    buffer: Buffer<u8>,
    len: usize,
    shared: Arc<ClShared>,
}

// SAFETY: see `ClShared`.
unsafe impl Send for ClMemory {}
unsafe impl Sync for ClMemory {}

impl fmt::Debug for ClMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClMemory").field("len", &self.len).finish()
    }
}

fn transfer_error(what: &str, e: impl fmt::Display) -> EmberError {
    DeviceError::MemoryFault { reason: format!("{what}: {e}") }.into()
}

impl DeviceMemory for ClMemory {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        check_range(offset, dst.len(), self.len)?;
        if dst.is_empty() {
            return Ok(());
        }
        // SAFETY: blocking read into a host slice of exactly the requested size.
        unsafe {
            self.shared
                .queue
                .enqueue_read_buffer(&self.buffer, CL_BLOCKING, offset, dst, &[])
                .map_err(|e| transfer_error("read buffer", e))?;
        }
        Ok(())
    }

    fn write(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        check_range(offset, src.len(), self.len)?;
        if src.is_empty() {
            return Ok(());
        }
        // SAFETY: blocking write from a host slice of exactly the requested size.
        unsafe {
            self.shared
                .queue
                .enqueue_write_buffer(&mut self.buffer, CL_BLOCKING, offset, src, &[])
                .map_err(|e| transfer_error("write buffer", e))?;
        }
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

/// Allocates zero-filled device buffers.
pub struct ClAllocator {
    shared: Arc<ClShared>,
}

impl fmt::Debug for ClAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClAllocator").finish_non_exhaustive()
    }
}

impl Allocator for ClAllocator {
    fn device_type(&self) -> DeviceType {
        DeviceType::OpenCl
    }

    fn allocate(&self, nbytes: usize) -> Result<Box<dyn DeviceMemory>> {
        // Zero-sized buffers are invalid in OpenCL.
        let count = nbytes.max(1);
        // SAFETY: no host pointer is supplied.
        let buffer = unsafe {
            Buffer::<u8>::create(&self.shared.context, CL_MEM_READ_WRITE, count, std::ptr::null_mut())
                .map_err(|e| transfer_error("create buffer", e))?
        };
        let mut memory = ClMemory { buffer, len: nbytes, shared: Arc::clone(&self.shared) };
        memory.write(0, &vec![0u8; nbytes])?;
        Ok(Box::new(memory))
    }

    fn free(&self, memory: Box<dyn DeviceMemory>) {
        drop(memory);
    }
}
