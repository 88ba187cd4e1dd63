//! Batch normalization over NCHW tensors.
//!
//! `y = (x - mean) / sqrt(var + eps) * scale + offset`, with the per-channel
//! parameters broadcast over every spatial position. Two strategies share
//! the same arithmetic: [`BatchNormOpenCl`] launches the `batch_norm` kernel
//! through the device runtime and tuner, [`BatchNormCpu`] runs on the host
//! with rayon.

use crate::device::KernelArg;
use crate::reference::{HostLaunch, ReferenceDevice, WorkGroup};
use crate::runtime::DeviceRuntime;
use ember_common::{DataType, DeviceError, DeviceStatus, KernelError, Result, TensorError, ceil_div};
use ember_core::{DeviceMemory, Tensor};
use ember_core::element::{load_f32, store_f32};
use ember_core::memory::{host_bytes, host_bytes_mut};
use ember_tuner::{CandidateSource, Measurement, Tuner};
use rayon::prelude::*;
use tracing::{debug, trace};

pub const PROGRAM: &str = "batch_norm";
pub const KERNEL: &str = "batch_norm";

/// Epsilon used when an operator supplies neither an argument nor a tensor.
pub const DEFAULT_EPSILON: f32 = 1e-3;

/// Local work-group size `[d0, d1, d2]`.
pub type LocalSize = [u32; 3];

/// Per-channel statistics and affine parameters, all of shape `[C]`.
#[derive(Debug, Clone, Copy)]
pub struct BatchNormInputs<'a> {
    pub input: &'a Tensor,
    pub scale: &'a Tensor,
    pub offset: &'a Tensor,
    pub mean: &'a Tensor,
    pub var: &'a Tensor,
}

/// NCHW extents of a validated problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nchw {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

impl Nchw {
    pub fn pixel_size(&self) -> usize {
        self.h * self.w
    }

    pub fn len(&self) -> usize {
        self.n * self.c * self.pixel_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> BatchNormInputs<'a> {
    /// Check ranks, shapes, and dtypes, returning the problem extents.
    pub fn validate(&self) -> Result<Nchw> {
        let shape = self.input.shape();
        let [n, c, h, w] = *shape else {
            return Err(invalid(format!("input must be NCHW, got shape {shape:?}")));
        };
        let dtype = self.input.dtype();
        for (name, t) in [
            ("scale", self.scale),
            ("offset", self.offset),
            ("mean", self.mean),
            ("var", self.var),
        ] {
            if t.dtype() != dtype {
                return Err(TensorError::DTypeMismatch { expected: dtype, actual: t.dtype() }.into());
            }
            if t.size() != c {
                return Err(invalid(format!(
                    "{name} has {} elements (shape {:?}) for {c} channels",
                    t.size(),
                    t.shape()
                )));
            }
        }
        Ok(Nchw { n, c, h, w })
    }

    fn params(&self) -> [&'a Tensor; 4] {
        [self.scale, self.offset, self.mean, self.var]
    }
}

fn invalid(reason: String) -> ember_common::EmberError {
    KernelError::InvalidArguments { kernel: KERNEL.to_owned(), reason }.into()
}

/// Fold the channel statistics into one multiply-add.
#[inline]
pub fn fold(scale: f32, offset: f32, mean: f32, var: f32, epsilon: f32) -> (f32, f32) {
    let s = scale * (1.0 / (var + epsilon).sqrt());
    (s, offset - mean * s)
}

/// Global range `[N, C, ceil(H*W / 4)]`: one work-item per four pixels.
pub fn global_work_size(dims: Nchw) -> [usize; 3] {
    [dims.n, dims.c, ceil_div(dims.pixel_size(), 4)]
}

/// Tuning key naming everything that changes the best local size.
pub fn tuning_key(dtype: DataType, dims: Nchw) -> String {
    format!("batch_norm_opencl_kernel_{dtype}_{}_{}_{}_{}", dims.n, dims.c, dims.h, dims.w)
}

/// Bytes of each local scratch buffer: one 4-vector per channel in the group.
pub fn scratch_bytes(local: [usize; 3], dtype: DataType) -> usize {
    local[1] * dtype.element_size() * 4
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// Local sizes worth trying for a kernel with work-group limit `kwg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSizeCandidates {
    kwg: u32,
    max_work_item_sizes: [u32; 3],
}

impl LocalSizeCandidates {
    pub fn new(kwg: u32, max_work_item_sizes: [u32; 3]) -> Self {
        Self { kwg: kwg.max(1), max_work_item_sizes }
    }

    /// The configuration used when nothing has been tuned.
    pub fn default_local_size(&self) -> LocalSize {
        [1, 1, self.kwg]
    }
}

impl CandidateSource<LocalSize> for LocalSizeCandidates {
    fn candidates(&self) -> Vec<LocalSize> {
        let kwg = self.kwg;
        let menu = [
            [1, 1, 64],
            [1, 1, 128],
            [1, (kwg / 16).max(1), 16],
            [1, (kwg / 32).max(1), 32],
            [1, (kwg / 64).max(1), 64],
            [1, (kwg / 128).max(1), 128],
            [1, 1, kwg],
            [1, kwg, 1],
        ];
        let mut out: Vec<LocalSize> = Vec::with_capacity(menu.len());
        for lws in menu {
            if !out.contains(&lws) {
                out.push(lws);
            }
        }
        out
    }

    fn admits(&self, lws: &LocalSize) -> bool {
        let group = lws.iter().try_fold(1u32, |acc, &d| acc.checked_mul(d));
        lws.iter().all(|&d| d > 0)
            && group.is_some_and(|g| g <= self.kwg)
            && lws.iter().zip(&self.max_work_item_sizes).all(|(d, max)| d <= max)
    }
}

fn bound<'t>(tensor: &'t Tensor, name: &str) -> Result<&'t dyn DeviceMemory> {
    tensor.buffer().ok_or_else(|| TensorError::Unallocated { name: name.to_owned() }.into())
}

fn to_u32(v: usize) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

// ---------------------------------------------------------------------------
// OpenCL strategy
// ---------------------------------------------------------------------------

/// Batch normalization through the `batch_norm` device kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchNormOpenCl;

impl BatchNormOpenCl {
    /// Normalize `inputs` into `output`, tuning the local size on first use
    /// of each problem shape.
    ///
    /// `output` is resized to the input shape. A failed launch of the chosen
    /// configuration is returned as [`KernelError::LaunchFailed`].
    pub fn run(
        &self,
        runtime: &DeviceRuntime,
        tuner: &Tuner<LocalSize>,
        inputs: BatchNormInputs<'_>,
        epsilon: f32,
        output: &mut Tensor,
    ) -> Result<()> {
        let dims = inputs.validate()?;
        let dtype = inputs.input.dtype();
        if output.dtype() != dtype {
            return Err(TensorError::DTypeMismatch { expected: dtype, actual: output.dtype() }.into());
        }
        output.resize_like(inputs.input)?;

        let gws = global_work_size(dims);
        if gws.contains(&0) {
            debug!(shape = ?inputs.input.shape(), "empty batch norm, nothing to launch");
            return Ok(());
        }

        let kernel = runtime.build_kernel(PROGRAM, KERNEL, dtype.cl_build_options())?;
        let kwg = to_u32(runtime.kernel_max_work_group_size(&*kernel));
        let source = LocalSizeCandidates::new(kwg, runtime.info().max_work_item_sizes.map(to_u32));
        let default = source.default_local_size();

        let pixel_size = u32::try_from(dims.pixel_size())
            .map_err(|_| invalid(format!("{} pixels per plane exceeds u32", dims.pixel_size())))?;

        let input_buf = bound(inputs.input, "input")?;
        let [scale_buf, offset_buf, mean_buf, var_buf] = [
            bound(inputs.scale, "scale")?,
            bound(inputs.offset, "offset")?,
            bound(inputs.mean, "mean")?,
            bound(inputs.var, "var")?,
        ];
        let output_buf =
            output.buffer_mut().ok_or_else(|| TensorError::Unallocated { name: "output".into() })?;

        let queue = runtime.command_queue();
        let mut launch = |lws: &LocalSize| -> Result<Measurement<()>> {
            let local = lws.map(|d| d as usize);
            let scratch = scratch_bytes(local, dtype);
            let mut args = [
                KernelArg::Buffer(input_buf),
                KernelArg::Buffer(scale_buf),
                KernelArg::Buffer(offset_buf),
                KernelArg::Buffer(mean_buf),
                KernelArg::Buffer(var_buf),
                KernelArg::f32(epsilon),
                KernelArg::u32(pixel_size),
                KernelArg::BufferMut(&mut *output_buf),
                KernelArg::Local(scratch),
                KernelArg::Local(scratch),
            ];
            let cost = queue.enqueue_nd_range(&*kernel, &mut args, gws, local).map_err(
                |status: DeviceStatus| KernelError::LaunchFailed { kernel: KERNEL.to_owned(), status },
            )?;
            trace!(?lws, ?cost, "batch norm launch");
            Ok(Measurement::new(cost, ()))
        };

        tuner.tune_or_run(&tuning_key(dtype, dims), &default, &source, &mut launch)
    }
}

/// Host implementation of the `batch_norm` kernel for [`ReferenceDevice`],
/// following the kernel's work-group structure.
fn host_batch_norm(launch: &mut HostLaunch<'_, '_>) -> std::result::Result<(), DeviceStatus> {
    let dtype = launch.data_type()?;
    let [n, c, _] = launch.global;
    let epsilon = launch.scalar_f32(5)?;
    let pixel_size = launch.scalar_u32(6)? as usize;
    if launch.local_bytes(8)?.min(launch.local_bytes(9)?) < scratch_bytes(launch.local, dtype) {
        return Err(DeviceStatus::INVALID_ARG_SIZE);
    }

    let len = n * c * pixel_size;
    let input = launch.read_f32(0, dtype, len)?;
    let [scale, offset, mean, var] = [
        launch.read_f32(1, dtype, c)?,
        launch.read_f32(2, dtype, c)?,
        launch.read_f32(3, dtype, c)?,
        launch.read_f32(4, dtype, c)?,
    ];
    let groups: Vec<WorkGroup> = launch.work_groups().collect();
    let output = launch.buffer_mut(7)?;
    if output.len() < len * dtype.element_size() {
        return Err(DeviceStatus::INVALID_MEM_OBJECT);
    }

    for group in groups {
        // Local scratch, filled by the first work-item of each channel row.
        let folded: Vec<(f32, f32)> = (0..group.size[1])
            .map(|lc| {
                let ch = group.origin[1] + lc;
                fold(scale[ch], offset[ch], mean[ch], var[ch], epsilon)
            })
            .collect();

        for l0 in 0..group.size[0] {
            let batch = group.origin[0] + l0;
            for (lc, &(s, o)) in folded.iter().enumerate() {
                let plane = (batch * c + group.origin[1] + lc) * pixel_size;
                for l2 in 0..group.size[2] {
                    let first = (group.origin[2] + l2) * 4;
                    for i in first..(first + 4).min(pixel_size) {
                        store_f32(output, dtype, plane + i, input[plane + i] * s + o);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Register the host implementations of this module's kernels.
pub fn register_host_kernels(device: &mut ReferenceDevice) {
    device.register_kernel(PROGRAM, KERNEL, host_batch_norm);
}

// ---------------------------------------------------------------------------
// CPU strategy
// ---------------------------------------------------------------------------

/// Batch normalization on host memory, parallel over `(batch, channel)`
/// planes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchNormCpu;

impl BatchNormCpu {
    pub fn run(&self, inputs: BatchNormInputs<'_>, epsilon: f32, output: &mut Tensor) -> Result<()> {
        let dims = inputs.validate()?;
        let dtype = inputs.input.dtype();
        if !dtype.is_float() {
            return Err(invalid(format!("{dtype} is not a floating-point type")));
        }
        if output.dtype() != dtype {
            return Err(TensorError::DTypeMismatch { expected: dtype, actual: output.dtype() }.into());
        }
        output.resize_like(inputs.input)?;
        if dims.is_empty() {
            return Ok(());
        }

        let host = |t: &Tensor| -> Result<Vec<f32>> {
            let bytes = t.buffer().and_then(host_bytes).ok_or_else(|| DeviceError::MemoryFault {
                reason: format!("{} tensor is not host-accessible", t.device_type()),
            })?;
            Ok((0..t.size()).map(|i| load_f32(bytes, dtype, i)).collect())
        };
        let [scale, offset, mean, var] = inputs.params().map(host);
        let (scale, offset, mean, var) = (scale?, offset?, mean?, var?);
        let folded: Vec<(f32, f32)> =
            (0..dims.c).map(|ch| fold(scale[ch], offset[ch], mean[ch], var[ch], epsilon)).collect();

        let input = inputs.input.buffer().and_then(host_bytes).ok_or_else(|| {
            DeviceError::MemoryFault { reason: "input is not host-accessible".into() }
        })?;
        let out = output.buffer_mut().and_then(host_bytes_mut).ok_or_else(|| {
            DeviceError::MemoryFault { reason: "output is not host-accessible".into() }
        })?;

        let elem = dtype.element_size();
        let plane_bytes = dims.pixel_size() * elem;
        out[..dims.len() * elem].par_chunks_mut(plane_bytes).enumerate().for_each(|(p, dst)| {
            let (s, o) = folded[p % dims.c];
            let base = p * dims.pixel_size();
            for i in 0..dims.pixel_size() {
                store_f32(dst, dtype, i, load_f32(input, dtype, base + i) * s + o);
            }
        });
        Ok(())
    }
}
