//! Operator dispatch by `(operator, device, dtype)`.

use crate::batch_norm::{BatchNormCpu, BatchNormInputs, BatchNormOpenCl, DEFAULT_EPSILON};
use crate::context::ExecutionContext;
use ember_common::{DataType, DeviceType, KernelError, Result, TensorError};
use ember_core::element::load_f32;
use ember_core::{OperatorDef, Tensor, Workspace};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// One operator implementation for a fixed device class and element type.
pub trait Operator: Send + Sync + fmt::Debug {
    /// Compute `output` from `inputs` as described by `def`.
    fn run(
        &self,
        ctx: &ExecutionContext,
        def: &OperatorDef,
        inputs: &[&Tensor],
        output: &mut Tensor,
    ) -> Result<()>;
}

/// Dispatch key of an [`Operator`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorKey {
    pub op: String,
    pub device: DeviceType,
    pub dtype: DataType,
}

impl OperatorKey {
    pub fn new(op: &str, device: DeviceType, dtype: DataType) -> Self {
        Self { op: op.to_owned(), device, dtype }
    }
}

/// Operator implementations, populated once at setup.
#[derive(Debug, Clone, Default)]
pub struct OperatorRegistry {
    operators: HashMap<OperatorKey, Arc<dyn Operator>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in operator.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for dtype in [DataType::F32, DataType::F16] {
            registry.register("BatchNorm", DeviceType::Cpu, dtype, Arc::new(BatchNormCpuOp));
            registry.register("BatchNorm", DeviceType::OpenCl, dtype, Arc::new(BatchNormOpenClOp));
        }
        registry
    }

    /// Register `operator`, replacing any previous entry for the same key.
    pub fn register(
        &mut self,
        op: &str,
        device: DeviceType,
        dtype: DataType,
        operator: Arc<dyn Operator>,
    ) {
        self.operators.insert(OperatorKey::new(op, device, dtype), operator);
    }

    pub fn get(&self, op: &str, device: DeviceType, dtype: DataType) -> Option<Arc<dyn Operator>> {
        self.operators.get(&OperatorKey::new(op, device, dtype)).cloned()
    }

    /// Like [`get`](Self::get), but a missing provider is an error.
    pub fn resolve(&self, op: &str, device: DeviceType, dtype: DataType) -> Result<Arc<dyn Operator>> {
        self.get(op, device, dtype)
            .ok_or_else(|| KernelError::NoProvider { op: op.to_owned(), device, dtype }.into())
    }

    pub fn keys(&self) -> impl Iterator<Item = &OperatorKey> {
        self.operators.keys()
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Execute `def` against tensors in `ws`.
    ///
    /// Device and dtype come from the first input. A missing output tensor is
    /// created with the first input's allocator and dtype. Every input and an
    /// existing output must live on that same device.
    pub fn run(&self, ctx: &ExecutionContext, ws: &mut Workspace, def: &OperatorDef) -> Result<()> {
        let first = def.inputs.first().ok_or_else(|| invalid(def, "operator has no inputs".into()))?;
        let lead = ws
            .get_tensor(first)
            .ok_or_else(|| TensorError::NotFound { name: first.clone() })?;
        let (device, dtype, allocator) = (lead.device_type(), lead.dtype(), lead.allocator().clone());

        let operator = self.resolve(&def.op_type, device, dtype)?;
        for name in def.inputs.iter().chain(std::iter::once(&def.output)) {
            if let Some(t) = ws.get_tensor(name)
                && t.device_type() != device
            {
                let reason = format!("'{}' is on {} but '{}' is on {}", name, t.device_type(), first, device);
                return Err(invalid(def, reason));
            }
        }
        ws.create_tensor(&def.output, allocator, dtype);

        let names: Vec<&str> = def.inputs.iter().map(String::as_str).collect();
        let (inputs, output) = ws.operands(&names, &def.output)?;
        debug!(op = %def.op_type, name = %def.name, %device, %dtype, "running operator");
        operator.run(ctx, def, &inputs, output)
    }
}

fn invalid(def: &OperatorDef, reason: String) -> ember_common::EmberError {
    KernelError::InvalidArguments { kernel: def.op_type.clone(), reason }.into()
}

/// Batch normalization operands: `input, scale, offset, mean, var` and an
/// optional epsilon tensor. An `epsilon` argument takes precedence over the
/// tensor.
fn batch_norm_operands<'a>(
    def: &OperatorDef,
    inputs: &[&'a Tensor],
) -> Result<(BatchNormInputs<'a>, f32)> {
    let &[input, scale, offset, mean, var, ref rest @ ..] = inputs else {
        return Err(invalid(def, format!("expected 5 or 6 inputs, got {}", inputs.len())));
    };
    let epsilon = match (def.arg("epsilon"), rest) {
        (_, [_, _, ..]) => {
            return Err(invalid(def, format!("expected 5 or 6 inputs, got {}", inputs.len())));
        }
        (Some(eps), _) => eps,
        (None, [t]) if t.size() >= 1 => load_f32(&t.to_bytes()?, t.dtype(), 0),
        (None, [_]) => return Err(invalid(def, "epsilon tensor is empty".into())),
        (None, []) => DEFAULT_EPSILON,
    };
    Ok((BatchNormInputs { input, scale, offset, mean, var }, epsilon))
}

/// Batch normalization on host memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchNormCpuOp;

impl Operator for BatchNormCpuOp {
    fn run(
        &self,
        _ctx: &ExecutionContext,
        def: &OperatorDef,
        inputs: &[&Tensor],
        output: &mut Tensor,
    ) -> Result<()> {
        let (operands, epsilon) = batch_norm_operands(def, inputs)?;
        BatchNormCpu.run(operands, epsilon, output)
    }
}

/// Batch normalization through the context's device runtime and tuner.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchNormOpenClOp;

impl Operator for BatchNormOpenClOp {
    fn run(
        &self,
        ctx: &ExecutionContext,
        def: &OperatorDef,
        inputs: &[&Tensor],
        output: &mut Tensor,
    ) -> Result<()> {
        let (operands, epsilon) = batch_norm_operands(def, inputs)?;
        BatchNormOpenCl.run(ctx.runtime(), ctx.tuner(), operands, epsilon, output)
    }
}
