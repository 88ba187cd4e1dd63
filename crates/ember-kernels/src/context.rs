//! Explicit execution context.
//!
//! Everything that would otherwise be process-global (the device runtime,
//! the tuner, allocators, and the operator registry) is owned here and
//! passed to the code that needs it.

use crate::batch_norm::LocalSize;
use crate::device::ComputeDevice;
use crate::reference::ReferenceDevice;
use crate::registry::OperatorRegistry;
use crate::runtime::DeviceRuntime;
use ember_common::{DeviceType, EngineConfig, Result};
use ember_core::{Allocator, AllocatorRegistry, NetDef, OperatorDef, Serializer, Workspace};
use ember_tuner::Tuner;
use std::sync::Arc;
use tracing::info;

/// Device runtime, tuner, allocators, and operators for one device.
#[derive(Debug)]
pub struct ExecutionContext {
    config: EngineConfig,
    runtime: Arc<DeviceRuntime>,
    tuner: Arc<Tuner<LocalSize>>,
    allocators: AllocatorRegistry,
    operators: OperatorRegistry,
}

impl ExecutionContext {
    /// Bring up a context on `device`.
    ///
    /// The configuration is validated first. Tuning results persisted for
    /// this device are loaded from `config.tuning.cache_path`.
    pub fn init(device: Arc<dyn ComputeDevice>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let fingerprint = device.info().fingerprint();
        let tuner = Arc::new(Tuner::new(fingerprint, config.tuning.clone()));

        let mut allocators = AllocatorRegistry::with_host();
        allocators.register(device.allocator());

        let runtime = Arc::new(DeviceRuntime::new(device, &config));
        info!(
            device = %runtime.info().name,
            policy = %config.tuning.policy,
            "execution context initialized"
        );
        Ok(Self { config, runtime, tuner, allocators, operators: OperatorRegistry::with_defaults() })
    }

    /// Context on the host-emulated reference device.
    pub fn reference(config: EngineConfig) -> Result<Self> {
        Self::init(Arc::new(ReferenceDevice::new()), config)
    }

    /// Context on the OpenCL device selected by `config`.
    #[cfg(feature = "opencl")]
    pub fn opencl(config: EngineConfig) -> Result<Self> {
        let device = crate::cl::ClDevice::new(&config)?;
        Self::init(Arc::new(device), config)
    }

    /// Replace the operator registry.
    pub fn with_operators(mut self, operators: OperatorRegistry) -> Self {
        self.operators = operators;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn runtime(&self) -> &DeviceRuntime {
        &self.runtime
    }

    pub fn tuner(&self) -> &Tuner<LocalSize> {
        &self.tuner
    }

    pub fn operators(&self) -> &OperatorRegistry {
        &self.operators
    }

    pub fn allocators(&self) -> &AllocatorRegistry {
        &self.allocators
    }

    /// Allocator for tensors on `device`.
    pub fn allocator(&self, device: DeviceType) -> Result<Arc<dyn Allocator>> {
        self.allocators.require(device)
    }

    pub fn serializer(&self) -> Serializer {
        Serializer::new(self.allocators.clone())
    }

    /// Build a workspace holding the tensors of `net` on `device`.
    pub fn load_model(&self, net: &NetDef, device: DeviceType) -> Result<Workspace> {
        Workspace::from_model(net, device, &self.serializer())
    }

    /// Run one operator against `ws`.
    pub fn run_operator(&self, ws: &mut Workspace, def: &OperatorDef) -> Result<()> {
        self.operators.run(self, ws, def)
    }

    /// Run every operator of `net` in order.
    pub fn run_net(&self, ws: &mut Workspace, net: &NetDef) -> Result<()> {
        net.ops.iter().try_for_each(|def| self.run_operator(ws, def))
    }

    /// Drain the device queue and persist tuning results.
    pub fn shutdown(self) -> Result<()> {
        self.runtime.command_queue().finish()?;
        self.tuner.flush()?;
        let stats = self.tuner.stats();
        info!(
            tunes = stats.tunes,
            hits = stats.hits,
            builds = self.runtime.stats().program_builds,
            "execution context shut down"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.tuning.bench_iterations = 0;
        assert!(ExecutionContext::reference(config).is_err());
    }

    #[test]
    fn allocators_cover_host_and_device() {
        let ctx = ExecutionContext::reference(EngineConfig::default()).unwrap();
        assert_eq!(ctx.allocator(DeviceType::Cpu).unwrap().device_type(), DeviceType::Cpu);
        assert_eq!(ctx.allocator(DeviceType::OpenCl).unwrap().device_type(), DeviceType::OpenCl);
        ctx.shutdown().unwrap();
    }
}
