//! Compiled-kernel cache over one compute device.

use crate::device::{CommandQueue, ComputeDevice, DeviceInfo, DeviceKernel, DeviceProgram};
use crate::kernels::KernelLibrary;
use ember_common::{EngineConfig, KernelError, Result};
use ember_core::Allocator;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info};

/// Identity of a compiled kernel. Build options form a set, so their order
/// does not matter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelBuildKey {
    pub program: String,
    pub kernel: String,
    pub options: BTreeSet<String>,
}

impl KernelBuildKey {
    pub fn new<I, S>(program: &str, kernel: &str, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_owned(),
            kernel: kernel.to_owned(),
            options: options.into_iter().map(Into::into).collect(),
        }
    }

    fn program_key(&self) -> ProgramKey {
        ProgramKey { program: self.program.clone(), options: self.options.clone() }
    }
}

impl fmt::Display for KernelBuildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.program, self.kernel)?;
        for opt in &self.options {
            write!(f, " {opt}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProgramKey {
    program: String,
    options: BTreeSet<String>,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Programs compiled by the device.
    pub program_builds: u64,
    /// Kernel requests answered from the cache.
    pub kernel_hits: u64,
    /// Kernel requests that created a kernel.
    pub kernel_misses: u64,
}

#[derive(Debug, Default)]
struct Counters {
    program_builds: AtomicU64,
    kernel_hits: AtomicU64,
    kernel_misses: AtomicU64,
}

type GateMap<K> = Mutex<HashMap<K, Arc<Mutex<()>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn gate<K: Hash + Eq + Clone>(gates: &GateMap<K>, key: &K) -> Arc<Mutex<()>> {
    lock(gates).entry(key.clone()).or_default().clone()
}

/// Handle to one device, its command queue, and every program and kernel
/// compiled on it.
///
/// Lookups take a shared lock. The first build of a key is serialized
/// behind a per-key gate so concurrent first users compile exactly once.
pub struct DeviceRuntime {
    device: Arc<dyn ComputeDevice>,
    library: KernelLibrary,
    extra_options: Vec<String>,
    programs: RwLock<HashMap<ProgramKey, Arc<dyn DeviceProgram>>>,
    kernels: RwLock<HashMap<KernelBuildKey, Arc<dyn DeviceKernel>>>,
    program_gates: GateMap<ProgramKey>,
    kernel_gates: GateMap<KernelBuildKey>,
    counters: Counters,
}

impl DeviceRuntime {
    pub fn new(device: Arc<dyn ComputeDevice>, config: &EngineConfig) -> Self {
        info!(
            device = %device.info().name,
            driver = %device.info().driver_version,
            "device runtime ready"
        );
        Self {
            device,
            library: KernelLibrary::new(config.kernel_dir.clone()),
            extra_options: config.build_options.clone(),
            programs: RwLock::new(HashMap::new()),
            kernels: RwLock::new(HashMap::new()),
            program_gates: Mutex::new(HashMap::new()),
            kernel_gates: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn device(&self) -> &Arc<dyn ComputeDevice> {
        &self.device
    }

    pub fn info(&self) -> &DeviceInfo {
        self.device.info()
    }

    pub fn allocator(&self) -> Arc<dyn Allocator> {
        self.device.allocator()
    }

    /// The device's in-order command queue.
    pub fn command_queue(&self) -> &dyn CommandQueue {
        self.device.queue()
    }

    pub fn library(&self) -> &KernelLibrary {
        &self.library
    }

    pub fn stats(&self) -> RuntimeStats {
        let c = &self.counters;
        RuntimeStats {
            program_builds: c.program_builds.load(Ordering::Relaxed),
            kernel_hits: c.kernel_hits.load(Ordering::Relaxed),
            kernel_misses: c.kernel_misses.load(Ordering::Relaxed),
        }
    }

    /// Compiled `kernel` from `program` under `options`, building it on
    /// first use.
    pub fn build_kernel<I, S>(
        &self,
        program: &str,
        kernel: &str,
        options: I,
    ) -> Result<Arc<dyn DeviceKernel>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kernel(&KernelBuildKey::new(program, kernel, options))
    }

    /// Compiled kernel for `key`, building it on first use.
    pub fn kernel(&self, key: &KernelBuildKey) -> Result<Arc<dyn DeviceKernel>> {
        if let Some(k) = self.cached_kernel(key) {
            self.counters.kernel_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "kernel cache hit");
            return Ok(k);
        }

        let gate = gate(&self.kernel_gates, key);
        let _guard = lock(&gate);
        if let Some(k) = self.cached_kernel(key) {
            self.counters.kernel_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(k);
        }
        let created = self.create_kernel(key);
        // Waiters already hold the gate and find the kernel in the cache.
        lock(&self.kernel_gates).remove(key);
        created
    }

    fn create_kernel(&self, key: &KernelBuildKey) -> Result<Arc<dyn DeviceKernel>> {
        let program = self.program(key)?;
        let created = program.create_kernel(&key.kernel).map_err(|log| KernelError::BuildFailed {
            program: key.program.clone(),
            kernel: key.kernel.clone(),
            log,
        })?;
        self.counters.kernel_misses.fetch_add(1, Ordering::Relaxed);
        self.kernels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), Arc::clone(&created));
        Ok(created)
    }

    /// Largest work-group `kernel` can be launched with.
    pub fn kernel_max_work_group_size(&self, kernel: &dyn DeviceKernel) -> usize {
        kernel.max_work_group_size().min(self.info().max_work_group_size)
    }

    /// Drop every cached program and kernel.
    pub fn clear(&self) {
        self.kernels.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.programs.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn cached_kernel(&self, key: &KernelBuildKey) -> Option<Arc<dyn DeviceKernel>> {
        self.kernels.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    fn program(&self, key: &KernelBuildKey) -> Result<Arc<dyn DeviceProgram>> {
        let pkey = key.program_key();
        let cached = |runtime: &Self| {
            runtime.programs.read().unwrap_or_else(PoisonError::into_inner).get(&pkey).cloned()
        };
        if let Some(p) = cached(self) {
            return Ok(p);
        }

        let gate = gate(&self.program_gates, &pkey);
        let _guard = lock(&gate);
        if let Some(p) = cached(self) {
            return Ok(p);
        }
        let built = self.build_program(key, pkey.clone());
        lock(&self.program_gates).remove(&pkey);
        built
    }

    fn build_program(
        &self,
        key: &KernelBuildKey,
        pkey: ProgramKey,
    ) -> Result<Arc<dyn DeviceProgram>> {
        let source = self
            .library
            .source(&key.program)
            .ok_or_else(|| KernelError::SourceNotFound { program: key.program.clone() })?;
        let options = self.option_string(&key.options);

        let start = Instant::now();
        let built =
            self.device.build_program(&key.program, &source, &options).map_err(|log| {
                KernelError::BuildFailed {
                    program: key.program.clone(),
                    kernel: key.kernel.clone(),
                    log,
                }
            })?;
        self.counters.program_builds.fetch_add(1, Ordering::Relaxed);
        info!(
            program = %key.program,
            options = %options,
            elapsed_ms = start.elapsed().as_secs_f64() * 1e3,
            "built program"
        );

        self.programs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pkey, Arc::clone(&built));
        Ok(built)
    }

    /// Key options in set order followed by the configured extras.
    #[cfg(test)]
    fn pending_gates(&self) -> usize {
        lock(&self.program_gates).len() + lock(&self.kernel_gates).len()
    }

    fn option_string(&self, options: &BTreeSet<String>) -> String {
        options
            .iter()
            .chain(self.extra_options.iter().filter(|o| !options.contains(*o)))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for DeviceRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRuntime")
            .field("device", &self.info().name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
