//! Kernel cache behaviour of `DeviceRuntime` on the reference device.

use ember_common::{DataType, EmberError, EngineConfig, KernelError};
use ember_kernels::{ComputeDevice, DeviceRuntime, ReferenceDevice};
use std::sync::Arc;
use tempfile::TempDir;

fn runtime_on(device: &Arc<ReferenceDevice>, config: &EngineConfig) -> DeviceRuntime {
    DeviceRuntime::new(Arc::clone(device) as Arc<dyn ComputeDevice>, config)
}

#[test]
fn concurrent_first_use_compiles_once() {
    let device = Arc::new(ReferenceDevice::new());
    let runtime = runtime_on(&device, &EngineConfig::default());

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                runtime
                    .build_kernel("batch_norm", "batch_norm", DataType::F32.cl_build_options())
                    .unwrap();
            });
        }
    });

    assert_eq!(device.build_count(), 1);
    let stats = runtime.stats();
    assert_eq!(stats.program_builds, 1);
    assert_eq!(stats.kernel_misses, 1);
    assert_eq!(stats.kernel_hits, 7);
}

#[test]
fn option_order_does_not_matter() {
    let device = Arc::new(ReferenceDevice::new());
    let runtime = runtime_on(&device, &EngineConfig::default());

    let a = runtime
        .build_kernel("batch_norm", "batch_norm", ["-DDATA_TYPE=float", "-DUSE_VEC=1"])
        .unwrap();
    let b = runtime
        .build_kernel("batch_norm", "batch_norm", ["-DUSE_VEC=1", "-DDATA_TYPE=float"])
        .unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(device.build_count(), 1);
    assert_eq!(runtime.stats().kernel_hits, 1);
}

#[test]
fn distinct_option_sets_build_separately() {
    let device = Arc::new(ReferenceDevice::new());
    let runtime = runtime_on(&device, &EngineConfig::default());

    runtime.build_kernel("batch_norm", "batch_norm", DataType::F32.cl_build_options()).unwrap();
    runtime.build_kernel("batch_norm", "batch_norm", DataType::F16.cl_build_options()).unwrap();
    assert_eq!(device.build_count(), 2);

    runtime.clear();
    runtime.build_kernel("batch_norm", "batch_norm", DataType::F32.cl_build_options()).unwrap();
    assert_eq!(device.build_count(), 3);
}

#[test]
fn compile_errors_surface_as_build_failed() {
    let device = Arc::new(ReferenceDevice::new());
    let runtime = runtime_on(&device, &EngineConfig::default());

    let err = runtime.build_kernel("batch_norm", "batch_norm", Vec::<String>::new()).unwrap_err();
    match err {
        EmberError::Kernel(KernelError::BuildFailed { program, log, .. }) => {
            assert_eq!(program, "batch_norm");
            assert!(log.contains("DATA_TYPE"), "{log}");
        }
        other => panic!("expected BuildFailed, got {other}"),
    }
    assert_eq!(device.build_count(), 0);

    let err = runtime.build_kernel("batch_norm", "conv2d", DataType::F32.cl_build_options());
    assert!(matches!(err, Err(EmberError::Kernel(KernelError::BuildFailed { .. }))));
}

#[test]
fn unknown_program_has_no_source() {
    let device = Arc::new(ReferenceDevice::new());
    let runtime = runtime_on(&device, &EngineConfig::default());

    let err = runtime.build_kernel("winograd", "winograd", ["-DDATA_TYPE=float"]).unwrap_err();
    assert!(matches!(
        err,
        EmberError::Kernel(KernelError::SourceNotFound { ref program }) if program == "winograd"
    ));
}

#[test]
fn kernel_dir_overrides_embedded_sources() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("scale.cl"), "__kernel void scale(__global float *x) {}")
        .unwrap();

    let mut device = ReferenceDevice::empty(ReferenceDevice::default_info());
    device.register_kernel("scale", "scale", |_| Ok(()));
    let device = Arc::new(device);
    let config = EngineConfig { kernel_dir: Some(dir.path().to_path_buf()), ..EngineConfig::default() };
    let runtime = runtime_on(&device, &config);

    let kernel = runtime.build_kernel("scale", "scale", Vec::<String>::new()).unwrap();
    assert_eq!(kernel.name(), "scale");
    assert_eq!(runtime.kernel_max_work_group_size(&*kernel), 1024);
}

#[test]
fn kernel_work_group_limit_is_capped_by_device() {
    let mut info = ReferenceDevice::default_info();
    info.max_work_group_size = 256;
    let device = Arc::new(ReferenceDevice::with_info(info));
    let runtime = runtime_on(&device, &EngineConfig::default());

    let kernel =
        runtime.build_kernel("batch_norm", "batch_norm", DataType::F32.cl_build_options()).unwrap();
    assert_eq!(runtime.kernel_max_work_group_size(&*kernel), 256);
}
