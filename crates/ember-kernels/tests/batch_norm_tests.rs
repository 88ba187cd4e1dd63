//! Batch normalization through the device runtime and tuner.

use ember_common::{
    DataType, DeviceStatus, DeviceType, EmberError, EngineConfig, KernelError, TuningError,
    TuningPolicy,
};
use ember_core::Tensor;
use ember_kernels::batch_norm::{Nchw, tuning_key};
use ember_kernels::{
    BatchNormCpu, BatchNormInputs, BatchNormOpenCl, ExecutionContext, ReferenceDevice,
};
use half::f16;
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

struct Problem {
    shape: [usize; 4],
    input: Vec<f32>,
    scale: Vec<f32>,
    offset: Vec<f32>,
    mean: Vec<f32>,
    var: Vec<f32>,
}

impl Problem {
    /// Deterministic data with positive variances.
    fn new(shape: [usize; 4]) -> Self {
        let [n, c, h, w] = shape;
        let channel = |k: f32| (0..c).map(|i| k * (i as f32 + 1.0)).collect::<Vec<_>>();
        Self {
            shape,
            input: (0..n * c * h * w).map(|i| ((i * 7) % 23) as f32 * 0.25 - 2.0).collect(),
            scale: channel(0.5),
            offset: channel(-0.25),
            mean: channel(0.1),
            var: channel(0.75),
        }
    }

    fn expected(&self, epsilon: f32) -> Vec<f32> {
        let [_, c, h, w] = self.shape;
        self.input
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let ch = (i / (h * w)) % c;
                let (x, m, v) = (f64::from(x), f64::from(self.mean[ch]), f64::from(self.var[ch]));
                let y = (x - m) / (v + f64::from(epsilon)).sqrt() * f64::from(self.scale[ch])
                    + f64::from(self.offset[ch]);
                y as f32
            })
            .collect()
    }

    fn tensors(&self, ctx: &ExecutionContext, device: DeviceType) -> [Tensor; 5] {
        let alloc = ctx.allocator(device).unwrap();
        let c = [self.shape[1]];
        [
            Tensor::from_slice(alloc.clone(), &self.shape, &self.input).unwrap(),
            Tensor::from_slice(alloc.clone(), &c, &self.scale).unwrap(),
            Tensor::from_slice(alloc.clone(), &c, &self.offset).unwrap(),
            Tensor::from_slice(alloc.clone(), &c, &self.mean).unwrap(),
            Tensor::from_slice(alloc, &c, &self.var).unwrap(),
        ]
    }
}

fn inputs(t: &[Tensor; 5]) -> BatchNormInputs<'_> {
    BatchNormInputs { input: &t[0], scale: &t[1], offset: &t[2], mean: &t[3], var: &t[4] }
}

fn reference_ctx() -> ExecutionContext {
    ExecutionContext::reference(EngineConfig::default()).unwrap()
}

fn ctx_with_local_mem(bytes: usize) -> ExecutionContext {
    let mut info = ReferenceDevice::default_info();
    info.local_mem_bytes = bytes;
    ExecutionContext::init(Arc::new(ReferenceDevice::with_info(info)), EngineConfig::default())
        .unwrap()
}

fn run_device(ctx: &ExecutionContext, problem: &Problem, epsilon: f32) -> ember_common::Result<Vec<f32>> {
    let t = problem.tensors(ctx, DeviceType::OpenCl);
    let mut out = Tensor::new(ctx.allocator(DeviceType::OpenCl)?, DataType::F32);
    BatchNormOpenCl.run(ctx.runtime(), ctx.tuner(), inputs(&t), epsilon, &mut out)?;
    assert_eq!(out.shape(), &problem.shape);
    out.to_vec::<f32>()
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= 1e-4 * e.abs().max(1.0), "element {i}: {a} vs {e}");
    }
}

#[test]
fn device_result_matches_formula() {
    let ctx = reference_ctx();
    let problem = Problem::new([2, 3, 5, 3]);
    let out = run_device(&ctx, &problem, 1e-3).unwrap();
    assert_close(&out, &problem.expected(1e-3));
}

#[test]
fn second_call_reuses_tuned_local_size() {
    let ctx = reference_ctx();
    let problem = Problem::new([1, 8, 4, 4]);

    run_device(&ctx, &problem, 1e-3).unwrap();
    let key = tuning_key(DataType::F32, Nchw { n: 1, c: 8, h: 4, w: 4 });
    assert_eq!(key, "batch_norm_opencl_kernel_f32_1_8_4_4");
    assert!(ctx.tuner().lookup(&key).is_some());
    let after_tuning = ctx.tuner().stats();
    assert_eq!(after_tuning.tunes, 1);

    let out = run_device(&ctx, &problem, 1e-3).unwrap();
    assert_close(&out, &problem.expected(1e-3));

    let stats = ctx.tuner().stats();
    assert_eq!(stats.tunes, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.evaluations, after_tuning.evaluations + 1);
    assert_eq!(ctx.runtime().stats().program_builds, 1);
}

#[test]
fn matches_cpu_strategy_for_half_precision() {
    let ctx = reference_ctx();
    let problem = Problem::new([1, 4, 3, 5]);
    let halves = |v: &[f32]| v.iter().map(|&x| f16::from_f32(x)).collect::<Vec<_>>();
    let c = [problem.shape[1]];

    let mut results = Vec::new();
    for device in [DeviceType::OpenCl, DeviceType::Cpu] {
        let alloc = ctx.allocator(device).unwrap();
        let t = [
            Tensor::from_slice(alloc.clone(), &problem.shape, &halves(&problem.input)).unwrap(),
            Tensor::from_slice(alloc.clone(), &c, &halves(&problem.scale)).unwrap(),
            Tensor::from_slice(alloc.clone(), &c, &halves(&problem.offset)).unwrap(),
            Tensor::from_slice(alloc.clone(), &c, &halves(&problem.mean)).unwrap(),
            Tensor::from_slice(alloc.clone(), &c, &halves(&problem.var)).unwrap(),
        ];
        let mut out = Tensor::new(alloc, DataType::F16);
        match device {
            DeviceType::OpenCl => BatchNormOpenCl
                .run(ctx.runtime(), ctx.tuner(), inputs(&t), 1e-3, &mut out)
                .unwrap(),
            DeviceType::Cpu => BatchNormCpu.run(inputs(&t), 1e-3, &mut out).unwrap(),
        }
        results.push(out.to_vec::<f16>().unwrap());
    }
    assert_eq!(results[0], results[1]);
    assert!(ctx.tuner().lookup("batch_norm_opencl_kernel_f16_1_4_3_5").is_some());
}

#[test]
fn oversized_candidates_are_skipped() {
    // Two scratch buffers of lws[1] * 16 bytes must fit in 1 KiB.
    let ctx = ctx_with_local_mem(1024);
    let problem = Problem::new([1, 64, 4, 4]);
    let out = run_device(&ctx, &problem, 1e-3).unwrap();
    assert_close(&out, &problem.expected(1e-3));

    let key = tuning_key(DataType::F32, Nchw { n: 1, c: 64, h: 4, w: 4 });
    let winner = ctx.tuner().lookup(&key).unwrap().params;
    assert!(winner[1] <= 32, "winner {winner:?} needs too much local memory");
}

#[test]
fn tuning_fails_when_no_candidate_launches() {
    let ctx = ctx_with_local_mem(16);
    let problem = Problem::new([1, 2, 2, 2]);
    let err = run_device(&ctx, &problem, 1e-3).unwrap_err();
    match err {
        EmberError::Tuning(TuningError::NoViableCandidate { key, last_failure, .. }) => {
            assert_eq!(key, "batch_norm_opencl_kernel_f32_1_2_2_2");
            assert!(last_failure.contains("CL_OUT_OF_RESOURCES"), "{last_failure}");
        }
        other => panic!("expected NoViableCandidate, got {other}"),
    }
}

#[test]
fn failing_stored_configuration_is_fatal() {
    let ctx = ctx_with_local_mem(64);
    let problem = Problem::new([1, 8, 4, 4]);
    let key = tuning_key(DataType::F32, Nchw { n: 1, c: 8, h: 4, w: 4 });
    ctx.tuner().record(&key, [1, 4, 64], std::time::Duration::from_micros(1));

    let err = run_device(&ctx, &problem, 1e-3).unwrap_err();
    assert!(matches!(
        err,
        EmberError::Kernel(KernelError::LaunchFailed { status: DeviceStatus::OUT_OF_RESOURCES, .. })
    ));
    assert_eq!(ctx.tuner().stats().tunes, 0);
}

#[test]
fn inadmissible_record_is_retuned() {
    let ctx = reference_ctx();
    let problem = Problem::new([1, 8, 4, 4]);
    let key = tuning_key(DataType::F32, Nchw { n: 1, c: 8, h: 4, w: 4 });
    ctx.tuner().record(&key, [1, 2048, 1], std::time::Duration::from_micros(1));

    let out = run_device(&ctx, &problem, 1e-3).unwrap();
    assert_close(&out, &problem.expected(1e-3));

    let stats = ctx.tuner().stats();
    assert_eq!(stats.stale, 1);
    assert_eq!(stats.tunes, 1);
    assert_ne!(ctx.tuner().lookup(&key).unwrap().params, [1, 2048, 1]);
}

#[test]
fn empty_batch_launches_nothing() {
    let ctx = reference_ctx();
    let problem = Problem::new([0, 3, 4, 4]);
    let out = run_device(&ctx, &problem, 1e-3).unwrap();
    assert!(out.is_empty());
    assert_eq!(ctx.tuner().stats().evaluations, 0);
}

#[test]
fn mismatched_channel_count_is_rejected() {
    let ctx = reference_ctx();
    let problem = Problem::new([1, 3, 2, 2]);
    let mut t = problem.tensors(&ctx, DeviceType::OpenCl);
    t[2] = Tensor::from_slice(ctx.allocator(DeviceType::OpenCl).unwrap(), &[2], &[0.0f32, 1.0])
        .unwrap();
    let mut out = Tensor::new(ctx.allocator(DeviceType::OpenCl).unwrap(), DataType::F32);
    let err = BatchNormOpenCl
        .run(ctx.runtime(), ctx.tuner(), inputs(&t), 1e-3, &mut out)
        .unwrap_err();
    assert!(matches!(err, EmberError::Kernel(KernelError::InvalidArguments { .. })));
}

#[test]
fn tuned_configurations_survive_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.tuning.cache_path = Some(dir.path().join("tuning.json"));
    let problem = Problem::new([1, 8, 4, 4]);

    let ctx = ExecutionContext::reference(config.clone()).unwrap();
    run_device(&ctx, &problem, 1e-3).unwrap();
    ctx.shutdown().unwrap();
    assert!(dir.path().join("tuning.json").exists());

    let ctx = ExecutionContext::reference(config).unwrap();
    run_device(&ctx, &problem, 1e-3).unwrap();
    let stats = ctx.tuner().stats();
    assert_eq!(stats.tunes, 0);
    assert_eq!(stats.hits, 1);
}

#[test]
fn never_policy_runs_default_local_size() {
    let mut config = EngineConfig::default();
    config.tuning.policy = TuningPolicy::Never;
    let ctx = ExecutionContext::reference(config).unwrap();
    let problem = Problem::new([1, 2, 3, 3]);

    let out = run_device(&ctx, &problem, 1e-3).unwrap();
    assert_close(&out, &problem.expected(1e-3));
    let stats = ctx.tuner().stats();
    assert_eq!((stats.tunes, stats.evaluations), (0, 1));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn device_and_cpu_agree(
        n in 1usize..3,
        c in 1usize..6,
        h in 1usize..6,
        w in 1usize..6,
        epsilon in 1e-5f32..1e-1,
    ) {
        let ctx = reference_ctx();
        let problem = Problem::new([n, c, h, w]);
        let device = run_device(&ctx, &problem, epsilon).unwrap();

        let t = problem.tensors(&ctx, DeviceType::Cpu);
        let mut out = Tensor::new(ctx.allocator(DeviceType::Cpu).unwrap(), DataType::F32);
        BatchNormCpu.run(inputs(&t), epsilon, &mut out).unwrap();
        prop_assert_eq!(device, out.to_vec::<f32>().unwrap());
    }
}
