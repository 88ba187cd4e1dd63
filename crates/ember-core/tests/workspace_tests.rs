//! Workspace ownership tests: create / get / remove / enumerate / model loading.

use ember_common::{DataType, DeviceType};
use ember_core::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

fn host() -> Arc<HostAllocator> {
    Arc::new(HostAllocator::new())
}

fn names(ws: &Workspace) -> BTreeSet<String> {
    ws.tensors().into_iter().collect()
}

// ── create / get ────────────────────────────────────────────────────

#[test]
fn get_on_unknown_name_is_absent() {
    let ws = Workspace::new();
    assert!(ws.get_tensor("nope").is_none());
    assert!(!ws.has_tensor("nope"));
}

#[test]
fn create_then_get_returns_requested_dtype() {
    let mut ws = Workspace::new();
    ws.create_tensor("ids", host(), DataType::I32);
    let t = ws.get_tensor("ids").expect("tensor should exist");
    assert_eq!(t.dtype(), DataType::I32);
    assert!(!t.is_allocated());
}

#[test]
fn create_is_idempotent_and_keeps_data() {
    let alloc_a = host();
    let alloc_b = host();
    let mut ws = Workspace::new();

    let first = ws.create_tensor("x", alloc_a.clone(), DataType::F32);
    first.resize(&[3]).unwrap();
    first.copy_from_slice(&[1.0f32, 2.0, 3.0]).unwrap();
    let first_ptr: *const Tensor = first;

    let second = ws.create_tensor("x", alloc_b.clone(), DataType::I8);
    assert!(std::ptr::eq(first_ptr, &*second));
    assert_eq!(second.dtype(), DataType::F32);
    assert_eq!(second.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);

    assert_eq!(alloc_a.stats().allocations, 1);
    assert_eq!(alloc_b.stats().allocations, 0);
    assert_eq!(ws.len(), 1);
}

// ── remove ──────────────────────────────────────────────────────────

#[test]
fn remove_reports_presence_exactly_once() {
    let alloc = host();
    let mut ws = Workspace::new();
    assert!(!ws.remove_tensor("t"));

    ws.create_tensor("t", alloc.clone(), DataType::F32).resize(&[16]).unwrap();
    assert_eq!(alloc.stats().live_bytes, 64);

    assert!(ws.remove_tensor("t"));
    assert!(!ws.remove_tensor("t"));
    assert!(ws.get_tensor("t").is_none());
    assert_eq!(alloc.stats().frees, 1);
    assert_eq!(alloc.stats().live_bytes, 0);
}

#[test]
fn create_create_remove_scenario() {
    let alloc_a = host();
    let alloc_b = host();
    let mut ws = Workspace::new();
    assert!(ws.tensors().is_empty());

    let a: *const Tensor = ws.create_tensor("x", alloc_a, DataType::F32);
    assert_eq!(ws.tensors(), vec!["x".to_string()]);

    let b: *const Tensor = ws.create_tensor("x", alloc_b.clone(), DataType::F32);
    assert_eq!(a, b);
    assert_eq!(alloc_b.stats().allocations, 0);

    assert!(ws.remove_tensor("x"));
    assert!(ws.tensors().is_empty());
}

#[test]
fn dropping_workspace_releases_all_buffers() {
    let pool = Arc::new(PoolAllocator::new(1 << 20));
    {
        let mut ws = Workspace::new();
        for i in 0..4 {
            ws.create_tensor(&format!("t{i}"), pool.clone(), DataType::F32).resize(&[32]).unwrap();
        }
        assert_eq!(pool.stats().active_bytes, 4 * 128);
    }
    let stats = pool.stats();
    assert_eq!(stats.active_bytes, 0);
    assert_eq!(stats.pooled_bytes, 4 * 128);
}

// ── model loading ───────────────────────────────────────────────────

fn serializer() -> Serializer {
    Serializer::new(AllocatorRegistry::with_host())
}

#[test]
fn load_model_tensor_overwrites_existing_entries() {
    let mut ws = Workspace::new();
    ws.create_tensor("w", host(), DataType::I8).resize(&[7, 7]).unwrap();
    ws.create_tensor("keep", host(), DataType::F32);

    let net = NetDef {
        name: "tiny".into(),
        tensors: vec![TensorProto::from_f32("w", &[2], &[0.25, 0.75])],
        ops: vec![],
    };
    ws.load_model_tensor(&net, DeviceType::Cpu, &serializer()).unwrap();

    let w = ws.get_tensor("w").unwrap();
    assert_eq!(w.dtype(), DataType::F32);
    assert_eq!(w.shape(), &[2]);
    assert_eq!(w.to_vec::<f32>().unwrap(), vec![0.25, 0.75]);
    assert!(ws.has_tensor("keep"));
}

#[test]
fn failed_model_load_leaves_workspace_untouched() {
    let mut ws = Workspace::new();
    ws.create_tensor("a", host(), DataType::I8);

    let bad = TensorProto::from_f32("b", &[3], &[1.0]);
    let net = NetDef {
        name: "broken".into(),
        tensors: vec![TensorProto::from_f32("a", &[1], &[9.0]), bad],
        ops: vec![],
    };
    assert!(ws.load_model_tensor(&net, DeviceType::Cpu, &serializer()).is_err());
    assert_eq!(ws.get_tensor("a").unwrap().dtype(), DataType::I8);
    assert!(!ws.has_tensor("b"));
}

#[test]
fn workspace_from_model_file() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("models").join("bn.json");
    let net = NetDef {
        name: "bn".into(),
        tensors: vec![
            TensorProto::from_f32("scale", &[2], &[1.0, 2.0]),
            TensorProto {
                name: "steps".into(),
                data_type: Some(DataType::I64),
                dims: vec![1],
                int32_data: vec![12],
                ..TensorProto::default()
            },
        ],
        ops: vec![OperatorDef::new("BatchNorm", &["x", "scale"], "y")],
    };
    net.save(&path)?;

    let loaded = NetDef::load(&path)?;
    assert_eq!(loaded, net);
    let ws = Workspace::from_model(&loaded, DeviceType::Cpu, &serializer())?;
    assert_eq!(names(&ws), BTreeSet::from(["scale".to_string(), "steps".to_string()]));
    assert_eq!(ws.get_tensor("steps").unwrap().to_vec::<i64>()?, vec![12]);
    Ok(())
}

// ── enumeration property ────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Create(u8),
    Remove(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![(0u8..6).prop_map(Op::Create), (0u8..6).prop_map(Op::Remove)]
}

proptest! {
    #[test]
    fn tensors_matches_current_key_set(ops in proptest::collection::vec(op_strategy(), 0..40)) {
        let alloc: Arc<dyn Allocator> = host();
        let mut ws = Workspace::new();
        let mut model = BTreeSet::new();

        for op in ops {
            match op {
                Op::Create(i) => {
                    let name = format!("t{i}");
                    ws.create_tensor(&name, alloc.clone(), DataType::F32);
                    model.insert(name);
                }
                Op::Remove(i) => {
                    let name = format!("t{i}");
                    prop_assert_eq!(ws.remove_tensor(&name), model.remove(&name));
                }
            }
        }
        prop_assert_eq!(names(&ws), model);
    }
}
