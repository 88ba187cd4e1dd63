//! Conversion between [`TensorProto`] records and [`Tensor`]s.

use crate::allocator::AllocatorRegistry;
use crate::proto::TensorProto;
use crate::tensor::Tensor;
use ember_common::{DataType, DeviceType, EmberError, Result};
use tracing::trace;

/// Materialises model records as tensors on a target device.
#[derive(Debug, Clone)]
pub struct Serializer {
    allocators: AllocatorRegistry,
}

impl Serializer {
    pub fn new(allocators: AllocatorRegistry) -> Self {
        Self { allocators }
    }

    pub fn allocators(&self) -> &AllocatorRegistry {
        &self.allocators
    }

    /// Build a tensor from `proto` using the allocator registered for `device`.
    pub fn deserialize(&self, proto: &TensorProto, device: DeviceType) -> Result<Tensor> {
        let dtype = resolve_dtype(proto)?;
        let bytes = encode_payload(proto, dtype)?;
        let allocator = self.allocators.require(device)?;

        let mut tensor = Tensor::new(allocator, dtype);
        tensor.resize(&proto.dims)?;
        tensor.copy_from_bytes(&bytes)?;
        trace!(name = %proto.name, %dtype, dims = ?proto.dims, %device, "deserialized tensor");
        Ok(tensor)
    }

    /// Capture `tensor` as a record with a raw little-endian payload.
    pub fn serialize(&self, name: &str, tensor: &Tensor) -> Result<TensorProto> {
        Ok(TensorProto {
            name: name.to_owned(),
            data_type: Some(tensor.dtype()),
            dims: tensor.shape().to_vec(),
            raw_data: tensor.to_bytes()?,
            ..TensorProto::default()
        })
    }
}

fn resolve_dtype(proto: &TensorProto) -> Result<DataType> {
    match proto.data_type {
        Some(dtype) => Ok(dtype),
        None if !proto.float_data.is_empty() => Ok(DataType::F32),
        None if !proto.int32_data.is_empty() => Ok(DataType::I32),
        None => Err(EmberError::Serialization(format!(
            "tensor '{}' has no data type and no typed payload",
            proto.name
        ))),
    }
}

fn encode_payload(proto: &TensorProto, dtype: DataType) -> Result<Vec<u8>> {
    let (count, expected) = proto
        .element_count()
        .and_then(|n| Some((n, n.checked_mul(dtype.element_size())?)))
        .ok_or_else(|| {
            EmberError::Serialization(format!(
                "tensor '{}' dims {:?} overflow the addressable size",
                proto.name, proto.dims
            ))
        })?;
    let mismatch = |found: usize, unit: &str| {
        EmberError::Serialization(format!(
            "tensor '{}' expects {} elements ({:?}, {}), payload has {} {}",
            proto.name, count, proto.dims, dtype, found, unit
        ))
    };

    if !proto.raw_data.is_empty() {
        if proto.raw_data.len() != expected {
            return Err(mismatch(proto.raw_data.len(), "bytes"));
        }
        return Ok(proto.raw_data.clone());
    }

    let bytes = match dtype {
        DataType::F32 | DataType::F16 => {
            if proto.float_data.len() != count {
                return Err(mismatch(proto.float_data.len(), "float values"));
            }
            if dtype == DataType::F32 {
                proto.float_data.iter().flat_map(|v| v.to_le_bytes()).collect()
            } else {
                proto.float_data.iter().flat_map(|v| half::f16::from_f32(*v).to_le_bytes()).collect()
            }
        }
        DataType::I32 | DataType::I64 | DataType::U8 | DataType::I8 => {
            if proto.int32_data.len() != count {
                return Err(mismatch(proto.int32_data.len(), "int32 values"));
            }
            let ints = proto.int32_data.iter().copied();
            match dtype {
                DataType::I32 => ints.flat_map(i32::to_le_bytes).collect(),
                DataType::I64 => ints.flat_map(|v| i64::from(v).to_le_bytes()).collect(),
                DataType::U8 => ints.map(|v| v as u8).collect(),
                _ => ints.map(|v| v as i8 as u8).collect(),
            }
        }
    };
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serializer() -> Serializer {
        Serializer::new(AllocatorRegistry::with_host())
    }

    #[test]
    fn float_record_becomes_f32_tensor() {
        let proto = TensorProto::from_f32("w", &[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let t = serializer().deserialize(&proto, DeviceType::Cpu).unwrap();
        assert_eq!(t.dtype(), DataType::F32);
        assert_eq!(t.shape(), &[2, 2]);
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn half_record_converts_float_payload() {
        let proto = TensorProto {
            data_type: Some(DataType::F16),
            ..TensorProto::from_f32("h", &[2], &[0.5, -1.0])
        };
        let t = serializer().deserialize(&proto, DeviceType::Cpu).unwrap();
        let values: Vec<f32> = t.to_vec::<half::f16>().unwrap().iter().map(|v| v.to_f32()).collect();
        assert_eq!(values, vec![0.5, -1.0]);
    }

    #[test]
    fn raw_payload_length_is_validated() {
        let proto = TensorProto {
            name: "r".into(),
            data_type: Some(DataType::I32),
            dims: vec![3],
            raw_data: vec![0u8; 8],
            ..TensorProto::default()
        };
        let err = serializer().deserialize(&proto, DeviceType::Cpu).unwrap_err();
        assert!(err.to_string().contains("payload has 8 bytes"));
    }

    #[test]
    fn overflowing_dims_are_rejected() {
        let proto = TensorProto {
            name: "huge".into(),
            data_type: Some(DataType::F32),
            dims: vec![1 << 32, 1 << 32, 2],
            raw_data: vec![0u8; 4],
            ..TensorProto::default()
        };
        let err = serializer().deserialize(&proto, DeviceType::Cpu).unwrap_err();
        assert!(matches!(err, EmberError::Serialization(ref m) if m.contains("overflow")), "{err}");

        // Fits in elements but not in bytes.
        let proto = TensorProto { dims: vec![usize::MAX / 2], ..proto };
        assert!(matches!(
            serializer().deserialize(&proto, DeviceType::Cpu),
            Err(EmberError::Serialization(_))
        ));
    }

    #[test]
    fn unknown_device_is_an_error() {
        let proto = TensorProto::from_f32("w", &[1], &[1.0]);
        assert!(serializer().deserialize(&proto, DeviceType::OpenCl).is_err());
    }

    #[test]
    fn serialize_round_trip() {
        let s = serializer();
        let proto = TensorProto {
            name: "ids".into(),
            data_type: Some(DataType::U8),
            dims: vec![3],
            int32_data: vec![1, 200, 7],
            ..TensorProto::default()
        };
        let t = s.deserialize(&proto, DeviceType::Cpu).unwrap();
        let back = s.serialize("ids", &t).unwrap();
        assert_eq!(back.raw_data, vec![1, 200, 7]);
        assert_eq!(s.deserialize(&back, DeviceType::Cpu).unwrap().to_vec::<u8>().unwrap(), vec![1, 200, 7]);
    }
}
