//! Mapping from Rust scalar types to tensor element types.

use ember_common::DataType;

/// A plain-old-data scalar that can be stored in a tensor.
pub trait Element: bytemuck::Pod + Send + Sync + 'static {
    const DTYPE: DataType;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;
}

impl Element for half::f16 {
    const DTYPE: DataType = DataType::F16;
}

impl Element for i32 {
    const DTYPE: DataType = DataType::I32;
}

impl Element for i64 {
    const DTYPE: DataType = DataType::I64;
}

impl Element for u8 {
    const DTYPE: DataType = DataType::U8;
}

impl Element for i8 {
    const DTYPE: DataType = DataType::I8;
}

/// Read element `index` of a little-endian buffer of `dtype` as `f32`.
///
/// Works on unaligned byte slices, which is what host buffers hand out.
#[inline]
pub fn load_f32(bytes: &[u8], dtype: DataType, index: usize) -> f32 {
    let size = dtype.element_size();
    let at = index * size;
    let b = &bytes[at..at + size];
    match dtype {
        DataType::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        DataType::F16 => half::f16::from_le_bytes([b[0], b[1]]).to_f32(),
        DataType::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32,
        DataType::I64 => {
            i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32
        }
        DataType::U8 => f32::from(b[0]),
        DataType::I8 => f32::from(b[0] as i8),
    }
}

/// Store `value` as element `index` of a little-endian buffer of `dtype`.
#[inline]
pub fn store_f32(bytes: &mut [u8], dtype: DataType, index: usize, value: f32) {
    let size = dtype.element_size();
    let at = index * size;
    let out = &mut bytes[at..at + size];
    match dtype {
        DataType::F32 => out.copy_from_slice(&value.to_le_bytes()),
        DataType::F16 => out.copy_from_slice(&half::f16::from_f32(value).to_le_bytes()),
        DataType::I32 => out.copy_from_slice(&(value as i32).to_le_bytes()),
        DataType::I64 => out.copy_from_slice(&(value as i64).to_le_bytes()),
        DataType::U8 => out[0] = value as u8,
        DataType::I8 => out[0] = (value as i8) as u8,
    }
}
