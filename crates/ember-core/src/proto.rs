//! Serialized model records.

use ember_common::{DataType, EmberError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One named tensor of a serialized model.
///
/// Element data is taken from `raw_data` (little-endian bytes) when present,
/// otherwise from the typed field matching `data_type`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TensorProto {
    pub name: String,
    pub data_type: Option<DataType>,
    pub dims: Vec<usize>,
    pub raw_data: Vec<u8>,
    pub float_data: Vec<f32>,
    pub int32_data: Vec<i32>,
}

impl TensorProto {
    /// Product of `dims`, or `None` if it overflows.
    pub fn element_count(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Record with little-endian `f32` payload.
    pub fn from_f32(name: impl Into<String>, dims: &[usize], data: &[f32]) -> Self {
        Self {
            name: name.into(),
            data_type: Some(DataType::F32),
            dims: dims.to_vec(),
            float_data: data.to_vec(),
            ..Self::default()
        }
    }
}

/// One operator invocation of a model graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorDef {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub output: String,
    pub args: BTreeMap<String, f32>,
}

impl OperatorDef {
    pub fn new(op_type: impl Into<String>, inputs: &[&str], output: impl Into<String>) -> Self {
        let op_type = op_type.into();
        Self {
            name: op_type.to_lowercase(),
            op_type,
            inputs: inputs.iter().map(|s| (*s).to_owned()).collect(),
            output: output.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: f32) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    pub fn arg(&self, key: &str) -> Option<f32> {
        self.args.get(key).copied()
    }
}

/// A serialized model: its weight tensors and its operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetDef {
    pub name: String,
    pub tensors: Vec<TensorProto>,
    pub ops: Vec<OperatorDef>,
}

impl NetDef {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| EmberError::Serialization(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| EmberError::Serialization(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
