//! Named tensor registry for one execution context.

use crate::allocator::Allocator;
use crate::proto::NetDef;
use crate::serializer::Serializer;
use crate::tensor::Tensor;
use ember_common::{DataType, DeviceType, EmberError, Result, TensorError};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tracing::{debug, info};

/// Sole owner of every tensor of one execution context, indexed by name.
///
/// Callers receive borrows; a tensor lives exactly as long as its entry.
#[derive(Debug, Default)]
pub struct Workspace {
    tensors: HashMap<String, Tensor>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workspace populated with every tensor record of `net`.
    pub fn from_model(net: &NetDef, device: DeviceType, serializer: &Serializer) -> Result<Self> {
        let mut ws = Self::new();
        ws.load_model_tensor(net, device, serializer)?;
        Ok(ws)
    }

    /// Snapshot of the registered names, in no particular order.
    pub fn tensors(&self) -> Vec<String> {
        self.tensors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn has_tensor(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Register an empty tensor under `name`, or return the existing one.
    ///
    /// An existing entry is never replaced or reset, and `allocator` is left
    /// untouched in that case.
    pub fn create_tensor(
        &mut self,
        name: &str,
        allocator: Arc<dyn Allocator>,
        dtype: DataType,
    ) -> &mut Tensor {
        match self.tensors.entry(name.to_owned()) {
            Entry::Occupied(entry) => {
                debug!("Tensor {} already exists. Skipping.", name);
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                debug!("Creating tensor {} ({}, {})", name, dtype, allocator.device_type());
                entry.insert(Tensor::new(allocator, dtype))
            }
        }
    }

    pub fn get_tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn get_tensor_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.tensors.get_mut(name)
    }

    /// Drop the tensor registered under `name`, releasing its buffer.
    /// Returns `false` if no such tensor exists.
    pub fn remove_tensor(&mut self, name: &str) -> bool {
        match self.tensors.remove(name) {
            Some(tensor) => {
                debug!("Removing tensor {}", name);
                drop(tensor);
                true
            }
            None => false,
        }
    }

    /// Deserialize every tensor record of `net` for `device`, replacing any
    /// entry with the same name.
    ///
    /// All records are decoded before the first entry is replaced, so a
    /// failing record leaves the workspace unchanged.
    pub fn load_model_tensor(
        &mut self,
        net: &NetDef,
        device: DeviceType,
        serializer: &Serializer,
    ) -> Result<()> {
        let decoded = net
            .tensors
            .iter()
            .map(|proto| -> Result<(String, Tensor)> {
                Ok((proto.name.clone(), serializer.deserialize(proto, device)?))
            })
            .collect::<Result<Vec<_>>>()?;

        let count = decoded.len();
        for (name, tensor) in decoded {
            debug!("Loading model tensor {} {:?}", name, tensor.shape());
            self.tensors.insert(name, tensor);
        }
        info!("Loaded {} model tensors for {} onto {}", count, net.name, device);
        Ok(())
    }

    /// Resolve `inputs` as shared borrows and `output` as an exclusive
    /// borrow in one pass.
    ///
    /// The output must not also appear among the inputs.
    pub fn operands(
        &mut self,
        inputs: &[&str],
        output: &str,
    ) -> Result<(Vec<&Tensor>, &mut Tensor)> {
        if inputs.contains(&output) {
            return Err(TensorError::AliasedOperands { name: output.to_owned() }.into());
        }
        let mut out = None;
        let mut found: HashMap<&str, &Tensor> = HashMap::with_capacity(inputs.len());
        for (name, tensor) in self.tensors.iter_mut() {
            if name == output {
                out = Some(tensor);
            } else if inputs.contains(&name.as_str()) {
                let tensor: &Tensor = tensor;
                found.insert(name.as_str(), tensor);
            }
        }

        let out = out.ok_or_else(|| TensorError::NotFound { name: output.to_owned() })?;
        let resolved = inputs
            .iter()
            .map(|name| {
                found.get(name).copied().ok_or_else(|| {
                    EmberError::from(TensorError::NotFound { name: (*name).to_owned() })
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((resolved, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::HostAllocator;

    #[test]
    fn operands_resolve_in_requested_order() {
        let alloc: Arc<dyn Allocator> = Arc::new(HostAllocator::new());
        let mut ws = Workspace::new();
        for name in ["a", "b", "out"] {
            ws.create_tensor(name, alloc.clone(), DataType::F32).resize(&[1]).unwrap();
        }
        let (inputs, out) = ws.operands(&["b", "a", "b"], "out").unwrap();
        assert_eq!(inputs.len(), 3);
        assert!(std::ptr::eq(inputs[0], inputs[2]));
        out.copy_from_slice(&[4.0f32]).unwrap();
        assert_eq!(ws.get_tensor("out").unwrap().to_vec::<f32>().unwrap(), vec![4.0]);
    }

    #[test]
    fn operands_reject_aliasing_and_missing_names() {
        let alloc: Arc<dyn Allocator> = Arc::new(HostAllocator::new());
        let mut ws = Workspace::new();
        ws.create_tensor("x", alloc, DataType::F32);
        assert!(ws.operands(&["x"], "x").is_err());
        assert!(ws.operands(&["missing"], "x").is_err());
        assert!(ws.operands(&["x"], "missing").is_err());
    }
}
