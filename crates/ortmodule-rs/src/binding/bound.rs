use anyhow::{anyhow, Result};

use crate::device::Device;
use crate::ops::functional;
use crate::tensor::Tensor;

/// One bound input. Variadic values carry a flattened `name` and the declaring `param`.
#[derive(Debug, Clone)]
pub struct BoundInput {
    pub name: String,
    pub param: String,
    pub tensor: Option<Tensor>,
}

/// Call arguments resolved against a [`super::Signature`], in declared order.
#[derive(Debug, Clone, Default)]
pub struct BoundInputs {
    entries: Vec<BoundInput>,
}

impl BoundInputs {
    pub(crate) fn from_entries(entries: Vec<BoundInput>) -> Self {
        BoundInputs { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoundInput> + '_ {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tensor bound to `name`, or `None` when absent or passed as `None`.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .and_then(|entry| entry.tensor.as_ref())
    }

    pub fn tensor(&self, name: &str) -> Result<&Tensor> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| anyhow!("no input named '{name}'"))?;
        entry
            .tensor
            .as_ref()
            .ok_or_else(|| anyhow!("input '{name}' is None"))
    }

    /// Present values collected by the variadic input `param`.
    pub fn variadic(&self, param: &str) -> Vec<&Tensor> {
        self.entries
            .iter()
            .filter(|entry| entry.param == param && entry.name != entry.param)
            .filter_map(|entry| entry.tensor.as_ref())
            .collect()
    }

    pub fn present(&self) -> impl Iterator<Item = (&str, &Tensor)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| Some((entry.name.as_str(), entry.tensor.as_ref()?)))
    }

    pub fn present_names(&self) -> Vec<String> {
        self.present().map(|(name, _)| name.to_string()).collect()
    }

    /// Names of the present inputs whose tensors require grad, in declared order.
    pub fn names_requiring_grad(&self) -> Vec<String> {
        self.present()
            .filter(|(_, tensor)| tensor.requires_grad_flag())
            .map(|(name, _)| name.to_string())
            .collect()
    }

    pub fn first_device(&self) -> Option<Device> {
        self.present().map(|(_, tensor)| tensor.device()).next()
    }

    /// Differentiable copy of every present input onto `device`.
    ///
    /// Each copy is a distinct tensor, so the same caller tensor passed twice binds as two
    /// independent inputs.
    pub fn to_device(&self, device: Device) -> Result<BoundInputs> {
        let entries = self
            .entries
            .iter()
            .map(|entry| {
                let tensor = entry
                    .tensor
                    .as_ref()
                    .map(|tensor| functional::to_device(tensor, device))
                    .transpose()?;
                Ok(BoundInput {
                    name: entry.name.clone(),
                    param: entry.param.clone(),
                    tensor,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(BoundInputs { entries })
    }
}
