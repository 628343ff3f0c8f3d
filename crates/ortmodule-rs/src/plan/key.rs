use crate::binding::BoundInputs;
use crate::device::Device;
use crate::module::NamedTensor;

/// Cache key for an exported plan.
///
/// Covers everything that changes the traced program: the device, which inputs are present,
/// which of them require grad, and which parameters are trainable. Input values and shapes
/// are deliberately left out.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PlanKey {
    pub device: Device,
    pub input_schema_hash: u64,
    pub input_grad_hash: u64,
    pub param_grad_hash: u64,
    pub hash: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RebuildReason {
    FirstCall,
    /// `to(...)` moved the model since the last export.
    DeviceTransfer,
    DeviceChange,
    InputSchemaChange,
    InputRequiresGradChange,
    ParamRequiresGradChange,
}

fn digest<'a>(tag: &[u8], names: impl IntoIterator<Item = &'a str>) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(tag);
    for name in names {
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize()
}

fn prefix_u64(hash: &blake3::Hash) -> u64 {
    let raw: [u8; 8] = hash.as_bytes()[0..8]
        .try_into()
        .expect("blake3 hash prefix length mismatch");
    u64::from_le_bytes(raw)
}

impl PlanKey {
    pub fn new(device: Device, inputs: &BoundInputs, params: &[NamedTensor]) -> Self {
        let schema = digest(
            b"ortmodule:inputs:v1",
            inputs.present().map(|(name, _)| name),
        );
        let input_grads = inputs.names_requiring_grad();
        let input_grad = digest(
            b"ortmodule:input-grad:v1",
            input_grads.iter().map(String::as_str),
        );
        let param_grad = digest(
            b"ortmodule:param-grad:v1",
            params
                .iter()
                .filter(|param| param.is_trainable())
                .map(|param| param.name.as_str()),
        );

        let device_text = device.to_string();
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"ortmodule:plan-key:v1");
        hasher.update(device_text.as_bytes());
        hasher.update(schema.as_bytes());
        hasher.update(input_grad.as_bytes());
        hasher.update(param_grad.as_bytes());
        let combined = hasher.finalize();
        let raw: [u8; 16] = combined.as_bytes()[0..16]
            .try_into()
            .expect("blake3 hash prefix length mismatch");

        PlanKey {
            device,
            input_schema_hash: prefix_u64(&schema),
            input_grad_hash: prefix_u64(&input_grad),
            param_grad_hash: prefix_u64(&param_grad),
            hash: u128::from_le_bytes(raw),
        }
    }

    /// Why a plan exported under `previous` cannot serve this key, or `None` when it can.
    pub fn classify_change_from(
        &self,
        previous: Option<&PlanKey>,
        device_changed: bool,
    ) -> Option<RebuildReason> {
        let Some(previous) = previous else {
            return Some(RebuildReason::FirstCall);
        };
        if self.device != previous.device {
            return Some(RebuildReason::DeviceChange);
        }
        if device_changed {
            return Some(RebuildReason::DeviceTransfer);
        }
        if self.input_schema_hash != previous.input_schema_hash {
            return Some(RebuildReason::InputSchemaChange);
        }
        if self.input_grad_hash != previous.input_grad_hash {
            return Some(RebuildReason::InputRequiresGradChange);
        }
        if self.param_grad_hash != previous.param_grad_hash {
            return Some(RebuildReason::ParamRequiresGradChange);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{CallArgs, Signature};
    use crate::module::TensorRole;
    use crate::tensor::{Shape, Tensor};
    use anyhow::Result;

    fn bind(x: Option<&Tensor>, y: Option<&Tensor>) -> Result<BoundInputs> {
        let mut args = CallArgs::new();
        if let Some(x) = x {
            args = args.kwarg("x", x);
        }
        if let Some(y) = y {
            args = args.kwarg("y", y);
        }
        Signature::new().optional("x").optional("y").bind(args)
    }

    fn param(name: &str, trainable: bool) -> NamedTensor {
        NamedTensor {
            name: name.to_string(),
            role: TensorRole::Parameter,
            tensor: Tensor::ones(Shape::new([1])).requires_grad(trainable),
        }
    }

    #[test]
    fn value_changes_keep_the_key() -> Result<()> {
        let a = Tensor::ones(Shape::new([2]));
        let b = Tensor::zeros(Shape::new([5]));
        let first = PlanKey::new(Device::cpu(), &bind(Some(&a), None)?, &[]);
        let second = PlanKey::new(Device::cpu(), &bind(Some(&b), None)?, &[]);
        assert_eq!(first, second);
        assert_eq!(second.classify_change_from(Some(&first), false), None);
        Ok(())
    }

    #[test]
    fn classifies_each_kind_of_change() -> Result<()> {
        let plain = Tensor::ones(Shape::new([2]));
        let grad = Tensor::ones(Shape::new([2])).requires_grad(true);
        let params = [param("w", true)];
        let base = PlanKey::new(Device::cpu(), &bind(Some(&plain), None)?, &params);

        assert_eq!(
            base.classify_change_from(None, false),
            Some(RebuildReason::FirstCall)
        );
        assert_eq!(
            base.classify_change_from(Some(&base), true),
            Some(RebuildReason::DeviceTransfer)
        );

        let moved = PlanKey::new(Device::cuda(0), &bind(Some(&plain), None)?, &params);
        assert_eq!(
            moved.classify_change_from(Some(&base), false),
            Some(RebuildReason::DeviceChange)
        );

        let schema = PlanKey::new(Device::cpu(), &bind(Some(&plain), Some(&plain))?, &params);
        assert_eq!(
            schema.classify_change_from(Some(&base), false),
            Some(RebuildReason::InputSchemaChange)
        );

        let input_grad = PlanKey::new(Device::cpu(), &bind(Some(&grad), None)?, &params);
        assert_eq!(
            input_grad.classify_change_from(Some(&base), false),
            Some(RebuildReason::InputRequiresGradChange)
        );

        let frozen = PlanKey::new(
            Device::cpu(),
            &bind(Some(&plain), None)?,
            &[param("w", false)],
        );
        assert_eq!(
            frozen.classify_change_from(Some(&base), false),
            Some(RebuildReason::ParamRequiresGradChange)
        );
        Ok(())
    }
}
