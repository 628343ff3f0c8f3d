//! Device state of a wrapped model and transactional parameter migration.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};

use crate::binding::BoundInputs;
use crate::device::Device;
use crate::error::WrapperError;
use crate::module::{collect_tensors, Module, ModuleExt, ParamVisitorMut, TensorRole};
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No parameter and no call has established a device yet.
    Unbound,
    Bound(Device),
}

#[derive(Debug, Clone)]
pub struct DeviceTracker {
    state: DeviceState,
}

impl DeviceTracker {
    /// Scans the module's tensors. Tensors spread over more than one device are rejected.
    pub fn from_module<M: Module + ?Sized>(module: &M) -> Result<Self> {
        let devices = module.tensor_devices()?;
        let state = match devices.as_slice() {
            [] => DeviceState::Unbound,
            [device] => DeviceState::Bound(*device),
            _ => return Err(WrapperError::MultipleDevices { devices }.into()),
        };
        log::debug!("device tracker starts in {state:?}");
        Ok(DeviceTracker { state })
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn current(&self) -> Option<Device> {
        match self.state {
            DeviceState::Unbound => None,
            DeviceState::Bound(device) => Some(device),
        }
    }

    /// Device for a call: the bound device, else the first present input's, else the CPU.
    pub fn resolve_for_call(&mut self, inputs: &BoundInputs) -> Device {
        match self.state {
            DeviceState::Bound(device) => device,
            DeviceState::Unbound => {
                let device = inputs.first_device().unwrap_or_default();
                log::debug!("binding device {device} from call inputs");
                self.state = DeviceState::Bound(device);
                device
            }
        }
    }

    /// Moves to `target` and reports whether the device actually changed.
    pub fn transition(&mut self, target: Device) -> bool {
        let target = target.normalized();
        let changed = self.current() != Some(target);
        if changed {
            log::debug!("device transition {:?} -> {target}", self.state);
        }
        self.state = DeviceState::Bound(target);
        changed
    }
}

/// Moves every tensor of `module` to `device`. All transfers are staged before any is
/// committed, so a failure leaves the module untouched. A tensor reached under several names
/// is moved once and stays shared. Returns the number of distinct tensors moved.
pub fn migrate_parameters<M: Module + ?Sized>(module: &mut M, device: Device) -> Result<usize> {
    let mut staged: HashMap<String, Tensor> = HashMap::new();
    let mut copies: HashMap<u64, Tensor> = HashMap::new();
    let mut moved = 0;
    for entry in collect_tensors(module)? {
        if staged.contains_key(&entry.name) {
            bail!("duplicate parameter name '{}'", entry.name);
        }
        let target = match copies.get(&entry.tensor.id()) {
            Some(copy) => copy.clone(),
            None => {
                let copy = entry.tensor.moved_to(device)?;
                if copy.device() != entry.tensor.device() {
                    moved += 1;
                }
                copies.insert(entry.tensor.id(), copy.clone());
                copy
            }
        };
        staged.insert(entry.name, target);
    }

    let mut expected: HashSet<String> = staged.keys().cloned().collect();
    {
        let mut f = |name: &str, _: TensorRole, _: &mut Tensor| -> Result<()> {
            if !expected.remove(name) {
                bail!("parameter '{name}' is visited mutably but not immutably");
            }
            Ok(())
        };
        let mut visitor = ParamVisitorMut::new(&mut f);
        module.visit_params_mut(&mut visitor)?;
    }
    if let Some(name) = expected.into_iter().next() {
        bail!("parameter '{name}' is visited immutably but not mutably");
    }

    {
        let mut f = |name: &str, _: TensorRole, tensor: &mut Tensor| -> Result<()> {
            if let Some(target) = staged.remove(name) {
                *tensor = target;
            }
            Ok(())
        };
        let mut visitor = ParamVisitorMut::new(&mut f);
        module.visit_params_mut(&mut visitor)?;
    }
    Ok(moved)
}
