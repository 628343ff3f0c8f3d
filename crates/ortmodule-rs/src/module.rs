use anyhow::{ensure, Result};

use crate::binding::{BoundInputs, CallArgs, Signature};
use crate::device::{Device, DeviceTarget};
use crate::device_tracker;
use crate::tensor::Tensor;

pub type VisitParamsFn<'a> = dyn FnMut(&str, TensorRole, &Tensor) -> Result<()> + 'a;
pub type VisitParamsMutFn<'a> = dyn FnMut(&str, TensorRole, &mut Tensor) -> Result<()> + 'a;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TensorRole {
    Parameter,
    /// Model state that is never trained, e.g. running statistics.
    Buffer,
}

#[derive(Default)]
struct ParamPath {
    segments: Vec<String>,
    scratch: String,
}

fn check_segment(kind: &str, segment: &str) -> Result<()> {
    ensure!(!segment.is_empty(), "parameter {kind} must be non-empty");
    ensure!(
        !segment.contains('.'),
        "parameter {kind} must not contain '.', got '{segment}'"
    );
    ensure!(
        segment.is_ascii(),
        "parameter {kind} must be ASCII, got '{segment}'"
    );
    Ok(())
}

impl ParamPath {
    fn push(&mut self, segment: &str) -> Result<()> {
        check_segment("path segments", segment)?;
        self.segments.push(segment.to_string());
        Ok(())
    }

    fn pop(&mut self) {
        let _ = self.segments.pop();
    }

    /// Dotted name of `leaf` under the current scope.
    fn qualify(&mut self, leaf: &str) -> Result<&str> {
        check_segment("leaf names", leaf)?;
        self.scratch.clear();
        for segment in &self.segments {
            self.scratch.push_str(segment);
            self.scratch.push('.');
        }
        self.scratch.push_str(leaf);
        Ok(&self.scratch)
    }
}

/// Read-only walk over a module's tensors, yielding dotted names such as `fc1.weight`.
pub struct ParamVisitor<'a> {
    path: ParamPath,
    f: &'a mut VisitParamsFn<'a>,
}

impl<'a> ParamVisitor<'a> {
    pub fn new(f: &'a mut VisitParamsFn<'a>) -> Self {
        Self {
            path: ParamPath::default(),
            f,
        }
    }

    pub fn scoped(
        &mut self,
        segment: &str,
        inner: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.path.push(segment)?;
        let out = inner(self);
        self.path.pop();
        out
    }

    pub fn param(&mut self, leaf: &str, role: TensorRole, tensor: &Tensor) -> Result<()> {
        let name = self.path.qualify(leaf)?;
        (self.f)(name, role, tensor)
    }
}

pub struct ParamVisitorMut<'a> {
    path: ParamPath,
    f: &'a mut VisitParamsMutFn<'a>,
}

impl<'a> ParamVisitorMut<'a> {
    pub fn new(f: &'a mut VisitParamsMutFn<'a>) -> Self {
        Self {
            path: ParamPath::default(),
            f,
        }
    }

    pub fn scoped(
        &mut self,
        segment: &str,
        inner: impl FnOnce(&mut Self) -> Result<()>,
    ) -> Result<()> {
        self.path.push(segment)?;
        let out = inner(self);
        self.path.pop();
        out
    }

    pub fn param(&mut self, leaf: &str, role: TensorRole, tensor: &mut Tensor) -> Result<()> {
        let name = self.path.qualify(leaf)?;
        (self.f)(name, role, tensor)
    }
}

/// A model that the wrapper can bind arguments for, trace, and move between devices.
pub trait Module {
    /// Declared inputs of [`Module::forward`], in order.
    fn signature(&self) -> Signature;

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor>;

    /// Modules without tensors can rely on the default.
    fn visit_params(&self, _v: &mut ParamVisitor<'_>) -> Result<()> {
        Ok(())
    }

    fn visit_params_mut(&mut self, _v: &mut ParamVisitorMut<'_>) -> Result<()> {
        Ok(())
    }
}

/// Tensor reached through [`Module::visit_params`].
#[derive(Debug, Clone)]
pub struct NamedTensor {
    pub name: String,
    pub role: TensorRole,
    pub tensor: Tensor,
}

impl NamedTensor {
    /// Parameters that currently receive gradients.
    pub fn is_trainable(&self) -> bool {
        self.role == TensorRole::Parameter && self.tensor.requires_grad_flag()
    }
}

/// Every parameter and buffer of `module`, in visit order.
pub fn collect_tensors<M: Module + ?Sized>(module: &M) -> Result<Vec<NamedTensor>> {
    let mut collected = Vec::new();
    {
        let mut f = |name: &str, role: TensorRole, tensor: &Tensor| -> Result<()> {
            collected.push(NamedTensor {
                name: name.to_string(),
                role,
                tensor: tensor.clone(),
            });
            Ok(())
        };
        let mut visitor = ParamVisitor::new(&mut f);
        module.visit_params(&mut visitor)?;
    }
    Ok(collected)
}

/// Conveniences available on every [`Module`].
pub trait ModuleExt: Module {
    /// Binds `args` against the signature and runs `forward` eagerly.
    fn call(&self, args: CallArgs) -> Result<Tensor> {
        let inputs = self.signature().bind(args)?;
        self.forward(&inputs)
    }

    fn named_parameters(&self) -> Result<Vec<(String, Tensor)>> {
        Ok(collect_tensors(self)?
            .into_iter()
            .filter(|entry| entry.role == TensorRole::Parameter)
            .map(|entry| (entry.name, entry.tensor))
            .collect())
    }

    /// Distinct devices holding the module's tensors, sorted.
    fn tensor_devices(&self) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = collect_tensors(self)?
            .iter()
            .map(|entry| entry.tensor.device())
            .collect();
        devices.sort();
        devices.dedup();
        Ok(devices)
    }

    /// Moves every parameter and buffer to `target`. Nothing moves if any transfer fails.
    fn to<T: DeviceTarget>(mut self, target: T) -> Result<Self>
    where
        Self: Sized,
    {
        let device = target.target_device()?;
        device_tracker::migrate_parameters(&mut self, device)?;
        Ok(self)
    }

    fn cpu(self) -> Result<Self>
    where
        Self: Sized,
    {
        self.to(Device::cpu())
    }

    fn cuda(self) -> Result<Self>
    where
        Self: Sized,
    {
        self.to(Device::cuda_current())
    }

    fn cuda_at(self, index: usize) -> Result<Self>
    where
        Self: Sized,
    {
        self.to(Device::cuda(index))
    }

    /// Stops gradient tracking on every parameter.
    fn freeze(mut self) -> Result<Self>
    where
        Self: Sized,
    {
        {
            let mut f = |_: &str, role: TensorRole, tensor: &mut Tensor| -> Result<()> {
                if role == TensorRole::Parameter {
                    *tensor = tensor.with_requires_grad(false);
                }
                Ok(())
            };
            let mut visitor = ParamVisitorMut::new(&mut f);
            self.visit_params_mut(&mut visitor)?;
        }
        Ok(self)
    }
}

impl<M: Module + ?Sized> ModuleExt for M {}
