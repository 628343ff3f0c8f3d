//! The module wrapper: binds call arguments, tracks the model's device, exports the forward
//! pass into an execution plan, and redirects every call to an [`ExecutionBackend`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Result};

use crate::backend::{ExecutionBackend, ReferenceBackend};
use crate::binding::{CallArgs, Signature};
use crate::device::{Device, DeviceTarget};
use crate::device_tracker::{self, DeviceTracker};
use crate::module::{collect_tensors, Module, ModuleExt};
use crate::plan::{ExecutionPlan, GradientGraphBuilder, PlanHandle, PlanKey};
use crate::tensor::Tensor;

#[derive(Debug, Clone)]
pub struct OrtModuleOptions {
    /// Directory that receives every exported program as JSON.
    pub save_plan_dir: Option<PathBuf>,
}

impl OrtModuleOptions {
    pub fn from_env() -> Self {
        OrtModuleOptions {
            save_plan_dir: crate::env::save_plans_dir(),
        }
    }
}

impl Default for OrtModuleOptions {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Wraps a [`Module`] so that its forward pass runs as an exported plan.
///
/// The plan is exported lazily on the first call and re-exported only when the device, the
/// set of present inputs, the set of inputs requiring grad, or the set of trainable parameters
/// changes. All parameters of the wrapped model must live on one device.
pub struct OrtModule<M: Module, B: ExecutionBackend = ReferenceBackend> {
    module: M,
    backend: Arc<B>,
    signature: Signature,
    tracker: DeviceTracker,
    device_changed: bool,
    input_names_require_grad: Vec<String>,
    builder: GradientGraphBuilder,
    plan: Option<ExecutionPlan>,
}

impl<M: Module> OrtModule<M, ReferenceBackend> {
    pub fn new(module: M) -> Result<Self> {
        Self::with_backend(module, Arc::new(ReferenceBackend::new()))
    }
}

impl<M: Module, B: ExecutionBackend> OrtModule<M, B> {
    pub fn with_backend(module: M, backend: Arc<B>) -> Result<Self> {
        Self::with_options(module, backend, OrtModuleOptions::default())
    }

    pub fn with_options(module: M, backend: Arc<B>, options: OrtModuleOptions) -> Result<Self> {
        let signature = module.signature();
        signature.validate()?;
        let tracker = DeviceTracker::from_module(&module)?;
        log::debug!(
            "wrapping module for backend '{}' ({} declared inputs)",
            backend.backend_name(),
            signature.params().len()
        );
        Ok(OrtModule {
            module,
            backend,
            signature,
            tracker,
            device_changed: false,
            input_names_require_grad: Vec::new(),
            builder: GradientGraphBuilder::new(options.save_plan_dir),
            plan: None,
        })
    }

    /// Runs the wrapped model on `args`.
    ///
    /// Inputs are copied onto the model's device with a differentiable transfer, so calling
    /// `backward()` on the result populates gradients on the caller's own tensors.
    pub fn forward(&mut self, args: CallArgs) -> Result<Tensor> {
        let bound = self.signature.bind(args)?;
        let device = self.tracker.resolve_for_call(&bound);
        // The caller's flags, not the transferred copies', which lose them under `no_grad`.
        let requires_grad = bound.names_requiring_grad();
        let params = collect_tensors(&self.module)?;
        let key = PlanKey::new(device, &bound, &params);
        let inputs = bound.to_device(device)?;

        let previous = self.plan.as_ref().map(|plan| plan.key());
        if let Some(reason) = key.classify_change_from(previous, self.device_changed) {
            let plan = self
                .builder
                .export(&self.module, &inputs, &requires_grad, &params, key)?;
            log::debug!("rebuilt {} on {device} ({reason:?})", plan.handle());
            self.plan = Some(plan);
            self.device_changed = false;
        }
        self.input_names_require_grad = requires_grad;

        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| anyhow!("no execution plan after export"))?;
        let entry = plan.entry_inputs(&inputs, &params)?;
        let mut outputs = self.backend.run_program(plan.program(), &entry)?;
        ensure!(
            outputs.len() == 1,
            "expected a single output from {}, got {}",
            plan.handle(),
            outputs.len()
        );
        Ok(outputs.remove(0))
    }

    /// Moves every parameter to `target`, which may be a [`Device`], a device string such as
    /// `"cuda:0"`, or a donor tensor. On failure nothing moves and the wrapper is unchanged.
    pub fn to<T: DeviceTarget>(&mut self, target: T) -> Result<&mut Self> {
        let device = target.target_device()?;
        let moved = device_tracker::migrate_parameters(&mut self.module, device)?;
        self.device_changed = self.tracker.transition(device);
        log::debug!(
            "to({device}): {moved} tensors moved, device_changed={}",
            self.device_changed
        );
        Ok(self)
    }

    pub fn cpu(&mut self) -> Result<&mut Self> {
        self.to(Device::cpu())
    }

    pub fn cuda(&mut self) -> Result<&mut Self> {
        self.to(Device::cuda_current())
    }

    pub fn cuda_at(&mut self, index: usize) -> Result<&mut Self> {
        self.to(Device::cuda(index))
    }

    pub fn named_parameters(&self) -> Result<Vec<(String, Tensor)>> {
        self.module.named_parameters()
    }

    /// Whether the last `to(...)` call changed the device.
    pub fn device_changed(&self) -> bool {
        self.device_changed
    }

    pub fn current_device(&self) -> Option<Device> {
        self.tracker.current()
    }

    /// Input names whose tensors required grad on the last call, in declared order.
    pub fn input_names_require_grad(&self) -> &[String] {
        &self.input_names_require_grad
    }

    pub fn plan_handle(&self) -> Option<PlanHandle> {
        self.plan.as_ref().map(ExecutionPlan::handle)
    }

    pub fn plan(&self) -> Option<&ExecutionPlan> {
        self.plan.as_ref()
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    pub fn into_inner(self) -> M {
        self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BoundInputs;
    use crate::error::WrapperError;
    use crate::module::{ParamVisitor, ParamVisitorMut, TensorRole};
    use crate::nn::{Linear, Relu};
    use crate::ops::functional;
    use crate::tensor::Shape;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Mlp {
        fc1: Linear,
        relu: Relu,
        fc2: Linear,
    }

    impl Mlp {
        fn new(seed: u64) -> Result<Self> {
            let mut rng = StdRng::seed_from_u64(seed);
            Ok(Mlp {
                fc1: Linear::init(4, 3, &mut rng)?,
                relu: Relu,
                fc2: Linear::init(3, 2, &mut rng)?,
            })
        }
    }

    impl Module for Mlp {
        fn signature(&self) -> Signature {
            Signature::new().positional("input1")
        }

        fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
            let hidden = self.fc1.forward(inputs.tensor("input1")?)?;
            let hidden = self.relu.forward(&hidden)?;
            self.fc2.forward(&hidden)
        }

        fn visit_params(&self, v: &mut ParamVisitor<'_>) -> Result<()> {
            v.scoped("fc1", |v| self.fc1.visit_params(v))?;
            v.scoped("fc2", |v| self.fc2.visit_params(v))
        }

        fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_>) -> Result<()> {
            v.scoped("fc1", |v| self.fc1.visit_params_mut(v))?;
            v.scoped("fc2", |v| self.fc2.visit_params_mut(v))
        }
    }

    fn input(requires_grad: bool) -> Tensor {
        let mut rng = StdRng::seed_from_u64(5);
        Tensor::randn(Shape::new([3, 4]), 1.0, &mut rng).requires_grad(requires_grad)
    }

    #[test]
    fn forward_matches_the_eager_module() -> Result<()> {
        let x = input(false);
        let expected = Mlp::new(1)?.call(CallArgs::from(&x))?;
        let mut wrapped = OrtModule::new(Mlp::new(1)?)?;
        let actual = wrapped.forward(CallArgs::from(&x))?;
        assert_eq!(actual.shape(), expected.shape());
        assert_eq!(actual.data(), expected.data());
        Ok(())
    }

    #[test]
    fn plan_is_reused_until_grad_requirements_change() -> Result<()> {
        let mut wrapped = OrtModule::new(Mlp::new(2)?)?;
        wrapped.forward(CallArgs::from(input(false)))?;
        let first = wrapped.plan_handle();
        wrapped.forward(CallArgs::from(input(false)))?;
        assert_eq!(wrapped.plan_handle(), first);

        wrapped.forward(CallArgs::from(input(true)))?;
        let second = wrapped.plan_handle();
        assert_ne!(second, first);
        assert_eq!(wrapped.input_names_require_grad(), ["input1"]);

        wrapped.forward(CallArgs::from(input(true)))?;
        assert_eq!(wrapped.plan_handle(), second);
        Ok(())
    }

    #[test]
    fn no_grad_calls_keep_the_callers_grad_requirements() -> Result<()> {
        let mut wrapped = OrtModule::new(Mlp::new(7)?)?;
        let x = input(true);
        wrapped.forward(CallArgs::from(&x))?;
        let handle = wrapped.plan_handle();

        let y = crate::autograd::with_no_grad(|| wrapped.forward(CallArgs::from(&x)))?;
        assert!(x.requires_grad_flag());
        assert_eq!(wrapped.input_names_require_grad(), ["input1"]);
        assert_eq!(wrapped.plan_handle(), handle);
        assert!(!y.requires_grad_flag());
        Ok(())
    }

    #[test]
    fn first_export_under_no_grad_records_the_callers_flags() -> Result<()> {
        let mut wrapped = OrtModule::new(Mlp::new(8)?)?;
        let x = input(true);
        crate::autograd::with_no_grad(|| wrapped.forward(CallArgs::from(&x)))?;
        let program = wrapped.plan().map(|plan| plan.program().clone());
        assert!(program.unwrap().inputs[0].requires_grad);
        Ok(())
    }

    #[test]
    fn backward_reaches_inputs_and_parameters() -> Result<()> {
        let mut wrapped = OrtModule::new(Mlp::new(3)?)?;
        let x = input(true);
        let y = wrapped.forward(CallArgs::from(&x))?;
        functional::sum(&y)?.backward()?;
        assert!(x.grad().is_some());
        for (name, param) in wrapped.named_parameters()? {
            assert!(param.grad().is_some(), "{name} has no gradient");
        }
        Ok(())
    }

    #[test]
    fn transfer_updates_device_and_flags() -> Result<()> {
        let mut wrapped = OrtModule::new(Mlp::new(4)?)?;
        assert_eq!(wrapped.current_device(), Some(Device::cpu()));
        wrapped.to("cuda")?;
        assert!(wrapped.device_changed());
        wrapped.to("cuda:0")?;
        assert!(!wrapped.device_changed());
        for (_, param) in wrapped.named_parameters()? {
            assert_eq!(param.device(), Device::cuda(0));
        }

        let y = wrapped.forward(CallArgs::from(input(false)))?;
        assert_eq!(y.device(), Device::cuda(0));
        assert!(!wrapped.device_changed());
        Ok(())
    }

    #[test]
    fn unavailable_device_leaves_wrapper_untouched() -> Result<()> {
        let mut wrapped = OrtModule::new(Mlp::new(5)?)?;
        let missing = Device::cuda(crate::device::accelerator_count());
        let err = wrapped.to(missing).err().ok_or_else(|| anyhow!("transfer succeeded"))?;
        assert!(matches!(
            err.downcast_ref::<WrapperError>(),
            Some(WrapperError::DeviceUnavailable { .. })
        ));
        assert_eq!(wrapped.current_device(), Some(Device::cpu()));
        assert!(!wrapped.device_changed());
        Ok(())
    }

    #[test]
    fn split_placement_is_rejected_at_wrap_time() -> Result<()> {
        let mut model = Mlp::new(6)?;
        model.fc2.weight = model.fc2.weight.moved_to(Device::cuda(0))?;
        let err = OrtModule::new(model).err().ok_or_else(|| anyhow!("wrap succeeded"))?;
        assert_eq!(
            err.to_string(),
            "ORTModule supports a single device per model for now"
        );
        Ok(())
    }

    #[test]
    fn frozen_parameters_trigger_a_rebuild() -> Result<()> {
        struct Scale {
            factor: Tensor,
        }
        impl Module for Scale {
            fn signature(&self) -> Signature {
                Signature::new().positional("x")
            }
            fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
                functional::matmul(inputs.tensor("x")?, &self.factor)
            }
            fn visit_params(&self, v: &mut ParamVisitor<'_>) -> Result<()> {
                v.param("factor", TensorRole::Parameter, &self.factor)
            }
            fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_>) -> Result<()> {
                v.param("factor", TensorRole::Parameter, &mut self.factor)
            }
        }

        let factor = Tensor::ones(Shape::new([4, 1])).requires_grad(true);
        let x = input(false);
        let mut trainable = OrtModule::new(Scale { factor })?;
        trainable.forward(CallArgs::from(&x))?;
        let trainable_program = trainable.plan().map(|plan| plan.program().clone());

        let mut frozen = OrtModule::new(trainable.into_inner().freeze()?)?;
        frozen.forward(CallArgs::from(&x))?;
        let frozen_program = frozen.plan().map(|plan| plan.program().clone());
        assert!(trainable_program.unwrap().params[0].trainable);
        assert!(!frozen_program.unwrap().params[0].trainable);
        Ok(())
    }
}
