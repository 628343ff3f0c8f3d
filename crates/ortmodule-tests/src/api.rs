//! Wrapper contract checks, generic over the execution backend.

use std::cell::Cell;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Result};
use ortmodule_rs::autograd;
use ortmodule_rs::backend::ExecutionBackend;
use ortmodule_rs::binding::{BoundInputs, CallArgs, Signature};
use ortmodule_rs::device::{self, Device, DeviceKind};
use ortmodule_rs::error::WrapperError;
use ortmodule_rs::module::{Module, ModuleExt};
use ortmodule_rs::nn::Relu;
use ortmodule_rs::ops::functional;
use ortmodule_rs::tensor::{Shape, Tensor};

use crate::common::{accelerator_or_skip, ensure_parameters_on, randn_on, seeded, wrap, D_IN, D_OUT, H, N};
use crate::models::{
    Identity, MultipleDeviceModel, NeuralNetKeywordArguments, NeuralNetMultiplePositionalArguments,
    NeuralNetPositionalAndKeywordArguments, NeuralNetPositionalArguments,
    NeuralNetSinglePositionalArgument, Placement, ReluNet, UnusedParametersNet,
};

fn ensure_output_shape(output: &Tensor, dims: &[usize]) -> Result<()> {
    ensure!(
        output.shape().dims() == dims,
        "expected output shape {dims:?}, got {:?}",
        output.shape().dims()
    );
    Ok(())
}

/// Runs `args` through the raw module and through its wrapper and compares the results.
fn ensure_matches_unwrapped<M, B>(
    make_model: impl Fn() -> Result<M>,
    backend: &Arc<B>,
    args: CallArgs,
) -> Result<()>
where
    M: Module,
    B: ExecutionBackend + 'static,
{
    let expected = make_model()?.cuda()?.call(args.clone())?;
    let mut wrapped = wrap(make_model()?.cuda()?, backend)?;
    let actual = wrapped.forward(args)?;
    ensure_output_shape(&actual, &[N, D_OUT])?;
    ensure!(
        actual.data() == expected.data(),
        "wrapped output differs from the unwrapped module"
    );
    ensure!(actual.device() == Device::cuda(0), "output left the model device");
    Ok(())
}

pub fn forward_call_single_positional_argument<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    let mut rng = seeded(1);
    let x = randn_on(N, D_IN, "cuda", &mut rng)?;
    ensure_matches_unwrapped(
        || NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut seeded(10)),
        backend,
        CallArgs::new().arg(&x),
    )
}

pub fn forward_call_multiple_positional_arguments<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    let mut rng = seeded(2);
    let x = randn_on(N, D_IN, "cuda", &mut rng)?;
    let y = randn_on(N, D_IN, "cuda", &mut rng)?;
    ensure_matches_unwrapped(
        || NeuralNetMultiplePositionalArguments::new(D_IN, H, D_OUT, &mut seeded(10)),
        backend,
        CallArgs::new().arg(&x).arg(&y),
    )
}

pub fn forward_call_positional_arguments<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    let mut rng = seeded(3);
    let args = (0..3)
        .map(|_| randn_on(N, D_IN, "cuda", &mut rng))
        .collect::<Result<Vec<_>>>()?;
    ensure_matches_unwrapped(
        || NeuralNetPositionalArguments::new(D_IN, H, D_OUT, &mut seeded(10)),
        backend,
        CallArgs::from_tensors(&args),
    )?;

    let mut wrapped = wrap(
        NeuralNetPositionalArguments::new(D_IN, H, D_OUT, &mut seeded(10))?,
        backend,
    )?;
    let output = wrapped.forward(CallArgs::from_tensors(&args))?;
    ensure_output_shape(&output, &[N, D_OUT])?;
    let plan = wrapped.plan().ok_or_else(|| anyhow!("no plan after forward"))?;
    let names: Vec<&str> = plan
        .program()
        .inputs
        .iter()
        .map(|input| input.name.as_str())
        .collect();
    ensure!(
        names == ["model_inputs_0", "model_inputs_1", "model_inputs_2"],
        "unexpected flattened input names {names:?}"
    );
    Ok(())
}

pub fn forward_call_keyword_arguments<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    let mut rng = seeded(4);
    let x = randn_on(N, D_IN, "cuda", &mut rng)?;
    let y = randn_on(N, D_IN, "cuda", &mut rng)?;
    let z = randn_on(N, D_IN, "cuda", &mut rng)?;
    let make = || NeuralNetKeywordArguments::new(D_IN, H, D_OUT, &mut seeded(10));

    ensure_matches_unwrapped(make, backend, CallArgs::new().arg(&x).arg(&y).arg(&z))?;
    ensure_matches_unwrapped(
        make,
        backend,
        CallArgs::new().kwarg("z", &z).kwarg("x", &x).kwarg("y", &y),
    )?;
    ensure_matches_unwrapped(make, backend, CallArgs::new().arg(&x).none().kwarg("z", &z))?;
    Ok(())
}

pub fn forward_call_positional_and_keyword_arguments<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    let mut rng = seeded(5);
    let a = randn_on(N, D_IN, "cuda", &mut rng)?;
    let x = randn_on(N, D_IN, "cuda", &mut rng)?;
    let y = randn_on(N, D_IN, "cuda", &mut rng)?;
    let z = randn_on(N, D_IN, "cuda", &mut rng)?;
    let make = || NeuralNetPositionalAndKeywordArguments::new(D_IN, H, D_OUT, &mut seeded(10));

    ensure_matches_unwrapped(
        make,
        backend,
        CallArgs::new().arg(&a).arg(&x).arg(&y).arg(&z),
    )?;
    ensure_matches_unwrapped(
        make,
        backend,
        CallArgs::new().arg(&a).kwarg("y", &y).kwarg_none("z"),
    )?;
    Ok(())
}

pub fn binding_errors_reach_the_caller<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    let mut rng = seeded(6);
    let x = randn_on(N, D_IN, "cpu", &mut rng)?;
    let mut wrapped = wrap(
        NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?,
        backend,
    )?;

    let cases = [
        (CallArgs::new().arg(&x).arg(&x), "too many positional arguments"),
        (CallArgs::new(), "missing required argument 'input1'"),
        (
            CallArgs::new().arg(&x).kwarg("bogus", &x),
            "unexpected keyword argument 'bogus'",
        ),
    ];
    for (args, expected) in cases {
        let err = wrapped
            .forward(args)
            .err()
            .ok_or_else(|| anyhow!("binding unexpectedly succeeded"))?;
        ensure!(
            matches!(err.downcast_ref::<WrapperError>(), Some(WrapperError::Binding(_))),
            "expected a binding error, got {err}"
        );
        ensure!(
            err.to_string().starts_with(expected),
            "expected '{expected}', got '{err}'"
        );
    }
    ensure!(wrapped.plan_handle().is_none(), "failed binds must not export");
    Ok(())
}

pub fn model_cuda<B: ExecutionBackend + 'static>(backend: &Arc<B>) -> Result<()> {
    let mut rng = seeded(7);
    let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?;
    let mut wrapped = wrap(model, backend)?;
    let x = randn_on(N, D_IN, "cuda", &mut rng)?;
    ensure_parameters_on(&wrapped, DeviceKind::Cpu)?;

    wrapped.cuda()?;
    wrapped.forward(CallArgs::from(&x))?;
    ensure_parameters_on(&wrapped, DeviceKind::Cuda)
}

pub fn model_cpu<B: ExecutionBackend + 'static>(backend: &Arc<B>) -> Result<()> {
    let mut rng = seeded(8);
    let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?.to("cuda")?;
    let mut wrapped = wrap(model, backend)?;
    let x = randn_on(N, D_IN, "cpu", &mut rng)?;
    ensure_parameters_on(&wrapped, DeviceKind::Cuda)?;

    wrapped.cpu()?;
    wrapped.forward(CallArgs::from(&x))?;
    ensure_parameters_on(&wrapped, DeviceKind::Cpu)
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Name(&'static str),
    Device(Device),
    /// A tensor created on this device, whose device is copied.
    DonorOn(&'static str),
}

struct ToDeviceCase {
    original: &'static str,
    target: Target,
    device_changed: bool,
    expected: Device,
}

const fn to_device_case(
    original: &'static str,
    target: Target,
    device_changed: bool,
    expected: Device,
) -> ToDeviceCase {
    ToDeviceCase {
        original,
        target,
        device_changed,
        expected,
    }
}

pub fn model_to_device<B: ExecutionBackend + 'static>(backend: &Arc<B>) -> Result<()> {
    let cuda = Device::cuda(0);
    let cpu = Device::cpu();
    let cases = [
        to_device_case("cpu", Target::Device(Device::cuda_current()), true, cuda),
        to_device_case("cpu", Target::Name("cuda"), true, cuda),
        to_device_case("cpu", Target::Name("cuda:0"), true, cuda),
        to_device_case("cuda", Target::Name("cuda"), false, cuda),
        to_device_case("cuda", Target::Name("cuda:0"), false, cuda),
        to_device_case("cuda", Target::Device(Device::cuda_current()), false, cuda),
        to_device_case("cuda", Target::Name("cpu"), true, cpu),
        to_device_case("cuda", Target::Device(Device::cpu()), true, cpu),
        to_device_case("cpu", Target::Name("cpu"), false, cpu),
        to_device_case("cpu", Target::Device(Device::cpu()), false, cpu),
        to_device_case("cpu", Target::DonorOn("cuda"), true, cuda),
        to_device_case("cuda", Target::DonorOn("cuda:0"), false, cuda),
    ];

    for (idx, case) in cases.iter().enumerate() {
        let mut rng = seeded(100 + idx as u64);
        let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?.to(case.original)?;
        let mut wrapped = wrap(model, backend)?;
        let x = randn_on(N, D_IN, case.expected, &mut rng)?;
        let original_kind = case.original.parse::<Device>()?.kind();
        ensure_parameters_on(&wrapped, original_kind)?;

        match case.target {
            Target::Name(name) => wrapped.to(name)?,
            Target::Device(device) => wrapped.to(device)?,
            Target::DonorOn(name) => {
                let donor = Tensor::zeros(Shape::new([2])).to(name)?;
                wrapped.to(&donor)?
            }
        };
        ensure!(
            wrapped.device_changed() == case.device_changed,
            "case {idx} ({} -> {:?}): device_changed = {}",
            case.original,
            case.target,
            wrapped.device_changed()
        );
        ensure!(
            wrapped.current_device() == Some(case.expected),
            "case {idx}: device is {:?}, expected {}",
            wrapped.current_device(),
            case.expected
        );

        wrapped.forward(CallArgs::from(&x))?;
        ensure_parameters_on(&wrapped, case.expected.kind())?;
    }
    Ok(())
}

pub fn model_to_device_and_back_to_original<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    for (original, target) in [("cuda", "cpu"), ("cpu", "cuda")] {
        let original_device = original.parse::<Device>()?.normalized();
        let target_device = target.parse::<Device>()?.normalized();
        let mut rng = seeded(9);
        let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?.to(original)?;
        let mut wrapped = wrap(model, backend)?;
        ensure_parameters_on(&wrapped, original_device.kind())?;

        wrapped.to(target)?;
        ensure!(wrapped.device_changed(), "{original} -> {target} must report a change");
        ensure!(wrapped.current_device() == Some(target_device));
        ensure_parameters_on(&wrapped, target_device.kind())?;

        wrapped.to(original)?;
        ensure!(wrapped.device_changed(), "{target} -> {original} must report a change");
        ensure!(wrapped.current_device() == Some(original_device));
        ensure_parameters_on(&wrapped, original_device.kind())?;
    }
    Ok(())
}

pub fn model_with_different_devices_same_session<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    let mut rng = seeded(11);
    let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?;
    let mut wrapped = wrap(model, backend)?;
    let mut handles = Vec::new();
    for i in 0..5 {
        let device = if i % 2 == 0 { "cpu" } else { "cuda" };
        wrapped.to(device)?;
        let x = randn_on(N, D_IN, device, &mut rng)?;
        let y = wrapped.forward(CallArgs::from(&x))?;
        ensure!(
            y.device().kind() == x.device().kind(),
            "output on {} for a {device} model",
            y.device()
        );
        handles.push(wrapped.plan_handle());
    }
    handles.dedup();
    ensure!(handles.len() == 5, "every device switch must re-export");
    Ok(())
}

pub fn input_requires_grad_saved<B: ExecutionBackend + 'static>(backend: &Arc<B>) -> Result<()> {
    for device in ["cuda", "cpu"] {
        let mut rng = seeded(12);
        let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?.to(device)?;
        let mut wrapped = wrap(model, backend)?;
        let x = functional::add_scalar(
            &randn_on(N, D_IN, device, &mut rng)?.requires_grad(true),
            1.0,
        )?;
        wrapped.forward(CallArgs::from(&x))?;
        ensure!(
            wrapped.input_names_require_grad() == ["input1"],
            "on {device}: {:?}",
            wrapped.input_names_require_grad()
        );
    }
    Ok(())
}

pub fn input_requires_grad_backward_creates_input_grad<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    for device in ["cuda", "cpu"] {
        let mut rng = seeded(13);
        let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?.to(device)?;
        let mut wrapped = wrap(model, backend)?;
        let x = randn_on(N, D_IN, device, &mut rng)?.requires_grad(true);
        ensure!(x.grad().is_none());
        let prediction = wrapped.forward(CallArgs::from(&x))?;
        functional::sum(&prediction)?.backward()?;
        let grad = x.grad().ok_or_else(|| anyhow!("no input gradient on {device}"))?;
        ensure!(grad.shape() == x.shape());
        ensure!(grad.device() == x.device());
    }
    Ok(())
}

/// Gradients reach inputs that live on a different device than the model.
pub fn backward_crosses_devices<B: ExecutionBackend + 'static>(backend: &Arc<B>) -> Result<()> {
    let mut rng = seeded(14);
    let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?.cuda()?;
    let mut wrapped = wrap(model, backend)?;
    let x = randn_on(N, D_IN, "cpu", &mut rng)?.requires_grad(true);
    let y = wrapped.forward(CallArgs::from(&x))?;
    ensure!(y.device() == Device::cuda(0));
    functional::sum(&y)?.backward()?;
    let grad = x.grad().ok_or_else(|| anyhow!("no input gradient"))?;
    ensure!(grad.device() == Device::cpu());
    for (name, parameter) in wrapped.named_parameters()? {
        ensure!(parameter.grad().is_some(), "{name} received no gradient");
    }
    Ok(())
}

pub fn changes_input_requires_grad_rebuilds_plan<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    for device in ["cuda", "cpu"] {
        let mut rng = seeded(15);
        let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?.to(device)?;
        let mut wrapped = wrap(model, backend)?;
        let x = randn_on(N, D_IN, device, &mut rng)?.requires_grad(true);
        wrapped.forward(CallArgs::from(x.detach()))?;
        let handle = wrapped.plan_handle();
        ensure!(wrapped.input_names_require_grad().is_empty());
        wrapped.forward(CallArgs::from(&x))?;
        ensure!(
            handle != wrapped.plan_handle(),
            "requiring grad on input1 must rebuild the plan on {device}"
        );
    }
    Ok(())
}

pub fn plan_is_stable_for_value_changes<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    let mut rng = seeded(16);
    let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?;
    let mut wrapped = wrap(model, backend)?;
    wrapped.forward(CallArgs::from(randn_on(N, D_IN, "cpu", &mut rng)?))?;
    let handle = wrapped.plan_handle();
    for batch in [N, 2 * N, 1] {
        let output = wrapped.forward(CallArgs::from(randn_on(batch, D_IN, "cpu", &mut rng)?))?;
        ensure_output_shape(&output, &[batch, D_OUT])?;
        ensure!(wrapped.plan_handle() == handle, "value-only change rebuilt the plan");
    }

    wrapped.to("cpu")?;
    ensure!(!wrapped.device_changed());
    wrapped.forward(CallArgs::from(randn_on(N, D_IN, "cpu", &mut rng)?))?;
    ensure!(
        wrapped.plan_handle() == handle,
        "same-device transfer rebuilt the plan"
    );
    Ok(())
}

/// Records the grad mode seen by `forward`, which only runs while exporting.
struct GradModeRecorder {
    seen: Cell<Option<bool>>,
}

impl Module for GradModeRecorder {
    fn signature(&self) -> Signature {
        Signature::new().positional("x")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        self.seen.set(Some(autograd::is_grad_enabled()));
        functional::relu(inputs.tensor("x")?)
    }
}

pub fn export_runs_without_grad<B: ExecutionBackend + 'static>(backend: &Arc<B>) -> Result<()> {
    let mut rng = seeded(17);
    let mut wrapped = wrap(
        GradModeRecorder {
            seen: Cell::new(None),
        },
        backend,
    )?;
    let x = randn_on(N, D_IN, "cpu", &mut rng)?.requires_grad(true);
    let y = wrapped.forward(CallArgs::from(&x))?;
    ensure!(
        wrapped.module().seen.get() == Some(false),
        "export traced with grad mode {:?}",
        wrapped.module().seen.get()
    );
    ensure!(autograd::is_grad_enabled(), "grad mode was not restored");
    ensure!(y.requires_grad_flag(), "runtime output lost its autograd history");
    Ok(())
}

/// Mixes a detached copy of its input with a tracked one.
struct DetachedSkip;

impl Module for DetachedSkip {
    fn signature(&self) -> Signature {
        Signature::new().positional("x")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        let x = inputs.tensor("x")?;
        functional::add(&x.detach(), &functional::mul_scalar(x, 2.0)?)
    }
}

pub fn detached_values_follow_each_call<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    let mut rng = seeded(24);
    let mut wrapped = wrap(DetachedSkip, backend)?;
    let mut handle = None;
    for _ in 0..2 {
        let x = randn_on(N, D_IN, "cpu", &mut rng)?.requires_grad(true);
        let expected = DetachedSkip.call(CallArgs::from(x.detach()))?;
        let y = wrapped.forward(CallArgs::from(&x))?;
        ensure!(
            y.data() == expected.data(),
            "wrapped output reused values from an earlier call"
        );
        ensure!(handle.is_none() || handle == wrapped.plan_handle());
        handle = wrapped.plan_handle();

        functional::sum(&y)?.backward()?;
        let grad = x.grad().ok_or_else(|| anyhow!("no input gradient"))?;
        ensure!(
            grad.data().iter().all(|g| *g == 2.0),
            "gradient flowed through the detached branch: {:?}",
            grad.data()
        );
    }
    Ok(())
}

/// Adds a tensor built inside `forward` that does not depend on the inputs.
struct ConstantOffset;

impl Module for ConstantOffset {
    fn signature(&self) -> Signature {
        Signature::new().positional("x")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        let x = inputs.tensor("x")?;
        functional::add(x, &Tensor::full(x.shape().clone(), 0.5))
    }
}

pub fn constants_built_in_forward_match_eager<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    let mut rng = seeded(25);
    let mut wrapped = wrap(ConstantOffset, backend)?;
    for _ in 0..2 {
        let x = randn_on(N, D_IN, "cpu", &mut rng)?;
        let expected = ConstantOffset.call(CallArgs::from(&x))?;
        let y = wrapped.forward(CallArgs::from(&x))?;
        ensure!(y.data() == expected.data());
    }
    Ok(())
}

/// Turns an intermediate value into a trainable leaf, which a plan cannot express.
struct LeafFromIntermediate;

impl Module for LeafFromIntermediate {
    fn signature(&self) -> Signature {
        Signature::new().positional("x")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        Ok(functional::add_scalar(inputs.tensor("x")?, 1.0)?.requires_grad(true))
    }
}

pub fn new_leaf_inside_forward_fails_export<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    let mut rng = seeded(26);
    let mut wrapped = wrap(LeafFromIntermediate, backend)?;
    let x = randn_on(N, D_IN, "cpu", &mut rng)?;
    let err = wrapped
        .forward(CallArgs::from(&x))
        .err()
        .ok_or_else(|| anyhow!("export accepted a leaf created from a traced value"))?;
    ensure!(
        format!("{err:#}").contains("cannot export forward"),
        "unexpected error: {err:#}"
    );
    ensure!(wrapped.plan_handle().is_none());

    let eager = LeafFromIntermediate.call(CallArgs::from(&x))?;
    ensure!(eager.requires_grad_flag(), "eager forward is unaffected");
    Ok(())
}

pub fn forward_under_no_grad_keeps_grad_requirements<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    let mut rng = seeded(27);
    let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?;
    let mut wrapped = wrap(model, backend)?;
    let x = randn_on(N, D_IN, "cpu", &mut rng)?.requires_grad(true);
    let trained = wrapped.forward(CallArgs::from(&x))?;
    let handle = wrapped.plan_handle();

    let evaluated = autograd::with_no_grad(|| wrapped.forward(CallArgs::from(&x)))?;
    ensure!(
        wrapped.input_names_require_grad() == ["input1"],
        "no_grad call dropped the caller's flags: {:?}",
        wrapped.input_names_require_grad()
    );
    ensure!(wrapped.plan_handle() == handle, "no_grad call rebuilt the plan");
    ensure!(!evaluated.requires_grad_flag());
    ensure!(evaluated.data() == trained.data());
    Ok(())
}

pub fn model_without_parameters<B: ExecutionBackend + 'static>(backend: &Arc<B>) -> Result<()> {
    for device in ["cuda", "cpu"] {
        let model = Identity.to(device)?;
        let mut wrapped = wrap(model, backend)?;
        wrapped.to(device)?;
        let output = wrapped.forward(CallArgs::from(Tensor::scalar(1.0)))?;
        ensure!(output.item()? == 1.0);
        ensure!(output.shape().rank() == 0);
    }
    Ok(())
}

pub fn model_without_trainable_parameters<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    for device in ["cuda", "cpu"] {
        let mut rng = seeded(18);
        let mut wrapped = wrap(Relu, backend)?;
        wrapped.to(device)?;
        let input = randn_on(5, 10, device, &mut rng)?;
        let output = wrapped.forward(CallArgs::from(&input))?;
        ensure_output_shape(&output, &[5, 10])?;
        ensure!(output.data().iter().all(|value| *value >= 0.0));
    }
    Ok(())
}

pub fn custom_model_without_trainable_parameters<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    for device in ["cuda", "cpu"] {
        let mut wrapped = wrap(ReluNet { fc1: Relu }, backend)?;
        wrapped.to(device)?;
        wrapped.to(device)?;
        ensure!(!wrapped.device_changed());
        let output = wrapped.forward(CallArgs::from(Tensor::scalar(1.0).to(device)?))?;
        ensure!(output.item()? == 1.0);
    }
    Ok(())
}

pub fn model_with_unused_trainable_parameters<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    for device in ["cuda", "cpu"] {
        let mut rng = seeded(19);
        let model = UnusedParametersNet::new(D_IN, H, D_OUT, &mut rng)?;
        let mut wrapped = wrap(model, backend)?;
        wrapped.to(device)?;
        let output = wrapped.forward(CallArgs::from(Tensor::scalar(1.0).to(device)?))?;
        ensure!(output.item()? == 1.0);
        let plan = wrapped.plan().ok_or_else(|| anyhow!("no plan after forward"))?;
        ensure!(
            plan.program().params.is_empty(),
            "unused parameters survived export: {:?}",
            plan.program().param_names().collect::<Vec<_>>()
        );
        ensure!(wrapped.named_parameters()?.len() == 4);
    }
    Ok(())
}

pub fn frozen_model_executes<B: ExecutionBackend + 'static>(backend: &Arc<B>) -> Result<()> {
    let mut rng = seeded(20);
    let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?.freeze()?;
    let mut wrapped = wrap(model, backend)?;
    let output = wrapped.forward(CallArgs::from(randn_on(N, D_IN, "cpu", &mut rng)?))?;
    ensure_output_shape(&output, &[N, D_OUT])?;
    ensure!(!output.requires_grad_flag());
    Ok(())
}

pub fn model_with_multiple_devices<B: ExecutionBackend + 'static>(backend: &Arc<B>) -> Result<()> {
    let placements = [
        (Placement::Cpu, Placement::Cuda),
        (Placement::ToCpu, Placement::ToCuda),
        (Placement::ToCuda, Placement::Cpu),
        (Placement::ToCpu, Placement::Cuda),
    ];
    for (first, second) in placements {
        let model = MultipleDeviceModel::new(first, second, &mut seeded(21))?;
        let err = wrap(model, backend)
            .err()
            .ok_or_else(|| anyhow!("{first:?}/{second:?} wrapped without error"))?;
        ensure!(
            err.to_string() == "ORTModule supports a single device per model for now",
            "unexpected message: {err}"
        );
        ensure!(matches!(
            err.downcast_ref::<WrapperError>(),
            Some(WrapperError::MultipleDevices { .. })
        ));
    }
    Ok(())
}

pub fn model_with_different_cuda_devices<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    for device in ["cuda", "cuda:0", "cuda:1", "cuda:2"] {
        let Some(resolved) = accelerator_or_skip(device, "model_with_different_cuda_devices")? else {
            continue;
        };
        let mut rng = seeded(22);
        let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?.to(device)?;
        let mut wrapped = wrap(model, backend)?;
        wrapped.to(device)?;
        ensure!(!wrapped.device_changed());
        let x = randn_on(N, D_IN, device, &mut rng)?;
        let y = wrapped.forward(CallArgs::from(&x))?;
        ensure!(y.device() == resolved);
    }
    Ok(())
}

pub fn unavailable_device_leaves_wrapper_untouched<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    let mut rng = seeded(23);
    let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?;
    let mut wrapped = wrap(model, backend)?;
    wrapped.forward(CallArgs::from(randn_on(N, D_IN, "cpu", &mut rng)?))?;
    let handle = wrapped.plan_handle();

    let missing = format!("cuda:{}", device::accelerator_count());
    let err = wrapped
        .to(missing.as_str())
        .err()
        .ok_or_else(|| anyhow!("transfer to {missing} succeeded"))?;
    ensure!(matches!(
        err.downcast_ref::<WrapperError>(),
        Some(WrapperError::DeviceUnavailable { .. })
    ));
    ensure!(wrapped.current_device() == Some(Device::cpu()));
    ensure!(!wrapped.device_changed());
    ensure_parameters_on(&wrapped, DeviceKind::Cpu)?;

    wrapped.forward(CallArgs::from(randn_on(N, D_IN, "cpu", &mut rng)?))?;
    ensure!(wrapped.plan_handle() == handle);
    Ok(())
}

pub fn parameterless_model_binds_device_from_inputs<B: ExecutionBackend + 'static>(
    backend: &Arc<B>,
) -> Result<()> {
    let mut wrapped = wrap(Identity, backend)?;
    ensure!(wrapped.current_device().is_none());
    let x = Tensor::scalar(2.0).to("cuda")?;
    let y = wrapped.forward(CallArgs::from(&x))?;
    ensure!(wrapped.current_device() == Some(Device::cuda(0)));
    ensure!(y.device() == Device::cuda(0));

    let cpu_input = Tensor::scalar(3.0);
    let y = wrapped.forward(CallArgs::from(&cpu_input))?;
    ensure!(y.device() == Device::cuda(0), "inputs follow the bound device");
    ensure!(y.item()? == 3.0);
    Ok(())
}
