use std::sync::Arc;

use anyhow::Result;
use ortmodule_rs::binding::CallArgs;
use ortmodule_rs::device::Device;
use ortmodule_rs::ops::OpKind;
use ortmodule_rs::plan::{Operation, Program};
use ortmodule_rs::tensor::{Shape, Tensor};
use ortmodule_tests::common::{randn_on, seeded, wrap, D_IN, D_OUT, H, N};
use ortmodule_tests::define_wrapper_tests;
use ortmodule_tests::models::{
    NeuralNetKeywordArguments, NeuralNetSinglePositionalArgument, UnusedParametersNet,
};
use ortmodule_tests::recording_backend::RecordingBackend;

define_wrapper_tests!(recording_backend_contract, || Arc::new(RecordingBackend::new()));

fn applied_ops(program: &Program) -> Vec<&'static str> {
    program
        .body
        .iter()
        .filter_map(|inst| match &inst.op {
            Operation::Apply(op) => Some(op.name()),
            Operation::Constant(_) => None,
        })
        .collect()
}

#[test]
fn every_forward_runs_the_backend_once() -> Result<()> {
    let backend = Arc::new(RecordingBackend::new());
    let mut rng = seeded(1);
    let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?;
    let mut wrapped = wrap(model, &backend)?;
    assert_eq!(backend.run_count(), 0);
    assert!(backend.recorded_program().is_none());

    for expected in 1..=3 {
        wrapped.forward(CallArgs::from(randn_on(N, D_IN, "cpu", &mut rng)?))?;
        assert_eq!(backend.run_count(), expected);
    }
    Ok(())
}

#[test]
fn backend_receives_the_exported_program() -> Result<()> {
    let backend = Arc::new(RecordingBackend::new());
    let mut rng = seeded(2);
    let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?;
    let mut wrapped = wrap(model, &backend)?;
    let x = randn_on(N, D_IN, "cpu", &mut rng)?.requires_grad(true);
    wrapped.forward(CallArgs::from(&x))?;

    let program = backend.recorded_program_or_panic();
    let plan = wrapped.plan().expect("plan exported");
    assert_eq!(&program, plan.program());
    assert_eq!(program.device, Device::cpu());
    assert_eq!(program.inputs.len(), 1);
    assert_eq!(program.inputs[0].name, "input1");
    assert!(program.inputs[0].requires_grad);
    assert_eq!(
        program.param_names().collect::<Vec<_>>(),
        ["fc1.weight", "fc1.bias", "fc2.weight", "fc2.bias"]
    );
    assert!(program.params.iter().all(|param| param.trainable));
    assert_eq!(
        applied_ops(&program),
        ["matmul", "add_bias", "relu", "matmul", "add_bias"]
    );
    Ok(())
}

#[test]
fn unused_parameters_are_pruned_from_the_program() -> Result<()> {
    let backend = Arc::new(RecordingBackend::new());
    let mut rng = seeded(3);
    let model = UnusedParametersNet::new(D_IN, H, D_OUT, &mut rng)?;
    let mut wrapped = wrap(model, &backend)?;
    let y = wrapped.forward(CallArgs::from(Tensor::scalar(1.0)))?;
    assert_eq!(y.item()?, 1.0);

    let program = backend.recorded_program_or_panic();
    assert!(program.params.is_empty());
    assert!(program.body.is_empty());
    assert_eq!(program.outputs, [program.inputs[0].value]);
    Ok(())
}

#[test]
fn omitted_optional_inputs_are_not_program_inputs() -> Result<()> {
    let backend = Arc::new(RecordingBackend::new());
    let mut rng = seeded(4);
    let model = NeuralNetKeywordArguments::new(D_IN, H, D_OUT, &mut rng)?;
    let mut wrapped = wrap(model, &backend)?;
    let x = randn_on(N, D_IN, "cpu", &mut rng)?;
    let z = randn_on(N, D_IN, "cpu", &mut rng)?;

    wrapped.forward(CallArgs::new().kwarg("x", &x).kwarg("z", &z))?;
    let names: Vec<String> = backend
        .recorded_program_or_panic()
        .inputs
        .into_iter()
        .map(|input| input.name)
        .collect();
    assert_eq!(names, ["x", "z"]);
    let first = wrapped.plan_handle();

    wrapped.forward(CallArgs::new().kwarg("x", &x))?;
    assert_ne!(wrapped.plan_handle(), first);
    assert_eq!(backend.recorded_program_or_panic().inputs.len(), 1);
    assert_eq!(backend.run_count(), 2);
    Ok(())
}

#[test]
fn transferred_model_exports_for_the_new_device() -> Result<()> {
    let backend = Arc::new(RecordingBackend::new());
    let mut rng = seeded(5);
    let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?;
    let mut wrapped = wrap(model, &backend)?;
    let x = Tensor::randn(Shape::new([N, D_IN]), 1.0, &mut rng);

    wrapped.forward(CallArgs::from(&x))?;
    assert_eq!(backend.recorded_program_or_panic().device, Device::cpu());
    wrapped.to("cuda:0")?;
    wrapped.forward(CallArgs::from(&x))?;
    assert_eq!(backend.recorded_program_or_panic().device, Device::cuda(0));
    assert!(!wrapped.device_changed());
    Ok(())
}

#[test]
fn recorded_program_survives_json() -> Result<()> {
    let backend = Arc::new(RecordingBackend::new());
    let mut rng = seeded(6);
    let model = NeuralNetSinglePositionalArgument::new(D_IN, H, D_OUT, &mut rng)?;
    let mut wrapped = wrap(model, &backend)?;
    wrapped.forward(CallArgs::from(randn_on(N, D_IN, "cpu", &mut rng)?))?;

    let program = backend.recorded_program_or_panic();
    let json = program.to_json_string()?;
    assert!(json.contains("\"add_bias\""));
    let restored = Program::from_json_str(&json)?;
    assert_eq!(restored, program);
    assert_eq!(OpKind::Relu.name(), "relu");
    Ok(())
}
