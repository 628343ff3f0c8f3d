use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use ortmodule_rs::binding::{BoundInputs, CallArgs, Signature};
use ortmodule_rs::module::{Module, ParamVisitor, ParamVisitorMut};
use ortmodule_rs::nn::Linear;
use ortmodule_rs::plan::Program;
use ortmodule_rs::tensor::{Shape, Tensor};
use ortmodule_rs::{ExecutionBackend, OrtModule, OrtModuleOptions, ReferenceBackend};
use rand::rngs::StdRng;
use rand::SeedableRng;

struct Regressor {
    fc: Linear,
}

impl Module for Regressor {
    fn signature(&self) -> Signature {
        Signature::new().positional("features")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        self.fc.forward(inputs.tensor("features")?)
    }

    fn visit_params(&self, v: &mut ParamVisitor<'_>) -> Result<()> {
        v.scoped("fc", |v| self.fc.visit_params(v))
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_>) -> Result<()> {
        v.scoped("fc", |v| self.fc.visit_params_mut(v))
    }
}

fn scratch_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}-{}", std::process::id()))
}

#[test]
fn exported_plans_are_written_once_per_rebuild() -> Result<()> {
    let dir = scratch_dir("ortmodule-plan-export");
    let _ = fs::remove_dir_all(&dir);
    let mut rng = StdRng::seed_from_u64(0);
    let model = Regressor {
        fc: Linear::init(3, 1, &mut rng)?,
    };
    let options = OrtModuleOptions {
        save_plan_dir: Some(dir.clone()),
    };
    let mut wrapped = OrtModule::with_options(model, Arc::new(ReferenceBackend::new()), options)?;

    let x = Tensor::randn(Shape::new([4, 3]), 1.0, &mut rng);
    wrapped.forward(CallArgs::from(&x))?;
    wrapped.forward(CallArgs::from(&x))?;
    wrapped.forward(CallArgs::from(x.requires_grad(true)))?;

    let mut saved: Vec<PathBuf> = fs::read_dir(&dir)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<_, _>>()?;
    saved.sort();
    assert_eq!(saved.len(), 2);

    let handle = wrapped.plan_handle().expect("plan exported");
    let latest = Program::load_json(dir.join(format!("{handle}.json")))?;
    assert_eq!(&latest, wrapped.plan().expect("plan exported").program());
    assert!(latest.inputs[0].requires_grad);

    fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn saved_plan_replays_on_a_fresh_backend() -> Result<()> {
    let dir = scratch_dir("ortmodule-plan-replay");
    let _ = fs::remove_dir_all(&dir);
    let mut rng = StdRng::seed_from_u64(1);
    let model = Regressor {
        fc: Linear::init(2, 1, &mut rng)?,
    };
    let options = OrtModuleOptions {
        save_plan_dir: Some(dir.clone()),
    };
    let mut wrapped = OrtModule::with_options(model, Arc::new(ReferenceBackend::new()), options)?;
    let features = Tensor::from_vec(Shape::new([3, 2]), vec![1.0, 0.0, 0.0, 1.0, 2.0, -1.0])?;
    let expected = wrapped.forward(CallArgs::from(&features))?;

    let handle = wrapped.plan_handle().expect("plan exported");
    let program = Program::load_json(dir.join(format!("{handle}.json")))?;
    let fc = &wrapped.module().fc;
    let mut entry = vec![features.clone(), fc.weight.clone()];
    entry.extend(fc.bias.clone());
    let outputs = ReferenceBackend::new().run_program(&program, &entry)?;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].data(), expected.data());

    fs::remove_dir_all(&dir)?;
    Ok(())
}
