use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;

use super::{ExecutionPlan, PlanHandle, PlanKey};
use crate::autograd;
use crate::binding::BoundInputs;
use crate::module::{Module, NamedTensor, TensorRole};
use crate::ops::trace::TraceSession;

/// Exports a module's forward pass into an [`ExecutionPlan`] by tracing it once.
#[derive(Debug, Clone, Default)]
pub struct GradientGraphBuilder {
    save_dir: Option<PathBuf>,
}

impl GradientGraphBuilder {
    pub fn new(save_dir: Option<PathBuf>) -> Self {
        GradientGraphBuilder { save_dir }
    }

    pub fn save_dir(&self) -> Option<&Path> {
        self.save_dir.as_deref()
    }

    /// Traces `module` on `inputs` with gradient recording disabled, then prunes instructions
    /// and parameters that do not reach the output. `requires_grad` names the inputs whose
    /// caller tensors require grad.
    pub fn export<M: Module + ?Sized>(
        &self,
        module: &M,
        inputs: &BoundInputs,
        requires_grad: &[String],
        params: &[NamedTensor],
        key: PlanKey,
    ) -> Result<ExecutionPlan> {
        let _no_grad = autograd::no_grad();
        let mut session = TraceSession::begin()?;
        for (name, tensor) in inputs.present() {
            let flag = requires_grad.iter().any(|required| required == name);
            session.bind_input(name, tensor, flag)?;
        }
        for param in params {
            let trainable = param.role == TensorRole::Parameter && param.tensor.requires_grad_flag();
            session.bind_param(&param.name, &param.tensor, trainable)?;
        }
        let output = module.forward(inputs)?;
        let mut program = session.finish(key.device, &[&output])?;

        let (erased_insts, erased_params) = program.eliminate_dead_code();
        let handle = PlanHandle::next();
        log::debug!(
            "exported {handle}: {} instructions, {} params ({erased_insts} instructions and {erased_params} params pruned)",
            program.body.len(),
            program.params.len()
        );

        if let Some(dir) = &self.save_dir {
            fs::create_dir_all(dir)?;
            let path = dir.join(format!("{handle}.json"));
            program.save_json(&path)?;
            log::info!("saved {handle} to {}", path.display());
        }

        Ok(ExecutionPlan::new(handle, key, program))
    }
}
