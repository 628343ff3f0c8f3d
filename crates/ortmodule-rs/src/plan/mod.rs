//! Execution plans: the exported program plus the key it was exported under.

pub mod builder;
pub mod key;
pub mod program;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::binding::BoundInputs;
use crate::module::NamedTensor;
use crate::tensor::Tensor;

pub use builder::GradientGraphBuilder;
pub use key::{PlanKey, RebuildReason};
pub use program::{Instruction, Operation, Program, ProgramInput, ProgramParam, ValueId};

static NEXT_PLAN_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Identity of one export. Every rebuild yields a new handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanHandle(u64);

impl PlanHandle {
    pub(crate) fn next() -> Self {
        PlanHandle(NEXT_PLAN_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlanHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plan-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    handle: PlanHandle,
    key: PlanKey,
    program: Arc<Program>,
}

impl ExecutionPlan {
    pub(crate) fn new(handle: PlanHandle, key: PlanKey, program: Program) -> Self {
        ExecutionPlan {
            handle,
            key,
            program: Arc::new(program),
        }
    }

    pub fn handle(&self) -> PlanHandle {
        self.handle
    }

    pub fn key(&self) -> &PlanKey {
        &self.key
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Resolves the program's entry values, by name, from the call's inputs and the module's
    /// current tensors.
    pub fn entry_inputs(&self, inputs: &BoundInputs, params: &[NamedTensor]) -> Result<Vec<Tensor>> {
        let by_name: HashMap<&str, &Tensor> = params
            .iter()
            .map(|param| (param.name.as_str(), &param.tensor))
            .collect();
        let mut entry = Vec::with_capacity(self.program.entry_arity());
        for input in &self.program.inputs {
            let tensor = inputs.get(&input.name).ok_or_else(|| {
                anyhow!("{} expects input '{}' but it was not supplied", self.handle, input.name)
            })?;
            entry.push(tensor.clone());
        }
        for param in &self.program.params {
            let tensor = by_name.get(param.name.as_str()).ok_or_else(|| {
                anyhow!("{} expects parameter '{}' which the module no longer has", self.handle, param.name)
            })?;
            entry.push((*tensor).clone());
        }
        Ok(entry)
    }
}
