use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::Device;
use crate::ops::OpKind;
use crate::tensor::{Shape, TensorLiteral};

pub const PROGRAM_VERSION: &str = "ortmodule.v1";

fn default_version() -> String {
    PROGRAM_VERSION.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Tensor captured by value during tracing.
    Constant(TensorLiteral),
    Apply(OpKind),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    #[serde(default)]
    pub operands: Vec<ValueId>,
}

/// Model input as seen at export time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramInput {
    pub name: String,
    pub value: ValueId,
    pub shape: Shape,
    pub requires_grad: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramParam {
    pub name: String,
    pub value: ValueId,
    pub shape: Shape,
    pub trainable: bool,
}

/// Straight-line program exported from a module's forward pass.
///
/// Entry values are bound in order: every input, then every parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default = "default_version")]
    pub version: String,
    pub device: Device,
    pub inputs: Vec<ProgramInput>,
    pub params: Vec<ProgramParam>,
    pub body: Vec<Instruction>,
    pub outputs: Vec<ValueId>,
}

#[derive(Debug, Error)]
pub enum ProgramSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("program version '{found}' does not match expected '{expected}'")]
    VersionMismatch {
        found: String,
        expected: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ProgramIoError {
    #[error(transparent)]
    Serialization(#[from] ProgramSerdeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Program {
    pub fn new(device: Device) -> Self {
        Program {
            version: default_version(),
            device,
            inputs: Vec::new(),
            params: Vec::new(),
            body: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Number of tensors a backend must receive to run the program.
    pub fn entry_arity(&self) -> usize {
        self.inputs.len() + self.params.len()
    }

    /// Entry value ids in binding order.
    pub fn entry_values(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.inputs
            .iter()
            .map(|input| input.value)
            .chain(self.params.iter().map(|param| param.value))
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.params.iter().map(|param| param.name.as_str())
    }

    /// Removes instructions that do not contribute to an output, then parameters that are no
    /// longer referenced. Returns the number of erased instructions and parameters.
    pub fn eliminate_dead_code(&mut self) -> (usize, usize) {
        let def_map: HashMap<ValueId, usize> = self
            .body
            .iter()
            .enumerate()
            .map(|(idx, inst)| (inst.id, idx))
            .collect();

        let mut worklist = self.outputs.clone();
        let mut live: HashSet<ValueId> = HashSet::new();
        while let Some(value) = worklist.pop() {
            if !live.insert(value) {
                continue;
            }
            let Some(&idx) = def_map.get(&value) else {
                continue;
            };
            worklist.extend(self.body[idx].operands.iter().copied());
        }

        let before = self.body.len();
        self.body.retain(|inst| live.contains(&inst.id));
        let erased_insts = before - self.body.len();

        let before = self.params.len();
        self.params.retain(|param| live.contains(&param.value));
        let erased_params = before - self.params.len();

        (erased_insts, erased_params)
    }

    pub fn to_json_string(&self) -> Result<String, ProgramSerdeError> {
        serde_json::to_string_pretty(self).map_err(ProgramSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ProgramSerdeError> {
        let program: Program = serde_json::from_str(src).map_err(ProgramSerdeError::from)?;
        if program.version != PROGRAM_VERSION {
            return Err(ProgramSerdeError::VersionMismatch {
                found: program.version,
                expected: PROGRAM_VERSION,
            });
        }
        Ok(program)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ProgramIoError> {
        let contents = self.to_json_string()?;
        fs::write(path, contents).map_err(ProgramIoError::from)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, ProgramIoError> {
        let contents = fs::read_to_string(path).map_err(ProgramIoError::from)?;
        Program::from_json_str(&contents).map_err(ProgramIoError::from)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

fn join_values(values: &[ValueId]) -> String {
    values
        .iter()
        .map(ValueId::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "program @{} ({})", self.device, self.version)?;
        for input in &self.inputs {
            let grad = if input.requires_grad { " grad" } else { "" };
            writeln!(
                f,
                "  input {} = {} {:?}{grad}",
                input.value,
                input.name,
                input.shape.dims()
            )?;
        }
        for param in &self.params {
            let frozen = if param.trainable { "" } else { " frozen" };
            writeln!(
                f,
                "  param {} = {} {:?}{frozen}",
                param.value,
                param.name,
                param.shape.dims()
            )?;
        }
        for inst in &self.body {
            match &inst.op {
                Operation::Constant(literal) => writeln!(
                    f,
                    "  {} = constant {:?}",
                    inst.id,
                    literal.shape.dims()
                )?,
                Operation::Apply(op) => writeln!(
                    f,
                    "  {} = {}({})",
                    inst.id,
                    op.name(),
                    join_values(&inst.operands)
                )?,
            }
        }
        write!(f, "  return {}", join_values(&self.outputs))
    }
}
