//! Execution runtimes for exported programs.

mod reference;

use std::fmt;

use crate::plan::Program;
use crate::tensor::Tensor;

pub use reference::ReferenceBackend;

/// Backend error surfaced to higher layers.
#[derive(Debug)]
pub enum BackendError {
    /// The program is malformed or does not match the supplied entry values.
    InvalidProgram { message: String },
    /// An instruction failed; displays the op's own error unchanged.
    Op {
        op: &'static str,
        source: anyhow::Error,
    },
}

impl BackendError {
    pub fn invalid_program(message: impl Into<String>) -> Self {
        BackendError::InvalidProgram {
            message: message.into(),
        }
    }

    pub fn op(op: &'static str, source: anyhow::Error) -> Self {
        BackendError::Op { op, source }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::InvalidProgram { message } => write!(f, "invalid program: {message}"),
            BackendError::Op { source, .. } => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Op { source, .. } => source.source(),
            _ => None,
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Runs exported programs.
///
/// `entry_inputs` holds one tensor per program input followed by one per parameter, in the
/// order the program declares them. Outputs keep their autograd history so gradients flow back
/// to the entry tensors.
pub trait ExecutionBackend: Send + Sync {
    fn backend_name(&self) -> &str;

    fn run_program(&self, program: &Program, entry_inputs: &[Tensor]) -> BackendResult<Vec<Tensor>>;
}
