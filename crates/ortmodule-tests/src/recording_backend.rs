use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use ortmodule_rs::backend::{BackendResult, ExecutionBackend, ReferenceBackend};
use ortmodule_rs::plan::Program;
use ortmodule_rs::tensor::Tensor;

/// Test-only backend that delegates to the reference interpreter and records every program it
/// is asked to run.
#[derive(Default)]
pub struct RecordingBackend {
    inner: ReferenceBackend,
    runs: AtomicUsize,
    last_program: Mutex<Option<Program>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn recorded_program(&self) -> Option<Program> {
        self.last_program
            .lock()
            .expect("backend mutex poisoned")
            .clone()
    }

    pub fn recorded_program_or_panic(&self) -> Program {
        self.recorded_program()
            .expect("backend should record the executed program")
    }
}

impl ExecutionBackend for RecordingBackend {
    fn backend_name(&self) -> &str {
        "recording"
    }

    fn run_program(&self, program: &Program, entry_inputs: &[Tensor]) -> BackendResult<Vec<Tensor>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.last_program
            .lock()
            .expect("backend mutex poisoned")
            .replace(program.clone());
        self.inner.run_program(program, entry_inputs)
    }
}
