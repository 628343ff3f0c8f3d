//! Thread-local trace recorder.
//!
//! While a [`TraceSession`] is active, every functional op appends an instruction to the
//! session's program. Tensors are identified by their storage identity; operands that were
//! never bound or produced by a traced op are captured as constants.

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;

use anyhow::{anyhow, bail, ensure, Result};

use super::OpKind;
use crate::device::Device;
use crate::plan::program::{Instruction, Operation, Program, ProgramInput, ProgramParam, ValueId};
use crate::tensor::Tensor;

#[derive(Default)]
struct TraceState {
    values: HashMap<u64, ValueId>,
    next_value: u32,
    inputs: Vec<ProgramInput>,
    params: Vec<ProgramParam>,
    body: Vec<Instruction>,
    /// First operation seen that the program cannot express.
    untraceable: Option<String>,
}

impl TraceState {
    fn fresh(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    fn value_of(&mut self, tensor: &Tensor) -> ValueId {
        if let Some(&value) = self.values.get(&tensor.id()) {
            return value;
        }
        let id = self.fresh();
        self.body.push(Instruction {
            id,
            op: Operation::Constant(tensor.to_literal()),
            operands: Vec::new(),
        });
        self.values.insert(tensor.id(), id);
        id
    }
}

thread_local! {
    static ACTIVE: RefCell<Option<TraceState>> = const { RefCell::new(None) };
}

pub fn is_tracing() -> bool {
    ACTIVE.with(|slot| slot.borrow().is_some())
}

/// Whether `tensor` is a bound input, a parameter, or the result of a recorded op.
pub(crate) fn is_traced(tensor: &Tensor) -> bool {
    ACTIVE.with(|slot| {
        slot.borrow()
            .as_ref()
            .is_some_and(|state| state.values.contains_key(&tensor.id()))
    })
}

/// Marks the active trace as unexportable. The first reason wins and is reported by
/// [`TraceSession::finish`].
pub(crate) fn reject(reason: impl FnOnce() -> String) {
    ACTIVE.with(|slot| {
        if let Some(state) = slot.borrow_mut().as_mut() {
            state.untraceable.get_or_insert_with(reason);
        }
    });
}

pub(crate) fn record(op: &OpKind, operands: &[&Tensor], output: &Tensor) {
    ACTIVE.with(|slot| {
        let mut slot = slot.borrow_mut();
        let Some(state) = slot.as_mut() else {
            return;
        };
        let operands = operands
            .iter()
            .map(|tensor| state.value_of(tensor))
            .collect();
        let id = state.fresh();
        state.body.push(Instruction {
            id,
            op: Operation::Apply(op.clone()),
            operands,
        });
        state.values.insert(output.id(), id);
    });
}

fn with_state<T>(f: impl FnOnce(&mut TraceState) -> Result<T>) -> Result<T> {
    ACTIVE.with(|slot| {
        let mut slot = slot.borrow_mut();
        let state = slot
            .as_mut()
            .ok_or_else(|| anyhow!("no trace is active on this thread"))?;
        f(state)
    })
}

/// Scope of one export trace. Dropping the session discards whatever was recorded.
pub struct TraceSession {
    _thread_bound: PhantomData<*const ()>,
}

impl TraceSession {
    pub fn begin() -> Result<Self> {
        ACTIVE.with(|slot| {
            let mut slot = slot.borrow_mut();
            ensure!(slot.is_none(), "a trace is already active on this thread");
            *slot = Some(TraceState::default());
            Ok(())
        })?;
        Ok(TraceSession {
            _thread_bound: PhantomData,
        })
    }

    /// Registers a model input. Each input must be a distinct tensor. `requires_grad` is the
    /// caller's flag, which may differ from the traced copy's under `no_grad`.
    pub fn bind_input(&mut self, name: &str, tensor: &Tensor, requires_grad: bool) -> Result<ValueId> {
        with_state(|state| {
            if state.values.contains_key(&tensor.id()) {
                bail!("input '{name}' aliases a tensor that is already bound in this trace");
            }
            let value = state.fresh();
            state.values.insert(tensor.id(), value);
            state.inputs.push(ProgramInput {
                name: name.to_string(),
                value,
                shape: tensor.shape().clone(),
                requires_grad,
            });
            Ok(value)
        })
    }

    /// Registers a model parameter. Tied parameters share one value.
    pub fn bind_param(&mut self, name: &str, tensor: &Tensor, trainable: bool) -> Result<ValueId> {
        with_state(|state| {
            let value = match state.values.get(&tensor.id()) {
                Some(&existing) => existing,
                None => {
                    let value = state.fresh();
                    state.values.insert(tensor.id(), value);
                    value
                }
            };
            state.params.push(ProgramParam {
                name: name.to_string(),
                value,
                shape: tensor.shape().clone(),
                trainable,
            });
            Ok(value)
        })
    }

    /// Ends the trace and assembles the recorded program.
    pub fn finish(self, device: Device, outputs: &[&Tensor]) -> Result<Program> {
        let mut state = ACTIVE
            .with(|slot| slot.borrow_mut().take())
            .ok_or_else(|| anyhow!("no trace is active on this thread"))?;
        if let Some(reason) = state.untraceable.take() {
            bail!("cannot export forward: {reason}");
        }
        let outputs = outputs
            .iter()
            .map(|tensor| state.value_of(tensor))
            .collect();
        let mut program = Program::new(device);
        program.inputs = state.inputs;
        program.params = state.params;
        program.body = state.body;
        program.outputs = outputs;
        Ok(program)
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        ACTIVE.with(|slot| slot.borrow_mut().take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::functional;
    use crate::tensor::Shape;

    #[test]
    fn records_ops_between_bound_values() -> Result<()> {
        let x = Tensor::ones(Shape::new([1, 2]));
        let w = Tensor::ones(Shape::new([2, 3]));
        let mut session = TraceSession::begin()?;
        let x_id = session.bind_input("input1", &x, false)?;
        let w_id = session.bind_param("fc.weight", &w, true)?;
        let y = functional::relu(&functional::matmul(&x, &w)?)?;
        let program = session.finish(Device::cpu(), &[&y])?;

        assert_eq!(program.body.len(), 2);
        assert_eq!(program.body[0].operands, vec![x_id, w_id]);
        assert_eq!(program.body[0].op, Operation::Apply(OpKind::MatMul));
        assert_eq!(program.outputs, vec![program.body[1].id]);
        assert!(!is_tracing());
        Ok(())
    }

    #[test]
    fn unbound_operands_become_constants() -> Result<()> {
        let x = Tensor::ones(Shape::new([2]));
        let offset = Tensor::full(Shape::new([2]), 3.0);
        let mut session = TraceSession::begin()?;
        session.bind_input("x", &x, false)?;
        let y = functional::add(&x, &offset)?;
        let program = session.finish(Device::cpu(), &[&y])?;
        assert!(matches!(program.body[0].op, Operation::Constant(_)));
        Ok(())
    }

    #[test]
    fn nested_sessions_are_rejected() -> Result<()> {
        let _session = TraceSession::begin()?;
        assert!(TraceSession::begin().is_err());
        Ok(())
    }

    #[test]
    fn dropping_a_session_clears_the_recorder() -> Result<()> {
        {
            let _session = TraceSession::begin()?;
            assert!(is_tracing());
        }
        assert!(!is_tracing());
        Ok(())
    }

    #[test]
    fn aliased_inputs_are_rejected() -> Result<()> {
        let x = Tensor::ones(Shape::new([2]));
        let mut session = TraceSession::begin()?;
        session.bind_input("a", &x, false)?;
        assert!(session.bind_input("b", &x, false).is_err());
        Ok(())
    }

    #[test]
    fn passthrough_output_maps_to_input_value() -> Result<()> {
        let x = Tensor::ones(Shape::new([2]));
        let mut session = TraceSession::begin()?;
        let x_id = session.bind_input("x", &x, false)?;
        let program = session.finish(Device::cpu(), &[&x])?;
        assert!(program.body.is_empty());
        assert_eq!(program.outputs, vec![x_id]);
        Ok(())
    }

    #[test]
    fn detach_of_a_bound_value_is_recorded() -> Result<()> {
        let x = Tensor::ones(Shape::new([2]));
        let mut session = TraceSession::begin()?;
        let x_id = session.bind_input("x", &x, false)?;
        let y = functional::relu(&x.detach())?;
        let program = session.finish(Device::cpu(), &[&y])?;
        assert_eq!(program.body.len(), 2);
        assert_eq!(program.body[0].op, Operation::Apply(OpKind::Detach));
        assert_eq!(program.body[0].operands, vec![x_id]);
        assert!(program
            .body
            .iter()
            .all(|inst| !matches!(inst.op, Operation::Constant(_))));
        Ok(())
    }

    #[test]
    fn clearing_requires_grad_on_a_traced_value_detaches() -> Result<()> {
        let x = Tensor::ones(Shape::new([2]));
        let mut session = TraceSession::begin()?;
        session.bind_input("x", &x, false)?;
        let y = x.clone().requires_grad(false);
        let program = session.finish(Device::cpu(), &[&y])?;
        assert_eq!(program.body.len(), 1);
        assert_eq!(program.body[0].op, Operation::Apply(OpKind::Detach));
        Ok(())
    }

    #[test]
    fn new_leaf_from_a_traced_value_fails_the_export() -> Result<()> {
        let x = Tensor::ones(Shape::new([2]));
        let mut session = TraceSession::begin()?;
        session.bind_input("x", &x, false)?;
        let y = functional::add_scalar(&x, 1.0)?.requires_grad(true);
        let err = session.finish(Device::cpu(), &[&y]).unwrap_err();
        assert!(err.to_string().starts_with("cannot export forward: requires_grad(true)"));
        assert!(!is_tracing());
        Ok(())
    }

    #[test]
    fn fresh_tensors_may_still_require_grad() -> Result<()> {
        let x = Tensor::ones(Shape::new([2]));
        let mut session = TraceSession::begin()?;
        session.bind_input("x", &x, false)?;
        let scale = Tensor::full(Shape::new([2]), 2.0).requires_grad(true);
        let y = functional::add(&x, &scale)?;
        let program = session.finish(Device::cpu(), &[&y])?;
        assert!(matches!(program.body[0].op, Operation::Constant(_)));
        Ok(())
    }
}
