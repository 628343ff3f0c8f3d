use std::collections::HashMap;

use super::{BackendError, BackendResult, ExecutionBackend};
use crate::ops::functional;
use crate::plan::{Operation, Program, ValueId};
use crate::tensor::Tensor;

/// Interpreter that replays a program with the functional ops, instruction by instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceBackend;

impl ReferenceBackend {
    pub fn new() -> Self {
        ReferenceBackend
    }
}

fn lookup<'a>(env: &'a HashMap<ValueId, Tensor>, id: ValueId) -> BackendResult<&'a Tensor> {
    env.get(&id)
        .ok_or_else(|| BackendError::invalid_program(format!("value {id} used before definition")))
}

impl ExecutionBackend for ReferenceBackend {
    fn backend_name(&self) -> &str {
        "reference"
    }

    fn run_program(&self, program: &Program, entry_inputs: &[Tensor]) -> BackendResult<Vec<Tensor>> {
        if entry_inputs.len() != program.entry_arity() {
            return Err(BackendError::invalid_program(format!(
                "expected {} entry tensors, got {}",
                program.entry_arity(),
                entry_inputs.len()
            )));
        }

        let mut env: HashMap<ValueId, Tensor> = program
            .entry_values()
            .zip(entry_inputs.iter().cloned())
            .collect();

        for inst in &program.body {
            let value = match &inst.op {
                Operation::Constant(literal) => Tensor::from_literal(literal)
                    .map_err(|err| BackendError::op("constant", err))?,
                Operation::Apply(op) => {
                    let operands = inst
                        .operands
                        .iter()
                        .map(|id| lookup(&env, *id))
                        .collect::<BackendResult<Vec<_>>>()?;
                    functional::apply(op, &operands).map_err(|err| BackendError::op(op.name(), err))?
                }
            };
            env.insert(inst.id, value);
        }

        program
            .outputs
            .iter()
            .map(|id| lookup(&env, *id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::ops::OpKind;
    use crate::plan::{Instruction, ProgramInput};
    use crate::tensor::Shape;

    fn double_program() -> Program {
        let mut program = Program::new(Device::cpu());
        program.inputs.push(ProgramInput {
            name: "x".into(),
            value: ValueId(0),
            shape: Shape::new([2]),
            requires_grad: true,
        });
        program.body.push(Instruction {
            id: ValueId(1),
            op: Operation::Apply(OpKind::MulScalar(2.0)),
            operands: vec![ValueId(0)],
        });
        program.outputs.push(ValueId(1));
        program
    }

    #[test]
    fn replays_instructions_with_autograd() -> anyhow::Result<()> {
        let x = Tensor::from_vec(Shape::new([2]), vec![1.0, 2.0])?.requires_grad(true);
        let outputs = ReferenceBackend.run_program(&double_program(), &[x.clone()])?;
        assert_eq!(outputs[0].data(), &[2.0, 4.0]);
        functional::sum(&outputs[0])?.backward()?;
        assert_eq!(x.grad().unwrap().data(), &[2.0, 2.0]);
        Ok(())
    }

    #[test]
    fn rejects_wrong_entry_arity() {
        let err = ReferenceBackend
            .run_program(&double_program(), &[])
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidProgram { .. }));
    }

    #[test]
    fn reports_undefined_values() {
        let mut program = double_program();
        program.body[0].operands = vec![ValueId(9)];
        let x = Tensor::ones(Shape::new([2]));
        let err = ReferenceBackend.run_program(&program, &[x]).unwrap_err();
        assert_eq!(err.to_string(), "invalid program: value %9 used before definition");
    }

    #[test]
    fn op_failures_keep_their_message() {
        let mut program = double_program();
        program.body[0].op = Operation::Apply(OpKind::MatMul);
        program.body[0].operands = vec![ValueId(0), ValueId(0)];
        let x = Tensor::ones(Shape::new([2]));
        let err = ReferenceBackend.run_program(&program, &[x]).unwrap_err();
        assert!(err.to_string().starts_with("matmul expects rank-2 operands"));
    }
}
