//! Differentiable tensor operations and the trace recorder that turns them into programs.

pub mod functional;
pub mod trace;

use serde::{Deserialize, Serialize};

use crate::device::Device;

/// Operation kinds shared by the autograd graph and exported programs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Add,
    AddScalar(f32),
    MulScalar(f32),
    /// Sum over a stack of same-shaped operands.
    StackSum,
    MatMul,
    /// `x[..., n] + bias[n]`.
    AddBias,
    Relu,
    /// Reduces every element to a scalar.
    Sum,
    ToDevice(Device),
    /// Identity on values; gradients stop here.
    Detach,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::AddScalar(_) => "add_scalar",
            OpKind::MulScalar(_) => "mul_scalar",
            OpKind::StackSum => "stack_sum",
            OpKind::MatMul => "matmul",
            OpKind::AddBias => "add_bias",
            OpKind::Relu => "relu",
            OpKind::Sum => "sum",
            OpKind::ToDevice(_) => "to_device",
            OpKind::Detach => "detach",
        }
    }
}
