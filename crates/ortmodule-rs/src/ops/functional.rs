//! Functional ops over [`Tensor`].
//!
//! Every op validates shapes and device placement, computes its result on the host, attaches
//! an autograd node when grad mode is enabled and an operand requires grad, and reports
//! itself to the active trace (if any).

use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Result};

use super::{trace, OpKind};
use crate::autograd::{self, GradNode};
use crate::device::Device;
use crate::tensor::{Shape, Tensor};

fn ensure_same_device(a: &Tensor, b: &Tensor) -> Result<()> {
    ensure!(
        a.device() == b.device(),
        "expected all tensors to be on the same device, but found at least two devices, {} and {}!",
        a.device(),
        b.device()
    );
    Ok(())
}

fn finish(op: OpKind, inputs: &[&Tensor], shape: Shape, device: Device, data: Vec<f32>) -> Tensor {
    let requires_grad =
        autograd::is_grad_enabled() && inputs.iter().any(|tensor| tensor.requires_grad_flag());
    let node = requires_grad.then(|| {
        Arc::new(GradNode::new(
            op.clone(),
            inputs.iter().map(|tensor| (*tensor).clone()).collect(),
        ))
    });
    let output = Tensor::from_op(shape, device, data, requires_grad, node);
    trace::record(&op, inputs, &output);
    output
}

/// Elementwise `a + b`; shapes must match exactly.
pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    ensure_same_device(a, b)?;
    ensure!(
        a.shape() == b.shape(),
        "add shape mismatch: {:?} vs {:?}",
        a.shape().dims(),
        b.shape().dims()
    );
    let data = a.data().iter().zip(b.data()).map(|(x, y)| x + y).collect();
    Ok(finish(OpKind::Add, &[a, b], a.shape().clone(), a.device(), data))
}

pub fn add_scalar(a: &Tensor, value: f32) -> Result<Tensor> {
    let data = a.data().iter().map(|x| x + value).collect();
    Ok(finish(
        OpKind::AddScalar(value),
        &[a],
        a.shape().clone(),
        a.device(),
        data,
    ))
}

pub fn mul_scalar(a: &Tensor, value: f32) -> Result<Tensor> {
    let data = a.data().iter().map(|x| x * value).collect();
    Ok(finish(
        OpKind::MulScalar(value),
        &[a],
        a.shape().clone(),
        a.device(),
        data,
    ))
}

/// Stacks the operands along a new leading axis and sums over it.
pub fn stack_sum(inputs: &[&Tensor]) -> Result<Tensor> {
    let first = inputs
        .first()
        .ok_or_else(|| anyhow!("stack_sum expects a non-empty list of tensors"))?;
    let mut data = first.data().to_vec();
    for tensor in &inputs[1..] {
        ensure_same_device(first, tensor)?;
        ensure!(
            tensor.shape() == first.shape(),
            "stack expects each tensor to be equal size, but got {:?} and {:?}",
            first.shape().dims(),
            tensor.shape().dims()
        );
        for (acc, value) in data.iter_mut().zip(tensor.data()) {
            *acc += value;
        }
    }
    Ok(finish(
        OpKind::StackSum,
        inputs,
        first.shape().clone(),
        first.device(),
        data,
    ))
}

/// Matrix product of `[m, k]` and `[k, n]` operands.
pub fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    ensure_same_device(a, b)?;
    let (a_dims, b_dims) = (a.shape().dims(), b.shape().dims());
    ensure!(
        a_dims.len() == 2 && b_dims.len() == 2,
        "matmul expects rank-2 operands, got {a_dims:?} and {b_dims:?}"
    );
    let (m, k, n) = (a_dims[0], a_dims[1], b_dims[1]);
    ensure!(
        b_dims[0] == k,
        "matmul inner dimensions differ: {a_dims:?} x {b_dims:?}"
    );

    let (lhs, rhs) = (a.data(), b.data());
    let mut data = vec![0.0; m * n];
    for i in 0..m {
        for p in 0..k {
            let scale = lhs[i * k + p];
            for j in 0..n {
                data[i * n + j] += scale * rhs[p * n + j];
            }
        }
    }
    Ok(finish(
        OpKind::MatMul,
        &[a, b],
        Shape::new([m, n]),
        a.device(),
        data,
    ))
}

/// Broadcasts a rank-1 bias over the trailing axis of `x`.
pub fn add_bias(x: &Tensor, bias: &Tensor) -> Result<Tensor> {
    ensure_same_device(x, bias)?;
    ensure!(
        bias.shape().rank() == 1,
        "bias must be rank-1, got {:?}",
        bias.shape().dims()
    );
    ensure!(
        x.shape().rank() >= 1 && x.shape().last_dim() == bias.len(),
        "bias length {} does not match trailing dimension of {:?}",
        bias.len(),
        x.shape().dims()
    );
    let width = bias.len();
    let data = x
        .data()
        .iter()
        .enumerate()
        .map(|(i, value)| value + bias.data()[i % width])
        .collect();
    Ok(finish(
        OpKind::AddBias,
        &[x, bias],
        x.shape().clone(),
        x.device(),
        data,
    ))
}

pub fn relu(x: &Tensor) -> Result<Tensor> {
    let data = x.data().iter().map(|value| value.max(0.0)).collect();
    Ok(finish(OpKind::Relu, &[x], x.shape().clone(), x.device(), data))
}

pub fn sum(x: &Tensor) -> Result<Tensor> {
    let total = x.data().iter().sum();
    Ok(finish(
        OpKind::Sum,
        &[x],
        Shape::scalar(),
        x.device(),
        vec![total],
    ))
}

/// Differentiable copy onto `device`. Always produces a new tensor, even when the device
/// does not change.
pub fn to_device(x: &Tensor, device: Device) -> Result<Tensor> {
    let device = crate::device::ensure_available(device)?;
    Ok(finish(
        OpKind::ToDevice(device),
        &[x],
        x.shape().clone(),
        device,
        x.data().to_vec(),
    ))
}

/// Copy of `x` that never tracks gradients. Traced like any other op, so an exported plan
/// recomputes it from the call's inputs.
pub fn detach(x: &Tensor) -> Tensor {
    let output = Tensor::from_op(x.shape().clone(), x.device(), x.data().to_vec(), false, None);
    trace::record(&OpKind::Detach, &[x], &output);
    output
}

fn operands<'a, const N: usize>(op: &OpKind, operands: &[&'a Tensor]) -> Result<[&'a Tensor; N]> {
    operands.try_into().map_err(|_| {
        anyhow!(
            "{} expects {N} operand(s), got {}",
            op.name(),
            operands.len()
        )
    })
}

/// Dispatches `op` over already-materialized operands.
pub fn apply(op: &OpKind, inputs: &[&Tensor]) -> Result<Tensor> {
    match op {
        OpKind::Add => {
            let [a, b] = operands::<2>(op, inputs)?;
            add(a, b)
        }
        OpKind::AddScalar(value) => {
            let [a] = operands::<1>(op, inputs)?;
            add_scalar(a, *value)
        }
        OpKind::MulScalar(value) => {
            let [a] = operands::<1>(op, inputs)?;
            mul_scalar(a, *value)
        }
        OpKind::StackSum => {
            if inputs.is_empty() {
                bail!("stack_sum expects at least one operand");
            }
            stack_sum(inputs)
        }
        OpKind::MatMul => {
            let [a, b] = operands::<2>(op, inputs)?;
            matmul(a, b)
        }
        OpKind::AddBias => {
            let [x, bias] = operands::<2>(op, inputs)?;
            add_bias(x, bias)
        }
        OpKind::Relu => {
            let [x] = operands::<1>(op, inputs)?;
            relu(x)
        }
        OpKind::Sum => {
            let [x] = operands::<1>(op, inputs)?;
            sum(x)
        }
        OpKind::ToDevice(device) => {
            let [x] = operands::<1>(op, inputs)?;
            to_device(x, *device)
        }
        OpKind::Detach => {
            let [x] = operands::<1>(op, inputs)?;
            Ok(detach(x))
        }
    }
}

/// Method-style access to the functional ops.
pub trait TensorOps {
    fn add(&self, other: &Tensor) -> Result<Tensor>;
    fn add_scalar(&self, value: f32) -> Result<Tensor>;
    fn mul_scalar(&self, value: f32) -> Result<Tensor>;
    fn matmul(&self, other: &Tensor) -> Result<Tensor>;
    fn add_bias(&self, bias: &Tensor) -> Result<Tensor>;
    fn relu(&self) -> Result<Tensor>;
    fn sum(&self) -> Result<Tensor>;
}

impl TensorOps for Tensor {
    fn add(&self, other: &Tensor) -> Result<Tensor> {
        add(self, other)
    }

    fn add_scalar(&self, value: f32) -> Result<Tensor> {
        add_scalar(self, value)
    }

    fn mul_scalar(&self, value: f32) -> Result<Tensor> {
        mul_scalar(self, value)
    }

    fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        matmul(self, other)
    }

    fn add_bias(&self, bias: &Tensor) -> Result<Tensor> {
        add_bias(self, bias)
    }

    fn relu(&self) -> Result<Tensor> {
        relu(self)
    }

    fn sum(&self) -> Result<Tensor> {
        sum(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(dims: &[usize], values: &[f32]) -> Tensor {
        Tensor::from_vec(Shape::new(dims.to_vec()), values.to_vec()).unwrap()
    }

    #[test]
    fn matmul_multiplies_row_major_matrices() -> Result<()> {
        let a = tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = tensor(&[3, 1], &[1.0, 0.0, -1.0]);
        let c = matmul(&a, &b)?;
        assert_eq!(c.shape().dims(), &[2, 1]);
        assert_eq!(c.data(), &[-2.0, -2.0]);
        Ok(())
    }

    #[test]
    fn matmul_rejects_mismatched_inner_dims() {
        let a = tensor(&[2, 3], &[0.0; 6]);
        let b = tensor(&[2, 2], &[0.0; 4]);
        assert!(matmul(&a, &b).is_err());
    }

    #[test]
    fn add_bias_broadcasts_over_rows() -> Result<()> {
        let x = tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = tensor(&[2], &[10.0, 20.0]);
        assert_eq!(add_bias(&x, &b)?.data(), &[11.0, 22.0, 13.0, 24.0]);
        Ok(())
    }

    #[test]
    fn stack_sum_adds_every_operand() -> Result<()> {
        let a = tensor(&[2], &[1.0, 2.0]);
        let b = tensor(&[2], &[3.0, 4.0]);
        let c = tensor(&[2], &[5.0, 6.0]);
        assert_eq!(stack_sum(&[&a, &b, &c])?.data(), &[9.0, 12.0]);
        assert!(stack_sum(&[]).is_err());
        Ok(())
    }

    #[test]
    fn mixed_devices_are_rejected() -> Result<()> {
        let a = tensor(&[2], &[1.0, 2.0]);
        let b = a.to(Device::cuda(0))?;
        let err = add(&a, &b).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("expected all tensors to be on the same device"));
        Ok(())
    }

    #[test]
    fn apply_checks_operand_arity() {
        let a = tensor(&[1], &[1.0]);
        let err = apply(&OpKind::Add, &[&a]).unwrap_err();
        assert!(err.to_string().contains("add expects 2 operand(s), got 1"));
    }

    #[test]
    fn relu_and_sum_reduce_to_scalar() -> Result<()> {
        let x = tensor(&[3], &[-1.0, 2.0, 3.0]);
        let total = x.relu()?.sum()?;
        assert_eq!(total.shape().rank(), 0);
        assert_eq!(total.item()?, 5.0);
        Ok(())
    }
}
