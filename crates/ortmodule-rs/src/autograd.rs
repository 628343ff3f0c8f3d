//! Reverse-mode differentiation over the graph recorded by [`crate::ops`].
//!
//! Each non-leaf tensor keeps a [`GradNode`] naming the op that produced it and the
//! operands it consumed. [`run_backward`] walks that graph in reverse topological order and
//! accumulates gradients into the leaves that requested them.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};

use anyhow::{ensure, Result};

use crate::ops::OpKind;
use crate::tensor::Tensor;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Returns whether ops on this thread currently record autograd nodes.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|flag| flag.get())
}

/// Restores the previous grad mode when dropped.
#[must_use = "grad mode is restored as soon as the guard is dropped"]
pub struct NoGradGuard {
    previous: bool,
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        GRAD_ENABLED.with(|flag| flag.set(self.previous));
    }
}

/// Disables gradient recording on this thread until the guard is dropped.
pub fn no_grad() -> NoGradGuard {
    let previous = GRAD_ENABLED.with(|flag| flag.replace(false));
    NoGradGuard { previous }
}

/// Runs `f` with gradient recording disabled.
pub fn with_no_grad<T>(f: impl FnOnce() -> T) -> T {
    let _guard = no_grad();
    f()
}

pub(crate) struct GradNode {
    op: OpKind,
    inputs: Vec<Tensor>,
}

impl GradNode {
    pub(crate) fn new(op: OpKind, inputs: Vec<Tensor>) -> Self {
        GradNode { op, inputs }
    }
}

/// Post-order over the tensors reachable from `root` that require grad.
fn topological_order(root: &Tensor) -> Vec<Tensor> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(root.clone(), false)];
    while let Some((tensor, expanded)) = stack.pop() {
        if expanded {
            order.push(tensor);
            continue;
        }
        if !visited.insert(tensor.id()) {
            continue;
        }
        stack.push((tensor.clone(), true));
        if let Some(node) = tensor.node() {
            for input in &node.inputs {
                if input.requires_grad_flag() && !visited.contains(&input.id()) {
                    stack.push((input.clone(), false));
                }
            }
        }
    }
    order
}

pub(crate) fn run_backward(root: &Tensor, seed: Vec<f32>) -> Result<()> {
    let order = topological_order(root);
    let mut grads: HashMap<u64, Vec<f32>> = HashMap::new();
    grads.insert(root.id(), seed);

    for tensor in order.iter().rev() {
        let Some(grad) = grads.remove(&tensor.id()) else {
            continue;
        };
        let Some(node) = tensor.node() else {
            tensor.accumulate_grad(&grad);
            continue;
        };
        let input_grads = input_grads(&node.op, &node.inputs, &grad)?;
        ensure!(
            input_grads.len() == node.inputs.len(),
            "{:?} produced {} gradients for {} operands",
            node.op,
            input_grads.len(),
            node.inputs.len()
        );
        for (input, input_grad) in node.inputs.iter().zip(input_grads) {
            if !input.requires_grad_flag() {
                continue;
            }
            match grads.get_mut(&input.id()) {
                Some(existing) => {
                    for (acc, g) in existing.iter_mut().zip(&input_grad) {
                        *acc += g;
                    }
                }
                None => {
                    grads.insert(input.id(), input_grad);
                }
            }
        }
    }
    Ok(())
}

/// Vector-Jacobian products for each operand of `op`.
fn input_grads(op: &OpKind, inputs: &[Tensor], grad: &[f32]) -> Result<Vec<Vec<f32>>> {
    let grads = match op {
        OpKind::Add => vec![grad.to_vec(), grad.to_vec()],
        OpKind::AddScalar(_) | OpKind::ToDevice(_) => vec![grad.to_vec()],
        OpKind::MulScalar(factor) => vec![grad.iter().map(|g| g * factor).collect()],
        OpKind::StackSum => inputs.iter().map(|_| grad.to_vec()).collect(),
        OpKind::Relu => {
            let x = inputs[0].data();
            vec![x
                .iter()
                .zip(grad)
                .map(|(&x, &g)| if x > 0.0 { g } else { 0.0 })
                .collect()]
        }
        OpKind::Sum => vec![vec![grad[0]; inputs[0].len()]],
        OpKind::Detach => vec![vec![0.0; inputs[0].len()]],
        OpKind::AddBias => {
            let bias_len = inputs[1].len();
            let mut bias_grad = vec![0.0; bias_len];
            if bias_len > 0 {
                for row in grad.chunks(bias_len) {
                    for (acc, g) in bias_grad.iter_mut().zip(row) {
                        *acc += g;
                    }
                }
            }
            vec![grad.to_vec(), bias_grad]
        }
        OpKind::MatMul => {
            let (a, b) = (&inputs[0], &inputs[1]);
            let m = a.shape().dims()[0];
            let k = a.shape().dims()[1];
            let n = b.shape().dims()[1];
            let (a, b) = (a.data(), b.data());
            let mut grad_a = vec![0.0; m * k];
            let mut grad_b = vec![0.0; k * n];
            for i in 0..m {
                for p in 0..k {
                    let mut acc = 0.0;
                    for j in 0..n {
                        let g = grad[i * n + j];
                        acc += g * b[p * n + j];
                        grad_b[p * n + j] += a[i * k + p] * g;
                    }
                    grad_a[i * k + p] = acc;
                }
            }
            vec![grad_a, grad_b]
        }
    };
    Ok(grads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::ops::functional;
    use crate::tensor::Shape;

    fn vector(values: &[f32]) -> Tensor {
        Tensor::from_vec(Shape::new([values.len()]), values.to_vec()).unwrap()
    }

    #[test]
    fn no_grad_guard_restores_previous_mode() {
        assert!(is_grad_enabled());
        {
            let _outer = no_grad();
            assert!(!is_grad_enabled());
            {
                let _inner = no_grad();
                assert!(!is_grad_enabled());
            }
            assert!(!is_grad_enabled());
        }
        assert!(is_grad_enabled());
        assert!(!with_no_grad(is_grad_enabled));
    }

    #[test]
    fn ops_under_no_grad_do_not_record_nodes() -> Result<()> {
        let x = vector(&[1.0, 2.0]).requires_grad(true);
        let y = with_no_grad(|| functional::add_scalar(&x, 1.0))?;
        assert!(y.is_leaf());
        assert!(!y.requires_grad_flag());
        Ok(())
    }

    #[test]
    fn gradients_accumulate_across_shared_uses() -> Result<()> {
        let x = vector(&[1.0, -2.0, 3.0]).requires_grad(true);
        let doubled = functional::add(&x, &x)?;
        let loss = functional::sum(&functional::relu(&doubled)?)?;
        loss.backward()?;
        assert_eq!(x.grad().unwrap().data(), &[2.0, 0.0, 2.0]);
        Ok(())
    }

    #[test]
    fn matmul_and_bias_gradients_match_hand_computation() -> Result<()> {
        let x = Tensor::from_vec(Shape::new([1, 2]), vec![1.0, 2.0])?.requires_grad(true);
        let w = Tensor::from_vec(Shape::new([2, 2]), vec![1.0, 0.0, 0.0, 1.0])?.requires_grad(true);
        let b = vector(&[0.5, 0.5]).requires_grad(true);
        let y = functional::add_bias(&functional::matmul(&x, &w)?, &b)?;
        functional::sum(&y)?.backward()?;
        assert_eq!(x.grad().unwrap().data(), &[1.0, 1.0]);
        assert_eq!(w.grad().unwrap().data(), &[1.0, 1.0, 2.0, 2.0]);
        assert_eq!(b.grad().unwrap().data(), &[1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn gradient_returns_to_the_source_device() -> Result<()> {
        let x = vector(&[1.0, 2.0]).requires_grad(true);
        let moved = x.to(Device::cuda(0))?;
        assert_eq!(moved.device(), Device::cuda(0));
        functional::sum(&functional::mul_scalar(&moved, 3.0)?)?.backward()?;
        let grad = x.grad().unwrap();
        assert_eq!(grad.device(), Device::cpu());
        assert_eq!(grad.data(), &[3.0, 3.0]);
        Ok(())
    }

    #[test]
    fn backward_twice_accumulates_into_leaves() -> Result<()> {
        let x = vector(&[1.0]).requires_grad(true);
        functional::sum(&x)?.backward()?;
        functional::sum(&x)?.backward()?;
        assert_eq!(x.grad().unwrap().data(), &[2.0]);
        x.zero_grad();
        assert!(x.grad().is_none());
        Ok(())
    }

    #[test]
    fn backward_rejects_untracked_and_non_scalar_roots() {
        let plain = vector(&[1.0]);
        assert!(plain.backward().is_err());
        let wide = vector(&[1.0, 2.0]).requires_grad(true);
        assert!(wide.backward().is_err());
    }
}
