//! Device-tagged tensor with gradient tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use anyhow::{ensure, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::shape::Shape;
use crate::autograd::{self, GradNode};
use crate::device::{Device, DeviceTarget};
use crate::ops::{functional, trace};

static TENSOR_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_tensor_id() -> u64 {
    TENSOR_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Dense `f32` payload captured into a program, e.g. a constant created inside `forward`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorLiteral {
    pub shape: Shape,
    pub device: Device,
    pub data: Vec<f32>,
}

/// Tensor whose storage lives on a [`Device`].
///
/// Clones are cheap and share storage, identity, and the gradient buffer. Results of
/// differentiable ops carry an autograd node while grad mode is enabled and any operand
/// requires grad; tensors without a node are leaves.
#[derive(Clone)]
pub struct Tensor {
    inner: Arc<TensorInner>,
}

struct TensorInner {
    id: u64,
    shape: Shape,
    device: Device,
    data: Vec<f32>,
    requires_grad: bool,
    grad: Mutex<Option<Vec<f32>>>,
    node: Option<Arc<GradNode>>,
}

impl Tensor {
    fn build(
        shape: Shape,
        device: Device,
        data: Vec<f32>,
        requires_grad: bool,
        grad: Option<Vec<f32>>,
        node: Option<Arc<GradNode>>,
    ) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: next_tensor_id(),
                shape,
                device: device.normalized(),
                data,
                requires_grad,
                grad: Mutex::new(grad),
                node,
            }),
        }
    }

    pub(crate) fn leaf(shape: Shape, device: Device, data: Vec<f32>, requires_grad: bool) -> Self {
        Tensor::build(shape, device, data, requires_grad, None, None)
    }

    /// Assembles the result of a differentiable op.
    pub(crate) fn from_op(
        shape: Shape,
        device: Device,
        data: Vec<f32>,
        requires_grad: bool,
        node: Option<Arc<GradNode>>,
    ) -> Self {
        Tensor::build(shape, device, data, requires_grad, None, node)
    }

    /// Constructs a CPU tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        ensure!(
            data.len() == shape.num_elements(),
            "tensor data length ({}) does not match shape {:?}",
            data.len(),
            shape.dims()
        );
        Ok(Tensor::leaf(shape, Device::cpu(), data, false))
    }

    /// Rank-0 CPU tensor.
    pub fn scalar(value: f32) -> Self {
        Tensor::leaf(Shape::scalar(), Device::cpu(), vec![value], false)
    }

    pub fn zeros(shape: Shape) -> Self {
        Tensor::full(shape, 0.0)
    }

    pub fn ones(shape: Shape) -> Self {
        Tensor::full(shape, 1.0)
    }

    pub fn full(shape: Shape, value: f32) -> Self {
        let len = shape.num_elements();
        Tensor::leaf(shape, Device::cpu(), vec![value; len], false)
    }

    /// Samples from a normal distribution (`N(0, std^2)`) using the Box-Muller transform.
    pub fn randn(shape: Shape, std: f32, rng: &mut impl Rng) -> Self {
        let len = shape.num_elements();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        Tensor::leaf(shape, Device::cpu(), values, false)
    }

    /// Samples uniformly from `[-bound, bound)`.
    pub fn uniform(shape: Shape, bound: f32, rng: &mut impl Rng) -> Result<Self> {
        ensure!(
            bound.is_finite() && bound > 0.0,
            "uniform bound must be positive and finite, got {bound}"
        );
        let len = shape.num_elements();
        let values = (0..len).map(|_| rng.gen_range(-bound..bound)).collect();
        Ok(Tensor::leaf(shape, Device::cpu(), values, false))
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn node(&self) -> Option<&Arc<GradNode>> {
        self.inner.node.as_ref()
    }

    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    pub fn device(&self) -> Device {
        self.inner.device
    }

    pub fn data(&self) -> &[f32] {
        &self.inner.data
    }

    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// Returns the single value of a one-element tensor.
    pub fn item(&self) -> Result<f32> {
        ensure!(
            self.len() == 1,
            "item() requires a single-element tensor, got shape {:?}",
            self.shape().dims()
        );
        Ok(self.inner.data[0])
    }

    /// Returns a fresh leaf with the same values and the requested gradient flag.
    ///
    /// The result never carries an autograd node, and any accumulated gradient is dropped.
    ///
    /// Inside an export trace, clearing the flag on a traced value is recorded as a detach,
    /// while setting it fails the export: the new leaf could not be recomputed from later
    /// inputs.
    pub fn requires_grad(self, flag: bool) -> Self {
        if trace::is_traced(&self) {
            if !flag {
                return functional::detach(&self);
            }
            trace::reject(|| {
                "requires_grad(true) turns a traced value into a new leaf; create trainable tensors outside forward".to_string()
            });
        }
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => Tensor::leaf(inner.shape, inner.device, inner.data, flag),
            Err(shared) => Tensor::leaf(
                shared.shape.clone(),
                shared.device,
                shared.data.clone(),
                flag,
            ),
        }
    }

    /// Returns the current gradient tracking flag.
    pub fn requires_grad_flag(&self) -> bool {
        self.inner.requires_grad
    }

    pub fn is_leaf(&self) -> bool {
        self.inner.node.is_none()
    }

    /// Leaf copy of the values that does not track gradients.
    pub fn detach(&self) -> Self {
        functional::detach(self)
    }

    /// Gradient accumulated by [`Tensor::backward`], placed on this tensor's device.
    pub fn grad(&self) -> Option<Tensor> {
        let grad = self
            .inner
            .grad
            .lock()
            .expect("gradient buffer mutex poisoned")
            .clone()?;
        Some(Tensor::leaf(
            self.inner.shape.clone(),
            self.inner.device,
            grad,
            false,
        ))
    }

    pub fn zero_grad(&self) {
        *self
            .inner
            .grad
            .lock()
            .expect("gradient buffer mutex poisoned") = None;
    }

    pub(crate) fn accumulate_grad(&self, grad: &[f32]) {
        let mut slot = self
            .inner
            .grad
            .lock()
            .expect("gradient buffer mutex poisoned");
        match slot.as_mut() {
            Some(existing) => {
                for (acc, g) in existing.iter_mut().zip(grad) {
                    *acc += g;
                }
            }
            None => *slot = Some(grad.to_vec()),
        }
    }

    /// Backpropagates from a single-element tensor, seeding the gradient with `1`.
    pub fn backward(&self) -> Result<()> {
        ensure!(
            self.requires_grad_flag(),
            "tensor does not require grad and has no autograd node"
        );
        ensure!(
            self.len() == 1,
            "grad can be implicitly created only for single-element outputs, got shape {:?}",
            self.shape().dims()
        );
        autograd::run_backward(self, vec![1.0])
    }

    /// Backpropagates with an explicit upstream gradient of the same shape.
    pub fn backward_with(&self, grad: &Tensor) -> Result<()> {
        ensure!(
            self.requires_grad_flag(),
            "tensor does not require grad and has no autograd node"
        );
        ensure!(
            grad.shape() == self.shape(),
            "gradient shape {:?} does not match tensor shape {:?}",
            grad.shape().dims(),
            self.shape().dims()
        );
        autograd::run_backward(self, grad.data().to_vec())
    }

    /// Differentiable device transfer. Returns `self` when already on the target device.
    pub fn to<T: DeviceTarget>(&self, target: T) -> Result<Tensor> {
        let device = target.target_device()?;
        if device == self.device() {
            return Ok(self.clone());
        }
        functional::to_device(self, device)
    }

    pub fn cpu(&self) -> Result<Tensor> {
        self.to(Device::cpu())
    }

    pub fn cuda(&self) -> Result<Tensor> {
        self.to(Device::cuda_current())
    }

    /// Leaf copy on `device` that keeps the gradient flag and any accumulated gradient.
    ///
    /// Used for parameter migration, where the moved tensor must stay a leaf.
    pub(crate) fn moved_to(&self, device: Device) -> Result<Tensor> {
        let device = crate::device::ensure_available(device)?;
        if device == self.device() {
            return Ok(self.clone());
        }
        let grad = self
            .inner
            .grad
            .lock()
            .expect("gradient buffer mutex poisoned")
            .clone();
        Ok(Tensor::build(
            self.inner.shape.clone(),
            device,
            self.inner.data.clone(),
            self.inner.requires_grad,
            grad,
            None,
        ))
    }

    /// Copy with gradient tracking switched to `flag`, keeping the device and accumulated gradient.
    pub(crate) fn with_requires_grad(&self, flag: bool) -> Tensor {
        let grad = if flag {
            self.inner
                .grad
                .lock()
                .expect("gradient buffer mutex poisoned")
                .clone()
        } else {
            None
        };
        Tensor::build(
            self.inner.shape.clone(),
            self.inner.device,
            self.inner.data.clone(),
            flag,
            grad,
            None,
        )
    }

    pub fn to_literal(&self) -> TensorLiteral {
        TensorLiteral {
            shape: self.inner.shape.clone(),
            device: self.inner.device,
            data: self.inner.data.clone(),
        }
    }

    pub fn from_literal(literal: &TensorLiteral) -> Result<Self> {
        ensure!(
            literal.data.len() == literal.shape.num_elements(),
            "literal data length ({}) does not match shape {:?}",
            literal.data.len(),
            literal.shape.dims()
        );
        let device = crate::device::ensure_available(literal.device)?;
        Ok(Tensor::leaf(
            literal.shape.clone(),
            device,
            literal.data.clone(),
            false,
        ))
    }
}

impl From<&Tensor> for Tensor {
    fn from(tensor: &Tensor) -> Self {
        tensor.clone()
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.inner.shape.dims())
            .field("device", &self.inner.device)
            .field("requires_grad", &self.inner.requires_grad)
            .field("is_leaf", &self.is_leaf())
            .finish()
    }
}
