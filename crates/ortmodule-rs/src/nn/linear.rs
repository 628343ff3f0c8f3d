//! Linear projection layer built on the functional ops.

use std::fmt;

use anyhow::{ensure, Result};
use rand::Rng;

use crate::binding::{BoundInputs, Signature};
use crate::module::{Module, ParamVisitor, ParamVisitorMut, TensorRole};
use crate::ops::functional;
use crate::tensor::{Shape, Tensor, TensorOps};

/// Fully connected layer `y = x W + b` with `W` stored as `[in_features, out_features]`.
#[derive(Clone)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Linear {
    /// Wraps existing tensors as a layer. The tensors keep their own `requires_grad` flags.
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let weight_dims = weight.shape().dims();
        ensure!(
            weight_dims.len() == 2,
            "linear weight must be 2D, got {:?}",
            weight_dims
        );
        if let Some(bias) = &bias {
            ensure!(
                bias.shape().dims() == [weight_dims[1]],
                "linear bias must have shape [{}], got {:?}",
                weight_dims[1],
                bias.shape().dims()
            );
            ensure!(
                bias.device() == weight.device(),
                "linear bias lives on {} but weight lives on {}",
                bias.device(),
                weight.device()
            );
        }
        Ok(Self { weight, bias })
    }

    /// Trainable layer on the CPU initialised from `U(-1/sqrt(in), 1/sqrt(in))`.
    pub fn init(in_features: usize, out_features: usize, rng: &mut impl Rng) -> Result<Self> {
        ensure!(
            in_features > 0 && out_features > 0,
            "linear layer needs positive feature counts, got {in_features}x{out_features}"
        );
        let bound = 1.0 / (in_features as f32).sqrt();
        let weight = Tensor::uniform(Shape::new([in_features, out_features]), bound, rng)?;
        let bias = Tensor::uniform(Shape::new([out_features]), bound, rng)?;
        Linear::new(weight.requires_grad(true), Some(bias.requires_grad(true)))
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape().dims()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape().dims()[1]
    }

    /// Projects a `[batch, in_features]` input.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let dims = input.shape().dims();
        ensure!(
            dims.len() == 2,
            "linear expects 2D input, got shape {:?}",
            dims
        );
        ensure!(
            dims[1] == self.in_features(),
            "input features ({}) must match weight rows ({})",
            dims[1],
            self.in_features()
        );
        let output = input.matmul(&self.weight)?;
        match &self.bias {
            Some(bias) => functional::add_bias(&output, bias),
            None => Ok(output),
        }
    }
}

impl Module for Linear {
    fn signature(&self) -> Signature {
        Signature::new().positional("input")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        Linear::forward(self, inputs.tensor("input")?)
    }

    fn visit_params(&self, v: &mut ParamVisitor<'_>) -> Result<()> {
        v.param("weight", TensorRole::Parameter, &self.weight)?;
        if let Some(bias) = &self.bias {
            v.param("bias", TensorRole::Parameter, bias)?;
        }
        Ok(())
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_>) -> Result<()> {
        v.param("weight", TensorRole::Parameter, &mut self.weight)?;
        if let Some(bias) = self.bias.as_mut() {
            v.param("bias", TensorRole::Parameter, bias)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Linear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features())
            .field("out_features", &self.out_features())
            .field("bias", &self.bias.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn forward_applies_weight_and_bias() -> Result<()> {
        let weight = Tensor::from_vec(Shape::new([2, 1]), vec![2.0, 3.0])?;
        let bias = Tensor::from_vec(Shape::new([1]), vec![1.0])?;
        let layer = Linear::new(weight, Some(bias))?;
        let x = Tensor::from_vec(Shape::new([2, 2]), vec![1.0, 1.0, 0.0, 2.0])?;
        assert_eq!(Linear::forward(&layer, &x)?.data(), &[6.0, 7.0]);
        Ok(())
    }

    #[test]
    fn init_produces_trainable_parameters() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = Linear::init(4, 3, &mut rng)?;
        assert_eq!((layer.in_features(), layer.out_features()), (4, 3));
        let params = layer.named_parameters()?;
        assert_eq!(params.len(), 2);
        assert!(params.iter().all(|(_, p)| p.requires_grad_flag()));
        assert!(layer.weight.data().iter().all(|v| v.abs() <= 0.5));
        Ok(())
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let weight = Tensor::zeros(Shape::new([2, 3]));
        assert!(Linear::new(weight.clone(), Some(Tensor::zeros(Shape::new([2])))).is_err());
        let layer = Linear::new(weight, None).unwrap();
        assert!(Linear::forward(&layer, &Tensor::zeros(Shape::new([1, 3]))).is_err());
        assert!(Linear::forward(&layer, &Tensor::zeros(Shape::new([3]))).is_err());
    }
}
