use anyhow::Result;

use crate::binding::{BoundInputs, Signature};
use crate::module::Module;
use crate::ops::functional;
use crate::tensor::Tensor;

/// Parameterless rectifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

impl Relu {
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        functional::relu(input)
    }
}

impl Module for Relu {
    fn signature(&self) -> Signature {
        Signature::new().positional("input")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        Relu::forward(self, inputs.tensor("input")?)
    }
}
