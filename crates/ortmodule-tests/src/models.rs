//! Fixture networks exercising each argument-passing convention.

use anyhow::{bail, Result};
use ortmodule_rs::binding::{BoundInputs, Signature};
use ortmodule_rs::module::{Module, ModuleExt, ParamVisitor, ParamVisitorMut};
use ortmodule_rs::nn::{Linear, Relu};
use ortmodule_rs::ops::functional;
use ortmodule_rs::tensor::Tensor;
use rand::Rng;

/// `fc1 -> relu -> fc2`, the body shared by every fixture.
pub struct TwoLayerNet {
    pub fc1: Linear,
    pub relu: Relu,
    pub fc2: Linear,
}

impl TwoLayerNet {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        num_classes: usize,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        Ok(TwoLayerNet {
            fc1: Linear::init(input_size, hidden_size, rng)?,
            relu: Relu,
            fc2: Linear::init(hidden_size, num_classes, rng)?,
        })
    }

    pub fn project(&self, input: &Tensor) -> Result<Tensor> {
        let out = self.fc1.forward(input)?;
        let out = self.relu.forward(&out)?;
        self.fc2.forward(&out)
    }

    fn visit(&self, v: &mut ParamVisitor<'_>) -> Result<()> {
        v.scoped("fc1", |v| self.fc1.visit_params(v))?;
        v.scoped("fc2", |v| self.fc2.visit_params(v))
    }

    fn visit_mut(&mut self, v: &mut ParamVisitorMut<'_>) -> Result<()> {
        v.scoped("fc1", |v| self.fc1.visit_params_mut(v))?;
        v.scoped("fc2", |v| self.fc2.visit_params_mut(v))
    }
}

fn sum_present(inputs: &[Option<&Tensor>]) -> Result<Tensor> {
    let present: Vec<&Tensor> = inputs.iter().flatten().copied().collect();
    if present.is_empty() {
        bail!("at least one of x, y, z must be provided");
    }
    functional::stack_sum(&present)
}

macro_rules! two_layer_fixture {
    ($name:ident) => {
        impl $name {
            pub fn new(
                input_size: usize,
                hidden_size: usize,
                num_classes: usize,
                rng: &mut impl Rng,
            ) -> Result<Self> {
                Ok($name {
                    net: TwoLayerNet::new(input_size, hidden_size, num_classes, rng)?,
                })
            }
        }
    };
}

/// `forward(input1)`.
pub struct NeuralNetSinglePositionalArgument {
    pub net: TwoLayerNet,
}

two_layer_fixture!(NeuralNetSinglePositionalArgument);

impl Module for NeuralNetSinglePositionalArgument {
    fn signature(&self) -> Signature {
        Signature::new().positional("input1")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        self.net.project(inputs.tensor("input1")?)
    }

    fn visit_params(&self, v: &mut ParamVisitor<'_>) -> Result<()> {
        self.net.visit(v)
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_>) -> Result<()> {
        self.net.visit_mut(v)
    }
}

/// `forward(input1, input2)` on `input1 + input2`.
pub struct NeuralNetMultiplePositionalArguments {
    pub net: TwoLayerNet,
}

two_layer_fixture!(NeuralNetMultiplePositionalArguments);

impl Module for NeuralNetMultiplePositionalArguments {
    fn signature(&self) -> Signature {
        Signature::new().positional("input1").positional("input2")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        let model_input = functional::add(inputs.tensor("input1")?, inputs.tensor("input2")?)?;
        self.net.project(&model_input)
    }

    fn visit_params(&self, v: &mut ParamVisitor<'_>) -> Result<()> {
        self.net.visit(v)
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_>) -> Result<()> {
        self.net.visit_mut(v)
    }
}

/// `forward(*model_inputs)` on the sum of the stacked inputs.
pub struct NeuralNetPositionalArguments {
    pub net: TwoLayerNet,
}

two_layer_fixture!(NeuralNetPositionalArguments);

impl Module for NeuralNetPositionalArguments {
    fn signature(&self) -> Signature {
        Signature::new().var_positional("model_inputs")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        let model_input = functional::stack_sum(&inputs.variadic("model_inputs"))?;
        self.net.project(&model_input)
    }

    fn visit_params(&self, v: &mut ParamVisitor<'_>) -> Result<()> {
        self.net.visit(v)
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_>) -> Result<()> {
        self.net.visit_mut(v)
    }
}

/// `forward(x=None, y=None, z=None)` on the sum of the inputs that were supplied.
pub struct NeuralNetKeywordArguments {
    pub net: TwoLayerNet,
}

two_layer_fixture!(NeuralNetKeywordArguments);

impl Module for NeuralNetKeywordArguments {
    fn signature(&self) -> Signature {
        Signature::new().optional("x").optional("y").optional("z")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        let model_input = sum_present(&[inputs.get("x"), inputs.get("y"), inputs.get("z")])?;
        self.net.project(&model_input)
    }

    fn visit_params(&self, v: &mut ParamVisitor<'_>) -> Result<()> {
        self.net.visit(v)
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_>) -> Result<()> {
        self.net.visit_mut(v)
    }
}

/// `forward(model_input, x=None, y=None, z=None)`.
pub struct NeuralNetPositionalAndKeywordArguments {
    pub net: TwoLayerNet,
}

two_layer_fixture!(NeuralNetPositionalAndKeywordArguments);

impl Module for NeuralNetPositionalAndKeywordArguments {
    fn signature(&self) -> Signature {
        Signature::new()
            .positional("model_input")
            .optional("x")
            .optional("y")
            .optional("z")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        let extra = sum_present(&[inputs.get("x"), inputs.get("y"), inputs.get("z")])?;
        let model_input = functional::add(inputs.tensor("model_input")?, &extra)?;
        self.net.project(&model_input)
    }

    fn visit_params(&self, v: &mut ParamVisitor<'_>) -> Result<()> {
        self.net.visit(v)
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_>) -> Result<()> {
        self.net.visit_mut(v)
    }
}

/// Returns its input unchanged and owns no tensors.
pub struct Identity;

impl Module for Identity {
    fn signature(&self) -> Signature {
        Signature::new().positional("x")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        Ok(inputs.tensor("x")?.clone())
    }
}

/// A parameterless layer held as a child module.
pub struct ReluNet {
    pub fc1: Relu,
}

impl Module for ReluNet {
    fn signature(&self) -> Signature {
        Signature::new().positional("x")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        self.fc1.forward(inputs.tensor("x")?)
    }
}

/// Owns trainable layers but never uses them.
pub struct UnusedParametersNet {
    pub net: TwoLayerNet,
}

two_layer_fixture!(UnusedParametersNet);

impl Module for UnusedParametersNet {
    fn signature(&self) -> Signature {
        Signature::new().positional("input1")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        Ok(inputs.tensor("input1")?.clone())
    }

    fn visit_params(&self, v: &mut ParamVisitor<'_>) -> Result<()> {
        self.net.visit(v)
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_>) -> Result<()> {
        self.net.visit_mut(v)
    }
}

/// Ways of placing a layer on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Cpu,
    Cuda,
    ToCpu,
    ToCuda,
}

impl Placement {
    fn place(self, layer: Linear) -> Result<Linear> {
        match self {
            Placement::Cpu => layer.cpu(),
            Placement::Cuda => layer.cuda(),
            Placement::ToCpu => layer.to("cpu"),
            Placement::ToCuda => layer.to("cuda"),
        }
    }
}

/// Two stacked `10 -> 10` layers placed independently.
pub struct MultipleDeviceModel {
    pub fc1: Linear,
    pub fc2: Linear,
}

impl MultipleDeviceModel {
    pub fn new(first: Placement, second: Placement, rng: &mut impl Rng) -> Result<Self> {
        Ok(MultipleDeviceModel {
            fc1: first.place(Linear::init(10, 10, rng)?)?,
            fc2: second.place(Linear::init(10, 10, rng)?)?,
        })
    }
}

impl Module for MultipleDeviceModel {
    fn signature(&self) -> Signature {
        Signature::new().positional("x")
    }

    fn forward(&self, inputs: &BoundInputs) -> Result<Tensor> {
        let x = self.fc1.forward(inputs.tensor("x")?)?;
        self.fc2.forward(&x)
    }

    fn visit_params(&self, v: &mut ParamVisitor<'_>) -> Result<()> {
        v.scoped("fc1", |v| self.fc1.visit_params(v))?;
        v.scoped("fc2", |v| self.fc2.visit_params(v))
    }

    fn visit_params_mut(&mut self, v: &mut ParamVisitorMut<'_>) -> Result<()> {
        v.scoped("fc1", |v| self.fc1.visit_params_mut(v))?;
        v.scoped("fc2", |v| self.fc2.visit_params_mut(v))
    }
}
