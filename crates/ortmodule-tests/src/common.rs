use std::sync::Arc;

use anyhow::{ensure, Result};
use ortmodule_rs::backend::ExecutionBackend;
use ortmodule_rs::device::{self, Device, DeviceKind, DeviceTarget};
use ortmodule_rs::module::Module;
use ortmodule_rs::tensor::{Shape, Tensor};
use ortmodule_rs::wrapper::OrtModule;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Batch, input, hidden and class sizes used by the fixture networks.
pub const N: usize = 8;
pub const D_IN: usize = 32;
pub const H: usize = 16;
pub const D_OUT: usize = 10;

pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// `[rows, cols]` standard-normal tensor placed on `device`.
pub fn randn_on<T: DeviceTarget>(rows: usize, cols: usize, device: T, rng: &mut StdRng) -> Result<Tensor> {
    Tensor::randn(Shape::new([rows, cols]), 1.0, rng).to(device)
}

/// Resolves `device`, or logs a warning and returns `None` when the accelerator it names is not
/// part of the configured topology.
pub fn accelerator_or_skip(device: &str, test: &str) -> Result<Option<Device>> {
    let parsed = device.parse::<Device>()?.normalized();
    if !device::is_available(&parsed) {
        log::warn!(
            "skipping {test}({device}): only {} accelerator(s) configured",
            device::accelerator_count()
        );
        return Ok(None);
    }
    Ok(Some(parsed))
}

pub fn wrap<M: Module, B: ExecutionBackend + 'static>(
    model: M,
    backend: &Arc<B>,
) -> Result<OrtModule<M, B>> {
    OrtModule::with_backend(model, Arc::clone(backend))
}

/// Checks that every parameter of the wrapped model has the given device kind.
pub fn ensure_parameters_on<M: Module, B: ExecutionBackend>(
    wrapped: &OrtModule<M, B>,
    kind: DeviceKind,
) -> Result<()> {
    for (name, parameter) in wrapped.named_parameters()? {
        ensure!(
            parameter.device().kind() == kind,
            "parameter {name} lives on {}, expected {}",
            parameter.device(),
            kind.as_str()
        );
    }
    Ok(())
}
