//! Core tensor abstractions.
//!
//! The tensor module defines shapes and the device-tagged [`Tensor`] that carries gradient
//! state. It re-exports [`TensorOps`] so method-style ops live next to the type consumers
//! manipulate in forward passes.

mod device_tensor;
pub mod shape;

pub use crate::ops::functional::TensorOps;
pub use device_tensor::{Tensor, TensorLiteral};
pub use shape::Shape;
