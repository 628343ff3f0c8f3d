//! Neural network layers usable as [`crate::module::Module`]s or as building blocks inside one.

pub mod linear;
pub mod relu;

pub use linear::Linear;
pub use relu::Relu;
