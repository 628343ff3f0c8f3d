//! Argument binding: maps a call's positional and keyword arguments onto a model's declared
//! inputs.

mod args;
mod bound;
mod signature;

pub use args::CallArgs;
pub use bound::{BoundInput, BoundInputs};
pub use signature::{InputKind, InputParam, Signature};
