pub mod autograd;
pub mod backend;
pub mod binding;
pub mod device;
pub mod device_tracker;
mod env;
pub mod error;
pub mod module;
pub mod nn;
pub mod ops;
pub mod plan;
pub mod tensor;
pub mod wrapper;

pub use backend::{BackendError, BackendResult, ExecutionBackend, ReferenceBackend};
pub use binding::{BoundInputs, CallArgs, Signature};
pub use device::{Device, DeviceKind, DeviceTarget};
pub use error::WrapperError;
pub use module::{Module, ModuleExt};
pub use tensor::{Shape, Tensor, TensorOps};
pub use wrapper::{OrtModule, OrtModuleOptions};
