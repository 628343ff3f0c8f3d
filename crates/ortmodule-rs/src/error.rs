//! Typed errors surfaced by the wrapper.
//!
//! Fallible APIs return `anyhow::Result`; callers that need to branch on a failure kind can
//! `downcast_ref::<WrapperError>()` the returned error.

use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WrapperError {
    /// Parameters of the wrapped model were found on more than one device at wrap time.
    #[error("ORTModule supports a single device per model for now")]
    MultipleDevices { devices: Vec<Device> },

    /// The requested device does not exist in the configured topology.
    #[error("device {device} is not available ({available} accelerator(s) configured)")]
    DeviceUnavailable { device: Device, available: usize },

    /// The call arguments do not fit the wrapped model's declared signature.
    #[error("{0}")]
    Binding(String),
}

impl WrapperError {
    pub(crate) fn binding(message: impl Into<String>) -> Self {
        WrapperError::Binding(message.into())
    }
}
