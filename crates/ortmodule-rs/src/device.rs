//! Device descriptors, normalization, and the simulated device topology.
//!
//! A [`Device`] names where tensor storage lives. Accelerators are simulated: a tensor on
//! `cuda:N` is host memory tagged with that device, and the number of accelerators comes from
//! `ORTMODULE_ACCELERATOR_COUNT`. Every comparison goes through [`Device::normalized`], so
//! `"cuda"` and `"cuda:0"` compare equal when the default accelerator is `0`.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::WrapperError;
use crate::tensor::Tensor;

/// Kind of compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    /// Accelerator device, spelled `cuda` in device strings.
    Cuda,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
        }
    }
}

/// Device descriptor. Accelerators may omit the index until normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    kind: DeviceKind,
    index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceParseError {
    #[error("expected a device string like 'cpu', 'cuda' or 'cuda:1', got '{0}'")]
    Malformed(String),
    #[error("unknown device type '{0}'")]
    UnknownKind(String),
    #[error("invalid device index '{index}' in '{raw}'")]
    InvalidIndex { raw: String, index: String },
    #[error("cpu devices do not take an index other than 0, got '{0}'")]
    CpuIndex(String),
}

impl Device {
    pub const fn cpu() -> Self {
        Device {
            kind: DeviceKind::Cpu,
            index: None,
        }
    }

    pub const fn cuda(index: usize) -> Self {
        Device {
            kind: DeviceKind::Cuda,
            index: Some(index),
        }
    }

    /// Accelerator without an explicit index; resolves to the default accelerator.
    pub const fn cuda_current() -> Self {
        Device {
            kind: DeviceKind::Cuda,
            index: None,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn is_cpu(&self) -> bool {
        self.kind == DeviceKind::Cpu
    }

    pub fn is_cuda(&self) -> bool {
        self.kind == DeviceKind::Cuda
    }

    /// Canonical form used for every equality check: cpu carries no index, accelerators always
    /// carry one.
    pub fn normalized(self) -> Self {
        Topology::from_env().normalize(self)
    }

    /// Compares two descriptors after normalization.
    pub fn same_as(&self, other: &Device) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::cpu()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}:{index}", self.kind.as_str()),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

impl FromStr for Device {
    type Err = DeviceParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let mut parts = trimmed.splitn(2, ':');
        let kind = parts.next().unwrap_or_default();
        let index = parts.next();
        if kind.is_empty() {
            return Err(DeviceParseError::Malformed(raw.to_string()));
        }

        let index = match index {
            None => None,
            Some(text) => Some(text.parse::<usize>().map_err(|_| {
                DeviceParseError::InvalidIndex {
                    raw: raw.to_string(),
                    index: text.to_string(),
                }
            })?),
        };

        match kind.to_ascii_lowercase().as_str() {
            "cpu" => match index {
                None | Some(0) => Ok(Device::cpu()),
                Some(_) => Err(DeviceParseError::CpuIndex(raw.to_string())),
            },
            "cuda" => Ok(Device {
                kind: DeviceKind::Cuda,
                index,
            }),
            _ => Err(DeviceParseError::UnknownKind(kind.to_string())),
        }
    }
}

/// Accelerator layout that device requests are checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub accelerators: usize,
    /// Index a bare `cuda` resolves to.
    pub default_accelerator: usize,
}

impl Topology {
    /// Layout configured for this process through `ORTMODULE_ACCELERATOR_COUNT` and
    /// `ORTMODULE_DEFAULT_ACCELERATOR`.
    pub fn from_env() -> Self {
        Topology {
            accelerators: crate::env::accelerator_count(),
            default_accelerator: crate::env::default_accelerator(),
        }
    }

    pub fn normalize(&self, device: Device) -> Device {
        match device.kind {
            DeviceKind::Cpu => Device::cpu(),
            DeviceKind::Cuda => Device::cuda(device.index.unwrap_or(self.default_accelerator)),
        }
    }

    pub fn is_available(&self, device: &Device) -> bool {
        let device = self.normalize(*device);
        match device.kind {
            DeviceKind::Cpu => true,
            DeviceKind::Cuda => device.index.is_some_and(|index| index < self.accelerators),
        }
    }

    /// Normalizes `device` and rejects devices outside this layout.
    pub fn ensure_available(&self, device: Device) -> Result<Device> {
        let device = self.normalize(device);
        if !self.is_available(&device) {
            return Err(WrapperError::DeviceUnavailable {
                device,
                available: self.accelerators,
            }
            .into());
        }
        Ok(device)
    }
}

/// Number of simulated accelerators visible to this process.
pub fn accelerator_count() -> usize {
    crate::env::accelerator_count()
}

/// Returns `true` when the (normalized) device exists in the configured topology.
pub fn is_available(device: &Device) -> bool {
    Topology::from_env().is_available(device)
}

/// Normalizes `device` and rejects devices outside the configured topology.
pub fn ensure_available(device: Device) -> Result<Device> {
    Topology::from_env().ensure_available(device)
}

/// Anything that can name a destination device: a [`Device`], a device string, or a donor
/// tensor whose device is copied.
pub trait DeviceTarget {
    /// Resolves the request into a normalized, available device.
    fn target_device(&self) -> Result<Device>;
}

impl DeviceTarget for Device {
    fn target_device(&self) -> Result<Device> {
        ensure_available(*self)
    }
}

impl DeviceTarget for str {
    fn target_device(&self) -> Result<Device> {
        let device: Device = self.parse()?;
        ensure_available(device)
    }
}

impl DeviceTarget for String {
    fn target_device(&self) -> Result<Device> {
        self.as_str().target_device()
    }
}

impl DeviceTarget for Tensor {
    fn target_device(&self) -> Result<Device> {
        ensure_available(self.device())
    }
}

impl<T: DeviceTarget + ?Sized> DeviceTarget for &T {
    fn target_device(&self) -> Result<Device> {
        (**self).target_device()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu_and_cuda_forms() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::cpu());
        assert_eq!("cpu:0".parse::<Device>().unwrap(), Device::cpu());
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::cuda_current());
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::cuda(3));
        assert_eq!(" CUDA:1 ".parse::<Device>().unwrap(), Device::cuda(1));
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!(matches!(
            "tpu".parse::<Device>(),
            Err(DeviceParseError::UnknownKind(_))
        ));
        assert!(matches!(
            "cuda:x".parse::<Device>(),
            Err(DeviceParseError::InvalidIndex { .. })
        ));
        assert!(matches!(
            "cpu:2".parse::<Device>(),
            Err(DeviceParseError::CpuIndex(_))
        ));
        assert!(matches!(
            ":0".parse::<Device>(),
            Err(DeviceParseError::Malformed(_))
        ));
    }

    #[test]
    fn bare_cuda_normalizes_to_default_accelerator() {
        let default = crate::env::default_accelerator();
        assert_eq!(Device::cuda_current().normalized(), Device::cuda(default));
        assert!(Device::cuda_current().same_as(&Device::cuda(default)));
        assert_eq!(Device::cpu().normalized(), Device::cpu());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for device in [Device::cpu(), Device::cuda(0), Device::cuda(7)] {
            let text = device.to_string();
            assert_eq!(text.parse::<Device>().unwrap(), device);
        }
        assert_eq!(Device::cuda_current().to_string(), "cuda");
    }

    #[test]
    fn out_of_range_accelerator_is_unavailable() {
        let missing = Device::cuda(accelerator_count());
        assert!(!is_available(&missing));
        let err = missing.target_device().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WrapperError>(),
            Some(WrapperError::DeviceUnavailable { .. })
        ));
        assert!(is_available(&Device::cpu()));
    }

    #[test]
    fn donor_tensor_resolves_to_its_device() {
        let donor = Tensor::zeros(crate::tensor::Shape::new([2]));
        assert_eq!(donor.target_device().unwrap(), Device::cpu());
        assert_eq!((&donor).target_device().unwrap(), Device::cpu());
    }

    #[test]
    fn multi_accelerator_topology_resolves_indices() -> Result<()> {
        let topology = Topology {
            accelerators: 3,
            default_accelerator: 1,
        };
        assert_eq!(topology.normalize(Device::cuda_current()), Device::cuda(1));
        assert_eq!(topology.normalize(Device::cuda(2)), Device::cuda(2));
        assert!(topology.is_available(&Device::cuda(1)));
        assert!(topology.is_available(&Device::cuda(2)));
        assert!(!topology.is_available(&Device::cuda(3)));
        assert_eq!(topology.ensure_available("cuda".parse()?)?, Device::cuda(1));

        let err = topology.ensure_available(Device::cuda(3)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WrapperError>(),
            Some(WrapperError::DeviceUnavailable { available: 3, .. })
        ));
        Ok(())
    }

    #[test]
    fn default_accelerator_outside_the_layout_is_unavailable() {
        let topology = Topology {
            accelerators: 2,
            default_accelerator: 2,
        };
        assert_eq!(topology.normalize(Device::cuda_current()), Device::cuda(2));
        assert!(!topology.is_available(&Device::cuda_current()));
        assert!(topology.is_available(&Device::cpu()));
    }
}
