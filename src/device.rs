use thiserror::Error;

use crate::{config::TubeConfig, enums::VectorPrecision};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Allocation of {requested} bytes for {label} exceeds the device limit of {max_alloc} bytes")]
    Allocation {
        label: &'static str,
        requested: u64,
        max_alloc: u64,
    },

    /// The command queue became unusable; a fresh run may succeed.
    #[error("Device queue lost: {0}")]
    TransientQueue(String),

    #[error("Device error: {0}")]
    Other(String),
}

impl DeviceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::TransientQueue(_))
    }
}

/// What the selected device can do, queried once per run.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceCapabilities {
    pub name: String,
    /// Largest single allocation in bytes
    pub max_alloc_bytes: u64,
    /// Kernels may write 3D images directly instead of staging through buffers
    pub supports_3d_write: bool,
    /// Total device memory, when the backend reports it
    pub global_mem_bytes: Option<u64>,
}

impl DeviceCapabilities {
    /// Descriptor for the host kernels, optionally with a simulated allocation cap.
    pub fn host(max_alloc_bytes: Option<u64>) -> Self {
        Self {
            name: "host".to_string(),
            max_alloc_bytes: max_alloc_bytes.unwrap_or(u64::MAX),
            supports_3d_write: true,
            global_mem_bytes: None,
        }
    }
}

/// Capability and configuration decisions resolved once at pipeline start.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExecutionProfile {
    pub precision: VectorPrecision,
    /// Producing kernels write the target volume directly
    pub direct_write: bool,
    pub max_alloc_bytes: u64,
}

impl ExecutionProfile {
    /// Explicit `32bit-vectors`/`16bit-vectors` win in that order; otherwise devices
    /// with direct 3D writes use 16-bit vectors and staging devices use 32-bit.
    pub fn resolve(capabilities: &DeviceCapabilities, config: &TubeConfig) -> Self {
        let direct_write = capabilities.supports_3d_write && !config.buffers_only;
        let precision = if config.vectors_32bit {
            VectorPrecision::Float32
        } else if config.vectors_16bit || direct_write {
            VectorPrecision::Snorm16
        } else {
            VectorPrecision::Float32
        };
        Self {
            precision,
            direct_write,
            max_alloc_bytes: capabilities.max_alloc_bytes,
        }
    }

    /// Rough peak device usage of one run: ten vector-sized values per voxel.
    pub fn estimated_peak_bytes(&self, voxels: usize) -> u64 {
        voxels as u64 * 10 * self.precision.component_bytes() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staging_device() -> DeviceCapabilities {
        DeviceCapabilities {
            supports_3d_write: false,
            ..DeviceCapabilities::host(Some(1 << 20))
        }
    }

    #[test]
    fn precision_follows_write_support() {
        let config = TubeConfig::default();
        let direct = ExecutionProfile::resolve(&DeviceCapabilities::host(None), &config);
        assert!(direct.direct_write);
        assert_eq!(direct.precision, VectorPrecision::Snorm16);

        let staged = ExecutionProfile::resolve(&staging_device(), &config);
        assert!(!staged.direct_write);
        assert_eq!(staged.precision, VectorPrecision::Float32);
        assert_eq!(staged.max_alloc_bytes, 1 << 20);
    }

    #[test]
    fn explicit_precision_and_buffers_only() {
        let config = TubeConfig {
            vectors_16bit: true,
            ..TubeConfig::default()
        };
        let staged = ExecutionProfile::resolve(&staging_device(), &config);
        assert_eq!(staged.precision, VectorPrecision::Snorm16);

        let config = TubeConfig {
            vectors_32bit: true,
            buffers_only: true,
            ..TubeConfig::default()
        };
        let forced = ExecutionProfile::resolve(&DeviceCapabilities::host(None), &config);
        assert!(!forced.direct_write);
        assert_eq!(forced.precision, VectorPrecision::Float32);
    }

    #[test]
    fn only_queue_loss_is_transient() {
        assert!(DeviceError::TransientQueue("lost".into()).is_transient());
        assert!(!DeviceError::Other("validation".into()).is_transient());
        assert!(
            !DeviceError::Allocation {
                label: "vector field",
                requested: 10,
                max_alloc: 5
            }
            .is_transient()
        );
    }
}
