//! # Tube-volume library
//!
//! This crate enhances tubular structures (airways, vessels) in 3D medical
//! volumes. A MetaImage dataset is loaded, cropped to the region of interest,
//! normalized and passed through a two-pass tube detection filter that
//! produces, for every voxel:
//!  - a tube detection filter (TDF) response in `[0, 1]`
//!  - the estimated tube radius
//!  - the gradient vector field after gradient vector flow
//!
//! The pipeline is aware of device memory. Vector fields are stored with
//! 16-bit normalized components where the device allows it, and are
//! produced in two halves when a single allocation would exceed the device
//! limit. Transient device failures restart the whole pipeline up to two
//! times, releasing every allocation of the failed attempt.
//!
//! Kernels are pluggable through [`TubeKernels`]: [`CpuKernels`] runs on the
//! host using rayon, [`GpuKernels`] uses wgpu compute shaders.
//!
//! # Examples
//!
//! ## Enhancing the airways of a lung CT
//!
//! ```no_run
//! # use tube_volume::{CpuKernels, DeviceCapabilities, PipelineSupervisor, Preset, TubeConfig};
//! # use std::path::Path;
//! let config = TubeConfig::for_preset(Preset::LungAirwaysCt);
//! let supervisor = PipelineSupervisor::new(CpuKernels, DeviceCapabilities::host(None), config);
//! let output = supervisor
//!     .run(Path::new("lungs.mhd"))
//!     .expect("should have processed the dataset");
//! let tdf = output.fields.tdf.to_f32();
//! ```

pub mod config;
pub mod cropper;
pub mod device;
pub mod enums;
pub mod fields;
pub mod gpu_kernels;
pub mod kernels;
pub mod metaimage;
pub mod normalizer;
pub mod planner;
pub mod registry;
pub mod supervisor;
pub mod tube_filter;
pub mod volume;
pub mod volume_loader;

#[cfg(test)]
mod test_utils;

pub use config::TubeConfig;
pub use device::{DeviceCapabilities, DeviceError};
pub use enums::Preset;
pub use gpu_kernels::{GpuContext, GpuKernels};
pub use kernels::{CpuKernels, TubeKernels};
pub use supervisor::{PipelineError, PipelineOutput, PipelineSupervisor};
