//! Whole-pipeline driver with restart on transient device errors.

use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::TubeConfig,
    cropper::{Cropper, CroppingError, CroppingResult},
    device::{DeviceCapabilities, DeviceError, ExecutionProfile},
    fields::TubeFields,
    kernels::TubeKernels,
    normalizer::FormatNormalizer,
    registry::AllocationRegistry,
    tube_filter::{DualPassTubeFilter, FilterReport},
    volume::IntensityRange,
    volume_loader::{LoadOptions, VolumeLoader, VolumeLoaderError},
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Load(#[from] VolumeLoaderError),

    #[error(transparent)]
    Cropping(CroppingError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Pipeline failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: DeviceError },
}

impl From<CroppingError> for PipelineError {
    fn from(err: CroppingError) -> Self {
        match err {
            CroppingError::Device(err) => PipelineError::Device(err),
            err => PipelineError::Cropping(err),
        }
    }
}

/// One run of the pipeline, numbered from 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attempt(u32);

impl Attempt {
    pub const MAX_RETRIES: u32 = 2;

    pub fn first() -> Self {
        Attempt(1)
    }

    pub fn number(self) -> u32 {
        self.0
    }

    /// The following attempt, if retries remain.
    pub fn next(self) -> Option<Self> {
        (self.0 <= Self::MAX_RETRIES).then_some(Attempt(self.0 + 1))
    }
}

/// Stages the caller should run on the filter output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownstreamRequest {
    pub centerline: bool,
    pub segmentation: bool,
}

impl From<&TubeConfig> for DownstreamRequest {
    fn from(config: &TubeConfig) -> Self {
        Self {
            centerline: !config.tdf_only,
            segmentation: !config.tdf_only && !config.no_segmentation,
        }
    }
}

#[derive(Debug)]
pub struct PipelineOutput {
    pub fields: TubeFields,
    pub cropping: CroppingResult,
    pub spacing: (f32, f32, f32),
    pub range: IntensityRange,
    pub attempts: u32,
    pub report: FilterReport,
    pub downstream: DownstreamRequest,
}

pub struct PipelineSupervisor<K> {
    kernels: K,
    capabilities: DeviceCapabilities,
    config: TubeConfig,
    profile: ExecutionProfile,
    registry: AllocationRegistry,
}

impl<K: TubeKernels> PipelineSupervisor<K> {
    pub fn new(kernels: K, capabilities: DeviceCapabilities, config: TubeConfig) -> Self {
        let profile = ExecutionProfile::resolve(&capabilities, &config);
        let registry = AllocationRegistry::new(capabilities.max_alloc_bytes);
        Self {
            kernels,
            capabilities,
            config,
            profile,
            registry,
        }
    }

    pub fn profile(&self) -> ExecutionProfile {
        self.profile
    }

    pub fn registry(&self) -> &AllocationRegistry {
        &self.registry
    }

    pub fn kernels(&self) -> &K {
        &self.kernels
    }

    /// Process the dataset behind `header`, restarting from the loader on a
    /// transient device error up to [`Attempt::MAX_RETRIES`] times.
    pub fn run(&self, header: &Path) -> Result<PipelineOutput, PipelineError> {
        info!(
            device = %self.capabilities.name,
            kernels = self.kernels.name(),
            max_alloc_bytes = self.capabilities.max_alloc_bytes,
            global_mem_bytes = ?self.capabilities.global_mem_bytes,
            precision = ?self.profile.precision,
            direct_write = self.profile.direct_write,
            "device selected"
        );

        let mut attempt = Attempt::first();
        loop {
            let err = match self.attempt(header, attempt) {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };
            let released = self.registry.release_all();
            match err {
                PipelineError::Device(err) if err.is_transient() => match attempt.next() {
                    Some(next) => {
                        warn!(
                            attempt = attempt.number(),
                            released,
                            error = %err,
                            "transient device error, restarting pipeline"
                        );
                        attempt = next;
                    }
                    None => {
                        return Err(PipelineError::RetriesExhausted {
                            attempts: attempt.number(),
                            last: err,
                        });
                    }
                },
                err => return Err(err),
            }
        }
    }

    fn attempt(&self, header: &Path, attempt: Attempt) -> Result<PipelineOutput, PipelineError> {
        info!(attempt = attempt.number(), header = %header.display(), "starting pipeline");
        let volume = VolumeLoader::load(header, &LoadOptions::from(&self.config))?;
        let (cropped, cropping) = Cropper::crop(&self.kernels, &volume, &self.config)?;
        drop(volume);

        if attempt == Attempt::first() {
            self.warn_on_peak_usage(cropping.dims.voxels());
        }

        let normalized = FormatNormalizer::normalize(&cropped.samples, cropped.range);
        let filter = DualPassTubeFilter::new(&self.kernels, &self.registry, self.profile, &self.config);
        let (fields, report) = filter.run(normalized)?;

        info!(attempts = attempt.number(), "pipeline finished");
        Ok(PipelineOutput {
            fields,
            cropping,
            spacing: cropped.spacing,
            range: cropped.range,
            attempts: attempt.number(),
            report,
            downstream: DownstreamRequest::from(&self.config),
        })
    }

    fn warn_on_peak_usage(&self, voxels: usize) {
        let Some(total) = self.capabilities.global_mem_bytes else {
            return;
        };
        let peak = self.profile.estimated_peak_bytes(voxels);
        if peak > total {
            warn!(
                estimated_peak_bytes = peak,
                global_mem_bytes = total,
                "dataset may not fit in device memory"
            );
        }
    }
}
