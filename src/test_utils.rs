//! Scriptable kernels for pipeline tests.

use ndarray::Array3;
use std::sync::Mutex;

use crate::{
    device::DeviceError,
    enums::{Axis, GvfVariant},
    fields::{VectorComponent, VectorField},
    kernels::{
        BlurMask, CpuKernels, GvfParams, OccupancyRule, RadiusRange, TdfResponse, TubeKernels,
        VectorFieldParams,
    },
    volume::Samples,
};

/// Response of the small-radius TDF pass in [`FakeKernels`].
pub const SMALL_TDF: f32 = 0.25;
/// Response of the large-radius TDF pass in [`FakeKernels`].
pub const LARGE_TDF: f32 = 0.75;

struct Failure {
    operation: &'static str,
    remaining: usize,
    error: DeviceError,
}

/// Records every call. Occupancy and vector fields come from [`CpuKernels`];
/// blur and GVF pass data through; TDF passes return constant fields. The small
/// pass reports `small_radius`, the large pass its maximum radius.
pub struct FakeKernels {
    calls: Mutex<Vec<String>>,
    small_radius: f32,
    failure: Mutex<Option<Failure>>,
}

impl FakeKernels {
    pub fn new(small_radius: f32) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            small_radius,
            failure: Mutex::new(None),
        }
    }

    /// Fail the next `times` calls of `operation` with `error`.
    pub fn failing(self, operation: &'static str, times: usize, error: DeviceError) -> Self {
        *self.failure.lock().unwrap() = Some(Failure {
            operation,
            remaining: times,
            error,
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, operation: &'static str, detail: String) -> Result<(), DeviceError> {
        self.calls.lock().unwrap().push(detail);
        let mut failure = self.failure.lock().unwrap();
        match failure.as_mut() {
            Some(f) if f.operation == operation && f.remaining > 0 => {
                f.remaining -= 1;
                Err(f.error.clone())
            }
            _ => Ok(()),
        }
    }

    fn constant_response(field: &VectorField, tdf: f32, radius: f32) -> TdfResponse {
        let shape = field.dims().shape();
        TdfResponse {
            tdf: Array3::from_elem(shape, tdf),
            radius: Array3::from_elem(shape, radius),
        }
    }

    fn tdf(&self, field: &VectorField, radii: RadiusRange) -> TdfResponse {
        if radii.max <= 3.0 {
            Self::constant_response(field, SMALL_TDF, self.small_radius)
        } else {
            Self::constant_response(field, LARGE_TDF, radii.max)
        }
    }
}

impl TubeKernels for FakeKernels {
    fn name(&self) -> &str {
        "fake"
    }

    fn scan_line_occupancy(
        &self,
        samples: &Samples,
        axis: Axis,
        rule: OccupancyRule,
    ) -> Result<Vec<u16>, DeviceError> {
        self.record("occupancy", format!("occupancy:{axis:?}"))?;
        CpuKernels.scan_line_occupancy(samples, axis, rule)
    }

    fn gaussian_blur(&self, volume: &Array3<f32>, mask: &BlurMask) -> Result<Array3<f32>, DeviceError> {
        self.record("blur", format!("blur:{}", mask.sigma()))?;
        Ok(volume.clone())
    }

    fn create_vector_field<C: VectorComponent>(
        &self,
        volume: &Array3<f32>,
        params: VectorFieldParams,
        split_z: usize,
        first: &mut [C],
        second: &mut [C],
    ) -> Result<(), DeviceError> {
        self.record("vector field", format!("vector field:{split_z}"))?;
        CpuKernels.create_vector_field(volume, params, split_z, first, second)
    }

    fn gradient_vector_flow(
        &self,
        field: &VectorField,
        variant: GvfVariant,
        _params: GvfParams,
    ) -> Result<VectorField, DeviceError> {
        self.record("gvf", format!("gvf:{variant:?}"))?;
        Ok(field.clone())
    }

    fn circle_fitting_tdf(&self, field: &VectorField, radii: RadiusRange) -> Result<TdfResponse, DeviceError> {
        self.record("tdf", format!("circle:{}-{}", radii.min, radii.max))?;
        Ok(self.tdf(field, radii))
    }

    fn spline_tdf(&self, field: &VectorField, radii: RadiusRange) -> Result<TdfResponse, DeviceError> {
        self.record("tdf", format!("spline:{}-{}", radii.min, radii.max))?;
        Ok(self.tdf(field, radii))
    }
}
