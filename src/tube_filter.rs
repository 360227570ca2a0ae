//! Two-pass tube detection.
//!
//! Thin tubes are found on a lightly blurred volume with a plain gradient vector
//! field (small pass); wider tubes on a more blurred volume after gradient vector
//! flow (large pass). Where the small pass estimates a radius below
//! [`SMALL_RADIUS_LIMIT`] its answer wins, elsewhere the large pass does.

use ndarray::{Array3, Array4, Zip};
use std::time::Duration;
use tracing::{debug, info};
use web_time::Instant;

use crate::{
    config::TubeConfig,
    device::{DeviceError, ExecutionProfile},
    enums::{GvfVariant, TdfMethod, VectorPrecision},
    fields::{ScalarField, TubeFields, VectorComponent, VectorField},
    kernels::{BlurMask, GvfParams, RadiusRange, TdfResponse, TubeKernels, VectorFieldParams},
    planner::{BufferPlanner, COMPONENTS, PlanMode, VectorFieldPlan},
    registry::{AllocationKind, AllocationRegistry, Tracked},
    volume::Dims,
};

/// Radius below which the small pass result is kept.
pub const SMALL_RADIUS_LIMIT: f32 = 2.5;
const SMALL_PASS_MAX_RADIUS: f32 = 3.0;
const SMALL_PASS_STEP: f32 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterStage {
    Init,
    SmallPass,
    EarlyExit,
    LargePass,
    Merge,
    Done,
}

/// What a filter run did, in order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterReport {
    pub stages: Vec<FilterStage>,
    /// Vector field plan of the large pass
    pub plan: Option<VectorFieldPlan>,
    pub gvf: Option<GvfVariant>,
    pub tdf: Option<TdfMethod>,
    /// Wall time per stage, filled when `timing` is set
    pub timings: Vec<(FilterStage, Duration)>,
}

impl FilterReport {
    fn enter(&mut self, stage: FilterStage) {
        debug!(?stage, "tube filter");
        self.stages.push(stage);
    }

    pub fn ran(&self, stage: FilterStage) -> bool {
        self.stages.contains(&stage)
    }
}

pub struct DualPassTubeFilter<'a, K> {
    kernels: &'a K,
    registry: &'a AllocationRegistry,
    profile: ExecutionProfile,
    config: &'a TubeConfig,
}

impl<'a, K: TubeKernels> DualPassTubeFilter<'a, K> {
    pub fn new(
        kernels: &'a K,
        registry: &'a AllocationRegistry,
        profile: ExecutionProfile,
        config: &'a TubeConfig,
    ) -> Self {
        Self {
            kernels,
            registry,
            profile,
            config,
        }
    }

    /// Run both passes over a normalized `[z, y, x]` volume.
    pub fn run(&self, volume: Array3<f32>) -> Result<(TubeFields, FilterReport), DeviceError> {
        let config = self.config;
        let dims = Dims::from_shape(volume.dim());
        let mut report = FilterReport::default();
        report.enter(FilterStage::Init);

        let source = self.registry.track(
            "normalized volume",
            AllocationKind::Image,
            scalar_bytes(dims),
            volume,
        )?;

        let small = if config.radius_min < SMALL_RADIUS_LIMIT {
            report.enter(FilterStage::SmallPass);
            let started = Instant::now();

            let blurred = self.blur("small pass blur", &source, config.small_blur)?;
            let plan = BufferPlanner::plan(dims, &self.profile)?;
            let field = self.vector_field(blurred.as_deref().unwrap_or(&source), &plan)?;
            drop(blurred);

            let radii = RadiusRange::new(config.radius_min, SMALL_PASS_MAX_RADIUS, SMALL_PASS_STEP);
            let response = self.track_response(
                "small pass tdf",
                dims,
                self.kernels.circle_fitting_tdf(&field, radii)?,
            )?;
            self.finish_stage(&mut report, FilterStage::SmallPass, started);

            if config.radius_max < SMALL_RADIUS_LIMIT {
                report.enter(FilterStage::EarlyExit);
                drop(source);
                let response = response.into_inner();
                let fields = TubeFields {
                    vector_field: field.into_inner(),
                    tdf: ScalarField::from_f32(&response.tdf, self.profile.precision),
                    radius: response.radius,
                };
                report.enter(FilterStage::Done);
                info!("small radius pass covers the radius range, skipping large pass");
                return Ok((fields, report));
            }
            drop(field);
            Some(response.into_inner())
        } else {
            None
        };

        report.enter(FilterStage::LargePass);
        let started = Instant::now();
        let blurred = self.blur("large pass blur", &source, config.large_blur)?;
        let plan = BufferPlanner::plan(dims, &self.profile)?;
        let field = self.vector_field(blurred.as_deref().unwrap_or(&source), &plan)?;
        drop(blurred);
        drop(source);

        let variant = if config.use_fmg_gvf {
            GvfVariant::Multigrid
        } else if plan.exceeds_capacity() {
            GvfVariant::LowMemory
        } else {
            GvfVariant::Standard
        };
        let gvf_params = GvfParams {
            iterations: config.gvf_iterations,
            mu: config.gvf_mu,
        };
        let flowed = self.registry.track(
            "gvf vector field",
            AllocationKind::Image,
            plan.required_bytes(),
            self.kernels.gradient_vector_flow(&field, variant, gvf_params)?,
        )?;
        drop(field);

        let method = if config.use_spline_tdf {
            TdfMethod::Spline
        } else {
            TdfMethod::CircleFitting
        };
        let radii = RadiusRange::new(
            method.radius_floor().max(config.radius_min),
            config.radius_max,
            config.radius_step,
        );
        let response = match method {
            TdfMethod::CircleFitting => self.kernels.circle_fitting_tdf(&flowed, radii)?,
            TdfMethod::Spline => self.kernels.spline_tdf(&flowed, radii)?,
        };
        let response = self.track_response("large pass tdf", dims, response)?;
        debug!(?variant, ?method, ?radii, "large pass done");
        report.plan = Some(plan);
        report.gvf = Some(variant);
        report.tdf = Some(method);
        self.finish_stage(&mut report, FilterStage::LargePass, started);

        let response = match small {
            Some(small) => {
                report.enter(FilterStage::Merge);
                let started = Instant::now();
                let merged = merge(&small, response.into_inner());
                self.finish_stage(&mut report, FilterStage::Merge, started);
                merged
            }
            None => response.into_inner(),
        };

        report.enter(FilterStage::Done);
        Ok((
            TubeFields {
                vector_field: flowed.into_inner(),
                tdf: ScalarField::from_f32(&response.tdf, self.profile.precision),
                radius: response.radius,
            },
            report,
        ))
    }

    fn finish_stage(&self, report: &mut FilterReport, stage: FilterStage, started: Instant) {
        if self.config.timing {
            let elapsed = started.elapsed();
            info!(?stage, elapsed_ms = elapsed.as_secs_f64() * 1000.0, "stage time");
            report.timings.push((stage, elapsed));
        }
    }

    fn blur(
        &self,
        label: &'static str,
        source: &Array3<f32>,
        sigma: f32,
    ) -> Result<Option<Tracked<Array3<f32>>>, DeviceError> {
        if sigma <= 0.0 {
            return Ok(None);
        }
        let mask = BlurMask::new(sigma);
        let bytes = scalar_bytes(Dims::from_shape(source.dim()));
        let blurred = self.kernels.gaussian_blur(source, &mask)?;
        Ok(Some(self.registry.track(label, AllocationKind::Image, bytes, blurred)?))
    }

    fn track_response(
        &self,
        label: &'static str,
        dims: Dims,
        response: TdfResponse,
    ) -> Result<Tracked<TdfResponse>, DeviceError> {
        self.registry
            .track(label, AllocationKind::Image, 2 * scalar_bytes(dims), response)
    }

    fn vector_field(
        &self,
        volume: &Array3<f32>,
        plan: &VectorFieldPlan,
    ) -> Result<Tracked<VectorField>, DeviceError> {
        let params = VectorFieldParams {
            fmax: self.config.fmax,
            sign: self.config.mode.sign(),
        };
        match self.profile.precision {
            VectorPrecision::Snorm16 => self.produce_vector_field::<i16>(volume, plan, params),
            VectorPrecision::Float32 => self.produce_vector_field::<f32>(volume, plan, params),
        }
    }

    fn produce_vector_field<C: VectorComponent>(
        &self,
        volume: &Array3<f32>,
        plan: &VectorFieldPlan,
        params: VectorFieldParams,
    ) -> Result<Tracked<VectorField>, DeviceError> {
        let Dims { x, y, z } = plan.dims;
        let shape = (z, y, x, COMPONENTS);

        if plan.mode == PlanMode::Direct {
            let mut target = self.registry.track(
                "vector field",
                AllocationKind::Image,
                plan.required_bytes(),
                Array4::<C>::default(shape),
            )?;
            let slice = target
                .as_slice_mut()
                .ok_or_else(|| DeviceError::Other("vector field target is not contiguous".into()))?;
            self.kernels
                .create_vector_field(volume, params, z, slice, &mut [])?;
            return Ok(target.map(C::wrap));
        }

        let (first_voxels, second_voxels) = plan.region_voxels();
        let (first_bytes, second_bytes) = plan.region_bytes();
        let mut first = self.registry.track(
            "vector field buffer",
            AllocationKind::Buffer,
            first_bytes,
            vec![C::default(); first_voxels * COMPONENTS],
        )?;
        let mut second = match second_voxels {
            0 => None,
            n => Some(self.registry.track(
                "vector field second buffer",
                AllocationKind::Buffer,
                second_bytes,
                vec![C::default(); n * COMPONENTS],
            )?),
        };
        self.kernels.create_vector_field(
            volume,
            params,
            plan.split_z(),
            first.as_mut_slice(),
            second.as_mut().map(|b| b.as_mut_slice()).unwrap_or_default(),
        )?;

        let mut target = self.registry.track(
            "vector field",
            AllocationKind::Image,
            plan.required_bytes(),
            Array4::<C>::default(shape),
        )?;
        plan.assemble(
            first.as_slice(),
            second.as_ref().map(|b| b.as_slice()).unwrap_or_default(),
            &mut *target,
        )?;
        Ok(target.map(C::wrap))
    }
}

fn scalar_bytes(dims: Dims) -> u64 {
    dims.voxels() as u64 * std::mem::size_of::<f32>() as u64
}

/// Per voxel, keep the small pass result where its radius is below the limit.
fn merge(small: &TdfResponse, large: TdfResponse) -> TdfResponse {
    let TdfResponse { mut tdf, mut radius } = large;
    Zip::from(&mut tdf)
        .and(&mut radius)
        .and(&small.tdf)
        .and(&small.radius)
        .par_for_each(|tdf, radius, &small_tdf, &small_radius| {
            if small_radius < SMALL_RADIUS_LIMIT {
                *tdf = small_tdf;
                *radius = small_radius;
            }
        });
    TdfResponse { tdf, radius }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kernels::CpuKernels,
        test_utils::{FakeKernels, LARGE_TDF, SMALL_TDF},
    };
    use approx::assert_abs_diff_eq;

    fn ramp_volume(n: usize) -> Array3<f32> {
        Array3::from_shape_fn((n, n, n), |(z, y, x)| (x + y + z) as f32 / (3 * n) as f32)
    }

    fn profile(precision: VectorPrecision, max_alloc_bytes: u64) -> ExecutionProfile {
        ExecutionProfile {
            precision,
            direct_write: true,
            max_alloc_bytes,
        }
    }

    fn run(
        kernels: &FakeKernels,
        config: &TubeConfig,
        profile: ExecutionProfile,
    ) -> (Result<(TubeFields, FilterReport), DeviceError>, AllocationRegistry) {
        let registry = AllocationRegistry::new(profile.max_alloc_bytes);
        let result = DualPassTubeFilter::new(kernels, &registry, profile, config).run(ramp_volume(8));
        (result, registry)
    }

    #[test]
    fn both_passes_run_and_small_radii_win_the_merge() {
        let kernels = FakeKernels::new(1.0);
        let config = TubeConfig::default();
        let (result, registry) = run(&kernels, &config, profile(VectorPrecision::Float32, u64::MAX));
        let (fields, report) = result.unwrap();

        assert_eq!(
            report.stages,
            vec![
                FilterStage::Init,
                FilterStage::SmallPass,
                FilterStage::LargePass,
                FilterStage::Merge,
                FilterStage::Done
            ]
        );
        assert!(fields.tdf.to_f32().iter().all(|&t| t == SMALL_TDF));
        assert!(fields.radius.iter().all(|&r| r == 1.0));
        assert_eq!(kernels.calls().first().map(String::as_str), Some("vector field:8"));
        assert!(kernels.calls().contains(&"circle:0.5-3".to_string()));
        assert!(kernels.calls().contains(&"circle:2.5-6".to_string()));
        assert_eq!(registry.live_allocations(), 0);
    }

    #[test]
    fn field_at_capacity_fills_a_single_staging_buffer() {
        let kernels = FakeKernels::new(1.0);
        // 8^3 voxels of four f32 components
        let (result, registry) = run(&kernels, &TubeConfig::default(), profile(VectorPrecision::Float32, 8192));
        let (fields, report) = result.unwrap();

        let plan = report.plan.unwrap();
        assert_eq!(plan.region_voxels(), (512, 0));
        assert_eq!(plan.split_z(), 8);
        assert_eq!(report.gvf, Some(GvfVariant::Standard));
        assert_eq!(fields.vector_field.dims(), Dims::new(8, 8, 8));
        assert_eq!(kernels.count("vector field:8"), 2);
        assert_eq!(registry.live_allocations(), 0);
    }

    #[test]
    fn large_radii_take_the_large_pass() {
        let kernels = FakeKernels::new(3.0);
        let (result, _) = run(&kernels, &TubeConfig::default(), profile(VectorPrecision::Float32, u64::MAX));
        let (fields, report) = result.unwrap();
        assert!(report.ran(FilterStage::Merge));
        assert!(fields.tdf.to_f32().iter().all(|&t| t == LARGE_TDF));
        assert!(fields.radius.iter().all(|&r| r == 6.0));
    }

    #[test]
    fn small_radius_range_exits_early() {
        let kernels = FakeKernels::new(1.0);
        let config = TubeConfig {
            radius_max: 2.0,
            small_blur: 0.5,
            ..TubeConfig::default()
        };
        let (result, registry) = run(&kernels, &config, profile(VectorPrecision::Snorm16, u64::MAX));
        let (fields, report) = result.unwrap();

        assert_eq!(
            report.stages,
            vec![
                FilterStage::Init,
                FilterStage::SmallPass,
                FilterStage::EarlyExit,
                FilterStage::Done
            ]
        );
        assert_eq!(kernels.count("gvf"), 0);
        assert_eq!(kernels.calls(), vec!["blur:0.5", "vector field:8", "circle:0.5-3"]);
        assert_eq!(fields.tdf.precision(), VectorPrecision::Snorm16);
        assert_eq!(fields.vector_field.precision(), VectorPrecision::Snorm16);
        assert_eq!(report.plan, None);
        assert_eq!(registry.live_allocations(), 0);

        // the small pass output comes back unchanged
        assert!(fields.radius.iter().all(|&r| r == 1.0));
        for t in fields.tdf.to_f32() {
            assert_abs_diff_eq!(t, SMALL_TDF, epsilon = 1e-4);
        }
        let params = VectorFieldParams {
            fmax: config.fmax,
            sign: config.mode.sign(),
        };
        let mut expected = vec![0i16; 8 * 8 * 8 * COMPONENTS];
        CpuKernels
            .create_vector_field(&ramp_volume(8), params, 8, &mut expected, &mut [])
            .unwrap();
        match &fields.vector_field {
            VectorField::Snorm16(field) => assert_eq!(field.as_slice(), Some(expected.as_slice())),
            VectorField::Float32(_) => panic!("expected a snorm16 vector field"),
        }
    }

    #[test]
    fn large_minimum_radius_skips_the_small_pass() {
        let kernels = FakeKernels::new(1.0);
        let config = TubeConfig {
            radius_min: 3.0,
            ..TubeConfig::default()
        };
        let (result, _) = run(&kernels, &config, profile(VectorPrecision::Float32, u64::MAX));
        let (fields, report) = result.unwrap();
        assert_eq!(
            report.stages,
            vec![FilterStage::Init, FilterStage::LargePass, FilterStage::Done]
        );
        assert_eq!(kernels.calls(), vec!["blur:1", "vector field:8", "gvf:Standard", "circle:3-6"]);
        assert!(fields.tdf.to_f32().iter().all(|&t| t == LARGE_TDF));
    }

    #[test]
    fn spline_tdf_lowers_the_radius_floor() {
        let kernels = FakeKernels::new(1.0);
        let config = TubeConfig {
            use_spline_tdf: true,
            ..TubeConfig::default()
        };
        let (result, _) = run(&kernels, &config, profile(VectorPrecision::Float32, u64::MAX));
        let (_, report) = result.unwrap();
        assert_eq!(report.tdf, Some(TdfMethod::Spline));
        assert!(kernels.calls().contains(&"spline:1.5-6".to_string()));
    }

    #[test]
    fn gvf_variant_follows_capacity_and_config() {
        let kernels = FakeKernels::new(1.0);
        let config = TubeConfig {
            use_fmg_gvf: true,
            ..TubeConfig::default()
        };
        let (result, _) = run(&kernels, &config, profile(VectorPrecision::Float32, u64::MAX));
        assert_eq!(result.unwrap().1.gvf, Some(GvfVariant::Multigrid));

        // 8^3 float vectors need 8192 bytes; 5000 forces a split at z = 4
        let kernels = FakeKernels::new(1.0);
        let (result, registry) = run(&kernels, &TubeConfig::default(), profile(VectorPrecision::Float32, 5000));
        let (split_fields, report) = result.unwrap();
        assert_eq!(report.gvf, Some(GvfVariant::LowMemory));
        assert!(matches!(report.plan.map(|p| p.mode), Some(PlanMode::Split { split_z: 4, .. })));
        assert!(kernels.calls().contains(&"vector field:4".to_string()));
        assert_eq!(registry.live_allocations(), 0);
        assert!(registry.peak_bytes() > 0);

        let (result, _) = run(&FakeKernels::new(1.0), &TubeConfig::default(), profile(VectorPrecision::Float32, u64::MAX));
        let (whole_fields, report) = result.unwrap();
        assert_eq!(report.gvf, Some(GvfVariant::Standard));
        assert_eq!(split_fields.vector_field, whole_fields.vector_field);
    }

    #[test]
    fn failures_release_every_allocation() {
        let kernels = FakeKernels::new(1.0).failing("gvf", 1, DeviceError::Other("boom".into()));
        let (result, registry) = run(&kernels, &TubeConfig::default(), profile(VectorPrecision::Float32, u64::MAX));
        assert_eq!(result.unwrap_err(), DeviceError::Other("boom".into()));
        assert_eq!(registry.live_allocations(), 0);
        assert!(registry.total_allocations() >= 4);
    }

    #[test]
    fn timing_records_each_stage() {
        let kernels = FakeKernels::new(1.0);
        let config = TubeConfig {
            timing: true,
            ..TubeConfig::default()
        };
        let (result, _) = run(&kernels, &config, profile(VectorPrecision::Float32, u64::MAX));
        let stages: Vec<_> = result.unwrap().1.timings.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            stages,
            vec![FilterStage::SmallPass, FilterStage::LargePass, FilterStage::Merge]
        );
    }
}
