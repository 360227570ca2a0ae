//! Numeric operators of the tube filter.
//!
//! [`TubeKernels`] is the seam between the pipeline and whatever device runs the
//! per-voxel work. [`CpuKernels`] is the host implementation on ndarray + rayon;
//! the wgpu implementation lives in [`crate::gpu_kernels`].

use ndarray::{Array3, Zip};
use rayon::prelude::*;
use std::f32::consts::TAU;

use crate::{
    device::DeviceError,
    enums::{Axis, GvfVariant, VectorPrecision},
    fields::{VectorComponent, VectorField},
    planner::COMPONENTS,
    volume::Samples,
};

/// Points sampled on each fitted circle.
const CIRCLE_SAMPLES: usize = 32;

/// Which scan lines count towards a slice's occupancy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OccupancyRule {
    /// Lines crossing tissue, then air, then tissue again
    Lung { air_below: f32 },
    /// Lines holding at least one sample above the threshold
    Threshold { above: f32 },
}

impl OccupancyRule {
    fn counts(self, line: impl Iterator<Item = f32>) -> bool {
        match self {
            OccupancyRule::Threshold { above } => line.into_iter().any(|v| v > above),
            OccupancyRule::Lung { air_below } => {
                let mut seen_tissue = false;
                let mut seen_air = false;
                for v in line {
                    if v >= air_below {
                        if seen_air {
                            return true;
                        }
                        seen_tissue = true;
                    } else if seen_tissue {
                        seen_air = true;
                    }
                }
                false
            }
        }
    }
}

/// Normalized 3D Gaussian weights, `(2h+1)^3` values in `[z, y, x]` order.
#[derive(Clone, Debug, PartialEq)]
pub struct BlurMask {
    sigma: f32,
    half_width: usize,
    weights: Vec<f32>,
}

impl BlurMask {
    pub fn new(sigma: f32) -> Self {
        let half_width = ((sigma / 0.5).ceil() as usize).clamp(1, 5);
        let two_sigma_sq = 2.0 * sigma.max(1e-3).powi(2);
        let h = half_width as i32;

        let mut weights = Vec::with_capacity((2 * half_width + 1).pow(3));
        for z in -h..=h {
            for y in -h..=h {
                for x in -h..=h {
                    let d2 = (x * x + y * y + z * z) as f32;
                    weights.push((-d2 / two_sigma_sq).exp());
                }
            }
        }
        let sum: f32 = weights.iter().sum();
        weights.iter_mut().for_each(|w| *w /= sum);

        Self {
            sigma,
            half_width,
            weights,
        }
    }

    pub fn sigma(&self) -> f32 {
        self.sigma
    }

    pub fn half_width(&self) -> usize {
        self.half_width
    }

    pub fn width(&self) -> usize {
        2 * self.half_width + 1
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }
}

/// Radii tried by a TDF pass, `min..=max` in `step` increments.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RadiusRange {
    pub min: f32,
    pub max: f32,
    pub step: f32,
}

impl RadiusRange {
    pub fn new(min: f32, max: f32, step: f32) -> Self {
        Self { min, max, step }
    }

    pub fn radii(&self) -> Vec<f32> {
        if self.step <= 0.0 {
            return vec![self.min];
        }
        (0..)
            .map(|i| self.min + i as f32 * self.step)
            .take_while(|r| *r <= self.max + 1e-4)
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VectorFieldParams {
    /// Gradient magnitude at which vectors saturate to unit length
    pub fmax: f32,
    /// +1 for bright tubes, -1 for dark
    pub sign: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GvfParams {
    pub iterations: u32,
    pub mu: f32,
}

/// Best TDF response and the radius that produced it, per voxel.
#[derive(Clone, Debug, PartialEq)]
pub struct TdfResponse {
    pub tdf: Array3<f32>,
    pub radius: Array3<f32>,
}

pub trait TubeKernels {
    fn name(&self) -> &str;

    /// Count, per slice along `axis`, the scan lines that satisfy `rule`.
    fn scan_line_occupancy(
        &self,
        samples: &Samples,
        axis: Axis,
        rule: OccupancyRule,
    ) -> Result<Vec<u16>, DeviceError>;

    fn gaussian_blur(&self, volume: &Array3<f32>, mask: &BlurMask) -> Result<Array3<f32>, DeviceError>;

    /// Write the gradient vector field of `volume` as `[z, y, x, c]` components:
    /// slices below `split_z` into `first`, the rest into `second`.
    fn create_vector_field<C: VectorComponent>(
        &self,
        volume: &Array3<f32>,
        params: VectorFieldParams,
        split_z: usize,
        first: &mut [C],
        second: &mut [C],
    ) -> Result<(), DeviceError>;

    fn gradient_vector_flow(
        &self,
        field: &VectorField,
        variant: GvfVariant,
        params: GvfParams,
    ) -> Result<VectorField, DeviceError>;

    fn circle_fitting_tdf(&self, field: &VectorField, radii: RadiusRange) -> Result<TdfResponse, DeviceError>;

    fn spline_tdf(&self, field: &VectorField, radii: RadiusRange) -> Result<TdfResponse, DeviceError>;
}

/// Host reference kernels.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuKernels;

impl TubeKernels for CpuKernels {
    fn name(&self) -> &str {
        "host"
    }

    fn scan_line_occupancy(
        &self,
        samples: &Samples,
        axis: Axis,
        rule: OccupancyRule,
    ) -> Result<Vec<u16>, DeviceError> {
        let dims = samples.dims();
        let slices = match axis {
            Axis::X => dims.x,
            Axis::Y => dims.y,
            Axis::Z => dims.z,
        };

        let counts = (0..slices)
            .into_par_iter()
            .map(|s| {
                let lines = match axis {
                    // lines along y, one per z
                    Axis::X => (0..dims.z)
                        .filter(|&z| rule.counts((0..dims.y).map(|y| samples.get_f32(z, y, s))))
                        .count(),
                    // lines along x, one per z
                    Axis::Y => (0..dims.z)
                        .filter(|&z| rule.counts((0..dims.x).map(|x| samples.get_f32(z, s, x))))
                        .count(),
                    // lines along x, one per y
                    Axis::Z => (0..dims.y)
                        .filter(|&y| rule.counts((0..dims.x).map(|x| samples.get_f32(s, y, x))))
                        .count(),
                };
                lines.min(u16::MAX as usize) as u16
            })
            .collect();
        Ok(counts)
    }

    fn gaussian_blur(&self, volume: &Array3<f32>, mask: &BlurMask) -> Result<Array3<f32>, DeviceError> {
        let (depth, height, width) = volume.dim();
        let h = mask.half_width() as isize;
        let weights = mask.weights();

        let mut blurred = Array3::zeros(volume.dim());
        Zip::indexed(&mut blurred).par_for_each(|(z, y, x), out| {
            let mut sum = 0.0;
            let mut w = 0;
            for dz in -h..=h {
                let zz = clamp_index(z, dz, depth);
                for dy in -h..=h {
                    let yy = clamp_index(y, dy, height);
                    for dx in -h..=h {
                        let xx = clamp_index(x, dx, width);
                        sum += weights[w] * volume[[zz, yy, xx]];
                        w += 1;
                    }
                }
            }
            *out = sum;
        });
        Ok(blurred)
    }

    fn create_vector_field<C: VectorComponent>(
        &self,
        volume: &Array3<f32>,
        params: VectorFieldParams,
        split_z: usize,
        first: &mut [C],
        second: &mut [C],
    ) -> Result<(), DeviceError> {
        let (depth, height, width) = volume.dim();
        let slice_len = width * height * COMPONENTS;
        if split_z > depth
            || first.len() != split_z * slice_len
            || second.len() != (depth - split_z) * slice_len
        {
            return Err(DeviceError::Other(format!(
                "vector field regions of {} and {} components do not match {depth} slices split at {split_z}",
                first.len(),
                second.len()
            )));
        }
        if slice_len == 0 {
            return Ok(());
        }

        let fill = |z: usize, slice: &mut [C]| {
            for y in 0..height {
                for x in 0..width {
                    let v = field_vector(gradient(volume, z, y, x), params);
                    let magnitude = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
                    let o = (y * width + x) * COMPONENTS;
                    slice[o] = C::from_f32(v[0]);
                    slice[o + 1] = C::from_f32(v[1]);
                    slice[o + 2] = C::from_f32(v[2]);
                    slice[o + 3] = C::from_f32(magnitude);
                }
            }
        };
        first
            .par_chunks_mut(slice_len)
            .enumerate()
            .for_each(|(z, slice)| fill(z, slice));
        second
            .par_chunks_mut(slice_len)
            .enumerate()
            .for_each(|(i, slice)| fill(split_z + i, slice));
        Ok(())
    }

    fn gradient_vector_flow(
        &self,
        field: &VectorField,
        variant: GvfVariant,
        params: GvfParams,
    ) -> Result<VectorField, DeviceError> {
        let initial = field.to_vectors();
        let precision = field.precision();
        let flowed = match variant {
            GvfVariant::Standard => {
                let mut v = initial.clone();
                diffuse(&mut v, &initial, params.iterations, params.mu);
                v
            }
            GvfVariant::LowMemory => {
                let mut v = initial.clone();
                diffuse_in_place(&mut v, &initial, params.iterations, params.mu, precision);
                v
            }
            GvfVariant::Multigrid => multigrid(&initial, params),
        };
        Ok(VectorField::from_vectors(&flowed, precision))
    }

    fn circle_fitting_tdf(&self, field: &VectorField, radii: RadiusRange) -> Result<TdfResponse, DeviceError> {
        tube_response(field, radii, circle_response)
    }

    fn spline_tdf(&self, field: &VectorField, radii: RadiusRange) -> Result<TdfResponse, DeviceError> {
        tube_response(field, radii, quadrant_response)
    }
}

#[inline]
fn clamp_index(i: usize, offset: isize, len: usize) -> usize {
    (i as isize + offset).clamp(0, len as isize - 1) as usize
}

/// Central-difference gradient at `[z, y, x]`, returned as (x, y, z).
#[inline]
fn gradient(volume: &Array3<f32>, z: usize, y: usize, x: usize) -> [f32; 3] {
    let (depth, height, width) = volume.dim();
    [
        0.5 * (volume[[z, y, clamp_index(x, 1, width)]] - volume[[z, y, clamp_index(x, -1, width)]]),
        0.5 * (volume[[z, clamp_index(y, 1, height), x]] - volume[[z, clamp_index(y, -1, height), x]]),
        0.5 * (volume[[clamp_index(z, 1, depth), y, x]] - volume[[clamp_index(z, -1, depth), y, x]]),
    ]
}

/// Gradients shorter than `fmax` scale linearly; longer ones become unit vectors.
#[inline]
fn field_vector(gradient: [f32; 3], params: VectorFieldParams) -> [f32; 3] {
    let length = dot(gradient, gradient).sqrt();
    let scale = params.sign / if length > params.fmax { length } else { params.fmax };
    gradient.map(|g| g * scale)
}

#[inline]
fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn normalize(v: [f32; 3]) -> [f32; 3] {
    let length = dot(v, v).sqrt();
    if length > 0.0 { v.map(|c| c / length) } else { v }
}

#[inline]
fn laplacian(v: &Array3<[f32; 3]>, z: usize, y: usize, x: usize) -> [f32; 3] {
    let (depth, height, width) = v.dim();
    let neighbours = [
        v[[z, y, clamp_index(x, 1, width)]],
        v[[z, y, clamp_index(x, -1, width)]],
        v[[z, clamp_index(y, 1, height), x]],
        v[[z, clamp_index(y, -1, height), x]],
        v[[clamp_index(z, 1, depth), y, x]],
        v[[clamp_index(z, -1, depth), y, x]],
    ];
    let center = v[[z, y, x]];
    let mut lap = center.map(|c| -6.0 * c);
    for n in neighbours {
        for c in 0..3 {
            lap[c] += n[c];
        }
    }
    lap
}

#[inline]
fn gvf_update(current: [f32; 3], lap: [f32; 3], f: [f32; 3], mu: f32) -> [f32; 3] {
    let weight = dot(f, f);
    let mut next = [0.0; 3];
    for c in 0..3 {
        next[c] = current[c] + mu * lap[c] - (current[c] - f[c]) * weight;
    }
    next
}

/// Jacobi iterations of `v += mu * lap(v) - (v - f) * |f|^2` with two buffers.
fn diffuse(v: &mut Array3<[f32; 3]>, f: &Array3<[f32; 3]>, iterations: u32, mu: f32) {
    let mut next = v.clone();
    for _ in 0..iterations {
        let current: &Array3<[f32; 3]> = v;
        Zip::indexed(&mut next).and(f).par_for_each(|(z, y, x), out, &fv| {
            *out = gvf_update(current[[z, y, x]], laplacian(current, z, y, x), fv, mu);
        });
        std::mem::swap(v, &mut next);
    }
}

/// Gauss-Seidel iterations on a single buffer, quantized to the field precision
/// after every update.
fn diffuse_in_place(
    v: &mut Array3<[f32; 3]>,
    f: &Array3<[f32; 3]>,
    iterations: u32,
    mu: f32,
    precision: VectorPrecision,
) {
    let (depth, height, width) = v.dim();
    for _ in 0..iterations {
        for z in 0..depth {
            for y in 0..height {
                for x in 0..width {
                    let next = gvf_update(v[[z, y, x]], laplacian(v, z, y, x), f[[z, y, x]], mu);
                    v[[z, y, x]] = next.map(|c| quantize(c, precision));
                }
            }
        }
    }
}

#[inline]
fn quantize(value: f32, precision: VectorPrecision) -> f32 {
    match precision {
        VectorPrecision::Snorm16 => i16::from_f32(value).to_f32(),
        VectorPrecision::Float32 => value,
    }
}

/// Two-level scheme: half the iterations on a 2x restricted grid, prolonged as the
/// starting point for the rest on the full grid.
fn multigrid(f: &Array3<[f32; 3]>, params: GvfParams) -> Array3<[f32; 3]> {
    let (depth, height, width) = f.dim();
    let mut v = f.clone();
    if depth < 4 || height < 4 || width < 4 {
        diffuse(&mut v, f, params.iterations, params.mu);
        return v;
    }

    let coarse_f = restrict(f);
    let mut coarse_v = coarse_f.clone();
    let coarse_iterations = params.iterations / 2;
    diffuse(&mut coarse_v, &coarse_f, coarse_iterations, params.mu);

    Zip::indexed(&mut v).par_for_each(|(z, y, x), out| *out = coarse_v[[z / 2, y / 2, x / 2]]);
    diffuse(&mut v, f, params.iterations - coarse_iterations, params.mu);
    v
}

fn restrict(fine: &Array3<[f32; 3]>) -> Array3<[f32; 3]> {
    let (depth, height, width) = fine.dim();
    let shape = (depth.div_ceil(2), height.div_ceil(2), width.div_ceil(2));
    Array3::from_shape_fn(shape, |(z, y, x)| {
        let mut sum = [0.0f32; 3];
        let mut n = 0.0;
        for zz in 2 * z..(2 * z + 2).min(depth) {
            for yy in 2 * y..(2 * y + 2).min(height) {
                for xx in 2 * x..(2 * x + 2).min(width) {
                    let v = fine[[zz, yy, xx]];
                    for c in 0..3 {
                        sum[c] += v[c];
                    }
                    n += 1.0;
                }
            }
        }
        sum.map(|s| s / n)
    })
}

/// Trilinear sample at `p` = (x, y, z), clamped to the volume.
fn sample_trilinear(field: &Array3<[f32; 3]>, p: [f32; 3]) -> [f32; 3] {
    let (depth, height, width) = field.dim();
    let x = p[0].clamp(0.0, (width - 1) as f32);
    let y = p[1].clamp(0.0, (height - 1) as f32);
    let z = p[2].clamp(0.0, (depth - 1) as f32);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let z0 = z.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let z1 = (z0 + 1).min(depth - 1);

    let dx = x - x0 as f32;
    let dy = y - y0 as f32;
    let dz = z - z0 as f32;
    let one_minus_dx = 1.0 - dx;
    let one_minus_dy = 1.0 - dy;
    let one_minus_dz = 1.0 - dz;

    let mut out = [0.0; 3];
    for c in 0..3 {
        let v00 = field[[z0, y0, x0]][c].mul_add(one_minus_dx, field[[z0, y0, x1]][c] * dx);
        let v01 = field[[z0, y1, x0]][c].mul_add(one_minus_dx, field[[z0, y1, x1]][c] * dx);
        let v10 = field[[z1, y0, x0]][c].mul_add(one_minus_dx, field[[z1, y0, x1]][c] * dx);
        let v11 = field[[z1, y1, x0]][c].mul_add(one_minus_dx, field[[z1, y1, x1]][c] * dx);
        let v0 = v00.mul_add(one_minus_dy, v01 * dy);
        let v1 = v10.mul_add(one_minus_dy, v11 * dy);
        out[c] = v0.mul_add(one_minus_dz, v1 * dz);
    }
    out
}

/// Eigen decomposition of a symmetric 3x3 matrix by cyclic Jacobi rotations.
/// Returns the eigenvalues and the matching eigenvectors as columns.
fn symmetric_eigen(m: [[f32; 3]; 3]) -> ([f32; 3], [[f32; 3]; 3]) {
    let mut a = m;
    let mut v = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

    for _ in 0..16 {
        let off = a[0][1] * a[0][1] + a[0][2] * a[0][2] + a[1][2] * a[1][2];
        if off < 1e-12 {
            break;
        }
        for (p, q) in [(0, 1), (0, 2), (1, 2)] {
            if a[p][q].abs() < 1e-12 {
                continue;
            }
            let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
            let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
            let c = 1.0 / (t * t + 1.0).sqrt();
            let s = t * c;
            for k in 0..3 {
                let (akp, akq) = (a[k][p], a[k][q]);
                a[k][p] = c * akp - s * akq;
                a[k][q] = s * akp + c * akq;
            }
            for k in 0..3 {
                let (apk, aqk) = (a[p][k], a[q][k]);
                a[p][k] = c * apk - s * aqk;
                a[q][k] = s * apk + c * aqk;
            }
            for row in v.iter_mut() {
                let (vkp, vkq) = (row[p], row[q]);
                row[p] = c * vkp - s * vkq;
                row[q] = s * vkp + c * vkq;
            }
        }
    }
    ([a[0][0], a[1][1], a[2][2]], v)
}

/// Tube axis estimate: eigenvector of the symmetrized vector field Jacobian with
/// the smallest absolute eigenvalue.
fn tube_direction(vectors: &Array3<[f32; 3]>, z: usize, y: usize, x: usize) -> [f32; 3] {
    let (depth, height, width) = vectors.dim();
    let columns = [
        (vectors[[z, y, clamp_index(x, 1, width)]], vectors[[z, y, clamp_index(x, -1, width)]]),
        (vectors[[z, clamp_index(y, 1, height), x]], vectors[[z, clamp_index(y, -1, height), x]]),
        (vectors[[clamp_index(z, 1, depth), y, x]], vectors[[clamp_index(z, -1, depth), y, x]]),
    ];
    let mut jacobian = [[0.0f32; 3]; 3];
    for (j, (ahead, behind)) in columns.iter().enumerate() {
        for i in 0..3 {
            jacobian[i][j] = 0.5 * (ahead[i] - behind[i]);
        }
    }
    let mut symmetric = [[0.0f32; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            symmetric[i][j] = 0.5 * (jacobian[i][j] + jacobian[j][i]);
        }
    }

    let (values, vectors) = symmetric_eigen(symmetric);
    let smallest = (0..3)
        .min_by(|&a, &b| values[a].abs().total_cmp(&values[b].abs()))
        .unwrap_or(0);
    normalize([vectors[0][smallest], vectors[1][smallest], vectors[2][smallest]])
}

fn orthonormal_basis(direction: [f32; 3]) -> ([f32; 3], [f32; 3]) {
    let helper = if direction[0].abs() < 0.9 {
        [1.0, 0.0, 0.0]
    } else {
        [0.0, 1.0, 0.0]
    };
    let e1 = normalize(cross(direction, helper));
    let e2 = cross(direction, e1);
    (e1, e2)
}

/// Inward flow through each sample point of a circle of `radius` around `center`.
fn circle_flow(
    vectors: &Array3<[f32; 3]>,
    center: [f32; 3],
    basis: ([f32; 3], [f32; 3]),
    radius: f32,
) -> [f32; CIRCLE_SAMPLES] {
    let (e1, e2) = basis;
    std::array::from_fn(|k| {
        let angle = TAU * k as f32 / CIRCLE_SAMPLES as f32;
        let (sin, cos) = angle.sin_cos();
        let outward = [0, 1, 2].map(|c| e1[c] * cos + e2[c] * sin);
        let point = [0, 1, 2].map(|c| center[c] + radius * outward[c]);
        -dot(sample_trilinear(vectors, point), outward)
    })
}

fn circle_response(flow: &[f32; CIRCLE_SAMPLES]) -> f32 {
    flow.iter().sum::<f32>() / CIRCLE_SAMPLES as f32
}

/// Weakest quadrant mean, so one-sided edges do not register as tubes.
fn quadrant_response(flow: &[f32; CIRCLE_SAMPLES]) -> f32 {
    flow.chunks(CIRCLE_SAMPLES / 4)
        .map(|quadrant| quadrant.iter().sum::<f32>() / quadrant.len() as f32)
        .fold(f32::INFINITY, f32::min)
}

fn tube_response(
    field: &VectorField,
    radii: RadiusRange,
    response: fn(&[f32; CIRCLE_SAMPLES]) -> f32,
) -> Result<TdfResponse, DeviceError> {
    let radii = radii.radii();
    let Some(&first_radius) = radii.first() else {
        return Err(DeviceError::Other("empty TDF radius range".to_string()));
    };
    let vectors = field.to_vectors();

    let mut tdf = Array3::zeros(vectors.dim());
    let mut radius = Array3::zeros(vectors.dim());
    Zip::indexed(&mut tdf)
        .and(&mut radius)
        .par_for_each(|(z, y, x), tdf, radius| {
            let basis = orthonormal_basis(tube_direction(&vectors, z, y, x));
            let center = [x as f32, y as f32, z as f32];
            let mut best = (f32::NEG_INFINITY, first_radius);
            for &r in &radii {
                let value = response(&circle_flow(&vectors, center, basis, r));
                if value > best.0 {
                    best = (value, r);
                }
            }
            *tdf = best.0.clamp(0.0, 1.0);
            *radius = best.1;
        });
    Ok(TdfResponse { tdf, radius })
}
