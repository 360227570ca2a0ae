//! Geometric cropping of a loaded volume.
//!
//! Every policy ends with dims that are positive multiples of 4. Bounding-box
//! cropping finds the occupied region from per-slice scan line counts; the AAA
//! preset removes a fixed in-plane margin; otherwise the volume is only trimmed.

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::TubeConfig,
    device::DeviceError,
    enums::{Axis, CroppingPolicy, CroppingStartZ, Preset},
    kernels::{OccupancyRule, TubeKernels},
    volume::{Dims, Volume},
};

/// Hounsfield value separating air from tissue.
const AIR_HU: f32 = -500.0;
/// Offset of unsigned CT data relative to Hounsfield units.
const UNSIGNED_HU_OFFSET: f32 = 1024.0;
/// Share of the in-plane extent removed from each side by the fixed margin.
const FIXED_MARGIN: f32 = 0.15;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CroppingError {
    #[error("Invalid cropping: {axis:?} extent would be {width}")]
    Degenerate { axis: Axis, width: i64 },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CroppingMethod {
    Lung,
    Threshold,
    FixedMargin,
    Trim,
}

/// Half-open voxel box `[x1, x2) x [y1, y2) x [z1, z2)` in original coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: usize,
    pub x2: usize,
    pub y1: usize,
    pub y2: usize,
    pub z1: usize,
    pub z2: usize,
}

impl BoundingBox {
    fn from_extents(x: (usize, usize), y: (usize, usize), z: (usize, usize)) -> Self {
        Self {
            x1: x.0,
            x2: x.1,
            y1: y.0,
            y2: y.1,
            z1: z.0,
            z2: z.1,
        }
    }

    pub fn origin(&self) -> (usize, usize, usize) {
        (self.x1, self.y1, self.z1)
    }

    pub fn dims(&self) -> Dims {
        Dims::new(self.x2 - self.x1, self.y2 - self.y1, self.z2 - self.z1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CroppingResult {
    pub method: CroppingMethod,
    pub bbox: BoundingBox,
    pub dims: Dims,
    /// Translates cropped coordinates back to the original volume
    pub shift: (usize, usize, usize),
}

pub struct Cropper;

impl Cropper {
    /// Decide the crop region and extract it into a new volume.
    pub fn crop<K: TubeKernels>(
        kernels: &K,
        volume: &Volume,
        config: &TubeConfig,
    ) -> Result<(Volume, CroppingResult), CroppingError> {
        let result = Self::plan(kernels, volume, config)?;
        let samples = volume.samples.crop(result.bbox.origin(), result.dims);
        if result.dims != volume.dims() {
            info!(
                from = ?volume.dims(),
                to = ?result.dims,
                shift = ?result.shift,
                method = ?result.method,
                "cropped dataset"
            );
        }
        Ok((Volume::new(samples, volume.spacing, volume.range), result))
    }

    pub fn plan<K: TubeKernels>(
        kernels: &K,
        volume: &Volume,
        config: &TubeConfig,
    ) -> Result<CroppingResult, CroppingError> {
        match config.cropping {
            CroppingPolicy::Lung | CroppingPolicy::Threshold => bounding_box(kernels, volume, config),
            CroppingPolicy::Off if config.preset == Preset::AaaVesselsCt => fixed_margin(volume.dims()),
            CroppingPolicy::Off => trim(volume.dims()),
        }
    }
}

fn bounding_box<K: TubeKernels>(
    kernels: &K,
    volume: &Volume,
    config: &TubeConfig,
) -> Result<CroppingResult, CroppingError> {
    let dims = volume.dims();
    let (method, rule, min_lines, start_z) = if config.cropping == CroppingPolicy::Lung {
        let offset = if volume.element_type().is_unsigned() {
            UNSIGNED_HU_OFFSET
        } else {
            0.0
        };
        (
            CroppingMethod::Lung,
            OccupancyRule::Lung {
                air_below: AIR_HU + offset,
            },
            config.min_scan_lines_lung,
            CroppingStartZ::Middle,
        )
    } else {
        (
            CroppingMethod::Threshold,
            OccupancyRule::Threshold {
                above: config.cropping_threshold,
            },
            config.min_scan_lines_threshold,
            config.cropping_start_z,
        )
    };

    let counts_x = kernels.scan_line_occupancy(&volume.samples, Axis::X, rule)?;
    let counts_y = kernels.scan_line_occupancy(&volume.samples, Axis::Y, rule)?;
    let counts_z = kernels.scan_line_occupancy(&volume.samples, Axis::Z, rule)?;

    let x = lateral_extent(&counts_x, min_lines);
    let y = lateral_extent(&counts_y, min_lines);
    let z = axial_extent(&counts_z, min_lines, start_z);
    debug!(?x, ?y, ?z, ?start_z, "occupied extents");

    // the growth side keeps alternating from one axis to the next
    let mut lower = false;
    let x = align(x, dims.x, Axis::X, &mut lower)?;
    let y = align(y, dims.y, Axis::Y, &mut lower)?;
    let z = align(z, dims.z, Axis::Z, &mut lower)?;

    let bbox = BoundingBox::from_extents(x, y, z);
    Ok(CroppingResult {
        method,
        bbox,
        dims: bbox.dims(),
        shift: bbox.origin(),
    })
}

/// First occupied slice from the front, last from the back (never slice 0).
fn lateral_extent(counts: &[u16], min_lines: u32) -> (i64, i64) {
    let size = counts.len();
    let occupied = |i: &usize| u32::from(counts[*i]) > min_lines;
    let lo = (0..size).find(occupied).unwrap_or(0);
    let hi = (1..size).rev().find(occupied).unwrap_or(size);
    (lo as i64, hi as i64)
}

fn axial_extent(counts: &[u16], min_lines: u32, start: CroppingStartZ) -> (i64, i64) {
    let size = counts.len();
    let (mut z1, mut z2) = (0, size);
    match start {
        CroppingStartZ::Middle => {
            // walk out of the occupied region from the middle slice
            let leaves = |i: &usize| u32::from(counts[*i]) < min_lines;
            let middle = size / 2;
            if let Some(i) = (middle..size).find(leaves) {
                z2 = i;
            }
            if let Some(i) = (1..size - middle).rev().find(leaves) {
                z1 = i;
            }
        }
        CroppingStartZ::End => {
            let enters = |i: &usize| u32::from(counts[*i]) > min_lines;
            if let Some(i) = (0..size).find(enters) {
                z2 = i;
            }
            if let Some(i) = (1..size).rev().find(enters) {
                z1 = i;
            }
            std::mem::swap(&mut z1, &mut z2);
        }
    }
    (z1 as i64, z2 as i64)
}

/// Grow the extent to a multiple of 4, alternating high and low side, then
/// shrink from the high side if the volume boundary stops the growth.
fn align(
    extent: (i64, i64),
    size: usize,
    axis: Axis,
    lower: &mut bool,
) -> Result<(usize, usize), CroppingError> {
    let (mut lo, mut hi) = extent;
    let size = size as i64;
    if hi - lo <= 0 {
        return Err(CroppingError::Degenerate { axis, width: hi - lo });
    }

    while (hi - lo) % 4 != 0 && hi - lo < size {
        if *lower && lo > 0 {
            lo -= 1;
        } else if hi < size {
            hi += 1;
        }
        *lower = !*lower;
    }
    let width = (hi - lo) / 4 * 4;
    if width == 0 {
        return Err(CroppingError::Degenerate { axis, width });
    }
    Ok((lo as usize, (lo + width) as usize))
}

fn trim_to_four(size: usize, axis: Axis) -> Result<usize, CroppingError> {
    match size - size % 4 {
        0 => Err(CroppingError::Degenerate {
            axis,
            width: size as i64,
        }),
        trimmed => Ok(trimmed),
    }
}

fn fixed_margin(dims: Dims) -> Result<CroppingResult, CroppingError> {
    let offset_x = (dims.x as f32 * FIXED_MARGIN).round() as usize;
    let offset_y = (dims.y as f32 * FIXED_MARGIN).round() as usize;
    let width = trim_to_four(dims.x.saturating_sub(2 * offset_x), Axis::X)?;
    let height = trim_to_four(dims.y.saturating_sub(2 * offset_y), Axis::Y)?;
    let depth = trim_to_four(dims.z, Axis::Z)?;

    let bbox = BoundingBox::from_extents(
        (offset_x, offset_x + width),
        (offset_y, offset_y + height),
        (0, depth),
    );
    Ok(CroppingResult {
        method: CroppingMethod::FixedMargin,
        bbox,
        dims: bbox.dims(),
        shift: bbox.origin(),
    })
}

fn trim(dims: Dims) -> Result<CroppingResult, CroppingError> {
    let bbox = BoundingBox::from_extents(
        (0, trim_to_four(dims.x, Axis::X)?),
        (0, trim_to_four(dims.y, Axis::Y)?),
        (0, trim_to_four(dims.z, Axis::Z)?),
    );
    Ok(CroppingResult {
        method: CroppingMethod::Trim,
        bbox,
        dims: bbox.dims(),
        shift: (0, 0, 0),
    })
}
