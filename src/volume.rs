use ndarray::{Array3, s};
use rayon::prelude::*;

use crate::metaimage::ElementType;

/// Volume extent in voxels, (x, y, z) order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Dims {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Dims {
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    /// Convert an ndarray shape `(depth, height, width)` into dims.
    pub fn from_shape(shape: (usize, usize, usize)) -> Self {
        Self::new(shape.2, shape.1, shape.0)
    }

    /// The ndarray shape `(depth, height, width)` for these dims.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.z, self.y, self.x)
    }

    pub fn voxels(&self) -> usize {
        self.x * self.y * self.z
    }

    pub fn is_multiple_of_four(&self) -> bool {
        self.x % 4 == 0 && self.y % 4 == 0 && self.z % 4 == 0
    }
}

/// Intensity window used to normalize native samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IntensityRange {
    pub min: f32,
    pub max: f32,
}

impl IntensityRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn rebased(self, offset: f32) -> Self {
        Self::new(self.min + offset, self.max + offset)
    }
}

/// Native samples of a volume, indexed `[z, y, x]`.
#[derive(Clone, Debug, PartialEq)]
pub enum Samples {
    Int8(Array3<i8>),
    UInt8(Array3<u8>),
    Int16(Array3<i16>),
    UInt16(Array3<u16>),
    Float32(Array3<f32>),
}

macro_rules! with_samples {
    ($samples:expr, $array:ident => $body:expr) => {
        match $samples {
            Samples::Int8($array) => $body,
            Samples::UInt8($array) => $body,
            Samples::Int16($array) => $body,
            Samples::UInt16($array) => $body,
            Samples::Float32($array) => $body,
        }
    };
}

macro_rules! map_samples {
    ($samples:expr, $array:ident => $body:expr) => {
        match $samples {
            Samples::Int8($array) => Samples::Int8($body),
            Samples::UInt8($array) => Samples::UInt8($body),
            Samples::Int16($array) => Samples::Int16($body),
            Samples::UInt16($array) => Samples::UInt16($body),
            Samples::Float32($array) => Samples::Float32($body),
        }
    };
}

impl Samples {
    pub fn element_type(&self) -> ElementType {
        match self {
            Samples::Int8(_) => ElementType::Int8,
            Samples::UInt8(_) => ElementType::UInt8,
            Samples::Int16(_) => ElementType::Int16,
            Samples::UInt16(_) => ElementType::UInt16,
            Samples::Float32(_) => ElementType::Float32,
        }
    }

    pub fn dims(&self) -> Dims {
        with_samples!(self, array => Dims::from_shape(array.dim()))
    }

    /// Sample at `[z, y, x]` widened to f32.
    #[inline]
    pub fn get_f32(&self, z: usize, y: usize, x: usize) -> f32 {
        with_samples!(self, array => array[[z, y, x]] as f32)
    }

    /// Smallest and largest sample, found with one parallel pass.
    pub fn min_max(&self) -> (f32, f32) {
        with_samples!(self, array => array
            .as_slice_memory_order()
            .map(|values| {
                values
                    .par_iter()
                    .fold(
                        || (f32::INFINITY, f32::NEG_INFINITY),
                        |(lo, hi), &v| (lo.min(v as f32), hi.max(v as f32)),
                    )
                    .reduce(
                        || (f32::INFINITY, f32::NEG_INFINITY),
                        |a, b| (a.0.min(b.0), a.1.max(b.1)),
                    )
            })
            .unwrap_or_else(|| {
                array.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v as f32), hi.max(v as f32))
                })
            }))
    }

    /// Copy out the sub-volume starting at `origin` (x, y, z) with extent `dims`.
    pub fn crop(&self, origin: (usize, usize, usize), dims: Dims) -> Samples {
        let (x0, y0, z0) = origin;
        map_samples!(self, array => array
            .slice(s![z0..z0 + dims.z, y0..y0 + dims.y, x0..x0 + dims.x])
            .to_owned())
    }
}

#[derive(Clone, Debug)]
pub struct Volume {
    pub samples: Samples,
    pub spacing: (f32, f32, f32),
    pub range: IntensityRange,
}

impl Volume {
    pub fn new(samples: Samples, spacing: (f32, f32, f32), range: IntensityRange) -> Self {
        Self {
            samples,
            spacing,
            range,
        }
    }

    /// Get the dimensions of the volume (x, y, z)
    pub fn dims(&self) -> Dims {
        self.samples.dims()
    }

    pub fn element_type(&self) -> ElementType {
        self.samples.element_type()
    }
}
