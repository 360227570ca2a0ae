use ndarray::{Array3, Array4, Axis, Zip};

use crate::{enums::VectorPrecision, volume::Dims};

/// Storage type of one vector field component.
pub trait VectorComponent: Copy + Default + Send + Sync + PartialEq + std::fmt::Debug + 'static {
    const PRECISION: VectorPrecision;

    fn from_f32(value: f32) -> Self;

    fn to_f32(self) -> f32;

    fn wrap(field: Array4<Self>) -> VectorField;
}

impl VectorComponent for i16 {
    const PRECISION: VectorPrecision = VectorPrecision::Snorm16;

    #[inline]
    fn from_f32(value: f32) -> Self {
        (value.clamp(-1.0, 1.0) * 32767.0).round() as i16
    }

    #[inline]
    fn to_f32(self) -> f32 {
        (self as f32 / 32767.0).max(-1.0)
    }

    fn wrap(field: Array4<Self>) -> VectorField {
        VectorField::Snorm16(field)
    }
}

impl VectorComponent for f32 {
    const PRECISION: VectorPrecision = VectorPrecision::Float32;

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    fn wrap(field: Array4<Self>) -> VectorField {
        VectorField::Float32(field)
    }
}

/// Per-voxel vectors stored `[z, y, x, c]` with c = (x, y, z, magnitude).
#[derive(Clone, Debug, PartialEq)]
pub enum VectorField {
    Snorm16(Array4<i16>),
    Float32(Array4<f32>),
}

impl VectorField {
    pub fn precision(&self) -> VectorPrecision {
        match self {
            VectorField::Snorm16(_) => VectorPrecision::Snorm16,
            VectorField::Float32(_) => VectorPrecision::Float32,
        }
    }

    pub fn dims(&self) -> Dims {
        let (z, y, x, _) = match self {
            VectorField::Snorm16(field) => field.dim(),
            VectorField::Float32(field) => field.dim(),
        };
        Dims::new(x, y, z)
    }

    pub fn byte_size(&self) -> u64 {
        self.dims().voxels() as u64 * 4 * self.precision().component_bytes() as u64
    }

    /// Decode to `[z, y, x]` float vectors, dropping the magnitude channel.
    pub fn to_vectors(&self) -> Array3<[f32; 3]> {
        match self {
            VectorField::Snorm16(field) => decode_vectors(field),
            VectorField::Float32(field) => decode_vectors(field),
        }
    }

    /// Encode float vectors at `precision`, recomputing the magnitude channel.
    pub fn from_vectors(vectors: &Array3<[f32; 3]>, precision: VectorPrecision) -> Self {
        match precision {
            VectorPrecision::Snorm16 => encode_vectors::<i16>(vectors),
            VectorPrecision::Float32 => encode_vectors::<f32>(vectors),
        }
    }
}

fn decode_vectors<C: VectorComponent>(field: &Array4<C>) -> Array3<[f32; 3]> {
    let (z, y, x, _) = field.dim();
    let mut vectors = Array3::from_elem((z, y, x), [0.0f32; 3]);
    Zip::from(&mut vectors)
        .and(field.lanes(Axis(3)))
        .par_for_each(|v, lane| *v = [lane[0].to_f32(), lane[1].to_f32(), lane[2].to_f32()]);
    vectors
}

fn encode_vectors<C: VectorComponent>(vectors: &Array3<[f32; 3]>) -> VectorField {
    let (z, y, x) = vectors.dim();
    let mut field = Array4::<C>::default((z, y, x, 4));
    Zip::from(field.lanes_mut(Axis(3)))
        .and(vectors)
        .par_for_each(|mut lane, v| {
            let magnitude = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
            lane[0] = C::from_f32(v[0]);
            lane[1] = C::from_f32(v[1]);
            lane[2] = C::from_f32(v[2]);
            lane[3] = C::from_f32(magnitude);
        });
    C::wrap(field)
}

/// Per-voxel scalar output (TDF), unsigned normalized 16-bit or float.
#[derive(Clone, Debug, PartialEq)]
pub enum ScalarField {
    Unorm16(Array3<u16>),
    Float32(Array3<f32>),
}

impl ScalarField {
    pub fn from_f32(values: &Array3<f32>, precision: VectorPrecision) -> Self {
        match precision {
            VectorPrecision::Snorm16 => ScalarField::Unorm16(
                Zip::from(values).par_map_collect(|&v| (v.clamp(0.0, 1.0) * 65535.0).round() as u16),
            ),
            VectorPrecision::Float32 => ScalarField::Float32(values.clone()),
        }
    }

    pub fn to_f32(&self) -> Array3<f32> {
        match self {
            ScalarField::Unorm16(values) => Zip::from(values).par_map_collect(|&v| v as f32 / 65535.0),
            ScalarField::Float32(values) => values.clone(),
        }
    }

    pub fn precision(&self) -> VectorPrecision {
        match self {
            ScalarField::Unorm16(_) => VectorPrecision::Snorm16,
            ScalarField::Float32(_) => VectorPrecision::Float32,
        }
    }

    pub fn dims(&self) -> Dims {
        match self {
            ScalarField::Unorm16(values) => Dims::from_shape(values.dim()),
            ScalarField::Float32(values) => Dims::from_shape(values.dim()),
        }
    }
}

/// Final outputs of the tube detection filter.
#[derive(Clone, Debug, PartialEq)]
pub struct TubeFields {
    pub vector_field: VectorField,
    /// Tube detectness, in [0, 1]
    pub tdf: ScalarField,
    /// Estimated tube radius in voxels
    pub radius: Array3<f32>,
}
