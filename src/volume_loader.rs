use crate::{
    config::TubeConfig,
    enums::Preset,
    metaimage::{ElementType, MetaHeader},
    volume::{Dims, IntensityRange, Samples, Volume},
};

use memmap2::MmapOptions;
use ndarray::Array3;
use std::{fs::File, path::Path};
use thiserror::Error;
use tracing::{debug, info};

/// Offset between Hounsfield units and unsigned CT storage.
const UNSIGNED_CT_OFFSET: f32 = 1024.0;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("Malformed header: {0}")]
    Format(&'static str),

    #[error("Unsupported element type {0}")]
    UnsupportedType(String),

    #[error("Raw file {path} holds {actual} bytes, expected at least {expected}")]
    RawSize {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The options of the loader that come from the configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadOptions {
    pub minimum: Option<f32>,
    pub maximum: Option<f32>,
    pub preset: Preset,
}

impl From<&TubeConfig> for LoadOptions {
    fn from(config: &TubeConfig) -> Self {
        Self {
            minimum: config.minimum,
            maximum: config.maximum,
            preset: config.preset,
        }
    }
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a volume from a MetaImage header and its raw sample file
    ///
    /// # Arguments
    ///
    /// * `header_path` - Path to the `.mhd` header
    /// * `options` - Explicit intensity bounds and the active preset
    ///
    /// # Errors
    ///
    /// Returns error if the header misses a required field, names an unsupported
    /// element type, or the raw file is too short
    pub fn load(header_path: &Path, options: &LoadOptions) -> Result<Volume, VolumeLoaderError> {
        let header = MetaHeader::read(header_path)?;
        let samples = Self::map_samples(&header)?;
        info!(
            x = header.dims.x,
            y = header.dims.y,
            z = header.dims.z,
            element_type = header.element_type.met_name(),
            "dataset loaded"
        );

        let range = Self::resolve_range(&samples, options);
        Ok(Volume::new(samples, header.spacing, range))
    }

    fn map_samples(header: &MetaHeader) -> Result<Samples, VolumeLoaderError> {
        let dims = header.dims;
        let expected = (dims.voxels() * header.element_type.size_in_bytes()) as u64;
        let file = File::open(&header.data_file)?;
        let actual = file.metadata()?.len();
        if actual < expected {
            return Err(VolumeLoaderError::RawSize {
                path: header.data_file.display().to_string(),
                expected,
                actual,
            });
        }

        // The length check above keeps every access inside the file.
        let mmap = unsafe { MmapOptions::new().len(expected as usize).map(&file)? };
        let bytes = &mmap[..];

        let samples = match header.element_type {
            ElementType::Int8 => Samples::Int8(Self::to_array(bytes, dims)?),
            ElementType::UInt8 => Samples::UInt8(Self::to_array(bytes, dims)?),
            ElementType::Int16 => Samples::Int16(Self::to_array(bytes, dims)?),
            ElementType::UInt16 => Samples::UInt16(Self::to_array(bytes, dims)?),
            ElementType::Float32 => Samples::Float32(Self::to_array(bytes, dims)?),
        };
        Ok(samples)
    }

    fn to_array<T: bytemuck::Pod>(
        bytes: &[u8],
        dims: Dims,
    ) -> Result<Array3<T>, VolumeLoaderError> {
        // Copies, so the mapping needs no particular alignment
        let values: Vec<T> = bytemuck::pod_collect_to_vec(bytes);
        Array3::from_shape_vec(dims.shape(), values)
            .map_err(|_| VolumeLoaderError::Format("DimSize does not match the raw data"))
    }

    fn resolve_range(samples: &Samples, options: &LoadOptions) -> IntensityRange {
        let scanned = match (options.minimum, options.maximum) {
            (Some(_), Some(_)) => None,
            _ => Some(samples.min_max()),
        };

        let minimum = options.minimum.unwrap_or_else(|| {
            let value = scanned.map_or(0.0, |(lo, _)| lo);
            info!(minimum = value, "minimum not set, found automatically");
            value
        });
        let maximum = options.maximum.unwrap_or_else(|| {
            let value = scanned.map_or(1.0, |(_, hi)| hi);
            info!(maximum = value, "maximum not set, found automatically");
            value
        });
        let range = IntensityRange::new(minimum, maximum);

        if options.preset.rebases_unsigned_intensity()
            && samples.element_type() == ElementType::UInt16
        {
            let rebased = range.rebased(UNSIGNED_CT_OFFSET);
            debug!(
                preset = options.preset.name(),
                min = rebased.min,
                max = rebased.max,
                "unsigned CT data, intensity range rebased"
            );
            return rebased;
        }
        range
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, path::PathBuf};

    fn write_dataset(dir: &Path, element_type: &str, dims: &str, raw: &[u8]) -> PathBuf {
        let header = dir.join("volume.mhd");
        fs::write(
            &header,
            format!(
                "ObjectType = Image\nNDims = 3\nDimSize = {dims}\nElementType = {element_type}\nElementDataFile = volume.raw\n"
            ),
        )
        .unwrap();
        fs::write(dir.join("volume.raw"), raw).unwrap();
        header
    }

    #[test]
    fn float_volume_range_is_detected_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let values: Vec<f32> = (0..512).map(|i| (i as f32 * 0.37).sin() * 250.0).collect();
        let expected_min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let expected_max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let header = write_dataset(
            dir.path(),
            "MET_FLOAT",
            "8 8 8",
            bytemuck::cast_slice(&values),
        );

        let volume = VolumeLoader::load(&header, &LoadOptions::default()).unwrap();
        assert_eq!(volume.dims(), Dims::new(8, 8, 8));
        assert_eq!(volume.spacing, (1.0, 1.0, 1.0));
        assert_eq!(volume.range.min, expected_min);
        assert_eq!(volume.range.max, expected_max);
    }

    #[test]
    fn explicit_bounds_are_used_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let raw: Vec<u8> = (0..64).collect();
        let header = write_dataset(dir.path(), "MET_UCHAR", "4 4 4", &raw);
        let options = LoadOptions {
            minimum: Some(-5.0),
            maximum: None,
            preset: Preset::None,
        };

        let volume = VolumeLoader::load(&header, &options).unwrap();
        assert_eq!(volume.range, IntensityRange::new(-5.0, 63.0));
    }

    #[test]
    fn unsigned_ct_presets_rebase_the_range() {
        let dir = tempfile::tempdir().unwrap();
        let values: Vec<u16> = (0..64).map(|i| i * 10).collect();
        let header = write_dataset(dir.path(), "MET_USHORT", "4 4 4", bytemuck::cast_slice(&values));
        let options = LoadOptions {
            minimum: Some(-1024.0),
            maximum: Some(400.0),
            preset: Preset::LungAirwaysCt,
        };

        let volume = VolumeLoader::load(&header, &options).unwrap();
        assert_eq!(volume.range, IntensityRange::new(0.0, 1424.0));
        // The options themselves are untouched
        assert_eq!(options.minimum, Some(-1024.0));
    }

    #[test]
    fn signed_data_is_not_rebased() {
        let dir = tempfile::tempdir().unwrap();
        let values: Vec<i16> = (0..64).map(|i| i - 32).collect();
        let header = write_dataset(dir.path(), "MET_SHORT", "4 4 4", bytemuck::cast_slice(&values));
        let options = LoadOptions {
            preset: Preset::AaaVesselsCt,
            ..LoadOptions::default()
        };

        let volume = VolumeLoader::load(&header, &options).unwrap();
        assert_eq!(volume.range, IntensityRange::new(-32.0, 31.0));
    }

    #[test]
    fn short_raw_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let header = write_dataset(dir.path(), "MET_FLOAT", "4 4 4", &[0u8; 16]);
        let err = VolumeLoader::load(&header, &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, VolumeLoaderError::RawSize { expected: 256, actual: 16, .. }));
    }

    #[test]
    fn unsupported_type_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let header = write_dataset(dir.path(), "MET_DOUBLE", "4 4 4", &[0u8; 512]);
        let err = VolumeLoader::load(&header, &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, VolumeLoaderError::UnsupportedType(_)));
    }
}
