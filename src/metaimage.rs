use ndarray::Array3;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use crate::volume::Dims;
use crate::volume_loader::VolumeLoaderError;

/// Sample type of a MetaImage raw file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Float32,
}

impl ElementType {
    pub fn from_met_name(name: &str) -> Option<Self> {
        match name {
            "MET_CHAR" => Some(ElementType::Int8),
            "MET_UCHAR" => Some(ElementType::UInt8),
            "MET_SHORT" => Some(ElementType::Int16),
            "MET_USHORT" => Some(ElementType::UInt16),
            "MET_FLOAT" => Some(ElementType::Float32),
            _ => None,
        }
    }

    pub fn met_name(self) -> &'static str {
        match self {
            ElementType::Int8 => "MET_CHAR",
            ElementType::UInt8 => "MET_UCHAR",
            ElementType::Int16 => "MET_SHORT",
            ElementType::UInt16 => "MET_USHORT",
            ElementType::Float32 => "MET_FLOAT",
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            ElementType::Int8 | ElementType::UInt8 => 1,
            ElementType::Int16 | ElementType::UInt16 => 2,
            ElementType::Float32 => 4,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, ElementType::UInt8 | ElementType::UInt16)
    }
}

/// The fields of a `.mhd` header this crate consumes.
#[derive(Clone, Debug, PartialEq)]
pub struct MetaHeader {
    pub element_type: ElementType,
    /// Already resolved against the header's directory
    pub data_file: PathBuf,
    pub dims: Dims,
    pub spacing: (f32, f32, f32),
}

impl MetaHeader {
    pub fn read(path: &Path) -> Result<Self, VolumeLoaderError> {
        let text = fs::read_to_string(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
        Self::parse(&text, base_dir)
    }

    /// Parse header text. Lines look like `Key = v1 v2` or `Key v1 v2`.
    pub fn parse(text: &str, base_dir: &Path) -> Result<Self, VolumeLoaderError> {
        let mut type_name = None;
        let mut data_file = None;
        let mut dims = None;
        let mut spacing = (1.0, 1.0, 1.0);

        for line in text.lines() {
            let Some((key, values)) = split_entry(line) else {
                continue;
            };
            match key {
                "ElementType" => type_name = values.first().map(|v| v.to_string()),
                "ElementDataFile" => data_file = values.first().map(|v| base_dir.join(v)),
                "DimSize" => dims = Some(parse_dims(&values)?),
                "ElementSpacing" => spacing = parse_spacing(&values)?,
                _ => {}
            }
        }

        let type_name = type_name.ok_or(VolumeLoaderError::Format("ElementType not found"))?;
        let data_file = data_file.ok_or(VolumeLoaderError::Format("ElementDataFile not found"))?;
        let dims = dims.ok_or(VolumeLoaderError::Format("DimSize not found"))?;
        let element_type = ElementType::from_met_name(&type_name)
            .ok_or(VolumeLoaderError::UnsupportedType(type_name))?;

        Ok(Self {
            element_type,
            data_file,
            dims,
            spacing,
        })
    }
}

fn split_entry(line: &str) -> Option<(&str, Vec<&str>)> {
    let mut tokens = line.split_whitespace();
    let key = tokens.next()?;
    // `Key=value` without spaces is accepted as well
    let (key, inline) = match key.split_once('=') {
        Some((key, rest)) => (key, Some(rest)),
        None => (key, None),
    };
    let values = inline
        .into_iter()
        .chain(tokens)
        .filter(|token| !token.is_empty() && *token != "=")
        .map(|token| token.trim_start_matches('='))
        .collect();
    Some((key, values))
}

fn parse_dims(values: &[&str]) -> Result<Dims, VolumeLoaderError> {
    let parsed: Vec<usize> = values
        .iter()
        .map(|v| v.parse::<usize>())
        .collect::<Result<_, _>>()
        .map_err(|_| VolumeLoaderError::Format("DimSize must hold integers"))?;
    match parsed.as_slice() {
        [x, y, z] if *x > 0 && *y > 0 && *z > 0 => Ok(Dims::new(*x, *y, *z)),
        _ => Err(VolumeLoaderError::Format(
            "DimSize must hold three positive sizes",
        )),
    }
}

fn parse_spacing(values: &[&str]) -> Result<(f32, f32, f32), VolumeLoaderError> {
    let parsed: Vec<f32> = values
        .iter()
        .map(|v| v.parse::<f32>())
        .collect::<Result<_, _>>()
        .map_err(|_| VolumeLoaderError::Format("ElementSpacing must hold numbers"))?;
    match parsed.as_slice() {
        [x, y, z] => Ok((*x, *y, *z)),
        _ => Err(VolumeLoaderError::Format(
            "ElementSpacing must hold three values",
        )),
    }
}

/// Write a float volume as a `MET_FLOAT` header/raw pair named `<name>.mhd`/`<name>.raw`.
pub fn write_metaimage(
    directory: &Path,
    name: &str,
    data: &Array3<f32>,
    spacing: (f32, f32, f32),
) -> Result<PathBuf, VolumeLoaderError> {
    fs::create_dir_all(directory)?;
    let dims = Dims::from_shape(data.dim());
    let raw_name = format!("{name}.raw");
    let header_path = directory.join(format!("{name}.mhd"));

    let mut header = fs::File::create(&header_path)?;
    writeln!(header, "ObjectType = Image")?;
    writeln!(header, "NDims = 3")?;
    writeln!(header, "DimSize = {} {} {}", dims.x, dims.y, dims.z)?;
    writeln!(
        header,
        "ElementSpacing = {} {} {}",
        spacing.0, spacing.1, spacing.2
    )?;
    writeln!(header, "ElementType = {}", ElementType::Float32.met_name())?;
    writeln!(header, "ElementDataFile = {raw_name}")?;

    let samples: Vec<f32> = data.iter().copied().collect();
    fs::write(directory.join(raw_name), bytemuck::cast_slice::<f32, u8>(&samples))?;

    Ok(header_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_equals_separated_header() {
        let text = "ObjectType = Image\nNDims = 3\nDimSize = 8 6 4\nElementSpacing = 0.5 0.5 1.25\nElementType = MET_SHORT\nElementDataFile = scan.raw\n";
        let header = MetaHeader::parse(text, Path::new("/data/ct")).unwrap();
        assert_eq!(header.element_type, ElementType::Int16);
        assert_eq!(header.dims, Dims::new(8, 6, 4));
        assert_eq!(header.spacing, (0.5, 0.5, 1.25));
        assert_eq!(header.data_file, PathBuf::from("/data/ct/scan.raw"));
    }

    #[test]
    fn parses_space_separated_header_with_default_spacing() {
        let text = "ElementType MET_UCHAR\nElementDataFile volume.raw\nDimSize 4 4 4\n";
        let header = MetaHeader::parse(text, Path::new("")).unwrap();
        assert_eq!(header.element_type, ElementType::UInt8);
        assert_eq!(header.spacing, (1.0, 1.0, 1.0));
        assert_eq!(header.data_file, PathBuf::from("volume.raw"));
    }

    #[test]
    fn missing_required_field_is_a_format_error() {
        let text = "ElementType = MET_FLOAT\nDimSize = 4 4 4\n";
        let err = MetaHeader::parse(text, Path::new("")).unwrap_err();
        assert!(matches!(err, VolumeLoaderError::Format(_)));
    }

    #[test]
    fn degenerate_dims_are_a_format_error() {
        let text = "ElementType = MET_FLOAT\nElementDataFile = a.raw\nDimSize = 4 0 4\n";
        let err = MetaHeader::parse(text, Path::new("")).unwrap_err();
        assert!(matches!(err, VolumeLoaderError::Format(_)));
    }

    #[test]
    fn unknown_element_type_is_unsupported() {
        let text = "ElementType = MET_DOUBLE\nElementDataFile = a.raw\nDimSize = 4 4 4\n";
        let err = MetaHeader::parse(text, Path::new("")).unwrap_err();
        match err {
            VolumeLoaderError::UnsupportedType(name) => assert_eq!(name, "MET_DOUBLE"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn written_volume_reads_back_as_header() {
        let dir = tempfile::tempdir().unwrap();
        let data = Array3::<f32>::from_elem((4, 3, 2), 0.25);
        let path = write_metaimage(dir.path(), "tdf", &data, (1.0, 2.0, 3.0)).unwrap();
        let header = MetaHeader::read(&path).unwrap();
        assert_eq!(header.dims, Dims::new(2, 3, 4));
        assert_eq!(header.element_type, ElementType::Float32);
        assert_eq!(header.spacing, (1.0, 2.0, 3.0));
        assert_eq!(fs::metadata(header.data_file).unwrap().len(), 4 * 3 * 2 * 4);
    }
}
