use serde::{Deserialize, Serialize};

/// Volume axis in (x, y, z) order. Arrays are stored `[z, y, x]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// Polarity of the structures to enhance relative to the background.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    /// Tubes brighter than the background (contrast enhanced vessels)
    #[default]
    Bright,
    /// Tubes darker than the background (airways)
    Dark,
}

impl Polarity {
    pub fn sign(self) -> f32 {
        match self {
            Polarity::Bright => 1.0,
            Polarity::Dark => -1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CroppingPolicy {
    #[default]
    Off,
    Lung,
    Threshold,
}

/// Where the z scan of the bounding-box crop starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CroppingStartZ {
    #[default]
    Middle,
    End,
}

/// Named parameter presets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preset {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "Lung-Airways-CT")]
    LungAirwaysCt,
    #[serde(rename = "AAA-Vessels-CT")]
    AaaVesselsCt,
    #[serde(rename = "Synthetic")]
    Synthetic,
}

impl Preset {
    pub fn name(self) -> &'static str {
        match self {
            Preset::None => "none",
            Preset::LungAirwaysCt => "Lung-Airways-CT",
            Preset::AaaVesselsCt => "AAA-Vessels-CT",
            Preset::Synthetic => "Synthetic",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            Preset::None,
            Preset::LungAirwaysCt,
            Preset::AaaVesselsCt,
            Preset::Synthetic,
        ]
        .into_iter()
        .find(|preset| preset.name() == name)
    }

    /// CT presets shift the Hounsfield range by +1024 for unsigned 16-bit data.
    pub fn rebases_unsigned_intensity(self) -> bool {
        matches!(self, Preset::LungAirwaysCt | Preset::AaaVesselsCt)
    }
}

/// Storage precision of vector field components (and of the TDF).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorPrecision {
    /// Signed normalized 16-bit components, unsigned normalized 16-bit TDF
    Snorm16,
    Float32,
}

impl VectorPrecision {
    pub fn component_bytes(self) -> usize {
        match self {
            VectorPrecision::Snorm16 => 2,
            VectorPrecision::Float32 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GvfVariant {
    Standard,
    /// Quantizes between sweeps and updates in place; one field resident instead of two
    LowMemory,
    Multigrid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TdfMethod {
    CircleFitting,
    Spline,
}

impl TdfMethod {
    /// Smallest radius the method is run with during the large-radius pass.
    pub fn radius_floor(self) -> f32 {
        match self {
            TdfMethod::CircleFitting => 2.5,
            TdfMethod::Spline => 1.5,
        }
    }
}
