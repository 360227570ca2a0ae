//! Typed configuration of the tube enhancement pipeline.
//!
//! Options keep the kebab-case names of the command line (`radius-min`,
//! `16bit-vectors`, ...) both in JSON files and in [`TubeConfig::set_option`].

use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use thiserror::Error;

use crate::enums::{CroppingPolicy, CroppingStartZ, Polarity, Preset};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown option {0}")]
    UnknownOption(String),

    #[error("Invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Valid interval and granularity of a numeric option.
struct NumericRange {
    name: &'static str,
    min: f32,
    max: f32,
    step: Option<f32>,
}

const NUMERIC_OPTIONS: &[NumericRange] = &[
    NumericRange { name: "radius-min", min: 0.5, max: 100.0, step: Some(0.5) },
    NumericRange { name: "radius-max", min: 0.5, max: 100.0, step: Some(0.5) },
    NumericRange { name: "radius-step", min: 0.1, max: 10.0, step: None },
    NumericRange { name: "fmax", min: 0.001, max: 10.0, step: None },
    NumericRange { name: "small-blur", min: 0.0, max: 5.0, step: None },
    NumericRange { name: "large-blur", min: 0.0, max: 5.0, step: None },
    NumericRange { name: "cropping-threshold", min: -5000.0, max: 5000.0, step: None },
    NumericRange { name: "min-scan-lines-lung", min: 0.0, max: 65535.0, step: Some(1.0) },
    NumericRange { name: "min-scan-lines-threshold", min: 0.0, max: 65535.0, step: Some(1.0) },
    NumericRange { name: "gvf-iterations", min: 0.0, max: 10000.0, step: Some(1.0) },
    NumericRange { name: "gvf-mu", min: 0.0, max: 0.08, step: None },
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TubeConfig {
    #[serde(rename = "parameters")]
    pub preset: Preset,
    pub radius_min: f32,
    pub radius_max: f32,
    pub radius_step: f32,
    /// Gradient magnitude at which vector field vectors saturate
    pub fmax: f32,
    pub mode: Polarity,
    pub small_blur: f32,
    pub large_blur: f32,
    pub cropping: CroppingPolicy,
    pub cropping_threshold: f32,
    pub min_scan_lines_lung: u32,
    pub min_scan_lines_threshold: u32,
    pub cropping_start_z: CroppingStartZ,
    #[serde(with = "bound")]
    pub minimum: Option<f32>,
    #[serde(with = "bound")]
    pub maximum: Option<f32>,
    #[serde(rename = "16bit-vectors")]
    pub vectors_16bit: bool,
    #[serde(rename = "32bit-vectors")]
    pub vectors_32bit: bool,
    pub use_fmg_gvf: bool,
    pub use_spline_tdf: bool,
    pub tdf_only: bool,
    pub no_segmentation: bool,
    pub gvf_iterations: u32,
    pub gvf_mu: f32,
    /// Stage every device write through linear buffers
    pub buffers_only: bool,
    pub timing: bool,
}

impl Default for TubeConfig {
    fn default() -> Self {
        Self {
            preset: Preset::None,
            radius_min: 0.5,
            radius_max: 6.0,
            radius_step: 0.5,
            fmax: 0.1,
            mode: Polarity::Bright,
            small_blur: 0.0,
            large_blur: 1.0,
            cropping: CroppingPolicy::Off,
            cropping_threshold: -100.0,
            min_scan_lines_lung: 10,
            min_scan_lines_threshold: 1,
            cropping_start_z: CroppingStartZ::Middle,
            minimum: None,
            maximum: None,
            vectors_16bit: false,
            vectors_32bit: false,
            use_fmg_gvf: false,
            use_spline_tdf: false,
            tdf_only: false,
            no_segmentation: false,
            gvf_iterations: 250,
            gvf_mu: 0.05,
            buffers_only: false,
            timing: false,
        }
    }
}

impl TubeConfig {
    /// Defaults of a named preset.
    pub fn for_preset(preset: Preset) -> Self {
        let base = Self {
            preset,
            ..Self::default()
        };
        match preset {
            Preset::None => base,
            Preset::LungAirwaysCt => Self {
                cropping: CroppingPolicy::Lung,
                mode: Polarity::Dark,
                minimum: Some(-1024.0),
                maximum: Some(400.0),
                radius_max: 25.0,
                small_blur: 0.5,
                fmax: 0.2,
                ..base
            },
            Preset::AaaVesselsCt => Self {
                mode: Polarity::Bright,
                minimum: Some(0.0),
                maximum: Some(500.0),
                radius_min: 1.5,
                radius_max: 7.0,
                fmax: 0.1,
                ..base
            },
            Preset::Synthetic => Self {
                radius_min: 1.0,
                radius_max: 5.0,
                gvf_iterations: 50,
                ..base
            },
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Set a named option from its textual value.
    ///
    /// Boolean options accept an empty value (switch on), `true` or `false`.
    /// Setting `parameters` replaces the whole configuration with the preset.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        };

        if let Some(flag) = self.flag_mut(name) {
            *flag = match value {
                "" | "true" => true,
                "false" => false,
                _ => return Err(invalid()),
            };
            return Ok(());
        }

        if let Some(range) = NUMERIC_OPTIONS.iter().find(|range| range.name == name) {
            let number: f32 = value.parse().map_err(|_| invalid())?;
            if !range.accepts(number) {
                return Err(invalid());
            }
            self.set_numeric(name, number);
            return Ok(());
        }

        match name {
            "parameters" => {
                let preset = Preset::from_name(value).ok_or_else(invalid)?;
                *self = Self::for_preset(preset);
            }
            "mode" => {
                self.mode = match value {
                    "bright" | "white" => Polarity::Bright,
                    "dark" | "black" => Polarity::Dark,
                    _ => return Err(invalid()),
                }
            }
            "cropping" => {
                self.cropping = match value {
                    "off" => CroppingPolicy::Off,
                    "lung" => CroppingPolicy::Lung,
                    "threshold" => CroppingPolicy::Threshold,
                    _ => return Err(invalid()),
                }
            }
            "cropping-start-z" => {
                self.cropping_start_z = match value {
                    "middle" => CroppingStartZ::Middle,
                    "end" => CroppingStartZ::End,
                    _ => return Err(invalid()),
                }
            }
            "minimum" => self.minimum = bound::parse(value).ok_or_else(invalid)?,
            "maximum" => self.maximum = bound::parse(value).ok_or_else(invalid)?,
            _ => return Err(ConfigError::UnknownOption(name.to_string())),
        }
        Ok(())
    }

    fn flag_mut(&mut self, name: &str) -> Option<&mut bool> {
        match name {
            "16bit-vectors" => Some(&mut self.vectors_16bit),
            "32bit-vectors" => Some(&mut self.vectors_32bit),
            "use-fmg-gvf" => Some(&mut self.use_fmg_gvf),
            "use-spline-tdf" => Some(&mut self.use_spline_tdf),
            "tdf-only" => Some(&mut self.tdf_only),
            "no-segmentation" => Some(&mut self.no_segmentation),
            "buffers-only" => Some(&mut self.buffers_only),
            "timing" => Some(&mut self.timing),
            _ => None,
        }
    }

    fn set_numeric(&mut self, name: &str, value: f32) {
        match name {
            "radius-min" => self.radius_min = value,
            "radius-max" => self.radius_max = value,
            "radius-step" => self.radius_step = value,
            "fmax" => self.fmax = value,
            "small-blur" => self.small_blur = value,
            "large-blur" => self.large_blur = value,
            "cropping-threshold" => self.cropping_threshold = value,
            "min-scan-lines-lung" => self.min_scan_lines_lung = value as u32,
            "min-scan-lines-threshold" => self.min_scan_lines_threshold = value as u32,
            "gvf-iterations" => self.gvf_iterations = value as u32,
            "gvf-mu" => self.gvf_mu = value,
            _ => {}
        }
    }
}

impl NumericRange {
    fn accepts(&self, value: f32) -> bool {
        if !(self.min..=self.max).contains(&value) {
            return false;
        }
        self.step.is_none_or(|step| {
            let steps = (value - self.min) / step;
            (steps - steps.round()).abs() < 1e-4
        })
    }
}

/// `minimum`/`maximum` are either `"off"` or a number.
mod bound {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(value: &str) -> Option<Option<f32>> {
        match value {
            "off" => Some(None),
            _ => value.parse().ok().map(Some),
        }
    }

    pub fn serialize<S: Serializer>(value: &Option<f32>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_f32(*v),
            None => serializer.serialize_str("off"),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f32),
        Text(String),
        Null(()),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f32>, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(v) => Ok(Some(v)),
            Raw::Null(()) => Ok(None),
            Raw::Text(text) => parse(&text)
                .ok_or_else(|| serde::de::Error::custom(format!("expected \"off\" or a number, got {text:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_options_are_validated() {
        let mut config = TubeConfig::default();
        config.set_option("radius-max", "2").unwrap();
        config.set_option("mode", "black").unwrap();
        config.set_option("cropping", "threshold").unwrap();
        config.set_option("cropping-start-z", "end").unwrap();
        config.set_option("minimum", "-200").unwrap();
        config.set_option("use-spline-tdf", "").unwrap();

        assert_eq!(config.radius_max, 2.0);
        assert_eq!(config.mode, Polarity::Dark);
        assert_eq!(config.cropping, CroppingPolicy::Threshold);
        assert_eq!(config.cropping_start_z, CroppingStartZ::End);
        assert_eq!(config.minimum, Some(-200.0));
        assert!(config.use_spline_tdf);

        config.set_option("minimum", "off").unwrap();
        assert_eq!(config.minimum, None);
    }

    #[test]
    fn out_of_range_or_off_step_values_are_rejected() {
        let mut config = TubeConfig::default();
        assert!(matches!(
            config.set_option("radius-min", "0.75"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.set_option("fmax", "-1"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.set_option("cropping", "liver"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.set_option("sphere-segmentation", ""),
            Err(ConfigError::UnknownOption(_))
        ));
        assert_eq!(config, TubeConfig::default());
    }

    #[test]
    fn preset_option_replaces_the_configuration() {
        let mut config = TubeConfig::default();
        config.set_option("parameters", "Lung-Airways-CT").unwrap();
        assert_eq!(config.preset, Preset::LungAirwaysCt);
        assert_eq!(config.cropping, CroppingPolicy::Lung);
        assert_eq!(config.mode, Polarity::Dark);
    }

    #[test]
    fn json_uses_option_names() {
        let config: TubeConfig = serde_json::from_str(
            r#"{ "parameters": "AAA-Vessels-CT", "radius-min": 1.0, "16bit-vectors": true, "minimum": "off", "maximum": 300 }"#,
        )
        .unwrap();
        assert_eq!(config.preset, Preset::AaaVesselsCt);
        assert_eq!(config.radius_min, 1.0);
        assert!(config.vectors_16bit);
        assert_eq!(config.minimum, None);
        assert_eq!(config.maximum, Some(300.0));
        // Unlisted options keep their defaults
        assert_eq!(config.radius_step, 0.5);

        let text = serde_json::to_string(&config).unwrap();
        let back: TubeConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
