use ndarray::{Array3, Zip};
use tracing::{debug, warn};

use crate::volume::{IntensityRange, Samples};

/// Maps native samples onto [0, 1] floats within an intensity window.
pub struct FormatNormalizer;

impl FormatNormalizer {
    pub fn normalize(samples: &Samples, range: IntensityRange) -> Array3<f32> {
        let dims = samples.dims();
        let span = range.max - range.min;
        if span <= 0.0 {
            warn!(
                min = range.min,
                max = range.max,
                "degenerate intensity range, normalized volume is all zeros"
            );
            return Array3::zeros(dims.shape());
        }

        debug!(?dims, min = range.min, max = range.max, "normalizing");
        let scale = 1.0 / span;
        match samples {
            Samples::Int8(a) => Zip::from(a).par_map_collect(|&v| unit(v as f32, range.min, scale)),
            Samples::UInt8(a) => Zip::from(a).par_map_collect(|&v| unit(v as f32, range.min, scale)),
            Samples::Int16(a) => Zip::from(a).par_map_collect(|&v| unit(v as f32, range.min, scale)),
            Samples::UInt16(a) => Zip::from(a).par_map_collect(|&v| unit(v as f32, range.min, scale)),
            Samples::Float32(a) => Zip::from(a).par_map_collect(|&v| unit(v, range.min, scale)),
        }
    }
}

#[inline]
fn unit(value: f32, min: f32, scale: f32) -> f32 {
    ((value - min) * scale).clamp(0.0, 1.0)
}
