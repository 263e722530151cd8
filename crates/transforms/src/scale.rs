use image::imageops::{self, FilterType};
use rand::{Rng, RngCore};

use crate::{
    compose::Transform,
    errors::{Error, Result},
    types::{ImageData, Sample},
};

/// Resizes so that the longer side equals `long_edge`.
#[derive(Debug, Clone, Copy)]
pub struct RescaleAbsolute {
    pub long_edge: u32,
}

impl RescaleAbsolute {
    pub fn new(long_edge: u32) -> Result<Self> {
        if long_edge == 0 {
            return Err(Error::InvalidConfig(
                "rescale long_edge must be greater than zero".to_string(),
            ));
        }
        Ok(Self { long_edge })
    }
}

impl Transform for RescaleAbsolute {
    fn apply(&self, sample: Sample, _rng: &mut dyn RngCore) -> Result<Sample> {
        let (w, h) = sample.image.size()?;
        let factor = self.long_edge as f32 / w.max(h).max(1) as f32;
        rescale(sample, factor)
    }
}

/// Resizes by a factor drawn uniformly from `scale_range`.
#[derive(Debug, Clone, Copy)]
pub struct RescaleRelative {
    pub scale_range: (f32, f32),
}

impl RescaleRelative {
    pub fn new(min: f32, max: f32) -> Result<Self> {
        if !(min > 0.0 && min <= max) {
            return Err(Error::InvalidConfig(format!(
                "rescale range must satisfy 0 < min <= max (got {min}..{max})"
            )));
        }
        Ok(Self {
            scale_range: (min, max),
        })
    }
}

impl Transform for RescaleRelative {
    fn apply(&self, sample: Sample, rng: &mut dyn RngCore) -> Result<Sample> {
        let (min, max) = self.scale_range;
        let factor = if min < max { rng.gen_range(min..=max) } else { min };
        rescale(sample, factor)
    }
}

/// Rescales the whole image when every person in it is on the same side
/// of `scale_threshold`: images of only large people are shrunk by
/// `downscale_factor`, images of only small people are enlarged by
/// `upscale_factor`. Mixed images pass through.
///
/// Person size is `sqrt(w * h)` of the bounding box, over non-crowd
/// annotations with at least one visible keypoint.
#[derive(Debug, Clone, Copy)]
pub struct ScaleMix {
    pub scale_threshold: f32,
    pub upscale_factor: f32,
    pub downscale_factor: f32,
}

impl ScaleMix {
    pub fn new(scale_threshold: f32) -> Self {
        Self {
            scale_threshold,
            upscale_factor: 2.0,
            downscale_factor: 0.5,
        }
    }
}

impl Transform for ScaleMix {
    fn apply(&self, sample: Sample, _rng: &mut dyn RngCore) -> Result<Sample> {
        let sizes: Vec<f32> = sample
            .annotations
            .iter()
            .filter(|ann| !ann.iscrowd && ann.keypoints.iter().any(|kp| kp[2] > 0.0))
            .filter_map(|ann| ann.bbox.map(|[_, _, w, h]| (w * h).max(0.0).sqrt()))
            .collect();
        if sizes.is_empty() {
            return Ok(sample);
        }

        let factor = if sizes.iter().all(|&s| s > self.scale_threshold) {
            self.downscale_factor
        } else if sizes.iter().all(|&s| s < self.scale_threshold) {
            self.upscale_factor
        } else {
            return Ok(sample);
        };
        rescale(sample, factor)
    }
}

pub(crate) fn rescale(mut sample: Sample, factor: f32) -> Result<Sample> {
    let img = sample.image.into_pixels()?;
    let (w, h) = img.dimensions();
    let new_w = ((w as f32 * factor).round() as u32).max(1);
    let new_h = ((h as f32 * factor).round() as u32).max(1);

    let img = if (new_w, new_h) == (w, h) {
        img
    } else {
        imageops::resize(&img, new_w, new_h, FilterType::Triangle)
    };
    sample.image = ImageData::Pixels(img);

    // Rounding makes the effective factor differ slightly per axis.
    let sx = new_w as f32 / w.max(1) as f32;
    let sy = new_h as f32 / h.max(1) as f32;
    for ann in &mut sample.annotations {
        ann.rescale(sx, sy);
    }

    let meta = &mut sample.meta;
    meta.offset[0] *= sx;
    meta.offset[1] *= sy;
    meta.scale[0] *= sx;
    meta.scale[1] *= sy;
    meta.valid_area[0] *= sx;
    meta.valid_area[1] *= sy;
    meta.valid_area[2] *= sx;
    meta.valid_area[3] *= sy;

    Ok(sample)
}
