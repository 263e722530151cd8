use image::imageops;
use rand::RngCore;

use crate::{
    compose::Transform,
    errors::{Error, Result},
    types::{ImageData, Sample},
};

/// Horizontal mirror. Keypoints are mirrored and then re-ordered so that
/// left/right pairs swap their slots.
#[derive(Debug, Clone)]
pub struct HFlip {
    permutation: Vec<usize>,
}

impl HFlip {
    /// Builds the slot permutation from keypoint names and left/right
    /// pairs. Names without a partner keep their slot.
    pub fn new(keypoints: &[&str], pairs: &[(&str, &str)]) -> Result<Self> {
        let index_of = |name: &str| {
            keypoints
                .iter()
                .position(|k| *k == name)
                .ok_or_else(|| Error::InvalidConfig(format!("unknown keypoint '{name}' in hflip pairs")))
        };
        let mut permutation: Vec<usize> = (0..keypoints.len()).collect();
        for (left, right) in pairs {
            let l = index_of(left)?;
            let r = index_of(right)?;
            permutation[l] = r;
            permutation[r] = l;
        }
        Ok(Self { permutation })
    }

    pub fn with_permutation(permutation: Vec<usize>) -> Result<Self> {
        let mut seen = vec![false; permutation.len()];
        for &idx in &permutation {
            if idx >= permutation.len() || std::mem::replace(&mut seen[idx], true) {
                return Err(Error::InvalidConfig(
                    "hflip permutation must be a permutation of keypoint slots".to_string(),
                ));
            }
        }
        Ok(Self { permutation })
    }
}

impl Transform for HFlip {
    fn apply(&self, mut sample: Sample, _rng: &mut dyn RngCore) -> Result<Sample> {
        let img = sample.image.into_pixels()?;
        let w = img.width() as f32;
        sample.image = ImageData::Pixels(imageops::flip_horizontal(&img));

        for ann in &mut sample.annotations {
            if !ann.keypoints.is_empty() {
                if ann.keypoints.len() != self.permutation.len() {
                    return Err(Error::InvalidAnnotation(format!(
                        "expected {} keypoints for hflip, found {}",
                        self.permutation.len(),
                        ann.keypoints.len()
                    )));
                }
                let mirrored: Vec<[f32; 3]> = ann
                    .keypoints
                    .iter()
                    .map(|kp| [w - kp[0], kp[1], kp[2]])
                    .collect();
                ann.keypoints = self.permutation.iter().map(|&src| mirrored[src]).collect();
            }
            if let Some(bbox) = ann.bbox.as_mut() {
                bbox[0] = w - (bbox[0] + bbox[2]);
            }
        }

        let meta = &mut sample.meta;
        meta.hflip = !meta.hflip;
        meta.valid_area[0] = w - (meta.valid_area[0] + meta.valid_area[2]);

        Ok(sample)
    }
}
