use rand::RngCore;

use crate::{compose::Transform, errors::Result, types::Sample};

/// Marks annotations as crowd when less than `threshold` of their original
/// box area survives cropping (after accounting for rescaling).
#[derive(Debug, Clone, Copy)]
pub struct UnclippedArea {
    pub threshold: f32,
}

impl Default for UnclippedArea {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

impl Transform for UnclippedArea {
    fn apply(&self, mut sample: Sample, _rng: &mut dyn RngCore) -> Result<Sample> {
        let [sx, sy] = sample.meta.scale;
        for ann in &mut sample.annotations {
            let (Some(original), Some(current)) = (ann.bbox_original, ann.bbox) else {
                continue;
            };
            let expected = original[2] * original[3] * sx * sy;
            // degenerate source boxes are left to MinSize
            if expected < 1e-3 {
                continue;
            }
            if current[2] * current[3] / expected < self.threshold {
                ann.iscrowd = true;
            }
        }
        Ok(sample)
    }
}

/// Marks annotations as crowd when more than `clipped_sides_okay` of their
/// box sides lie within `margin` pixels of the valid image area border.
#[derive(Debug, Clone, Copy)]
pub struct UnclippedSides {
    pub margin: f32,
    pub clipped_sides_okay: usize,
}

impl Default for UnclippedSides {
    fn default() -> Self {
        Self {
            margin: 10.0,
            clipped_sides_okay: 2,
        }
    }
}

impl Transform for UnclippedSides {
    fn apply(&self, mut sample: Sample, _rng: &mut dyn RngCore) -> Result<Sample> {
        let [vx, vy, vw, vh] = sample.meta.valid_area;
        let (right, bottom) = (vx + vw, vy + vh);
        for ann in &mut sample.annotations {
            let Some([x, y, w, h]) = ann.bbox else {
                continue;
            };
            let clipped = [x - vx, y - vy, right - (x + w), bottom - (y + h)]
                .iter()
                .filter(|&&gap| gap < self.margin)
                .count();
            if clipped > self.clipped_sides_okay {
                ann.iscrowd = true;
            }
        }
        Ok(sample)
    }
}
