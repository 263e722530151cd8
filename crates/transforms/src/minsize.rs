use rand::RngCore;

use crate::{compose::Transform, errors::Result, types::Sample};

/// Marks annotations whose bounding box is too small to learn from as
/// crowd regions.
#[derive(Debug, Clone, Copy)]
pub struct MinSize {
    pub min_side: f32,
}

impl Default for MinSize {
    fn default() -> Self {
        Self { min_side: 1.0 }
    }
}

impl Transform for MinSize {
    fn apply(&self, mut sample: Sample, _rng: &mut dyn RngCore) -> Result<Sample> {
        for ann in &mut sample.annotations {
            if let Some([_, _, w, h]) = ann.bbox {
                if w <= self.min_side || h <= self.min_side {
                    ann.iscrowd = true;
                }
            }
        }
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Annotation;
    use image::RgbImage;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn small_boxes_become_crowd() {
        let anns = vec![
            Annotation::new(Vec::new()).with_bbox([0.0, 0.0, 10.0, 10.0]),
            Annotation::new(Vec::new()).with_bbox([0.0, 0.0, 10.0, 2.0]),
            Annotation::new(Vec::new()),
        ];
        let mut rng = StdRng::seed_from_u64(0);
        let out = MinSize { min_side: 3.0 }
            .apply(Sample::new(RgbImage::new(16, 16), anns), &mut rng)
            .unwrap();
        let crowd: Vec<bool> = out.annotations.iter().map(|a| a.iscrowd).collect();
        assert_eq!(crowd, vec![false, true, false]);
    }
}
