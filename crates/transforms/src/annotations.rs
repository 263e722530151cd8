use rand::{Rng, RngCore};

use crate::{
    compose::Transform,
    errors::{Error, Result},
    types::{ImageMeta, Sample},
};

/// Resets geometric metadata to the identity for the current image and
/// makes sure every annotation carries a bounding box.
///
/// Identity fields (`dataset_index`, `image_id`, `file_name`) survive.
#[derive(Debug, Default, Clone, Copy)]
pub struct NormalizeAnnotations;

impl Transform for NormalizeAnnotations {
    fn apply(&self, mut sample: Sample, _rng: &mut dyn RngCore) -> Result<Sample> {
        let (w, h) = sample.image.size()?;
        let (w, h) = (w as f32, h as f32);

        for ann in &mut sample.annotations {
            if ann.keypoints.iter().any(|kp| !kp.iter().all(|v| v.is_finite())) {
                return Err(Error::InvalidAnnotation(
                    "keypoint coordinates must be finite".to_string(),
                ));
            }
            if ann.bbox.is_none() {
                ann.bbox = Some(ann.keypoint_bbox().unwrap_or([0.0, 0.0, 0.0, 0.0]));
            }
            ann.bbox_original = ann.bbox;
        }

        let previous = std::mem::take(&mut sample.meta);
        sample.meta = ImageMeta {
            dataset_index: previous.dataset_index,
            image_id: previous.image_id,
            file_name: previous.file_name,
            valid_area: [0.0, 0.0, w, h],
            width_height: [w, h],
            ..ImageMeta::default()
        };
        Ok(sample)
    }
}

/// Adds uniform noise in `[-epsilon, epsilon]` to every keypoint position
/// and half of that to each bounding-box component. Visibility and the
/// image are untouched.
#[derive(Debug, Clone, Copy)]
pub struct AnnotationJitter {
    pub epsilon: f32,
}

impl Default for AnnotationJitter {
    fn default() -> Self {
        Self { epsilon: 0.5 }
    }
}

impl Transform for AnnotationJitter {
    fn apply(&self, mut sample: Sample, rng: &mut dyn RngCore) -> Result<Sample> {
        let mut symmetric = |scale: f32| scale * (rng.gen::<f32>() - 0.5) * 2.0;
        for ann in &mut sample.annotations {
            for kp in &mut ann.keypoints {
                kp[0] += symmetric(self.epsilon);
                kp[1] += symmetric(self.epsilon);
            }
            if let Some(bbox) = ann.bbox.as_mut() {
                for value in bbox.iter_mut() {
                    *value += symmetric(0.5 * self.epsilon);
                }
            }
        }
        Ok(sample)
    }
}
