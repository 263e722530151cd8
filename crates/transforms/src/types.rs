use candle_core::Tensor;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// One annotated instance. Keypoints are `[x, y, visibility]` triplets in
/// pixel-corner coordinates; `bbox` is `[x, y, width, height]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub keypoints: Vec<[f32; 3]>,
    #[serde(default)]
    pub bbox: Option<[f32; 4]>,
    /// The box in source-image coordinates, recorded by
    /// `NormalizeAnnotations` before any geometric augmentation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox_original: Option<[f32; 4]>,
    #[serde(default)]
    pub category_id: u32,
    #[serde(default)]
    pub iscrowd: bool,
}

impl Annotation {
    pub fn new(keypoints: Vec<[f32; 3]>) -> Self {
        Self {
            keypoints,
            bbox: None,
            bbox_original: None,
            category_id: 1,
            iscrowd: false,
        }
    }

    pub fn with_bbox(mut self, bbox: [f32; 4]) -> Self {
        self.bbox = Some(bbox);
        self
    }

    /// Bounding box around the visible keypoints, if any are visible.
    pub fn keypoint_bbox(&self) -> Option<[f32; 4]> {
        let visible = self.keypoints.iter().filter(|kp| kp[2] > 0.0);
        let mut bounds: Option<[f32; 4]> = None;
        for kp in visible {
            bounds = Some(match bounds {
                None => [kp[0], kp[1], kp[0], kp[1]],
                Some([x1, y1, x2, y2]) => [x1.min(kp[0]), y1.min(kp[1]), x2.max(kp[0]), y2.max(kp[1])],
            });
        }
        bounds.map(|[x1, y1, x2, y2]| [x1, y1, x2 - x1, y2 - y1])
    }

    pub(crate) fn translate(&mut self, dx: f32, dy: f32) {
        for kp in &mut self.keypoints {
            kp[0] += dx;
            kp[1] += dy;
        }
        if let Some(bbox) = self.bbox.as_mut() {
            bbox[0] += dx;
            bbox[1] += dy;
        }
    }

    pub(crate) fn rescale(&mut self, sx: f32, sy: f32) {
        for kp in &mut self.keypoints {
            kp[0] *= sx;
            kp[1] *= sy;
        }
        if let Some(bbox) = self.bbox.as_mut() {
            bbox[0] *= sx;
            bbox[1] *= sy;
            bbox[2] *= sx;
            bbox[3] *= sy;
        }
    }
}

/// Per-image bookkeeping that lets predictions be mapped back onto the
/// source image after geometric augmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    #[serde(default)]
    pub dataset_index: Option<usize>,
    #[serde(default)]
    pub image_id: Option<u64>,
    #[serde(default)]
    pub file_name: Option<String>,
    pub offset: [f32; 2],
    pub scale: [f32; 2],
    /// Clockwise rotation in degrees applied so far.
    pub rotation: f32,
    /// `[x, y, width, height]` of the region backed by source pixels.
    pub valid_area: [f32; 4],
    pub hflip: bool,
    pub width_height: [f32; 2],
}

impl Default for ImageMeta {
    fn default() -> Self {
        Self {
            dataset_index: None,
            image_id: None,
            file_name: None,
            offset: [0.0, 0.0],
            scale: [1.0, 1.0],
            rotation: 0.0,
            valid_area: [0.0, 0.0, 0.0, 0.0],
            hflip: false,
            width_height: [0.0, 0.0],
        }
    }
}

/// Image payload of a sample: raw pixels until `ToTensor`, a `[3, H, W]`
/// float tensor afterwards.
#[derive(Debug, Clone)]
pub enum ImageData {
    Pixels(RgbImage),
    Tensor(Tensor),
}

impl ImageData {
    /// `(width, height)` of the image in pixels.
    pub fn size(&self) -> Result<(u32, u32)> {
        match self {
            ImageData::Pixels(img) => Ok(img.dimensions()),
            ImageData::Tensor(tensor) => {
                let (_, h, w) = tensor.dims3()?;
                Ok((w as u32, h as u32))
            }
        }
    }

    pub fn pixels(&self) -> Result<&RgbImage> {
        match self {
            ImageData::Pixels(img) => Ok(img),
            ImageData::Tensor(_) => Err(Error::ExpectedPixels),
        }
    }

    pub fn into_pixels(self) -> Result<RgbImage> {
        match self {
            ImageData::Pixels(img) => Ok(img),
            ImageData::Tensor(_) => Err(Error::ExpectedPixels),
        }
    }

    pub fn into_tensor(self) -> Result<Tensor> {
        match self {
            ImageData::Tensor(tensor) => Ok(tensor),
            ImageData::Pixels(_) => Err(Error::ExpectedTensor),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub image: ImageData,
    pub annotations: Vec<Annotation>,
    pub meta: ImageMeta,
}

impl Sample {
    pub fn new(image: RgbImage, annotations: Vec<Annotation>) -> Self {
        Self {
            image: ImageData::Pixels(image),
            annotations,
            meta: ImageMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: ImageMeta) -> Self {
        self.meta = meta;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypoint_bbox_ignores_invisible_points() {
        let ann = Annotation::new(vec![
            [10.0, 20.0, 2.0],
            [30.0, 5.0, 1.0],
            [100.0, 100.0, 0.0],
        ]);
        assert_eq!(ann.keypoint_bbox(), Some([10.0, 5.0, 20.0, 15.0]));
    }

    #[test]
    fn keypoint_bbox_none_without_visible_points() {
        let ann = Annotation::new(vec![[1.0, 1.0, 0.0]]);
        assert!(ann.keypoint_bbox().is_none());
    }

    #[test]
    fn annotation_deserializes_with_defaults() {
        let ann: Annotation =
            serde_json::from_str(r#"{"keypoints": [[1.0, 2.0, 2.0]], "bbox": [0, 0, 4, 4]}"#)
                .unwrap();
        assert_eq!(ann.keypoints.len(), 1);
        assert_eq!(ann.bbox, Some([0.0, 0.0, 4.0, 4.0]));
        assert!(!ann.iscrowd);
    }
}
