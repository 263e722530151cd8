//! Composable augmentations over `(image, annotations, meta)` samples for
//! keypoint training.

pub mod annotations;
pub mod compose;
pub mod crop;
pub mod errors;
pub mod hflip;
pub mod minsize;
pub mod multiscale;
pub mod pad;
pub mod photometric;
pub mod pipelines;
pub mod rotate;
pub mod scale;
pub mod types;
pub mod unclipped;

pub use annotations::{AnnotationJitter, NormalizeAnnotations};
pub use compose::{Compose, DeterministicEqualChoice, RandomApply, Transform};
pub use crop::Crop;
pub use errors::{Error as TransformError, Result};
pub use hflip::HFlip;
pub use minsize::MinSize;
pub use multiscale::MultiScale;
pub use pad::{CenterPad, CenterPadTight, SquarePad};
pub use photometric::{
    Blur, ColorJitter, JpegCompression, Normalize, RandomGrayscale, ToTensor,
};
pub use pipelines::{
    eval_pipeline, train_pipeline, AugmentationConfig, IMAGENET_MEAN, IMAGENET_STD,
};
pub use rotate::RotateBy90;
pub use scale::{RescaleAbsolute, RescaleRelative, ScaleMix};
pub use types::{Annotation, ImageData, ImageMeta, Sample};
pub use unclipped::{UnclippedArea, UnclippedSides};
