use candle_core::{Device, Tensor};
use transforms::{ImageData, ImageMeta, Sample};

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Per-image metadata that travels with a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleMeta {
    pub file_name: Option<String>,
    pub image_id: Option<u64>,
    pub dataset_index: Option<usize>,
}

impl From<&ImageMeta> for SampleMeta {
    fn from(meta: &ImageMeta) -> Self {
        Self {
            file_name: meta.file_name.clone(),
            image_id: meta.image_id,
            dataset_index: meta.dataset_index,
        }
    }
}

/// One training or validation batch: NCHW input, targets grouped by head,
/// per-sample metadata.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Vec<Vec<Tensor>>,
    pub meta: Vec<SampleMeta>,
}

impl Batch {
    pub fn new(inputs: Tensor, targets: Vec<Vec<Tensor>>, meta: Vec<SampleMeta>) -> Self {
        Self {
            inputs,
            targets,
            meta,
        }
    }

    /// Stacks augmented samples (already converted with `ToTensor`) into a
    /// single NCHW input tensor.
    pub fn from_samples(samples: Vec<Sample>, targets: Vec<Vec<Tensor>>) -> Result<Self> {
        if samples.is_empty() {
            return Err(TrainingError::runtime("cannot collate an empty batch"));
        }
        let mut images = Vec::with_capacity(samples.len());
        let mut meta = Vec::with_capacity(samples.len());
        for sample in samples {
            meta.push(SampleMeta::from(&sample.meta));
            match sample.image {
                ImageData::Tensor(tensor) => images.push(tensor),
                ImageData::Pixels(_) => {
                    return Err(TrainingError::runtime(
                        "batch samples must be tensors; apply ToTensor before collating",
                    ))
                }
            }
        }
        let first = images[0].dims().to_vec();
        if let Some(other) = images.iter().find(|img| img.dims() != first.as_slice()) {
            return Err(TrainingError::runtime(format!(
                "batch images differ in shape: {:?} vs {:?}",
                first,
                other.dims()
            )));
        }
        let inputs = Tensor::stack(&images, 0)?;
        Ok(Self::new(inputs, targets, meta))
    }

    /// Copies inputs and targets onto `device`.
    pub fn to_device(&self, device: &Device) -> Result<(Tensor, Vec<Vec<Tensor>>)> {
        let inputs = self.inputs.to_device(device)?;
        let targets = self
            .targets
            .iter()
            .map(|head| {
                head.iter()
                    .map(|t| t.to_device(device))
                    .collect::<candle_core::Result<Vec<_>>>()
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok((inputs, targets))
    }
}

/// Source of batches for one pass over a dataset.
pub trait DataLoader {
    /// Number of batches per pass.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;
}

/// Loader over a fixed list of pre-built batches.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLoader {
    batches: Vec<Batch>,
}

impl InMemoryLoader {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }
}

impl DataLoader for InMemoryLoader {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(self.batches.iter().cloned().map(Ok))
    }
}
