use candle_core::Tensor;
use serde_json::{Map, Value};

use crate::TrainingError;

/// Result of one loss evaluation. `None` entries mean the batch had no
/// applicable targets for that head (or at all), which is not an error.
#[derive(Debug, Clone, Default)]
pub struct LossOutput {
    pub total: Option<Tensor>,
    pub heads: Vec<Option<Tensor>>,
}

pub trait Loss {
    /// Display names of the head losses, in `LossOutput::heads` order.
    fn field_names(&self) -> Vec<String>;

    fn compute(
        &self,
        outputs: &[Tensor],
        targets: &[Vec<Tensor>],
    ) -> Result<LossOutput, TrainingError>;

    /// Extra fields merged into the periodic training log record.
    fn batch_meta(&self) -> Map<String, Value> {
        Map::new()
    }
}

/// Weighted sum of per-head mean squared errors. Each head compares its
/// output against the first target tensor of its group; heads without
/// targets contribute nothing.
#[derive(Debug, Clone)]
pub struct MultiHeadMse {
    field_names: Vec<String>,
    lambdas: Vec<f64>,
}

impl MultiHeadMse {
    pub fn new(field_names: Vec<String>) -> Self {
        let lambdas = vec![1.0; field_names.len()];
        Self {
            field_names,
            lambdas,
        }
    }

    pub fn with_lambdas(mut self, lambdas: Vec<f64>) -> Result<Self, TrainingError> {
        if lambdas.len() != self.field_names.len() {
            return Err(TrainingError::initialization(format!(
                "expected {} loss lambdas, got {}",
                self.field_names.len(),
                lambdas.len()
            )));
        }
        self.lambdas = lambdas;
        Ok(self)
    }
}

impl Loss for MultiHeadMse {
    fn field_names(&self) -> Vec<String> {
        self.field_names.clone()
    }

    fn compute(
        &self,
        outputs: &[Tensor],
        targets: &[Vec<Tensor>],
    ) -> Result<LossOutput, TrainingError> {
        if outputs.len() != self.field_names.len() {
            return Err(TrainingError::runtime(format!(
                "loss expects {} head outputs, got {}",
                self.field_names.len(),
                outputs.len()
            )));
        }

        let mut heads = Vec::with_capacity(outputs.len());
        let mut total: Option<Tensor> = None;
        for (idx, output) in outputs.iter().enumerate() {
            let Some(target) = targets.get(idx).and_then(|group| group.first()) else {
                heads.push(None);
                continue;
            };
            let head = candle_nn::loss::mse(output, target)?;
            let weighted = head.affine(self.lambdas[idx], 0.0)?;
            total = Some(match total {
                Some(sum) => (sum + weighted)?,
                None => weighted,
            });
            heads.push(Some(head));
        }

        Ok(LossOutput { total, heads })
    }
}
