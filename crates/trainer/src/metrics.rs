/// Scalar losses reported by one batch step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchLosses {
    pub total: Option<f64>,
    pub heads: Vec<Option<f64>>,
}

/// Per-epoch loss sums. Absent losses are skipped, so a head that never
/// reported anything keeps a count of zero.
#[derive(Debug, Clone, Default)]
pub struct EpochAccumulator {
    loss_sum: f64,
    head_sums: Vec<f64>,
    head_counts: Vec<usize>,
    batches: usize,
}

impl EpochAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, losses: &BatchLosses) {
        self.batches += 1;
        if let Some(total) = losses.total {
            self.loss_sum += total;
        }
        if self.head_sums.len() < losses.heads.len() {
            self.head_sums.resize(losses.heads.len(), 0.0);
            self.head_counts.resize(losses.heads.len(), 0);
        }
        for (idx, head) in losses.heads.iter().enumerate() {
            if let Some(value) = head {
                self.head_sums[idx] += value;
                self.head_counts[idx] += 1;
            }
        }
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn head_counts(&self) -> &[usize] {
        &self.head_counts
    }

    /// Total loss summed over the epoch divided by `n_batches`.
    pub fn epoch_loss(&self, n_batches: usize) -> f64 {
        self.loss_sum / n_batches.max(1) as f64
    }

    pub fn head_averages(&self) -> Vec<f64> {
        self.head_sums
            .iter()
            .zip(&self.head_counts)
            .map(|(sum, count)| sum / (*count).max(1) as f64)
            .collect()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

pub(crate) fn round_opt(value: Option<f64>, decimals: i32) -> Option<f64> {
    value.map(|v| round_to(v, decimals))
}
