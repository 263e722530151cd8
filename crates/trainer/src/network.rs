use candle_core::{Result, Tensor, Var};

/// The model being trained.
///
/// Parameters are exposed as candle `Var`s so that the trainer can read and
/// overwrite them in place (EMA swaps, checkpoint loading). The order of
/// `named_parameters` must be stable across calls, and the returned `Var`s
/// must be the same ones on every call: the optimizer is built from them
/// once and steps them for the whole run.
pub trait Network {
    /// One output tensor per head.
    fn forward(&self, input: &Tensor) -> Result<Vec<Tensor>>;

    fn set_training(&mut self, training: bool);

    /// Puts batch-norm layers into inference mode while the rest of the
    /// network stays in training mode.
    fn freeze_batch_norm(&mut self) {}

    fn named_parameters(&self) -> Vec<(String, Var)>;

    fn parameters(&self) -> Vec<Var> {
        self.named_parameters()
            .into_iter()
            .map(|(_, var)| var)
            .collect()
    }

    /// The wrapped module when this network is a data-parallel replica
    /// wrapper. Checkpoints store the inner module's weights.
    fn data_parallel_module(&self) -> Option<&dyn Network> {
        None
    }
}
