use std::{
    path::Path,
    time::{Duration, Instant},
};

use candle_core::{backprop::GradStore, DType, Device, Tensor, TensorId};
use serde_json::{json, Value};

use crate::{
    checkpoint::{self, CheckpointRecord},
    config::{OutputPaths, TrainerSettings, TrainingConfig},
    data::{Batch, DataLoader},
    ema::EmaState,
    logging::{log_record, sink_from_config, MetricsSink, NullSink},
    loss::{Loss, LossOutput},
    metrics::{round_opt, round_to, BatchLosses, EpochAccumulator},
    network::Network,
    optimizer::Optimizer,
    profile::{phase, trace_path, TraceRecorder},
    scheduler::LRScheduler,
    visualize, TrainingError,
};

/// Signature shared by the plain and the profiled training batch step.
type BatchStep =
    fn(&mut Trainer, &Batch, usize, usize, usize, bool) -> Result<BatchLosses, TrainingError>;

/// Epoch-level result returned by [`Trainer::train`] and [`Trainer::val`].
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub loss: f64,
    pub head_losses: Vec<f64>,
    pub seconds: f64,
}

pub struct Trainer {
    /// Identity of the `Var`s the optimizer was built from.
    parameter_ids: Vec<TensorId>,
    network: Box<dyn Network>,
    loss: Box<dyn Loss>,
    optimizer: Box<dyn Optimizer>,
    scheduler: Option<Box<dyn LRScheduler>>,
    sink: Box<dyn MetricsSink>,
    settings: TrainerSettings,
    output_label: String,
    ema: EmaState,
    accumulated_grads: Option<GradStore>,
    batch_step: BatchStep,
    trace_counter: usize,
}

impl Trainer {
    /// The network is expected to already live on `settings.device`.
    pub fn new(
        network: Box<dyn Network>,
        loss: Box<dyn Loss>,
        optimizer: Box<dyn Optimizer>,
        settings: TrainerSettings,
    ) -> Result<Self, TrainingError> {
        let mut problems = Vec::new();
        if settings.stride_apply == 0 {
            problems.push("stride_apply must be greater than 0".to_string());
        }
        if settings.log_interval == 0 {
            problems.push("log_interval must be greater than 0".to_string());
        }
        if let Some(decay) = settings.ema_decay {
            if !(decay > 0.0 && decay <= 1.0) {
                problems.push(format!("ema_decay must be in (0, 1] (got {decay})"));
            }
        }
        if !problems.is_empty() {
            return Err(TrainingError::validation(problems));
        }

        let batch_step: BatchStep = if settings.profile.is_some() {
            Trainer::train_batch_profiled
        } else {
            Trainer::train_batch_plain
        };

        log_record(&json!({
            "type": "config",
            "field_names": loss.field_names(),
        }));

        let parameter_ids = network
            .parameters()
            .iter()
            .map(|var| var.as_tensor().id())
            .collect();

        Ok(Self {
            parameter_ids,
            network,
            loss,
            optimizer,
            scheduler: None,
            sink: Box::new(NullSink),
            output_label: settings.output.display().to_string(),
            settings,
            ema: EmaState::new(),
            accumulated_grads: None,
            batch_step,
            trace_counter: 0,
        })
    }

    /// Wires the schedule and metrics sink named by `config` around the given
    /// model pieces. `paths` must come from [`OutputPaths::prepare`], called
    /// once by the process entry point; no directories are created here.
    pub fn from_config(
        config: &TrainingConfig,
        paths: &OutputPaths,
        network: Box<dyn Network>,
        loss: Box<dyn Loss>,
        optimizer: Box<dyn Optimizer>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let settings = TrainerSettings::from_config(config)?;
        let mut trainer = Self::new(network, loss, optimizer, settings)?
            .with_sink(sink_from_config(&config.logging, paths)?);
        if let Some(scheduler) = config.scheduler.build()? {
            trainer = trainer.with_scheduler(scheduler);
        }
        Ok(trainer)
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn LRScheduler>) -> Self {
        self.optimizer.set_learning_rate(scheduler.learning_rate());
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    pub fn network(&self) -> &dyn Network {
        self.network.as_ref()
    }

    pub fn ema(&self) -> &EmaState {
        &self.ema
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Runs `start_epoch..epochs`: train, checkpoint, validate. When resuming,
    /// the schedule is first advanced by the steps already taken.
    ///
    /// Any error ends the loop. Errors for which [`TrainingError::is_fatal`]
    /// holds mean the model is no longer where training expects it; a driver
    /// must exit with a failure status on them instead of retrying, e.g.
    ///
    /// ```no_run
    /// # use trainer::{DataLoader, Trainer};
    /// # fn drive(trainer: &mut Trainer, train: &mut dyn DataLoader, val: &mut dyn DataLoader) {
    /// if let Err(err) = trainer.run_loop(train, val, 10, 0) {
    ///     if err.is_fatal() {
    ///         eprintln!("fatal: {err}");
    ///     }
    ///     std::process::exit(1);
    /// }
    /// # }
    /// ```
    pub fn run_loop(
        &mut self,
        train: &mut dyn DataLoader,
        val: &mut dyn DataLoader,
        epochs: usize,
        start_epoch: usize,
    ) -> Result<Vec<CheckpointRecord>, TrainingError> {
        if start_epoch > 0 {
            if let Some(scheduler) = self.scheduler.as_mut() {
                let skipped = start_epoch * train.len();
                for _ in 0..skipped {
                    scheduler.step();
                }
                self.optimizer.set_learning_rate(scheduler.learning_rate());
                log::info!(
                    "advanced learning-rate schedule by {skipped} steps to resume at epoch {start_epoch}"
                );
            }
        }

        let mut records = Vec::new();
        for epoch in start_epoch..epochs {
            self.train(train, epoch)?;
            records.push(self.write_model(epoch + 1, epoch + 1 == epochs)?);
            self.val(val, epoch + 1)?;
        }
        Ok(records)
    }

    pub fn train(
        &mut self,
        loader: &mut dyn DataLoader,
        epoch: usize,
    ) -> Result<EpochSummary, TrainingError> {
        let start_time = Instant::now();
        self.set_mode();

        let params = self.network.parameters();
        self.ema.restore(&params)?;
        self.ema.clear();

        let n_batches = loader.len();
        let mut accumulator = EpochAccumulator::new();
        self.accumulated_grads = None;
        self.optimizer.zero_grad();

        let mut last_batch_end = Instant::now();
        for (batch_idx, batch) in loader.batches().enumerate() {
            let batch = batch?;
            let data_time = last_batch_end.elapsed();

            let batch_start = Instant::now();
            let apply_gradients = batch_idx % self.settings.stride_apply == 0;
            let losses = self.train_batch(&batch, epoch, batch_idx, n_batches, apply_gradients)?;
            accumulator.update(&losses);
            let batch_time = batch_start.elapsed();

            if batch_idx % self.settings.log_interval == 0 {
                self.log_train_batch(epoch, batch_idx, n_batches, batch_time, data_time, &losses);
            }

            if self.settings.ema_decay.is_some() && !self.ema.is_initialized() {
                let params = self.network.parameters();
                self.ema.initialize(&params)?;
            }

            if let Some(scheduler) = self.scheduler.as_mut() {
                let lr = scheduler.step();
                self.optimizer.set_learning_rate(lr);
            }

            last_batch_end = Instant::now();
        }

        let params = self.network.parameters();
        self.ema.apply(&params)?;

        let summary = EpochSummary {
            epoch: epoch + 1,
            loss: accumulator.epoch_loss(n_batches),
            head_losses: accumulator.head_averages(),
            seconds: start_time.elapsed().as_secs_f64(),
        };
        self.log_epoch("train-epoch", "train", &summary)?;
        Ok(summary)
    }

    /// Validation keeps the training-mode forward (the loss needs training
    /// outputs) and never touches gradients, optimizer or EMA.
    pub fn val(
        &mut self,
        loader: &mut dyn DataLoader,
        epoch: usize,
    ) -> Result<EpochSummary, TrainingError> {
        let start_time = Instant::now();
        self.set_mode();

        let n_batches = loader.len();
        let mut accumulator = EpochAccumulator::new();
        for (batch_idx, batch) in loader.batches().enumerate() {
            let batch = batch?;
            let losses = self.val_batch(&batch, batch_idx)?;
            accumulator.update(&losses);
        }

        let summary = EpochSummary {
            epoch,
            loss: accumulator.epoch_loss(n_batches),
            head_losses: accumulator.head_averages(),
            seconds: start_time.elapsed().as_secs_f64(),
        };
        self.log_epoch("val-epoch", "val", &summary)?;
        Ok(summary)
    }

    /// One optimization step over `batch`. Dispatches through the step
    /// function chosen at construction (plain or profiled).
    pub fn train_batch(
        &mut self,
        batch: &Batch,
        epoch: usize,
        batch_idx: usize,
        n_batches: usize,
        apply_gradients: bool,
    ) -> Result<BatchLosses, TrainingError> {
        (self.batch_step)(self, batch, epoch, batch_idx, n_batches, apply_gradients)
    }

    pub fn val_batch(&mut self, batch: &Batch, batch_idx: usize) -> Result<BatchLosses, TrainingError> {
        let (inputs, targets) = self.place(batch)?;
        let outputs = self.network.forward(&inputs)?;
        let output = self.loss.compute(&outputs, &targets)?;
        let losses = scalar_losses(&output)?;
        if let Some(total) = losses.total {
            let tag = format!("{} : val loss", self.output_label);
            self.sink.add_scalar(&tag, total, batch_idx as i64)?;
        }
        Ok(losses)
    }

    /// Writes `{output}.epoch{NNN}` from a host copy of the weights, plus the
    /// digest and the final copy when `is_final`. The live parameters stay
    /// where they are. Afterwards, whether or not the write succeeded, every
    /// parameter must still sit on the training device; a stray one is
    /// [`TrainingError::DevicePlacement`], which is fatal: the caller must stop
    /// the process rather than keep training (see [`TrainingError::is_fatal`]).
    pub fn write_model(
        &mut self,
        epoch: usize,
        is_final: bool,
    ) -> Result<CheckpointRecord, TrainingError> {
        let written = checkpoint::write_checkpoint(
            self.network.as_ref(),
            &self.settings.output,
            epoch,
            &self.settings.meta,
            is_final,
        );
        if let Err(err) = &written {
            log::warn!("writing checkpoint for epoch {} failed: {}", epoch, err);
        }

        self.check_placement()?;

        let record = written?;
        log::info!("wrote checkpoint {}", record.path.display());
        Ok(record)
    }

    /// Every parameter must be on the training device and still be the `Var`
    /// the optimizer steps.
    fn check_placement(&self) -> Result<(), TrainingError> {
        let target = self.settings.device.clone().unwrap_or(Device::Cpu);
        let named = self.network.named_parameters();
        if named.len() != self.parameter_ids.len() {
            log::error!(
                "model has {} parameters, the optimizer holds {}",
                named.len(),
                self.parameter_ids.len()
            );
            return Err(TrainingError::DevicePlacement(format!(
                "{} parameters, expected {}",
                named.len(),
                self.parameter_ids.len()
            )));
        }
        for ((name, var), id) in named.iter().zip(&self.parameter_ids) {
            let tensor = var.as_tensor();
            if tensor.id() != *id {
                log::error!("parameter {} was replaced and is no longer optimized", name);
                return Err(TrainingError::DevicePlacement(format!(
                    "{name} is not the tensor being optimized"
                )));
            }
            if !tensor.device().same_device(&target) {
                log::error!(
                    "parameter {} is on {:?}, expected {:?}",
                    name,
                    tensor.device(),
                    target
                );
                return Err(TrainingError::DevicePlacement(format!(
                    "{name} on {:?}, expected {target:?}",
                    tensor.device()
                )));
            }
        }
        Ok(())
    }

    /// Loads checkpoint weights into the network and returns the stored epoch.
    pub fn load_weights(&mut self, path: &Path) -> Result<usize, TrainingError> {
        let device = self.settings.device.clone().unwrap_or(Device::Cpu);
        let loaded = checkpoint::read_checkpoint(path, &device)?;
        checkpoint::apply_weights(self.network.as_ref(), loaded.tensors)?;
        log::info!(
            "loaded weights from {} (epoch {})",
            path.display(),
            loaded.epoch
        );
        Ok(loaded.epoch)
    }

    pub fn flush(&mut self) -> Result<(), TrainingError> {
        self.sink.flush()
    }

    fn train_batch_plain(
        trainer: &mut Trainer,
        batch: &Batch,
        epoch: usize,
        batch_idx: usize,
        n_batches: usize,
        apply_gradients: bool,
    ) -> Result<BatchLosses, TrainingError> {
        trainer.train_batch_impl(batch, epoch, batch_idx, n_batches, apply_gradients, &mut None)
    }

    fn train_batch_profiled(
        trainer: &mut Trainer,
        batch: &Batch,
        epoch: usize,
        batch_idx: usize,
        n_batches: usize,
        apply_gradients: bool,
    ) -> Result<BatchLosses, TrainingError> {
        let mut recorder = Some(TraceRecorder::new());
        let result = trainer.train_batch_impl(
            batch,
            epoch,
            batch_idx,
            n_batches,
            apply_gradients,
            &mut recorder,
        );

        if let (Some(recorder), Some(template)) = (recorder, trainer.settings.profile.as_ref()) {
            let totals: Vec<String> = recorder
                .totals()
                .into_iter()
                .map(|(name, total)| format!("{name}={:.3}ms", total.as_secs_f64() * 1e3))
                .collect();
            log::info!("batch {batch_idx} phases: {}", totals.join(" "));

            trainer.trace_counter += 1;
            let path = trace_path(template, trainer.trace_counter);
            log::info!("writing trace file {}", path.display());
            recorder.write(&path)?;
        }
        result
    }

    fn train_batch_impl(
        &mut self,
        batch: &Batch,
        epoch: usize,
        batch_idx: usize,
        n_batches: usize,
        apply_gradients: bool,
        recorder: &mut Option<TraceRecorder>,
    ) -> Result<BatchLosses, TrainingError> {
        let (inputs, targets) = self.place(batch)?;
        self.maybe_visualize(batch, epoch, batch_idx, n_batches);

        let outputs = phase(recorder, "model", || self.network.forward(&inputs))?;
        let output = phase(recorder, "loss", || self.loss.compute(&outputs, &targets))?;
        let losses = scalar_losses(&output)?;

        if let (Some(total), Some(value)) = (output.total.as_ref(), losses.total) {
            phase(recorder, "backward", || -> Result<(), TrainingError> {
                let grads = total.backward()?;
                self.merge_gradients(grads);
                Ok(())
            })?;
            let tag = format!("{} : training loss", self.output_label);
            let step = (epoch * n_batches + batch_idx) as i64;
            self.sink.add_scalar(&tag, value, step)?;
        }

        if apply_gradients {
            phase(recorder, "step", || -> Result<(), TrainingError> {
                if let Some(grads) = self.accumulated_grads.take() {
                    self.optimizer.step(&grads)?;
                }
                self.optimizer.zero_grad();
                Ok(())
            })?;
            phase(recorder, "ema", || self.step_ema())?;
        }

        Ok(losses)
    }

    /// Adds the parameter gradients of `grads` into the accumulated store.
    fn merge_gradients(&mut self, mut grads: GradStore) {
        let Some(accumulated) = self.accumulated_grads.as_mut() else {
            self.accumulated_grads = Some(grads);
            return;
        };
        for var in self.network.parameters() {
            let tensor = var.as_tensor();
            if let Some(grad) = grads.remove(tensor) {
                let combined = match accumulated.remove(tensor) {
                    Some(existing) => match existing.add(&grad) {
                        Ok(sum) => sum,
                        Err(err) => {
                            log::warn!("dropping accumulated gradient that failed to merge: {err}");
                            grad
                        }
                    },
                    None => grad,
                };
                accumulated.insert(tensor, combined);
            }
        }
    }

    fn step_ema(&mut self) -> Result<(), TrainingError> {
        let Some(decay) = self.settings.ema_decay else {
            return Ok(());
        };
        let params = self.network.parameters();
        self.ema.step(&params, decay)?;
        Ok(())
    }

    fn set_mode(&mut self) {
        self.network.set_training(true);
        if self.settings.fix_batch_norm {
            self.network.freeze_batch_norm();
        }
    }

    fn place(&self, batch: &Batch) -> Result<(Tensor, Vec<Vec<Tensor>>), TrainingError> {
        match self.settings.device.as_ref() {
            Some(device) => batch.to_device(device),
            None => Ok((batch.inputs.clone(), batch.targets.clone())),
        }
    }

    fn maybe_visualize(&mut self, batch: &Batch, epoch: usize, batch_idx: usize, n_batches: usize) {
        let Some(config) = self.settings.visualization.as_ref() else {
            return;
        };
        if !visualize::should_run(config, epoch, batch_idx) {
            return;
        }
        let checkpoint = checkpoint::epoch_path(&self.settings.output, epoch);
        let step = (epoch * n_batches + batch_idx) as i64;
        match visualize::log_predictions(
            config,
            &checkpoint,
            &batch.meta,
            &self.output_label,
            epoch,
            batch_idx,
            step,
            self.sink.as_mut(),
        ) {
            Ok(count) => log::debug!("logged {count} prediction images"),
            Err(err) => log::warn!("prediction visualization skipped: {err}"),
        }
    }

    fn log_train_batch(
        &self,
        epoch: usize,
        batch_idx: usize,
        n_batches: usize,
        batch_time: Duration,
        data_time: Duration,
        losses: &BatchLosses,
    ) {
        let mut record = json!({
            "type": "train",
            "epoch": epoch,
            "batch": batch_idx,
            "n_batches": n_batches,
            "time": round_to(batch_time.as_secs_f64(), 3),
            "data_time": round_to(data_time.as_secs_f64(), 3),
            "lr": round_to(self.optimizer.learning_rate(), 8),
            "loss": round_opt(losses.total, 3),
            "head_losses": losses
                .heads
                .iter()
                .map(|head| round_opt(*head, 3))
                .collect::<Vec<_>>(),
        });
        if let Value::Object(fields) = &mut record {
            fields.extend(self.loss.batch_meta());
        }
        log_record(&record);
    }

    fn log_epoch(
        &mut self,
        kind: &str,
        prefix: &str,
        summary: &EpochSummary,
    ) -> Result<(), TrainingError> {
        log_record(&json!({
            "type": kind,
            "epoch": summary.epoch,
            "loss": round_to(summary.loss, 5),
            "head_losses": summary
                .head_losses
                .iter()
                .map(|loss| round_to(*loss, 5))
                .collect::<Vec<_>>(),
            "time": round_to(summary.seconds, 1),
        }));

        let step = summary.epoch as i64;
        self.sink
            .add_scalar(&format!("{prefix}/epoch_loss"), summary.loss, step)?;
        let names = self.loss.field_names();
        for (idx, value) in summary.head_losses.iter().enumerate() {
            let name = names.get(idx).cloned().unwrap_or_else(|| idx.to_string());
            self.sink
                .add_scalar(&format!("{prefix}/head_loss/{name}"), *value, step)?;
        }
        self.sink.flush()
    }
}

fn scalar_losses(output: &LossOutput) -> Result<BatchLosses, TrainingError> {
    let total = output.total.as_ref().map(to_scalar).transpose()?;
    let heads = output
        .heads
        .iter()
        .map(|head| head.as_ref().map(to_scalar).transpose())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BatchLosses { total, heads })
}

fn to_scalar(tensor: &Tensor) -> Result<f64, TrainingError> {
    Ok(tensor.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?)
}
