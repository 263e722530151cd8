use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use candle_nn::SGD;
use image::RgbImage;
use serde_json::json;
use tempfile::tempdir;
use trainer::{
    checkpoint, Batch, CandleOptimizer, InMemoryLoader, LRScheduler, MetricsSink, MultiHeadMse,
    Network, Optimizer, OutputPaths, SampleMeta, Trainer, TrainerSettings, TrainingConfig, TrainingError,
    VisualizationConfig,
};

type Events = Arc<Mutex<Vec<String>>>;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn push(events: &Events, event: impl Into<String>) {
    events.lock().unwrap().push(event.into());
}

fn count(events: &Events, name: &str) -> usize {
    events.lock().unwrap().iter().filter(|e| *e == name).count()
}

/// `y = x·w + b` with a single output head.
struct TinyNet {
    weight: Var,
    bias: Var,
    events: Events,
    rebuild_on_mode: bool,
}

impl TinyNet {
    fn new(events: Events) -> Self {
        let weight = Var::from_tensor(&Tensor::new(&[0.5f32, -0.25], &Device::Cpu).unwrap()).unwrap();
        let bias = Var::from_tensor(&Tensor::new(&[0.1f32], &Device::Cpu).unwrap()).unwrap();
        Self {
            weight,
            bias,
            events,
            rebuild_on_mode: false,
        }
    }

    /// Re-materializes fresh `Var`s (same values) whenever the mode changes.
    fn rebuilding(events: Events) -> Self {
        Self {
            rebuild_on_mode: true,
            ..Self::new(events)
        }
    }
}

impl Network for TinyNet {
    fn forward(&self, input: &Tensor) -> candle_core::Result<Vec<Tensor>> {
        push(&self.events, "forward");
        let out = input
            .broadcast_mul(self.weight.as_tensor())?
            .sum_keepdim(1)?
            .broadcast_add(self.bias.as_tensor())?;
        Ok(vec![out])
    }

    fn set_training(&mut self, training: bool) {
        push(&self.events, format!("train_mode:{training}"));
        if self.rebuild_on_mode {
            self.weight = Var::from_tensor(&self.weight.as_tensor().copy().unwrap()).unwrap();
            self.bias = Var::from_tensor(&self.bias.as_tensor().copy().unwrap()).unwrap();
        }
    }

    fn freeze_batch_norm(&mut self) {
        push(&self.events, "freeze_bn");
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("head.weight".to_string(), self.weight.clone()),
            ("head.bias".to_string(), self.bias.clone()),
        ]
    }
}

struct RecordingOptimizer {
    inner: CandleOptimizer<SGD>,
    events: Events,
}

impl Optimizer for RecordingOptimizer {
    fn step(&mut self, grads: &GradStore) -> Result<(), TrainingError> {
        push(&self.events, "step");
        self.inner.step(grads)
    }

    fn zero_grad(&mut self) {
        push(&self.events, "zero_grad");
        self.inner.zero_grad();
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }
}

struct CountingScheduler {
    steps: usize,
    events: Events,
}

impl LRScheduler for CountingScheduler {
    fn step(&mut self) -> f64 {
        self.steps += 1;
        push(&self.events, "sched");
        self.learning_rate()
    }

    fn learning_rate(&self) -> f64 {
        0.01 / (1 + self.steps) as f64
    }
}

#[derive(Clone, Default)]
struct RecordingSink {
    scalars: Arc<Mutex<Vec<(String, f64, i64)>>>,
    images: Arc<Mutex<Vec<(String, i64)>>>,
}

impl RecordingSink {
    fn scalar_steps(&self, tag: &str) -> Vec<i64> {
        self.scalars
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t == tag)
            .map(|(_, _, step)| *step)
            .collect()
    }
}

impl MetricsSink for RecordingSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: i64) -> Result<(), TrainingError> {
        self.scalars
            .lock()
            .unwrap()
            .push((tag.to_string(), value, step));
        Ok(())
    }

    fn add_image(&mut self, tag: &str, _image: &RgbImage, step: i64) -> Result<(), TrainingError> {
        self.images.lock().unwrap().push((tag.to_string(), step));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }
}

fn batch(offset: f32, names: &[&str]) -> Batch {
    let rows = names.len();
    let values: Vec<f32> = (0..rows * 2).map(|i| offset + i as f32 * 0.1).collect();
    let inputs = Tensor::from_vec(values, (rows, 2), &Device::Cpu).unwrap();
    let targets: Vec<f32> = (0..rows).map(|i| 1.0 - i as f32 * 0.2).collect();
    let targets = Tensor::from_vec(targets, (rows, 1), &Device::Cpu).unwrap();
    let meta = names
        .iter()
        .map(|name| SampleMeta {
            file_name: Some(name.to_string()),
            ..SampleMeta::default()
        })
        .collect();
    Batch::new(inputs, vec![vec![targets]], meta)
}

fn loader(n_batches: usize) -> InMemoryLoader {
    InMemoryLoader::new(
        (0..n_batches)
            .map(|i| batch(i as f32, &["a.jpg", "b.jpg"]))
            .collect(),
    )
}

fn build(
    network: TinyNet,
    events: &Events,
    settings: TrainerSettings,
) -> (Trainer, RecordingSink) {
    let optimizer = RecordingOptimizer {
        inner: CandleOptimizer::<SGD>::new(network.parameters(), 0.05).unwrap(),
        events: events.clone(),
    };
    let sink = RecordingSink::default();
    let trainer = Trainer::new(
        Box::new(network),
        Box::new(MultiHeadMse::new(vec!["pif".to_string()])),
        Box::new(optimizer),
        settings,
    )
    .unwrap()
    .with_sink(Box::new(sink.clone()));
    (trainer, sink)
}

fn param_values(network: &dyn Network) -> Vec<Vec<f32>> {
    network
        .parameters()
        .iter()
        .map(|var| var.as_tensor().to_dtype(DType::F32).unwrap().to_vec1().unwrap())
        .collect()
}

/// Stored weights in `named_parameters` order.
fn checkpoint_values(path: &Path) -> Vec<Vec<f32>> {
    let loaded = checkpoint::read_checkpoint(path, &Device::Cpu).unwrap();
    ["head.weight", "head.bias"]
        .iter()
        .map(|name| loaded.tensors[*name].to_vec1().unwrap())
        .collect()
}

#[test]
fn stride_applies_gradients_every_nth_batch() {
    init_logging();
    let tmp = tempdir().unwrap();
    let events: Events = Events::default();
    let mut settings = TrainerSettings::new(tmp.path().join("model.pkl"));
    settings.stride_apply = 2;
    let (mut trainer, _) = build(TinyNet::new(events.clone()), &events, settings);

    let before = param_values(trainer.network());
    trainer.train(&mut loader(5), 0).unwrap();
    let after = param_values(trainer.network());
    assert_ne!(before, after);

    let sequence: Vec<String> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e.as_str(), "forward" | "step" | "zero_grad"))
        .cloned()
        .collect();
    assert_eq!(
        sequence,
        vec![
            "zero_grad", "forward", "step", "zero_grad", "forward", "forward", "step",
            "zero_grad", "forward", "forward", "step", "zero_grad",
        ]
    );
}

#[test]
fn training_loss_is_logged_per_global_step() {
    init_logging();
    let tmp = tempdir().unwrap();
    let output = tmp.path().join("model.pkl");
    let events: Events = Events::default();
    let mut settings = TrainerSettings::new(&output);
    settings.fix_batch_norm = true;
    let (mut trainer, sink) = build(TinyNet::new(events.clone()), &events, settings);

    let summary = trainer.train(&mut loader(3), 1).unwrap();
    assert_eq!(summary.epoch, 2);
    assert_eq!(summary.head_losses.len(), 1);
    assert!(summary.loss > 0.0);

    let tag = format!("{} : training loss", output.display());
    assert_eq!(sink.scalar_steps(&tag), vec![3, 4, 5]);
    assert_eq!(sink.scalar_steps("train/epoch_loss"), vec![2]);
    assert_eq!(sink.scalar_steps("train/head_loss/pif"), vec![2]);
    assert_eq!(count(&events, "train_mode:true"), 1);
    assert_eq!(count(&events, "freeze_bn"), 1);
}

#[test]
fn validation_never_steps_the_optimizer() {
    init_logging();
    let tmp = tempdir().unwrap();
    let output = tmp.path().join("model.pkl");
    let events: Events = Events::default();
    let mut settings = TrainerSettings::new(&output);
    settings.ema_decay = Some(0.5);
    let (mut trainer, sink) = build(TinyNet::new(events.clone()), &events, settings);

    let before = param_values(trainer.network());
    let summary = trainer.val(&mut loader(4), 3).unwrap();
    assert_eq!(summary.epoch, 3);
    assert_eq!(param_values(trainer.network()), before);
    assert_eq!(count(&events, "step"), 0);
    assert!(!trainer.ema().is_initialized());

    let tag = format!("{} : val loss", output.display());
    assert_eq!(sink.scalar_steps(&tag), vec![0, 1, 2, 3]);
    assert_eq!(sink.scalar_steps("val/epoch_loss"), vec![3]);
}

#[test]
fn two_epoch_loop_trains_writes_and_validates() {
    init_logging();
    let tmp = tempdir().unwrap();
    let output = tmp.path().join("model.pkl");
    let events: Events = Events::default();
    let mut settings = TrainerSettings::new(&output);
    settings.meta = json!({ "run": "unit" });
    let (mut trainer, sink) = build(TinyNet::new(events.clone()), &events, settings);

    let records = trainer
        .run_loop(&mut loader(3), &mut loader(2), 2, 0)
        .unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].epoch, 1);
    assert!(records[0].digest.is_none());
    assert!(records[0].final_path.is_none());
    assert_eq!(records[1].epoch, 2);
    assert!(records[1].digest.is_some());

    assert_eq!(count(&events, "train_mode:true"), 4);
    assert_eq!(count(&events, "step"), 6);
    assert_eq!(sink.scalar_steps("train/epoch_loss"), vec![1, 2]);
    assert_eq!(sink.scalar_steps("val/epoch_loss"), vec![1, 2]);

    assert!(checkpoint::epoch_path(&output, 1).is_file());
    assert!(checkpoint::epoch_path(&output, 2).is_file());
    assert!(!checkpoint::digest_path(&checkpoint::epoch_path(&output, 1)).exists());

    let loaded = checkpoint::read_checkpoint(&records[1].path, &Device::Cpu).unwrap();
    assert_eq!(loaded.epoch, 2);
    assert_eq!(loaded.meta, json!({ "run": "unit" }));
    assert_eq!(loaded.tensors.len(), 2);
}

#[test]
fn final_checkpoint_digest_and_copy_match() {
    init_logging();
    let tmp = tempdir().unwrap();
    let output = tmp.path().join("model.pkl");
    let events: Events = Events::default();
    let (mut trainer, _) = build(
        TinyNet::new(events.clone()),
        &events,
        TrainerSettings::new(&output),
    );

    let record = trainer.write_model(4, true).unwrap();
    let digest = record.digest.clone().unwrap();
    assert_eq!(digest.len(), 64);
    assert_eq!(checkpoint::sha256_file(&record.path).unwrap(), digest);
    assert_eq!(checkpoint::verify_checkpoint(&record.path).unwrap(), digest);

    let digest_file = fs::read_to_string(checkpoint::digest_path(&record.path)).unwrap();
    assert_eq!(digest_file, format!("{digest}  model.pkl.epoch004\n"));

    let final_path = record.final_path.unwrap();
    assert_eq!(final_path, tmp.path().join("model"));
    assert_eq!(fs::read(&final_path).unwrap(), fs::read(&record.path).unwrap());
    assert_eq!(checkpoint_values(&final_path), param_values(trainer.network()));
}

#[test]
fn tampered_checkpoint_fails_verification() {
    init_logging();
    let tmp = tempdir().unwrap();
    let output = tmp.path().join("model.pkl");
    let events: Events = Events::default();
    let (mut trainer, _) = build(
        TinyNet::new(events.clone()),
        &events,
        TrainerSettings::new(&output),
    );

    let record = trainer.write_model(1, true).unwrap();
    let mut bytes = fs::read(&record.path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&record.path, bytes).unwrap();
    assert!(checkpoint::verify_checkpoint(&record.path).is_err());
}

#[test]
fn weights_keep_training_after_each_checkpoint() {
    init_logging();
    let tmp = tempdir().unwrap();
    let output = tmp.path().join("model.pkl");
    let events: Events = Events::default();
    let (mut trainer, _) = build(
        TinyNet::new(events.clone()),
        &events,
        TrainerSettings::new(&output),
    );

    trainer.train(&mut loader(2), 0).unwrap();
    let at_checkpoint = param_values(trainer.network());
    let record = trainer.write_model(1, false).unwrap();
    trainer.train(&mut loader(2), 1).unwrap();

    assert_ne!(param_values(trainer.network()), at_checkpoint);
    assert_eq!(checkpoint_values(&record.path), at_checkpoint);
    for var in trainer.network().parameters() {
        assert!(var.as_tensor().device().is_cpu());
    }
}

#[test]
fn every_epoch_checkpoint_holds_new_weights() {
    init_logging();
    let tmp = tempdir().unwrap();
    let output = tmp.path().join("model.pkl");
    let events: Events = Events::default();
    let (mut trainer, _) = build(
        TinyNet::new(events.clone()),
        &events,
        TrainerSettings::new(&output),
    );

    let records = trainer
        .run_loop(&mut loader(2), &mut loader(1), 3, 0)
        .unwrap();
    let stored: Vec<Vec<Vec<f32>>> = records.iter().map(|r| checkpoint_values(&r.path)).collect();
    assert_ne!(stored[0], stored[1]);
    assert_ne!(stored[1], stored[2]);
    assert_eq!(stored[2], param_values(trainer.network()));
}

#[test]
fn replaced_parameters_are_fatal_at_checkpoint() {
    init_logging();
    let tmp = tempdir().unwrap();
    let output = tmp.path().join("model.pkl");
    let events: Events = Events::default();
    let (mut trainer, _) = build(
        TinyNet::rebuilding(events.clone()),
        &events,
        TrainerSettings::new(&output),
    );

    trainer.train(&mut loader(1), 0).unwrap();
    let err = trainer.write_model(1, false).unwrap_err();
    assert!(matches!(err, TrainingError::DevicePlacement(_)));
    assert!(err.is_fatal());
    // the checkpoint itself was still written
    assert!(checkpoint::epoch_path(&output, 1).is_file());

    let err = trainer
        .run_loop(&mut loader(1), &mut loader(1), 2, 0)
        .unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn failed_write_still_checks_placement() {
    init_logging();
    let tmp = tempdir().unwrap();
    let output = tmp.path().join("missing/model.pkl");

    let events: Events = Events::default();
    let (mut trainer, _) = build(
        TinyNet::new(events.clone()),
        &events,
        TrainerSettings::new(&output),
    );
    let err = trainer.write_model(1, false).unwrap_err();
    assert!(!err.is_fatal());
    let before = param_values(trainer.network());
    trainer.train(&mut loader(2), 1).unwrap();
    assert_ne!(param_values(trainer.network()), before);

    let events: Events = Events::default();
    let (mut trainer, _) = build(
        TinyNet::rebuilding(events.clone()),
        &events,
        TrainerSettings::new(&output),
    );
    trainer.train(&mut loader(1), 0).unwrap();
    let err = trainer.write_model(1, false).unwrap_err();
    assert!(err.is_fatal());
    assert!(!checkpoint::epoch_path(&output, 1).exists());
}

#[test]
fn profiling_writes_one_trace_per_batch() {
    init_logging();
    let tmp = tempdir().unwrap();
    let events: Events = Events::default();
    let mut settings = TrainerSettings::new(tmp.path().join("model.pkl"));
    settings.profile = Some(tmp.path().join("prof.json"));
    settings.ema_decay = Some(0.5);
    let (mut trainer, _) = build(TinyNet::new(events.clone()), &events, settings);

    let before = param_values(trainer.network());
    trainer.train(&mut loader(2), 0).unwrap();
    assert_ne!(param_values(trainer.network()), before);

    for n in 1..=2 {
        let path = tmp.path().join(format!("prof.{n}.json"));
        let trace: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let names: Vec<&str> = trace["traceEvents"]
            .as_array()
            .unwrap()
            .iter()
            .map(|event| event["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["model", "loss", "backward", "step", "ema"]);
        assert!(trace["traceEvents"]
            .as_array()
            .unwrap()
            .iter()
            .all(|event| event["ph"] == "X"));
    }
    assert!(!tmp.path().join("prof.3.json").exists());
}

#[test]
fn resume_fast_forwards_schedule_before_training() {
    init_logging();
    let tmp = tempdir().unwrap();
    let events: Events = Events::default();
    let (trainer, _) = build(
        TinyNet::new(events.clone()),
        &events,
        TrainerSettings::new(tmp.path().join("model.pkl")),
    );
    let mut trainer = trainer.with_scheduler(Box::new(CountingScheduler {
        steps: 0,
        events: events.clone(),
    }));

    let records = trainer
        .run_loop(&mut loader(3), &mut loader(1), 3, 2)
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].epoch, 3);

    let log = events.lock().unwrap().clone();
    let first_forward = log.iter().position(|e| e == "forward").unwrap();
    let before = log[..first_forward].iter().filter(|e| *e == "sched").count();
    assert_eq!(before, 6);
    assert_eq!(log.iter().filter(|e| *e == "sched").count(), 9);
    assert!((trainer.learning_rate() - 0.01 / 10.0).abs() < 1e-12);
}

#[test]
fn ema_is_applied_at_epoch_end_and_restored_next_epoch() {
    init_logging();
    let tmp = tempdir().unwrap();
    let events: Events = Events::default();
    let mut settings = TrainerSettings::new(tmp.path().join("model.pkl"));
    settings.ema_decay = Some(0.5);
    let (mut trainer, _) = build(TinyNet::new(events.clone()), &events, settings);

    trainer.train(&mut loader(3), 0).unwrap();
    assert!(trainer.ema().is_initialized());
    assert!(trainer.ema().has_pending_restore());

    let shadow: Vec<Vec<f32>> = trainer
        .ema()
        .shadow()
        .unwrap()
        .iter()
        .map(|t| t.to_vec1().unwrap())
        .collect();
    assert_eq!(param_values(trainer.network()), shadow);

    trainer.train(&mut loader(3), 1).unwrap();
    // restored at the start of the epoch, re-applied at its end
    assert!(trainer.ema().has_pending_restore());
}

#[test]
fn load_weights_restores_checkpoint_values() {
    init_logging();
    let tmp = tempdir().unwrap();
    let output = tmp.path().join("model.pkl");
    let events: Events = Events::default();
    let (mut trainer, _) = build(
        TinyNet::new(events.clone()),
        &events,
        TrainerSettings::new(&output),
    );

    let saved = param_values(trainer.network());
    let record = trainer.write_model(7, false).unwrap();
    trainer.train(&mut loader(2), 7).unwrap();
    assert_ne!(param_values(trainer.network()), saved);

    assert_eq!(trainer.load_weights(&record.path).unwrap(), 7);
    assert_eq!(param_values(trainer.network()), saved);
}

fn vis_config(dir: &Path, command: &str) -> VisualizationConfig {
    VisualizationConfig {
        command: vec![command.to_string()],
        working_dir: None,
        train_image_dir: dir.to_path_buf(),
        image_output_dir: dir.to_path_buf(),
        every_n_epochs: 1,
        every_n_batches: 1,
    }
}

#[test]
fn prediction_images_are_logged_when_triggered() {
    init_logging();
    let tmp = tempdir().unwrap();
    let output = tmp.path().join("model.pkl");
    let images = tmp.path().join("images");
    fs::create_dir_all(&images).unwrap();
    for name in ["a.jpg", "b.jpg"] {
        RgbImage::new(3, 3)
            .save(images.join(format!("{name}.predictions.png")))
            .unwrap();
    }

    let events: Events = Events::default();
    let mut settings = TrainerSettings::new(&output);
    settings.visualization = Some(vis_config(&images, "true"));
    let (mut trainer, sink) = build(TinyNet::new(events.clone()), &events, settings);

    trainer.write_model(1, false).unwrap();
    trainer.train(&mut loader(2), 1).unwrap();

    let logged = sink.images.lock().unwrap().clone();
    assert_eq!(logged.len(), 4);
    assert_eq!(
        logged[0].0,
        format!("{} epoch 1 - batch 0 - image a.jpg", output.display())
    );
    assert_eq!(logged[0].1, 2);
}

#[test]
fn prediction_failures_do_not_stop_training() {
    init_logging();
    let tmp = tempdir().unwrap();
    let output = tmp.path().join("model.pkl");
    let events: Events = Events::default();
    let mut settings = TrainerSettings::new(&output);
    settings.visualization = Some(vis_config(tmp.path(), "false"));
    let (mut trainer, sink) = build(TinyNet::new(events.clone()), &events, settings);

    trainer.write_model(1, false).unwrap();
    trainer.train(&mut loader(2), 1).unwrap();
    assert!(sink.images.lock().unwrap().is_empty());
    assert_eq!(count(&events, "step"), 2);
}

#[test]
fn config_driven_run_writes_tensorboard_events() {
    init_logging();
    let tmp = tempdir().unwrap();
    let config_path = tmp.path().join("train.toml");
    fs::write(
        &config_path,
        r#"
[trainer]
output = "runs/model.pkl"
epochs = 2
log_interval = 1

[scheduler]
strategy = "constant_with_warmup"
learning_rate = 0.02
warmup_steps = 4

[logging]
tensorboard_dir = "tb"
"#,
    )
    .unwrap();
    let config = TrainingConfig::from_path(&config_path).unwrap();

    let events: Events = Events::default();
    let network = TinyNet::new(events.clone());
    let optimizer = RecordingOptimizer {
        inner: CandleOptimizer::<SGD>::new(network.parameters(), 0.05).unwrap(),
        events: events.clone(),
    };
    assert!(!tmp.path().join("runs").exists());
    let paths = OutputPaths::prepare(&config).unwrap();
    assert_eq!(paths.checkpoint_dir, tmp.path().join("runs"));
    assert!(paths.checkpoint_dir.is_dir());

    let mut trainer = Trainer::from_config(
        &config,
        &paths,
        Box::new(network),
        Box::new(MultiHeadMse::new(vec!["pif".to_string()])),
        Box::new(optimizer),
    )
    .unwrap();
    assert!(trainer.learning_rate() < 0.02);

    let records = trainer
        .run_loop(&mut loader(2), &mut loader(1), config.trainer.epochs, 0)
        .unwrap();
    trainer.flush().unwrap();
    assert_eq!(records.len(), 2);
    assert!((trainer.learning_rate() - 0.02).abs() < 1e-12);
    assert!(tmp.path().join("runs/model").is_file());

    let tb_files: Vec<_> = fs::read_dir(tmp.path().join("tb"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(tb_files.len(), 1);
    assert!(fs::metadata(&tb_files[0]).unwrap().len() > 0);
}
