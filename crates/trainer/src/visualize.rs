//! Renders predictions for a training batch with an external command and
//! pushes the resulting images to the metrics sink.

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use crate::{config::VisualizationConfig, data::SampleMeta, logging::MetricsSink, TrainingError};

/// True on the first batch past every `every_n_batches` boundary of the
/// first epoch past every `every_n_epochs` boundary. Epoch 0 never runs
/// since no checkpoint exists yet.
pub fn should_run(config: &VisualizationConfig, epoch: usize, batch: usize) -> bool {
    let hits = |value: usize, every: usize| every > 0 && value % every == 1 % every;
    epoch > 0 && hits(epoch, config.every_n_epochs) && hits(batch, config.every_n_batches)
}

/// `{image_output_dir}/{file name}.predictions.png`.
pub fn rendered_path(config: &VisualizationConfig, file_name: &str) -> PathBuf {
    let base = Path::new(file_name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    config
        .image_output_dir
        .join(format!("{base}.predictions.png"))
}

/// Runs the prediction command against `checkpoint` for the batch images
/// (resolved under `train_image_dir`) and logs every rendered image. Blocks until the command exits. Returns the
/// number of images logged.
#[allow(clippy::too_many_arguments)]
pub fn log_predictions(
    config: &VisualizationConfig,
    checkpoint: &Path,
    meta: &[SampleMeta],
    tag_prefix: &str,
    epoch: usize,
    batch: usize,
    step: i64,
    sink: &mut dyn MetricsSink,
) -> Result<usize, TrainingError> {
    let images: Vec<&str> = meta
        .iter()
        .filter_map(|m| m.file_name.as_deref())
        .collect();
    if images.is_empty() {
        return Ok(0);
    }
    if !checkpoint.is_file() {
        return Err(TrainingError::runtime(format!(
            "no checkpoint at {} to render predictions with",
            checkpoint.display()
        )));
    }
    let Some((program, args)) = config.command.split_first() else {
        return Err(TrainingError::runtime("visualization command is empty"));
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .args(images.iter().map(|name| config.train_image_dir.join(name)))
        .arg("--checkpoint")
        .arg(checkpoint)
        .arg("--image-output")
        .arg(&config.image_output_dir);
    if let Some(dir) = &config.working_dir {
        command.current_dir(dir);
    }
    log::debug!("running prediction job: {:?}", command);
    let status = command.status()?;
    if !status.success() {
        return Err(TrainingError::runtime(format!(
            "prediction command exited with {status}"
        )));
    }

    let mut logged = 0;
    for file_name in images {
        let path = rendered_path(config, file_name);
        let image = image::open(&path)
            .map_err(|err| {
                TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
            })?
            .to_rgb8();
        let tag = format!("{tag_prefix} epoch {epoch} - batch {batch} - image {file_name}");
        sink.add_image(&tag, &image, step)?;
        logged += 1;
    }
    Ok(logged)
}
