use std::{
    collections::HashMap,
    ffi::OsString,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};
use hex::encode as hex_encode;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{network::Network, TrainingError};

pub const CHECKPOINT_FORMAT: &str = "pose-trainer";
pub const CHECKPOINT_VERSION: u32 = 1;
const HASH_BLOCK_SIZE: usize = 8192;

/// What `write_model` produced for one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub path: PathBuf,
    pub epoch: usize,
    /// Hex SHA-256 of `path`, only computed for the final epoch.
    pub digest: Option<String>,
    pub final_path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub tensors: HashMap<String, Tensor>,
    pub epoch: usize,
    pub meta: Value,
    pub version: u32,
}

/// `{output}.epoch{NNN}`.
pub fn epoch_path(output: &Path, epoch: usize) -> PathBuf {
    with_suffix(output, &format!(".epoch{:03}", epoch))
}

/// The output path with its last extension segment removed.
pub fn final_path(output: &Path) -> PathBuf {
    output.with_extension("")
}

pub fn digest_path(checkpoint: &Path) -> PathBuf {
    with_suffix(checkpoint, ".sha256")
}

/// Serializes the network weights for `epoch`. On the final epoch the file
/// is also hashed and copied to [`final_path`].
///
/// Parameters are copied to the host for serialization; the live `Var`s
/// are never moved, so an optimizer holding them keeps stepping the same
/// weights after the write.
pub fn write_checkpoint(
    network: &dyn Network,
    output: &Path,
    epoch: usize,
    meta: &Value,
    is_final: bool,
) -> Result<CheckpointRecord, TrainingError> {
    let module = match network.data_parallel_module() {
        Some(inner) => {
            log::debug!("writing a data-parallel model");
            inner
        }
        None => {
            log::debug!("writing a single-replica model");
            network
        }
    };

    let path = epoch_path(output, epoch);
    log::debug!("about to write model to {}", path.display());
    save_weights(module, epoch, meta, &path)?;
    log::debug!("model written");

    let mut record = CheckpointRecord {
        path,
        epoch,
        digest: None,
        final_path: None,
    };

    if is_final {
        let digest = sha256_file(&record.path)?;
        write_digest_file(&record.path, &digest)?;
        let final_path = final_path(output);
        copy_atomic(&record.path, &final_path)?;
        log::info!(
            "final checkpoint {} (sha256 {})",
            final_path.display(),
            digest
        );
        record.digest = Some(digest);
        record.final_path = Some(final_path);
    }

    Ok(record)
}

fn save_weights(
    network: &dyn Network,
    epoch: usize,
    meta: &Value,
    path: &Path,
) -> Result<(), TrainingError> {
    let named_parameters = network.named_parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }

    let mut tensors = HashMap::with_capacity(named_parameters.len());
    for (name, var) in named_parameters {
        let tensor = var.as_tensor().detach().to_device(&Device::Cpu)?;
        if tensors.insert(name.clone(), tensor).is_some() {
            return Err(TrainingError::runtime(format!(
                "duplicate parameter name {name} in checkpoint"
            )));
        }
    }

    let metadata = HashMap::from([
        ("format".to_string(), CHECKPOINT_FORMAT.to_string()),
        ("version".to_string(), CHECKPOINT_VERSION.to_string()),
        ("epoch".to_string(), epoch.to_string()),
        ("meta".to_string(), meta.to_string()),
    ]);

    let tmp = temp_path(path);
    safetensors::serialize_to_file(tensors, &Some(metadata), &tmp).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            tmp.display()
        ))
    })?;
    rename(&tmp, path)
}

/// Reads weights and metadata written by [`write_checkpoint`].
pub fn read_checkpoint(path: &Path, device: &Device) -> Result<LoadedCheckpoint, TrainingError> {
    let buffer = fs::read(path).map_err(|err| {
        TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
    })?;
    let (_, header) = safetensors::SafeTensors::read_metadata(&buffer).map_err(|err| {
        TrainingError::runtime(format!(
            "{} is not a safetensors file: {err}",
            path.display()
        ))
    })?;
    let metadata = header.metadata().clone().unwrap_or_default();

    let field = |key: &str| {
        metadata.get(key).ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint {} is missing metadata field '{key}'",
                path.display()
            ))
        })
    };
    if field("format")? != CHECKPOINT_FORMAT {
        return Err(TrainingError::runtime(format!(
            "{} was not written by this trainer",
            path.display()
        )));
    }
    let version: u32 = field("version")?.parse().map_err(|_| {
        TrainingError::runtime(format!("invalid checkpoint version in {}", path.display()))
    })?;
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    let epoch: usize = field("epoch")?.parse().map_err(|_| {
        TrainingError::runtime(format!("invalid epoch in {}", path.display()))
    })?;
    let meta: Value = serde_json::from_str(field("meta")?)?;

    let tensors = candle_core::safetensors::load_buffer(&buffer, device)?;
    Ok(LoadedCheckpoint {
        tensors,
        epoch,
        meta,
        version,
    })
}

/// Recomputes the digest of `path` and compares it with its `.sha256`
/// sibling. Returns the digest on success.
pub fn verify_checkpoint(path: &Path) -> Result<String, TrainingError> {
    let digest_file = digest_path(path);
    let contents = fs::read_to_string(&digest_file).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read digest file {}: {err}",
            digest_file.display()
        ))
    })?;
    let expected = contents
        .split_whitespace()
        .next()
        .ok_or_else(|| {
            TrainingError::runtime(format!("digest file {} is empty", digest_file.display()))
        })?
        .to_ascii_lowercase();
    let actual = sha256_file(path)?;
    if actual != expected {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(actual)
}

/// Overwrites the network parameters with `tensors`. Every parameter must
/// be present and every tensor must be used.
pub fn apply_weights(
    network: &dyn Network,
    mut tensors: HashMap<String, Tensor>,
) -> Result<(), TrainingError> {
    for (name, var) in network.named_parameters() {
        let tensor = tensors.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor.to_dtype(desired_dtype)?
        };
        let tensor = tensor.to_device(var.as_tensor().device())?;
        var.set(&tensor)?;
    }

    if !tensors.is_empty() {
        let mut extra = tensors.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

/// Hex SHA-256 of a file, read in fixed 8 KiB blocks.
pub fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BLOCK_SIZE];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

/// Writes `{digest}  {file name}` next to the checkpoint, in `sha256sum`
/// format.
fn write_digest_file(checkpoint: &Path, digest: &str) -> Result<(), TrainingError> {
    let name = checkpoint
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let path = digest_path(checkpoint);
    let tmp = temp_path(&path);
    let mut file = File::create(&tmp).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", tmp.display()))
    })?;
    writeln!(file, "{digest}  {name}").map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", tmp.display()))
    })?;
    drop(file);
    rename(&tmp, &path)
}

fn copy_atomic(src: &Path, dst: &Path) -> Result<(), TrainingError> {
    let tmp = temp_path(dst);
    fs::copy(src, &tmp).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to copy {} to {}: {err}",
            src.display(),
            tmp.display()
        ))
    })?;
    rename(&tmp, dst)
}

fn rename(from: &Path, to: &Path) -> Result<(), TrainingError> {
    fs::rename(from, to).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to move {} to {}: {err}",
            from.display(),
            to.display()
        ))
    })
}

fn temp_path(path: &Path) -> PathBuf {
    with_suffix(path, ".tmp")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
