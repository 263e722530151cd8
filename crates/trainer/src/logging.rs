use std::{
    fs::{self, File},
    io::{BufWriter, Cursor, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use image::{ImageFormat, RgbImage};
use prost::Message;
use serde_json::Value;

use crate::{
    config::{LoggingConfig, OutputPaths},
    TrainingError,
};

/// Destination for scalar and image summaries.
pub trait MetricsSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: i64) -> Result<(), TrainingError>;
    fn add_image(&mut self, tag: &str, image: &RgbImage, step: i64) -> Result<(), TrainingError>;
    fn flush(&mut self) -> Result<(), TrainingError>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn add_scalar(&mut self, _tag: &str, _value: f64, _step: i64) -> Result<(), TrainingError> {
        Ok(())
    }

    fn add_image(&mut self, _tag: &str, _image: &RgbImage, _step: i64) -> Result<(), TrainingError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }
}

/// Builds the sink named by the logging section: a TensorBoard writer in the
/// prepared event directory when there is one, otherwise a [`NullSink`].
pub fn sink_from_config(
    config: &LoggingConfig,
    paths: &OutputPaths,
) -> Result<Box<dyn MetricsSink>, TrainingError> {
    match paths.tensorboard_dir.as_ref() {
        Some(dir) => Ok(Box::new(TensorBoardWriter::create(dir, config.flush_every)?)),
        None => Ok(Box::new(NullSink)),
    }
}

/// Emits a structured record as a single JSON line through `log`.
pub fn log_record(record: &Value) {
    log::info!("{}", record);
}

/// Appends TF event records (length, masked CRC, payload, masked CRC) to an
/// `events.out.tfevents.*` file.
pub struct TensorBoardWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    pub fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let timestamp = current_unix_timestamp();
        let hostname = hostname();
        let filename = format!("events.out.tfevents.{}.{}", timestamp, hostname);
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_summary(&mut self, step: i64, value: summary::Value) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            file_version: None,
            summary: Some(Summary { value: vec![value] }),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            MetricsSink::flush(self)?;
        }
        Ok(())
    }
}

impl MetricsSink for TensorBoardWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: i64) -> Result<(), TrainingError> {
        self.write_summary(
            step,
            summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
                image: None,
            },
        )
    }

    fn add_image(&mut self, tag: &str, image: &RgbImage, step: i64) -> Result<(), TrainingError> {
        let mut encoded = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
            .map_err(|err| TrainingError::runtime(format!("failed to encode image {tag}: {err}")))?;
        self.write_summary(
            step,
            summary::Value {
                tag: tag.to_string(),
                simple_value: None,
                image: Some(summary::Image {
                    height: image.height() as i32,
                    width: image.width() as i32,
                    colorspace: 3,
                    encoded_image_string: encoded,
                }),
            },
        )
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = MetricsSink::flush(self);
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
        #[prost(message, optional, tag = "4")]
        pub image: Option<Image>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Image {
        #[prost(int32, tag = "1")]
        pub height: i32,
        #[prost(int32, tag = "2")]
        pub width: i32,
        #[prost(int32, tag = "3")]
        pub colorspace: i32,
        #[prost(bytes = "vec", tag = "4")]
        pub encoded_image_string: Vec<u8>,
    }
}
