use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{
    checkpoint::CheckpointRecord, config::LoggingConfig, metrics::EpochResult, TrainingError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub log_path: PathBuf,
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(cfg: &LoggingConfig) -> Self {
        Self {
            log_path: cfg.directory.join(&cfg.filename),
            enable_stdout: cfg.enable_stdout,
            tensorboard_dir: cfg.tensorboard.clone(),
            tensorboard_flush_every_n: 1,
        }
    }
}

/// Run log: timestamped lines appended to a text file, optionally echoed to
/// stdout, with per-epoch scalars mirrored to a TensorBoard event file.
pub struct Logger {
    settings: LoggingSettings,
    file: BufWriter<File>,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        if let Some(parent) = settings.log_path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to create log directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&settings.log_path)
            .map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to open log file {}: {err}",
                    settings.log_path.display()
                ))
            })?;

        let tensorboard = if let Some(dir) = settings.tensorboard_dir.as_ref() {
            Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?)
        } else {
            None
        };

        Ok(Self {
            settings,
            file: BufWriter::new(file),
            tensorboard,
        })
    }

    pub fn from_config(cfg: &LoggingConfig) -> Result<Self, TrainingError> {
        Self::new(LoggingSettings::from_config(cfg))
    }

    pub fn log_path(&self) -> &Path {
        &self.settings.log_path
    }

    pub fn echoes_stdout(&self) -> bool {
        self.settings.enable_stdout
    }

    pub fn info(&mut self, message: impl AsRef<str>) -> Result<(), TrainingError> {
        self.write_line("INFO", message.as_ref())
    }

    pub fn warn(&mut self, message: impl AsRef<str>) -> Result<(), TrainingError> {
        self.write_line("WARNING", message.as_ref())
    }

    /// The per-epoch summary line plus its TensorBoard scalars.
    pub fn log_epoch(&mut self, result: &EpochResult) -> Result<(), TrainingError> {
        self.info(format!(
            "|EPOCH {}| TRAIN_LOSS {}| VALID_LOSS {}|",
            result.epoch + 1,
            result.train_loss,
            result.valid_loss
        ))?;

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = (result.epoch + 1) as i64;
            let _ = writer.write_scalar("epoch/train_loss", step, result.train_loss);
            let _ = writer.write_scalar("epoch/valid_loss", step, result.valid_loss);
            let _ = writer.write_scalar("epoch/learning_rate", step, result.learning_rate);
        }
        Ok(())
    }

    pub fn log_checkpoint(&mut self, record: &CheckpointRecord) -> Result<(), TrainingError> {
        self.info(format!(
            "saved checkpoint {} ({} bytes, sha256 {})",
            record.path.display(),
            record.bytes,
            record.sha256
        ))
    }

    pub fn flush(&mut self) {
        let _ = self.file.flush();
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }

    fn write_line(&mut self, level: &str, message: &str) -> Result<(), TrainingError> {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(self.file, "{timestamp} - {level} - {message}")
            .and_then(|_| self.file.flush())
            .map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to write log file {}: {err}",
                    self.settings.log_path.display()
                ))
            })?;
        if self.settings.enable_stdout {
            println!("{timestamp} - {level} - {message}");
        }
        Ok(())
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.flush();
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    /// TFRecord framing: length, masked crc of length, payload, masked crc of payload.
    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(dir: &Path, tensorboard: bool) -> LoggingSettings {
        LoggingSettings {
            log_path: dir.join("logs").join("training_logs.txt"),
            enable_stdout: false,
            tensorboard_dir: tensorboard.then(|| dir.join("tb")),
            tensorboard_flush_every_n: 1,
        }
    }

    #[test]
    fn appends_across_logger_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut logger = Logger::new(settings(dir.path(), false)).unwrap();
            logger.info("Training started").unwrap();
        }
        {
            let mut logger = Logger::new(settings(dir.path(), false)).unwrap();
            logger.info("Training completed").unwrap();
        }

        let contents = fs::read_to_string(dir.path().join("logs/training_logs.txt")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" - INFO - Training started"));
        assert!(lines[1].ends_with(" - INFO - Training completed"));
    }

    #[test]
    fn epoch_line_uses_one_based_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(settings(dir.path(), true)).unwrap();
        logger
            .log_epoch(&EpochResult {
                epoch: 0,
                train_loss: 1.5,
                valid_loss: 0.75,
                learning_rate: 0.005,
                duration: Duration::from_secs(1),
            })
            .unwrap();
        logger.flush();

        let contents = fs::read_to_string(logger.log_path()).unwrap();
        assert!(contents.contains("|EPOCH 1| TRAIN_LOSS 1.5| VALID_LOSS 0.75|"));

        let events: Vec<_> = fs::read_dir(dir.path().join("tb"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(events.len(), 1);
        assert!(fs::metadata(&events[0]).unwrap().len() > 0);
    }

    #[test]
    fn masked_crc_matches_tfrecord_reference() {
        // crc32("") = 0, masked per TFRecord framing.
        assert_eq!(masked_crc32(&[]), 0xa282_ead8);
    }
}
