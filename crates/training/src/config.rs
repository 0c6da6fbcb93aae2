use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Run parameters for one training job. Loaded once and treated as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub data: DataConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.table_path.as_os_str().is_empty() {
            errors.push("data.table_path must not be empty".to_string());
        }
        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.image_size == 0 {
            errors.push("data.image_size must be greater than 0".to_string());
        }
        if self.data.split.column.trim().is_empty() {
            errors.push("data.split.column must not be empty".to_string());
        }
        if self.data.split.train_label == self.data.split.holdout_label {
            errors.push("data.split.train_label and holdout_label must differ".to_string());
        }
        let fraction = self.data.split.validation_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            errors.push("data.split.validation_fraction must be in (0, 1)".to_string());
        }

        if self.model.num_classes < 2 {
            errors.push(
                "model.num_classes must include at least one class plus no-object".to_string(),
            );
        }
        if self.model.num_queries == 0 {
            errors.push("model.num_queries must be greater than 0".to_string());
        }
        if self.model.hidden_dim == 0 {
            errors.push("model.hidden_dim must be greater than 0".to_string());
        }
        if let Some(p) = self.model.dropout {
            if !(0.0..1.0).contains(&p) {
                errors.push("model.dropout must be in [0, 1)".to_string());
            }
        }

        if self.loss.null_class_coef < 0.0 {
            errors.push("loss.null_class_coef must be >= 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if let Some(max_norm) = self.optimizer.clip_grad_norm {
            if max_norm <= 0.0 {
                errors.push("optimizer.clip_grad_norm must be greater than 0".to_string());
            }
        }

        if !(self.scheduler.factor > 0.0 && self.scheduler.factor < 1.0) {
            errors.push("scheduler.factor must be in (0, 1)".to_string());
        }
        if self.scheduler.threshold < 0.0 {
            errors.push("scheduler.threshold must be >= 0".to_string());
        }
        if self.scheduler.min_lr < 0.0 {
            errors.push("scheduler.min_lr must be >= 0".to_string());
        }
        if self.scheduler.min_lr > self.optimizer.learning_rate {
            errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }
        if self.runtime.checkpoint.directory.as_os_str().is_empty() {
            errors.push("runtime.checkpoint.directory must not be empty".to_string());
        }
        if self.runtime.checkpoint.prefix.trim().is_empty() {
            errors.push("runtime.checkpoint.prefix must not be empty".to_string());
        }
        if self.runtime.logging.directory.as_os_str().is_empty() {
            errors.push("runtime.logging.directory must not be empty".to_string());
        }
        if self.runtime.logging.filename.trim().is_empty() {
            errors.push("runtime.logging.filename must not be empty".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub table_path: PathBuf,
    pub root_dir: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub num_workers: usize,
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    #[serde(default)]
    pub split: SplitConfig,
    #[serde(default)]
    pub columns: ColumnConfig,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.table_path, base);
        absolutize_in_place(&mut self.root_dir, base);
    }
}

/// How the labeled table is partitioned into train/validation/test rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitConfig {
    #[serde(default = "default_split_column")]
    pub column: String,
    #[serde(default = "default_train_label")]
    pub train_label: String,
    #[serde(default = "default_holdout_label")]
    pub holdout_label: String,
    /// Only the first `max_train_rows` train-labeled rows (original order) are used.
    #[serde(default = "default_max_train_rows")]
    pub max_train_rows: usize,
    #[serde(default = "default_validation_fraction")]
    pub validation_fraction: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            column: default_split_column(),
            train_label: default_train_label(),
            holdout_label: default_holdout_label(),
            max_train_rows: default_max_train_rows(),
            validation_fraction: default_validation_fraction(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnConfig {
    #[serde(default = "default_frame_column")]
    pub frame: String,
    #[serde(default = "default_boxes_column")]
    pub boxes: String,
    #[serde(default = "default_labels_column")]
    pub labels: String,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            frame: default_frame_column(),
            boxes: default_boxes_column(),
            labels: default_labels_column(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Classifier width including the trailing no-object class.
    pub num_classes: usize,
    #[serde(default = "default_num_queries")]
    pub num_queries: usize,
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    /// Dropout on the decoder output while training. Set to 0 to disable.
    #[serde(default = "default_dropout")]
    pub dropout: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    /// Relative classification weight of the no-object class.
    #[serde(default = "default_null_class_coef")]
    pub null_class_coef: f32,
    #[serde(default = "default_unit_cost")]
    pub cost_class: f32,
    #[serde(default = "default_unit_cost")]
    pub cost_bbox: f32,
    #[serde(default = "default_unit_cost")]
    pub cost_giou: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            null_class_coef: default_null_class_coef(),
            cost_class: default_unit_cost(),
            cost_bbox: default_unit_cost(),
            cost_giou: default_unit_cost(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default)]
    pub clip_grad_norm: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            clip_grad_norm: None,
        }
    }
}

/// Direction in which the monitored metric counts as improving.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlateauMode {
    Min,
    #[default]
    Max,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub mode: PlateauMode,
    #[serde(default = "default_plateau_factor")]
    pub factor: f64,
    #[serde(default = "default_plateau_patience")]
    pub patience: usize,
    #[serde(default = "default_plateau_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub min_lr: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: PlateauMode::default(),
            factor: default_plateau_factor(),
            patience: default_plateau_patience(),
            threshold: default_plateau_threshold(),
            min_lr: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub epochs: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    pub checkpoint: CheckpointConfig,
    pub logging: LoggingConfig,
    /// Run a loss pass over the held-out partition once training finishes.
    #[serde(default)]
    pub evaluate_test: bool,
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.checkpoint.directory, base);
        absolutize_in_place(&mut self.logging.directory, base);
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub directory: PathBuf,
    #[serde(default = "default_checkpoint_prefix")]
    pub prefix: String,
    #[serde(default = "default_checkpoint_suffix")]
    pub suffix: String,
    /// Also write `<prefix>.safetensors` whenever validation loss improves.
    #[serde(default)]
    pub save_best: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    #[serde(default = "default_log_filename")]
    pub filename: String,
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_batch_size() -> usize {
    4
}

fn default_image_size() -> u32 {
    224
}

fn default_split_column() -> String {
    "split".to_string()
}

fn default_train_label() -> String {
    "train".to_string()
}

fn default_holdout_label() -> String {
    "val-new-cl".to_string()
}

fn default_max_train_rows() -> usize {
    1000
}

fn default_validation_fraction() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

fn default_frame_column() -> String {
    "frame_path".to_string()
}

fn default_boxes_column() -> String {
    "boxes".to_string()
}

fn default_labels_column() -> String {
    "labels".to_string()
}

fn default_num_queries() -> usize {
    100
}

fn default_hidden_dim() -> usize {
    128
}

fn default_null_class_coef() -> f32 {
    0.1
}

fn default_unit_cost() -> f32 {
    1.0
}

fn default_learning_rate() -> f64 {
    5e-3
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_dropout() -> Option<f32> {
    Some(0.1)
}

fn default_plateau_factor() -> f64 {
    0.5
}

fn default_plateau_patience() -> usize {
    3
}

fn default_plateau_threshold() -> f64 {
    1e-4
}

fn default_checkpoint_prefix() -> String {
    "QGdetrF_best_no_aug".to_string()
}

fn default_checkpoint_suffix() -> String {
    "exp_logs.safetensors".to_string()
}

fn default_log_filename() -> String {
    "training_logs.txt".to_string()
}

fn default_enable_stdout() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("invalid sample data: {0}")]
    Data(String),
    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [data]
        table_path = "frames.csv"
        root_dir = "frames"

        [model]
        num_classes = 3

        [runtime]
        epochs = 2

        [runtime.checkpoint]
        directory = "checkpoint"

        [runtime.logging]
        directory = "logs"
    "#;

    #[test]
    fn defaults_follow_reference_run() {
        let config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.data.split.max_train_rows, 1000);
        assert_eq!(config.data.split.holdout_label, "val-new-cl");
        assert_eq!(config.data.split.seed, 42);
        assert_eq!(config.scheduler.mode, PlateauMode::Max);
        assert_eq!(config.scheduler.patience, 3);
        assert!((config.scheduler.factor - 0.5).abs() < f64::EPSILON);
        assert!((config.optimizer.learning_rate - 5e-3).abs() < f64::EPSILON);
        assert!(!config.runtime.checkpoint.save_best);
        assert_eq!(config.runtime.logging.filename, "training_logs.txt");
        assert_eq!(config.model.dropout, Some(0.1));
        config.validate().unwrap();
    }

    #[test]
    fn validation_collects_every_violation() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.data.batch_size = 0;
        config.runtime.epochs = 0;
        config.model.num_classes = 1;
        config.model.dropout = Some(1.5);

        match config.validate() {
            Err(TrainingError::Validation(messages)) => assert_eq!(messages.len(), 4),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(&path, MINIMAL).unwrap();

        let config = TrainingConfig::load(&path).unwrap();
        assert_eq!(config.data.table_path, dir.path().join("frames.csv"));
        assert_eq!(
            config.runtime.checkpoint.directory,
            dir.path().join("checkpoint")
        );
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        fs::write(&path, MINIMAL).unwrap();

        assert!(matches!(
            TrainingConfig::load(&path),
            Err(TrainingError::ConfigFormat(_))
        ));
    }
}
