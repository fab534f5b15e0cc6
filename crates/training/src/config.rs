use candle_core::{DType, Device};
use nmr_networks::MhaNetConfig;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: Option<SchedulerConfig>,
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
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

        if self.model.d_model == 0 {
            errors.push("model.d_model must be greater than 0".to_string());
        }
        if self.model.n_heads == 0 || self.model.d_model % self.model.n_heads != 0 {
            errors.push("model.d_model must be divisible by model.n_heads".to_string());
        }
        if self.model.max_seq_len == 0 {
            errors.push("model.max_seq_len must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            errors.push("model.dropout must be in [0, 1)".to_string());
        }
        if let Err(err) = parse_dtype(&self.model.dtype) {
            errors.push(err.to_string());
        }
        if self.model.d_out != self.loss.num_classes {
            errors.push(format!(
                "model.d_out ({}) must equal loss.num_classes ({})",
                self.model.d_out, self.loss.num_classes
            ));
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.splits.is_none() {
            let fractions = [
                self.data.train_size,
                self.data.val_size,
                self.data.test_size,
            ];
            if fractions.iter().any(|f| !(0.0..=1.0).contains(f)) {
                errors.push("data split fractions must each be in [0, 1]".to_string());
            }
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

        if let Some(scheduler) = &self.scheduler {
            if let Some(0) = scheduler.total_steps {
                errors.push("scheduler.total_steps must be greater than 0".to_string());
            }
            if let (Some(warmup), Some(total)) = (scheduler.warmup_steps, scheduler.total_steps) {
                if warmup > total {
                    errors.push(
                        "scheduler.warmup_steps cannot exceed scheduler.total_steps".to_string(),
                    );
                }
            }
            if let Some(min_lr) = scheduler.min_lr {
                if min_lr < 0.0 {
                    errors.push("scheduler.min_lr must be >= 0".to_string());
                }
                if min_lr > self.optimizer.learning_rate {
                    errors.push(
                        "scheduler.min_lr cannot exceed optimizer.learning_rate".to_string(),
                    );
                }
            }
            if matches!(scheduler.strategy, LearningRateSchedule::InverseSqrt)
                && scheduler.warmup_steps.unwrap_or(0) == 0
            {
                errors.push("scheduler.warmup_steps is required for inverse_sqrt".to_string());
            }
        }

        if self.runtime.nepochs == 0 {
            errors.push("runtime.nepochs must be greater than 0".to_string());
        }
        if self.runtime.top_checkpoints_n == 0 {
            errors.push("runtime.top_checkpoints_n must be greater than 0".to_string());
        }
        if self.runtime.write_frequency == 0 {
            errors.push("runtime.write_frequency must be greater than 0".to_string());
        }
        if self.runtime.test_frequency == 0 {
            errors.push("runtime.test_frequency must be greater than 0".to_string());
        }
        if self.runtime.save_dir.as_os_str().is_empty() {
            errors.push("runtime.save_dir must not be empty".to_string());
        }
        if let Some(Err(err)) = self
            .runtime
            .checkpoint_tag
            .as_deref()
            .map(crate::checkpoint::check_checkpoint_tag)
        {
            errors.push(format!("runtime.{err}"));
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        if let Some(weights) = self.loss.class_weights.as_mut() {
            absolutize_in_place(weights, base);
        }
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_d_model")]
    pub d_model: usize,
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,
    #[serde(default = "default_d_feedforward")]
    pub d_feedforward: usize,
    #[serde(default = "default_num_classes")]
    pub d_out: usize,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    #[serde(default)]
    pub src_pad_token: f32,
    #[serde(default = "default_true")]
    pub positional_encoding: bool,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default = "default_dtype")]
    pub dtype: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            d_model: default_d_model(),
            n_heads: default_n_heads(),
            d_feedforward: default_d_feedforward(),
            d_out: default_num_classes(),
            max_seq_len: default_max_seq_len(),
            src_pad_token: 0.0,
            positional_encoding: true,
            dropout: default_dropout(),
            dtype: default_dtype(),
        }
    }
}

impl ModelConfig {
    pub fn network_config(&self, device: &Device) -> Result<MhaNetConfig, TrainingError> {
        let mut config = MhaNetConfig::new(self.d_model, self.n_heads, self.max_seq_len, self.d_out);
        config.d_feedforward = self.d_feedforward;
        config.src_pad_token = self.src_pad_token;
        config.positional_encoding = self.positional_encoding;
        config.dropout = self.dropout;
        config.dtype = parse_dtype(&self.dtype)?;
        config.device = device.clone();
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Safetensors file holding the input and target tensors.
    pub path: PathBuf,
    #[serde(default = "default_input_key")]
    pub input_key: String,
    #[serde(default = "default_target_key")]
    pub target_key: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Explicit split-index file; overrides the fractions below.
    #[serde(default)]
    pub splits: Option<PathBuf>,
    #[serde(default = "default_train_size")]
    pub train_size: f64,
    #[serde(default = "default_holdout_size")]
    pub val_size: f64,
    #[serde(default = "default_holdout_size")]
    pub test_size: f64,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.path, base);
        if let Some(splits) = self.splits.as_mut() {
            absolutize_in_place(splits, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default)]
    pub kind: LossKind,
    /// Safetensors file with a `(num_classes, 2)` tensor named `weights`.
    #[serde(default)]
    pub class_weights: Option<PathBuf>,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            kind: LossKind::default(),
            class_weights: None,
            num_classes: default_num_classes(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    #[default]
    SubsWeightedBce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default)]
    pub weight_decay: f32,
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    #[default]
    Adam,
    AdamW,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default)]
    pub warmup_steps: Option<usize>,
    /// Defaults to `nepochs * train_batches` when omitted.
    #[serde(default)]
    pub total_steps: Option<usize>,
    #[serde(default)]
    pub min_lr: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    #[default]
    Constant,
    Cosine,
    InverseSqrt,
}

/// Which epoch loss ranks checkpoints.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMetric {
    Train,
    #[default]
    Val,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_nepochs")]
    pub nepochs: usize,
    /// Epochs already trained by an earlier run being resumed.
    #[serde(default)]
    pub prev_epochs: usize,
    #[serde(default = "default_top_checkpoints_n")]
    pub top_checkpoints_n: usize,
    #[serde(default)]
    pub loss_metric: SelectionMetric,
    #[serde(default = "default_write_frequency")]
    pub write_frequency: usize,
    #[serde(default = "default_test_frequency")]
    pub test_frequency: usize,
    pub save_dir: PathBuf,
    #[serde(default)]
    pub checkpoint_tag: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.save_dir, base);
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
        }
    }
}

/// Maps a dtype name used in configuration files to a candle dtype.
pub fn parse_dtype(name: &str) -> Result<DType, TrainingError> {
    match name.to_ascii_lowercase().as_str() {
        "float32" | "f32" => Ok(DType::F32),
        "float64" | "f64" => Ok(DType::F64),
        "float16" | "f16" => Ok(DType::F16),
        other => Err(TrainingError::validation(vec![format!(
            "unsupported model.dtype '{}' (expected float32, float64 or float16)",
            other
        )])),
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_d_model() -> usize {
    128
}

fn default_n_heads() -> usize {
    8
}

fn default_d_feedforward() -> usize {
    1024
}

fn default_num_classes() -> usize {
    crate::loss::NUM_SUBSTRUCTURES
}

fn default_max_seq_len() -> usize {
    28
}

fn default_dropout() -> f32 {
    0.1
}

fn default_dtype() -> String {
    "float32".to_string()
}

fn default_true() -> bool {
    true
}

fn default_input_key() -> String {
    "spectra".to_string()
}

fn default_target_key() -> String {
    "substructures".to_string()
}

fn default_batch_size() -> usize {
    32
}

fn default_train_size() -> f64 {
    0.8
}

fn default_holdout_size() -> f64 {
    0.1
}

fn default_learning_rate() -> f32 {
    1e-4
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_adam_eps() -> f32 {
    1e-8
}

fn default_nepochs() -> usize {
    100
}

fn default_top_checkpoints_n() -> usize {
    10
}

fn default_write_frequency() -> usize {
    100
}

fn default_test_frequency() -> usize {
    10
}

fn default_tensorboard_flush_every_n() -> usize {
    50
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o failure: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_)
            | TrainingError::Validation(_)
            | TrainingError::Initialization(_)
            | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
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

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [data]
        path = "spectra.safetensors"

        [runtime]
        save_dir = "runs/example"
        nepochs = 4
        top_checkpoints_n = 2
    "#;

    #[test]
    fn minimal_toml_fills_defaults() {
        let config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.model.d_out, crate::loss::NUM_SUBSTRUCTURES);
        assert_eq!(config.runtime.loss_metric, SelectionMetric::Val);
        assert_eq!(config.runtime.test_frequency, 10);
        assert!(config.scheduler.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.runtime.nepochs = 0;
        config.runtime.test_frequency = 0;
        config.model.dtype = "int8".into();

        let Err(TrainingError::Validation(messages)) = config.validate() else {
            panic!("expected validation failure");
        };
        assert_eq!(messages.len(), 3);
    }

    #[test]
    fn checkpoint_tags_cannot_leave_the_save_dir() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.runtime.checkpoint_tag = Some("nmr_v2".into());
        config.validate().unwrap();

        for tag in ["../escape", "nested/run", "win\\run"] {
            config.runtime.checkpoint_tag = Some(tag.into());
            let Err(TrainingError::Validation(messages)) = config.validate() else {
                panic!("tag {tag:?} should be rejected");
            };
            assert!(messages[0].starts_with("runtime.checkpoint tag"));
        }
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(&path, MINIMAL).unwrap();

        let config = TrainingConfig::load(&path).unwrap();
        assert_eq!(config.data.path, dir.path().join("spectra.safetensors"));
        assert_eq!(config.runtime.save_dir, dir.path().join("runs/example"));
    }

    #[test]
    fn dtype_names_map_to_candle_dtypes() {
        assert_eq!(parse_dtype("float32").unwrap(), DType::F32);
        assert_eq!(parse_dtype("float64").unwrap(), DType::F64);
        assert_eq!(parse_dtype("FLOAT16").unwrap(), DType::F16);
        assert!(parse_dtype("bfloat8").is_err());
    }
}
