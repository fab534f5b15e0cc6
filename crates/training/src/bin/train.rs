use std::{
    fs,
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use candle_core::{utils::cuda_is_available, Device};
use clap::Parser;
use nmr_networks::MhaNet;
use nmr_training::{
    data::BatchSource,
    history::{save_completed_config, save_train_history, TrainHistory},
    split_data_subsets, DataLoader, DataSplits, Dataset, Determinism, LoggingSettings, SplitIndices,
    SplitStrategy, TensorDataset, Trainer, TrainingConfig, TrainingError,
};
use serde_json::{Number, Value};
use tracing_subscriber::EnvFilter;

const SPLIT_INDICES_FILENAME: &str = "split_indices.json";

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Spectrum-to-substructure training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, value_name = "CHECKPOINT", help = "Resume from a checkpoint file")]
    resume: Option<PathBuf>,

    #[arg(long, help = "Force CPU even when CUDA is available")]
    cpu: bool,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    config.validate()?;

    let mut determinism = Determinism::new(config.runtime.seed);
    config.runtime.seed = Some(determinism.seed());

    let device = select_device(args.cpu);
    determinism.seed_device(&device);

    let save_dir = config.runtime.save_dir.clone();
    fs::create_dir_all(&save_dir)?;

    let dataset = Arc::new(TensorDataset::load(
        &config.data.path,
        &config.data.input_key,
        &config.data.target_key,
        &device,
    )?);
    let strategy = match &config.data.splits {
        Some(path) => {
            log::info!("splitting data using indices from {}", path.display());
            SplitStrategy::Indices(SplitIndices::load(path)?)
        }
        None => SplitStrategy::Fractions {
            train: config.data.train_size,
            val: config.data.val_size,
            test: config.data.test_size,
        },
    };
    let indices = split_data_subsets(dataset.len(), &strategy, &mut determinism)?;
    indices.save(&save_dir.join(SPLIT_INDICES_FILENAME))?;

    let batch_size = config.data.batch_size;
    let splits = DataSplits::new(
        DataLoader::new(dataset.clone(), indices.train, batch_size)?,
        DataLoader::new(dataset.clone(), indices.val, batch_size)?,
        DataLoader::new(dataset, indices.test, batch_size)?,
    );

    let model = MhaNet::new(config.model.network_config(&device)?)
        .map_err(|err| TrainingError::initialization(err.to_string()))?;
    let sink = LoggingSettings::from_config(&config.runtime.logging).build_sink()?;
    let mut trainer = Trainer::from_config(&config, model, sink, splits.train.num_batches())?;

    if let Some(checkpoint) = args.resume.as_deref() {
        let name = trainer.resume_from(checkpoint)?;
        config.runtime.prev_epochs = trainer.options().prev_epochs;
        log::info!("resuming after epoch {}", name.epoch);
    }

    let config_path = save_completed_config(&save_dir, &config)?;
    log::info!("wrote completed config to {}", config_path.display());

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let outcome =
        trainer.fit_with_shutdown(&splits, || shutdown_flag.load(Ordering::Relaxed))?;
    save_train_history(&save_dir, &TrainHistory::from(&outcome))?;

    log::info!(
        "finished {} epoch(s); retained {} checkpoint(s)",
        outcome.epochs_run,
        outcome.checkpoints.iter().flatten().count()
    );
    Ok(())
}

fn select_device(force_cpu: bool) -> Device {
    if !force_cpu && cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(device) => return device,
            Err(err) => log::warn!("falling back to CPU: {err}"),
        }
    }
    Device::Cpu
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

/// Assigns `new_value` at a dot-separated path, creating missing objects.
fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "invalid override path '{path}'"
        )));
    }

    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| TrainingError::runtime("override path must not be empty"))?;

    let mut current = value;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        let Value::Object(map) = current else {
            return Err(TrainingError::runtime(format!(
                "override path segment '{segment}' points to non-object value"
            )));
        };
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }

    if current.is_null() {
        *current = Value::Object(serde_json::Map::new());
    }
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), new_value);
            Ok(())
        }
        _ => Err(TrainingError::runtime(format!(
            "override path '{path}' points into a non-object value"
        ))),
    }
}
