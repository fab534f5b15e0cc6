use std::{
    fs,
    io::{self, Write},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Result;
use candle_core::{Device, Tensor};
use nmr_networks::{MhaNet, MhaNetConfig, Network, SpectrumBatch};
use nmr_training::{
    logging::ScalarEvent, AdamConfig, DataSplits, FitOptions, Logger, LoggingSettings,
    LossFunction, MemorySink, SelectionMetric, SubstructureBce, Trainer, TrainerOptimizer,
    TrainingError,
};
use tempfile::tempdir;

const CLASSES: usize = 5;

fn tiny_model() -> MhaNet {
    let mut config = MhaNetConfig::new(8, 2, 4, CLASSES);
    config.d_feedforward = 6;
    config.dropout = 0.0;
    MhaNet::new(config).expect("model")
}

fn batches(count: usize, offset: f32) -> Result<Vec<SpectrumBatch>> {
    let dev = Device::Cpu;
    (0..count)
        .map(|b| {
            let inputs: Vec<f32> = (0..2 * 4 * 2)
                .map(|i| ((i as f32 + offset + b as f32) * 0.37).sin().abs() + 0.1)
                .collect();
            let targets: Vec<f32> = (0..2 * CLASSES)
                .map(|i| ((i + b) % 2) as f32)
                .collect();
            Ok(SpectrumBatch::new(
                Tensor::from_vec(inputs, (2, 4, 2), &dev)?,
                Tensor::from_vec(targets, (2, CLASSES), &dev)?,
            ))
        })
        .collect()
}

fn splits() -> Result<DataSplits<Vec<SpectrumBatch>>> {
    Ok(DataSplits::new(
        batches(3, 0.0)?,
        batches(2, 10.0)?,
        batches(2, 20.0)?,
    ))
}

fn bce() -> SubstructureBce {
    SubstructureBce::new().with_num_classes(CLASSES)
}

fn trainer_with(
    options: FitOptions,
    loss: Box<dyn LossFunction>,
    logger: Logger<MemorySink>,
) -> Result<Trainer<MhaNet, MemorySink>, TrainingError> {
    let model = tiny_model();
    let optimizer = TrainerOptimizer::new(
        model.named_parameters(),
        AdamConfig::from(&nmr_training::config::OptimizerConfig::default()),
    )?;
    Trainer::new(model, optimizer, loss, logger, options)
}

fn trainer(options: FitOptions) -> Result<Trainer<MhaNet, MemorySink>, TrainingError> {
    trainer_with(
        options,
        Box::new(bce()),
        Logger::new(LoggingSettings::quiet(), MemorySink::new()),
    )
}

/// A loss that is never finite, so no checkpoint slot can ever be filled.
struct NanLoss;

impl LossFunction for NanLoss {
    fn compute(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
        bce()
            .compute(predictions, targets)?
            .affine(f64::NAN, 0.0)
            .map_err(|err| TrainingError::runtime(err.to_string()))
    }
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn lines(&self) -> Vec<String> {
        let bytes = self.0.lock().expect("buffer lock").clone();
        String::from_utf8(bytes)
            .expect("utf8 progress")
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn options(dir: &Path, nepochs: usize, k: usize) -> FitOptions {
    let mut options = FitOptions::new(nepochs, dir);
    options.top_checkpoints_n = k;
    options.test_frequency = 10;
    options.write_frequency = 1;
    options
}

fn steps(events: impl Iterator<Item = ScalarEvent>) -> Vec<usize> {
    events.map(|event| event.step).collect()
}

fn checkpoint_files(dir: &Path) -> Result<usize> {
    Ok(fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "safetensors"))
        .count())
}

#[test]
fn fit_tests_on_first_epoch_and_at_the_end() -> Result<()> {
    let tmp = tempdir()?;
    let data = splits()?;
    let mut trainer = trainer(options(tmp.path(), 3, 2))?;

    let outcome = trainer.fit(&data)?;

    assert_eq!(outcome.train_losses.len(), 3);
    assert_eq!(outcome.val_losses.len(), 3);
    assert_eq!(outcome.test_losses.len(), 2);
    assert_eq!(outcome.epochs_run, 3);

    let sink = trainer.logger().sink();
    assert!(sink.is_closed());
    assert_eq!(
        steps(sink.events_tagged("test/epoch_loss").cloned()),
        vec![0, 2]
    );
    assert_eq!(
        steps(sink.events_tagged("train/step_loss").cloned()),
        (0..9).collect::<Vec<_>>()
    );
    assert_eq!(
        steps(sink.events_tagged("val/epoch_loss").cloned()),
        vec![0, 1, 2]
    );
    Ok(())
}

#[test]
fn fit_keeps_exactly_k_checkpoints_on_disk() -> Result<()> {
    let tmp = tempdir()?;
    let data = splits()?;
    let mut trainer = trainer(options(tmp.path(), 4, 2))?;

    let outcome = trainer.fit(&data)?;

    assert_eq!(outcome.checkpoints.len(), 2);
    assert!(outcome.best_losses.iter().all(|loss| loss.is_finite()));
    for path in outcome.checkpoints.iter() {
        let path = path.as_ref().expect("slot filled");
        assert!(path.exists());
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("model_epoch="));
    }
    assert_eq!(checkpoint_files(tmp.path())?, 2);

    let mut sorted_val = outcome.val_losses.clone();
    sorted_val.sort_by(f64::total_cmp);
    let mut kept = outcome.best_losses.clone();
    kept.sort_by(f64::total_cmp);
    assert_eq!(kept, sorted_val[..2].to_vec());
    Ok(())
}

#[test]
fn selection_can_follow_training_loss() -> Result<()> {
    let tmp = tempdir()?;
    let data = splits()?;
    let mut opts = options(tmp.path(), 2, 1);
    opts.loss_metric = SelectionMetric::Train;
    let mut trainer = trainer(opts)?;

    let outcome = trainer.fit(&data)?;

    let best_train = outcome
        .train_losses
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min);
    assert_eq!(outcome.best_losses, vec![best_train]);
    Ok(())
}

#[test]
fn resumed_runs_use_absolute_epochs() -> Result<()> {
    let tmp = tempdir()?;
    let data = splits()?;
    let mut opts = options(tmp.path(), 2, 2);
    opts.prev_epochs = 5;
    opts.test_frequency = 5;
    opts.checkpoint_tag = Some("resumed".into());
    let mut trainer = trainer(opts)?;

    let outcome = trainer.fit(&data)?;

    assert_eq!(
        steps(trainer.logger().sink().events_tagged("test/epoch_loss").cloned()),
        vec![5, 6]
    );
    let mut names: Vec<String> = outcome
        .checkpoints
        .iter()
        .flatten()
        .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert!(names[0].starts_with("model_epoch=5_loss="));
    assert!(names[1].starts_with("model_epoch=6_loss="));
    assert!(names.iter().all(|name| name.ends_with("_resumed.safetensors")));
    Ok(())
}

#[test]
fn stopping_between_epochs_still_runs_the_final_test() -> Result<()> {
    let tmp = tempdir()?;
    let data = splits()?;
    let mut trainer = trainer(options(tmp.path(), 5, 3))?;
    let calls = AtomicUsize::new(0);

    let outcome = trainer.fit_with_shutdown(&data, || calls.fetch_add(1, Ordering::SeqCst) >= 1)?;

    assert_eq!(outcome.epochs_run, 1);
    assert_eq!(outcome.test_losses.len(), 2);
    assert_eq!(outcome.checkpoints.iter().flatten().count(), 1);
    assert!(trainer.logger().sink().is_closed());
    Ok(())
}

#[test]
fn zero_epochs_is_rejected() {
    let tmp = tempdir().expect("tempdir");
    match trainer(options(tmp.path(), 0, 1)) {
        Err(TrainingError::Validation(messages)) => {
            assert!(messages.iter().any(|m| m.contains("nepochs")));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("zero epochs must be rejected"),
    }
}

#[test]
fn empty_validation_split_is_an_error() -> Result<()> {
    let tmp = tempdir()?;
    let data = DataSplits::new(batches(2, 0.0)?, Vec::new(), batches(1, 0.0)?);
    let mut trainer = trainer(options(tmp.path(), 1, 1))?;

    let err = trainer.fit(&data).expect_err("empty split");

    assert!(err.to_string().contains("val split has no batches"));
    Ok(())
}

#[test]
#[should_panic(expected = "checkpoint slots hold a finite loss")]
fn full_run_with_unfilled_slots_fails_the_postcondition() {
    let tmp = tempdir().expect("tempdir");
    let data = splits().expect("splits");
    let logger = Logger::new(LoggingSettings::quiet(), MemorySink::new());
    let mut trainer =
        trainer_with(options(tmp.path(), 2, 2), Box::new(NanLoss), logger).expect("trainer");

    let _ = trainer.fit(&data);
}

#[test]
fn stopped_run_with_unfilled_slots_returns_normally() -> Result<()> {
    let tmp = tempdir()?;
    let data = splits()?;
    let logger = Logger::new(LoggingSettings::quiet(), MemorySink::new());
    let mut trainer = trainer_with(options(tmp.path(), 3, 2), Box::new(NanLoss), logger)?;
    let calls = AtomicUsize::new(0);

    let outcome = trainer.fit_with_shutdown(&data, || calls.fetch_add(1, Ordering::SeqCst) >= 1)?;

    assert_eq!(outcome.epochs_run, 1);
    assert!(outcome.checkpoints.iter().all(Option::is_none));
    assert!(outcome.best_losses.iter().all(|loss| loss.is_infinite()));
    assert_eq!(checkpoint_files(tmp.path())?, 0);
    Ok(())
}

#[test]
fn progress_lines_follow_write_frequency() -> Result<()> {
    let tmp = tempdir()?;
    let data = splits()?;
    let buffer = SharedBuffer::default();
    let mut settings = LoggingSettings::quiet();
    settings.enable_stdout = true;
    let logger = Logger::new(settings, MemorySink::new()).with_progress_writer(buffer.clone());
    let mut opts = options(tmp.path(), 1, 1);
    opts.write_frequency = 2;
    let mut trainer = trainer_with(opts, Box::new(bce()), logger)?;

    trainer.fit(&data)?;

    let batch_lines: Vec<String> = buffer
        .lines()
        .iter()
        .filter_map(|line| line.split(" loss=").next())
        .filter(|line| line.contains("batch="))
        .map(str::to_string)
        .collect();
    assert_eq!(
        batch_lines,
        vec![
            "train epoch=0 batch=0",
            "train epoch=0 batch=2",
            "val epoch=0 batch=0",
            "test epoch=0 batch=0",
            "test epoch=0 batch=0",
        ]
    );
    assert_eq!(
        buffer.lines().iter().filter(|line| line.starts_with("epoch=0 train_loss=")).count(),
        1
    );
    assert_eq!(
        steps(trainer.logger().sink().events_tagged("train/step_loss").cloned()),
        vec![0, 1, 2]
    );
    Ok(())
}

#[test]
fn checkpoint_tags_with_path_separators_are_rejected() {
    let tmp = tempdir().expect("tempdir");
    let mut opts = options(tmp.path(), 1, 1);
    opts.checkpoint_tag = Some("../outside".into());
    match trainer(opts) {
        Err(TrainingError::Validation(messages)) => {
            assert!(messages.iter().any(|m| m.contains("checkpoint tag")));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("a tag naming another directory must be rejected"),
    }
}
