//! One pass over a split.
//!
//! Every batch loss goes to the metrics sink at step
//! `epoch * batches_per_epoch + batch_index`; batches whose index is a
//! multiple of `write_frequency` also print a progress line. Each loop returns
//! the mean batch loss and records it at step `epoch`.

use candle_core::{DType, Tensor};
use nmr_networks::Network;

use crate::{
    config::to_runtime_error,
    data::BatchSource,
    logging::{Logger, MetricsSink},
    loss::LossFunction,
    metrics::LossAccumulator,
    optimizer::TrainerOptimizer,
    scheduler::LRScheduler,
    TrainingError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitKind {
    Train,
    Validation,
    Test,
}

impl SplitKind {
    pub fn name(self) -> &'static str {
        match self {
            SplitKind::Train => "train",
            SplitKind::Validation => "val",
            SplitKind::Test => "test",
        }
    }

    pub fn step_tag(self) -> &'static str {
        match self {
            SplitKind::Train => "train/step_loss",
            SplitKind::Validation => "val/step_loss",
            SplitKind::Test => "test/step_loss",
        }
    }

    pub fn epoch_tag(self) -> &'static str {
        match self {
            SplitKind::Train => "train/epoch_loss",
            SplitKind::Validation => "val/epoch_loss",
            SplitKind::Test => "test/epoch_loss",
        }
    }
}

/// Trains for one epoch: forward, loss, backward and one optimizer step per
/// batch. A scheduler, when given, advances once per batch and its rate is
/// applied to that batch's step.
#[allow(clippy::too_many_arguments)]
pub fn train_loop<N, B, L, S>(
    model: &mut N,
    data: &B,
    loss_fn: &L,
    optimizer: &mut TrainerOptimizer,
    epoch: usize,
    logger: &mut Logger<S>,
    mut scheduler: Option<&mut (dyn LRScheduler + 'static)>,
    write_frequency: usize,
) -> Result<f64, TrainingError>
where
    N: Network + ?Sized,
    B: BatchSource + ?Sized,
    L: LossFunction + ?Sized,
    S: MetricsSink,
{
    let split = SplitKind::Train;
    let num_batches = require_batches(data, split)?;
    model.set_training(true);

    let mut losses = LossAccumulator::new();
    for idx in 0..num_batches {
        let batch = data.batch(idx)?;
        let predictions = model.forward(&batch).map_err(to_runtime_error)?;
        let targets = model.loss_targets(&batch).map_err(to_runtime_error)?;
        let loss = loss_fn.compute(&predictions, &targets)?;

        let step = epoch * num_batches + idx;
        if let Some(scheduler) = scheduler.as_deref_mut() {
            let lr = scheduler.step();
            optimizer.set_learning_rate(lr);
            logger.scalar("train/learning_rate", lr, step);
        }
        optimizer.backward_step(&loss)?;

        let value = scalar_value(&loss)?;
        record_batch(logger, split, epoch, idx, step, value, write_frequency);
        losses.update(value);
    }

    finish_split(logger, split, epoch, &losses)
}

/// Mean validation loss. No parameters change and no gradients are taken.
pub fn validation_loop<N, B, L, S>(
    model: &mut N,
    data: &B,
    loss_fn: &L,
    epoch: usize,
    logger: &mut Logger<S>,
    write_frequency: usize,
) -> Result<f64, TrainingError>
where
    N: Network + ?Sized,
    B: BatchSource + ?Sized,
    L: LossFunction + ?Sized,
    S: MetricsSink,
{
    evaluate(
        SplitKind::Validation,
        model,
        data,
        loss_fn,
        epoch,
        logger,
        write_frequency,
    )
}

/// Mean test loss. No parameters change and no gradients are taken.
pub fn test_loop<N, B, L, S>(
    model: &mut N,
    data: &B,
    loss_fn: &L,
    epoch: usize,
    logger: &mut Logger<S>,
    write_frequency: usize,
) -> Result<f64, TrainingError>
where
    N: Network + ?Sized,
    B: BatchSource + ?Sized,
    L: LossFunction + ?Sized,
    S: MetricsSink,
{
    evaluate(
        SplitKind::Test,
        model,
        data,
        loss_fn,
        epoch,
        logger,
        write_frequency,
    )
}

fn evaluate<N, B, L, S>(
    split: SplitKind,
    model: &mut N,
    data: &B,
    loss_fn: &L,
    epoch: usize,
    logger: &mut Logger<S>,
    write_frequency: usize,
) -> Result<f64, TrainingError>
where
    N: Network + ?Sized,
    B: BatchSource + ?Sized,
    L: LossFunction + ?Sized,
    S: MetricsSink,
{
    let num_batches = require_batches(data, split)?;
    model.set_training(false);

    let mut losses = LossAccumulator::new();
    for idx in 0..num_batches {
        let batch = data.batch(idx)?;
        let predictions = model.forward(&batch).map_err(to_runtime_error)?.detach();
        let targets = model.loss_targets(&batch).map_err(to_runtime_error)?;
        let value = scalar_value(&loss_fn.compute(&predictions, &targets)?)?;

        let step = epoch * num_batches + idx;
        record_batch(logger, split, epoch, idx, step, value, write_frequency);
        losses.update(value);
    }

    finish_split(logger, split, epoch, &losses)
}

fn require_batches<B: BatchSource + ?Sized>(
    data: &B,
    split: SplitKind,
) -> Result<usize, TrainingError> {
    match data.num_batches() {
        0 => Err(TrainingError::runtime(format!(
            "{} split has no batches",
            split.name()
        ))),
        n => Ok(n),
    }
}

fn record_batch<S: MetricsSink>(
    logger: &mut Logger<S>,
    split: SplitKind,
    epoch: usize,
    batch: usize,
    step: usize,
    loss: f64,
    write_frequency: usize,
) {
    if batch % write_frequency.max(1) == 0 {
        logger.progress(split.name(), epoch, batch, loss);
    }
    logger.scalar(split.step_tag(), loss, step);
}

fn finish_split<S: MetricsSink>(
    logger: &mut Logger<S>,
    split: SplitKind,
    epoch: usize,
    losses: &LossAccumulator,
) -> Result<f64, TrainingError> {
    let mean = losses.mean().ok_or_else(|| {
        TrainingError::runtime(format!("{} split produced no losses", split.name()))
    })?;
    logger.scalar(split.epoch_tag(), mean, epoch);
    Ok(mean)
}

fn scalar_value(loss: &Tensor) -> Result<f64, TrainingError> {
    if loss.rank() != 0 {
        return Err(TrainingError::runtime(format!(
            "loss must be a scalar, got shape {:?}",
            loss.dims()
        )));
    }
    let value = loss
        .to_dtype(DType::F64)
        .and_then(|t| t.to_vec0::<f64>())
        .map_err(to_runtime_error)?;
    if !value.is_finite() {
        log::warn!("non-finite batch loss {value}");
    }
    Ok(value)
}
