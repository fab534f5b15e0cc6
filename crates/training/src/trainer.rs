use std::path::{Path, PathBuf};

use nmr_networks::Network;

use crate::{
    checkpoint::{self, CheckpointManager, CheckpointName, CheckpointRecord},
    config::{parse_dtype, LossKind, RuntimeConfig, SelectionMetric},
    data::BatchSource,
    epoch::{test_loop, train_loop, validation_loop},
    logging::{Logger, LoggingSettings, MetricsSink},
    loss::{LossFunction, SubstructureBce},
    optimizer::{AdamConfig, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerConfig},
    TrainingConfig, TrainingError,
};

/// Run-length and retention settings for [`Trainer::fit`].
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub nepochs: usize,
    pub prev_epochs: usize,
    pub top_checkpoints_n: usize,
    pub loss_metric: SelectionMetric,
    pub write_frequency: usize,
    pub test_frequency: usize,
    pub save_dir: PathBuf,
    pub checkpoint_tag: Option<String>,
}

impl FitOptions {
    pub fn new(nepochs: usize, save_dir: impl Into<PathBuf>) -> Self {
        Self {
            nepochs,
            prev_epochs: 0,
            top_checkpoints_n: 10,
            loss_metric: SelectionMetric::Val,
            write_frequency: 100,
            test_frequency: 10,
            save_dir: save_dir.into(),
            checkpoint_tag: None,
        }
    }

    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            nepochs: runtime.nepochs,
            prev_epochs: runtime.prev_epochs,
            top_checkpoints_n: runtime.top_checkpoints_n,
            loss_metric: runtime.loss_metric,
            write_frequency: runtime.write_frequency,
            test_frequency: runtime.test_frequency,
            save_dir: runtime.save_dir.clone(),
            checkpoint_tag: runtime.checkpoint_tag.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();
        if self.nepochs == 0 {
            errors.push("nepochs must be at least 1".to_string());
        }
        if self.top_checkpoints_n == 0 {
            errors.push("top_checkpoints_n must be at least 1".to_string());
        }
        if self.write_frequency == 0 {
            errors.push("write_frequency must be at least 1".to_string());
        }
        if self.test_frequency == 0 {
            errors.push("test_frequency must be at least 1".to_string());
        }
        if let Some(Err(err)) = self
            .checkpoint_tag
            .as_deref()
            .map(checkpoint::check_checkpoint_tag)
        {
            errors.push(err);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }
}

/// Batches for the three splits.
pub struct DataSplits<B: ?Sized> {
    pub train: Box<B>,
    pub val: Box<B>,
    pub test: Box<B>,
}

impl<B: BatchSource> DataSplits<B> {
    pub fn new(train: B, val: B, test: B) -> Self {
        Self {
            train: Box::new(train),
            val: Box::new(val),
            test: Box::new(test),
        }
    }
}

/// Loss histories and retained checkpoints of one `fit` call.
#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub train_losses: Vec<f64>,
    pub val_losses: Vec<f64>,
    pub test_losses: Vec<f64>,
    /// One entry per slot; `None` for a slot that was never filled.
    pub checkpoints: Vec<Option<PathBuf>>,
    pub records: Vec<Option<CheckpointRecord>>,
    /// Slot metrics parallel to `checkpoints`; unfilled slots are infinite.
    pub best_losses: Vec<f64>,
    pub epochs_run: usize,
}

pub struct Trainer<N: Network, S: MetricsSink> {
    model: N,
    optimizer: TrainerOptimizer,
    scheduler: Option<Box<dyn LRScheduler>>,
    loss: Box<dyn LossFunction>,
    logger: Logger<S>,
    options: FitOptions,
}

impl<N: Network, S: MetricsSink> Trainer<N, S> {
    pub fn new(
        model: N,
        optimizer: TrainerOptimizer,
        loss: Box<dyn LossFunction>,
        logger: Logger<S>,
        options: FitOptions,
    ) -> Result<Self, TrainingError> {
        options.validate()?;
        Ok(Self {
            model,
            optimizer,
            scheduler: None,
            loss,
            logger,
            options,
        })
    }

    /// Builds optimizer, scheduler and loss from `config`. `train_batches` is
    /// the number of training batches per epoch, used to size schedules.
    pub fn from_config(
        config: &TrainingConfig,
        model: N,
        sink: S,
        train_batches: usize,
    ) -> Result<Self, TrainingError> {
        if model.dtype() != parse_dtype(&config.model.dtype)? {
            return Err(TrainingError::initialization(format!(
                "model dtype {:?} does not match model.dtype '{}'",
                model.dtype(),
                config.model.dtype
            )));
        }

        let optimizer =
            TrainerOptimizer::new(model.named_parameters(), AdamConfig::from(&config.optimizer))?;

        let loss: Box<dyn LossFunction> = match config.loss.kind {
            LossKind::SubsWeightedBce => {
                let bce = SubstructureBce::new().with_num_classes(config.loss.num_classes);
                let bce = match &config.loss.class_weights {
                    Some(path) => bce.load_class_weights(path, model.device())?,
                    None => bce,
                };
                Box::new(bce)
            }
        };

        let logger = Logger::new(LoggingSettings::from_config(&config.runtime.logging), sink);
        let mut trainer = Self::new(
            model,
            optimizer,
            loss,
            logger,
            FitOptions::from_runtime(&config.runtime),
        )?;

        if let Some(cfg) = &config.scheduler {
            let total_steps = config.runtime.nepochs * train_batches;
            let scheduler = SchedulerConfig::from_training_config(
                cfg,
                config.optimizer.learning_rate as f64,
                total_steps,
            )?
            .build();
            trainer = trainer.with_scheduler(scheduler);
        }
        Ok(trainer)
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn LRScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn model(&self) -> &N {
        &self.model
    }

    pub fn optimizer(&self) -> &TrainerOptimizer {
        &self.optimizer
    }

    pub fn options(&self) -> &FitOptions {
        &self.options
    }

    pub fn logger(&self) -> &Logger<S> {
        &self.logger
    }

    pub fn into_parts(self) -> (N, TrainerOptimizer, Logger<S>) {
        (self.model, self.optimizer, self.logger)
    }

    /// Restores model and optimizer from a checkpoint file. When no resume
    /// offset was configured the run continues after the checkpoint's epoch.
    pub fn resume_from(&mut self, path: &Path) -> Result<CheckpointName, TrainingError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(checkpoint::parse_checkpoint_filename)
            .ok_or_else(|| {
                TrainingError::initialization(format!(
                    "{} is not a checkpoint file name",
                    path.display()
                ))
            })?;
        checkpoint::restore_checkpoint(path, None, &self.model, &mut self.optimizer)?;
        if self.options.prev_epochs == 0 {
            self.options.prev_epochs = name.epoch + 1;
        }
        log::info!(
            "resumed from {} (epoch {}, loss {:.6}); continuing at epoch {}",
            path.display(),
            name.epoch,
            name.loss,
            self.options.prev_epochs
        );
        Ok(name)
    }

    pub fn fit<B: BatchSource + ?Sized>(
        &mut self,
        data: &DataSplits<B>,
    ) -> Result<FitOutcome, TrainingError> {
        self.fit_with_shutdown(data, || false)
    }

    /// Runs `nepochs` epochs, checking `should_stop` before each one.
    ///
    /// Every epoch trains, validates, tests when the absolute epoch is a
    /// multiple of `test_frequency`, and offers the selected loss to the
    /// checkpoint slots. A final test pass always runs before the metrics sink
    /// is flushed and closed.
    pub fn fit_with_shutdown<B, F>(
        &mut self,
        data: &DataSplits<B>,
        mut should_stop: F,
    ) -> Result<FitOutcome, TrainingError>
    where
        B: BatchSource + ?Sized,
        F: FnMut() -> bool,
    {
        self.options.validate()?;
        let opts = self.options.clone();
        let mut manager =
            CheckpointManager::new(&opts.save_dir, opts.top_checkpoints_n, opts.checkpoint_tag);

        let mut train_losses = Vec::with_capacity(opts.nepochs);
        let mut val_losses = Vec::with_capacity(opts.nepochs);
        let mut test_losses = Vec::new();
        let mut last_epoch = None;

        for epoch in 0..opts.nepochs {
            let absolute = epoch + opts.prev_epochs;
            if should_stop() {
                log::info!("stop requested; ending before epoch {absolute}");
                break;
            }

            let train_loss = train_loop(
                &mut self.model,
                &*data.train,
                &*self.loss,
                &mut self.optimizer,
                absolute,
                &mut self.logger,
                self.scheduler.as_deref_mut(),
                opts.write_frequency,
            )?;
            train_losses.push(train_loss);

            let val_loss = validation_loop(
                &mut self.model,
                &*data.val,
                &*self.loss,
                absolute,
                &mut self.logger,
                opts.write_frequency,
            )?;
            val_losses.push(val_loss);

            if absolute % opts.test_frequency == 0 {
                test_losses.push(test_loop(
                    &mut self.model,
                    &*data.test,
                    &*self.loss,
                    absolute,
                    &mut self.logger,
                    opts.write_frequency,
                )?);
            }

            self.logger.epoch_summary(absolute, train_loss, val_loss);
            let metric = match opts.loss_metric {
                SelectionMetric::Train => train_loss,
                SelectionMetric::Val => val_loss,
            };
            manager.consider(metric, &self.model, &self.optimizer, absolute)?;
            last_epoch = Some(absolute);
        }

        let final_epoch = last_epoch.unwrap_or(opts.prev_epochs);
        test_losses.push(test_loop(
            &mut self.model,
            &*data.test,
            &*self.loss,
            final_epoch,
            &mut self.logger,
            opts.write_frequency,
        )?);
        self.logger.flush_and_close();

        let epochs_run = train_losses.len();
        let slots = manager.into_slots();
        if epochs_run == opts.nepochs && opts.nepochs >= opts.top_checkpoints_n {
            assert!(
                slots.all_filled(),
                "{} epochs ran but not all {} checkpoint slots hold a finite loss",
                epochs_run,
                opts.top_checkpoints_n
            );
        }

        Ok(FitOutcome {
            train_losses,
            val_losses,
            test_losses,
            checkpoints: slots.retained(),
            records: slots.records().to_vec(),
            best_losses: slots.metrics().to_vec(),
            epochs_run,
        })
    }
}
