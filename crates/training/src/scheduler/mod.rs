use std::f64::consts::PI;

use crate::{config, TrainingError};

/// Per-batch learning-rate schedule.
pub trait LRScheduler: Send {
    /// Advances one batch and returns the rate to apply to it.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

#[derive(Debug, Clone)]
pub enum SchedulerConfig {
    ConstantWithWarmup {
        base_lr: f64,
        warmup_steps: usize,
    },
    LinearWarmupCosine {
        base_lr: f64,
        min_lr: f64,
        total_steps: usize,
        warmup_steps: usize,
    },
    InverseSqrt {
        base_lr: f64,
        warmup_steps: usize,
    },
}

impl SchedulerConfig {
    /// `total_steps` is the run length in batches, used when the config does
    /// not pin one.
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        total_steps: usize,
    ) -> Result<Self, TrainingError> {
        let total_steps = cfg.total_steps.unwrap_or(total_steps);
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        let warmup_steps = cfg.warmup_steps.unwrap_or(0).min(total_steps);
        let min_lr = cfg.min_lr.unwrap_or(0.0) as f64;

        match cfg.strategy {
            config::LearningRateSchedule::Constant => Ok(SchedulerConfig::ConstantWithWarmup {
                base_lr,
                warmup_steps,
            }),
            config::LearningRateSchedule::Cosine => {
                if min_lr < 0.0 || min_lr > base_lr {
                    return Err(TrainingError::initialization(
                        "scheduler min_lr must be in [0, base_lr]",
                    ));
                }
                Ok(SchedulerConfig::LinearWarmupCosine {
                    base_lr,
                    min_lr,
                    total_steps,
                    warmup_steps,
                })
            }
            config::LearningRateSchedule::InverseSqrt => {
                if warmup_steps == 0 {
                    return Err(TrainingError::initialization(
                        "inverse_sqrt schedule requires warmup_steps > 0",
                    ));
                }
                Ok(SchedulerConfig::InverseSqrt {
                    base_lr,
                    warmup_steps,
                })
            }
        }
    }

    pub fn build(self) -> Box<dyn LRScheduler> {
        let schedule: fn(&SchedulerConfig, usize) -> f64 = match self {
            SchedulerConfig::ConstantWithWarmup { .. } => constant_lr,
            SchedulerConfig::LinearWarmupCosine { .. } => cosine_lr,
            SchedulerConfig::InverseSqrt { .. } => inverse_sqrt_lr,
        };
        Box::new(StepScheduler {
            config: self,
            schedule,
            step: 0,
            current_lr: 0.0,
        })
    }
}

struct StepScheduler {
    config: SchedulerConfig,
    schedule: fn(&SchedulerConfig, usize) -> f64,
    step: usize,
    current_lr: f64,
}

impl LRScheduler for StepScheduler {
    fn step(&mut self) -> f64 {
        let lr = (self.schedule)(&self.config, self.step);
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

fn warmup_lr(base_lr: f64, warmup_steps: usize, step: usize) -> Option<f64> {
    if warmup_steps > 0 && step < warmup_steps {
        Some(base_lr * (step + 1) as f64 / warmup_steps as f64)
    } else {
        None
    }
}

fn constant_lr(config: &SchedulerConfig, step: usize) -> f64 {
    match *config {
        SchedulerConfig::ConstantWithWarmup {
            base_lr,
            warmup_steps,
        } => warmup_lr(base_lr, warmup_steps, step).unwrap_or(base_lr),
        _ => 0.0,
    }
}

fn cosine_lr(config: &SchedulerConfig, step: usize) -> f64 {
    let SchedulerConfig::LinearWarmupCosine {
        base_lr,
        min_lr,
        total_steps,
        warmup_steps,
    } = *config
    else {
        return 0.0;
    };
    if let Some(lr) = warmup_lr(base_lr, warmup_steps, step) {
        return lr;
    }
    if total_steps <= warmup_steps {
        return base_lr.max(min_lr);
    }
    let effective = step.saturating_sub(warmup_steps) as f64;
    let denom = (total_steps - warmup_steps).max(1) as f64;
    let progress = (effective / denom).clamp(0.0, 1.0);
    let cosine = 0.5 * (1.0 + f64::cos(PI * progress));
    min_lr + (base_lr - min_lr) * cosine
}

fn inverse_sqrt_lr(config: &SchedulerConfig, step: usize) -> f64 {
    let SchedulerConfig::InverseSqrt {
        base_lr,
        warmup_steps,
    } = *config
    else {
        return 0.0;
    };
    warmup_lr(base_lr, warmup_steps, step)
        .unwrap_or_else(|| base_lr * (warmup_steps as f64 / (step + 1) as f64).sqrt())
}
