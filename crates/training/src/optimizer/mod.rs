use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{
    config::{self, to_runtime_error},
    TrainingError,
};

const EPS: f64 = 1e-12;

/// Key of the step counter inside [`TrainerOptimizer::state_tensors`].
pub const STEP_KEY: &str = "step";
const FIRST_MOMENT_SUFFIX: &str = "exp_avg";
const SECOND_MOMENT_SUFFIX: &str = "exp_avg_sq";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightDecayMode {
    /// Decay folded into the gradient before the moment updates.
    Coupled,
    /// Decay applied to the weights directly.
    Decoupled,
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    pub decay_mode: WeightDecayMode,
}

impl From<&config::OptimizerConfig> for AdamConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        let decay_mode = match value.algorithm {
            config::OptimizerType::Adam => WeightDecayMode::Coupled,
            config::OptimizerType::AdamW => WeightDecayMode::Decoupled,
        };
        Self {
            learning_rate: value.learning_rate as f64,
            beta1: value.beta1 as f64,
            beta2: value.beta2 as f64,
            epsilon: value.epsilon as f64,
            weight_decay: value.weight_decay as f64,
            decay_mode,
        }
    }
}

/// Adam/AdamW over a fixed, named parameter set.
///
/// Moments are kept in `F32` regardless of the parameter dtype.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let first_moment = tensor
                .zeros_like()
                .and_then(|t| t.to_dtype(DType::F32))
                .map_err(to_runtime_error)?;
            let second_moment = first_moment.clone();
            params.push(ParameterSlot {
                name,
                dtype: tensor.dtype(),
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Backpropagates `loss` and applies one update.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<(), TrainingError> {
        let mut grads = loss.backward().map_err(to_runtime_error)?;
        self.step(&mut grads)
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut updates = Vec::new();
        for (idx, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
                updates.push((idx, grad));
            }
        }
        if updates.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (idx, grad) in updates {
            let slot = &mut self.params[idx];
            let (first, second) =
                adam_update(slot, grad, &cfg, scale_m, scale_v).map_err(to_runtime_error)?;
            slot.first_moment = first;
            slot.second_moment = second;
        }

        Ok(())
    }

    /// Moments and step counter as named tensors, ready to persist.
    pub fn state_tensors(&self) -> Result<HashMap<String, Tensor>, TrainingError> {
        let mut state = HashMap::with_capacity(self.params.len() * 2 + 1);
        for slot in &self.params {
            state.insert(
                format!("{}.{}", slot.name, FIRST_MOMENT_SUFFIX),
                slot.first_moment.clone(),
            );
            state.insert(
                format!("{}.{}", slot.name, SECOND_MOMENT_SUFFIX),
                slot.second_moment.clone(),
            );
        }
        let step = u32::try_from(self.step)
            .map_err(|_| TrainingError::runtime("optimizer step counter overflows u32"))?;
        let device = self.params[0].param.as_tensor().device();
        state.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[step], device).map_err(to_runtime_error)?,
        );
        Ok(state)
    }

    /// Restores state produced by [`TrainerOptimizer::state_tensors`].
    pub fn load_state_tensors(
        &mut self,
        state: &HashMap<String, Tensor>,
    ) -> Result<(), TrainingError> {
        let step = state
            .get(STEP_KEY)
            .ok_or_else(|| TrainingError::runtime("optimizer state missing step counter"))?
            .to_dtype(DType::U32)
            .and_then(|t| t.to_vec1::<u32>())
            .map_err(to_runtime_error)?;
        let step = *step
            .first()
            .ok_or_else(|| TrainingError::runtime("optimizer step counter is empty"))?;

        let expected_entries = self.params.len() * 2 + 1;
        if state.len() != expected_entries {
            return Err(TrainingError::runtime(format!(
                "optimizer state has {} entries, expected {}",
                state.len(),
                expected_entries
            )));
        }

        for slot in &mut self.params {
            let device = slot.param.as_tensor().device().clone();
            let dims = slot.param.as_tensor().dims().to_vec();
            let moment = |suffix: &str| -> Result<Tensor, TrainingError> {
                let key = format!("{}.{}", slot.name, suffix);
                let tensor = state.get(&key).ok_or_else(|| {
                    TrainingError::runtime(format!("optimizer state missing '{}'", key))
                })?;
                if tensor.dims() != dims.as_slice() {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state shape mismatch for '{}'",
                        key
                    )));
                }
                tensor
                    .to_device(&device)
                    .and_then(|t| t.to_dtype(DType::F32))
                    .map_err(to_runtime_error)
            };
            let first = moment(FIRST_MOMENT_SUFFIX)?;
            let second = moment(SECOND_MOMENT_SUFFIX)?;
            slot.first_moment = first;
            slot.second_moment = second;
        }

        self.step = step as usize;
        Ok(())
    }
}

fn adam_update(
    slot: &ParameterSlot,
    grad: Tensor,
    cfg: &AdamConfig,
    scale_m: f64,
    scale_v: f64,
) -> candle_core::Result<(Tensor, Tensor)> {
    let weights = slot.param.as_tensor().to_dtype(DType::F32)?;
    let decay = cfg.weight_decay != 0.0;

    let grad = if decay && cfg.decay_mode == WeightDecayMode::Coupled {
        (grad + weights.affine(cfg.weight_decay, 0.0)?)?
    } else {
        grad
    };

    let new_m = (slot.first_moment.affine(cfg.beta1, 0.0)? + grad.affine(1.0 - cfg.beta1, 0.0)?)?;
    let new_v = (slot.second_moment.affine(cfg.beta2, 0.0)?
        + grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

    let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
    let update = new_m
        .affine(scale_m, 0.0)?
        .div(&denom)?
        .affine(cfg.learning_rate, 0.0)?;

    let base = if decay && cfg.decay_mode == WeightDecayMode::Decoupled {
        weights.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)?
    } else {
        weights
    };
    let next = base.sub(&update)?;
    let next = if slot.dtype == DType::F32 {
        next
    } else {
        next.to_dtype(slot.dtype)?
    };
    slot.param.set(&next)?;

    Ok((new_m, new_v))
}
