use std::path::Path;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops;

use crate::{config::to_runtime_error, TrainingError};

/// Cardinality of the substructure label schema the networks predict.
pub const NUM_SUBSTRUCTURES: usize = 957;

/// Lower bound for log terms, matching the usual BCE clamp.
const LOG_FLOOR: f64 = -100.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Reduction {
    /// Mean over the batch per class, then summed over classes.
    #[default]
    Mean,
    /// Sum over the batch per class, then summed over classes.
    Sum,
}

/// Substructure-weighted binary cross entropy over `NUM_SUBSTRUCTURES` classes.
///
/// `predictions` and `targets` are `(batch, classes)` probabilities and 0/1
/// labels. `weights`, when given, is `(batch, classes, 2)`: index 0 weights a
/// negative label and index 1 a positive one. Returns a scalar tensor.
///
/// Panics if the class dimension is not `NUM_SUBSTRUCTURES`.
pub fn subs_weighted_bce(
    predictions: &Tensor,
    targets: &Tensor,
    weights: Option<&Tensor>,
    reduction: Reduction,
) -> candle_core::Result<Tensor> {
    weighted_bce(predictions, targets, weights, reduction, NUM_SUBSTRUCTURES)
}

fn weighted_bce(
    predictions: &Tensor,
    targets: &Tensor,
    weights: Option<&Tensor>,
    reduction: Reduction,
    num_classes: usize,
) -> candle_core::Result<Tensor> {
    let (_, classes) = predictions.dims2()?;
    assert_eq!(
        classes, num_classes,
        "prediction class count does not match the label schema"
    );

    let targets = targets.to_dtype(predictions.dtype())?;
    let inverse_targets = targets.affine(-1.0, 1.0)?;

    let log_p = predictions.log()?.maximum(LOG_FLOOR)?;
    let log_not_p = predictions.affine(-1.0, 1.0)?.log()?.maximum(LOG_FLOOR)?;
    let bce = ((&targets * &log_p)? + (&inverse_targets * &log_not_p)?)?.neg()?;

    let elementwise = match weights {
        Some(weights) => {
            let weights = weights.to_dtype(predictions.dtype())?;
            let negative = weights.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?;
            let positive = weights.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?;
            let per_element = ((&targets * &positive)? + (&inverse_targets * &negative)?)?;
            (bce * per_element)?
        }
        None => bce,
    };

    let per_class = match reduction {
        Reduction::Mean => elementwise.mean(0)?,
        Reduction::Sum => elementwise.sum(0)?,
    };
    per_class.sum_all()
}

/// Scalar loss over a batch of network outputs.
pub trait LossFunction {
    fn compute(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError>;
}

/// Weighted BCE with optional per-class `(classes, 2)` weights shared by
/// every sample of a batch.
#[derive(Debug, Clone)]
pub struct SubstructureBce {
    class_weights: Option<Tensor>,
    num_classes: usize,
    reduction: Reduction,
}

impl SubstructureBce {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }

    pub fn with_class_weights(mut self, weights: Tensor) -> Result<Self, TrainingError> {
        let dims = weights.dims();
        if dims != [self.num_classes, 2] {
            return Err(TrainingError::initialization(format!(
                "class weights must be shaped ({}, 2), got {:?}",
                self.num_classes, dims
            )));
        }
        self.class_weights = Some(weights);
        Ok(self)
    }

    /// Loads class weights from the `weights` tensor of a safetensors file.
    pub fn load_class_weights(
        self,
        path: impl AsRef<Path>,
        device: &Device,
    ) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let mut tensors = candle_core::safetensors::load(path, device).map_err(to_runtime_error)?;
        let weights = tensors.remove("weights").ok_or_else(|| {
            TrainingError::initialization(format!(
                "{} has no 'weights' tensor",
                path.display()
            ))
        })?;
        self.with_class_weights(weights)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

impl Default for SubstructureBce {
    fn default() -> Self {
        Self {
            class_weights: None,
            num_classes: NUM_SUBSTRUCTURES,
            reduction: Reduction::Mean,
        }
    }
}

impl LossFunction for SubstructureBce {
    fn compute(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
        let batch = predictions.dim(0).map_err(to_runtime_error)?;
        let weights = match &self.class_weights {
            Some(weights) => Some(
                weights
                    .to_device(predictions.device())
                    .and_then(|w| w.unsqueeze(0))
                    .and_then(|w| w.broadcast_as((batch, self.num_classes, 2)))
                    .map_err(to_runtime_error)?,
            ),
            None => None,
        };
        weighted_bce(
            predictions,
            targets,
            weights.as_ref(),
            self.reduction,
            self.num_classes,
        )
        .map_err(to_runtime_error)
    }
}

/// Token-level cross entropy for sequence targets, with optional label
/// smoothing and an ignored padding index.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    label_smoothing: f32,
    ignore_index: Option<u32>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(mut self, smoothing: f32) -> Result<Self, TrainingError> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainingError::initialization(
                "label smoothing must be in [0, 1) for cross entropy",
            ));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<u32>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    fn token_losses(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
        let dims = logits.dims();
        if dims.len() < 2 {
            return Err(TrainingError::runtime(
                "cross entropy expects logits with at least two dimensions",
            ));
        }
        let vocab_size = dims[dims.len() - 1];
        let token_dims = &dims[..dims.len() - 1];
        if targets.dims() != token_dims {
            return Err(TrainingError::runtime(
                "target tensor must match logits batch/sequence dimensions",
            ));
        }
        let token_count: usize = token_dims.iter().product();
        if token_count == 0 || vocab_size == 0 {
            return Err(TrainingError::runtime(
                "no tokens available for loss computation",
            ));
        }

        let compute = || -> candle_core::Result<(Tensor, Tensor)> {
            let logits = logits.reshape((token_count, vocab_size))?;
            let log_probs = ops::log_softmax(&logits, D::Minus1)?;
            let targets = targets
                .to_device(logits.device())?
                .reshape((token_count,))?
                .to_dtype(DType::U32)?;

            let mask = match self.ignore_index {
                Some(ignore) => targets.ne(ignore)?.to_dtype(log_probs.dtype())?,
                None => Tensor::ones((token_count,), log_probs.dtype(), logits.device())?,
            };

            let nll = log_probs
                .gather(&targets.unsqueeze(1)?, 1)?
                .squeeze(1)?
                .neg()?;
            let per_token = if self.label_smoothing > 0.0 {
                let smoothing = self.label_smoothing as f64;
                let uniform = log_probs.mean(1)?.neg()?;
                (nll.affine(1.0 - smoothing, 0.0)? + uniform.affine(smoothing, 0.0)?)?
            } else {
                nll
            };
            Ok(((per_token * &mask)?, mask))
        };
        let (losses, mask) = compute().map_err(to_runtime_error)?;

        let counted = mask
            .sum_all()
            .and_then(|t| t.to_dtype(DType::F64))
            .and_then(|t| t.to_vec0::<f64>())
            .map_err(to_runtime_error)?;
        if counted < 0.5 {
            return Err(TrainingError::runtime(
                "no valid tokens remain after applying ignore_index",
            ));
        }
        losses
            .sum_all()
            .and_then(|sum| sum.affine(1.0 / counted, 0.0))
            .map_err(to_runtime_error)
    }
}

impl LossFunction for CrossEntropyLoss {
    fn compute(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
        self.token_losses(predictions, targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(t: &Tensor) -> f32 {
        t.to_vec0::<f32>().unwrap()
    }

    fn full_width_batch() -> (Tensor, Tensor) {
        let dev = Device::Cpu;
        let preds: Vec<f32> = (0..2 * NUM_SUBSTRUCTURES)
            .map(|i| 0.05 + 0.9 * ((i * 37 % 101) as f32 / 100.0))
            .collect();
        let labels: Vec<f32> = (0..2 * NUM_SUBSTRUCTURES)
            .map(|i| if i % 3 == 0 { 1.0 } else { 0.0 })
            .collect();
        (
            Tensor::from_vec(preds, (2, NUM_SUBSTRUCTURES), &dev).unwrap(),
            Tensor::from_vec(labels, (2, NUM_SUBSTRUCTURES), &dev).unwrap(),
        )
    }

    #[test]
    fn missing_weights_match_unit_weights() {
        let (preds, labels) = full_width_batch();
        let ones = Tensor::ones((2, NUM_SUBSTRUCTURES, 2), DType::F32, &Device::Cpu).unwrap();

        let unweighted = subs_weighted_bce(&preds, &labels, None, Reduction::Mean).unwrap();
        let weighted = subs_weighted_bce(&preds, &labels, Some(&ones), Reduction::Mean).unwrap();

        assert!((scalar(&unweighted) - scalar(&weighted)).abs() < 1e-3);
    }

    #[test]
    #[should_panic(expected = "class count")]
    fn class_count_mismatch_panics() {
        let preds = Tensor::full(0.5f32, (2, 10), &Device::Cpu).unwrap();
        let labels = Tensor::zeros((2, 10), DType::F32, &Device::Cpu).unwrap();
        let _ = subs_weighted_bce(&preds, &labels, None, Reduction::Mean);
    }

    #[test]
    fn reduces_mean_over_batch_then_sums_classes() {
        let dev = Device::Cpu;
        let preds = Tensor::new(&[[0.5f32, 0.9], [0.5, 0.9]], &dev).unwrap();
        let labels = Tensor::new(&[[1f32, 0.0], [1.0, 0.0]], &dev).unwrap();
        let expected = -(0.5f32.ln()) - (0.1f32.ln());

        let mean = SubstructureBce::new()
            .with_num_classes(2)
            .compute(&preds, &labels)
            .unwrap();
        let sum = SubstructureBce::new()
            .with_num_classes(2)
            .with_reduction(Reduction::Sum)
            .compute(&preds, &labels)
            .unwrap();

        assert!((scalar(&mean) - expected).abs() < 1e-4);
        assert!((scalar(&sum) - 2.0 * expected).abs() < 1e-4);
    }

    #[test]
    fn class_weights_select_by_label() {
        let dev = Device::Cpu;
        let preds = Tensor::new(&[[0.5f32, 0.5]], &dev).unwrap();
        let labels = Tensor::new(&[[1f32, 0.0]], &dev).unwrap();
        // class 0 positive weight 2, class 1 negative weight 3
        let weights = Tensor::new(&[[7f32, 2.0], [3.0, 11.0]], &dev).unwrap();

        let loss = SubstructureBce::new()
            .with_num_classes(2)
            .with_class_weights(weights)
            .unwrap()
            .compute(&preds, &labels)
            .unwrap();

        let expected = -(0.5f32.ln()) * 5.0;
        assert!((scalar(&loss) - expected).abs() < 1e-4);
    }

    #[test]
    fn saturated_predictions_stay_finite() {
        let dev = Device::Cpu;
        let preds = Tensor::new(&[[0f32, 1.0]], &dev).unwrap();
        let labels = Tensor::new(&[[1f32, 0.0]], &dev).unwrap();

        let loss = SubstructureBce::new()
            .with_num_classes(2)
            .compute(&preds, &labels)
            .unwrap();

        assert!((scalar(&loss) - 200.0).abs() < 1e-3);
    }

    #[test]
    fn cross_entropy_ignores_padding_tokens() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[[2f32, 0.0, 0.0], [0.0, 0.0, 5.0]]], &dev).unwrap();
        let targets = Tensor::new(&[[0u32, 2]], &dev).unwrap();
        let padded = Tensor::new(&[[0u32, 1]], &dev).unwrap();

        let full = CrossEntropyLoss::new().compute(&logits, &targets).unwrap();
        let ignored = CrossEntropyLoss::new()
            .with_ignore_index(Some(1))
            .compute(&logits, &padded)
            .unwrap();

        let first = -(2f32.exp() / (2f32.exp() + 2.0)).ln();
        let second = -(5f32.exp() / (5f32.exp() + 2.0)).ln();
        assert!((scalar(&full) - (first + second) / 2.0).abs() < 1e-4);
        assert!((scalar(&ignored) - first).abs() < 1e-4);
    }
}
