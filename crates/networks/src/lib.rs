pub mod attention;
pub mod config;
pub mod embedding;
pub mod mhanet;

pub use attention::MultiHeadAttention;
pub use config::MhaNetConfig;
pub use embedding::{ContinuousEmbedding, PositionalEncoding};
pub use mhanet::{FlattenHead, MhaNet};

use candle_core::{DType, Device, Result, Tensor, Var};

/// One mini-batch of spectra and their supervision targets.
///
/// `inputs` is shaped `(batch, seq, features)`; `targets` is whatever the
/// network's loss expects (substructure indicator vectors for `MhaNet`).
#[derive(Debug, Clone)]
pub struct SpectrumBatch {
    pub inputs: Tensor,
    pub targets: Tensor,
}

impl SpectrumBatch {
    pub fn new(inputs: Tensor, targets: Tensor) -> Self {
        Self { inputs, targets }
    }

    pub fn batch_size(&self) -> Result<usize> {
        self.inputs.dim(0)
    }
}

/// Trainable network driven by the training loops.
pub trait Network {
    /// Predictions for the batch, in the layout the loss function consumes.
    fn forward(&self, batch: &SpectrumBatch) -> Result<Tensor>;

    /// Targets aligned with [`Network::forward`], cast to the network dtype
    /// and moved to its device.
    fn loss_targets(&self, batch: &SpectrumBatch) -> Result<Tensor> {
        batch
            .targets
            .to_device(self.device())?
            .to_dtype(self.dtype())
    }

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Parameters sorted by name. Names are stable across constructions with
    /// the same configuration.
    fn named_parameters(&self) -> Vec<(String, Var)>;

    fn dtype(&self) -> DType;

    fn device(&self) -> &Device;
}
