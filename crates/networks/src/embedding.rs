//! Input embeddings for continuous spectral peaks.
//!
//! A spectrum arrives as `(batch, seq, features)` with one row per peak.
//! [`ContinuousEmbedding`] projects each peak independently into the model
//! width; [`PositionalEncoding`] then adds the fixed sinusoidal table so the
//! attention layer can tell peaks apart by position.

use candle_core::{DType, Device, Error, Result, Tensor};
use candle_nn::{linear, Dropout, Linear, Module, VarBuilder};

/// Projects per-peak feature vectors into `d_model` through one or more
/// linear heads whose outputs are concatenated.
#[derive(Debug, Clone)]
pub struct ContinuousEmbedding {
    heads: Vec<Linear>,
}

impl ContinuousEmbedding {
    pub fn new(input_features: usize, d_model: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || d_model % num_heads != 0 {
            return Err(Error::Msg(format!(
                "embedding width {d_model} must split evenly across {num_heads} head(s)"
            )));
        }
        let width = d_model / num_heads;
        let heads = (0..num_heads)
            .map(|idx| linear(input_features, width, vb.pp(format!("heads.{idx}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { heads })
    }

    pub fn forward(&self, peaks: &Tensor) -> Result<Tensor> {
        let outputs = self
            .heads
            .iter()
            .map(|head| head.forward(peaks))
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&outputs, candle_core::D::Minus1)
    }
}

/// Fixed sinusoidal position table added to embedded sequences.
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    table: Tensor,
    dropout: Dropout,
    max_len: usize,
}

impl PositionalEncoding {
    pub fn new(
        d_model: usize,
        max_len: usize,
        dropout: f32,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if d_model % 2 != 0 {
            return Err(Error::Msg(format!(
                "positional encoding requires an even width (got {d_model})"
            )));
        }
        let mut data = vec![0f32; max_len * d_model];
        let scale = -(10_000f64.ln()) / d_model as f64;
        for pos in 0..max_len {
            for pair in 0..d_model / 2 {
                let freq = ((2 * pair) as f64 * scale).exp();
                let angle = pos as f64 * freq;
                data[pos * d_model + 2 * pair] = angle.sin() as f32;
                data[pos * d_model + 2 * pair + 1] = angle.cos() as f32;
            }
        }
        let table = Tensor::from_vec(data, (1, max_len, d_model), device)?.to_dtype(dtype)?;
        Ok(Self {
            table,
            dropout: Dropout::new(dropout),
            max_len,
        })
    }

    pub fn forward(&self, embedded: &Tensor, train: bool) -> Result<Tensor> {
        let seq_len = embedded.dim(1)?;
        if seq_len > self.max_len {
            return Err(Error::Msg(format!(
                "sequence length {seq_len} exceeds positional table length {}",
                self.max_len
            )));
        }
        let positions = self.table.narrow(1, 0, seq_len)?;
        let encoded = embedded.broadcast_add(&positions)?;
        self.dropout.forward(&encoded, train)
    }
}
