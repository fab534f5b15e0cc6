use candle_core::{DType, Device, Error, Result};

/// Hyperparameters for [`crate::MhaNet`].
#[derive(Debug, Clone)]
pub struct MhaNetConfig {
    /// Embedding width shared by attention and the head input.
    pub d_model: usize,
    /// Number of output probabilities (substructure cardinality).
    pub d_out: usize,
    /// Width of the first feed-forward layer; later layers use twice this.
    pub d_feedforward: usize,
    pub n_heads: usize,
    /// Fixed spectrum length; inputs are expected to be padded to it.
    pub max_seq_len: usize,
    /// Feature count per peak (shift, intensity).
    pub input_features: usize,
    /// Value marking padded peaks in the source tensor.
    pub src_pad_token: f32,
    pub positional_encoding: bool,
    pub dropout: f32,
    pub dtype: DType,
    pub device: Device,
}

impl MhaNetConfig {
    pub fn new(d_model: usize, n_heads: usize, max_seq_len: usize, d_out: usize) -> Self {
        Self {
            d_model,
            d_out,
            d_feedforward: 1024,
            n_heads,
            max_seq_len,
            input_features: 2,
            src_pad_token: 0.0,
            positional_encoding: true,
            dropout: 0.1,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    pub fn validate(&self) -> Result<()> {
        assert!(
            self.n_heads > 0 && self.d_model % self.n_heads == 0,
            "d_model ({}) must be divisible by n_heads ({})",
            self.d_model,
            self.n_heads
        );
        if self.max_seq_len == 0 {
            return Err(Error::Msg("max_seq_len must be greater than zero".into()));
        }
        if self.d_out == 0 || self.d_feedforward == 0 || self.input_features == 0 {
            return Err(Error::Msg(
                "d_out, d_feedforward and input_features must be greater than zero".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Msg(format!(
                "dropout must be in [0, 1) (got {})",
                self.dropout
            )));
        }
        if self.d_model % 2 != 0 && self.positional_encoding {
            return Err(Error::Msg(
                "sinusoidal positional encoding requires an even d_model".into(),
            ));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }
}
