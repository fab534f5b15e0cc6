use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{linear, ops::sigmoid, Linear, Module, VarBuilder, VarMap};

use crate::{
    attention::{key_padding_mask, MultiHeadAttention},
    config::MhaNetConfig,
    embedding::{ContinuousEmbedding, PositionalEncoding},
    Network, SpectrumBatch,
};

/// Feed-forward head that flattens the attended sequence and maps it to
/// independent per-class probabilities.
#[derive(Debug, Clone)]
pub struct FlattenHead {
    layers: Vec<Linear>,
}

impl FlattenHead {
    pub fn new(
        d_model: usize,
        d_out: usize,
        d_feedforward: usize,
        max_seq_len: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let d1 = d_feedforward;
        let d2 = d1 * 2;
        let layers = vec![
            linear(d_model * max_seq_len, d1, vb.pp("layers.0"))?,
            linear(d1, d2, vb.pp("layers.1"))?,
            linear(d2, d2, vb.pp("layers.2"))?,
            linear(d2, d_out, vb.pp("layers.3"))?,
        ];
        Ok(Self { layers })
    }

    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let mut x = hidden.flatten_from(1)?;
        let last = self.layers.len() - 1;
        for (idx, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if idx < last {
                x = x.relu()?;
            }
        }
        sigmoid(&x)
    }
}

/// Single-layer multi-head attention network over spectral peaks with a
/// flattening feed-forward head.
pub struct MhaNet {
    config: MhaNetConfig,
    varmap: VarMap,
    embedding: ContinuousEmbedding,
    positional: Option<PositionalEncoding>,
    attention: MultiHeadAttention,
    head: FlattenHead,
    training: bool,
}

impl MhaNet {
    pub const MODEL_ID: &'static str = "MHANet";

    pub fn new(config: MhaNetConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);

        let embedding =
            ContinuousEmbedding::new(config.input_features, config.d_model, 1, vb.pp("src_embed"))?;
        let positional = if config.positional_encoding {
            Some(PositionalEncoding::new(
                config.d_model,
                config.max_seq_len,
                config.dropout,
                config.dtype,
                &config.device,
            )?)
        } else {
            None
        };
        let attention =
            MultiHeadAttention::new(config.d_model, config.n_heads, config.dropout, vb.pp("mha"))?;
        let head = FlattenHead::new(
            config.d_model,
            config.d_out,
            config.d_feedforward,
            config.max_seq_len,
            vb.pp("ffnn"),
        )?;

        log::debug!(
            "built {} (d_model={} heads={} seq={} d_out={})",
            Self::MODEL_ID,
            config.d_model,
            config.n_heads,
            config.max_seq_len,
            config.d_out
        );

        Ok(Self {
            config,
            varmap,
            embedding,
            positional,
            attention,
            head,
            training: true,
        })
    }

    pub fn config(&self) -> &MhaNetConfig {
        &self.config
    }

    /// Substructure probabilities shaped `(batch, d_out)`.
    pub fn predict(&self, src: &Tensor) -> Result<Tensor> {
        let src = src.to_device(&self.config.device)?.to_dtype(self.config.dtype)?;
        let mask = key_padding_mask(&src, self.config.src_pad_token)?;

        let embedded = self.embedding.forward(&src)?;
        let embedded = match &self.positional {
            Some(positional) => positional.forward(&embedded, self.training)?,
            None => embedded,
        };

        let attended = self.attention.forward(
            &embedded,
            &embedded,
            &embedded,
            Some(&mask),
            self.training,
        )?;
        self.head.forward(&attended)
    }
}

impl Network for MhaNet {
    fn forward(&self, batch: &SpectrumBatch) -> Result<Tensor> {
        self.predict(&batch.inputs)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        let data = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    fn dtype(&self) -> DType {
        self.config.dtype
    }

    fn device(&self) -> &Device {
        &self.config.device
    }
}
