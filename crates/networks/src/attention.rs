use candle_core::{DType, Result, Tensor, D};
use candle_nn::{linear, ops::softmax_last_dim, Dropout, Linear, Module, VarBuilder};

/// Additive score applied to padded keys. Finite so that a fully padded row
/// degrades to a uniform distribution instead of NaN.
const MASKED_SCORE: f64 = -1e9;

/// Batch-first multi-head self/cross attention with an optional key padding
/// mask.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    dropout: Dropout,
    n_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(d_model: usize, n_heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        assert!(
            n_heads > 0 && d_model % n_heads == 0,
            "d_model ({d_model}) must be divisible by n_heads ({n_heads})"
        );
        Ok(Self {
            q_proj: linear(d_model, d_model, vb.pp("q_proj"))?,
            k_proj: linear(d_model, d_model, vb.pp("k_proj"))?,
            v_proj: linear(d_model, d_model, vb.pp("v_proj"))?,
            out_proj: linear(d_model, d_model, vb.pp("out_proj"))?,
            dropout: Dropout::new(dropout),
            n_heads,
            head_dim: d_model / n_heads,
        })
    }

    /// Attends `query` over `key`/`value`, all shaped `(batch, seq, d_model)`.
    ///
    /// `key_padding_mask` is `(batch, k_len)` with `1.0` at padded keys.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, q_len, d_model) = query.dims3()?;
        let k_len = key.dim(1)?;

        let q = self.split_heads(&self.q_proj.forward(query)?, batch, q_len)?;
        let k = self.split_heads(&self.k_proj.forward(key)?, batch, k_len)?;
        let v = self.split_heads(&self.v_proj.forward(value)?, batch, k_len)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let k_t = k.t()?.contiguous()?;
        let mut scores = q.matmul(&k_t)?.affine(scale, 0.0)?;

        if let Some(mask) = key_padding_mask {
            let bias = mask
                .to_dtype(scores.dtype())?
                .affine(MASKED_SCORE, 0.0)?
                .reshape((batch, 1, 1, k_len))?;
            scores = scores.broadcast_add(&bias)?;
        }

        let weights = softmax_last_dim(&scores)?;
        let weights = self.dropout.forward(&weights, train)?;
        let attended = weights.matmul(&v)?;
        let merged = attended
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, q_len, d_model))?;
        self.out_proj.forward(&merged)
    }

    fn split_heads(&self, projected: &Tensor, batch: usize, seq: usize) -> Result<Tensor> {
        projected
            .reshape((batch, seq, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

/// Marks peaks whose every feature equals `pad_token`.
///
/// Returns `(batch, seq)` in `F32` with `1.0` at padded positions.
pub fn key_padding_mask(src: &Tensor, pad_token: f32) -> Result<Tensor> {
    src.eq(pad_token as f64)?
        .to_dtype(DType::F32)?
        .min(D::Minus1)
}
