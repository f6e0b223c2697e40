//! The relative multi-head attention cell.
//!
//! One cell owns the fused query/key/value projection, the position-key
//! projection, the output projection, and a layer norm. Cached hidden
//! states from earlier segments are concatenated ahead of the current
//! segment before projection; queries are taken from the trailing `qlen`
//! rows only, so memory contributes keys and values but never queries.

use candle_core::{DType, Device, Tensor};
use candle_nn::ops::softmax_last_dim;
use layers::{
    checks,
    dropout::Dropout,
    linear::{Linear, LinearConfig, LinearInit},
    norm::{LayerNorm, NormConfig},
};

use crate::{
    error::AttentionError,
    masks::apply_mask,
    shift::rel_shift,
};

type Result<T> = std::result::Result<T, AttentionError>;

/// Static configuration of one attention cell.
#[derive(Debug, Clone, PartialEq)]
pub struct RelAttentionConfig {
    pub n_head: usize,
    pub d_model: usize,
    pub d_head: usize,
    /// Dropout on the projected output during training.
    pub dropout: Option<f32>,
    /// Dropout on the attention probabilities during training.
    pub dropatt: Option<f32>,
    /// Normalise before the projections instead of after the residual.
    pub pre_norm: bool,
    pub layer_norm_epsilon: f64,
}

impl RelAttentionConfig {
    /// Validates the head geometry.
    pub fn validate(&self) -> Result<()> {
        if self.n_head == 0 || self.d_head == 0 || self.d_model == 0 {
            return Err(AttentionError::Config(format!(
                "n_head ({}), d_head ({}), and d_model ({}) must all be non-zero",
                self.n_head, self.d_head, self.d_model
            )));
        }
        Ok(())
    }
}

/// Per-call collaborators of the cell.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttentionInput<'a> {
    /// Relative position encodings, `(klen, d_model)`.
    pub pos_encoding: Option<&'a Tensor>,
    /// Numeric `(qlen, klen)` mask; `None` leaves every key visible.
    pub attn_mask: Option<&'a Tensor>,
    /// Cached hidden states, `(mlen, batch, d_model)`. A zero-length
    /// buffer counts as no memory.
    pub memory: Option<&'a Tensor>,
    /// Per-head multiplier `(n_head,)`; zero entries silence whole heads.
    pub head_mask: Option<&'a Tensor>,
}

/// Result of one attention pass.
#[derive(Debug)]
pub struct AttentionOutput {
    /// Updated hidden states, same shape as the query segment.
    pub hidden: Tensor,
    /// Attention probabilities `(batch, n_head, qlen, klen)` when requested.
    pub attn_probs: Option<Tensor>,
}

/// Multi-head attention with learned content and position biases.
#[derive(Debug, Clone)]
pub struct RelativeMultiHeadAttention {
    config: RelAttentionConfig,
    qkv_net: Linear,
    r_net: Linear,
    o_net: Linear,
    layer_norm: LayerNorm,
    r_w_bias: Tensor,
    r_r_bias: Tensor,
    drop: Dropout,
    dropatt: Dropout,
    scale: f64,
}

impl RelativeMultiHeadAttention {
    /// Assembles the cell from checkpoint parameters. The two bias tensors
    /// are `(n_head, d_head)`; in tied mode the caller passes clones of the
    /// stack-level tensors so every layer shares the same storage.
    pub fn new(
        config: RelAttentionConfig,
        qkv_net: Linear,
        r_net: Linear,
        o_net: Linear,
        layer_norm: LayerNorm,
        r_w_bias: Tensor,
        r_r_bias: Tensor,
    ) -> Result<Self> {
        config.validate()?;
        let inner = config.n_head * config.d_head;
        checks::expect_shape(
            "rel_attn.qkv_net.weight",
            &qkv_net.weight(),
            &[3 * inner, config.d_model],
        )?;
        checks::expect_shape("rel_attn.r_net.weight", &r_net.weight(), &[inner, config.d_model])?;
        checks::expect_shape("rel_attn.o_net.weight", &o_net.weight(), &[config.d_model, inner])?;
        checks::expect_shape(
            "rel_attn.r_w_bias",
            &r_w_bias,
            &[config.n_head, config.d_head],
        )?;
        checks::expect_shape(
            "rel_attn.r_r_bias",
            &r_r_bias,
            &[config.n_head, config.d_head],
        )?;

        let drop = Dropout::new(config.dropout)?;
        let dropatt = Dropout::new(config.dropatt)?;
        let scale = 1.0 / (config.d_head as f64).sqrt();
        log::debug!(
            "rel_attn init n_head={} d_head={} d_model={} pre_norm={}",
            config.n_head,
            config.d_head,
            config.d_model,
            config.pre_norm
        );
        Ok(Self {
            config,
            qkv_net,
            r_net,
            o_net,
            layer_norm,
            r_w_bias,
            r_r_bias,
            drop,
            dropatt,
            scale,
        })
    }

    /// Builds a cell with freshly initialised projections and zero biases.
    pub fn with_init(
        config: RelAttentionConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let inner = config.n_head * config.d_head;

        let mut qkv_cfg = LinearConfig::new(config.d_model, inner);
        qkv_cfg.fused_projections = 3;
        let qkv_net = Linear::with_init(qkv_cfg, init, device, dtype)?;
        let r_net = Linear::with_init(LinearConfig::new(config.d_model, inner), init, device, dtype)?;
        let o_net = Linear::with_init(LinearConfig::new(inner, config.d_model), init, device, dtype)?;
        let layer_norm = LayerNorm::identity(
            NormConfig::new(config.d_model, config.layer_norm_epsilon),
            device,
            dtype,
        )?;
        let r_w_bias = Tensor::zeros((config.n_head, config.d_head), dtype, device)?;
        let r_r_bias = Tensor::zeros((config.n_head, config.d_head), dtype, device)?;
        Self::new(config, qkv_net, r_net, o_net, layer_norm, r_w_bias, r_r_bias)
    }

    /// Returns the cell configuration.
    pub fn config(&self) -> &RelAttentionConfig {
        &self.config
    }

    fn split_heads(&self, tensor: &Tensor, len: usize, batch: usize) -> Result<Tensor> {
        let heads = tensor
            .contiguous()?
            .reshape((len, batch, self.config.n_head, self.config.d_head))?
            .permute((1, 2, 0, 3))?
            .contiguous()?;
        Ok(heads)
    }

    /// Attention over the current segment plus cached memory.
    ///
    /// `w` is `(qlen, batch, d_model)`; the output hidden state matches it.
    pub fn forward(
        &self,
        w: &Tensor,
        input: AttentionInput<'_>,
        output_attentions: bool,
        train: bool,
    ) -> Result<AttentionOutput> {
        let (qlen, batch, d_model) = w
            .dims3()
            .map_err(|_| AttentionError::shape("rel_attn input must be (seq, batch, d_model)"))?;
        if d_model != self.config.d_model {
            return Err(AttentionError::shape(format!(
                "rel_attn input hidden dim {d_model} does not match configured d_model {}",
                self.config.d_model
            )));
        }

        let memory = match input.memory {
            Some(mem) if mem.dims().first().copied().unwrap_or(0) > 0 => {
                let (_, mem_batch, mem_dim) = mem.dims3().map_err(|_| {
                    AttentionError::shape("memory must be (mlen, batch, d_model)")
                })?;
                if mem_batch != batch || mem_dim != d_model {
                    return Err(AttentionError::shape(format!(
                        "memory shape {:?} does not align with segment ({qlen}, {batch}, {d_model})",
                        mem.dims()
                    )));
                }
                Some(mem)
            }
            _ => None,
        };

        let cat = match memory {
            Some(mem) => Tensor::cat(&[&mem.to_dtype(w.dtype())?, w], 0)?,
            None => w.clone(),
        };
        let klen = cat.dims()[0];

        let pos_encoding = input.pos_encoding.ok_or_else(|| {
            AttentionError::Config("relative attention requires position encodings".into())
        })?;
        let rlen = pos_encoding.dims()[0];
        if rlen != klen {
            return Err(AttentionError::shape(format!(
                "position encoding length {rlen} must equal key length {klen}"
            )));
        }

        let projected = if self.config.pre_norm {
            self.qkv_net.forward(&self.layer_norm.forward(&cat)?)?
        } else {
            self.qkv_net.forward(&cat)?
        };
        let r_head_k = self.r_net.forward(pos_encoding)?;

        let inner = self.config.n_head * self.config.d_head;
        let w_head_q = projected.narrow(2, 0, inner)?.narrow(0, klen - qlen, qlen)?;
        let w_head_k = projected.narrow(2, inner, inner)?;
        let w_head_v = projected.narrow(2, 2 * inner, inner)?;

        let q = self.split_heads(&w_head_q, qlen, batch)?;
        let k = self.split_heads(&w_head_k, klen, batch)?;
        let v = self.split_heads(&w_head_v, klen, batch)?;

        // Position keys carry no batch axis; broadcast over it.
        let r_k = r_head_k
            .reshape((klen, self.config.n_head, self.config.d_head))?
            .permute((1, 0, 2))?
            .contiguous()?
            .reshape((1, self.config.n_head, klen, self.config.d_head))?;

        let r_w_bias = self
            .r_w_bias
            .reshape((1, self.config.n_head, 1, self.config.d_head))?;
        let r_r_bias = self
            .r_r_bias
            .reshape((1, self.config.n_head, 1, self.config.d_head))?;

        // Content-content term: (query + content bias) . key
        let rw_q = q.broadcast_add(&r_w_bias)?;
        let content_scores = rw_q.matmul(&k.transpose(2, 3)?.contiguous()?)?;

        // Content-position term: (query + position bias) . position key,
        // realigned from absolute columns to relative offsets.
        let rr_q = q.broadcast_add(&r_r_bias)?;
        let position_scores = rr_q.broadcast_matmul(&r_k.transpose(2, 3)?.contiguous()?)?;
        let position_scores = rel_shift(&position_scores)?;

        let mut scores = content_scores
            .add(&position_scores)?
            .affine(self.scale, 0.0)?;

        if let Some(mask) = input.attn_mask {
            let mask_dims = mask.dims();
            if mask_dims != [qlen, klen] {
                return Err(AttentionError::shape(format!(
                    "attention mask shape {:?} must be [{qlen}, {klen}]",
                    mask_dims
                )));
            }
            scores = apply_mask(&scores, mask)?;
        }

        let mut probs = softmax_last_dim(&scores.contiguous()?)?;
        probs = self.dropatt.forward(&probs, train)?;

        if let Some(head_mask) = input.head_mask {
            checks::expect_shape("rel_attn.head_mask", head_mask, &[self.config.n_head])?;
            let head_mask = head_mask
                .to_dtype(probs.dtype())?
                .reshape((1, self.config.n_head, 1, 1))?;
            probs = probs.broadcast_mul(&head_mask)?;
        }

        let attn_vec = probs
            .contiguous()?
            .matmul(&v)?
            .permute((2, 0, 1, 3))?
            .contiguous()?
            .reshape((qlen, batch, inner))?;

        let attn_out = self.o_net.forward(&attn_vec)?;
        let attn_out = self.drop.forward(&attn_out, train)?;

        let hidden = if self.config.pre_norm {
            w.add(&attn_out)?
        } else {
            self.layer_norm.forward(&w.add(&attn_out)?)?
        };

        Ok(AttentionOutput {
            hidden,
            attn_probs: output_attentions.then_some(probs),
        })
    }
}
