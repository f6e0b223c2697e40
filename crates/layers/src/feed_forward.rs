//! Position-wise feed-forward block.
//!
//! Two dense projections with a ReLU between them, applied independently at
//! every position, followed by a residual connection. Normalisation sits
//! either before the inner projections (pre-norm) or after the residual
//! addition (post-norm); the placement must match the convention the
//! checkpoint was trained with, so it is configuration, not policy.

use candle_core::{DType, Device, Result, Tensor};

use crate::{
    checks,
    dropout::Dropout,
    linear::{Linear, LinearConfig, LinearInit},
    norm::{LayerNorm, NormConfig},
};

/// Configuration for the feed-forward block.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionwiseFeedForwardConfig {
    /// Model hidden size.
    pub d_model: usize,
    /// Width of the inner activation space.
    pub d_inner: usize,
    /// Dropout applied after each projection during training.
    pub dropout: Option<f32>,
    /// Normalise before the projections instead of after the residual.
    pub pre_norm: bool,
    /// Layer-norm epsilon.
    pub layer_norm_epsilon: f64,
}

/// Per-position two-layer projection with residual connection.
#[derive(Debug, Clone)]
pub struct PositionwiseFeedForward {
    config: PositionwiseFeedForwardConfig,
    inner: Linear,
    outer: Linear,
    drop: Dropout,
    layer_norm: LayerNorm,
}

impl PositionwiseFeedForward {
    /// Assembles the block from checkpoint parameters.
    pub fn new(
        config: PositionwiseFeedForwardConfig,
        inner: Linear,
        outer: Linear,
        layer_norm: LayerNorm,
    ) -> Result<Self> {
        checks::expect_shape(
            "feed_forward.inner.weight",
            &inner.weight(),
            &[config.d_inner, config.d_model],
        )?;
        checks::expect_shape(
            "feed_forward.outer.weight",
            &outer.weight(),
            &[config.d_model, config.d_inner],
        )?;
        let drop = Dropout::new(config.dropout)?;
        Ok(Self {
            config,
            inner,
            outer,
            drop,
            layer_norm,
        })
    }

    /// Builds the block with freshly initialised parameters.
    pub fn with_init(
        config: PositionwiseFeedForwardConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let mut inner_cfg = LinearConfig::new(config.d_model, config.d_inner);
        inner_cfg.bias = true;
        let inner = Linear::with_init(inner_cfg, init, device, dtype)?;

        let mut outer_cfg = LinearConfig::new(config.d_inner, config.d_model);
        outer_cfg.bias = true;
        let outer = Linear::with_init(outer_cfg, init, device, dtype)?;

        let layer_norm = LayerNorm::identity(
            NormConfig::new(config.d_model, config.layer_norm_epsilon),
            device,
            dtype,
        )?;
        Self::new(config, inner, outer, layer_norm)
    }

    /// Returns the block configuration.
    pub fn config(&self) -> &PositionwiseFeedForwardConfig {
        &self.config
    }

    fn core(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.inner.forward(input)?.relu()?;
        let hidden = self.drop.forward(&hidden, train)?;
        let out = self.outer.forward(&hidden)?;
        self.drop.forward(&out, train)
    }

    /// Forward pass over `(seq, batch, d_model)` hidden states.
    pub fn forward(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_seq_batch_hidden("feed_forward.input", input, self.config.d_model)?;
        if self.config.pre_norm {
            let normed = self.layer_norm.forward(input)?;
            let core = self.core(&normed, train)?;
            core.add(input)
        } else {
            let core = self.core(input, train)?;
            self.layer_norm.forward(&core.add(input)?)
        }
    }
}
