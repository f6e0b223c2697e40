//! Layer normalisation over the trailing hidden axis.
//!
//! Statistics are computed in f32 regardless of the storage dtype and the
//! result is cast back, mirroring the reduction behaviour of the attention
//! kernels. The layout is preserved; only the last axis is normalised.

use candle_core::{DType, Device, Error, Result, Tensor, D};

use crate::checks;

/// Configuration shared by all normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    /// Creates a configuration with the given epsilon.
    pub fn new(hidden_size: usize, epsilon: f64) -> Self {
        Self {
            hidden_size,
            epsilon,
        }
    }
}

/// LayerNorm with learnable scale and shift.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    /// Constructs the layer from checkpoint parameters.
    pub fn new(config: NormConfig, weight: Tensor, bias: Tensor) -> Result<Self> {
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_shape("norm.bias", &bias, &[config.hidden_size])?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds an identity-initialised layer (unit scale, zero shift).
    pub fn identity(config: NormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        let bias = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(config, weight, bias)
    }

    /// Returns the configuration so callers can check compatibility.
    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    /// Normalises the trailing axis of `hidden`.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;
        if hidden.dims().len() < 2 {
            return Err(Error::Msg(format!(
                "norm.input: expected at least rank 2, got shape {:?}",
                hidden.dims()
            )));
        }

        let storage = hidden.dtype();
        let hidden_size = self.config.hidden_size as f64;
        let compute = hidden.to_dtype(DType::F32)?;

        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalized = centered.broadcast_div(&denom)?;

        let weight = self.weight.to_dtype(DType::F32)?;
        let bias = self.bias.to_dtype(DType::F32)?;
        let scaled = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;
        scaled.to_dtype(storage)
    }
}
