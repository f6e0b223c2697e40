//! Projection from final hidden states to response-class logits.

use candle_core::{DType, Device, Tensor, D};
use layers::{
    checks,
    linear::{Linear, LinearConfig, LinearInit},
    norm::{LayerNorm, NormConfig},
};

use crate::error::ModelError;

/// Static shape of the head.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionHeadConfig {
    pub d_model: usize,
    /// Response-class vocabulary, including reserved rows.
    pub response_vocab: usize,
    pub layer_norm_epsilon: f64,
}

/// Linear → GELU → layer norm → unbiased decoder projection.
#[derive(Debug, Clone)]
pub struct PredictionHead {
    config: PredictionHeadConfig,
    transform: Linear,
    layer_norm: LayerNorm,
    decoder: Linear,
}

impl PredictionHead {
    /// Assembles the head from checkpoint parameters.
    pub fn new(
        config: PredictionHeadConfig,
        transform: Linear,
        layer_norm: LayerNorm,
        decoder: Linear,
    ) -> Result<Self, ModelError> {
        checks::expect_shape(
            "head.transform.weight",
            &transform.weight(),
            &[config.d_model, config.d_model],
        )?;
        checks::expect_shape(
            "head.decoder.weight",
            &decoder.weight(),
            &[config.response_vocab, config.d_model],
        )?;
        Ok(Self {
            config,
            transform,
            layer_norm,
            decoder,
        })
    }

    /// Builds the head with freshly initialised parameters.
    pub fn with_init(
        config: PredictionHeadConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, ModelError> {
        let mut transform_cfg = LinearConfig::new(config.d_model, config.d_model);
        transform_cfg.bias = true;
        let transform = Linear::with_init(transform_cfg, init, device, dtype)?;

        let decoder_cfg = LinearConfig::new(config.d_model, config.response_vocab);
        let decoder = Linear::with_init(decoder_cfg, init, device, dtype)?;

        let layer_norm = LayerNorm::identity(
            NormConfig::new(config.d_model, config.layer_norm_epsilon),
            device,
            dtype,
        )?;
        Self::new(config, transform, layer_norm, decoder)
    }

    /// Returns the head configuration.
    pub fn config(&self) -> &PredictionHeadConfig {
        &self.config
    }

    /// Projects `(qlen, batch, d_model)` hidden states to
    /// `(qlen, batch, response_vocab)` logits.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor, ModelError> {
        checks::expect_seq_batch_hidden("head.input", hidden, self.config.d_model)?;
        let transformed = self.transform.forward(hidden)?.gelu_erf()?;
        let normed = self.layer_norm.forward(&transformed)?;
        Ok(self.decoder.forward(&normed)?)
    }

    /// Argmax over the response vocabulary: `(qlen, batch)` class ids.
    pub fn predict_classes(&self, logits: &Tensor) -> Result<Tensor, ModelError> {
        checks::expect_last_dim("head.logits", logits, self.config.response_vocab)?;
        Ok(logits.argmax(D::Minus1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head() -> PredictionHead {
        let config = PredictionHeadConfig {
            d_model: 8,
            response_vocab: 4,
            layer_norm_epsilon: 1e-5,
        };
        PredictionHead::with_init(
            config,
            &LinearInit::Normal { std: 0.05 },
            &Device::Cpu,
            DType::F32,
        )
        .unwrap()
    }

    #[test]
    fn logits_cover_the_response_vocabulary() -> anyhow::Result<()> {
        let head = head();
        let hidden = Tensor::randn(0f32, 1.0, (5, 2, 8), &Device::Cpu)?;
        let logits = head.forward(&hidden)?;
        assert_eq!(logits.dims(), &[5, 2, 4]);

        let classes = head.predict_classes(&logits)?;
        assert_eq!(classes.dims(), &[5, 2]);
        let values = classes.flatten_all()?.to_vec1::<u32>()?;
        assert!(values.iter().all(|&c| c < 4));
        Ok(())
    }

    #[test]
    fn wrong_hidden_width_is_rejected() {
        let head = head();
        let hidden = Tensor::zeros((5, 2, 6), DType::F32, &Device::Cpu).unwrap();
        assert!(head.forward(&hidden).is_err());
    }
}
