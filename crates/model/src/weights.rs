//! Construction of the model from named checkpoint tensors.
//!
//! The checkpoint loader hands over a flat name → tensor map (typically
//! read from a safetensors file); every parameter is resolved by dotted
//! path, shape-checked by the layer constructors, and the map must be
//! fully consumed: a leftover name means the checkpoint and the
//! configuration disagree.
//!
//! Parameter naming:
//!
//! - `encoder.prompt.weight`, `encoder.response.weight`
//! - `r_w_bias`, `r_r_bias` (tied mode), or
//!   `layers.{i}.attn.r_w_bias`, `layers.{i}.attn.r_r_bias` (untied)
//! - `layers.{i}.attn.{qkv_net,r_net,o_net}.weight`
//! - `layers.{i}.attn.layer_norm.{weight,bias}`
//! - `layers.{i}.ff.{inner,outer}.{weight,bias}`
//! - `layers.{i}.ff.layer_norm.{weight,bias}`
//! - `head.transform.{weight,bias}`, `head.layer_norm.{weight,bias}`,
//!   `head.decoder.weight`

use std::collections::HashMap;

use attention::{RelAttentionConfig, RelativeMultiHeadAttention};
use candle_core::Tensor;
use embedding::{TokenEmbedding, TokenEmbeddingConfig};
use layers::{
    linear::{Linear, LinearConfig, LinearInit},
    norm::{LayerNorm, NormConfig},
    PositionwiseFeedForward, PositionwiseFeedForwardConfig,
};

use crate::{
    block::DecoderLayer,
    config::{BiasSharing, EngineConfig},
    engine::{SegmentEncoder, SequenceEngine},
    error::ModelError,
    head::{PredictionHead, PredictionHeadConfig},
    model::TraceModel,
};

/// Flat checkpoint map with take-and-drain semantics.
#[derive(Debug)]
pub struct TensorMap {
    tensors: HashMap<String, Tensor>,
}

impl TensorMap {
    /// Wraps a loaded checkpoint.
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// Removes and returns the named tensor; absence is fatal.
    pub fn take(&mut self, name: &str) -> Result<Tensor, ModelError> {
        self.tensors
            .remove(name)
            .ok_or_else(|| ModelError::Checkpoint(format!("missing tensor '{name}'")))
    }

    /// Fails if any tensor was left unconsumed.
    pub fn finish(self) -> Result<(), ModelError> {
        if self.tensors.is_empty() {
            Ok(())
        } else {
            let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
            names.sort_unstable();
            Err(ModelError::Checkpoint(format!(
                "unconsumed tensors: {}",
                names.join(", ")
            )))
        }
    }
}

fn attn_config(config: &EngineConfig) -> RelAttentionConfig {
    RelAttentionConfig {
        n_head: config.n_head,
        d_model: config.d_model,
        d_head: config.d_head,
        dropout: config.dropout,
        dropatt: config.dropatt,
        pre_norm: config.pre_norm,
        layer_norm_epsilon: config.layer_norm_epsilon,
    }
}

fn ff_config(config: &EngineConfig) -> PositionwiseFeedForwardConfig {
    PositionwiseFeedForwardConfig {
        d_model: config.d_model,
        d_inner: config.d_inner,
        dropout: config.dropout,
        pre_norm: config.pre_norm,
        layer_norm_epsilon: config.layer_norm_epsilon,
    }
}

fn biased(mut config: LinearConfig) -> LinearConfig {
    config.bias = true;
    config
}

fn layer_from_tensors(
    config: &EngineConfig,
    index: usize,
    map: &mut TensorMap,
    shared_biases: Option<&(Tensor, Tensor)>,
) -> Result<DecoderLayer, ModelError> {
    let inner = config.n_head * config.d_head;
    let prefix = format!("layers.{index}");

    let mut qkv_cfg = LinearConfig::new(config.d_model, inner);
    qkv_cfg.fused_projections = 3;
    let qkv_net = Linear::new(qkv_cfg, map.take(&format!("{prefix}.attn.qkv_net.weight"))?, None)?;
    let r_net = Linear::new(
        LinearConfig::new(config.d_model, inner),
        map.take(&format!("{prefix}.attn.r_net.weight"))?,
        None,
    )?;
    let o_net = Linear::new(
        LinearConfig::new(inner, config.d_model),
        map.take(&format!("{prefix}.attn.o_net.weight"))?,
        None,
    )?;
    let attn_norm = LayerNorm::new(
        NormConfig::new(config.d_model, config.layer_norm_epsilon),
        map.take(&format!("{prefix}.attn.layer_norm.weight"))?,
        map.take(&format!("{prefix}.attn.layer_norm.bias"))?,
    )?;
    let (r_w_bias, r_r_bias) = match shared_biases {
        Some((r_w, r_r)) => (r_w.clone(), r_r.clone()),
        None => (
            map.take(&format!("{prefix}.attn.r_w_bias"))?,
            map.take(&format!("{prefix}.attn.r_r_bias"))?,
        ),
    };
    let attn = RelativeMultiHeadAttention::new(
        attn_config(config),
        qkv_net,
        r_net,
        o_net,
        attn_norm,
        r_w_bias,
        r_r_bias,
    )?;

    let ff_inner = Linear::new(
        biased(LinearConfig::new(config.d_model, config.d_inner)),
        map.take(&format!("{prefix}.ff.inner.weight"))?,
        Some(map.take(&format!("{prefix}.ff.inner.bias"))?),
    )?;
    let ff_outer = Linear::new(
        biased(LinearConfig::new(config.d_inner, config.d_model)),
        map.take(&format!("{prefix}.ff.outer.weight"))?,
        Some(map.take(&format!("{prefix}.ff.outer.bias"))?),
    )?;
    let ff_norm = LayerNorm::new(
        NormConfig::new(config.d_model, config.layer_norm_epsilon),
        map.take(&format!("{prefix}.ff.layer_norm.weight"))?,
        map.take(&format!("{prefix}.ff.layer_norm.bias"))?,
    )?;
    let ff = PositionwiseFeedForward::new(ff_config(config), ff_inner, ff_outer, ff_norm)?;

    DecoderLayer::new(attn, ff)
}

impl SequenceEngine {
    /// Builds a trace-encoder engine with freshly initialised parameters
    /// (zero biases, `N(0, 0.02)` weights). Used by tests and smoke runs;
    /// checkpoints go through [`SequenceEngine::from_tensors`].
    pub fn with_init(config: EngineConfig) -> Result<Self, ModelError> {
        config.validate()?;
        let init = LinearInit::Normal { std: 0.02 };
        let device = config.device.clone();
        let dtype = config.dtype;

        let prompt = TokenEmbedding::with_init(
            TokenEmbeddingConfig {
                vocab_size: config.prompt_vocab_rows(),
                d_embed: config.d_embed,
            },
            0.02,
            &device,
            dtype,
        )?;
        let response = TokenEmbedding::with_init(
            TokenEmbeddingConfig {
                vocab_size: config.response_vocab_rows(),
                d_embed: config.d_embed,
            },
            0.02,
            &device,
            dtype,
        )?;

        let shared = match config.bias_sharing {
            BiasSharing::Tied => Some((
                Tensor::zeros((config.n_head, config.d_head), dtype, &device)?,
                Tensor::zeros((config.n_head, config.d_head), dtype, &device)?,
            )),
            BiasSharing::Untied => None,
        };

        let mut layers = Vec::with_capacity(config.n_layer);
        for _ in 0..config.n_layer {
            let (r_w_bias, r_r_bias) = match &shared {
                Some((r_w, r_r)) => (r_w.clone(), r_r.clone()),
                None => (
                    Tensor::zeros((config.n_head, config.d_head), dtype, &device)?,
                    Tensor::zeros((config.n_head, config.d_head), dtype, &device)?,
                ),
            };
            let mut qkv_cfg = LinearConfig::new(config.d_model, config.n_head * config.d_head);
            qkv_cfg.fused_projections = 3;
            let attn = RelativeMultiHeadAttention::new(
                attn_config(&config),
                Linear::with_init(qkv_cfg, &init, &device, dtype)?,
                Linear::with_init(
                    LinearConfig::new(config.d_model, config.n_head * config.d_head),
                    &init,
                    &device,
                    dtype,
                )?,
                Linear::with_init(
                    LinearConfig::new(config.n_head * config.d_head, config.d_model),
                    &init,
                    &device,
                    dtype,
                )?,
                LayerNorm::identity(
                    NormConfig::new(config.d_model, config.layer_norm_epsilon),
                    &device,
                    dtype,
                )?,
                r_w_bias,
                r_r_bias,
            )?;
            let ff = PositionwiseFeedForward::with_init(ff_config(&config), &init, &device, dtype)?;
            layers.push(DecoderLayer::new(attn, ff)?);
        }

        let encoder = SegmentEncoder::Trace { prompt, response };
        SequenceEngine::new(config, encoder, layers)
    }

    /// Builds a trace-encoder engine from a checkpoint map. Consumes the
    /// engine's share of the map, leaving head tensors in place.
    pub fn from_tensors(config: EngineConfig, map: &mut TensorMap) -> Result<Self, ModelError> {
        config.validate()?;

        let prompt = TokenEmbedding::new(
            TokenEmbeddingConfig {
                vocab_size: config.prompt_vocab_rows(),
                d_embed: config.d_embed,
            },
            map.take("encoder.prompt.weight")?,
        )?;
        let response = TokenEmbedding::new(
            TokenEmbeddingConfig {
                vocab_size: config.response_vocab_rows(),
                d_embed: config.d_embed,
            },
            map.take("encoder.response.weight")?,
        )?;

        let shared = match config.bias_sharing {
            BiasSharing::Tied => Some((map.take("r_w_bias")?, map.take("r_r_bias")?)),
            BiasSharing::Untied => None,
        };

        let mut layers = Vec::with_capacity(config.n_layer);
        for index in 0..config.n_layer {
            layers.push(layer_from_tensors(&config, index, map, shared.as_ref())?);
        }

        let encoder = SegmentEncoder::Trace { prompt, response };
        SequenceEngine::new(config, encoder, layers)
    }
}

impl PredictionHead {
    /// Builds the head from a checkpoint map.
    pub fn from_tensors(config: &EngineConfig, map: &mut TensorMap) -> Result<Self, ModelError> {
        let head_config = PredictionHeadConfig {
            d_model: config.d_model,
            response_vocab: config.response_vocab_rows(),
            layer_norm_epsilon: config.layer_norm_epsilon,
        };
        let transform = Linear::new(
            biased(LinearConfig::new(config.d_model, config.d_model)),
            map.take("head.transform.weight")?,
            Some(map.take("head.transform.bias")?),
        )?;
        let layer_norm = LayerNorm::new(
            NormConfig::new(config.d_model, config.layer_norm_epsilon),
            map.take("head.layer_norm.weight")?,
            map.take("head.layer_norm.bias")?,
        )?;
        let decoder = Linear::new(
            LinearConfig::new(config.d_model, config.response_vocab_rows()),
            map.take("head.decoder.weight")?,
            None,
        )?;
        PredictionHead::new(head_config, transform, layer_norm, decoder)
    }
}

impl TraceModel {
    /// Builds engine and head with freshly initialised parameters.
    pub fn with_init(config: EngineConfig) -> Result<Self, ModelError> {
        let head = PredictionHead::with_init(
            PredictionHeadConfig {
                d_model: config.d_model,
                response_vocab: config.response_vocab_rows(),
                layer_norm_epsilon: config.layer_norm_epsilon,
            },
            &LinearInit::Normal { std: 0.02 },
            &config.device,
            config.dtype,
        )?;
        let engine = SequenceEngine::with_init(config)?;
        TraceModel::new(engine, head)
    }

    /// Builds the full model from a loaded checkpoint; the map must be
    /// consumed exactly.
    pub fn from_tensors(
        config: EngineConfig,
        tensors: HashMap<String, Tensor>,
    ) -> Result<Self, ModelError> {
        let mut map = TensorMap::new(tensors);
        let head = PredictionHead::from_tensors(&config, &mut map)?;
        let engine = SequenceEngine::from_tensors(config, &mut map)?;
        map.finish()?;
        TraceModel::new(engine, head)
    }
}

/// Convenience constructor for zero-initialised checkpoints of the right
/// geometry; used by round-trip tests.
pub fn zeroed_checkpoint(config: &EngineConfig) -> Result<HashMap<String, Tensor>, ModelError> {
    let device = &config.device;
    let dtype = config.dtype;
    let inner = config.n_head * config.d_head;
    let mut map = HashMap::new();

    let mut insert = |name: String, dims: Vec<usize>| -> Result<(), ModelError> {
        map.insert(name, Tensor::zeros(dims.as_slice(), dtype, device)?);
        Ok(())
    };

    insert(
        "encoder.prompt.weight".into(),
        vec![config.prompt_vocab_rows(), config.d_embed],
    )?;
    insert(
        "encoder.response.weight".into(),
        vec![config.response_vocab_rows(), config.d_embed],
    )?;
    if config.bias_sharing == BiasSharing::Tied {
        insert("r_w_bias".into(), vec![config.n_head, config.d_head])?;
        insert("r_r_bias".into(), vec![config.n_head, config.d_head])?;
    }
    for index in 0..config.n_layer {
        let prefix = format!("layers.{index}");
        insert(
            format!("{prefix}.attn.qkv_net.weight"),
            vec![3 * inner, config.d_model],
        )?;
        insert(format!("{prefix}.attn.r_net.weight"), vec![inner, config.d_model])?;
        insert(format!("{prefix}.attn.o_net.weight"), vec![config.d_model, inner])?;
        insert(format!("{prefix}.attn.layer_norm.weight"), vec![config.d_model])?;
        insert(format!("{prefix}.attn.layer_norm.bias"), vec![config.d_model])?;
        if config.bias_sharing == BiasSharing::Untied {
            insert(format!("{prefix}.attn.r_w_bias"), vec![config.n_head, config.d_head])?;
            insert(format!("{prefix}.attn.r_r_bias"), vec![config.n_head, config.d_head])?;
        }
        insert(format!("{prefix}.ff.inner.weight"), vec![config.d_inner, config.d_model])?;
        insert(format!("{prefix}.ff.inner.bias"), vec![config.d_inner])?;
        insert(format!("{prefix}.ff.outer.weight"), vec![config.d_model, config.d_inner])?;
        insert(format!("{prefix}.ff.outer.bias"), vec![config.d_model])?;
        insert(format!("{prefix}.ff.layer_norm.weight"), vec![config.d_model])?;
        insert(format!("{prefix}.ff.layer_norm.bias"), vec![config.d_model])?;
    }
    insert("head.transform.weight".into(), vec![config.d_model, config.d_model])?;
    insert("head.transform.bias".into(), vec![config.d_model])?;
    insert("head.layer_norm.weight".into(), vec![config.d_model])?;
    insert("head.layer_norm.bias".into(), vec![config.d_model])?;
    insert(
        "head.decoder.weight".into(),
        vec![config.response_vocab_rows(), config.d_model],
    )?;

    Ok(map)
}
