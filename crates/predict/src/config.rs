//! Pipeline configuration, loaded from JSON or TOML.
//!
//! The serialised form mirrors what the checkpoint was exported with; it
//! is resolved into an [`EngineConfig`] (CPU, f32) before construction.
//! Unsupported attention variants fail during parsing, before any tensor
//! is touched.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use candle_core::{DType, Device};
use model::{AttentionVariant, BiasSharing, EngineConfig, ModelError, TraceMode};
use serde::Deserialize;
use thiserror::Error;

/// Failure modes of the prediction pipeline.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {0}")]
    Validation(String),
    #[error("input data error: {0}")]
    Data(String),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

/// Serialised spelling of [`TraceMode`].
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeSetting {
    Concepts,
    Questions,
}

/// Serialised spelling of [`BiasSharing`].
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiasSetting {
    Tied,
    Untied,
}

/// Serialised spelling of [`AttentionVariant`]. The set is closed: any
/// other string is rejected by the deserialiser.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantSetting {
    Relative,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

/// Model hyper-parameters as exported next to the checkpoint.
#[derive(Debug, Deserialize)]
pub struct ModelSettings {
    pub concept_vocab_size: usize,
    pub question_vocab_size: usize,
    pub response_vocab_size: usize,
    pub mode: ModeSetting,
    pub d_model: usize,
    pub d_embed: usize,
    pub n_head: usize,
    pub d_head: usize,
    pub d_inner: usize,
    pub n_layer: usize,
    pub mem_len: usize,
    pub tgt_len: usize,
    #[serde(default)]
    pub dropout: Option<f32>,
    #[serde(default)]
    pub dropatt: Option<f32>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default)]
    pub pre_norm: bool,
    #[serde(default)]
    pub bias_sharing: Option<BiasSetting>,
    #[serde(default)]
    pub attn_variant: Option<VariantSetting>,
    #[serde(default)]
    pub same_length: bool,
    #[serde(default)]
    pub clamp_len: Option<usize>,
    pub mask_token: i64,
    pub eos_token: i64,
}

/// Top-level pipeline configuration.
#[derive(Debug, Deserialize)]
pub struct PredictConfig {
    pub model: ModelSettings,
    /// Path to the safetensors checkpoint.
    pub checkpoint: PathBuf,
    /// Directory predictions are written into; defaults to the input's
    /// parent directory.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl PredictConfig {
    /// Loads and validates a configuration file, dispatching on extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PredictError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: PredictConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|err| PredictError::ConfigFormat(err.to_string()))?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)
                .map_err(|err| PredictError::ConfigFormat(err.to_string()))?,
            Some(other) => {
                return Err(PredictError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.resolve_engine_config()?.validate()?;
        Ok(config)
    }

    /// Resolves the serialised settings into an engine configuration.
    pub fn resolve_engine_config(&self) -> Result<EngineConfig, PredictError> {
        let settings = &self.model;
        Ok(EngineConfig {
            concept_vocab_size: settings.concept_vocab_size,
            question_vocab_size: settings.question_vocab_size,
            response_vocab_size: settings.response_vocab_size,
            mode: match settings.mode {
                ModeSetting::Concepts => TraceMode::Concepts,
                ModeSetting::Questions => TraceMode::Questions,
            },
            d_model: settings.d_model,
            d_embed: settings.d_embed,
            n_head: settings.n_head,
            d_head: settings.d_head,
            d_inner: settings.d_inner,
            n_layer: settings.n_layer,
            mem_len: settings.mem_len,
            tgt_len: settings.tgt_len,
            dropout: settings.dropout,
            dropatt: settings.dropatt,
            layer_norm_epsilon: settings.layer_norm_epsilon,
            pre_norm: settings.pre_norm,
            bias_sharing: match settings.bias_sharing.unwrap_or(BiasSetting::Tied) {
                BiasSetting::Tied => BiasSharing::Tied,
                BiasSetting::Untied => BiasSharing::Untied,
            },
            attn_variant: match settings.attn_variant.unwrap_or(VariantSetting::Relative) {
                VariantSetting::Relative => AttentionVariant::RelativeShift,
            },
            same_length: settings.same_length,
            clamp_len: settings.clamp_len,
            mask_token: settings.mask_token,
            eos_token: settings.eos_token,
            dtype: DType::F32,
            device: Device::Cpu,
        })
    }
}

impl fmt::Display for PredictConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "checkpoint={} n_layer={} mem_len={} tgt_len={}",
            self.checkpoint.display(),
            self.model.n_layer,
            self.model.mem_len,
            self.model.tgt_len
        )
    }
}
