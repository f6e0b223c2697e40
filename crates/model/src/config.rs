//! Engine configuration.
//!
//! Everything the checkpoint/config loader supplies at construction lives
//! here; `validate()` aggregates violations so an integration defect
//! reports every problem at once instead of failing piecemeal.

use candle_core::{DType, Device};

use crate::error::ModelError;

/// Extra rows reserved in the prompt (concept/question) embedding table
/// for special tokens appended by preprocessing.
pub const RESERVED_PROMPT_TOKENS: usize = 4;
/// Extra rows reserved in the response embedding table for the evaluation
/// mask token and the end-of-sequence marker.
pub const RESERVED_RESPONSE_TOKENS: usize = 2;

/// Which interaction stream drives the prompt embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    /// Embed concept ids.
    Concepts,
    /// Embed question ids.
    Questions,
}

/// Attention-score formulation. Closed set: exactly one formulation is
/// supported; configuration parsing rejects anything else before the
/// engine is ever constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttentionVariant {
    /// Relative-position scores with learned content/position biases and
    /// the shift realignment.
    #[default]
    RelativeShift,
}

/// Whether the two attention bias tensors are shared across layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BiasSharing {
    /// One `(n_head, d_head)` pair shared by every layer.
    #[default]
    Tied,
    /// A private pair per layer.
    Untied,
}

/// Construction-time parameters of the sequence engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub concept_vocab_size: usize,
    pub question_vocab_size: usize,
    pub response_vocab_size: usize,
    pub mode: TraceMode,
    pub d_model: usize,
    pub d_embed: usize,
    pub n_head: usize,
    pub d_head: usize,
    pub d_inner: usize,
    pub n_layer: usize,
    /// Bound on cached positions per layer; 0 disables memory.
    pub mem_len: usize,
    /// Segment length the preprocessing collaborator chunks to.
    pub tgt_len: usize,
    pub dropout: Option<f32>,
    pub dropatt: Option<f32>,
    pub layer_norm_epsilon: f64,
    pub pre_norm: bool,
    pub bias_sharing: BiasSharing,
    pub attn_variant: AttentionVariant,
    /// Bound lookback to a sliding window during evaluation.
    pub same_length: bool,
    /// Clamp relative offsets beyond this distance; `None` leaves them
    /// unbounded.
    pub clamp_len: Option<usize>,
    /// Reserved response id substituted for hidden (future) responses.
    pub mask_token: i64,
    /// Reserved end-of-sequence response id.
    pub eos_token: i64,
    pub dtype: DType,
    pub device: Device,
}

impl EngineConfig {
    /// Prompt vocabulary selected by `mode`, including reserved rows.
    pub fn prompt_vocab_rows(&self) -> usize {
        let base = match self.mode {
            TraceMode::Concepts => self.concept_vocab_size,
            TraceMode::Questions => self.question_vocab_size,
        };
        base + RESERVED_PROMPT_TOKENS
    }

    /// Response vocabulary including reserved rows.
    pub fn response_vocab_rows(&self) -> usize {
        self.response_vocab_size + RESERVED_RESPONSE_TOKENS
    }

    /// Validate structural invariants; every violation is reported.
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut errors = Vec::new();

        if self.concept_vocab_size == 0 && self.question_vocab_size == 0 {
            errors.push("at least one of concept/question vocab sizes must be non-zero".to_string());
        }
        if self.response_vocab_size == 0 {
            errors.push("response_vocab_size must be greater than zero".to_string());
        }
        if self.d_model == 0 {
            errors.push("d_model must be greater than zero".to_string());
        }
        if self.d_model % 2 != 0 {
            errors.push("d_model must be even for the sinusoidal position encoder".to_string());
        }
        if self.d_embed != self.d_model {
            errors.push(format!(
                "trace encoder feeds embeddings straight into the stack: d_embed ({}) must equal d_model ({})",
                self.d_embed, self.d_model
            ));
        }
        if self.n_layer == 0 {
            errors.push("n_layer must be greater than zero".to_string());
        }
        if self.n_head == 0 || self.d_head == 0 {
            errors.push("n_head and d_head must be greater than zero".to_string());
        }
        if self.d_inner == 0 {
            errors.push("d_inner must be greater than zero".to_string());
        }
        if self.tgt_len == 0 {
            errors.push("tgt_len must be greater than zero".to_string());
        }
        for (name, probability) in [("dropout", self.dropout), ("dropatt", self.dropatt)] {
            if let Some(p) = probability {
                if !(0.0..1.0).contains(&p) {
                    errors.push(format!("{name} must be in [0, 1), got {p}"));
                }
            }
        }
        if self.layer_norm_epsilon <= 0.0 {
            errors.push("layer_norm_epsilon must be positive".to_string());
        }
        if self.mask_token < 0 || self.eos_token < 0 {
            errors.push("mask_token and eos_token must be non-negative ids".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelError::Config(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> EngineConfig {
        EngineConfig {
            concept_vocab_size: 12,
            question_vocab_size: 40,
            response_vocab_size: 2,
            mode: TraceMode::Concepts,
            d_model: 16,
            d_embed: 16,
            n_head: 2,
            d_head: 8,
            d_inner: 32,
            n_layer: 2,
            mem_len: 4,
            tgt_len: 4,
            dropout: None,
            dropatt: None,
            layer_norm_epsilon: 1e-5,
            pre_norm: false,
            bias_sharing: BiasSharing::Tied,
            attn_variant: AttentionVariant::RelativeShift,
            same_length: false,
            clamp_len: None,
            mask_token: 2,
            eos_token: 3,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn violations_are_aggregated() {
        let mut config = valid();
        config.d_model = 0;
        config.n_layer = 0;
        config.dropout = Some(1.5);
        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("d_model"));
        assert!(message.contains("n_layer"));
        assert!(message.contains("dropout"));
    }

    #[test]
    fn embed_model_width_mismatch_is_rejected() {
        let mut config = valid();
        config.d_embed = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn reserved_rows_extend_the_tables() {
        let config = valid();
        assert_eq!(config.prompt_vocab_rows(), 12 + RESERVED_PROMPT_TOKENS);
        assert_eq!(config.response_vocab_rows(), 2 + RESERVED_RESPONSE_TOKENS);
    }
}
