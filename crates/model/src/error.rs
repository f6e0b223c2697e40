//! Error taxonomy for the sequence engine.
//!
//! Configuration and input errors indicate an integration defect and are
//! never retried; tensor errors carry backend context. Numeric edge cases
//! (masked rows, zero-length memory) are handled arithmetically inside the
//! forward pass and never surface here.

use attention::AttentionError;
use thiserror::Error;

/// Fatal failure modes of engine construction and forward calls.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The engine was assembled inconsistently (layer counts, dimensions,
    /// unsupported variant).
    #[error("engine configuration error: {0}")]
    Config(String),
    /// The per-call input does not satisfy the engine contract.
    #[error("input error: {0}")]
    Input(String),
    /// A checkpoint tensor was missing, mis-shaped, or left unconsumed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    /// Attention-cell failure.
    #[error(transparent)]
    Attention(#[from] AttentionError),
    /// Tensor-backend failure.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}
