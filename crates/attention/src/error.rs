//! Error types emitted by the attention cell.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },
    /// The cell was configured inconsistently.
    #[error("attention configuration error: {0}")]
    Config(String),
    /// A tensor-backend failure propagated to the caller.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }
}
