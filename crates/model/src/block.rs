//! One decoder layer: attention cell followed by the feed-forward block.

use attention::{AttentionInput, RelativeMultiHeadAttention};
use candle_core::Tensor;
use layers::PositionwiseFeedForward;

use crate::error::ModelError;

/// Result of one decoder layer pass.
#[derive(Debug)]
pub struct DecoderLayerOutput {
    pub hidden: Tensor,
    /// Attention probabilities when the caller asked for them.
    pub attn_probs: Option<Tensor>,
}

/// Attention cell plus position-wise feed-forward, sharing one residual
/// convention.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    attn: RelativeMultiHeadAttention,
    ff: PositionwiseFeedForward,
}

impl DecoderLayer {
    /// Pairs an attention cell with its feed-forward block.
    pub fn new(attn: RelativeMultiHeadAttention, ff: PositionwiseFeedForward) -> Result<Self, ModelError> {
        if attn.config().d_model != ff.config().d_model {
            return Err(ModelError::Config(format!(
                "attention d_model ({}) and feed-forward d_model ({}) disagree",
                attn.config().d_model,
                ff.config().d_model
            )));
        }
        Ok(Self { attn, ff })
    }

    /// Returns the attention cell (used when wiring shared biases).
    pub fn attention(&self) -> &RelativeMultiHeadAttention {
        &self.attn
    }

    /// Forward pass over `(qlen, batch, d_model)` hidden states.
    pub fn forward(
        &self,
        hidden: &Tensor,
        input: AttentionInput<'_>,
        output_attentions: bool,
        train: bool,
    ) -> Result<DecoderLayerOutput, ModelError> {
        let attn_out = self.attn.forward(hidden, input, output_attentions, train)?;
        let hidden = self.ff.forward(&attn_out.hidden, train)?;
        Ok(DecoderLayerOutput {
            hidden,
            attn_probs: attn_out.attn_probs,
        })
    }
}
