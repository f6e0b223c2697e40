//! Relative-position multi-head attention for segment-recurrent decoding.
//!
//! The cell defined here scores attention with two learned bias terms,
//! content-content and content-position, over a key space that spans the
//! cached memory of earlier segments plus the current segment. Hidden
//! states use the `(seq, batch, d_model)` layout; scores are computed
//! internally as `(batch, heads, qlen, klen)` with reductions in f32.
//!
//! Masking is numeric, never infinite: disallowed positions are pushed to a
//! dtype-appropriate large-negative value so the softmax stays NaN-free
//! even when a row is almost fully masked.

pub mod error;
pub mod masks;
pub mod rel_attn;
pub mod shift;

pub use error::AttentionError;
pub use masks::{apply_mask, build_decoder_mask, mask_penalty, MASK_DTYPE};
pub use rel_attn::{
    AttentionInput, AttentionOutput, RelAttentionConfig, RelativeMultiHeadAttention,
};
pub use shift::rel_shift;
