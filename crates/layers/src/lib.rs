//! Building blocks shared by the decoder stack.
//!
//! Hidden states follow the `(seq, batch, hidden)` convention: the position
//! axis leads so that cached segments can be concatenated ahead of fresh
//! input without reshuffling the batch dimension. Projections and
//! normalisation operate on the trailing hidden axis and are layout
//! agnostic beyond that.

pub mod checks;
pub mod dropout;
pub mod feed_forward;
pub mod linear;
pub mod norm;

pub use dropout::Dropout;
pub use feed_forward::{PositionwiseFeedForward, PositionwiseFeedForwardConfig};
pub use linear::{Linear, LinearConfig, LinearInit};
pub use norm::{LayerNorm, NormConfig};
