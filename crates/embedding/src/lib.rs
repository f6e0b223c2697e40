//! Input encoders for the sequence engine.
//!
//! Three encoders live here: the parameter-free relative positional
//! encoder, a plain token embedding table used by the trace encoder, and
//! the vocabulary-partitioned adaptive embedding for very large id spaces.

pub mod adaptive;
pub mod positional;
pub mod token;

pub use adaptive::{AdaptiveEmbedding, AdaptiveEmbeddingConfig};
pub use positional::RelativePositionalEncoding;
pub use token::{TokenEmbedding, TokenEmbeddingConfig};
