//! Segment-recurrent decoder for learner-response prediction.
//!
//! The sequence engine processes a long interaction history in fixed-length
//! segments, carrying a bounded per-layer cache of earlier hidden states so
//! each call extends the attention context without reprocessing old
//! positions. The caller owns the memory state: it is passed in read-only
//! and replaced wholesale on return.

pub mod block;
pub mod config;
pub mod engine;
pub mod error;
pub mod head;
pub mod memory;
pub mod model;
pub mod weights;

pub use block::{DecoderLayer, DecoderLayerOutput};
pub use config::{AttentionVariant, BiasSharing, EngineConfig, TraceMode};
pub use engine::{EngineOutput, ForwardOptions, SegmentEncoder, SegmentInput, SequenceEngine};
pub use error::ModelError;
pub use head::{PredictionHead, PredictionHeadConfig};
pub use memory::{MemoryState, SegmentMemory};
pub use model::{TraceModel, TraceOutput};
pub use weights::TensorMap;
