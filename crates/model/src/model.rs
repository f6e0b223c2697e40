//! Knowledge-tracing model: sequence engine plus prediction head.

use candle_core::Tensor;

use crate::{
    config::EngineConfig,
    engine::{EngineOutput, ForwardOptions, SegmentInput, SequenceEngine},
    error::ModelError,
    head::PredictionHead,
    memory::MemoryState,
};

/// Output of one chunked prediction call.
#[derive(Debug)]
pub struct TraceOutput {
    /// `(qlen, batch, response_vocab)` logits.
    pub logits: Tensor,
    /// Replacement memory for the next chunk.
    pub memory: Option<MemoryState>,
    /// Engine extras when requested through [`ForwardOptions`].
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
}

/// The full forward path from interaction ids to response logits.
#[derive(Debug)]
pub struct TraceModel {
    engine: SequenceEngine,
    head: PredictionHead,
}

impl TraceModel {
    /// Pairs an engine with a head, checking their shapes agree.
    pub fn new(engine: SequenceEngine, head: PredictionHead) -> Result<Self, ModelError> {
        let config = engine.config();
        if head.config().d_model != config.d_model {
            return Err(ModelError::Config(format!(
                "head d_model ({}) does not match engine d_model ({})",
                head.config().d_model,
                config.d_model
            )));
        }
        if head.config().response_vocab != config.response_vocab_rows() {
            return Err(ModelError::Config(format!(
                "head projects to {} classes but the response table has {} rows",
                head.config().response_vocab,
                config.response_vocab_rows()
            )));
        }
        Ok(Self { engine, head })
    }

    /// Returns the underlying engine.
    pub fn engine(&self) -> &SequenceEngine {
        &self.engine
    }

    /// Returns the prediction head.
    pub fn head(&self) -> &PredictionHead {
        &self.head
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        self.engine.config()
    }

    /// Runs one segment through the engine and head.
    ///
    /// `prompts` and `responses` are `(qlen, batch)` id tensors; the
    /// response stream has the evaluation-mask transform already applied.
    pub fn forward(
        &self,
        prompts: &Tensor,
        responses: &Tensor,
        memory: Option<&MemoryState>,
        options: ForwardOptions<'_>,
    ) -> Result<TraceOutput, ModelError> {
        let input = SegmentInput::Trace {
            prompts: prompts.clone(),
            responses: responses.clone(),
        };
        let EngineOutput {
            last_hidden,
            memory,
            hidden_states,
            attentions,
        } = self.engine.forward(&input, memory, options)?;
        let logits = self.head.forward(&last_hidden)?;
        Ok(TraceOutput {
            logits,
            memory,
            hidden_states,
            attentions,
        })
    }

    /// Predicts discrete response classes for one segment, returning the
    /// `(qlen, batch)` argmax ids plus the replacement memory.
    pub fn predict(
        &self,
        prompts: &Tensor,
        responses: &Tensor,
        memory: Option<&MemoryState>,
    ) -> Result<(Tensor, Option<MemoryState>), ModelError> {
        let output = self.forward(prompts, responses, memory, ForwardOptions::default())?;
        let classes = self.head.predict_classes(&output.logits)?;
        Ok((classes, output.memory))
    }
}
