//! The sequence engine: one forward call over one segment.
//!
//! The engine embeds the segment, builds the relative position sequence
//! spanning cached plus fresh positions, runs the decoder stack under the
//! causal mask, and hands the collected pre-layer hidden states to the
//! memory manager. It is a pure, synchronous computation: no I/O, no
//! hidden process state, and the caller-supplied memory is never mutated.

use attention::{build_decoder_mask, AttentionInput};
use candle_core::Tensor;
use embedding::{AdaptiveEmbedding, RelativePositionalEncoding, TokenEmbedding};
use layers::{checks, Dropout};

use crate::{
    block::DecoderLayer,
    config::EngineConfig,
    error::ModelError,
    memory::{MemoryState, SegmentMemory},
};

/// Input encoder owned by the engine.
#[derive(Debug, Clone)]
pub enum SegmentEncoder {
    /// Two summed lookup tables: one over the prompt stream
    /// (concepts or questions) and one over the masked response stream.
    Trace {
        prompt: TokenEmbedding,
        response: TokenEmbedding,
    },
    /// Vocabulary-partitioned lookup for a single very large id stream.
    Adaptive(AdaptiveEmbedding),
}

impl SegmentEncoder {
    fn output_dim(&self) -> usize {
        match self {
            SegmentEncoder::Trace { prompt, .. } => prompt.config().d_embed,
            SegmentEncoder::Adaptive(table) => table.config().d_proj,
        }
    }
}

/// One segment of input, statically typed per modality. Exactly one
/// modality can exist per call, so "both ids and embeddings" is
/// unrepresentable rather than a runtime check.
#[derive(Debug, Clone)]
pub enum SegmentInput {
    /// `(qlen, batch)` prompt ids plus equally shaped masked response ids.
    Trace { prompts: Tensor, responses: Tensor },
    /// `(qlen, batch)` ids for the adaptive encoder.
    Ids { tokens: Tensor },
    /// Pre-computed `(qlen, batch, d_model)` embeddings, bypassing lookup.
    Embedded { hidden: Tensor },
}

/// Per-call switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOptions<'a> {
    /// Enables the configured dropout rates.
    pub train: bool,
    /// Collect the pre-layer hidden state of every layer plus the final
    /// output.
    pub output_hidden_states: bool,
    /// Collect per-layer attention probabilities.
    pub output_attentions: bool,
    /// `(n_head,)` multiplier applied to every layer's attention heads.
    pub head_mask: Option<&'a Tensor>,
}

/// Everything one forward call produces.
#[derive(Debug)]
pub struct EngineOutput {
    /// Final hidden states, `(qlen, batch, d_model)`.
    pub last_hidden: Tensor,
    /// Replacement memory to thread into the next call.
    pub memory: Option<MemoryState>,
    /// Pre-layer states plus final output, when requested.
    pub hidden_states: Option<Vec<Tensor>>,
    /// `(batch, n_head, qlen, klen)` probabilities per layer, when
    /// requested.
    pub attentions: Option<Vec<Tensor>>,
}

/// Orchestrates embedding, position encoding, masking, the layer stack,
/// and the memory update for one segment.
#[derive(Debug)]
pub struct SequenceEngine {
    config: EngineConfig,
    encoder: SegmentEncoder,
    pos_encoder: RelativePositionalEncoding,
    drop: Dropout,
    layers: Vec<DecoderLayer>,
    memory: SegmentMemory,
}

impl SequenceEngine {
    /// Assembles the engine from its parts. Counts and dimensions are
    /// checked here so a malformed checkpoint fails at construction, not
    /// mid-forward.
    pub fn new(
        config: EngineConfig,
        encoder: SegmentEncoder,
        layers: Vec<DecoderLayer>,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        if layers.len() != config.n_layer {
            return Err(ModelError::Config(format!(
                "expected {} decoder layers, got {}",
                config.n_layer,
                layers.len()
            )));
        }
        if encoder.output_dim() != config.d_model {
            return Err(ModelError::Config(format!(
                "encoder produces dimension {} but the stack expects d_model {}",
                encoder.output_dim(),
                config.d_model
            )));
        }
        if let SegmentEncoder::Trace { prompt, response } = &encoder {
            if prompt.config().vocab_size != config.prompt_vocab_rows() {
                return Err(ModelError::Config(format!(
                    "prompt table has {} rows, config expects {}",
                    prompt.config().vocab_size,
                    config.prompt_vocab_rows()
                )));
            }
            if response.config().vocab_size != config.response_vocab_rows() {
                return Err(ModelError::Config(format!(
                    "response table has {} rows, config expects {}",
                    response.config().vocab_size,
                    config.response_vocab_rows()
                )));
            }
        }
        for (index, layer) in layers.iter().enumerate() {
            let attn = layer.attention().config();
            if attn.d_model != config.d_model
                || attn.n_head != config.n_head
                || attn.d_head != config.d_head
            {
                return Err(ModelError::Config(format!(
                    "layer {index} geometry ({}, {}, {}) does not match config ({}, {}, {})",
                    attn.d_model, attn.n_head, attn.d_head,
                    config.d_model, config.n_head, config.d_head
                )));
            }
        }

        let pos_encoder = RelativePositionalEncoding::new(config.d_model)
            .map_err(|err| ModelError::Config(err.to_string()))?;
        let drop = Dropout::new(config.dropout)?;
        let memory = SegmentMemory::new(config.n_layer, config.mem_len);
        log::info!(
            "sequence engine init n_layer={} d_model={} n_head={} mem_len={} same_length={} variant={:?}",
            config.n_layer,
            config.d_model,
            config.n_head,
            config.mem_len,
            config.same_length,
            config.attn_variant
        );
        Ok(Self {
            config,
            encoder,
            pos_encoder,
            drop,
            layers,
            memory,
        })
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the memory policy (capacity and enablement).
    pub fn memory_policy(&self) -> &SegmentMemory {
        &self.memory
    }

    fn embed(&self, input: &SegmentInput) -> Result<Tensor, ModelError> {
        match (&self.encoder, input) {
            (SegmentEncoder::Trace { prompt, response }, SegmentInput::Trace { prompts, responses }) => {
                if prompts.dims() != responses.dims() {
                    return Err(ModelError::Input(format!(
                        "prompt ids {:?} and response ids {:?} must share one (qlen, batch) shape",
                        prompts.dims(),
                        responses.dims()
                    )));
                }
                let prompt_emb = prompt.forward(prompts)?;
                let response_emb = response.forward(responses)?;
                Ok(prompt_emb.add(&response_emb)?)
            }
            (SegmentEncoder::Adaptive(table), SegmentInput::Ids { tokens }) => {
                checks::expect_rank("engine.tokens", tokens, 2)?;
                Ok(table.forward(tokens)?)
            }
            (_, SegmentInput::Embedded { hidden }) => {
                checks::expect_seq_batch_hidden("engine.embedded", hidden, self.config.d_model)?;
                Ok(hidden.clone())
            }
            (SegmentEncoder::Trace { .. }, SegmentInput::Ids { .. }) => Err(ModelError::Input(
                "this engine encodes prompt/response pairs; a single id stream was supplied".into(),
            )),
            (SegmentEncoder::Adaptive(_), SegmentInput::Trace { .. }) => Err(ModelError::Input(
                "this engine encodes a single id stream; prompt/response pairs were supplied".into(),
            )),
        }
    }

    /// One forward call over one segment.
    ///
    /// `memory` is the state returned by the previous call, or `None` at
    /// the start of a sequence (zero-filled buffers are initialised when
    /// memory is enabled). The returned state replaces it; the incoming
    /// buffers are left untouched.
    pub fn forward(
        &self,
        input: &SegmentInput,
        memory: Option<&MemoryState>,
        options: ForwardOptions<'_>,
    ) -> Result<EngineOutput, ModelError> {
        let word_emb = self.embed(input)?;
        let (qlen, batch, _) = word_emb.dims3()?;

        let initialised;
        let state: Option<&MemoryState> = if self.memory.enabled() {
            match memory {
                Some(state) => {
                    if state.n_layers() != self.config.n_layer {
                        return Err(ModelError::Config(format!(
                            "memory state has {} buffers but the stack has {} layers",
                            state.n_layers(),
                            self.config.n_layer
                        )));
                    }
                    Some(state)
                }
                None => {
                    initialised = MemoryState::zeroed(
                        self.config.n_layer,
                        self.config.mem_len,
                        batch,
                        self.config.d_model,
                        self.config.dtype,
                        &self.config.device,
                    )?;
                    Some(&initialised)
                }
            }
        } else {
            if memory.map(|m| m.memory_len() > 0).unwrap_or(false) {
                return Err(ModelError::Input(
                    "memory supplied to an engine configured with mem_len = 0".into(),
                ));
            }
            None
        };

        let mlen = state.map(MemoryState::memory_len).unwrap_or(0);
        let klen = mlen + qlen;

        let offsets = RelativePositionalEncoding::descending_offsets(klen, self.config.clamp_len);
        let pos_emb = self
            .pos_encoder
            .forward(&offsets, &self.config.device)?
            .to_dtype(self.config.dtype)?;
        let attn_mask = build_decoder_mask(
            &self.config.device,
            qlen,
            mlen,
            self.config.same_length,
            self.config.mem_len,
        )?;

        let mut core_out = self.drop.forward(&word_emb, options.train)?;
        let pos_emb = self.drop.forward(&pos_emb, options.train)?;

        let mut hidden_history = Vec::with_capacity(self.config.n_layer);
        let mut attentions = options.output_attentions.then(Vec::new);

        for (index, layer) in self.layers.iter().enumerate() {
            hidden_history.push(core_out.clone());
            let layer_memory = state.map(|s| &s.layers()[index]);
            let out = layer.forward(
                &core_out,
                AttentionInput {
                    pos_encoding: Some(&pos_emb),
                    attn_mask: Some(&attn_mask),
                    memory: layer_memory,
                    head_mask: options.head_mask,
                },
                options.output_attentions,
                options.train,
            )?;
            core_out = out.hidden;
            if let (Some(collected), Some(probs)) = (attentions.as_mut(), out.attn_probs) {
                collected.push(probs);
            }
        }

        let last_hidden = self.drop.forward(&core_out, options.train)?;
        let new_memory = self.memory.update(&hidden_history, state, mlen, qlen)?;

        let hidden_states = if options.output_hidden_states {
            hidden_history.push(last_hidden.clone());
            Some(hidden_history)
        } else {
            None
        };

        Ok(EngineOutput {
            last_hidden,
            memory: new_memory,
            hidden_states,
            attentions,
        })
    }
}
