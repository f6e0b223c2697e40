//! The bounded per-layer cache of prior-segment hidden states.
//!
//! One buffer per decoder layer, all the same length, all detached from
//! gradient tracking: memory is a frozen snapshot, never a path for
//! backpropagation across segments. The caller owns the state between
//! calls; the engine reads it and returns a replacement, leaving the
//! incoming buffers untouched.

use candle_core::{DType, Device, Result as TensorResult, Tensor};

use crate::error::ModelError;

/// Snapshot of cached hidden states, one `(mlen, batch, d_model)` buffer
/// per layer.
#[derive(Debug, Clone)]
pub struct MemoryState {
    layers: Vec<Tensor>,
}

impl MemoryState {
    /// Wraps caller-supplied buffers, checking they agree in shape.
    pub fn new(layers: Vec<Tensor>) -> Result<Self, ModelError> {
        if let Some(first) = layers.first() {
            let expected = first.dims().to_vec();
            for (index, layer) in layers.iter().enumerate() {
                if layer.dims() != expected.as_slice() {
                    return Err(ModelError::Config(format!(
                        "memory buffer {index} has shape {:?}, expected {:?} like layer 0",
                        layer.dims(),
                        expected
                    )));
                }
            }
        }
        Ok(Self { layers })
    }

    /// Zero-filled state of `mem_len` positions per layer, used when a
    /// sequence starts and no cache exists yet.
    pub fn zeroed(
        n_layer: usize,
        mem_len: usize,
        batch: usize,
        d_model: usize,
        dtype: DType,
        device: &Device,
    ) -> TensorResult<Self> {
        let mut layers = Vec::with_capacity(n_layer);
        for _ in 0..n_layer {
            layers.push(Tensor::zeros((mem_len, batch, d_model), dtype, device)?);
        }
        Ok(Self { layers })
    }

    /// Per-layer buffers, oldest position first.
    pub fn layers(&self) -> &[Tensor] {
        &self.layers
    }

    /// Number of cached layers.
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of cached positions (0 when the state holds no buffers).
    pub fn memory_len(&self) -> usize {
        self.layers
            .first()
            .map(|layer| layer.dims()[0])
            .unwrap_or(0)
    }
}

/// Policy object performing the post-call cache update.
#[derive(Debug, Clone, Copy)]
pub struct SegmentMemory {
    n_layer: usize,
    mem_len: usize,
}

impl SegmentMemory {
    /// Creates the manager for a stack of `n_layer` layers with capacity
    /// `mem_len`; a capacity of 0 disables caching entirely.
    pub fn new(n_layer: usize, mem_len: usize) -> Self {
        Self { n_layer, mem_len }
    }

    /// Whether segment recurrence is enabled.
    pub fn enabled(&self) -> bool {
        self.mem_len > 0
    }

    /// Configured capacity.
    pub fn mem_len(&self) -> usize {
        self.mem_len
    }

    /// Concatenates each layer's fresh hidden states behind the old cache,
    /// detaches, and retains the trailing `mem_len` positions (oldest
    /// evicted first).
    ///
    /// `hidden_history` holds the pre-layer hidden state of every layer
    /// (exactly `n_layer` entries); a count mismatch is a configuration
    /// defect, not a recoverable condition.
    pub fn update(
        &self,
        hidden_history: &[Tensor],
        previous: Option<&MemoryState>,
        mlen: usize,
        qlen: usize,
    ) -> Result<Option<MemoryState>, ModelError> {
        if !self.enabled() {
            return Ok(None);
        }
        if hidden_history.len() != self.n_layer {
            return Err(ModelError::Config(format!(
                "hidden-state history has {} entries but the stack has {} layers",
                hidden_history.len(),
                self.n_layer
            )));
        }
        if let Some(previous) = previous {
            if previous.n_layers() != self.n_layer {
                return Err(ModelError::Config(format!(
                    "memory state has {} buffers but the stack has {} layers",
                    previous.n_layers(),
                    self.n_layer
                )));
            }
        }

        let end_idx = mlen + qlen;
        let beg_idx = end_idx.saturating_sub(self.mem_len);

        let mut layers = Vec::with_capacity(self.n_layer);
        for (index, hidden) in hidden_history.iter().enumerate() {
            let combined = match previous.and_then(|state| state.layers().get(index)) {
                Some(old) if old.dims()[0] > 0 => {
                    Tensor::cat(&[&old.to_dtype(hidden.dtype())?, hidden], 0)?
                }
                _ => hidden.clone(),
            };
            let combined = combined.detach();
            let total = combined.dims()[0];
            let beg = beg_idx.min(total);
            let end = end_idx.min(total);
            layers.push(combined.narrow(0, beg, end - beg)?.contiguous()?);
        }
        log::debug!(
            "memory update: mlen={} qlen={} retained={} of {}",
            mlen,
            qlen,
            layers.first().map(|l| l.dims()[0]).unwrap_or(0),
            end_idx
        );
        Ok(Some(MemoryState::new(layers)?))
    }
}
