//! Sinusoidal encoding of relative position offsets.
//!
//! Offsets are plain distances, not absolute indices; the engine feeds a
//! descending sequence `klen-1 … 0` spanning cached and fresh positions.
//! The encoding concatenates `sin` and `cos` of the offset scaled by a
//! geometric frequency schedule and carries no learned parameters, so two
//! calls with the same offsets are bit-identical.

use candle_core::{Device, Error, Result, Tensor};

/// Parameter-free encoder producing `(rlen, d_model)` position vectors.
#[derive(Debug, Clone)]
pub struct RelativePositionalEncoding {
    d_model: usize,
    inv_freq: Vec<f64>,
}

impl RelativePositionalEncoding {
    /// Builds the frequency schedule `1 / 10000^(2i / d_model)`.
    pub fn new(d_model: usize) -> Result<Self> {
        if d_model == 0 || d_model % 2 != 0 {
            return Err(Error::Msg(format!(
                "positional encoding requires an even, non-zero d_model, got {d_model}"
            )));
        }
        let half = d_model / 2;
        let inv_freq = (0..half)
            .map(|i| 1.0 / 10000f64.powf((2 * i) as f64 / d_model as f64))
            .collect();
        Ok(Self { d_model, inv_freq })
    }

    /// Returns the model dimension of produced vectors.
    pub fn d_model(&self) -> usize {
        self.d_model
    }

    /// Builds the descending offset sequence `klen-1 … 0`, clamping each
    /// offset to `clamp_len` when a positive clamp is configured.
    pub fn descending_offsets(klen: usize, clamp_len: Option<usize>) -> Vec<f32> {
        (0..klen)
            .rev()
            .map(|offset| match clamp_len {
                Some(clamp) if clamp > 0 => offset.min(clamp) as f32,
                _ => offset as f32,
            })
            .collect()
    }

    /// Encodes each offset as `[sin(offset * f_i) ‖ cos(offset * f_i)]`.
    pub fn forward(&self, offsets: &[f32], device: &Device) -> Result<Tensor> {
        let half = self.d_model / 2;
        let mut data = Vec::with_capacity(offsets.len() * self.d_model);
        for &offset in offsets {
            let offset = offset as f64;
            for freq in &self.inv_freq {
                data.push((offset * freq).sin() as f32);
            }
            for freq in &self.inv_freq {
                data.push((offset * freq).cos() as f32);
            }
        }
        debug_assert_eq!(data.len(), offsets.len() * 2 * half);
        Tensor::from_vec(data, (offsets.len(), self.d_model), device)
    }
}
