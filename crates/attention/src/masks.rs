//! Decoder attention-mask builders and numeric mask application.
//!
//! Masks are `(qlen, klen)` f32 matrices where `1.0` marks a forbidden
//! position and `0.0` an allowed one. Application multiplies the score by
//! `1 - mask` and adds `mask * penalty`, where the penalty is large enough
//! to zero the softmax weight but stays far from the dtype's overflow
//! range, so masked rows never produce NaNs.

use candle_core::{DType, Device, Result, Tensor};

/// Dtype shared by all decoder masks.
pub const MASK_DTYPE: DType = DType::F32;

/// Large-negative constant used to suppress masked scores, scaled to the
/// representable range of `dtype`.
pub fn mask_penalty(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => -3.0e4,
        _ => -1.0e30,
    }
}

/// Builds the causal mask for one decoder call.
///
/// `qlen` fresh positions attend over `klen = mlen + qlen` keys: every
/// cached position plus their own segment up to and including themselves.
/// With `same_length` set, lookback is additionally bounded so each query
/// sees a window of at most `mem_len` past positions regardless of how far
/// the segment extends.
pub fn build_decoder_mask(
    device: &Device,
    qlen: usize,
    mlen: usize,
    same_length: bool,
    mem_len: usize,
) -> Result<Tensor> {
    let klen = mlen + qlen;
    let mut data = vec![0f32; qlen * klen];

    // Lookback bound per the same-length convention: keys at or before
    // `i - mask_shift_len` fall out of the sliding window.
    let mask_len = klen as isize - mem_len as isize;
    let mask_shift_len = if mask_len > 0 {
        qlen as isize - mask_len
    } else {
        qlen as isize
    };

    for i in 0..qlen {
        for j in 0..klen {
            let future = j > i + mlen;
            let expired = same_length && (j as isize) <= (i as isize) - mask_shift_len;
            if future || expired {
                data[i * klen + j] = 1.0;
            }
        }
    }

    Tensor::from_vec(data, (qlen, klen), device)
}

/// Applies a `(qlen, klen)` mask to `(batch, heads, qlen, klen)` scores.
pub fn apply_mask(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (qlen, klen) = mask.dims2()?;
    let mask = mask.to_dtype(scores.dtype())?.reshape((1, 1, qlen, klen))?;
    let keep = mask.affine(-1.0, 1.0)?;
    let penalty = mask.affine(mask_penalty(scores.dtype()), 0.0)?;
    scores.broadcast_mul(&keep)?.broadcast_add(&penalty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_rows(mask: &Tensor) -> Vec<Vec<f32>> {
        mask.to_vec2::<f32>().unwrap()
    }

    #[test]
    fn plain_causal_mask_without_memory() -> Result<()> {
        let mask = build_decoder_mask(&Device::Cpu, 4, 0, false, 0)?;
        let rows = mask_rows(&mask);
        for (i, row) in rows.iter().enumerate() {
            for (j, &value) in row.iter().enumerate() {
                let expected = if j > i { 1.0 } else { 0.0 };
                assert_eq!(value, expected, "query {i} key {j}");
            }
        }
        Ok(())
    }

    #[test]
    fn cached_positions_are_always_visible() -> Result<()> {
        let mask = build_decoder_mask(&Device::Cpu, 3, 4, false, 4)?;
        let rows = mask_rows(&mask);
        assert_eq!(rows[0].len(), 7);
        for (i, row) in rows.iter().enumerate() {
            for (j, &value) in row.iter().enumerate() {
                let expected = if j > i + 4 { 1.0 } else { 0.0 };
                assert_eq!(value, expected, "query {i} key {j}");
            }
        }
        Ok(())
    }

    #[test]
    fn same_length_bounds_lookback_to_mem_len() -> Result<()> {
        // Steady state: mlen == mem_len == 4, so every query may see
        // exactly the 4 most recent past positions plus itself.
        let mask = build_decoder_mask(&Device::Cpu, 3, 4, true, 4)?;
        let rows = mask_rows(&mask);
        for (i, row) in rows.iter().enumerate() {
            let visible: Vec<usize> = row
                .iter()
                .enumerate()
                .filter(|(_, &v)| v == 0.0)
                .map(|(j, _)| j)
                .collect();
            let expected: Vec<usize> = ((i + 1)..=(i + 4)).collect();
            assert_eq!(visible, expected, "query {i}");
        }
        Ok(())
    }

    #[test]
    fn same_length_first_segment_keeps_short_history() -> Result<()> {
        // No cache yet and qlen <= mem_len: nothing has expired.
        let plain = build_decoder_mask(&Device::Cpu, 3, 0, false, 4)?;
        let windowed = build_decoder_mask(&Device::Cpu, 3, 0, true, 4)?;
        assert_eq!(mask_rows(&plain), mask_rows(&windowed));
        Ok(())
    }

    #[test]
    fn masked_scores_stay_finite_after_softmax() -> Result<()> {
        let mask = build_decoder_mask(&Device::Cpu, 4, 0, false, 0)?;
        let scores = Tensor::randn(0f32, 1.0, (1, 2, 4, 4), &Device::Cpu)?;
        let masked = apply_mask(&scores, &mask)?;
        let probs = candle_nn::ops::softmax_last_dim(&masked)?;
        let values = probs.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.is_finite()));

        // First query row attends only to itself.
        let first = probs
            .narrow(2, 0, 1)?
            .narrow(3, 0, 1)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(first.iter().all(|v| (v - 1.0).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn penalty_never_overflows_half_precision() {
        // f16 saturates at 65504; the penalty must stay representable.
        assert!(mask_penalty(DType::F16).abs() < 65504.0);
        assert!(mask_penalty(DType::F32).is_finite());
    }
}
