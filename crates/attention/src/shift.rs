//! Relative-shift realignment of position-based attention scores.
//!
//! The content-position term is computed against position encodings indexed
//! by absolute column, but the score matrix must be indexed by relative
//! distance: query `i` attending key `j` needs the encoding for offset
//! `klen - 1 - j` shifted so that it lands at column `j`. The classic
//! zero-pad / reshape / slice trick performs that realignment in one pass
//! without gathering.

use candle_core::{Result, Tensor};

/// Realigns `(batch, heads, qlen, klen)` scores from absolute position
/// columns to relative offsets.
///
/// Within the causal region (`j <= i + klen - qlen`) output entry `(i, j)`
/// holds input entry `(i, j - i + qlen - 1)`, i.e. the encoding column for
/// relative distance `klen - qlen + i - j`. Columns beyond that region
/// contain pad garbage and must be masked by the caller (the causal mask
/// always covers them).
pub fn rel_shift(scores: &Tensor) -> Result<Tensor> {
    let (batch, heads, qlen, klen) = scores.dims4()?;

    let pad = Tensor::zeros((batch, heads, qlen, 1), scores.dtype(), scores.device())?;
    let padded = Tensor::cat(&[&pad, scores], 3)?;
    let reshaped = padded.reshape((batch, heads, klen + 1, qlen))?;
    let sliced = reshaped.narrow(2, 1, klen)?;
    sliced.contiguous()?.reshape((batch, heads, qlen, klen))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn shift_matches_index_identity_in_valid_region() -> Result<()> {
        let device = Device::Cpu;
        let (qlen, klen) = (4, 7);
        let mlen = klen - qlen;

        let data: Vec<f32> = (0..qlen * klen).map(|v| v as f32).collect();
        let input = Tensor::from_vec(data.clone(), (1, 1, qlen, klen), &device)?;
        let shifted = rel_shift(&input)?.flatten_all()?.to_vec1::<f32>()?;

        // Valid keys for query i are j <= i + mlen; there the shifted
        // matrix must read the input at column j - i + qlen - 1, which is
        // the encoding column for relative distance mlen + i - j.
        for i in 0..qlen {
            for j in 0..klen {
                if j > i + mlen {
                    continue;
                }
                let src = j + qlen - 1 - i;
                assert!(src < klen);
                let expected = data[i * klen + src];
                let actual = shifted[i * klen + j];
                assert_eq!(actual, expected, "query {i} key {j}");
            }
        }
        Ok(())
    }

    #[test]
    fn shift_is_independent_per_batch_and_head() -> Result<()> {
        let device = Device::Cpu;
        let single: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let mut stacked = single.clone();
        stacked.extend(single.iter().map(|v| v + 100.0));

        let lone = Tensor::from_vec(single, (1, 1, 3, 4), &device)?;
        let pair = Tensor::from_vec(stacked, (1, 2, 3, 4), &device)?;

        let lone_shifted = rel_shift(&lone)?.flatten_all()?.to_vec1::<f32>()?;
        let pair_shifted = rel_shift(&pair)?;
        let head0 = pair_shifted
            .narrow(1, 0, 1)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        assert_eq!(lone_shifted, head0);
        Ok(())
    }
}
