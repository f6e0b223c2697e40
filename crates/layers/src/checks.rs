//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be
//! wired into constructors or forward paths. They return
//! `candle_core::Result<()>` so call sites can propagate errors without
//! panicking, and every message names the tensor being checked together
//! with the offending shape.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor has the expected number of dimensions.
pub fn expect_rank(context: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let dims = tensor.dims();
    if dims.len() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected rank {rank}, got shape {:?}",
            dims
        )))
    }
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(context: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Ensures the trailing dimension matches `expected` without constraining
/// the leading layout.
pub fn expect_last_dim(context: &str, tensor: &Tensor, expected: usize) -> Result<()> {
    let dims = tensor.dims();
    match dims.last() {
        Some(last) if *last == expected => Ok(()),
        _ => Err(Error::Msg(format!(
            "{context}: expected last dim {expected}, got shape {:?}",
            dims
        ))),
    }
}

/// Validates the `(seq, batch, hidden)` convention with a known hidden size.
pub fn expect_seq_batch_hidden(context: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    let dims = tensor.dims();
    match dims {
        [_, _, actual] if *actual == hidden => Ok(()),
        _ => Err(Error::Msg(format!(
            "{context}: expected (seq, batch, {hidden}) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(context: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.iter().any(|candidate| *candidate == dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn shape_mismatch_reports_both_shapes() {
        let tensor = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let err = expect_shape("test.tensor", &tensor, &[3, 2]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("[3, 2]"));
        assert!(message.contains("[2, 3]"));
    }

    #[test]
    fn last_dim_accepts_any_leading_layout() {
        let rank2 = Tensor::zeros((5, 8), DType::F32, &Device::Cpu).unwrap();
        let rank3 = Tensor::zeros((5, 2, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(expect_last_dim("t", &rank2, 8).is_ok());
        assert!(expect_last_dim("t", &rank3, 8).is_ok());
        assert!(expect_last_dim("t", &rank3, 4).is_err());
    }
}
