//! Train-gated dropout.
//!
//! Dropout only fires when both a positive probability is configured and
//! the caller passes `train = true`; the evaluation path is always the
//! identity so repeated forward calls stay bit-identical.

use candle_core::{Error, Result, Tensor};
use candle_nn::ops::dropout;

/// Dropout helper shared by embeddings, attention, and feed-forward blocks.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    probability: Option<f32>,
}

impl Dropout {
    /// Builds a dropout gate; `None` or `0.0` disables it entirely.
    pub fn new(probability: Option<f32>) -> Result<Self> {
        if let Some(p) = probability {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg(format!(
                    "dropout probability must be in [0, 1), got {p}"
                )));
            }
        }
        Ok(Self { probability })
    }

    /// Indicates whether this gate can ever drop values.
    pub fn is_active(&self) -> bool {
        matches!(self.probability, Some(p) if p > 0.0)
    }

    /// Applies dropout during training, identity otherwise.
    pub fn forward(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        match self.probability {
            Some(p) if train && p > 0.0 => dropout(input, p),
            _ => Ok(input.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn eval_path_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let gate = Dropout::new(Some(0.5))?;
        let input = Tensor::randn(0f32, 1.0, (3, 2, 4), &device)?;
        let out = gate.forward(&input, false)?;
        let diff = input.sub(&out)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-7);
        Ok(())
    }

    #[test]
    fn zero_probability_never_drops() -> Result<()> {
        let device = Device::Cpu;
        let gate = Dropout::new(Some(0.0))?;
        assert!(!gate.is_active());
        let input = Tensor::ones((2, 2, 2), DType::F32, &device)?;
        let out = gate.forward(&input, true)?;
        let diff = input.sub(&out)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-7);
        Ok(())
    }

    #[test]
    fn out_of_range_probability_is_rejected() {
        assert!(Dropout::new(Some(1.0)).is_err());
        assert!(Dropout::new(Some(-0.1)).is_err());
    }
}
