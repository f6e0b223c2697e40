//! Dense affine projections.
//!
//! Linear layers store a `(out_dim, in_dim)` weight and an optional bias.
//! The forward pass accepts any tensor whose trailing dimension equals
//! `in_dim`, flattening leading dimensions for the matmul and restoring
//! them afterwards, so the same layer serves `(seq, batch, hidden)` hidden
//! states and `(rlen, hidden)` position encodings alike. Multi-projection
//! variants pack the output as `num_projections * out_dim` along the last
//! axis so callers can split them for attention heads.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::checks;

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension per projection shard.
    pub output_dim: usize,
    /// Whether a learnable bias vector is applied.
    pub bias: bool,
    /// Number of projections fused together (1 for standard linear).
    pub fused_projections: usize,
}

impl LinearConfig {
    /// Creates a configuration for a single projection layer without bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: false,
            fused_projections: 1,
        }
    }

    /// Total number of output features produced by the layer.
    pub fn total_output_dim(&self) -> usize {
        self.output_dim * self.fused_projections
    }
}

/// Weight initialisation policies for freshly constructed projections.
#[derive(Debug, Clone, Copy)]
pub enum LinearInit {
    /// Gaussian initialisation with the given standard deviation.
    Normal { std: f64 },
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
}

impl LinearInit {
    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let weight = match self {
            LinearInit::Normal { std } => Tensor::randn(0f32, *std as f32, shape, device)?,
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (in_dim as f64 + out_dim as f64)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
        };
        if dtype == DType::F32 {
            Ok(weight)
        } else {
            weight.to_dtype(dtype)
        }
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters, as supplied
    /// by a checkpoint loader. Shape mismatches are fatal here rather than
    /// at first use.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        checks::expect_rank("linear.weight", &weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            &weight,
            &[config.total_output_dim(), config.input_dim],
        )?;
        match (config.bias, &bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.total_output_dim()])?;
            }
            (false, Some(_)) => {
                return Err(Error::Msg(
                    "linear.bias: bias provided but config disables bias".into(),
                ))
            }
            (true, None) => {
                return Err(Error::Msg(
                    "linear.bias: config expects bias but none supplied".into(),
                ))
            }
            (false, None) => {}
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with freshly initialised weights.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.total_output_dim(), config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.total_output_dim(), dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Returns the static configuration used to validate inputs.
    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Returns a clone of the underlying weight tensor.
    pub fn weight(&self) -> Tensor {
        self.weight.clone()
    }

    /// Applies the projection over the trailing axis.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        checks::expect_last_dim("linear.input", input, self.config.input_dim)?;
        let dims = input.dims();
        if dims.len() < 2 {
            return Err(Error::Msg(format!(
                "linear.input: expected at least rank 2, got shape {:?}",
                dims
            )));
        }

        let rows: usize = dims[..dims.len() - 1].iter().product();
        let flat = input.contiguous()?.reshape((rows, self.config.input_dim))?;
        let weight_t = self.weight.t()?;
        let mut output = flat.matmul(&weight_t)?;
        if let Some(bias) = &self.bias {
            output = output.broadcast_add(bias)?;
        }

        let mut out_dims = dims[..dims.len() - 1].to_vec();
        out_dims.push(self.config.total_output_dim());
        output.reshape(out_dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn forward_preserves_leading_layout() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(6, 4);
        let linear = Linear::with_init(config, &LinearInit::Normal { std: 0.02 }, &device, DType::F32)?;

        let seq_major = Tensor::randn(0f32, 1.0, (3, 2, 6), &device)?;
        let out = linear.forward(&seq_major)?;
        assert_eq!(out.dims(), &[3, 2, 4]);

        let rank2 = Tensor::randn(0f32, 1.0, (5, 6), &device)?;
        let out = linear.forward(&rank2)?;
        assert_eq!(out.dims(), &[5, 4]);
        Ok(())
    }

    #[test]
    fn fused_projection_packs_last_axis() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig {
            input_dim: 8,
            output_dim: 4,
            bias: false,
            fused_projections: 3,
        };
        let linear =
            Linear::with_init(config, &LinearInit::XavierUniform, &device, DType::F32)?;
        let input = Tensor::randn(0f32, 1.0, (2, 1, 8), &device)?;
        let out = linear.forward(&input)?;
        assert_eq!(out.dims(), &[2, 1, 12]);
        Ok(())
    }

    #[test]
    fn checkpoint_shape_mismatch_is_fatal() {
        let device = Device::Cpu;
        let config = LinearConfig::new(8, 4);
        let bad_weight = Tensor::zeros((4, 6), DType::F32, &device).unwrap();
        assert!(Linear::new(config, bad_weight, None).is_err());
    }

    #[test]
    fn bias_contract_is_enforced_both_ways() {
        let device = Device::Cpu;
        let weight = Tensor::zeros((4, 8), DType::F32, &device).unwrap();
        let bias = Tensor::zeros(4, DType::F32, &device).unwrap();

        let no_bias = LinearConfig::new(8, 4);
        assert!(Linear::new(no_bias.clone(), weight.clone(), Some(bias.clone())).is_err());

        let with_bias = LinearConfig {
            bias: true,
            ..no_bias
        };
        assert!(Linear::new(with_bias, weight, None).is_err());
    }
}
