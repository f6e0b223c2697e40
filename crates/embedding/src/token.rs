//! Plain token embedding table.
//!
//! Used by the trace encoder, where the concept and response vocabularies
//! are small enough that vocabulary partitioning buys nothing. Ids arrive
//! shaped `(seq, batch)` and come back as `(seq, batch, d_embed)`.

use candle_core::{DType, Device, Error, Result, Tensor};
use layers::checks;

/// Configuration for a plain lookup table.
#[derive(Debug, Clone)]
pub struct TokenEmbeddingConfig {
    /// Number of distinct ids, including any reserved special tokens.
    pub vocab_size: usize,
    /// Dimensionality of each embedding vector.
    pub d_embed: usize,
}

/// Learnable token embedding table.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    config: TokenEmbeddingConfig,
    weight: Tensor,
}

impl TokenEmbedding {
    /// Wraps a checkpoint weight of shape `(vocab_size, d_embed)`.
    pub fn new(config: TokenEmbeddingConfig, weight: Tensor) -> Result<Self> {
        if config.vocab_size == 0 {
            return Err(Error::Msg("token embedding requires vocab_size > 0".into()));
        }
        if config.d_embed == 0 {
            return Err(Error::Msg("token embedding requires d_embed > 0".into()));
        }
        checks::expect_shape(
            "token_embedding.weight",
            &weight,
            &[config.vocab_size, config.d_embed],
        )?;
        Ok(Self { config, weight })
    }

    /// Builds a table with `N(0, std)` initialised parameters.
    pub fn with_init(
        config: TokenEmbeddingConfig,
        std: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = Tensor::randn(
            0f32,
            std as f32,
            (config.vocab_size, config.d_embed),
            device,
        )?
        .to_dtype(dtype)?;
        Self::new(config, weight)
    }

    /// Returns the embedding configuration.
    pub fn config(&self) -> &TokenEmbeddingConfig {
        &self.config
    }

    /// Returns a clone of the underlying weight tensor.
    pub fn weight(&self) -> Tensor {
        self.weight.clone()
    }

    /// Looks up embeddings for `(seq, batch)` integer ids.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        checks::expect_rank("token_embedding.ids", token_ids, 2)?;
        if !token_ids.dtype().is_int() {
            return Err(Error::Msg(format!(
                "token_embedding.ids: expected integer dtype, got {:?}",
                token_ids.dtype()
            )));
        }

        let dims = token_ids.dims().to_vec();
        let flat = token_ids.to_dtype(DType::I64)?.flatten_all()?;
        self.ensure_id_range(&flat)?;

        let gathered = self.weight.index_select(&flat, 0)?;
        let mut out_dims = dims;
        out_dims.push(self.config.d_embed);
        gathered.reshape(out_dims)
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        if flat_ids.elem_count() == 0 {
            return Ok(());
        }
        let min_id = flat_ids.min_all()?.to_scalar::<i64>()?;
        if min_id < 0 {
            return Err(Error::Msg(format!(
                "token id {min_id} is negative"
            )));
        }
        let max_id = flat_ids.max_all()?.to_scalar::<i64>()?;
        let vocab = self.config.vocab_size as i64;
        if max_id >= vocab {
            return Err(Error::Msg(format!(
                "token id {max_id} exceeds vocab size {vocab}"
            )));
        }
        Ok(())
    }
}
