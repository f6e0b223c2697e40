//! Vocabulary-partitioned adaptive embedding.
//!
//! Ordered cutoffs split `[0, vocab)` into partitions embedded at
//! geometrically shrinking dimensions (`d_embed / div_val^i`), each with a
//! linear projection back up to the shared `d_proj`. Results are scattered
//! back into input order and scaled by `sqrt(d_proj)`. The partitioning is
//! a frequency convention (low ids are frequent), but the mechanism only
//! needs cutoffs that are strictly increasing and exhaustive.

use candle_core::{DType, Device, Error, Result, Tensor};
use layers::checks;

/// Static description of the partitioned vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptiveEmbeddingConfig {
    /// Total vocabulary size.
    pub n_token: usize,
    /// Embedding dimension of the first (most frequent) partition.
    pub d_embed: usize,
    /// Shared output dimension after projection.
    pub d_proj: usize,
    /// Interior cutoff boundaries, strictly increasing, each `< n_token`.
    pub cutoffs: Vec<usize>,
    /// Division factor applied to `d_embed` per successive partition.
    pub div_val: usize,
}

impl AdaptiveEmbeddingConfig {
    /// Partition boundaries as `[0, cutoffs…, n_token]`.
    pub fn boundaries(&self) -> Vec<usize> {
        let mut ends = Vec::with_capacity(self.cutoffs.len() + 2);
        ends.push(0);
        ends.extend_from_slice(&self.cutoffs);
        ends.push(self.n_token);
        ends
    }

    /// Number of partitions.
    pub fn n_partitions(&self) -> usize {
        self.cutoffs.len() + 1
    }

    /// Embedding dimension used inside partition `index`.
    pub fn partition_dim(&self, index: usize) -> usize {
        self.d_embed / self.div_val.pow(index as u32)
    }

    /// Validates the partition layout.
    pub fn validate(&self) -> Result<()> {
        if self.n_token == 0 {
            return Err(Error::Msg("adaptive embedding requires n_token > 0".into()));
        }
        if self.d_embed == 0 || self.d_proj == 0 {
            return Err(Error::Msg(
                "adaptive embedding requires d_embed > 0 and d_proj > 0".into(),
            ));
        }
        if self.div_val == 0 {
            return Err(Error::Msg("adaptive embedding requires div_val >= 1".into()));
        }
        let boundaries = self.boundaries();
        for window in boundaries.windows(2) {
            if window[1] <= window[0] {
                return Err(Error::Msg(format!(
                    "cutoffs must be strictly increasing and below n_token, got {:?} (n_token {})",
                    self.cutoffs, self.n_token
                )));
            }
        }
        for index in 0..self.n_partitions() {
            if self.partition_dim(index) == 0 {
                return Err(Error::Msg(format!(
                    "partition {index} collapses to dimension 0 (d_embed {}, div_val {})",
                    self.d_embed, self.div_val
                )));
            }
        }
        Ok(())
    }
}

/// Embedding lookup routing each id to its vocabulary partition.
#[derive(Debug, Clone)]
pub struct AdaptiveEmbedding {
    config: AdaptiveEmbeddingConfig,
    emb_layers: Vec<Tensor>,
    emb_projs: Vec<Tensor>,
    emb_scale: f64,
}

impl AdaptiveEmbedding {
    /// Wraps checkpoint parameters: one `(rows_i, d_emb_i)` table and one
    /// `(d_emb_i, d_proj)` projection per partition.
    pub fn new(
        config: AdaptiveEmbeddingConfig,
        emb_layers: Vec<Tensor>,
        emb_projs: Vec<Tensor>,
    ) -> Result<Self> {
        config.validate()?;
        let partitions = config.n_partitions();
        if emb_layers.len() != partitions || emb_projs.len() != partitions {
            return Err(Error::Msg(format!(
                "expected {partitions} embedding tables and projections, got {} and {}",
                emb_layers.len(),
                emb_projs.len()
            )));
        }
        let boundaries = config.boundaries();
        for index in 0..partitions {
            let rows = boundaries[index + 1] - boundaries[index];
            let dim = config.partition_dim(index);
            checks::expect_shape(
                &format!("adaptive_embedding.layer.{index}"),
                &emb_layers[index],
                &[rows, dim],
            )?;
            checks::expect_shape(
                &format!("adaptive_embedding.proj.{index}"),
                &emb_projs[index],
                &[dim, config.d_proj],
            )?;
        }
        let emb_scale = (config.d_proj as f64).sqrt();
        Ok(Self {
            config,
            emb_layers,
            emb_projs,
            emb_scale,
        })
    }

    /// Builds randomly initialised tables for every partition.
    pub fn with_init(
        config: AdaptiveEmbeddingConfig,
        std: f64,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let boundaries = config.boundaries();
        let mut emb_layers = Vec::with_capacity(config.n_partitions());
        let mut emb_projs = Vec::with_capacity(config.n_partitions());
        for index in 0..config.n_partitions() {
            let rows = boundaries[index + 1] - boundaries[index];
            let dim = config.partition_dim(index);
            emb_layers.push(Tensor::randn(0f32, std as f32, (rows, dim), device)?);
            emb_projs.push(Tensor::randn(0f32, std as f32, (dim, config.d_proj), device)?);
        }
        Self::new(config, emb_layers, emb_projs)
    }

    /// Returns the partition configuration.
    pub fn config(&self) -> &AdaptiveEmbeddingConfig {
        &self.config
    }

    /// Scale factor applied to the scattered output.
    pub fn scale(&self) -> f64 {
        self.emb_scale
    }

    /// Returns the embedding table of partition `index`.
    pub fn partition_table(&self, index: usize) -> Option<&Tensor> {
        self.emb_layers.get(index)
    }

    /// Returns the up-projection of partition `index`.
    pub fn partition_projection(&self, index: usize) -> Option<&Tensor> {
        self.emb_projs.get(index)
    }

    /// Resolves the partition containing `id`, rejecting ids outside the
    /// vocabulary with the offending value.
    pub fn partition_index(&self, id: i64) -> Result<usize> {
        if id < 0 || id >= self.config.n_token as i64 {
            return Err(Error::Msg(format!(
                "id {id} is outside the vocabulary [0, {})",
                self.config.n_token
            )));
        }
        let boundaries = self.config.boundaries();
        for index in 0..self.config.n_partitions() {
            if (id as usize) < boundaries[index + 1] {
                return Ok(index);
            }
        }
        unreachable!("boundaries end at n_token");
    }

    /// Looks up projected embeddings for integer ids of any leading layout,
    /// returning `(…, d_proj)` scaled by `sqrt(d_proj)`.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        if !ids.dtype().is_int() {
            return Err(Error::Msg(format!(
                "adaptive_embedding.ids: expected integer dtype, got {:?}",
                ids.dtype()
            )));
        }
        let device = ids.device().clone();
        let dims = ids.dims().to_vec();
        let flat = ids.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
        let d_proj = self.config.d_proj;
        let boundaries = self.config.boundaries();

        let mut out = vec![0f32; flat.len() * d_proj];
        for index in 0..self.config.n_partitions() {
            let (low, high) = (boundaries[index] as i64, boundaries[index + 1] as i64);
            let mut positions = Vec::new();
            let mut local_ids = Vec::new();
            for (pos, &id) in flat.iter().enumerate() {
                if id < 0 || id >= self.config.n_token as i64 {
                    return Err(Error::Msg(format!(
                        "id {id} is outside the vocabulary [0, {})",
                        self.config.n_token
                    )));
                }
                if id >= low && id < high {
                    positions.push(pos);
                    local_ids.push(id - low);
                }
            }
            if positions.is_empty() {
                continue;
            }
            let local = Tensor::from_vec(local_ids, positions.len(), &device)?;
            let gathered = self.emb_layers[index]
                .to_dtype(DType::F32)?
                .index_select(&local, 0)?;
            let projected = gathered.matmul(&self.emb_projs[index].to_dtype(DType::F32)?)?;
            let rows = projected.to_vec2::<f32>()?;
            for (row, &pos) in rows.iter().zip(&positions) {
                out[pos * d_proj..(pos + 1) * d_proj].copy_from_slice(row);
            }
        }

        let mut out_dims = dims;
        out_dims.push(d_proj);
        let scattered = Tensor::from_vec(out, out_dims, &device)?;
        let scaled = scattered.affine(self.emb_scale, 0.0)?;
        scaled.to_dtype(self.emb_layers[0].dtype())
    }
}
