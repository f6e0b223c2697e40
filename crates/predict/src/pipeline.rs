//! The chunked forward loop.
//!
//! Segments of `tgt_len` interactions run through the model one after
//! another; the memory state returned by each call feeds the next, so the
//! attention context covers the whole history without reprocessing it.

use std::path::{Path, PathBuf};

use candle_core::{safetensors::load, Tensor};
use model::{MemoryState, TraceMode, TraceModel};

use crate::{
    config::{PredictConfig, PredictError},
    data::{apply_evaluation_mask, read_learner_record, write_predictions},
};

/// Runs the full pipeline for one learner and returns the output path.
pub fn run_prediction(
    config: &PredictConfig,
    input: &Path,
    uid: &str,
) -> Result<PathBuf, PredictError> {
    let engine_config = config.resolve_engine_config()?;
    engine_config.validate()?;

    let tensors = load(&config.checkpoint, &engine_config.device)?;
    let model = TraceModel::from_tensors(engine_config, tensors)?;
    let model_config = model.config();

    let record = read_learner_record(input, uid)?;
    let prompts: &[i64] = match model_config.mode {
        TraceMode::Concepts => &record.concepts,
        TraceMode::Questions => &record.questions,
    };
    let (masked_responses, _labels) = apply_evaluation_mask(
        &record.responses,
        model_config.mask_token,
        model_config.eos_token,
    );

    log::info!(
        "predicting {} interactions for '{uid}' in chunks of {}",
        record.responses.len(),
        model_config.tgt_len
    );

    let tgt_len = model_config.tgt_len;
    let device = model_config.device.clone();
    let mut memory: Option<MemoryState> = None;
    let mut predictions: Vec<i64> = Vec::with_capacity(record.responses.len());

    for (prompt_chunk, response_chunk) in prompts.chunks(tgt_len).zip(masked_responses.chunks(tgt_len)) {
        let qlen = prompt_chunk.len();
        let prompt_ids = Tensor::from_slice(prompt_chunk, (qlen, 1), &device)?;
        let response_ids = Tensor::from_slice(response_chunk, (qlen, 1), &device)?;

        let (classes, next_memory) =
            model.predict(&prompt_ids, &response_ids, memory.as_ref())?;
        memory = next_memory;

        let chunk_predictions = classes.flatten_all()?.to_vec1::<u32>()?;
        predictions.extend(chunk_predictions.into_iter().map(i64::from));
    }

    let output_dir = match &config.output_dir {
        Some(dir) => dir.clone(),
        None => input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    write_predictions(&output_dir, &record, &predictions)
}
