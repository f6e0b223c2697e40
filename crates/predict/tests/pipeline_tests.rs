use std::fs;

use anyhow::Result;
use candle_core::safetensors::save;
use candle_core::{DType, Device};
use model::weights::zeroed_checkpoint;
use model::{
    AttentionVariant, BiasSharing, EngineConfig, TraceMode,
};
use predict::{run_prediction, PredictConfig};

fn engine_config() -> EngineConfig {
    EngineConfig {
        concept_vocab_size: 12,
        question_vocab_size: 40,
        response_vocab_size: 2,
        mode: TraceMode::Concepts,
        d_model: 16,
        d_embed: 16,
        n_head: 2,
        d_head: 8,
        d_inner: 32,
        n_layer: 2,
        mem_len: 4,
        tgt_len: 4,
        dropout: None,
        dropatt: None,
        layer_norm_epsilon: 1e-5,
        pre_norm: false,
        bias_sharing: BiasSharing::Tied,
        attn_variant: AttentionVariant::RelativeShift,
        same_length: false,
        clamp_len: None,
        mask_token: 2,
        eos_token: 3,
        dtype: DType::F32,
        device: Device::Cpu,
    }
}

fn config_json(checkpoint: &str, output_dir: &str) -> String {
    format!(
        r#"{{
        "model": {{
            "concept_vocab_size": 12,
            "question_vocab_size": 40,
            "response_vocab_size": 2,
            "mode": "concepts",
            "d_model": 16,
            "d_embed": 16,
            "n_head": 2,
            "d_head": 8,
            "d_inner": 32,
            "n_layer": 2,
            "mem_len": 4,
            "tgt_len": 4,
            "mask_token": 2,
            "eos_token": 3
        }},
        "checkpoint": "{checkpoint}",
        "output_dir": "{output_dir}"
    }}"#
    )
}

#[test]
fn pipeline_predicts_a_full_history_in_chunks() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();

    let checkpoint_path = root.join("model.safetensors");
    let tensors = zeroed_checkpoint(&engine_config())?;
    save(&tensors, &checkpoint_path)?;

    let config_path = root.join("predict.json");
    fs::write(
        &config_path,
        config_json(
            checkpoint_path.to_str().unwrap(),
            root.join("out").to_str().unwrap(),
        ),
    )?;

    // Ten interactions: two full chunks of four plus a remainder of two.
    let input_path = root.join("interactions.csv");
    fs::write(
        &input_path,
        "uid,questions,concepts,responses\n\
         u1,\"1,2,3,4,5,6,7,8,9,10\",\"0,1,2,3,4,5,6,7,8,9\",\"0,1,0,1,0,1,0,1,0,1\"\n",
    )?;

    let config = PredictConfig::from_path(&config_path)?;
    let output = run_prediction(&config, &input_path, "u1")?;

    let written = fs::read_to_string(&output)?;
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines[0], "question,concept,predicted_response");
    assert_eq!(lines.len(), 11, "one header plus ten predictions");
    for line in &lines[1..] {
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 3);
        let predicted: i64 = fields[2].parse()?;
        assert!((0..4).contains(&predicted));
    }
    Ok(())
}

#[test]
fn unknown_learner_fails_cleanly() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path();

    let checkpoint_path = root.join("model.safetensors");
    save(&zeroed_checkpoint(&engine_config())?, &checkpoint_path)?;

    let config_path = root.join("predict.json");
    fs::write(
        &config_path,
        config_json(
            checkpoint_path.to_str().unwrap(),
            root.join("out").to_str().unwrap(),
        ),
    )?;
    let input_path = root.join("interactions.csv");
    fs::write(
        &input_path,
        "uid,questions,concepts,responses\nu1,\"1\",\"0\",\"1\"\n",
    )?;

    let config = PredictConfig::from_path(&config_path)?;
    assert!(run_prediction(&config, &input_path, "ghost").is_err());
    Ok(())
}
