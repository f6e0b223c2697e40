use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{
    weights::zeroed_checkpoint, AttentionVariant, BiasSharing, EngineConfig, ModelError,
    TraceMode, TraceModel,
};

fn build_config(bias_sharing: BiasSharing) -> EngineConfig {
    EngineConfig {
        concept_vocab_size: 8,
        question_vocab_size: 20,
        response_vocab_size: 2,
        mode: TraceMode::Concepts,
        d_model: 8,
        d_embed: 8,
        n_head: 2,
        d_head: 4,
        d_inner: 16,
        n_layer: 2,
        mem_len: 4,
        tgt_len: 4,
        dropout: None,
        dropatt: None,
        layer_norm_epsilon: 1e-5,
        pre_norm: false,
        bias_sharing,
        attn_variant: AttentionVariant::RelativeShift,
        same_length: false,
        clamp_len: None,
        mask_token: 2,
        eos_token: 3,
        dtype: DType::F32,
        device: Device::Cpu,
    }
}

#[test]
fn full_checkpoint_builds_and_runs() -> Result<()> {
    for sharing in [BiasSharing::Tied, BiasSharing::Untied] {
        let config = build_config(sharing);
        let tensors = zeroed_checkpoint(&config)?;
        let model = TraceModel::from_tensors(config, tensors)?;

        let prompts = Tensor::from_slice(&[0i64, 1, 2, 3], (4, 1), &Device::Cpu)?;
        let responses = Tensor::from_slice(&[0i64, 1, 0, 1], (4, 1), &Device::Cpu)?;
        let (classes, memory) = model.predict(&prompts, &responses, None)?;
        assert_eq!(classes.dims(), &[4, 1]);
        assert_eq!(memory.unwrap().memory_len(), 4);
    }
    Ok(())
}

#[test]
fn missing_tensor_is_reported_by_name() -> Result<()> {
    let config = build_config(BiasSharing::Tied);
    let mut tensors = zeroed_checkpoint(&config)?;
    tensors.remove("layers.1.attn.r_net.weight");

    let err = TraceModel::from_tensors(config, tensors).unwrap_err();
    assert!(matches!(err, ModelError::Checkpoint(_)));
    assert!(err.to_string().contains("layers.1.attn.r_net.weight"));
    Ok(())
}

#[test]
fn unconsumed_tensor_is_rejected() -> Result<()> {
    let config = build_config(BiasSharing::Tied);
    let mut tensors = zeroed_checkpoint(&config)?;
    tensors.insert(
        "layers.7.attn.qkv_net.weight".to_string(),
        Tensor::zeros((1, 1), DType::F32, &Device::Cpu)?,
    );

    let err = TraceModel::from_tensors(config, tensors).unwrap_err();
    assert!(err.to_string().contains("layers.7.attn.qkv_net.weight"));
    Ok(())
}

#[test]
fn mis_shaped_tensor_fails_at_construction() -> Result<()> {
    let config = build_config(BiasSharing::Tied);
    let mut tensors = zeroed_checkpoint(&config)?;
    tensors.insert(
        "head.decoder.weight".to_string(),
        Tensor::zeros((3, 3), DType::F32, &Device::Cpu)?,
    );

    assert!(TraceModel::from_tensors(config, tensors).is_err());
    Ok(())
}
