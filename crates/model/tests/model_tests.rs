use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{
    AttentionVariant, BiasSharing, EngineConfig, ForwardOptions, MemoryState, ModelError,
    SegmentInput, SequenceEngine, TraceMode, TraceModel,
};

fn build_config(n_layer: usize, mem_len: usize) -> EngineConfig {
    EngineConfig {
        concept_vocab_size: 12,
        question_vocab_size: 30,
        response_vocab_size: 2,
        mode: TraceMode::Concepts,
        d_model: 16,
        d_embed: 16,
        n_head: 2,
        d_head: 8,
        d_inner: 32,
        n_layer,
        mem_len,
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

fn segment(device: &Device, base: i64, qlen: usize) -> (Tensor, Tensor) {
    let prompts: Vec<i64> = (0..qlen as i64).map(|i| (base + i) % 12).collect();
    let responses: Vec<i64> = (0..qlen as i64).map(|i| (base + i) % 2).collect();
    (
        Tensor::from_vec(prompts, (qlen, 1), device).unwrap(),
        Tensor::from_vec(responses, (qlen, 1), device).unwrap(),
    )
}

fn to_values(tensor: &Tensor) -> Vec<f32> {
    tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

#[test]
fn forward_is_bit_deterministic_with_dropout_disabled() -> Result<()> {
    let model = TraceModel::with_init(build_config(2, 4))?;
    let (prompts, responses) = segment(&Device::Cpu, 0, 4);

    let first = model.forward(&prompts, &responses, None, ForwardOptions::default())?;
    let second = model.forward(&prompts, &responses, None, ForwardOptions::default())?;

    assert_eq!(to_values(&first.logits), to_values(&second.logits));
    let mem_a = first.memory.unwrap();
    let mem_b = second.memory.unwrap();
    for (a, b) in mem_a.layers().iter().zip(mem_b.layers()) {
        assert_eq!(to_values(a), to_values(b));
    }
    Ok(())
}

#[test]
fn memory_length_is_bounded_across_calls() -> Result<()> {
    let mem_len = 4;
    let model = TraceModel::with_init(build_config(2, mem_len))?;
    let mut memory: Option<MemoryState> = None;

    for step in 0..6 {
        let (prompts, responses) = segment(&Device::Cpu, step * 3, 3);
        let (_, next) = model.predict(&prompts, &responses, memory.as_ref())?;
        let next = next.expect("memory enabled");
        assert_eq!(next.n_layers(), 2);
        assert!(next.memory_len() <= mem_len);
        memory = Some(next);
    }
    Ok(())
}

#[test]
fn oldest_memory_entry_comes_from_the_second_call() -> Result<()> {
    // Length-1 segments with mem_len = L: after L + 1 calls the first
    // call's contribution has been evicted, so the oldest retained
    // position equals the embedded input recorded during call #2.
    let mem_len = 3;
    let engine = SequenceEngine::with_init(build_config(1, mem_len))?;
    let mut memory: Option<MemoryState> = None;
    let mut second_call_embedding: Option<Vec<f32>> = None;

    for step in 0..(mem_len as i64 + 1) {
        let (prompts, responses) = segment(&Device::Cpu, step * 5 + 1, 1);
        let input = SegmentInput::Trace { prompts, responses };
        let options = ForwardOptions {
            output_hidden_states: true,
            ..ForwardOptions::default()
        };
        let output = engine.forward(&input, memory.as_ref(), options)?;
        if step == 1 {
            let history = output.hidden_states.as_ref().unwrap();
            second_call_embedding = Some(to_values(&history[0]));
        }
        memory = output.memory;
    }

    let memory = memory.unwrap();
    assert_eq!(memory.memory_len(), mem_len);
    let oldest = memory.layers()[0].narrow(0, 0, 1)?;
    assert_eq!(to_values(&oldest), second_call_embedding.unwrap());
    Ok(())
}

#[test]
fn first_call_caches_exactly_the_fresh_positions() -> Result<()> {
    // spec scenario: segment length 4, mem_len 4, 2 layers, no dropout.
    let engine = SequenceEngine::with_init(build_config(2, 4))?;
    let (prompts, responses) = segment(&Device::Cpu, 0, 4);
    let input = SegmentInput::Trace { prompts, responses };
    let options = ForwardOptions {
        output_hidden_states: true,
        ..ForwardOptions::default()
    };

    let output = engine.forward(&input, None, options)?;
    let memory = output.memory.unwrap();
    let history = output.hidden_states.unwrap();

    for (layer, buffer) in memory.layers().iter().enumerate() {
        assert_eq!(buffer.dims(), &[4, 1, 16]);
        assert_eq!(to_values(buffer), to_values(&history[layer]));
    }
    Ok(())
}

#[test]
fn second_call_attends_over_klen_eight() -> Result<()> {
    let engine = SequenceEngine::with_init(build_config(2, 4))?;
    let (prompts, responses) = segment(&Device::Cpu, 0, 4);
    let first = engine.forward(
        &SegmentInput::Trace {
            prompts: prompts.clone(),
            responses: responses.clone(),
        },
        None,
        ForwardOptions::default(),
    )?;

    let (prompts2, responses2) = segment(&Device::Cpu, 4, 4);
    let options = ForwardOptions {
        output_attentions: true,
        ..ForwardOptions::default()
    };
    let second = engine.forward(
        &SegmentInput::Trace {
            prompts: prompts2,
            responses: responses2,
        },
        first.memory.as_ref(),
        options,
    )?;

    let attentions = second.attentions.unwrap();
    assert_eq!(attentions.len(), 2);
    for probs in &attentions {
        assert_eq!(probs.dims(), &[1, 2, 4, 8]);
    }
    Ok(())
}

#[test]
fn single_id_stream_is_rejected_by_the_trace_encoder() -> Result<()> {
    let engine = SequenceEngine::with_init(build_config(1, 0))?;
    let tokens = Tensor::from_slice(&[0i64, 1, 2], (3, 1), &Device::Cpu)?;
    let err = engine
        .forward(
            &SegmentInput::Ids { tokens },
            None,
            ForwardOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, ModelError::Input(_)), "{err}");
    Ok(())
}

#[test]
fn mismatched_prompt_response_shapes_are_rejected() -> Result<()> {
    let engine = SequenceEngine::with_init(build_config(1, 0))?;
    let prompts = Tensor::from_slice(&[0i64, 1, 2], (3, 1), &Device::Cpu)?;
    let responses = Tensor::from_slice(&[0i64, 1], (2, 1), &Device::Cpu)?;
    let err = engine
        .forward(
            &SegmentInput::Trace { prompts, responses },
            None,
            ForwardOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, ModelError::Input(_)));
    Ok(())
}

#[test]
fn memory_layer_count_mismatch_is_fatal() -> Result<()> {
    let engine = SequenceEngine::with_init(build_config(2, 4))?;
    let bad_state = MemoryState::zeroed(1, 4, 1, 16, DType::F32, &Device::Cpu)?;
    let (prompts, responses) = segment(&Device::Cpu, 0, 4);
    let err = engine
        .forward(
            &SegmentInput::Trace { prompts, responses },
            Some(&bad_state),
            ForwardOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, ModelError::Config(_)));
    Ok(())
}

#[test]
fn disabled_memory_returns_none_and_rejects_stale_state() -> Result<()> {
    let engine = SequenceEngine::with_init(build_config(2, 0))?;
    let (prompts, responses) = segment(&Device::Cpu, 0, 4);
    let input = SegmentInput::Trace { prompts, responses };

    let output = engine.forward(&input, None, ForwardOptions::default())?;
    assert!(output.memory.is_none());

    let stale = MemoryState::zeroed(2, 4, 1, 16, DType::F32, &Device::Cpu)?;
    let err = engine
        .forward(&input, Some(&stale), ForwardOptions::default())
        .unwrap_err();
    assert!(matches!(err, ModelError::Input(_)));
    Ok(())
}

#[test]
fn embedded_input_bypasses_the_lookup_tables() -> Result<()> {
    let engine = SequenceEngine::with_init(build_config(1, 2))?;
    let hidden = Tensor::randn(0f32, 1.0, (3, 1, 16), &Device::Cpu)?;
    let output = engine.forward(
        &SegmentInput::Embedded { hidden },
        None,
        ForwardOptions::default(),
    )?;
    assert_eq!(output.last_hidden.dims(), &[3, 1, 16]);
    Ok(())
}

#[test]
fn predicted_classes_stay_in_the_response_vocabulary() -> Result<()> {
    let config = build_config(2, 4);
    let response_rows = config.response_vocab_rows();
    let model = TraceModel::with_init(config)?;
    let (prompts, responses) = segment(&Device::Cpu, 0, 4);

    let (classes, memory) = model.predict(&prompts, &responses, None)?;
    assert_eq!(classes.dims(), &[4, 1]);
    assert!(memory.is_some());
    let values = classes.flatten_all()?.to_vec1::<u32>()?;
    assert!(values.iter().all(|&c| (c as usize) < response_rows));
    Ok(())
}
