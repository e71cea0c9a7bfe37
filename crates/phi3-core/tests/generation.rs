//! End-to-end behavior of the model on tiny random weights.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use phi3_core::prelude::*;
use proptest::prelude::*;

const TOLERANCE: f32 = 1e-4;

fn tiny_config() -> ModelConfig {
    ModelConfig {
        initializer_range: 0.1,
        ..ModelConfig::tiny()
    }
}

fn build(config: &ModelConfig) -> (VarMap, Phi3Model) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = Phi3Model::new(config, vb).unwrap();
    (varmap, model)
}

fn ids(rows: &[&[u32]]) -> Tensor {
    let seq = rows[0].len();
    let flat: Vec<u32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Tensor::from_vec(flat, (rows.len(), seq), &Device::Cpu).unwrap()
}

fn logits(model: &Phi3Model, input_ids: Tensor) -> Tensor {
    model
        .forward(&ForwardInputs::from_ids(input_ids), None)
        .unwrap()
        .logits
}

fn max_diff(a: &Tensor, b: &Tensor) -> f32 {
    assert_eq!(a.dims(), b.dims());
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap()
}

/// Full pass, then the same tokens fed through the cache in `chunks`.
fn cached_logits(model: &Phi3Model, tokens: &[u32], chunks: &[usize]) -> Tensor {
    let mut cache = model.init_cache(1, tokens.len()).unwrap();
    let mut outputs = Vec::new();
    let mut start = 0;
    for &width in chunks {
        let step = ids(&[&tokens[start..start + width]]);
        let out = model
            .forward(&ForwardInputs::from_ids(step), Some(&mut cache))
            .unwrap();
        outputs.push(out.logits);
        start += width;
        assert_eq!(cache.seq_len(), start);
    }
    Tensor::cat(&outputs, 1).unwrap()
}

#[test]
fn later_tokens_do_not_change_earlier_logits() {
    let (_varmap, model) = build(&tiny_config());
    let a = logits(&model, ids(&[&[5, 9, 12, 3, 40, 7]]));
    let b = logits(&model, ids(&[&[5, 9, 12, 30, 41, 8]]));

    let prefix_a = a.narrow(1, 0, 3).unwrap();
    let prefix_b = b.narrow(1, 0, 3).unwrap();
    assert!(max_diff(&prefix_a, &prefix_b) < 1e-6);

    // The change itself is visible from position 3 on
    assert!(max_diff(&a.narrow(1, 3, 1).unwrap(), &b.narrow(1, 3, 1).unwrap()) > 1e-6);
}

#[test]
fn sliding_window_hides_tokens_outside_the_window() {
    let config = ModelConfig {
        num_hidden_layers: 1,
        sliding_window: Some(2),
        ..tiny_config()
    };
    let (_varmap, model) = build(&config);

    // Position 3 sees positions 2 and 3 only
    let a = logits(&model, ids(&[&[5, 9, 12, 3]]));
    let b = logits(&model, ids(&[&[50, 9, 12, 3]]));
    let last_a = a.narrow(1, 3, 1).unwrap();
    let last_b = b.narrow(1, 3, 1).unwrap();
    assert!(max_diff(&last_a, &last_b) < 1e-6);

    // Position 1 still sees position 0
    assert!(max_diff(&a.narrow(1, 1, 1).unwrap(), &b.narrow(1, 1, 1).unwrap()) > 1e-6);
}

#[test]
fn token_by_token_decoding_matches_full_pass() {
    let (_varmap, model) = build(&tiny_config());
    let tokens = [3u32, 17, 25, 8, 60, 11, 4];

    let full = logits(&model, ids(&[tokens.as_slice()]));
    let incremental = cached_logits(&model, &tokens, &[1; 7]);
    assert!(max_diff(&full, &incremental) < TOLERANCE);
}

#[test]
fn prefill_then_steps_matches_full_pass() {
    let (_varmap, model) = build(&tiny_config());
    let tokens = [3u32, 17, 25, 8, 60, 11, 4, 9];

    let full = logits(&model, ids(&[tokens.as_slice()]));
    let incremental = cached_logits(&model, &tokens, &[5, 1, 2]);
    assert!(max_diff(&full, &incremental) < TOLERANCE);
}

#[test]
fn windowed_decoding_matches_full_pass() {
    let config = ModelConfig {
        sliding_window: Some(3),
        ..tiny_config()
    };
    let (_varmap, model) = build(&config);
    let tokens = [3u32, 17, 25, 8, 60, 11, 4, 9];

    let full = logits(&model, ids(&[tokens.as_slice()]));
    let incremental = cached_logits(&model, &tokens, &[4, 1, 1, 1, 1]);
    assert!(max_diff(&full, &incremental) < TOLERANCE);
}

#[test]
fn every_kv_head_count_decodes_consistently() {
    // 1: multi-query, 2: grouped, 4: one kv head per query head
    for kv_heads in [1usize, 2, 4] {
        let config = ModelConfig {
            num_key_value_heads: Some(kv_heads),
            ..tiny_config()
        };
        let (_varmap, model) = build(&config);
        let tokens = [3u32, 17, 25, 8, 60, 11];

        let full = logits(&model, ids(&[tokens.as_slice()]));
        let incremental = cached_logits(&model, &tokens, &[3, 1, 2]);
        assert!(
            max_diff(&full, &incremental) < TOLERANCE,
            "cache mismatch with {kv_heads} kv heads"
        );

        let changed = logits(&model, ids(&[&[3, 17, 25, 40, 2, 9]]));
        assert!(
            max_diff(&full.narrow(1, 0, 3).unwrap(), &changed.narrow(1, 0, 3).unwrap()) < 1e-6,
            "future tokens leaked with {kv_heads} kv heads"
        );
    }
}

#[test]
fn forked_cache_does_not_disturb_the_original() {
    let (_varmap, model) = build(&tiny_config());
    let mut cache = model.init_cache(1, 5).unwrap();
    model
        .forward(&ForwardInputs::from_ids(ids(&[&[5, 7, 9]])), Some(&mut cache))
        .unwrap();

    let mut branch = cache.fork().unwrap();
    let step = |cache: &mut KvCache, token: u32| {
        model
            .forward(&ForwardInputs::from_ids(ids(&[&[token]])), Some(cache))
            .unwrap()
            .logits
    };
    step(&mut cache, 11);
    step(&mut branch, 40);
    let last = step(&mut cache, 13);

    let full = logits(&model, ids(&[&[5, 7, 9, 11, 13]]));
    assert!(max_diff(&full.narrow(1, 4, 1).unwrap(), &last) < TOLERANCE);
    assert_eq!(branch.seq_len(), 4);
}

#[test]
fn left_padding_does_not_change_real_tokens() {
    let (_varmap, model) = build(&tiny_config());
    let plain = logits(&model, ids(&[&[5, 9, 12]]));

    let padded = ForwardInputs::from_ids(ids(&[&[0, 0, 5, 9, 12]]))
        .with_attention_mask(ids(&[&[0, 0, 1, 1, 1]]))
        .with_position_ids(ids(&[&[0, 0, 0, 1, 2]]));
    let out = model.forward(&padded, None).unwrap().logits;

    let real = out.narrow(1, 2, 3).unwrap();
    assert!(max_diff(&plain, &real) < TOLERANCE);

    // Fully masked rows stay finite
    let all: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
    assert!(all.iter().all(|v| v.is_finite()));
}

#[test]
fn padded_batch_decodes_with_cache() {
    let (_varmap, model) = build(&tiny_config());
    let mut cache = model.init_cache(2, 6).unwrap();

    // Row 0 is left-padded by one position; the mask covers the whole session
    let session_mask = ids(&[&[0, 1, 1, 1, 1, 1], &[1, 1, 1, 1, 1, 1]]);
    let prefill = ForwardInputs::from_ids(ids(&[&[0, 5, 9], &[4, 5, 9]]))
        .with_attention_mask(session_mask.clone())
        .with_position_ids(ids(&[&[0, 0, 1], &[0, 1, 2]]));
    model.forward(&prefill, Some(&mut cache)).unwrap();

    let step = ForwardInputs::from_ids(ids(&[&[12], &[12]]))
        .with_attention_mask(session_mask)
        .with_position_ids(ids(&[&[2], &[3]]));
    let cached = model.forward(&step, Some(&mut cache)).unwrap().logits;
    assert_eq!(cached.dims(), &[2, 1, 64]);
    assert_eq!(cache.seq_len(), 4);

    let row0 = logits(&model, ids(&[&[5, 9, 12]])).narrow(1, 2, 1).unwrap();
    assert!(max_diff(&cached.narrow(0, 0, 1).unwrap(), &row0) < TOLERANCE);
}

#[test]
fn sequence_classification_pools_last_real_token() {
    let config = ModelConfig {
        architecture: Architecture::SequenceClassification,
        num_labels: Some(3),
        ..tiny_config()
    };
    let (_varmap, model) = build(&config);

    let padded = logits(&model, ids(&[&[5, 7, 0, 0]]));
    let unpadded = logits(&model, ids(&[&[5, 7]]));
    assert_eq!(padded.dims(), &[1, 3]);
    assert!(max_diff(&padded, &unpadded) < TOLERANCE);
}

#[test]
fn embeddings_take_precedence_over_ids() {
    let (_varmap, model) = build(&tiny_config());
    let embeds = Tensor::randn(0.0f32, 1.0, &[1, 3, 32], &Device::Cpu).unwrap();

    let only_embeds = model
        .forward(&ForwardInputs::from_embeds(embeds.clone()), None)
        .unwrap()
        .logits;
    let both = model
        .forward(
            &ForwardInputs::from_ids(ids(&[&[1, 2, 3]])).with_inputs_embeds(embeds),
            None,
        )
        .unwrap()
        .logits;
    assert_eq!(max_diff(&only_embeds, &both), 0.0);
}

#[test]
fn looked_up_embeddings_match_ids() {
    let (_varmap, model) = build(&tiny_config());
    let input_ids = ids(&[&[8, 2, 33]]);
    let embeds = model
        .embedder()
        .table()
        .index_select(&input_ids.flatten_all().unwrap(), 0)
        .unwrap()
        .unsqueeze(0)
        .unwrap();

    let from_ids = logits(&model, input_ids);
    let from_embeds = model
        .forward(&ForwardInputs::from_embeds(embeds), None)
        .unwrap()
        .logits;
    assert!(max_diff(&from_ids, &from_embeds) < 1e-6);
}

#[test]
fn token_classification_labels_every_position() {
    let config = ModelConfig {
        architecture: Architecture::TokenClassification,
        num_labels: Some(7),
        ..tiny_config()
    };
    let (_varmap, model) = build(&config);
    let out = logits(&model, ids(&[&[5, 7, 9, 11, 13], &[1, 2, 3, 4, 5]]));
    assert_eq!(out.dims(), &[2, 5, 7]);
}

#[test]
fn hidden_states_and_attentions_are_reported() {
    let (_varmap, model) = build(&tiny_config());
    let out = model
        .forward(
            &ForwardInputs::from_ids(ids(&[&[5, 7, 9]]))
                .with_hidden_states()
                .with_attentions(),
            None,
        )
        .unwrap();

    let hidden = out.hidden_states.unwrap();
    assert_eq!(hidden.len(), 3);
    assert!(hidden.iter().all(|h| h.dims() == [1, 3, 32]));
    let attentions = out.attentions.unwrap();
    assert_eq!(attentions.len(), 2);
    assert!(attentions.iter().all(|a| a.dims() == [1, 4, 3, 3]));
}

#[test]
fn zeroed_head_has_no_attention() {
    let (_varmap, model) = build(&tiny_config());
    let head_mask = Tensor::new(&[[1.0f32, 1.0, 1.0, 0.0], [1.0, 1.0, 1.0, 1.0]], &Device::Cpu)
        .unwrap();
    let out = model
        .forward(
            &ForwardInputs::from_ids(ids(&[&[5, 7, 9]]))
                .with_head_mask(head_mask)
                .with_attentions(),
            None,
        )
        .unwrap();
    let attentions = out.attentions.unwrap();

    let head3 = |block: usize| -> f32 {
        attentions[block]
            .narrow(1, 3, 1)
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    };
    assert_eq!(head3(0), 0.0);
    assert!((head3(1) - 3.0).abs() < 1e-5);
}

#[test]
fn cache_overflow_is_an_error() {
    let (_varmap, model) = build(&tiny_config());
    let mut cache = model.init_cache(1, 4).unwrap();
    model
        .forward(&ForwardInputs::from_ids(ids(&[&[5, 7, 9]])), Some(&mut cache))
        .unwrap();

    let result = model.forward(&ForwardInputs::from_ids(ids(&[&[1, 2]])), Some(&mut cache));
    assert!(matches!(
        result,
        Err(Phi3Error::CacheOverflow {
            requested: 5,
            max_length: 4
        })
    ));
    assert_eq!(cache.seq_len(), 3);
    assert_eq!(cache.remaining(), 1);
}

#[test]
fn traversed_cache_continues_the_session() {
    let (_varmap, model) = build(&tiny_config());
    let mut cache = model.init_cache(1, 8).unwrap();
    model
        .forward(&ForwardInputs::from_ids(ids(&[&[5, 7, 9]])), Some(&mut cache))
        .unwrap();

    let mut copy = cache.traverse(|t| t.copy()).unwrap();
    let step = ForwardInputs::from_ids(ids(&[&[11]]));
    let a = model.forward(&step, Some(&mut cache)).unwrap().logits;
    let b = model.forward(&step, Some(&mut copy)).unwrap().logits;
    assert_eq!(max_diff(&a, &b), 0.0);
}

#[test]
fn reset_starts_a_new_session() {
    let (_varmap, model) = build(&tiny_config());
    let mut cache = model.init_cache(1, 8).unwrap();
    let inputs = ForwardInputs::from_ids(ids(&[&[5, 7, 9]]));

    let first = model.forward(&inputs, Some(&mut cache)).unwrap().logits;
    cache.reset().unwrap();
    let second = model.forward(&inputs, Some(&mut cache)).unwrap().logits;
    assert_eq!(max_diff(&first, &second), 0.0);
}

#[test]
fn longrope_model_runs_past_original_context() {
    let config = ModelConfig {
        max_position_embeddings: 64,
        rope_scaling: Some(RopeScaling::LongRope {
            short_factor: vec![1.0, 1.0, 1.5, 2.0],
            long_factor: vec![2.0, 3.0, 4.0, 8.0],
            original_max_position_embeddings: Some(16),
        }),
        ..tiny_config()
    };
    let (_varmap, model) = build(&config);
    let tokens: Vec<u32> = (0..24).map(|i| (i * 7 % 64) as u32).collect();

    let out = logits(&model, ids(&[tokens.as_slice()]));
    assert_eq!(out.dims(), &[1, 24, 64]);
    let all: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
    assert!(all.iter().all(|v| v.is_finite()));

    // Inside the original context the short schedule is used throughout
    let short = &tokens[..12];
    let full = logits(&model, ids(&[short]));
    let incremental = cached_logits(&model, short, &[6, 3, 3]);
    assert!(max_diff(&full, &incremental) < TOLERANCE);
}

#[test]
fn config_json_builds_a_model() {
    let json = r#"{
        "architecture": "Phi3ForCausalLM",
        "vocab_size": 64,
        "hidden_size": 32,
        "intermediate_size": 64,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "max_position_embeddings": 128,
        "hidden_act": "silu",
        "rms_norm_eps": 1e-5,
        "sliding_window": 4,
        "tie_word_embeddings": true
    }"#;
    let config = ModelConfig::from_json(json).unwrap();
    let (varmap, model) = build(&config);

    assert!(!varmap.data().lock().unwrap().contains_key("lm_head.weight"));
    let out = logits(&model, ids(&[&[1, 2, 3]]));
    assert_eq!(out.dims(), &[1, 3, 64]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Any split of a sequence into cached steps reproduces the full pass.
    #[test]
    fn any_chunking_matches_full_pass(
        tokens in prop::collection::vec(0u32..64, 2..10),
        cuts in prop::collection::vec(1usize..4, 1..10),
    ) {
        let (_varmap, model) = build(&tiny_config());

        let mut chunks = Vec::new();
        let mut left = tokens.len();
        for cut in cuts {
            if left == 0 {
                break;
            }
            let width = cut.min(left);
            chunks.push(width);
            left -= width;
        }
        if left > 0 {
            chunks.push(left);
        }

        let full = logits(&model, ids(&[tokens.as_slice()]));
        let incremental = cached_logits(&model, &tokens, &chunks);
        prop_assert!(max_diff(&full, &incremental) < TOLERANCE);
    }
}
