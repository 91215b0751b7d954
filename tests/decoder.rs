mod common;

use burn::tensor::{Distribution, Tensor};
use cadence::config::{AttentionConfig, AttentionKind, AttentionNorm};
use cadence::data::stop_labels;
use cadence::model::DecoderConfig;
use cadence::modules::attention::AttentionStrategy;
use common::{device, TestBackend};

const ENCODER_DIM: usize = 6;
const FRAMES: usize = 3;

fn original_attention_decoder(max_decoder_steps: usize) -> DecoderConfig {
    DecoderConfig {
        in_channels: ENCODER_DIM,
        frame_channels: FRAMES,
        r: 1,
        memory_size: 0,
        prenet_dims: vec![8, 4],
        prenet_always_dropout: true,
        rnn_dim: 8,
        layers: 1,
        attention_dim: 8,
        strategy: AttentionStrategy::from_config(&AttentionConfig {
            kind: AttentionKind::Original,
            norm: AttentionNorm::Softmax,
            ..AttentionConfig::default()
        }),
        separate_stopnet: true,
        stop_threshold: 0.5,
        stop_patience: 1,
        max_decoder_steps,
    }
}

#[test]
fn teacher_forced_decoding_yields_distributions_and_stop_logits() {
    let device = device();
    let decoder = original_attention_decoder(50).init::<TestBackend>(&device);
    let inputs = Tensor::<TestBackend, 3>::random([2, 4, ENCODER_DIM], Distribution::Normal(0.0, 1.0), &device);
    let targets = Tensor::<TestBackend, 3>::random([2, 6, FRAMES], Distribution::Normal(0.0, 1.0), &device);

    let out = decoder.forward(inputs, targets, None, true);

    assert_eq!(out.frames.dims(), [2, 6, FRAMES]);
    assert_eq!(out.alignments.dims(), [2, 6, 4]);
    assert_eq!(out.stop_logits.dims(), [2, 6]);
    let sums: Vec<f32> = out.alignments.clone().sum_dim(2).into_data().iter::<f32>().collect();
    assert_eq!(sums.len(), 12);
    for sum in sums {
        assert!((sum - 1.0).abs() < 1e-4, "alignment row sums to {sum}");
    }
    let weights: Vec<f32> = out.alignments.into_data().iter::<f32>().collect();
    assert!(weights.iter().all(|w| (0.0..=1.0 + 1e-6).contains(w)));
    assert_eq!(stop_labels(6, 6, 1), vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
}

#[test]
fn free_running_decoding_never_exceeds_its_step_limit() {
    let device = device();
    let mut config = original_attention_decoder(5);
    // Sigmoid output never exceeds 1, so no item can vote to stop.
    config.stop_threshold = 1.5;
    let decoder = config.init::<TestBackend>(&device);
    let inputs = Tensor::<TestBackend, 3>::random([2, 4, ENCODER_DIM], Distribution::Normal(0.0, 1.0), &device);

    let (out, finished) = decoder.inference(inputs, None);

    assert!(!finished);
    assert_eq!(out.steps(), 5);
    assert_eq!(out.frames.dims(), [2, 5, FRAMES]);
}

#[test]
fn resumed_inference_respects_the_shared_step_budget() {
    let device = device();
    let mut config = original_attention_decoder(4);
    // Wide location kernel over a three-token input.
    config.strategy = AttentionStrategy::from_config(&AttentionConfig::default());
    config.memory_size = 2;
    config.stop_threshold = 1.5;
    let decoder = config.init::<TestBackend>(&device);
    let inputs = Tensor::<TestBackend, 3>::random([1, 3, ENCODER_DIM], Distribution::Normal(0.0, 1.0), &device);

    let (first, state) = decoder.inference_truncated(inputs.clone(), None, None, 3);
    assert_eq!(first.steps(), 3);
    let (second, state) = decoder.inference_truncated(inputs.clone(), Some(state), None, 3);
    assert_eq!(second.steps(), 1);
    assert_eq!(state.steps, 4);

    let (exhausted, state) = decoder.inference_truncated(inputs, Some(state), None, 3);
    assert_eq!(state.steps, 4);
    assert!(!state.finished());
    assert_eq!(exhausted.steps(), 0);
    assert_eq!(exhausted.frames.dims(), [1, 0, FRAMES]);
    assert_eq!(exhausted.alignments.dims(), [1, 0, 3]);
}
