//! Shared test utilities: tiny configurations and on-disk fixture datasets.

#![allow(dead_code)]

use burn::module::{Module, ModuleVisitor, Param};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use cadence::config::{DatasetConfig, GlowTtsConfig, ModelKind, TacotronConfig, TrainConfig};
use cadence::data::features::{save_features, Matrix};
use cadence::data::{Batch, DataLoader, DatasetOptions, SequentialSampler, SpeakerSource, TtsDataset};
use cadence::text::TextFrontend;
use cadence::train::TrainData;
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub type TestBackend = NdArray<f32>;
pub type TrainBackend = Autodiff<NdArray<f32>>;

pub const NUM_MELS: usize = 4;

const SENTENCES: [&str; 8] = [
    "hello world",
    "good morning",
    "a small test",
    "the quick fox",
    "rain again",
    "we are here",
    "it is late",
    "one more line",
];

/// A configuration small enough to train on the CPU in a test.
pub fn tiny_config(kind: ModelKind, data_dir: &Path, output_dir: &Path) -> TrainConfig {
    let mut config: TrainConfig = serde_json::from_value(serde_json::json!({
        "run_name": "test-run",
        "output_path": output_dir.display().to_string(),
        "model": match kind {
            ModelKind::Tacotron => "tacotron",
            ModelKind::GlowTts => "glow_tts",
        },
    }))
    .expect("base config");

    config.audio.sample_rate = 8000;
    config.audio.num_mels = NUM_MELS;
    config.audio.fft_size = 64;
    config.audio.hop_length = 16;
    config.audio.win_length = 64;
    config.audio.mel_fmax = None;
    config.audio.griffin_lim_iters = 2;

    config.tacotron = TacotronConfig {
        r: 1,
        embedding_dim: 8,
        encoder_dim: 8,
        encoder_convs: 1,
        prenet_dims: vec![8],
        decoder_rnn_dim: 8,
        decoder_layers: 1,
        postnet_layers: 1,
        postnet_dim: 8,
        max_decoder_steps: 8,
        ..TacotronConfig::default()
    };
    config.glow_tts = GlowTtsConfig {
        hidden_channels: 8,
        encoder_layers: 1,
        duration_predictor_channels: 8,
        flow_blocks: 2,
        flow_hidden: 8,
        coupling_layers: 1,
        n_split: 2,
        ..GlowTtsConfig::default()
    };

    config.data.datasets = vec![DatasetConfig {
        path: data_dir.display().to_string(),
        meta_file_train: "metadata_train.csv".to_string(),
        meta_file_val: Some("metadata_val.csv".to_string()),
    }];
    config.data.num_loader_workers = 2;
    config.data.num_val_loader_workers = 1;

    config.optimizer.warmup_steps = 10;
    config.training.epochs = 1;
    config.training.batch_size = 2;
    config.training.eval_batch_size = 2;
    config.training.print_step = 1;
    config.training.plot_step = 1;
    config.training.save_step = 2;
    config.training.keep_checkpoints = 2;
    config.synthesis.test_sentences = vec!["hello there".to_string()];
    config
}

fn mel_matrix(frames: usize, offset: usize, fill: Option<f32>) -> Matrix {
    let data = (0..frames * NUM_MELS)
        .map(|i| fill.unwrap_or_else(|| ((i + offset) as f32 * 0.37).sin() * 0.5))
        .collect();
    Matrix {
        rows: frames,
        cols: NUM_MELS,
        data,
    }
}

/// Write `train` training and `eval` evaluation items under `dir`.
///
/// Every feature value is `fill` when given, otherwise a smooth pattern.
pub fn write_dataset(dir: &Path, train: usize, eval: usize, fill: Option<f32>) {
    let features = dir.join("features");
    fs::create_dir_all(&features).expect("features dir");
    let mut write_split = |file: &str, range: std::ops::Range<usize>| {
        let mut lines = Vec::new();
        for idx in range {
            let name = format!("utt_{idx}.safetensors");
            let frames = 4 + idx % 3;
            save_features(&features.join(&name), &mel_matrix(frames, idx, fill), None)
                .expect("write features");
            let speaker = if idx % 2 == 0 { "alice" } else { "bob" };
            lines.push(format!("features/{name}|{}|{speaker}", SENTENCES[idx % SENTENCES.len()]));
        }
        fs::write(dir.join(file), lines.join("\n")).expect("write metadata");
    };
    write_split("metadata_train.csv", 0..train);
    write_split("metadata_val.csv", train..train + eval);
}

/// Training data in file order for a single-rank run.
pub fn train_data(config: &TrainConfig) -> TrainData {
    let frontend = TextFrontend::from_config(&config.data).expect("frontend");
    let (train, eval) = cadence::data::load_meta_data(&config.data.datasets, 0, 0).expect("metadata");
    let options = DatasetOptions::from_config(
        &config.data,
        config.audio.num_mels,
        config.frame_multiple(),
        config.r(),
        SpeakerSource::None,
        None,
    );
    let train = Arc::new(TtsDataset::new(train, &frontend, options.clone()).expect("train set"));
    let eval = Arc::new(TtsDataset::new(eval, &frontend, options).expect("eval set"));
    TrainData {
        train_sampler: Box::new(SequentialSampler::new(train.len())),
        train: DataLoader::new(train, config.training.batch_size, 1, 1),
        eval: Some((
            DataLoader::new(Arc::clone(&eval), config.training.eval_batch_size, 1, 1),
            Box::new(SequentialSampler::new(eval.len())),
        )),
    }
}

/// First training batch of `data`.
pub fn first_batch(data: &TrainData) -> Batch {
    let indices: Vec<usize> = (0..data.train.dataset().len()).collect();
    data.train
        .epoch(&indices)
        .next()
        .expect("one batch")
        .expect("collate")
}

pub fn device() -> NdArrayDevice {
    NdArrayDevice::default()
}

#[derive(Default)]
struct Snapshot {
    values: Vec<f32>,
}

impl<B: Backend> ModuleVisitor<B> for Snapshot {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.values.extend(param.val().into_data().iter::<f32>());
    }
}

/// Every parameter value of `module` in visiting order.
pub fn parameter_values<B: Backend, M: Module<B>>(module: &M) -> Vec<f32> {
    let mut snapshot = Snapshot::default();
    module.visit(&mut snapshot);
    snapshot.values
}

/// Assert two tensor data slices are element-wise close within tolerance.
pub fn assert_close(a: &TensorData, b: &TensorData, tol: f32) {
    let a_slice = a.as_slice::<f32>().expect("a slice");
    let b_slice = b.as_slice::<f32>().expect("b slice");
    assert_eq!(
        a_slice.len(),
        b_slice.len(),
        "tensor length mismatch: {} vs {}",
        a_slice.len(),
        b_slice.len()
    );
    for (idx, (x, y)) in a_slice.iter().zip(b_slice.iter()).enumerate() {
        if (x - y).abs() > tol {
            panic!(
                "mismatch at {idx}: {x} vs {y} (diff: {}, tol: {tol})",
                (x - y).abs()
            );
        }
    }
}
