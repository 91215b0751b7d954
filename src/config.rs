//! Training configuration.
//!
//! A [`TrainConfig`] is loaded once with [`load_config`] and passed by reference
//! into every component constructor. Nothing in the crate reads configuration
//! from global state.

use crate::error::TrainError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Which acoustic model family to train.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Attention-based autoregressive sequence-to-sequence model.
    Tacotron,
    /// Normalizing-flow based non-autoregressive model.
    GlowTts,
}

/// Attention scoring function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    /// Content-based soft attention.
    Original,
    /// Content-based attention biased by the previous and cumulative alignment.
    Location,
}

/// How attention energies are turned into weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionNorm {
    Softmax,
    Sigmoid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Attention mechanism settings for the autoregressive decoder.
pub struct AttentionConfig {
    /// Scoring function.
    pub kind: AttentionKind,
    /// Normalization of energies into weights.
    pub norm: AttentionNorm,
    /// Hidden size of the scoring MLP.
    pub attention_dim: usize,
    /// Constrain alignments with the forward-only recurrence.
    pub forward_attn: bool,
    /// Learn the forward-attention transition probability.
    pub trans_agent: bool,
    /// Force the forward-attention peak to advance slowly at inference.
    pub forward_attn_mask: bool,
    /// Restrict candidate positions to a band around the previous peak at inference.
    pub windowing: bool,
    /// Positions kept behind the previous peak when windowing.
    pub window_back: usize,
    /// Positions kept ahead of the previous peak when windowing.
    pub window_front: usize,
    /// Filters of the location convolution.
    pub location_filters: usize,
    /// Kernel size of the location convolution (odd).
    pub location_kernel: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            kind: AttentionKind::Location,
            norm: AttentionNorm::Sigmoid,
            attention_dim: 128,
            forward_attn: false,
            trans_agent: false,
            forward_attn_mask: false,
            windowing: false,
            window_back: 2,
            window_front: 6,
            location_filters: 32,
            location_kernel: 31,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Global style token layer settings.
pub struct GstConfig {
    /// Number of learned style tokens.
    pub num_tokens: usize,
    /// Width of the style embedding.
    pub embedding_dim: usize,
}

impl Default for GstConfig {
    fn default() -> Self {
        Self {
            num_tokens: 10,
            embedding_dim: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Tacotron architecture and decoding settings.
pub struct TacotronConfig {
    /// Frames predicted per decoder step.
    pub r: usize,
    /// Number of past frames fed to the prenet (0 uses only the last frame).
    pub memory_size: usize,
    /// Character embedding width.
    pub embedding_dim: usize,
    /// Encoder output width (split across both GRU directions).
    pub encoder_dim: usize,
    /// Number of encoder convolutions.
    pub encoder_convs: usize,
    /// Prenet layer widths.
    pub prenet_dims: Vec<usize>,
    /// Apply prenet dropout at training and inference time.
    pub prenet_dropout: bool,
    /// Attention settings.
    pub attention: AttentionConfig,
    /// Hidden size of the attention and decoder GRU cells.
    pub decoder_rnn_dim: usize,
    /// Number of residual decoder GRU cells.
    pub decoder_layers: usize,
    /// Detach the stop net input from the decoder graph.
    pub separate_stopnet: bool,
    /// Stop probability threshold at inference.
    pub stop_threshold: f32,
    /// Consecutive steps above the threshold required to stop.
    pub stop_patience: usize,
    /// Hard upper bound on decoder steps at inference.
    pub max_decoder_steps: usize,
    /// Train a second decoder on the time-reversed target.
    pub bidirectional_decoder: bool,
    /// Post-net convolution layers.
    pub postnet_layers: usize,
    /// Post-net channel width.
    pub postnet_dim: usize,
    /// Post-net kernel size (odd).
    pub postnet_kernel: usize,
    /// Optional global style tokens.
    pub gst: Option<GstConfig>,
    /// Speaker embedding width when more than one speaker is present.
    pub speaker_embedding_dim: usize,
}

impl Default for TacotronConfig {
    fn default() -> Self {
        Self {
            r: 2,
            memory_size: 5,
            embedding_dim: 256,
            encoder_dim: 256,
            encoder_convs: 3,
            prenet_dims: vec![256, 128],
            prenet_dropout: true,
            attention: AttentionConfig::default(),
            decoder_rnn_dim: 256,
            decoder_layers: 2,
            separate_stopnet: true,
            stop_threshold: 0.5,
            stop_patience: 1,
            max_decoder_steps: 500,
            bidirectional_decoder: false,
            postnet_layers: 3,
            postnet_dim: 256,
            postnet_kernel: 5,
            gst: None,
            speaker_embedding_dim: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Glow-TTS architecture and sampling settings.
pub struct GlowTtsConfig {
    /// Text encoder width.
    pub hidden_channels: usize,
    /// Residual convolution blocks in the text encoder.
    pub encoder_layers: usize,
    /// Text encoder kernel size (odd).
    pub encoder_kernel: usize,
    /// Dropout inside the encoder and duration predictor.
    pub dropout: f64,
    /// Predict only means (log-scales fixed to zero).
    pub mean_only: bool,
    /// Duration predictor width.
    pub duration_predictor_channels: usize,
    /// Duration predictor kernel size (odd).
    pub duration_predictor_kernel: usize,
    /// Flow steps (ActNorm, invertible mixing, coupling).
    pub flow_blocks: usize,
    /// Coupling network width.
    pub flow_hidden: usize,
    /// Coupling network kernel size (odd).
    pub flow_kernel: usize,
    /// Gated convolution layers per coupling network.
    pub coupling_layers: usize,
    /// Channel group size of the invertible mixing layer.
    pub n_split: usize,
    /// Time-to-channel squeeze factor.
    pub n_sqz: usize,
    /// Duration multiplier at inference.
    pub length_scale: f32,
    /// Prior noise multiplier at inference.
    pub noise_scale: f32,
    /// Speaker conditioning width when more than one speaker is present.
    pub speaker_embedding_dim: usize,
    /// Learn a variational utterance latent from the target mel.
    pub use_vae: bool,
    /// Width of the variational latent.
    pub vae_latent_dim: usize,
}

impl Default for GlowTtsConfig {
    fn default() -> Self {
        Self {
            hidden_channels: 192,
            encoder_layers: 4,
            encoder_kernel: 5,
            dropout: 0.1,
            mean_only: true,
            duration_predictor_channels: 256,
            duration_predictor_kernel: 3,
            flow_blocks: 12,
            flow_hidden: 192,
            flow_kernel: 5,
            coupling_layers: 4,
            n_split: 4,
            n_sqz: 2,
            length_scale: 1.0,
            noise_scale: 0.667,
            speaker_embedding_dim: 64,
            use_vae: false,
            vae_latent_dim: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Audio analysis and Griffin-Lim settings.
pub struct AudioConfig {
    pub sample_rate: u32,
    pub num_mels: usize,
    pub fft_size: usize,
    pub hop_length: usize,
    pub win_length: usize,
    pub mel_fmin: f32,
    pub mel_fmax: Option<f32>,
    pub ref_level_db: f32,
    pub min_level_db: f32,
    /// Magnitude exponent applied before Griffin-Lim.
    pub power: f32,
    pub griffin_lim_iters: usize,
    /// Normalize dB spectrograms into `[-max_norm, max_norm]` (or `[0, max_norm]`).
    pub signal_norm: bool,
    pub symmetric_norm: bool,
    pub max_norm: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            num_mels: 80,
            fft_size: 1024,
            hop_length: 256,
            win_length: 1024,
            mel_fmin: 0.0,
            mel_fmax: Some(8000.0),
            ref_level_db: 20.0,
            min_level_db: -100.0,
            power: 1.5,
            griffin_lim_iters: 60,
            signal_norm: true,
            symmetric_norm: true,
            max_norm: 4.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// One dataset root with its metadata files.
pub struct DatasetConfig {
    /// Dataset root; metadata feature paths are resolved against it.
    pub path: String,
    /// Training metadata file, relative to `path`.
    pub meta_file_train: String,
    /// Optional evaluation metadata file, relative to `path`.
    #[serde(default)]
    pub meta_file_val: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Custom symbol inventory.
pub struct CharactersConfig {
    pub pad: char,
    pub eos: char,
    pub bos: char,
    pub characters: String,
    pub punctuations: String,
}

impl Default for CharactersConfig {
    fn default() -> Self {
        Self {
            pad: '_',
            eos: '~',
            bos: '^',
            characters: "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz".to_string(),
            punctuations: "!'(),-.:;? ".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Dataset, batching and loader settings.
pub struct DataConfig {
    pub datasets: Vec<DatasetConfig>,
    /// Text cleaner name: `basic` or `english`.
    pub text_cleaner: String,
    pub characters: CharactersConfig,
    /// Wrap every sentence with BOS/EOS symbols.
    pub enable_eos_bos_chars: bool,
    /// Minimum text length (in symbols) kept for training.
    pub min_seq_len: usize,
    /// Maximum text length (in symbols) kept for training.
    pub max_seq_len: usize,
    /// Buckets of `batch_group_size * batch_size` items are shuffled internally (0 disables).
    pub batch_group_size: usize,
    pub num_loader_workers: usize,
    pub num_val_loader_workers: usize,
    /// Batches buffered per loader worker.
    pub prefetch_batches: usize,
    /// Keep only this fraction of the training items.
    pub train_portion: Option<f32>,
    /// Keep only this fraction of the evaluation items.
    pub eval_portion: Option<f32>,
    /// Held-out items when no evaluation metadata file is given.
    pub eval_split_size: usize,
    /// Condition the model on speaker identity.
    pub use_speaker_embedding: bool,
    /// JSON mapping of speaker name to a fixed embedding vector.
    pub speaker_embedding_file: Option<String>,
    /// Draw training items with inverse speaker frequency weights (single worker only).
    pub speaker_balancer_batch: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            datasets: Vec::new(),
            text_cleaner: "basic".to_string(),
            characters: CharactersConfig::default(),
            enable_eos_bos_chars: false,
            min_seq_len: 0,
            max_seq_len: 500,
            batch_group_size: 0,
            num_loader_workers: 1,
            num_val_loader_workers: 1,
            prefetch_batches: 2,
            train_portion: None,
            eval_portion: None,
            eval_split_size: 10,
            use_speaker_embedding: false,
            speaker_embedding_file: None,
            speaker_balancer_batch: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Optimizer, schedule and gradient clipping settings.
pub struct OptimizerConfig {
    pub lr: f64,
    pub beta_1: f32,
    pub beta_2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    /// Use the warmup-based noam schedule, advanced once per step.
    pub noam_schedule: bool,
    pub warmup_steps: usize,
    /// Maximum global gradient norm (stop net excluded).
    pub grad_clip: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta_1: 0.9,
            beta_2: 0.98,
            epsilon: 1e-9,
            weight_decay: 0.0,
            noam_schedule: true,
            warmup_steps: 4000,
            grad_clip: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Epoch/step cadence settings.
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub eval_batch_size: usize,
    pub print_step: usize,
    pub plot_step: usize,
    pub save_step: usize,
    /// Persist step checkpoints every `save_step`.
    pub checkpoint: bool,
    /// Step checkpoints kept on disk (older ones are pruned).
    pub keep_checkpoints: usize,
    pub print_eval: bool,
    pub run_eval: bool,
    /// Epochs before test sentences are synthesized.
    pub test_delay_epochs: usize,
    pub seed: u64,
    /// Parameter name fragments never restored from a checkpoint.
    pub reinit_layers: Vec<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 1000,
            batch_size: 32,
            eval_batch_size: 16,
            print_step: 25,
            plot_step: 100,
            save_step: 10000,
            checkpoint: true,
            keep_checkpoints: 2,
            print_eval: false,
            run_eval: true,
            test_delay_epochs: 0,
            seed: 54321,
            reinit_layers: Vec::new(),
        }
    }
}

/// Spectral reconstruction criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconstructionLoss {
    L1,
    Mse,
}

/// Shape of the KL weight over training steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KlScheduleKind {
    Constant,
    Linear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// KL weight schedule for the variational latent.
pub struct KlScheduleConfig {
    pub kind: KlScheduleKind,
    /// Final weight.
    pub weight: f32,
    /// Step at which the linear ramp starts.
    pub start_step: usize,
    /// Steps to ramp from zero to `weight`.
    pub warmup_steps: usize,
}

impl Default for KlScheduleConfig {
    fn default() -> Self {
        Self {
            kind: KlScheduleKind::Linear,
            weight: 1.0,
            start_step: 0,
            warmup_steps: 10000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Loss weights and criterion options.
pub struct LossConfig {
    pub reconstruction: ReconstructionLoss,
    pub decoder_loss_weight: f32,
    pub postnet_loss_weight: f32,
    pub stopnet_loss_weight: f32,
    pub stopnet_pos_weight: f32,
    /// Guided attention weight (0 disables).
    pub ga_alpha: f32,
    pub ga_sigma: f32,
    pub decoder_backward_weight: f32,
    pub decoder_consistency_weight: f32,
    pub duration_loss_weight: f32,
    pub kl: KlScheduleConfig,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            reconstruction: ReconstructionLoss::L1,
            decoder_loss_weight: 1.0,
            postnet_loss_weight: 1.0,
            stopnet_loss_weight: 1.0,
            stopnet_pos_weight: 10.0,
            ga_alpha: 0.0,
            ga_sigma: 0.4,
            decoder_backward_weight: 1.0,
            decoder_consistency_weight: 1.0,
            duration_loss_weight: 1.0,
            kl: KlScheduleConfig::default(),
        }
    }
}

/// Transport used to reduce gradients and metrics across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributedBackend {
    /// One OS process per rank, star topology over TCP.
    Tcp,
    /// One thread per rank inside a single process.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Distributed data-parallel settings.
pub struct DistributedConfig {
    pub world_size: usize,
    pub backend: DistributedBackend,
    /// Rendezvous address of rank 0 (`tcp://host:port`).
    pub url: String,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            backend: DistributedBackend::Tcp,
            url: "tcp://127.0.0.1:54321".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Dynamic loss scaling settings.
pub struct MixedPrecisionConfig {
    pub enabled: bool,
    pub init_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
}

impl Default for MixedPrecisionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            init_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Held-out sentence synthesis settings.
pub struct SynthesisConfig {
    /// File with one test sentence per line; overrides `test_sentences`.
    pub test_sentences_file: Option<String>,
    pub test_sentences: Vec<String>,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            test_sentences_file: None,
            test_sentences: vec![
                "It took me quite a long time to develop a voice, and now that I have it I'm not going to be silent.".to_string(),
                "Be a voice, not an echo.".to_string(),
                "I'm sorry Dave. I'm afraid I can't do that.".to_string(),
                "This cake is great. It's so delicious and moist.".to_string(),
                "Prior to November 22, 1963.".to_string(),
            ],
        }
    }
}

/// Top-level training configuration.
///
/// # Example YAML
///
/// ```yaml
/// run_name: ljspeech-glow
/// output_path: runs/
/// model: glow_tts
/// glow_tts: { flow_blocks: 12, n_sqz: 2 }
/// data:
///   datasets:
///     - { path: data/ljspeech, meta_file_train: metadata_train.csv, meta_file_val: metadata_val.csv }
/// training: { epochs: 1000, batch_size: 32, save_step: 5000 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainConfig {
    /// Experiment name, used as the output folder prefix.
    pub run_name: String,
    #[serde(default)]
    pub run_description: String,
    /// Parent folder of experiment folders.
    pub output_path: String,
    /// Model family to train.
    pub model: ModelKind,
    #[serde(default)]
    pub tacotron: TacotronConfig,
    #[serde(default)]
    pub glow_tts: GlowTtsConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
    #[serde(default)]
    pub mixed_precision: MixedPrecisionConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    /// Checkpoint this run was restored from (written into the copied config).
    #[serde(default)]
    pub restore_path: Option<String>,
}

impl TrainConfig {
    /// Frames per decoder step as seen by the data pipeline.
    pub fn r(&self) -> usize {
        match self.model {
            ModelKind::Tacotron => self.tacotron.r,
            ModelKind::GlowTts => 1,
        }
    }

    /// Mel lengths in a batch are padded to a multiple of this value.
    pub fn frame_multiple(&self) -> usize {
        match self.model {
            ModelKind::Tacotron => self.tacotron.r,
            ModelKind::GlowTts => self.glow_tts.n_sqz,
        }
    }

    /// Reject configurations the components cannot honor.
    pub fn validate(&self) -> Result<(), TrainError> {
        let fail = |msg: String| Err(TrainError::Config(msg));
        if self.run_name.trim().is_empty() {
            return fail("run_name must not be empty".to_string());
        }
        if self.data.datasets.is_empty() {
            return fail("data.datasets must list at least one dataset".to_string());
        }
        if self.training.batch_size == 0 || self.training.eval_batch_size == 0 {
            return fail("batch sizes must be > 0".to_string());
        }
        if self.training.print_step == 0
            || self.training.plot_step == 0
            || self.training.save_step == 0
        {
            return fail("print_step, plot_step and save_step must be > 0".to_string());
        }
        if self.distributed.world_size == 0 {
            return fail("distributed.world_size must be > 0".to_string());
        }
        for portion in [self.data.train_portion, self.data.eval_portion].into_iter().flatten() {
            if !(0.0..=1.0).contains(&portion) || portion == 0.0 {
                return fail(format!("data portions must be in (0, 1], got {portion}"));
            }
        }
        match self.model {
            ModelKind::Tacotron => {
                let taco = &self.tacotron;
                if taco.r == 0 {
                    return fail("tacotron.r must be > 0".to_string());
                }
                if taco.prenet_dims.is_empty() {
                    return fail("tacotron.prenet_dims must not be empty".to_string());
                }
                if taco.encoder_dim % 2 != 0 {
                    return fail("tacotron.encoder_dim must be even".to_string());
                }
                if taco.attention.trans_agent && !taco.attention.forward_attn {
                    return fail("tacotron.attention.trans_agent requires forward_attn".to_string());
                }
                if taco.attention.windowing && taco.attention.window_front == 0 {
                    return fail(
                        "tacotron.attention.window_front must be > 0 when windowing".to_string(),
                    );
                }
                if taco.attention.location_kernel % 2 == 0 || taco.postnet_kernel % 2 == 0 {
                    return fail("tacotron kernel sizes must be odd".to_string());
                }
                if taco.max_decoder_steps == 0 || taco.stop_patience == 0 {
                    return fail(
                        "tacotron.max_decoder_steps and stop_patience must be > 0".to_string(),
                    );
                }
            }
            ModelKind::GlowTts => {
                let glow = &self.glow_tts;
                let channels = self.audio.num_mels * glow.n_sqz;
                if glow.n_sqz == 0 || glow.n_split == 0 || glow.n_split % 2 != 0 {
                    return fail("glow_tts.n_sqz must be > 0 and n_split even".to_string());
                }
                if channels % glow.n_split != 0 {
                    return fail(format!(
                        "num_mels * n_sqz ({channels}) must be divisible by n_split ({})",
                        glow.n_split
                    ));
                }
                if glow.encoder_kernel % 2 == 0
                    || glow.flow_kernel % 2 == 0
                    || glow.duration_predictor_kernel % 2 == 0
                {
                    return fail("glow_tts kernel sizes must be odd".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Load a training configuration from a YAML or JSON file (chosen by extension).
///
/// # Errors
///
/// Returns an error if the file doesn't exist, fails to parse, or fails validation.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<TrainConfig> {
    let path = path.as_ref();
    if !path.exists() {
        anyhow::bail!("Config file not found: {}", path.display());
    }

    let data = fs::read_to_string(path)?;
    let config: TrainConfig = if is_json_path(path) {
        serde_json::from_str(&data)?
    } else {
        serde_yaml::from_str(&data)?
    };
    config.validate()?;
    Ok(config)
}

/// Write a configuration next to the run's checkpoints, recording the restore source.
pub fn save_config(
    config: &TrainConfig,
    path: impl AsRef<Path>,
    restore_path: Option<&Path>,
) -> anyhow::Result<()> {
    let mut config = config.clone();
    if let Some(restore) = restore_path {
        config.restore_path = Some(restore.display().to_string());
    }
    let path = path.as_ref();
    let data = if is_json_path(path) {
        serde_json::to_string_pretty(&config)?
    } else {
        serde_yaml::to_string(&config)?
    };
    fs::write(path, data)?;
    Ok(())
}

/// Resolve a possibly relative path against a dataset or config location.
pub fn resolve_relative_path(base: &Path, maybe_relative: &str) -> PathBuf {
    let candidate = Path::new(maybe_relative);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    base.join(candidate)
}

fn is_json_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}
