//! Wiring a run together: data, speakers, model family, optimizer, restore.

use crate::audio::{AudioProcessor, MelProcessor};
use crate::config::{ModelKind, OptimizerConfig, TrainConfig};
use crate::data::dataset::SpeakerRef;
use crate::data::{
    apply_portion, load_meta_data, BucketSampler, DataLoader, DatasetOptions, DistributedSampler,
    ExternalSpeakerEmbeddings, MetaItem, Sampler, SequentialSampler, SpeakerBalancedSampler,
    SpeakerMapping, SpeakerSource, TtsDataset,
};
use crate::error::TrainError;
use crate::model::{AcousticModel, GlowTts, SpeakerConditioning, Tacotron};
use crate::text::TextFrontend;
use crate::train::distributed::DistributedCoordinator;
use crate::train::experiment::SPEAKERS_FILE;
use crate::train::synthesis::load_test_sentences;
use crate::train::trainer::{Diagnostics, TrainData, Trainer};
use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::AdamConfig;
use burn::tensor::backend::AutodiffBackend;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Everything `main` resolves before training starts.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config: TrainConfig,
    /// Experiment folder; `None` on ranks that never write.
    pub out_path: Option<PathBuf>,
    /// Checkpoint to restore before the first step.
    pub restore_path: Option<PathBuf>,
    /// Best target loss carried over from a continued run.
    pub best_loss: f32,
}

/// Adam with the configured betas, epsilon and optional weight decay.
pub fn adam_config(config: &OptimizerConfig) -> AdamConfig {
    let adam = AdamConfig::new()
        .with_beta_1(config.beta_1)
        .with_beta_2(config.beta_2)
        .with_epsilon(config.epsilon);
    if config.weight_decay > 0.0 {
        adam.with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay)))
    } else {
        adam
    }
}

fn data_error(err: anyhow::Error) -> TrainError {
    TrainError::Data(format!("{err:#}"))
}

/// Resolve how batches identify speakers.
///
/// A `speakers.json` already in the experiment folder (continued runs) wins
/// over a mapping rebuilt from metadata, so ids stay stable across restarts.
pub fn speaker_source(
    config: &TrainConfig,
    items: &[MetaItem],
    out_path: Option<&Path>,
) -> Result<SpeakerSource, TrainError> {
    if !config.data.use_speaker_embedding {
        return Ok(SpeakerSource::None);
    }
    if let Some(file) = &config.data.speaker_embedding_file {
        let table = ExternalSpeakerEmbeddings::load(Path::new(file)).map_err(data_error)?;
        tracing::info!("Using external speaker embeddings of width {}", table.dim());
        return Ok(SpeakerSource::External(Arc::new(table)));
    }
    let saved = out_path.map(|dir| dir.join(SPEAKERS_FILE)).filter(|path| path.exists());
    let mapping = match saved {
        Some(path) => SpeakerMapping::load(&path).map_err(data_error)?,
        None => {
            let mapping = SpeakerMapping::from_items(items);
            if let Some(dir) = out_path {
                mapping.save(&dir.join(SPEAKERS_FILE)).map_err(data_error)?;
            }
            mapping
        }
    };
    tracing::info!("Training with {} speakers", mapping.len());
    Ok(SpeakerSource::Ids(Arc::new(mapping)))
}

fn train_sampler(
    config: &TrainConfig,
    dataset: &TtsDataset,
    coordinator: &DistributedCoordinator,
) -> Result<Box<dyn Sampler>, TrainError> {
    let seed = config.training.seed;
    if coordinator.world_size() > 1 {
        if config.data.speaker_balancer_batch {
            tracing::warn!("Speaker-balanced sampling is ignored in distributed runs");
        }
        return Ok(Box::new(DistributedSampler::new(
            dataset.len(),
            coordinator.rank(),
            coordinator.world_size(),
            seed,
            true,
        )));
    }
    if config.data.speaker_balancer_batch {
        let sampler = SpeakerBalancedSampler::new(dataset.speakers(), seed).map_err(data_error)?;
        return Ok(Box::new(sampler));
    }
    if config.data.batch_group_size > 0 {
        return Ok(Box::new(BucketSampler::new(
            dataset.len(),
            config.data.batch_group_size * config.training.batch_size,
            seed,
        )));
    }
    Ok(Box::new(SequentialSampler::new(dataset.len())))
}

fn eval_sampler(dataset: &TtsDataset, coordinator: &DistributedCoordinator, seed: u64) -> Box<dyn Sampler> {
    if coordinator.world_size() > 1 {
        Box::new(DistributedSampler::new(
            dataset.len(),
            coordinator.rank(),
            coordinator.world_size(),
            seed,
            false,
        ))
    } else {
        Box::new(SequentialSampler::new(dataset.len()))
    }
}

/// Train `options.config` on this rank until the configured epochs are done,
/// an error occurs or `interrupt` is raised.
pub fn run<B: AutodiffBackend>(
    options: &RunOptions,
    coordinator: DistributedCoordinator,
    device: B::Device,
    interrupt: &AtomicBool,
) -> Result<(), TrainError> {
    let config = &options.config;
    let frontend = TextFrontend::from_config(&config.data)
        .map_err(|err| TrainError::Config(format!("{err:#}")))?;
    let audio: Arc<dyn AudioProcessor> = Arc::new(
        MelProcessor::new(&config.audio).map_err(|err| TrainError::Config(format!("{err:#}")))?,
    );

    let (mut train_items, mut eval_items) = load_meta_data(
        &config.data.datasets,
        config.data.eval_split_size,
        config.training.seed,
    )
    .map_err(data_error)?;
    apply_portion(&mut train_items, config.data.train_portion);
    apply_portion(&mut eval_items, config.data.eval_portion);

    let all_items: Vec<MetaItem> = train_items.iter().chain(&eval_items).cloned().collect();
    let writer_path = options.out_path.as_deref().filter(|_| coordinator.is_main());
    let speakers = speaker_source(config, &all_items, writer_path)?;
    let test_speaker = match (&speakers, train_items.first()) {
        (SpeakerSource::Ids(mapping), Some(item)) => {
            Some(SpeakerRef::Id(mapping.id(&item.speaker).map_err(data_error)?))
        }
        (SpeakerSource::External(table), Some(item)) => Some(SpeakerRef::Vector(
            table.get(&item.speaker).map_err(data_error)?.to_vec(),
        )),
        _ => None,
    };

    let dataset_options = DatasetOptions::from_config(
        &config.data,
        config.audio.num_mels,
        config.frame_multiple(),
        config.r(),
        speakers.clone(),
        Some(Arc::clone(&audio)),
    );
    let train_set = Arc::new(
        TtsDataset::new(train_items, &frontend, dataset_options.clone()).map_err(data_error)?,
    );
    let train_sampler = train_sampler(config, &train_set, &coordinator)?;
    let eval = if config.training.run_eval && !eval_items.is_empty() {
        let eval_set =
            Arc::new(TtsDataset::new(eval_items, &frontend, dataset_options).map_err(data_error)?);
        let sampler = eval_sampler(&eval_set, &coordinator, config.training.seed);
        let loader = DataLoader::new(
            eval_set,
            config.training.eval_batch_size,
            config.data.num_val_loader_workers,
            config.data.prefetch_batches,
        );
        Some((loader, sampler))
    } else {
        None
    };
    let mut data = TrainData {
        train: DataLoader::new(
            train_set,
            config.training.batch_size,
            config.data.num_loader_workers,
            config.data.prefetch_batches,
        ),
        train_sampler,
        eval,
    };

    let sentences = load_test_sentences(&config.synthesis).map_err(data_error)?;
    let diagnostics = writer_path.map(|out_path| Diagnostics {
        out_path: out_path.to_path_buf(),
        audio,
        frontend: frontend.clone(),
        sentences,
        speaker: test_speaker,
    });

    let num_symbols = frontend.num_symbols();
    let num_mels = config.audio.num_mels;
    match config.model {
        ModelKind::Tacotron => {
            let conditioning =
                SpeakerConditioning::from_source(&speakers, config.tacotron.speaker_embedding_dim);
            let model = Tacotron::<B>::new(&config.tacotron, num_symbols, num_mels, conditioning, &device);
            train_model::<B, Tacotron<B>>(options, model, coordinator, device, diagnostics, &mut data, interrupt)
        }
        ModelKind::GlowTts => {
            let conditioning =
                SpeakerConditioning::from_source(&speakers, config.glow_tts.speaker_embedding_dim);
            let model = GlowTts::<B>::new(&config.glow_tts, num_symbols, num_mels, conditioning, &device);
            train_model::<B, GlowTts<B>>(options, model, coordinator, device, diagnostics, &mut data, interrupt)
        }
    }
}

fn train_model<B, M>(
    options: &RunOptions,
    model: M,
    coordinator: DistributedCoordinator,
    device: B::Device,
    diagnostics: Option<Diagnostics>,
    data: &mut TrainData,
    interrupt: &AtomicBool,
) -> Result<(), TrainError>
where
    B: AutodiffBackend,
    M: AcousticModel<B> + AutodiffModule<B>,
    M::InnerModule: AcousticModel<B::InnerBackend>,
{
    let config = &options.config;
    let optimizer = adam_config(&config.optimizer).init::<B, M>();
    let mut trainer = Trainer::new(config, model, optimizer, coordinator, device);
    if let Some(diagnostics) = diagnostics {
        trainer = trainer.with_output(diagnostics)?;
    }
    if let Some(path) = &options.restore_path {
        trainer = trainer.restore(path)?.0;
    }
    trainer.set_best_loss(options.best_loss);
    trainer.sync_parameters()?;
    tracing::info!("Training {:?} from step {}", config.model, trainer.global_step());
    trainer.fit(data, interrupt)
}
