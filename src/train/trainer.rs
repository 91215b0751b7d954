//! The epoch/step training loop.
//!
//! A [`Trainer`] owns the model, optimizer and every per-run component. One
//! trainer runs per rank; ranks meet only inside the coordinator's
//! collectives, so every rank must call [`Trainer::train_step`] the same
//! number of times per epoch.

use crate::audio::AudioProcessor;
use crate::config::TrainConfig;
use crate::data::dataset::SpeakerRef;
use crate::data::{Batch, DataLoader, DeviceBatch, Sampler};
use crate::error::TrainError;
use crate::loss::{LossAggregator, LossRecord, MAIN_LOSS};
use crate::measures::{alignment_error, AlignmentMatrix};
use crate::model::{frames_to_rows, AcousticModel, ForwardOutput};
use crate::perf::{self, Metric};
use crate::text::TextFrontend;
use crate::train::checkpoint::{
    restore_optimizer, CheckpointManager, CheckpointTag, LoadOutcome, TrainingState,
};
use crate::train::clip::clip_grad_norm;
use crate::train::ddi::{DataDependentInitializer, DdiOutcome};
use crate::train::distributed::DistributedCoordinator;
use crate::train::experiment::TEST_AUDIO_DIR;
use crate::train::logger::{ConsoleLogger, EventRecord, EventWriter};
use crate::train::scaler::GradientScaler;
use crate::train::scheduler::{NoamScheduler, SchedulerState};
use crate::train::synthesis::{SynthesisOutcome, TestSentenceSynthesizer};
use crate::visual::{plot_alignment, plot_spectrogram_comparison};
use burn::module::{AutodiffModule, ParamId};
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Name of the alignment quality metric logged with the losses.
pub const ALIGN_ERROR: &str = "align_error";

const FIGURES_DIR: &str = "figures";
const TRAIN_AUDIO_DIR: &str = "train_audios";
const EVAL_AUDIO_DIR: &str = "eval_audios";

/// Batches and their ordering for one rank.
pub struct TrainData {
    pub train: DataLoader,
    pub train_sampler: Box<dyn Sampler>,
    pub eval: Option<(DataLoader, Box<dyn Sampler>)>,
}

/// What rank 0 needs to render audio and synthesize test sentences.
pub struct Diagnostics {
    pub out_path: PathBuf,
    pub audio: std::sync::Arc<dyn AudioProcessor>,
    pub frontend: TextFrontend,
    pub sentences: Vec<String>,
    pub speaker: Option<SpeakerRef>,
}

/// Summary of one training step.
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Loss components and alignment error averaged over ranks.
    pub values: Vec<(&'static str, f32)>,
    pub lr: f64,
    /// Gradient norm before clipping, stop net excluded.
    pub grad_norm: f32,
    /// False when the optimizer step was skipped on gradient overflow.
    pub applied: bool,
    pub step_time: Duration,
}

impl StepReport {
    pub fn value(&self, name: &str) -> Option<f32> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }
}

pub struct Trainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    config: TrainConfig,
    model: M,
    optimizer: O,
    criterion: LossAggregator,
    scheduler: NoamScheduler,
    scaler: GradientScaler,
    coordinator: DistributedCoordinator,
    ddi: DataDependentInitializer,
    ddi_outcome: Option<DdiOutcome>,
    checkpoints: Option<CheckpointManager>,
    events: EventWriter,
    console: ConsoleLogger,
    diagnostics: Option<Diagnostics>,
    stopnet_ids: Vec<ParamId>,
    train_record: LossRecord,
    eval_record: LossRecord,
    global_step: usize,
    epoch: usize,
    best_loss: f32,
    device: B::Device,
}

impl<B, M, O> Trainer<B, M, O>
where
    B: AutodiffBackend,
    M: AcousticModel<B> + AutodiffModule<B>,
    M::InnerModule: AcousticModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    pub fn new(
        config: &TrainConfig,
        model: M,
        optimizer: O,
        coordinator: DistributedCoordinator,
        device: B::Device,
    ) -> Self {
        let stopnet_ids = model.stopnet_param_ids();
        Self {
            config: config.clone(),
            model,
            optimizer,
            criterion: LossAggregator::new(&config.loss),
            scheduler: NoamScheduler::new(&config.optimizer),
            scaler: GradientScaler::new(&config.mixed_precision),
            coordinator,
            ddi: DataDependentInitializer::new(),
            ddi_outcome: None,
            checkpoints: None,
            events: EventWriter::disabled(),
            console: ConsoleLogger::new(),
            diagnostics: None,
            stopnet_ids,
            train_record: LossRecord::new(),
            eval_record: LossRecord::new(),
            global_step: 0,
            epoch: 0,
            best_loss: f32::INFINITY,
            device,
        }
    }

    /// Enable checkpoints, event records and audio diagnostics. Only rank 0
    /// writes to the output folder; other ranks ignore the call.
    pub fn with_output(mut self, diagnostics: Diagnostics) -> Result<Self, TrainError> {
        if !self.coordinator.is_main() {
            return Ok(self);
        }
        fs::create_dir_all(&diagnostics.out_path)?;
        self.events = EventWriter::create(&diagnostics.out_path)?;
        if self.config.training.checkpoint {
            self.checkpoints = Some(CheckpointManager::new(
                &diagnostics.out_path,
                self.config.training.keep_checkpoints,
            ));
        }
        self.diagnostics = Some(diagnostics);
        Ok(self)
    }

    /// Restore model weights and, on a full match, optimizer, schedule and
    /// scaler state from `path`.
    pub fn restore(mut self, path: &Path) -> Result<(Self, LoadOutcome), TrainError> {
        let _span = perf::span(Metric::CheckpointLoad);
        let loaded = CheckpointManager::load::<B, M>(
            path,
            self.model.clone(),
            &self.config.training.reinit_layers,
        )?;
        self.model = loaded.model;
        self.stopnet_ids = self.model.stopnet_param_ids();
        if let Some(bytes) = loaded.optimizer {
            self.optimizer = restore_optimizer::<B, M, O>(self.optimizer, bytes, &self.device)?;
        }
        let meta = loaded.meta;
        self.global_step = meta.step;
        match (&loaded.outcome, meta.scheduler) {
            (LoadOutcome::FullMatch, Some(state)) => self.scheduler.load_state(state),
            _ => self.scheduler.load_state(SchedulerState { last_step: meta.step }),
        }
        if let (true, Some(state)) = (loaded.outcome.is_full(), meta.scaler) {
            self.scaler.load_state(state);
        }
        if meta.r != self.model.reduction_factor() {
            tracing::warn!(
                "Checkpoint was saved with r={} but the model uses r={}",
                meta.r,
                self.model.reduction_factor()
            );
        }
        match &loaded.outcome {
            LoadOutcome::FullMatch => {
                tracing::info!("Restored {} at step {}", path.display(), meta.step)
            }
            LoadOutcome::PartialMatch {
                missing,
                mismatched,
                unexpected,
            } => tracing::warn!(
                "Partially restored {} at step {}: {} missing, {} mismatched, {} unexpected parameters; optimizer starts fresh",
                path.display(),
                meta.step,
                missing.len(),
                mismatched.len(),
                unexpected.len()
            ),
        }
        Ok((self, loaded.outcome))
    }

    pub fn set_best_loss(&mut self, best_loss: f32) {
        self.best_loss = best_loss;
    }

    pub fn best_loss(&self) -> f32 {
        self.best_loss
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn scheduler(&self) -> &NoamScheduler {
        &self.scheduler
    }

    pub fn ddi_outcome(&self) -> Option<DdiOutcome> {
        self.ddi_outcome
    }

    /// Give every rank rank 0's parameters.
    pub fn sync_parameters(&mut self) -> Result<(), TrainError> {
        self.model = self
            .coordinator
            .broadcast_parameters::<B, M>(self.model.clone())?;
        Ok(())
    }

    fn training_state(&self, loss: f32) -> TrainingState {
        TrainingState {
            step: self.global_step,
            epoch: self.epoch,
            r: self.model.reduction_factor(),
            loss,
            scheduler: Some(self.scheduler.state()),
            scaler: Some(self.scaler.state()),
        }
    }

    /// Calibrate data-dependent layers on the first batch of a fresh run.
    fn initialize_from_data(&mut self, batch: &DeviceBatch<B>) -> Result<(), TrainError> {
        if !self.ddi.is_pending(&self.model, self.global_step) {
            return Ok(());
        }
        let (model, outcome) = self.ddi.run(self.model.clone(), batch, self.global_step);
        self.model = model;
        self.ddi_outcome = Some(outcome);
        // Each rank calibrated on its own batch.
        self.sync_parameters()
    }

    /// One optimizer step on `batch`.
    ///
    /// A non-finite loss component fails the step before any backward pass,
    /// leaving the model and optimizer untouched.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepReport, TrainError> {
        let started = Instant::now();
        let _span = perf::span(Metric::TrainStep);
        let device_batch = batch.to_device::<B>(&self.device);
        self.initialize_from_data(&device_batch)?;

        let lr = if self.scheduler.is_warmup_based() {
            self.scheduler.step()
        } else {
            self.scheduler.current_lr()
        };

        let output = {
            let _span = perf::span(Metric::TrainForward);
            self.model
                .forward_loss(&device_batch, &self.criterion, self.global_step, true)
        };
        let mut values = output.losses.to_host(self.global_step)?;

        let grads = {
            let _span = perf::span(Metric::TrainBackward);
            self.scaler.scale(output.losses.total.clone()).backward()
        };
        let grads = GradientsParams::from_grads(grads, &self.model);
        let grads = self.coordinator.sync_gradients::<B, M>(&self.model, grads)?;
        let grads = self.scaler.unscale::<B, M>(&self.model, grads);
        let (grads, grad_norm) = clip_grad_norm::<B, M>(
            &self.model,
            grads,
            self.config.optimizer.grad_clip,
            &self.stopnet_ids,
        );

        let applied = self.scaler.step();
        if applied {
            let _span = perf::span(Metric::TrainOptimizer);
            self.model = self.optimizer.step(lr, self.model.clone(), grads);
        } else {
            perf::add_count(Metric::SkippedSteps, 1);
        }
        self.scaler.update();
        self.global_step += 1;
        perf::add_count(Metric::TrainSteps, 1);

        values.push((ALIGN_ERROR, batch_alignment_error(&output, &device_batch)));
        let values = self.coordinator.reduce_metrics(&values, batch.len())?;
        let step_time = started.elapsed();
        self.train_record.update_all(&values);
        self.train_record.update("step_time", step_time.as_secs_f32());

        if self.coordinator.is_main() && self.global_step % self.config.training.save_step == 0 {
            self.save_step_checkpoint(batch, &output, &values)?;
        }

        Ok(StepReport {
            values,
            lr,
            grad_norm,
            applied,
            step_time,
        })
    }

    fn save_step_checkpoint(
        &mut self,
        batch: &Batch,
        output: &ForwardOutput<B>,
        values: &[(&'static str, f32)],
    ) -> Result<(), TrainError> {
        let loss = values
            .iter()
            .find(|(name, _)| *name == MAIN_LOSS)
            .map_or(f32::NAN, |(_, value)| *value);
        if let Some(checkpoints) = &self.checkpoints {
            checkpoints.save::<B, M, O>(
                CheckpointTag::Step(self.global_step),
                &self.model,
                &self.optimizer,
                &self.training_state(loss),
            )?;
        }
        if let Some(diagnostics) = &self.diagnostics {
            let step = self.global_step;
            let written = write_diagnostics(
                diagnostics,
                batch,
                output,
                &format!("step_{step}"),
                &diagnostics.out_path.join(TRAIN_AUDIO_DIR).join(format!("step_{step}.wav")),
            );
            if let Err(err) = written {
                tracing::warn!("Could not write step {step} diagnostics: {err:#}");
            }
        }
        Ok(())
    }

    /// Run one training epoch over `loader` in `sampler`'s order.
    pub fn train_epoch(
        &mut self,
        loader: &DataLoader,
        sampler: &mut dyn Sampler,
    ) -> Result<BTreeMap<String, f32>, TrainError> {
        let epochs = self.config.training.epochs;
        self.console.train_start(self.epoch, epochs);
        self.train_record.reset();
        let started = Instant::now();
        let indices = sampler.epoch_indices(self.epoch);
        // Ranks may hold one item more than others; all must step together.
        let num_batches = self
            .coordinator
            .min_across_ranks(loader.num_batches(indices.len()))?;
        let mut batches = loader.epoch(&indices).take(num_batches);
        let mut step_in_epoch = 0;
        loop {
            let wait = Instant::now();
            let Some(batch) = batches.next() else {
                break;
            };
            let batch = batch.map_err(|err| TrainError::Data(format!("{err:#}")))?;
            let loader_time = wait.elapsed();
            self.train_record.update("loader_time", loader_time.as_secs_f32());

            let report = self.train_step(&batch)?;
            step_in_epoch += 1;

            if self.global_step % self.config.training.print_step == 0 {
                self.console.train_step(
                    step_in_epoch,
                    num_batches,
                    self.global_step,
                    &report.values,
                    report.lr,
                    report.grad_norm,
                    report.step_time,
                    loader_time,
                );
            }
            if self.global_step % self.config.training.plot_step == 0 {
                let record = EventRecord::new("iteration", self.global_step, self.epoch)
                    .with_all("", report.values.iter().copied())
                    .with("lr", report.lr as f32)
                    .with("grad_norm", report.grad_norm)
                    .with("step_time", report.step_time.as_secs_f32())
                    .with("loader_time", loader_time.as_secs_f32())
                    .with("avg_text_length", batch.avg_text_length())
                    .with("avg_mel_length", batch.avg_mel_length());
                self.events.write(&record)?;
            }
        }

        let averages = self.train_record.averages();
        self.console
            .train_epoch_end(self.global_step, self.epoch, started.elapsed(), &averages);
        self.events.write(
            &EventRecord::new("train_epoch", self.global_step, self.epoch)
                .with_all("", averages.iter().map(|(name, value)| (name.as_str(), *value)))
                .with("epoch_time", started.elapsed().as_secs_f32()),
        )?;
        Ok(averages)
    }

    /// Evaluate without gradient tracking.
    pub fn eval_epoch(
        &mut self,
        loader: &DataLoader,
        sampler: &mut dyn Sampler,
    ) -> Result<BTreeMap<String, f32>, TrainError> {
        self.console.eval_start();
        self.eval_record.reset();
        let model = self.model.valid();
        let indices = sampler.epoch_indices(self.epoch);
        let num_batches = self
            .coordinator
            .min_across_ranks(loader.num_batches(indices.len()))?;
        let mut first = None;
        for (step, batch) in loader.epoch(&indices).take(num_batches).enumerate() {
            let batch = batch.map_err(|err| TrainError::Data(format!("{err:#}")))?;
            let _span = perf::span(Metric::EvalStep);
            let device_batch = batch.to_device::<B::InnerBackend>(&self.device);
            let output = model.forward_loss(&device_batch, &self.criterion, self.global_step, false);
            let mut values = output.losses.to_host(self.global_step)?;
            values.push((ALIGN_ERROR, batch_alignment_error(&output, &device_batch)));
            let values = self.coordinator.reduce_metrics(&values, batch.len())?;
            self.eval_record.update_all(&values);
            if self.config.training.print_eval {
                self.console.eval_step(step, &values);
            }
            if first.is_none() {
                first = Some((batch, output));
            }
        }
        let averages = self.eval_record.averages();
        self.console.eval_end(&averages);

        if let (Some(diagnostics), Some((batch, output))) = (&self.diagnostics, &first) {
            let step = self.global_step;
            let written = write_diagnostics(
                diagnostics,
                batch,
                output,
                &format!("eval_step_{step}"),
                &diagnostics.out_path.join(EVAL_AUDIO_DIR).join(format!("step_{step}.wav")),
            );
            if let Err(err) = written {
                tracing::warn!("Could not write eval diagnostics at step {step}: {err:#}");
            }
        }
        self.events.write(
            &EventRecord::new("eval_epoch", self.global_step, self.epoch)
                .with_all("", averages.iter().map(|(name, value)| (name.as_str(), *value))),
        )?;
        Ok(averages)
    }

    /// Synthesize the configured test sentences with the current weights.
    pub fn synthesize_test_sentences(&mut self) -> Result<Vec<SynthesisOutcome>, TrainError> {
        let Some(diagnostics) = &self.diagnostics else {
            return Ok(Vec::new());
        };
        let model = self.model.valid();
        let synthesizer = TestSentenceSynthesizer {
            sentences: &diagnostics.sentences,
            frontend: &diagnostics.frontend,
            audio: diagnostics.audio.as_ref(),
            speaker: diagnostics.speaker.as_ref(),
        };
        let outcomes = synthesizer.run::<B::InnerBackend, _>(
            &model,
            &diagnostics.out_path.join(TEST_AUDIO_DIR),
            self.global_step,
            &self.device,
        );
        let failures = outcomes.iter().filter(|outcome| !outcome.is_success()).count();
        self.events.write(
            &EventRecord::new("test_synthesis", self.global_step, self.epoch)
                .with("sentences", outcomes.len() as f32)
                .with("failures", failures as f32),
        )?;
        Ok(outcomes)
    }

    /// Save `best_model` when `target_loss` beats the best seen so far.
    fn update_best(&mut self, target_loss: Option<f32>) -> Result<(), TrainError> {
        let Some(loss) = target_loss else {
            return Ok(());
        };
        match &self.checkpoints {
            Some(checkpoints) => {
                let state = self.training_state(loss);
                self.best_loss = checkpoints.save_if_best::<B, M, O>(
                    self.best_loss,
                    &self.model,
                    &self.optimizer,
                    &state,
                )?;
            }
            None => {
                if loss.is_finite() && loss < self.best_loss {
                    self.best_loss = loss;
                }
            }
        }
        Ok(())
    }

    /// Train for the configured number of epochs.
    ///
    /// `interrupt` is polled before each epoch; a raised flag ends the run
    /// with [`TrainError::Interrupted`].
    pub fn fit(&mut self, data: &mut TrainData, interrupt: &AtomicBool) -> Result<(), TrainError> {
        if self.global_step > 0 && self.model.has_data_dependent_init() {
            tracing::info!(
                global_step = self.global_step,
                "Resumed run, skipping data-dependent initialization"
            );
            self.ddi_outcome = Some(DdiOutcome::Skipped);
        }
        let avg_loss = format!("avg_{MAIN_LOSS}");
        for epoch in 0..self.config.training.epochs {
            if interrupt.load(Ordering::SeqCst) {
                return Err(TrainError::Interrupted);
            }
            self.epoch = epoch;
            let train_averages = self.train_epoch(&data.train, data.train_sampler.as_mut())?;

            let mut target = train_averages.get(&avg_loss).copied();
            if self.config.training.run_eval {
                if let Some((loader, sampler)) = data.eval.as_mut() {
                    let eval_averages = self.eval_epoch(loader, sampler.as_mut())?;
                    target = eval_averages.get(&avg_loss).copied().or(target);
                }
            }
            if self.coordinator.is_main() && epoch >= self.config.training.test_delay_epochs {
                self.synthesize_test_sentences()?;
            }
            self.update_best(target)?;
        }
        Ok(())
    }
}

/// Prediction-vs-target and alignment figures named `<prefix>_*.png` plus one
/// vocoded sample at `wav_path`, all for the first item of `batch`.
fn write_diagnostics<BK: Backend>(
    diagnostics: &Diagnostics,
    batch: &Batch,
    output: &ForwardOutput<BK>,
    prefix: &str,
    wav_path: &Path,
) -> anyhow::Result<()> {
    let (Some(&frames), Some(&decoder_steps)) =
        (batch.mel_lengths.first(), output.decoder_lengths.first())
    else {
        return Ok(());
    };
    let predicted = frames_to_rows(
        output
            .prediction
            .clone()
            .detach()
            .narrow(0, 0, 1)
            .narrow(1, 0, frames),
    )?;
    let target: Vec<Vec<f32>> = batch.mel[..frames * batch.num_mels]
        .chunks(batch.num_mels)
        .map(<[f32]>::to_vec)
        .collect();
    let alignment = AlignmentMatrix::from_batch(
        output.alignments.clone().detach().narrow(0, 0, 1),
        &batch.text_lengths[..1],
        &[decoder_steps],
    );

    let figures = diagnostics.out_path.join(FIGURES_DIR);
    fs::create_dir_all(&figures)?;
    plot_spectrogram_comparison(&predicted, &target, &figures.join(format!("{prefix}_prediction.png")))?;
    if let Some(alignment) = alignment.first() {
        plot_alignment(alignment, &figures.join(format!("{prefix}_alignment.png")))?;
    }

    if let Some(dir) = wav_path.parent() {
        fs::create_dir_all(dir)?;
    }
    let wav = {
        let _span = perf::span(Metric::GriffinLim);
        diagnostics.audio.inv_mel_spectrogram(&predicted)
    };
    diagnostics.audio.save_wav(&wav, wav_path)?;
    Ok(())
}

/// `1 - diagonal score` of the batch's alignments, trimmed to valid extents.
fn batch_alignment_error<B: Backend>(
    output: &ForwardOutput<B>,
    batch: &DeviceBatch<B>,
) -> f32 {
    let _span = perf::span(Metric::MonotonicAlignment);
    let matrices = AlignmentMatrix::from_batch(
        output.alignments.clone().detach(),
        &batch.text_lengths,
        &output.decoder_lengths,
    );
    alignment_error(&matrices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelKind, TacotronConfig};
    use crate::data::batch::Sample;
    use crate::data::collate;
    use crate::data::features::{Features, Matrix};
    use crate::model::{SpeakerConditioning, Tacotron};
    use burn::module::{Module, ModuleVisitor, Param};
    use burn::optim::AdamConfig;
    use burn::tensor::Tensor;
    use burn_autodiff::Autodiff;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = Autodiff<NdArray<f32>>;

    #[derive(Default)]
    struct Snapshot {
        values: Vec<f32>,
    }

    impl<B: burn::tensor::backend::Backend> ModuleVisitor<B> for Snapshot {
        fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
            self.values.extend(param.val().into_data().iter::<f32>());
        }
    }

    fn snapshot<M: Module<TestBackend>>(model: &M) -> Vec<f32> {
        let mut snapshot = Snapshot::default();
        model.visit(&mut snapshot);
        snapshot.values
    }

    fn config() -> TrainConfig {
        let mut config: TrainConfig = serde_json::from_value(serde_json::json!({
            "run_name": "unit",
            "output_path": "/tmp",
            "model": "tacotron",
        }))
        .expect("config");
        config.model = ModelKind::Tacotron;
        config.audio.num_mels = 3;
        config.tacotron = TacotronConfig {
            r: 1,
            embedding_dim: 4,
            encoder_dim: 4,
            encoder_convs: 1,
            prenet_dims: vec![4],
            decoder_rnn_dim: 4,
            decoder_layers: 1,
            postnet_layers: 1,
            postnet_dim: 4,
            max_decoder_steps: 4,
            ..TacotronConfig::default()
        };
        config.optimizer.noam_schedule = false;
        config.training.checkpoint = false;
        config
    }

    fn batch(fill: f32) -> Batch {
        let sample = |tokens: Vec<i64>, frames: usize| Sample {
            name: "item".to_string(),
            token_ids: tokens,
            features: Features {
                mel: Matrix {
                    rows: frames,
                    cols: 3,
                    data: vec![fill; frames * 3],
                },
                attn_prior: None,
            },
            speaker: None,
        };
        collate(vec![sample(vec![1, 2, 3], 4), sample(vec![4, 5], 3)], 1, 1).expect("collate")
    }

    fn trainer(
        config: &TrainConfig,
    ) -> Trainer<TestBackend, Tacotron<TestBackend>, impl Optimizer<Tacotron<TestBackend>, TestBackend>> {
        let device = NdArrayDevice::default();
        let model = Tacotron::<TestBackend>::new(&config.tacotron, 10, 3, SpeakerConditioning::None, &device);
        let optimizer = AdamConfig::new().init::<TestBackend, Tacotron<TestBackend>>();
        Trainer::new(config, model, optimizer, DistributedCoordinator::single(), device)
    }

    #[test]
    fn step_reports_losses_and_advances() {
        let config = config();
        let mut trainer = trainer(&config);
        let before = snapshot(trainer.model());
        let report = trainer.train_step(&batch(0.5)).expect("step");
        assert_eq!(trainer.global_step(), 1);
        assert!(report.applied);
        assert!(report.value(MAIN_LOSS).is_some_and(f32::is_finite));
        let error = report.value(ALIGN_ERROR).expect("align error");
        assert!((0.0..=1.0).contains(&error));
        assert_eq!(trainer.ddi_outcome(), None);
        assert_ne!(before, snapshot(trainer.model()));
    }

    #[test]
    fn non_finite_loss_aborts_before_update() {
        let config = config();
        let mut trainer = trainer(&config);
        let before = snapshot(trainer.model());
        let err = trainer.train_step(&batch(f32::NAN)).expect_err("nan batch");
        assert!(matches!(err, TrainError::NonFiniteLoss { step: 0, .. }));
        assert_eq!(trainer.global_step(), 0);
        assert_eq!(before, snapshot(trainer.model()));
    }
}
