mod common;

use burn::optim::Optimizer;
use cadence::audio::MelProcessor;
use cadence::config::{ModelKind, TrainConfig};
use cadence::loss::MAIN_LOSS;
use cadence::model::{GlowTts, SpeakerConditioning, Tacotron};
use cadence::text::TextFrontend;
use cadence::train::checkpoint::{read_meta, CheckpointTag, BEST_MODEL};
use cadence::train::logger::EVENTS_FILE;
use cadence::train::{
    adam_config, run, DdiOutcome, Diagnostics, DistributedCoordinator, LoadOutcome, RunOptions,
    Trainer,
};
use cadence::TrainError;
use common::{
    device, first_batch, parameter_values, tiny_config, train_data, write_dataset, TrainBackend,
};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::tempdir;

type Glow = GlowTts<TrainBackend>;
type Taco = Tacotron<TrainBackend>;

fn glow_config(data: &Path, out: &Path) -> TrainConfig {
    let mut config = tiny_config(ModelKind::GlowTts, data, out);
    config.glow_tts.dropout = 0.0;
    config
}

fn glow_trainer(config: &TrainConfig) -> Trainer<TrainBackend, Glow, impl Optimizer<Glow, TrainBackend>> {
    let frontend = TextFrontend::from_config(&config.data).expect("frontend");
    let model = Glow::new(
        &config.glow_tts,
        frontend.num_symbols(),
        config.audio.num_mels,
        SpeakerConditioning::None,
        &device(),
    );
    let optimizer = adam_config(&config.optimizer).init::<TrainBackend, Glow>();
    Trainer::new(config, model, optimizer, DistributedCoordinator::single(), device())
}

fn tacotron_trainer(config: &TrainConfig) -> Trainer<TrainBackend, Taco, impl Optimizer<Taco, TrainBackend>> {
    let frontend = TextFrontend::from_config(&config.data).expect("frontend");
    let model = Taco::new(
        &config.tacotron,
        frontend.num_symbols(),
        config.audio.num_mels,
        SpeakerConditioning::None,
        &device(),
    );
    let optimizer = adam_config(&config.optimizer).init::<TrainBackend, Taco>();
    Trainer::new(config, model, optimizer, DistributedCoordinator::single(), device())
}

fn diagnostics(config: &TrainConfig, out: &Path) -> Diagnostics {
    Diagnostics {
        out_path: out.to_path_buf(),
        audio: Arc::new(MelProcessor::new(&config.audio).expect("audio")),
        frontend: TextFrontend::from_config(&config.data).expect("frontend"),
        sentences: config.synthesis.test_sentences.clone(),
        speaker: None,
    }
}

#[test]
fn tacotron_run_writes_checkpoints_and_diagnostics() {
    let data = tempdir().expect("data");
    let out = tempdir().expect("out");
    write_dataset(data.path(), 6, 2, None);
    let config = tiny_config(ModelKind::Tacotron, data.path(), out.path());
    let run_dir = out.path().join("run");
    let options = RunOptions {
        config,
        out_path: Some(run_dir.clone()),
        restore_path: None,
        best_loss: f32::INFINITY,
    };

    run::<TrainBackend>(&options, DistributedCoordinator::single(), device(), &AtomicBool::new(false))
        .expect("training run");

    // 6 items in batches of 2, checkpoint every 2 steps.
    let step_two = run_dir.join(CheckpointTag::Step(2).file_name());
    assert!(step_two.exists());
    assert_eq!(read_meta(&step_two).expect("meta").step, 2);
    assert!(run_dir.join("figures").join("step_2_prediction.png").exists());
    assert!(run_dir.join("figures").join("step_2_alignment.png").exists());
    assert!(run_dir.join("train_audios").join("step_2.wav").exists());
    // Evaluation after the third and last step of the epoch.
    assert!(run_dir.join("figures").join("eval_step_3_prediction.png").exists());
    assert!(run_dir.join("figures").join("eval_step_3_alignment.png").exists());
    assert!(run_dir.join("eval_audios").join("step_3.wav").exists());

    let best = read_meta(&run_dir.join(BEST_MODEL)).expect("best model");
    assert_eq!(best.step, 3);
    assert!(best.loss.is_finite());

    let events = std::fs::read_to_string(run_dir.join(EVENTS_FILE)).expect("events");
    let kinds: Vec<String> = events
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).expect("json line");
            value["kind"].as_str().expect("kind").to_string()
        })
        .collect();
    assert_eq!(kinds.iter().filter(|kind| *kind == "iteration").count(), 3);
    assert!(kinds.iter().any(|kind| kind == "eval_epoch"));
    assert!(kinds.iter().any(|kind| kind == "test_synthesis"));
}

#[test]
fn restored_checkpoint_continues_identically() {
    let data = tempdir().expect("data");
    let out = tempdir().expect("out");
    write_dataset(data.path(), 4, 2, None);
    let config = glow_config(data.path(), out.path());
    let batches = train_data(&config);
    let batch = first_batch(&batches);

    let mut original = glow_trainer(&config)
        .with_output(diagnostics(&config, out.path()))
        .expect("output");
    original.train_step(&batch).expect("step 1");
    original.train_step(&batch).expect("step 2");
    let checkpoint = out.path().join(CheckpointTag::Step(2).file_name());
    assert!(checkpoint.exists());

    let (mut restored, outcome) = glow_trainer(&config).restore(&checkpoint).expect("restore");
    assert_eq!(outcome, LoadOutcome::FullMatch);
    assert_eq!(restored.global_step(), 2);
    assert_eq!(restored.scheduler().current_lr(), original.scheduler().current_lr());
    assert_eq!(parameter_values(restored.model()), parameter_values(original.model()));

    let expected = original.train_step(&batch).expect("step 3");
    let actual = restored.train_step(&batch).expect("restored step 3");
    assert_eq!(actual.lr, expected.lr);
    let (a, b) = (
        actual.value(MAIN_LOSS).expect("loss"),
        expected.value(MAIN_LOSS).expect("loss"),
    );
    assert!((a - b).abs() < 1e-5, "{a} vs {b}");

    let after_original = parameter_values(original.model());
    let after_restored = parameter_values(restored.model());
    for (x, y) in after_original.iter().zip(&after_restored) {
        assert!((x - y).abs() < 1e-5, "{x} vs {y}");
    }
}

#[test]
fn data_dependent_init_runs_once_and_is_skipped_on_resume() {
    let data = tempdir().expect("data");
    let out = tempdir().expect("out");
    write_dataset(data.path(), 4, 2, None);
    let mut config = glow_config(data.path(), out.path());
    config.training.save_step = 1;
    let mut batches = train_data(&config);
    let interrupt = AtomicBool::new(false);

    let mut fresh = glow_trainer(&config)
        .with_output(diagnostics(&config, out.path()))
        .expect("output");
    fresh.fit(&mut batches, &interrupt).expect("fit");
    assert_eq!(fresh.ddi_outcome(), Some(DdiOutcome::Calibrated { layers: 2 }));

    let checkpoint = out.path().join(CheckpointTag::Step(1).file_name());
    let (mut resumed, _) = glow_trainer(&config).restore(&checkpoint).expect("restore");
    let before = parameter_values(resumed.model());
    resumed.fit(&mut batches, &interrupt).expect("fit");
    assert_eq!(resumed.ddi_outcome(), Some(DdiOutcome::Skipped));
    assert_ne!(before, parameter_values(resumed.model()));
}

#[test]
fn non_finite_features_abort_before_any_update() {
    let data = tempdir().expect("data");
    let out = tempdir().expect("out");
    write_dataset(data.path(), 4, 2, Some(f32::NAN));
    let mut config = tiny_config(ModelKind::Tacotron, data.path(), out.path());
    config.training.save_step = 1;
    let mut batches = train_data(&config);

    let mut trainer = tacotron_trainer(&config)
        .with_output(diagnostics(&config, out.path()))
        .expect("output");
    let before = parameter_values(trainer.model());
    let err = trainer
        .fit(&mut batches, &AtomicBool::new(false))
        .expect_err("nan features");

    assert!(matches!(err, TrainError::NonFiniteLoss { step: 0, .. }), "{err}");
    assert_eq!(trainer.global_step(), 0);
    assert_eq!(before, parameter_values(trainer.model()));
    assert!(!out.path().join(CheckpointTag::Step(1).file_name()).exists());
}

#[test]
fn interrupt_is_observed_before_the_next_epoch() {
    let data = tempdir().expect("data");
    let out = tempdir().expect("out");
    write_dataset(data.path(), 4, 2, None);
    let config = tiny_config(ModelKind::Tacotron, data.path(), out.path());
    let mut batches = train_data(&config);

    let mut trainer = tacotron_trainer(&config);
    let err = trainer
        .fit(&mut batches, &AtomicBool::new(true))
        .expect_err("interrupted");
    assert!(err.is_interrupt());
    assert_eq!(trainer.global_step(), 0);
}

#[test]
fn mismatched_checkpoint_loads_partially() {
    let data = tempdir().expect("data");
    let out = tempdir().expect("out");
    write_dataset(data.path(), 4, 2, None);
    let config = tiny_config(ModelKind::Tacotron, data.path(), out.path());
    let batch = first_batch(&train_data(&config));

    let mut trainer = tacotron_trainer(&config)
        .with_output(diagnostics(&config, out.path()))
        .expect("output");
    trainer.train_step(&batch).expect("step 1");
    trainer.train_step(&batch).expect("step 2");
    let checkpoint = out.path().join(CheckpointTag::Step(2).file_name());

    let mut wider = config.clone();
    wider.tacotron.postnet_dim = 12;
    let (restored, outcome) = tacotron_trainer(&wider).restore(&checkpoint).expect("partial restore");
    match outcome {
        LoadOutcome::PartialMatch { mismatched, .. } => assert!(!mismatched.is_empty()),
        LoadOutcome::FullMatch => panic!("expected a partial match"),
    }
    assert_eq!(restored.global_step(), 2);
}

#[test]
fn test_sentences_are_synthesized_without_evaluation() {
    let data = tempdir().expect("data");
    let out = tempdir().expect("out");
    write_dataset(data.path(), 4, 2, None);
    let mut config = tiny_config(ModelKind::Tacotron, data.path(), out.path());
    config.training.run_eval = false;
    let mut batches = train_data(&config);

    let mut trainer = tacotron_trainer(&config)
        .with_output(diagnostics(&config, out.path()))
        .expect("output");
    trainer.fit(&mut batches, &AtomicBool::new(false)).expect("fit");

    let step_dir = out.path().join("test_audios").join("2");
    assert!(step_dir.join("TestSentence_0.wav").exists());
    assert!(!out.path().join("eval_audios").exists());
}

#[test]
fn reinit_layers_restart_from_fresh_weights_on_a_matching_checkpoint() {
    let data = tempdir().expect("data");
    let out = tempdir().expect("out");
    write_dataset(data.path(), 4, 2, None);
    let config = tiny_config(ModelKind::Tacotron, data.path(), out.path());
    let batch = first_batch(&train_data(&config));

    let mut trainer = tacotron_trainer(&config)
        .with_output(diagnostics(&config, out.path()))
        .expect("output");
    trainer.train_step(&batch).expect("step 1");
    trainer.train_step(&batch).expect("step 2");
    let checkpoint = out.path().join(CheckpointTag::Step(2).file_name());

    let (full, outcome) = tacotron_trainer(&config).restore(&checkpoint).expect("full restore");
    assert_eq!(outcome, LoadOutcome::FullMatch);
    assert_eq!(parameter_values(full.model()), parameter_values(trainer.model()));

    let mut reinit = config.clone();
    reinit.training.reinit_layers = vec!["stopnet".to_string()];
    let (restored, outcome) = tacotron_trainer(&reinit).restore(&checkpoint).expect("reinit restore");
    assert_eq!(
        outcome,
        LoadOutcome::PartialMatch {
            missing: Vec::new(),
            mismatched: Vec::new(),
            unexpected: Vec::new(),
        }
    );
    assert_eq!(restored.global_step(), 2);
    assert_ne!(parameter_values(restored.model()), parameter_values(trainer.model()));
}
