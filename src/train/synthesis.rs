//! Held-out sentence synthesis after evaluation.
//!
//! Each sentence is synthesized, vocoded and plotted independently; a failure
//! is recorded for that sentence and the rest still run.

use crate::audio::AudioProcessor;
use crate::config::SynthesisConfig;
use crate::data::dataset::SpeakerRef;
use crate::model::AcousticModel;
use crate::perf::{self, Metric};
use crate::text::TextFrontend;
use crate::visual::{plot_alignment, plot_spectrogram};
use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use std::fs;
use std::path::{Path, PathBuf};

/// Result of one test sentence.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisOutcome {
    Success {
        index: usize,
        wav: PathBuf,
        /// False when decoding hit the step limit.
        finished: bool,
    },
    Failure { index: usize, reason: String },
}

impl SynthesisOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SynthesisOutcome::Success { .. })
    }
}

/// Sentences from `test_sentences_file` when set, otherwise the inline list.
pub fn load_test_sentences(config: &SynthesisConfig) -> Result<Vec<String>> {
    let Some(path) = &config.test_sentences_file else {
        return Ok(config.test_sentences.clone());
    };
    let text = fs::read_to_string(path).with_context(|| format!("reading test sentences {path}"))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Writes `TestSentence_<i>.wav` with its prediction and alignment figures.
pub struct TestSentenceSynthesizer<'a> {
    pub sentences: &'a [String],
    pub frontend: &'a TextFrontend,
    pub audio: &'a dyn AudioProcessor,
    pub speaker: Option<&'a SpeakerRef>,
}

impl TestSentenceSynthesizer<'_> {
    /// Synthesize every sentence into `root/<step>/`.
    pub fn run<B, M>(&self, model: &M, root: &Path, step: usize, device: &B::Device) -> Vec<SynthesisOutcome>
    where
        B: Backend,
        M: AcousticModel<B>,
    {
        let _span = perf::span(Metric::TestSynthesis);
        let dir = root.join(step.to_string());
        let outcomes: Vec<SynthesisOutcome> = self
            .sentences
            .iter()
            .enumerate()
            .map(|(index, sentence)| match self.one(model, sentence, index, &dir, device) {
                Ok((wav, finished)) => {
                    if !finished {
                        tracing::warn!(index, "Test sentence hit the decoder step limit");
                    }
                    SynthesisOutcome::Success { index, wav, finished }
                }
                Err(err) => {
                    tracing::warn!(index, "Test sentence failed: {err:#}");
                    SynthesisOutcome::Failure {
                        index,
                        reason: format!("{err:#}"),
                    }
                }
            })
            .collect();
        let ok = outcomes.iter().filter(|outcome| outcome.is_success()).count();
        tracing::info!("Synthesized {ok}/{} test sentences into {}", outcomes.len(), dir.display());
        outcomes
    }

    fn one<B, M>(&self, model: &M, sentence: &str, index: usize, dir: &Path, device: &B::Device) -> Result<(PathBuf, bool)>
    where
        B: Backend,
        M: AcousticModel<B>,
    {
        let ids = self.frontend.text_to_ids(sentence)?;
        let synthesis = model.synthesize(&ids, self.speaker, device)?;
        fs::create_dir_all(dir)?;
        let stem = format!("TestSentence_{index}");
        let wav = {
            let _span = perf::span(Metric::GriffinLim);
            self.audio.inv_mel_spectrogram(&synthesis.mel)
        };
        let wav_path = dir.join(format!("{stem}.wav"));
        self.audio.save_wav(&wav, &wav_path)?;
        plot_spectrogram(&synthesis.mel, &dir.join(format!("{stem}_prediction.png")))?;
        plot_alignment(&synthesis.alignment, &dir.join(format!("{stem}_alignment.png")))?;
        Ok((wav_path, synthesis.finished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CharactersConfig, TacotronConfig};
    use crate::model::{SpeakerConditioning, Tacotron};
    use crate::text::{SymbolTable, TextCleaner};
    use burn_ndarray::{NdArray, NdArrayDevice};
    use std::sync::Mutex;
    use tempfile::tempdir;

    type TestBackend = NdArray<f32>;

    /// Writes a marker file instead of audio; fails for one chosen call.
    struct StubAudio {
        fail_on: usize,
        calls: Mutex<usize>,
    }

    impl AudioProcessor for StubAudio {
        fn sample_rate(&self) -> u32 {
            16000
        }

        fn num_mels(&self) -> usize {
            3
        }

        fn mel_spectrogram(&self, _wav: &[f32]) -> Vec<Vec<f32>> {
            Vec::new()
        }

        fn inv_mel_spectrogram(&self, mel: &[Vec<f32>]) -> Vec<f32> {
            vec![0.0; mel.len() * 4]
        }

        fn save_wav(&self, _wav: &[f32], path: &Path) -> Result<()> {
            let mut calls = self.calls.lock().expect("lock");
            let call = *calls;
            *calls += 1;
            if call == self.fail_on {
                anyhow::bail!("disk full");
            }
            fs::write(path, b"wav")?;
            Ok(())
        }
    }

    #[test]
    fn failures_are_isolated_per_sentence() {
        let device = NdArrayDevice::default();
        let config = TacotronConfig {
            r: 1,
            embedding_dim: 4,
            encoder_dim: 4,
            encoder_convs: 1,
            prenet_dims: vec![4],
            decoder_rnn_dim: 4,
            decoder_layers: 1,
            postnet_layers: 1,
            postnet_dim: 4,
            max_decoder_steps: 3,
            ..TacotronConfig::default()
        };
        let frontend = TextFrontend::new(
            TextCleaner::Basic,
            SymbolTable::new(&CharactersConfig::default()),
            false,
        );
        let model = Tacotron::<TestBackend>::new(&config, frontend.num_symbols(), 3, SpeakerConditioning::None, &device);
        let audio = StubAudio {
            fail_on: 1,
            calls: Mutex::new(0),
        };
        let sentences = vec![
            "hello".to_string(),
            "\u{2603}\u{2603}".to_string(),
            "second".to_string(),
            "third".to_string(),
        ];
        let synthesizer = TestSentenceSynthesizer {
            sentences: &sentences,
            frontend: &frontend,
            audio: &audio,
            speaker: None,
        };
        let dir = tempdir().expect("tempdir");
        let outcomes = synthesizer.run::<TestBackend, _>(&model, dir.path(), 42, &device);

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes[0].is_success());
        // No known symbols.
        assert!(matches!(outcomes[1], SynthesisOutcome::Failure { index: 1, .. }));
        // Second audio write fails.
        assert!(matches!(&outcomes[2], SynthesisOutcome::Failure { index: 2, reason } if reason.contains("disk full")));
        assert!(outcomes[3].is_success());

        let step_dir = dir.path().join("42");
        assert!(step_dir.join("TestSentence_0.wav").exists());
        assert!(step_dir.join("TestSentence_0_prediction.png").exists());
        assert!(step_dir.join("TestSentence_0_alignment.png").exists());
        assert!(step_dir.join("TestSentence_3_alignment.png").exists());
    }

    #[test]
    fn sentences_file_overrides_inline_list() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sentences.txt");
        fs::write(&path, "First one.\n\n  Second one.  \n").expect("write");
        let config = SynthesisConfig {
            test_sentences_file: Some(path.display().to_string()),
            test_sentences: vec!["ignored".to_string()],
        };
        assert_eq!(
            load_test_sentences(&config).expect("load"),
            vec!["First one.".to_string(), "Second one.".to_string()]
        );
    }
}
