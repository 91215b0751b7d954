//! Acoustic models and the interface the trainer drives them through.
//!
//! Two families implement [`AcousticModel`]: the attention-based
//! autoregressive [`Tacotron`] and the flow-based [`GlowTts`]. The trainer is
//! generic over the trait, so the model family is chosen once in `main`.

pub mod glow_tts;
pub mod mas;
pub mod speaker;
pub mod tacotron;
pub mod tacotron_decoder;
pub mod tacotron_encoder;

pub use glow_tts::GlowTts;
pub use speaker::{SpeakerConditioning, SpeakerEncoder};
pub use tacotron::Tacotron;
pub use tacotron_decoder::{Decoder, DecoderConfig, DecoderOutput, DecoderState};

use crate::data::dataset::SpeakerRef;
use crate::data::DeviceBatch;
use crate::loss::{LossAggregator, LossBreakdown};
use crate::measures::AlignmentMatrix;
use burn::module::{Module, ModuleMapper, Param, ParamId};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Everything one forward pass hands back to the training loop.
#[derive(Debug, Clone)]
pub struct ForwardOutput<B: Backend> {
    pub losses: LossBreakdown<B>,
    /// `[batch, decoder_steps, t_in]`.
    pub alignments: Tensor<B, 3>,
    /// Valid decoder steps per item.
    pub decoder_lengths: Vec<usize>,
    /// Predicted mel frames `[batch, t_out, n_mels]` for diagnostics.
    pub prediction: Tensor<B, 3>,
}

/// Result of synthesizing one sentence.
#[derive(Debug, Clone)]
pub struct Synthesis {
    /// `[frames][n_mels]`, normalized the same way as training features.
    pub mel: Vec<Vec<f32>>,
    pub alignment: AlignmentMatrix,
    /// False when decoding ran into the step limit without a stop decision.
    pub finished: bool,
}

/// An acoustic model the training loop can drive.
pub trait AcousticModel<B: Backend>: Module<B> + Sized {
    /// Output frames produced per decoder step.
    fn reduction_factor(&self) -> usize;

    /// Forward pass plus criterion on one batch.
    fn forward_loss(
        &self,
        batch: &DeviceBatch<B>,
        criterion: &LossAggregator,
        step: usize,
        training: bool,
    ) -> ForwardOutput<B>;

    /// Free-running synthesis of one sentence.
    fn synthesize(
        &self,
        token_ids: &[i64],
        speaker: Option<&SpeakerRef>,
        device: &B::Device,
    ) -> anyhow::Result<Synthesis>;

    /// Whether the model holds layers calibrated from data before training.
    fn has_data_dependent_init(&self) -> bool {
        false
    }

    /// Calibrate data-dependent layers from `batch`; returns the model and
    /// the number of calibrated layers.
    fn calibrate(self, _batch: &DeviceBatch<B>) -> (Self, usize) {
        (self, 0)
    }

    /// Parameters left out of gradient-norm clipping.
    fn stopnet_param_ids(&self) -> Vec<ParamId> {
        Vec::new()
    }
}

/// Copy of `module` with the same values but new parameter identities.
pub fn with_fresh_ids<B: Backend, M: Module<B>>(module: M) -> M {
    struct FreshIds;

    impl<B: Backend> ModuleMapper<B> for FreshIds {
        fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
            Param::from_tensor(param.val().detach())
        }
    }

    module.map(&mut FreshIds)
}

/// Host copy of `[1, frames, n_mels]` as rows.
pub(crate) fn frames_to_rows<B: Backend>(frames: Tensor<B, 3>) -> anyhow::Result<Vec<Vec<f32>>> {
    let [_, count, channels] = frames.dims();
    let values: Vec<f32> = frames.into_data().iter::<f32>().collect();
    if values.iter().any(|v| !v.is_finite()) {
        anyhow::bail!("synthesized frames contain non-finite values");
    }
    Ok((0..count)
        .map(|t| values[t * channels..(t + 1) * channels].to_vec())
        .collect())
}
