//! Flow-based non-autoregressive acoustic model.
//!
//! A convolutional text encoder predicts a per-token Gaussian prior and log
//! durations. During training the mel is mapped to a latent by an invertible
//! flow decoder, monotonic alignment search picks the most likely token to
//! frame assignment under the prior, and the duration predictor learns the
//! resulting frame counts. At inference the predicted durations expand the
//! prior, a latent is sampled from it and the flow is run in reverse.

use crate::config::GlowTtsConfig;
use crate::data::dataset::SpeakerRef;
use crate::data::{sequence_mask, DeviceBatch};
use crate::loss::{GlowPrediction, LossAggregator};
use crate::measures::AlignmentMatrix;
use crate::model::mas::{generate_path, maximum_path};
use crate::model::speaker::{speaker_inputs, SpeakerConditioning, SpeakerEncoder};
use crate::model::{frames_to_rows, AcousticModel, ForwardOutput, Synthesis};
use crate::modules::conv::{forward_same, same_conv1d};
use crate::modules::flow::{squeeze, unsqueeze, ActNorm, CouplingBlock, FlowStep, InvConvNear};
use crate::modules::gst::ReferenceEncoder;
use crate::modules::prenet::dropout;
use crate::perf::{self, Metric};
use burn::module::Module;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Int, Tensor, TensorData};
use burn_nn::conv::{Conv1d, Conv1dConfig};
use burn_nn::{Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig};

fn conv<B: Backend>(input: usize, output: usize, kernel: usize, device: &B::Device) -> Conv1d<B> {
    same_conv1d(input, output, kernel).init(device)
}

/// Layer norm over the channel axis of `[batch, channels, time]`.
fn channel_norm<B: Backend>(norm: &LayerNorm<B>, x: Tensor<B, 3>) -> Tensor<B, 3> {
    norm.forward(x.swap_dims(1, 2)).swap_dims(1, 2)
}

/// Predicts log durations from detached encoder states.
#[derive(Module, Debug)]
pub struct DurationPredictor<B: Backend> {
    convs: Vec<Conv1d<B>>,
    norms: Vec<LayerNorm<B>>,
    proj: Conv1d<B>,
    dropout: f64,
}

impl<B: Backend> DurationPredictor<B> {
    pub fn new(input: usize, filters: usize, kernel: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            convs: vec![conv(input, filters, kernel, device), conv(filters, filters, kernel, device)],
            norms: vec![
                LayerNormConfig::new(filters).init(device),
                LayerNormConfig::new(filters).init(device),
            ],
            proj: Conv1dConfig::new(filters, 1, 1).init(device),
            dropout,
        }
    }

    /// `x: [batch, input, t_in]` → `[batch, 1, t_in]`.
    pub fn forward(&self, x: Tensor<B, 3>, mask: Tensor<B, 3>, training: bool) -> Tensor<B, 3> {
        let mut x = x;
        for (conv, norm) in self.convs.iter().zip(self.norms.iter()) {
            let y = relu(forward_same(conv, x * mask.clone()));
            x = dropout(channel_norm(norm, y), self.dropout, training);
        }
        self.proj.forward(x * mask.clone()) * mask
    }
}

/// Embedding plus residual convolution blocks, projecting to prior statistics.
#[derive(Module, Debug)]
pub struct TextEncoder<B: Backend> {
    embedding: Embedding<B>,
    convs: Vec<Conv1d<B>>,
    norms: Vec<LayerNorm<B>>,
    proj_mean: Conv1d<B>,
    proj_log_scale: Option<Conv1d<B>>,
    duration: DurationPredictor<B>,
    hidden: usize,
    dropout: f64,
}

/// Prior statistics and durations for a text batch.
#[derive(Debug, Clone)]
pub struct EncodedText<B: Backend> {
    /// `[batch, n_mels, t_in]`.
    pub mean: Tensor<B, 3>,
    pub log_scale: Tensor<B, 3>,
    /// `[batch, 1, t_in]`.
    pub log_durations: Tensor<B, 3>,
}

impl<B: Backend> TextEncoder<B> {
    pub fn new(
        config: &GlowTtsConfig,
        num_symbols: usize,
        num_mels: usize,
        cond_channels: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = config.hidden_channels;
        Self {
            embedding: EmbeddingConfig::new(num_symbols, hidden).init(device),
            convs: (0..config.encoder_layers)
                .map(|_| conv(hidden, hidden, config.encoder_kernel, device))
                .collect(),
            norms: (0..config.encoder_layers)
                .map(|_| LayerNormConfig::new(hidden).init(device))
                .collect(),
            proj_mean: Conv1dConfig::new(hidden, num_mels, 1).init(device),
            proj_log_scale: (!config.mean_only)
                .then(|| Conv1dConfig::new(hidden, num_mels, 1).init(device)),
            duration: DurationPredictor::new(
                hidden + cond_channels,
                config.duration_predictor_channels,
                config.duration_predictor_kernel,
                config.dropout,
                device,
            ),
            hidden,
            dropout: config.dropout,
        }
    }

    pub fn forward(
        &self,
        text: Tensor<B, 2, Int>,
        mask: Tensor<B, 3>,
        g: Option<Tensor<B, 2>>,
        training: bool,
    ) -> EncodedText<B> {
        let mut x = self
            .embedding
            .forward(text)
            .mul_scalar((self.hidden as f32).sqrt())
            .swap_dims(1, 2)
            * mask.clone();
        for (conv, norm) in self.convs.iter().zip(self.norms.iter()) {
            let y = dropout(relu(forward_same(conv, x.clone() * mask.clone())), self.dropout, training);
            x = channel_norm(norm, x + y);
        }
        let x = x * mask.clone();
        let mean = self.proj_mean.forward(x.clone()) * mask.clone();
        let log_scale = match &self.proj_log_scale {
            Some(proj) => proj.forward(x.clone()) * mask.clone(),
            None => mean.zeros_like(),
        };
        let t_in = x.dims()[2];
        let mut duration_input = x.detach();
        if let Some(g) = g {
            let g = g.detach().unsqueeze_dim::<3>(2).repeat_dim(2, t_in);
            duration_input = Tensor::cat(vec![duration_input, g], 1);
        }
        let log_durations = self.duration.forward(duration_input, mask, training);
        EncodedText {
            mean,
            log_scale,
            log_durations,
        }
    }
}

/// Stack of invertible flow steps over squeezed mel frames.
#[derive(Module, Debug)]
pub struct FlowDecoder<B: Backend> {
    flows: Vec<FlowStep<B>>,
    n_sqz: usize,
}

impl<B: Backend> FlowDecoder<B> {
    pub fn new(config: &GlowTtsConfig, num_mels: usize, cond_channels: usize, device: &B::Device) -> Self {
        let channels = num_mels * config.n_sqz;
        let flows = (0..config.flow_blocks)
            .map(|_| FlowStep {
                actnorm: ActNorm::new(channels, device),
                invconv: InvConvNear::new(config.n_split, device),
                coupling: CouplingBlock::new(
                    channels,
                    config.flow_hidden,
                    config.flow_kernel,
                    config.coupling_layers,
                    cond_channels,
                    device,
                ),
            })
            .collect();
        Self {
            flows,
            n_sqz: config.n_sqz,
        }
    }

    pub fn num_actnorms(&self) -> usize {
        self.flows.len()
    }

    /// `x: [batch, n_mels, t]` with `t` a multiple of `n_sqz`.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        mask: Tensor<B, 3>,
        g: Option<Tensor<B, 3>>,
        reverse: bool,
        training: bool,
    ) -> (Tensor<B, 3>, Tensor<B, 1>) {
        let batch = x.dims()[0];
        let (mut x, squeezed_mask) = self.squeeze(x, mask);
        let mut logdet = Tensor::zeros([batch], &x.device());
        let steps: Box<dyn Iterator<Item = &FlowStep<B>>> = if reverse {
            Box::new(self.flows.iter().rev())
        } else {
            Box::new(self.flows.iter())
        };
        for step in steps {
            let (next, step_logdet) = step.forward(x, squeezed_mask.clone(), g.clone(), reverse, training);
            x = next;
            logdet = logdet + step_logdet;
        }
        (self.unsqueeze(x, squeezed_mask), logdet)
    }

    /// Calibrate every ActNorm in order on the activations it actually sees.
    pub fn calibrate(self, x: Tensor<B, 3>, mask: Tensor<B, 3>, g: Option<Tensor<B, 3>>) -> Self {
        let n_sqz = self.n_sqz;
        let (mut x, mask) = self.squeeze(x.detach(), mask);
        let mut flows = Vec::with_capacity(self.flows.len());
        for mut step in self.flows {
            step.actnorm = step.actnorm.calibrate(x.clone(), mask.clone());
            let (next, _) = step.forward(x, mask.clone(), g.clone(), false, false);
            x = next.detach();
            flows.push(step);
        }
        Self { flows, n_sqz }
    }

    fn squeeze(&self, x: Tensor<B, 3>, mask: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 3>) {
        if self.n_sqz > 1 {
            squeeze(x, mask, self.n_sqz)
        } else {
            (x, mask)
        }
    }

    fn unsqueeze(&self, x: Tensor<B, 3>, mask: Tensor<B, 3>) -> Tensor<B, 3> {
        if self.n_sqz > 1 {
            unsqueeze(x, mask, self.n_sqz).0
        } else {
            x * mask
        }
    }
}

/// Variational posterior over a global latent, summarizing the target mel.
#[derive(Module, Debug)]
pub struct PosteriorEncoder<B: Backend> {
    reference: ReferenceEncoder<B>,
    mean: Linear<B>,
    log_var: Linear<B>,
}

impl<B: Backend> PosteriorEncoder<B> {
    pub fn new(num_mels: usize, hidden: usize, latent: usize, device: &B::Device) -> Self {
        Self {
            reference: ReferenceEncoder::new(num_mels, hidden, device),
            mean: LinearConfig::new(hidden, latent).init(device),
            log_var: LinearConfig::new(hidden, latent).init(device),
        }
    }

    pub fn latent_dim(&self) -> usize {
        self.mean.weight.dims()[1]
    }

    pub fn forward(&self, mel: Tensor<B, 3>, mask: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let summary = self.reference.forward(mel, mask);
        (self.mean.forward(summary.clone()), self.log_var.forward(summary))
    }
}

#[derive(Module, Debug)]
pub struct GlowTts<B: Backend> {
    encoder: TextEncoder<B>,
    decoder: FlowDecoder<B>,
    speaker: SpeakerEncoder<B>,
    posterior: Option<PosteriorEncoder<B>>,
    num_mels: usize,
    n_sqz: usize,
    length_scale: f32,
    noise_scale: f32,
}

/// Intermediate tensors of a training forward pass.
struct FlowPass<B: Backend> {
    prediction: GlowPrediction<B>,
    /// `[batch, t_in, t_out]` hard alignment.
    path: Tensor<B, 3>,
    y_lengths: Vec<usize>,
}

impl<B: Backend> GlowTts<B> {
    pub fn new(
        config: &GlowTtsConfig,
        num_symbols: usize,
        num_mels: usize,
        speakers: SpeakerConditioning,
        device: &B::Device,
    ) -> Self {
        let latent = if config.use_vae { config.vae_latent_dim } else { 0 };
        let cond_channels = speakers.dim() + latent;
        Self {
            encoder: TextEncoder::new(config, num_symbols, num_mels, cond_channels, device),
            decoder: FlowDecoder::new(config, num_mels, cond_channels, device),
            speaker: SpeakerEncoder::new(speakers, device),
            posterior: config
                .use_vae
                .then(|| PosteriorEncoder::new(num_mels, config.hidden_channels, latent, device)),
            num_mels,
            n_sqz: config.n_sqz.max(1),
            length_scale: config.length_scale,
            noise_scale: config.noise_scale,
        }
    }

    /// Global conditioning `[batch, cond]` from speaker and latent parts.
    fn conditioning(parts: Vec<Tensor<B, 2>>) -> Option<Tensor<B, 2>> {
        if parts.is_empty() {
            None
        } else {
            Some(Tensor::cat(parts, 1))
        }
    }

    /// Mel lengths rounded down to the squeeze factor.
    fn trimmed_lengths(&self, lengths: &[usize]) -> Vec<usize> {
        lengths.iter().map(|len| (len / self.n_sqz) * self.n_sqz).collect()
    }

    fn flow_inputs(&self, batch: &DeviceBatch<B>) -> (Tensor<B, 3>, Tensor<B, 3>, Vec<usize>) {
        let [_, t_out, _] = batch.mel.dims();
        let t_trim = (t_out / self.n_sqz) * self.n_sqz;
        let y_lengths = self.trimmed_lengths(&batch.mel_lengths);
        let device = batch.mel.device();
        let z_mask = sequence_mask::<B>(&y_lengths, t_trim, &device).unsqueeze_dim::<3>(1);
        let y = batch.mel.clone().narrow(1, 0, t_trim).swap_dims(1, 2);
        (y, z_mask, y_lengths)
    }

    fn pass(&self, batch: &DeviceBatch<B>, training: bool) -> FlowPass<B> {
        let device = batch.mel.device();
        let size = batch.batch_size();
        let x_mask = batch.text_mask.clone().unsqueeze_dim::<3>(1);
        let (y, z_mask, y_lengths) = self.flow_inputs(batch);

        let mut parts = Vec::new();
        if let Some(speaker) = self.speaker.forward(
            batch.speaker_ids.clone(),
            batch.speaker_vectors.clone(),
            size,
            &device,
        ) {
            parts.push(speaker);
        }
        let posterior = self.posterior.as_ref().map(|posterior| {
            let (mean, log_var) = posterior.forward(batch.mel.clone(), batch.mel_mask.clone());
            let latent = if training {
                let noise = Tensor::random(mean.shape(), Distribution::Normal(0.0, 1.0), &device);
                mean.clone() + noise * log_var.clone().mul_scalar(0.5).exp()
            } else {
                mean.clone()
            };
            parts.push(latent);
            (mean, log_var)
        });
        let g = Self::conditioning(parts);

        let encoded = self.encoder.forward(batch.text.clone(), x_mask.clone(), g.clone(), training);
        let (z, logdet) = self.decoder.forward(
            y,
            z_mask.clone(),
            g.map(|g| g.unsqueeze_dim::<3>(2)),
            false,
            training,
        );

        let path = self.align(&encoded, z.clone(), batch, &y_lengths);
        let y_mean = encoded.mean.clone().matmul(path.clone());
        let y_log_scale = encoded.log_scale.clone().matmul(path.clone());
        let log_duration_targets = path
            .clone()
            .sum_dim(2)
            .add_scalar(1.0)
            .log()
            .swap_dims(1, 2)
            * x_mask.clone();

        FlowPass {
            prediction: GlowPrediction {
                z,
                y_mean,
                y_log_scale,
                logdet,
                z_mask,
                log_durations: encoded.log_durations,
                log_duration_targets,
                x_mask,
                posterior,
            },
            path,
            y_lengths,
        }
    }

    /// Hard alignment `[batch, t_in, t_out]` maximizing the prior likelihood of `z`.
    fn align(&self, encoded: &EncodedText<B>, z: Tensor<B, 3>, batch: &DeviceBatch<B>, y_lengths: &[usize]) -> Tensor<B, 3> {
        let _span = perf::span(Metric::MonotonicAlignment);
        let mean = encoded.mean.clone().detach();
        let log_scale = encoded.log_scale.clone().detach();
        let z = z.detach();
        let inv_var = log_scale.clone().mul_scalar(-2.0).exp();
        let half_log_2pi = 0.5 * (2.0 * std::f32::consts::PI).ln();

        let term1 = log_scale
            .neg()
            .sub_scalar(half_log_2pi)
            .sum_dim(1)
            .swap_dims(1, 2);
        let term2 = inv_var
            .clone()
            .swap_dims(1, 2)
            .matmul(z.clone().powf_scalar(2.0).mul_scalar(-0.5));
        let term3 = (mean.clone() * inv_var.clone()).swap_dims(1, 2).matmul(z);
        let term4 = (mean.powf_scalar(2.0) * inv_var)
            .mul_scalar(-0.5)
            .sum_dim(1)
            .swap_dims(1, 2);
        let log_p = term1 + term2 + term3 + term4;

        let [size, t_x, t_y] = log_p.dims();
        let values: Vec<f32> = log_p.into_data().iter::<f32>().collect();
        let prior: Option<Vec<f32>> = batch.attn_prior.as_ref().map(|prior| {
            let [_, prior_t, _] = prior.dims();
            prior
                .clone()
                .narrow(1, 0, t_y.min(prior_t))
                .into_data()
                .iter::<f32>()
                .collect()
        });
        let prior = prior.filter(|values| values.len() == size * t_y * t_x);
        let path = maximum_path(
            &values,
            size,
            t_x,
            t_y,
            &batch.text_lengths,
            y_lengths,
            prior.as_deref(),
        );
        Tensor::from_data(TensorData::new(path, [size, t_x, t_y]), &batch.mel.device())
    }
}

impl<B: Backend> AcousticModel<B> for GlowTts<B> {
    fn reduction_factor(&self) -> usize {
        1
    }

    fn forward_loss(
        &self,
        batch: &DeviceBatch<B>,
        criterion: &LossAggregator,
        step: usize,
        training: bool,
    ) -> ForwardOutput<B> {
        let pass = self.pass(batch, training);
        let losses = criterion.glow(&pass.prediction, step);
        ForwardOutput {
            losses,
            alignments: pass.path.swap_dims(1, 2),
            decoder_lengths: pass.y_lengths,
            prediction: pass.prediction.y_mean.swap_dims(1, 2),
        }
    }

    fn synthesize(
        &self,
        token_ids: &[i64],
        speaker: Option<&SpeakerRef>,
        device: &B::Device,
    ) -> anyhow::Result<Synthesis> {
        if token_ids.is_empty() {
            anyhow::bail!("cannot synthesize an empty token sequence");
        }
        let t_in = token_ids.len();
        let text = Tensor::<B, 2, Int>::from_data(TensorData::new(token_ids.to_vec(), [1, t_in]), device);
        let x_mask = Tensor::<B, 3>::ones([1, 1, t_in], device);

        let (ids, vectors) = speaker_inputs::<B>(speaker, device);
        let mut parts = Vec::new();
        if let Some(speaker) = self.speaker.forward(ids, vectors, 1, device) {
            parts.push(speaker);
        }
        if let Some(posterior) = &self.posterior {
            parts.push(Tensor::zeros([1, posterior.latent_dim()], device));
        }
        let g = Self::conditioning(parts);
        let encoded = self.encoder.forward(text, x_mask.clone(), g.clone(), false);

        let durations: Vec<usize> = (encoded.log_durations.exp() * x_mask)
            .mul_scalar(self.length_scale)
            .into_data()
            .iter::<f32>()
            .map(|w| if w.is_finite() { w.ceil().max(0.0) as usize } else { 0 })
            .collect();
        let total: usize = durations.iter().sum();
        let t_y = ((total.max(1) / self.n_sqz) * self.n_sqz).max(self.n_sqz);
        let path = Tensor::<B, 3>::from_data(
            TensorData::new(generate_path(&durations, 1, t_in, t_y), [1, t_in, t_y]),
            device,
        );

        let y_mean = encoded.mean.matmul(path.clone());
        let y_log_scale = encoded.log_scale.matmul(path.clone());
        let z_mask = Tensor::<B, 3>::ones([1, 1, t_y], device);
        let noise = Tensor::random([1, self.num_mels, t_y], Distribution::Normal(0.0, 1.0), device);
        let z = (y_mean + y_log_scale.exp() * noise.mul_scalar(self.noise_scale)) * z_mask.clone();
        let (y, _) = self
            .decoder
            .forward(z, z_mask, g.map(|g| g.unsqueeze_dim::<3>(2)), true, false);

        let mel = frames_to_rows(y.swap_dims(1, 2))?;
        let weights: Vec<f32> = path.swap_dims(1, 2).into_data().iter::<f32>().collect();
        Ok(Synthesis {
            mel,
            alignment: AlignmentMatrix::new(t_y, t_in, weights)?,
            finished: true,
        })
    }

    fn has_data_dependent_init(&self) -> bool {
        true
    }

    fn calibrate(self, batch: &DeviceBatch<B>) -> (Self, usize) {
        let device = batch.mel.device();
        let (y, z_mask, _) = self.flow_inputs(batch);
        let mut parts = Vec::new();
        if let Some(speaker) = self.speaker.forward(
            batch.speaker_ids.clone(),
            batch.speaker_vectors.clone(),
            batch.batch_size(),
            &device,
        ) {
            parts.push(speaker.detach());
        }
        if let Some(posterior) = &self.posterior {
            let (mean, _) = posterior.forward(batch.mel.clone(), batch.mel_mask.clone());
            parts.push(mean.detach());
        }
        let g = Self::conditioning(parts).map(|g| g.unsqueeze_dim::<3>(2));
        let layers = self.decoder.num_actnorms();
        let Self {
            encoder,
            decoder,
            speaker,
            posterior,
            num_mels,
            n_sqz,
            length_scale,
            noise_scale,
        } = self;
        let decoder = decoder.calibrate(y, z_mask, g);
        (
            Self {
                encoder,
                decoder,
                speaker,
                posterior,
                num_mels,
                n_sqz,
                length_scale,
                noise_scale,
            },
            layers,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LossConfig;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn small_config() -> GlowTtsConfig {
        GlowTtsConfig {
            hidden_channels: 8,
            encoder_layers: 2,
            encoder_kernel: 3,
            duration_predictor_channels: 8,
            flow_blocks: 2,
            flow_hidden: 8,
            flow_kernel: 3,
            coupling_layers: 2,
            n_split: 4,
            n_sqz: 2,
            ..GlowTtsConfig::default()
        }
    }

    fn batch(device: &NdArrayDevice) -> DeviceBatch<TestBackend> {
        let text = Tensor::<TestBackend, 2, Int>::from_data(
            TensorData::new(vec![3_i64, 4, 5, 2, 6, 0], [2, 3]),
            device,
        );
        DeviceBatch {
            text,
            text_lengths: vec![3, 2],
            text_mask: sequence_mask::<TestBackend>(&[3, 2], 3, device),
            mel: Tensor::random([2, 8, 4], Distribution::Normal(0.0, 1.0), device),
            mel_lengths: vec![8, 6],
            mel_mask: sequence_mask::<TestBackend>(&[8, 6], 8, device),
            stop_targets: Tensor::zeros([2, 8], device),
            speaker_ids: None,
            speaker_vectors: None,
            attn_prior: None,
            r: 1,
        }
    }

    #[test]
    fn forward_loss_is_finite_with_hard_alignment() {
        let device = NdArrayDevice::default();
        let mut config = small_config();
        config.use_vae = true;
        config.vae_latent_dim = 2;
        let model = GlowTts::<TestBackend>::new(&config, 10, 4, SpeakerConditioning::None, &device);
        let criterion = LossAggregator::new(&LossConfig::default());
        let out = model.forward_loss(&batch(&device), &criterion, 100, true);
        let values = out.losses.to_host(100).expect("finite");
        assert!(values.iter().any(|(name, _)| *name == "kl"));
        assert_eq!(out.alignments.dims(), [2, 8, 3]);
        let first: Vec<f32> = out.alignments.narrow(0, 0, 1).sum_dim(2).into_data().iter::<f32>().collect();
        assert!(first.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn calibration_keeps_shapes_and_reports_layers() {
        let device = NdArrayDevice::default();
        let model = GlowTts::<TestBackend>::new(&small_config(), 10, 4, SpeakerConditioning::None, &device);
        assert!(model.has_data_dependent_init());
        let (model, layers) = model.calibrate(&batch(&device));
        assert_eq!(layers, 2);
        let synthesis = model.synthesize(&[3, 4], None, &device).expect("synthesis");
        assert_eq!(synthesis.mel.len() % 2, 0);
        assert_eq!(synthesis.alignment.encoder_steps(), 2);
    }
}
