//! Attention-based autoregressive acoustic model.

use crate::config::TacotronConfig;
use crate::data::dataset::SpeakerRef;
use crate::data::DeviceBatch;
use crate::loss::{LossAggregator, TacotronPrediction};
use crate::measures::AlignmentMatrix;
use crate::model::speaker::{speaker_inputs, SpeakerConditioning, SpeakerEncoder};
use crate::model::tacotron_decoder::{Decoder, DecoderConfig};
use crate::model::tacotron_encoder::{Encoder, Postnet};
use crate::model::{frames_to_rows, with_fresh_ids, AcousticModel, ForwardOutput, Synthesis};
use crate::modules::gst::GlobalStyleTokens;
use crate::modules::rnn::reverse_padded;
use burn::module::{Module, ParamId};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use burn_nn::{Embedding, EmbeddingConfig};

#[derive(Module, Debug)]
pub struct Tacotron<B: Backend> {
    embedding: Embedding<B>,
    encoder: Encoder<B>,
    speaker: SpeakerEncoder<B>,
    gst: Option<GlobalStyleTokens<B>>,
    decoder: Decoder<B>,
    /// Decodes the time-reversed target during training only.
    backward_decoder: Option<Decoder<B>>,
    postnet: Postnet<B>,
    separate_stopnet: bool,
}

impl<B: Backend> Tacotron<B> {
    pub fn new(
        config: &TacotronConfig,
        num_symbols: usize,
        num_mels: usize,
        speakers: SpeakerConditioning,
        device: &B::Device,
    ) -> Self {
        let gst = config
            .gst
            .as_ref()
            .map(|gst| GlobalStyleTokens::new(num_mels, gst.num_tokens, gst.embedding_dim, device));
        let style_dim = config.gst.as_ref().map_or(0, |gst| gst.embedding_dim);
        let decoder_in = config.encoder_dim + speakers.dim() + style_dim;
        let decoder = DecoderConfig::from_config(config, decoder_in, num_mels).init(device);
        let backward_decoder = config
            .bidirectional_decoder
            .then(|| with_fresh_ids(decoder.clone()));
        Self {
            embedding: EmbeddingConfig::new(num_symbols, config.embedding_dim).init(device),
            encoder: Encoder::new(config.embedding_dim, config.encoder_dim, config.encoder_convs, device),
            speaker: SpeakerEncoder::new(speakers, device),
            gst,
            decoder,
            backward_decoder,
            postnet: Postnet::new(
                num_mels,
                config.postnet_dim,
                config.postnet_kernel,
                config.postnet_layers,
                device,
            ),
            separate_stopnet: config.separate_stopnet,
        }
    }

    pub fn decoder(&self) -> &Decoder<B> {
        &self.decoder
    }

    /// Encoder outputs with speaker and style vectors appended per position.
    fn encode(
        &self,
        text: Tensor<B, 2, Int>,
        lengths: &[usize],
        mask: Tensor<B, 2>,
        extras: Vec<Tensor<B, 2>>,
        training: bool,
    ) -> Tensor<B, 3> {
        let embedded = self.embedding.forward(text);
        let encoded = self.encoder.forward(embedded, lengths, mask, training);
        let t_in = encoded.dims()[1];
        let mut parts = vec![encoded];
        parts.extend(
            extras
                .into_iter()
                .map(|extra| extra.unsqueeze_dim::<3>(1).repeat_dim(1, t_in)),
        );
        Tensor::cat(parts, 2)
    }

    /// Teacher-forced forward pass over a batch.
    pub fn forward(&self, batch: &DeviceBatch<B>, training: bool) -> TacotronPrediction<B> {
        let device = batch.mel.device();
        let size = batch.batch_size();
        let mut extras = Vec::new();
        if let Some(speaker) = self.speaker.forward(
            batch.speaker_ids.clone(),
            batch.speaker_vectors.clone(),
            size,
            &device,
        ) {
            extras.push(speaker);
        }
        if let Some(gst) = &self.gst {
            extras.push(gst.forward(batch.mel.clone(), batch.mel_mask.clone()));
        }
        let encoded = self.encode(
            batch.text.clone(),
            &batch.text_lengths,
            batch.text_mask.clone(),
            extras,
            training,
        );

        let decoded = self
            .decoder
            .forward(encoded.clone(), batch.mel.clone(), Some(&batch.text_mask), training);
        let residual = self
            .postnet
            .forward(decoded.frames.clone(), batch.mel_mask.clone(), training);
        let postnet_frames = decoded.frames.clone() + residual;

        let backward_frames = self.backward_decoder.as_ref().map(|backward| {
            let reversed = reverse_padded(batch.mel.clone(), &batch.mel_lengths);
            let out = backward.forward(encoded, reversed, Some(&batch.text_mask), training);
            reverse_padded(out.frames, &batch.mel_lengths)
        });

        TacotronPrediction {
            decoder_frames: decoded.frames,
            postnet_frames,
            stop_logits: decoded.stop_logits,
            alignments: decoded.alignments,
            backward_frames,
        }
    }
}

impl<B: Backend> AcousticModel<B> for Tacotron<B> {
    fn reduction_factor(&self) -> usize {
        self.decoder.r()
    }

    fn forward_loss(
        &self,
        batch: &DeviceBatch<B>,
        criterion: &LossAggregator,
        _step: usize,
        training: bool,
    ) -> ForwardOutput<B> {
        let prediction = self.forward(batch, training);
        let losses = criterion.tacotron(&prediction, batch, self.separate_stopnet);
        let r = self.decoder.r();
        ForwardOutput {
            losses,
            alignments: prediction.alignments,
            decoder_lengths: batch.mel_lengths.iter().map(|len| len.div_ceil(r)).collect(),
            prediction: prediction.postnet_frames,
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
        let mask = Tensor::<B, 2>::ones([1, t_in], device);
        let (ids, vectors) = speaker_inputs::<B>(speaker, device);
        let mut extras = Vec::new();
        if let Some(speaker) = self.speaker.forward(ids, vectors, 1, device) {
            extras.push(speaker);
        }
        if let Some(gst) = &self.gst {
            extras.push(gst.neutral(1, device));
        }
        let encoded = self.encode(text, &[t_in], mask, extras, false);
        let (decoded, finished) = self.decoder.inference(encoded, None);
        let frames = decoded.frames.dims()[1];
        let residual = self
            .postnet
            .forward(decoded.frames.clone(), Tensor::ones([1, frames], device), false);
        let mel = frames_to_rows(decoded.frames + residual)?;
        let steps = decoded.alignments.dims()[1];
        let weights: Vec<f32> = decoded.alignments.into_data().iter::<f32>().collect();
        Ok(Synthesis {
            mel,
            alignment: AlignmentMatrix::new(steps, t_in, weights)?,
            finished,
        })
    }

    fn stopnet_param_ids(&self) -> Vec<ParamId> {
        std::iter::once(&self.decoder)
            .chain(self.backward_decoder.iter())
            .flat_map(|decoder| {
                let stopnet = &decoder.stopnet;
                std::iter::once(stopnet.weight.id).chain(stopnet.bias.as_ref().map(|bias| bias.id))
            })
            .collect()
    }
}
