//! Autoregressive attention decoder with a stop-token head.
//!
//! Each decoder step consumes the memory of previously emitted frames, runs
//! the prenet and the attention GRU, attends over encoder outputs, passes the
//! projected `[attention hidden; context]` through a residual GRU stack and
//! emits `r` frames plus one stop logit.
//!
//! Two drivers exist: [`Decoder::forward`] feeds ground-truth frames (teacher
//! forcing), [`Decoder::inference`] feeds back its own predictions until every
//! item has voted to stop or the step limit is reached.
//! [`Decoder::inference_truncated`] decodes a bounded chunk and hands back the
//! live [`DecoderState`] so decoding can resume later.

use crate::config::TacotronConfig;
use crate::modules::attention::{Attention, AttentionState, AttentionStrategy};
use crate::modules::prenet::{dropout, Prenet};
use crate::modules::rnn::{GruCell, GruCellConfig};
use crate::perf::{self, Metric};
use burn::module::{Ignored, Module};
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use burn_nn::{Linear, LinearConfig};

const STOPNET_DROPOUT: f64 = 0.1;

/// Construction parameters of a [`Decoder`].
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Width of the (possibly speaker/style extended) encoder outputs.
    pub in_channels: usize,
    pub frame_channels: usize,
    pub r: usize,
    pub memory_size: usize,
    pub prenet_dims: Vec<usize>,
    pub prenet_always_dropout: bool,
    pub rnn_dim: usize,
    pub layers: usize,
    pub attention_dim: usize,
    pub strategy: AttentionStrategy,
    pub separate_stopnet: bool,
    pub stop_threshold: f32,
    pub stop_patience: usize,
    pub max_decoder_steps: usize,
}

impl DecoderConfig {
    pub fn from_config(config: &TacotronConfig, in_channels: usize, frame_channels: usize) -> Self {
        Self {
            in_channels,
            frame_channels,
            r: config.r,
            memory_size: config.memory_size,
            prenet_dims: config.prenet_dims.clone(),
            prenet_always_dropout: config.prenet_dropout,
            rnn_dim: config.decoder_rnn_dim,
            layers: config.decoder_layers,
            attention_dim: config.attention.attention_dim,
            strategy: AttentionStrategy::from_config(&config.attention),
            separate_stopnet: config.separate_stopnet,
            stop_threshold: config.stop_threshold,
            stop_patience: config.stop_patience.max(1),
            max_decoder_steps: config.max_decoder_steps,
        }
    }

    fn memory_width(&self) -> usize {
        self.frame_channels * self.memory_size.max(1)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Decoder<B> {
        let prenet = Prenet::new(
            self.memory_width(),
            &self.prenet_dims,
            self.prenet_always_dropout,
            device,
        );
        let prenet_out = if self.prenet_dims.is_empty() {
            self.memory_width()
        } else {
            prenet.output_dim()
        };
        let step_channels = self.frame_channels * self.r;
        Decoder {
            prenet,
            attention_rnn: GruCellConfig::new(prenet_out + self.in_channels, self.rnn_dim).init(device),
            attention: Attention::new(
                self.rnn_dim,
                self.in_channels,
                self.attention_dim,
                self.strategy,
                device,
            ),
            project_to_decoder_in: LinearConfig::new(self.rnn_dim + self.in_channels, self.rnn_dim)
                .init(device),
            decoder_rnns: (0..self.layers)
                .map(|_| GruCellConfig::new(self.rnn_dim, self.rnn_dim).init(device))
                .collect(),
            proj_to_mel: LinearConfig::new(self.rnn_dim, step_channels).init(device),
            stopnet: LinearConfig::new(self.rnn_dim + step_channels, 1).init(device),
            settings: Ignored(self.clone()),
        }
    }
}

/// Recurrent state carried across decoder steps.
#[derive(Debug, Clone)]
pub struct DecoderState<B: Backend> {
    /// Most recent frames, newest first, flattened to `[batch, memory_width]`.
    pub memory: Tensor<B, 2>,
    /// Attention context `[batch, in_channels]`.
    pub context: Tensor<B, 2>,
    pub attention: AttentionState<B>,
    pub attention_hidden: Tensor<B, 2>,
    pub decoder_hidden: Vec<Tensor<B, 2>>,
    /// Decoder steps taken so far.
    pub steps: usize,
    /// Consecutive above-threshold stop votes per item.
    pub stop_votes: Vec<usize>,
    /// Items whose stop votes reached the patience at least once.
    pub stopped: Vec<bool>,
}

impl<B: Backend> DecoderState<B> {
    pub fn finished(&self) -> bool {
        !self.stopped.is_empty() && self.stopped.iter().all(|done| *done)
    }
}

/// Outputs of a decoding run.
#[derive(Debug, Clone)]
pub struct DecoderOutput<B: Backend> {
    /// `[batch, steps * r, frame_channels]`.
    pub frames: Tensor<B, 3>,
    /// `[batch, steps, t_in]`.
    pub alignments: Tensor<B, 3>,
    /// `[batch, steps]`.
    pub stop_logits: Tensor<B, 2>,
}

impl<B: Backend> DecoderOutput<B> {
    pub fn steps(&self) -> usize {
        self.stop_logits.dims()[1]
    }
}

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    prenet: Prenet<B>,
    attention_rnn: GruCell<B>,
    attention: Attention<B>,
    project_to_decoder_in: Linear<B>,
    decoder_rnns: Vec<GruCell<B>>,
    proj_to_mel: Linear<B>,
    pub stopnet: Linear<B>,
    settings: Ignored<DecoderConfig>,
}

struct StepOutputs<B: Backend> {
    frames: Vec<Tensor<B, 3>>,
    alignments: Vec<Tensor<B, 3>>,
    stop_logits: Vec<Tensor<B, 2>>,
}

impl<B: Backend> StepOutputs<B> {
    fn with_capacity(steps: usize) -> Self {
        Self {
            frames: Vec::with_capacity(steps),
            alignments: Vec::with_capacity(steps),
            stop_logits: Vec::with_capacity(steps),
        }
    }

    fn push(&mut self, frames: Tensor<B, 2>, stop: Tensor<B, 2>, alignment: Tensor<B, 2>) {
        self.frames.push(frames.unsqueeze_dim::<3>(1));
        self.alignments.push(alignment.unsqueeze_dim::<3>(1));
        self.stop_logits.push(stop);
    }

    fn finish(self, frame_channels: usize) -> DecoderOutput<B> {
        let frames = Tensor::cat(self.frames, 1);
        let [batch, steps, width] = frames.dims();
        DecoderOutput {
            frames: frames.reshape([batch, steps * width / frame_channels, frame_channels]),
            alignments: Tensor::cat(self.alignments, 1),
            stop_logits: Tensor::cat(self.stop_logits, 1),
        }
    }
}

impl<B: Backend> Decoder<B> {
    pub fn config(&self) -> &DecoderConfig {
        &self.settings.0
    }

    pub fn r(&self) -> usize {
        self.settings.0.r
    }

    /// Fresh state for `inputs: [batch, t_in, in_channels]`.
    pub fn init_state(&self, inputs: &Tensor<B, 3>) -> DecoderState<B> {
        let [batch, _, in_channels] = inputs.dims();
        let device = inputs.device();
        let cfg = &self.settings.0;
        DecoderState {
            memory: Tensor::zeros([batch, cfg.memory_width()], &device),
            context: Tensor::zeros([batch, in_channels], &device),
            attention: self.attention.init_state(inputs),
            attention_hidden: self.attention_rnn.zero_state(batch, &device),
            decoder_hidden: self
                .decoder_rnns
                .iter()
                .map(|cell| cell.zero_state(batch, &device))
                .collect(),
            steps: 0,
            stop_votes: vec![0; batch],
            stopped: vec![false; batch],
        }
    }

    /// Push `frames: [batch, r * frame_channels]` onto the memory queue.
    fn update_memory(&self, memory: Tensor<B, 2>, frames: Tensor<B, 2>) -> Tensor<B, 2> {
        let cfg = &self.settings.0;
        let width = cfg.frame_channels;
        if cfg.memory_size == 0 {
            frames.narrow(1, (cfg.r - 1) * width, width)
        } else if cfg.memory_size > cfg.r {
            let keep = (cfg.memory_size - cfg.r) * width;
            Tensor::cat(vec![frames, memory.narrow(1, 0, keep)], 1)
        } else {
            frames.narrow(1, 0, cfg.memory_size * width)
        }
    }

    /// One decoder step. Returns `(frames [batch, r * frame_channels],
    /// stop_logit [batch, 1], alignment [batch, t_in])`.
    pub fn step(
        &self,
        inputs: &Tensor<B, 3>,
        state: &mut DecoderState<B>,
        mask: Option<&Tensor<B, 2>>,
        training: bool,
    ) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
        let cfg = &self.settings.0;
        let prenet_out = self.prenet.forward(state.memory.clone(), training);
        let attention_hidden = self.attention_rnn.forward(
            Tensor::cat(vec![prenet_out, state.context.clone()], 1),
            state.attention_hidden.clone(),
        );
        let (context, alignment) = self.attention.step(
            attention_hidden.clone(),
            inputs,
            &mut state.attention,
            mask,
            training,
        );
        let mut output = self
            .project_to_decoder_in
            .forward(Tensor::cat(vec![attention_hidden.clone(), context.clone()], 1));
        for (cell, hidden) in self.decoder_rnns.iter().zip(state.decoder_hidden.iter_mut()) {
            let next = cell.forward(output.clone(), hidden.clone());
            *hidden = next.clone();
            output = output + next;
        }
        let frames = self.proj_to_mel.forward(output.clone());
        let mut stop_input = Tensor::cat(vec![output, frames.clone()], 1);
        if cfg.separate_stopnet {
            stop_input = stop_input.detach();
        }
        let stop = self
            .stopnet
            .forward(dropout(stop_input, STOPNET_DROPOUT, training));

        state.context = context;
        state.attention_hidden = attention_hidden;
        (frames, stop, alignment)
    }

    /// Teacher-forced decoding of `targets: [batch, t_out, frame_channels]`,
    /// where `t_out` is a multiple of `r`.
    pub fn forward(
        &self,
        inputs: Tensor<B, 3>,
        targets: Tensor<B, 3>,
        mask: Option<&Tensor<B, 2>>,
        training: bool,
    ) -> DecoderOutput<B> {
        let _span = perf::span(Metric::DecoderTeacherForced);
        let cfg = &self.settings.0;
        let [batch, t_out, channels] = targets.dims();
        let steps = t_out / cfg.r;
        let groups = targets.reshape([batch, steps, cfg.r * channels]);
        let mut state = self.init_state(&inputs);
        let mut outputs = StepOutputs::with_capacity(steps);
        for t in 0..steps {
            if t > 0 {
                let previous = groups
                    .clone()
                    .narrow(1, t - 1, 1)
                    .reshape([batch, cfg.r * channels]);
                state.memory = self.update_memory(state.memory.clone(), previous);
            }
            let (frames, stop, alignment) = self.step(&inputs, &mut state, mask, training);
            outputs.push(frames, stop, alignment);
            state.steps += 1;
        }
        perf::add_count(Metric::DecoderFrames, (steps * cfg.r) as u64);
        outputs.finish(channels)
    }

    /// Free-running decoding until every item stops or `max_decoder_steps`.
    /// The flag reports whether the stop condition was met.
    pub fn inference(&self, inputs: Tensor<B, 3>, mask: Option<&Tensor<B, 2>>) -> (DecoderOutput<B>, bool) {
        let mut state = self.init_state(&inputs);
        let limit = self.settings.0.max_decoder_steps.max(1);
        let output = self.decode(&inputs, &mut state, mask, limit);
        (output, state.finished())
    }

    /// Decode at most `steps` further steps from `state` (or a fresh state)
    /// and return the live state for the next chunk.
    ///
    /// The step budget is shared across chunks: once `max_decoder_steps` have
    /// run, further calls return an empty chunk and leave the state as is.
    pub fn inference_truncated(
        &self,
        inputs: Tensor<B, 3>,
        state: Option<DecoderState<B>>,
        mask: Option<&Tensor<B, 2>>,
        steps: usize,
    ) -> (DecoderOutput<B>, DecoderState<B>) {
        let mut state = state.unwrap_or_else(|| self.init_state(&inputs));
        let remaining = self.settings.0.max_decoder_steps.saturating_sub(state.steps);
        let output = self.decode(&inputs, &mut state, mask, steps.min(remaining));
        (output, state)
    }

    /// Returns an empty chunk when `max_steps` is zero.
    fn decode(
        &self,
        inputs: &Tensor<B, 3>,
        state: &mut DecoderState<B>,
        mask: Option<&Tensor<B, 2>>,
        max_steps: usize,
    ) -> DecoderOutput<B> {
        let _span = perf::span(Metric::DecoderInference);
        let cfg = &self.settings.0;
        if max_steps == 0 {
            let [batch, t_in, _] = inputs.dims();
            let device = inputs.device();
            return DecoderOutput {
                frames: Tensor::zeros([batch, 0, cfg.frame_channels], &device),
                alignments: Tensor::zeros([batch, 0, t_in], &device),
                stop_logits: Tensor::zeros([batch, 0], &device),
            };
        }
        let mut outputs = StepOutputs::with_capacity(max_steps.min(1024));
        for _ in 0..max_steps {
            let (frames, stop, alignment) = self.step(inputs, state, mask, false);
            state.memory = self.update_memory(state.memory.clone(), frames.clone());
            state.steps += 1;
            let probabilities: Vec<f32> = sigmoid(stop.clone()).into_data().iter::<f32>().collect();
            for (idx, p) in probabilities.into_iter().enumerate() {
                if p > cfg.stop_threshold {
                    state.stop_votes[idx] += 1;
                } else {
                    state.stop_votes[idx] = 0;
                }
                if state.stop_votes[idx] >= cfg.stop_patience {
                    state.stopped[idx] = true;
                }
            }
            outputs.push(frames, stop, alignment);
            if state.finished() {
                break;
            }
        }
        let output = outputs.finish(cfg.frame_channels);
        perf::add_count(Metric::DecoderFrames, (output.steps() * cfg.r) as u64);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttentionConfig, AttentionNorm};
    use crate::modules::attention::AttentionScore;
    use burn::tensor::Distribution;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn config(r: usize, memory_size: usize) -> DecoderConfig {
        DecoderConfig {
            in_channels: 6,
            frame_channels: 3,
            r,
            memory_size,
            prenet_dims: vec![8, 4],
            prenet_always_dropout: true,
            rnn_dim: 8,
            layers: 2,
            attention_dim: 5,
            strategy: AttentionStrategy::from_config(&AttentionConfig::default()),
            separate_stopnet: true,
            stop_threshold: 0.5,
            stop_patience: 1,
            max_decoder_steps: 7,
        }
    }

    fn inputs(batch: usize, t_in: usize) -> Tensor<TestBackend, 3> {
        Tensor::random([batch, t_in, 6], Distribution::Normal(0.0, 1.0), &NdArrayDevice::default())
    }

    #[test]
    fn teacher_forcing_shapes() {
        let device = NdArrayDevice::default();
        let decoder = config(2, 5).init::<TestBackend>(&device);
        let targets = Tensor::<TestBackend, 3>::ones([2, 8, 3], &device);
        let out = decoder.forward(inputs(2, 4), targets, None, true);
        assert_eq!(out.frames.dims(), [2, 8, 3]);
        assert_eq!(out.alignments.dims(), [2, 4, 4]);
        assert_eq!(out.stop_logits.dims(), [2, 4]);
    }

    #[test]
    fn memory_queue_keeps_newest_first() {
        let device = NdArrayDevice::default();
        let decoder = config(1, 2).init::<TestBackend>(&device);
        let old = Tensor::<TestBackend, 2>::from_data(
            burn::tensor::TensorData::new(vec![1.0_f32, 1.0, 1.0, 2.0, 2.0, 2.0], [1, 6]),
            &device,
        );
        let new = Tensor::<TestBackend, 2>::full([1, 3], 9.0, &device);
        let updated: Vec<f32> = decoder.update_memory(old, new).into_data().iter::<f32>().collect();
        assert_eq!(updated, vec![9.0, 9.0, 9.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn inference_is_bounded_by_max_steps() {
        let device = NdArrayDevice::default();
        let mut cfg = config(1, 0);
        cfg.stop_threshold = 2.0;
        let decoder = cfg.init::<TestBackend>(&device);
        let (out, finished) = decoder.inference(inputs(1, 3), None);
        assert!(!finished);
        assert_eq!(out.steps(), 7);
        assert_eq!(out.frames.dims(), [1, 7, 3]);
    }

    #[test]
    fn inference_stops_when_every_item_votes() {
        let device = NdArrayDevice::default();
        let mut cfg = config(1, 0);
        cfg.stop_threshold = -1.0;
        let decoder = cfg.init::<TestBackend>(&device);
        let (out, finished) = decoder.inference(inputs(2, 3), None);
        assert!(finished);
        assert_eq!(out.steps(), 1);
    }

    #[test]
    fn truncated_inference_resumes_state() {
        let device = NdArrayDevice::default();
        let mut cfg = config(1, 2);
        cfg.stop_threshold = 2.0;
        cfg.strategy.score = AttentionScore::Location { filters: 2, kernel: 3 };
        cfg.strategy.norm = AttentionNorm::Sigmoid;
        let decoder = cfg.init::<TestBackend>(&device);
        let encoded = inputs(1, 3);
        let (first, state) = decoder.inference_truncated(encoded.clone(), None, None, 3);
        assert_eq!(first.steps(), 3);
        assert_eq!(state.steps, 3);
        let (second, state) = decoder.inference_truncated(encoded, Some(state), None, 10);
        assert_eq!(second.steps(), 4);
        assert_eq!(state.steps, 7);
    }
}
