//! Attention mechanisms for the autoregressive decoder.
//!
//! A single [`Attention`] module covers every supported policy. The policy is
//! fixed at construction by an [`AttentionStrategy`] value:
//!
//! * the score is either content based (`v·tanh(Wq q + Wi x)`) or location
//!   sensitive, adding a convolution over the previous and cumulative
//!   alignment;
//! * energies are normalized by softmax or by `σ(e) / Σ σ(e)`;
//! * forward attention optionally constrains each step to stay or advance by
//!   one position: `α_t(i) ∝ ((1-u)·α_{t-1}(i) + u·α_{t-1}(i-1))·p_t(i)`,
//!   where `u` is either 0.5 or produced by a learned transition agent;
//! * a hard window optionally limits inference to a band around each item's
//!   previous peak.
//!
//! Masked and out-of-window positions receive `-1e9` energy, so they get
//! exactly zero probability after either normalization.

use crate::config::{AttentionConfig, AttentionKind, AttentionNorm};
use crate::modules::conv::{forward_same, same_conv1d};
use burn::module::{Ignored, Module};
use burn::tensor::activation::{sigmoid, softmax, tanh};
use burn::tensor::backend::Backend;
use burn::tensor::{Bool, Tensor, TensorData};
use burn_nn::conv::Conv1d;
use burn_nn::{Linear, LinearConfig};

const MASK_VALUE: f32 = -1e9;

/// How raw energies are scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionScore {
    Content,
    Location { filters: usize, kernel: usize },
}

/// Source of the forward-attention transition probability `u`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionGate {
    /// `u = 0.5`.
    Fixed,
    /// `u = σ(W [context; query])`.
    Learned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardAttention {
    pub gate: TransitionGate,
    /// At inference, keep the peak within a few positions of the last one.
    pub inference_mask: bool,
}

/// Positions kept around the previous peak at inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardWindow {
    pub back: usize,
    pub front: usize,
}

/// Complete attention policy, chosen once per decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionStrategy {
    pub score: AttentionScore,
    pub norm: AttentionNorm,
    pub forward: Option<ForwardAttention>,
    pub window: Option<HardWindow>,
}

impl AttentionStrategy {
    pub fn from_config(config: &AttentionConfig) -> Self {
        let score = match config.kind {
            AttentionKind::Original => AttentionScore::Content,
            AttentionKind::Location => AttentionScore::Location {
                filters: config.location_filters,
                kernel: config.location_kernel,
            },
        };
        let forward = config.forward_attn.then_some(ForwardAttention {
            gate: if config.trans_agent {
                TransitionGate::Learned
            } else {
                TransitionGate::Fixed
            },
            inference_mask: config.forward_attn_mask,
        });
        let window = config.windowing.then_some(HardWindow {
            back: config.window_back,
            front: config.window_front,
        });
        Self {
            score,
            norm: config.norm,
            forward,
            window,
        }
    }
}

/// Convolution over `[previous; cumulative]` alignments projected to the attention width.
#[derive(Module, Debug)]
pub struct LocationLayer<B: Backend> {
    conv: Conv1d<B>,
    dense: Linear<B>,
}

impl<B: Backend> LocationLayer<B> {
    fn new(filters: usize, kernel: usize, attention_dim: usize, device: &B::Device) -> Self {
        Self {
            conv: same_conv1d(2, filters, kernel)
                .with_bias(false)
                .init(device),
            dense: LinearConfig::new(filters, attention_dim)
                .with_bias(false)
                .init(device),
        }
    }

    /// `[batch, 2, t_in]` → `[batch, t_in, attention_dim]`.
    fn forward(&self, alignments: Tensor<B, 3>) -> Tensor<B, 3> {
        self.dense.forward(forward_same(&self.conv, alignments).swap_dims(1, 2))
    }
}

/// Per-sequence attention state, created at decode start.
#[derive(Debug, Clone)]
pub struct AttentionState<B: Backend> {
    /// Input projection, computed once per sequence.
    pub processed_inputs: Tensor<B, 3>,
    /// Alignment of the previous step `[batch, t_in]`.
    pub weights: Tensor<B, 2>,
    /// Sum of pre-forward alignments so far.
    pub weights_cum: Tensor<B, 2>,
    /// Forward-attention variable `α`.
    pub alpha: Tensor<B, 2>,
    /// Transition probability `[batch, 1]`.
    pub u: Tensor<B, 2>,
    /// Previous peak position per item, used by the hard window.
    pub peaks: Vec<usize>,
}

#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    query_layer: Linear<B>,
    inputs_layer: Linear<B>,
    v: Linear<B>,
    location: Option<LocationLayer<B>>,
    transition_agent: Option<Linear<B>>,
    strategy: Ignored<AttentionStrategy>,
}

impl<B: Backend> Attention<B> {
    pub fn new(
        query_dim: usize,
        input_dim: usize,
        attention_dim: usize,
        strategy: AttentionStrategy,
        device: &B::Device,
    ) -> Self {
        let location = match strategy.score {
            AttentionScore::Location { filters, kernel } => {
                Some(LocationLayer::new(filters, kernel, attention_dim, device))
            }
            AttentionScore::Content => None,
        };
        let transition_agent = match strategy.forward {
            Some(ForwardAttention {
                gate: TransitionGate::Learned,
                ..
            }) => Some(LinearConfig::new(input_dim + query_dim, 1).init(device)),
            _ => None,
        };
        Self {
            query_layer: LinearConfig::new(query_dim, attention_dim)
                .with_bias(false)
                .init(device),
            inputs_layer: LinearConfig::new(input_dim, attention_dim)
                .with_bias(false)
                .init(device),
            v: LinearConfig::new(attention_dim, 1).init(device),
            location,
            transition_agent,
            strategy: Ignored(strategy),
        }
    }

    pub fn strategy(&self) -> &AttentionStrategy {
        &self.strategy.0
    }

    /// Fresh state for `inputs: [batch, t_in, input_dim]`.
    pub fn init_state(&self, inputs: &Tensor<B, 3>) -> AttentionState<B> {
        let [batch, t_in, _] = inputs.dims();
        let device = inputs.device();
        let mut alpha = vec![0.0_f32; batch * t_in];
        for row in 0..batch {
            alpha[row * t_in] = 1.0;
        }
        AttentionState {
            processed_inputs: self.inputs_layer.forward(inputs.clone()),
            weights: Tensor::zeros([batch, t_in], &device),
            weights_cum: Tensor::zeros([batch, t_in], &device),
            alpha: Tensor::from_data(TensorData::new(alpha, [batch, t_in]), &device),
            u: Tensor::full([batch, 1], 0.5, &device),
            peaks: vec![0; batch],
        }
    }

    /// One attention step.
    ///
    /// `query: [batch, query_dim]`, `inputs: [batch, t_in, input_dim]`,
    /// `mask: [batch, t_in]` with 1 on valid positions. Returns the context
    /// vector `[batch, input_dim]` and the alignment `[batch, t_in]`.
    pub fn step(
        &self,
        query: Tensor<B, 2>,
        inputs: &Tensor<B, 3>,
        state: &mut AttentionState<B>,
        mask: Option<&Tensor<B, 2>>,
        training: bool,
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let [batch, t_in, input_dim] = inputs.dims();
        let strategy = self.strategy.0;

        let processed_query = self.query_layer.forward(query.clone()).unsqueeze_dim::<3>(1);
        let mut hidden = processed_query + state.processed_inputs.clone();
        if let Some(location) = &self.location {
            let history = Tensor::cat(
                vec![
                    state.weights.clone().unsqueeze_dim::<3>(1),
                    state.weights_cum.clone().unsqueeze_dim::<3>(1),
                ],
                1,
            );
            hidden = hidden + location.forward(history);
        }
        let mut energies = self.v.forward(tanh(hidden)).reshape([batch, t_in]);

        if let Some(mask) = mask {
            energies = energies.mask_fill(mask.clone().lower_elem(0.5), MASK_VALUE);
        }
        if let (Some(window), false) = (strategy.window, training) {
            let outside = window_mask::<B>(&state.peaks, t_in, window, &inputs.device());
            energies = energies.mask_fill(outside, MASK_VALUE);
        }

        let mut alignment = match strategy.norm {
            AttentionNorm::Softmax => softmax(energies, 1),
            AttentionNorm::Sigmoid => {
                let scores = sigmoid(energies);
                let total = scores.clone().sum_dim(1).clamp_min(f32::MIN_POSITIVE);
                scores / total
            }
        };

        if self.location.is_some() {
            state.weights_cum = state.weights_cum.clone() + alignment.clone();
        }

        if let Some(forward) = strategy.forward {
            let shifted = shift_right(state.alpha.clone());
            let u = state.u.clone();
            let mut alpha =
                (u.clone().neg().add_scalar(1.0) * state.alpha.clone() + u * shifted.clone())
                    * alignment;
            if forward.inference_mask && !training {
                alpha = constrain_forward_peak(alpha, shifted);
            }
            let total = alpha.clone().sum_dim(1).clamp_min(f32::MIN_POSITIVE);
            alignment = alpha / total;
            state.alpha = alignment.clone();
        }

        let context = alignment
            .clone()
            .unsqueeze_dim::<3>(1)
            .matmul(inputs.clone())
            .reshape([batch, input_dim]);
        state.weights = alignment.clone();

        if let Some(agent) = &self.transition_agent {
            state.u = sigmoid(agent.forward(Tensor::cat(vec![context.clone(), query], 1)));
        }
        if strategy.window.is_some() && !training {
            state.peaks = row_argmax(&alignment);
        }

        (context, alignment)
    }
}

/// `[batch, t]` → `[batch, t]` shifted one position to the right, zero filled.
fn shift_right<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let [batch, t] = x.dims();
    let zeros = Tensor::zeros([batch, 1], &x.device());
    if t <= 1 {
        return zeros.narrow(1, 0, t);
    }
    Tensor::cat(vec![zeros, x.narrow(1, 0, t - 1)], 1)
}

fn row_argmax<B: Backend>(x: &Tensor<B, 2>) -> Vec<usize> {
    x.clone()
        .argmax(1)
        .into_data()
        .iter::<i64>()
        .map(|idx| idx.max(0) as usize)
        .collect()
}

/// True outside `[peak - back, peak + front)` for each row.
fn window_mask<B: Backend>(
    peaks: &[usize],
    t_in: usize,
    window: HardWindow,
    device: &B::Device,
) -> Tensor<B, 2, Bool> {
    let mut outside = Vec::with_capacity(peaks.len() * t_in);
    for &peak in peaks {
        let start = peak.saturating_sub(window.back);
        let end = (peak + window.front).min(t_in);
        outside.extend((0..t_in).map(|i| i < start || i >= end));
    }
    Tensor::from_data(TensorData::new(outside, [peaks.len(), t_in]), device)
}

/// Zero `α` outside `[n - 1, n + 3)` around the previous peak `n`, leaving a
/// small weight at `n - 2`.
fn constrain_forward_peak<B: Backend>(alpha: Tensor<B, 2>, shifted: Tensor<B, 2>) -> Tensor<B, 2> {
    let [batch, t_in] = alpha.dims();
    let device = alpha.device();
    let peaks = row_argmax(&shifted);
    let data = alpha.into_data();
    let mut values: Vec<f32> = data.iter::<f32>().collect();
    for (row, &peak) in peaks.iter().enumerate() {
        let slice = &mut values[row * t_in..(row + 1) * t_in];
        let max = slice.iter().fold(0.0_f32, |acc, v| acc.max(*v));
        for (i, value) in slice.iter_mut().enumerate() {
            if i + 1 < peak || i >= peak + 3 {
                *value = 0.0;
            }
        }
        if peak >= 2 {
            slice[peak - 2] = 0.01 * max;
        }
    }
    Tensor::from_data(TensorData::new(values, [batch, t_in]), &device)
}
