//! Invertible flow layers: activation normalization, invertible 1x1 channel
//! mixing and affine coupling, plus time/channel squeezing.
//!
//! All layers work on `[batch, channels, time]` tensors with a
//! `[batch, 1, time]` mask and return a per-item log-determinant `[batch]`.

use crate::modules::conv::{forward_same, same_conv1d};
use crate::modules::prenet::dropout;
use burn::module::{Ignored, Module, Param};
use burn::tensor::activation::{sigmoid, tanh};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use burn_nn::conv::{Conv1d, Conv1dConfig};
use burn_nn::Initializer;
use rand::Rng;

/// Per-channel affine normalization initialized from data statistics.
#[derive(Module, Debug)]
pub struct ActNorm<B: Backend> {
    logs: Param<Tensor<B, 1>>,
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> ActNorm<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            logs: Param::from_tensor(Tensor::zeros([channels], device)),
            bias: Param::from_tensor(Tensor::zeros([channels], device)),
        }
    }

    fn channels(&self) -> usize {
        self.logs.dims()[0]
    }

    pub fn forward(&self, x: Tensor<B, 3>, mask: Tensor<B, 3>, reverse: bool) -> (Tensor<B, 3>, Tensor<B, 1>) {
        let channels = self.channels();
        let logs = self.logs.val().reshape([1, channels, 1]);
        let bias = self.bias.val().reshape([1, channels, 1]);
        let lengths = mask.clone().sum_dim(2).reshape([mask.dims()[0]]);
        if reverse {
            let z = (x - bias) * logs.neg().exp() * mask;
            let logdet = lengths.mul_scalar(0.0);
            (z, logdet)
        } else {
            let z = (bias + logs.exp() * x) * mask;
            let logdet = lengths * self.logs.val().sum();
            (z, logdet)
        }
    }

    /// Set `bias` and `logs` so that masked frames of `x` come out with zero
    /// mean and unit variance per channel. Parameter identities are kept.
    pub fn calibrate(self, x: Tensor<B, 3>, mask: Tensor<B, 3>) -> Self {
        let channels = self.channels();
        let x = x.detach();
        let mask = mask.detach();
        let denom = mask.clone().sum().clamp_min(1.0);
        let masked = x.clone() * mask.clone();
        let mean = masked
            .clone()
            .sum_dim(2)
            .sum_dim(0)
            .reshape([channels])
            .div(denom.clone());
        let mean_sq = (masked * x)
            .sum_dim(2)
            .sum_dim(0)
            .reshape([channels])
            .div(denom);
        let variance = mean_sq - mean.clone().powf_scalar(2.0);
        let logs = variance.clamp_min(1e-6).log().mul_scalar(-0.5);
        let bias = mean.neg() * logs.clone().exp();
        Self {
            logs: Param::initialized(self.logs.id, logs.detach().require_grad()),
            bias: Param::initialized(self.bias.id, bias.detach().require_grad()),
        }
    }
}

/// Invertible channel mixing over groups of `n_split` channels.
///
/// The mixing matrix is kept in LU form, `W = P·L·(U + diag(sign·exp(log_s)))`,
/// so its log-determinant is `Σ log_s`. The inverse is only needed for
/// sampling and is computed on the host.
#[derive(Module, Debug)]
pub struct InvConvNear<B: Backend> {
    lower: Param<Tensor<B, 2>>,
    upper: Param<Tensor<B, 2>>,
    log_s: Param<Tensor<B, 1>>,
    sign_s: Ignored<Vec<f32>>,
    permutation: Ignored<Vec<f32>>,
    n_split: usize,
}

impl<B: Backend> InvConvNear<B> {
    pub fn new(n_split: usize, device: &B::Device) -> Self {
        let mut rng = rand::thread_rng();
        let gaussian: Vec<f64> = (0..n_split * n_split)
            .map(|_| {
                let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
                let u2: f64 = rng.gen();
                (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
            })
            .collect();
        let weight = orthogonalize(gaussian, n_split);
        let lu = lu_decompose(&weight, n_split);
        let tensor = |values: Vec<f64>, shape: Vec<usize>| {
            let values: Vec<f32> = values.into_iter().map(|v| v as f32).collect();
            TensorData::new(values, shape)
        };
        Self {
            lower: Param::from_tensor(Tensor::from_data(tensor(lu.lower, vec![n_split, n_split]), device)),
            upper: Param::from_tensor(Tensor::from_data(tensor(lu.upper, vec![n_split, n_split]), device)),
            log_s: Param::from_tensor(Tensor::from_data(
                tensor(lu.diag.iter().map(|d| d.abs().ln()).collect(), vec![n_split]),
                device,
            )),
            sign_s: Ignored(lu.diag.iter().map(|d| d.signum() as f32).collect()),
            permutation: Ignored(lu.permutation.into_iter().map(|v| v as f32).collect()),
            n_split,
        }
    }

    /// The mixing matrix `[n_split, n_split]`.
    pub fn weight(&self) -> Tensor<B, 2> {
        let n = self.n_split;
        let device = self.log_s.device();
        let constant = |values: Vec<f32>| Tensor::<B, 2>::from_data(TensorData::new(values, [n, n]), &device);
        let mut lower_mask = vec![0.0_f32; n * n];
        let mut upper_mask = vec![0.0_f32; n * n];
        let mut eye = vec![0.0_f32; n * n];
        for i in 0..n {
            for j in 0..n {
                if j < i {
                    lower_mask[i * n + j] = 1.0;
                } else if j > i {
                    upper_mask[i * n + j] = 1.0;
                } else {
                    eye[i * n + j] = 1.0;
                }
            }
        }
        let eye = constant(eye);
        let sign = Tensor::<B, 1>::from_data(TensorData::new(self.sign_s.0.clone(), [n]), &device);
        let diag = eye.clone() * (sign * self.log_s.val().exp()).unsqueeze_dim::<2>(0);
        let lower = self.lower.val() * constant(lower_mask) + eye;
        let upper = self.upper.val() * constant(upper_mask) + diag;
        constant(self.permutation.0.clone()).matmul(lower).matmul(upper)
    }

    pub fn forward(&self, x: Tensor<B, 3>, mask: Tensor<B, 3>, reverse: bool) -> (Tensor<B, 3>, Tensor<B, 1>) {
        let [batch, channels, time] = x.dims();
        let n = self.n_split;
        let group = channels / n;
        let lengths = mask.clone().sum_dim(2).reshape([batch]);

        let grouped = x
            .reshape([batch, 2, group, n / 2, time])
            .permute([0, 1, 3, 2, 4])
            .reshape([batch, n, group, time]);
        let (weight, logdet) = if reverse {
            (self.inverse_weight(), lengths.mul_scalar(0.0))
        } else {
            let logdet = lengths * self.log_s.val().sum().mul_scalar(group as f32);
            (self.weight(), logdet)
        };
        // out[o] = Σ_i W[o, i] · x[i] over the group axis.
        let mixed = grouped
            .permute([0, 2, 3, 1])
            .matmul(weight.transpose().unsqueeze_dim::<3>(0).unsqueeze_dim::<4>(0))
            .permute([0, 3, 1, 2]);
        let z = mixed
            .reshape([batch, 2, n / 2, group, time])
            .permute([0, 1, 3, 2, 4])
            .reshape([batch, channels, time]);
        (z * mask, logdet)
    }

    fn inverse_weight(&self) -> Tensor<B, 2> {
        let n = self.n_split;
        let device = self.log_s.device();
        let weight: Vec<f64> = self
            .weight()
            .into_data()
            .iter::<f32>()
            .map(f64::from)
            .collect();
        let inverse: Vec<f32> = invert(&weight, n).into_iter().map(|v| v as f32).collect();
        Tensor::from_data(TensorData::new(inverse, [n, n]), &device)
    }
}

/// Gated dilated convolution stack conditioned on an optional global vector.
#[derive(Module, Debug)]
pub struct WaveNet<B: Backend> {
    in_layers: Vec<Conv1d<B>>,
    res_skip_layers: Vec<Conv1d<B>>,
    cond_layer: Option<Conv1d<B>>,
    hidden: usize,
    dropout: f64,
}

impl<B: Backend> WaveNet<B> {
    pub fn new(
        hidden: usize,
        kernel: usize,
        layers: usize,
        cond_channels: usize,
        dropout: f64,
        device: &B::Device,
    ) -> Self {
        let mut in_layers = Vec::with_capacity(layers);
        let mut res_skip_layers = Vec::with_capacity(layers);
        for idx in 0..layers {
            in_layers.push(
                same_conv1d(hidden, 2 * hidden, kernel).init(device),
            );
            let out = if idx + 1 < layers { 2 * hidden } else { hidden };
            res_skip_layers.push(Conv1dConfig::new(hidden, out, 1).init(device));
        }
        let cond_layer = (cond_channels > 0)
            .then(|| Conv1dConfig::new(cond_channels, 2 * hidden * layers, 1).init(device));
        Self {
            in_layers,
            res_skip_layers,
            cond_layer,
            hidden,
            dropout,
        }
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        mask: Tensor<B, 3>,
        g: Option<Tensor<B, 3>>,
        training: bool,
    ) -> Tensor<B, 3> {
        let h = self.hidden;
        let cond = match (&self.cond_layer, g) {
            (Some(layer), Some(g)) => Some(layer.forward(g)),
            _ => None,
        };
        let mut x = x;
        let mut output = x.zeros_like();
        let layers = self.in_layers.len();
        for (idx, (in_layer, res_skip)) in self.in_layers.iter().zip(self.res_skip_layers.iter()).enumerate() {
            let mut x_in = forward_same(in_layer, x.clone());
            if let Some(cond) = &cond {
                x_in = x_in + cond.clone().narrow(1, idx * 2 * h, 2 * h);
            }
            let acts = tanh(x_in.clone().narrow(1, 0, h)) * sigmoid(x_in.narrow(1, h, h));
            let acts = dropout(acts, self.dropout, training);
            let res = res_skip.forward(acts);
            if idx + 1 < layers {
                x = (x + res.clone().narrow(1, 0, h)) * mask.clone();
                output = output + res.narrow(1, h, h);
            } else {
                output = output + res;
            }
        }
        output * mask
    }
}

/// Affine coupling: the first half of the channels predicts a shift and log
/// scale for the second half.
#[derive(Module, Debug)]
pub struct CouplingBlock<B: Backend> {
    start: Conv1d<B>,
    wavenet: WaveNet<B>,
    end: Conv1d<B>,
}

impl<B: Backend> CouplingBlock<B> {
    pub fn new(
        channels: usize,
        hidden: usize,
        kernel: usize,
        layers: usize,
        cond_channels: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            start: Conv1dConfig::new(channels / 2, hidden, 1).init(device),
            wavenet: WaveNet::new(hidden, kernel, layers, cond_channels, 0.05, device),
            end: Conv1dConfig::new(hidden, channels, 1)
                .with_initializer(Initializer::Zeros)
                .init(device),
        }
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        mask: Tensor<B, 3>,
        g: Option<Tensor<B, 3>>,
        reverse: bool,
        training: bool,
    ) -> (Tensor<B, 3>, Tensor<B, 1>) {
        let [batch, channels, _] = x.dims();
        let half = channels / 2;
        let x0 = x.clone().narrow(1, 0, half);
        let x1 = x.narrow(1, half, channels - half);
        let hidden = self.start.forward(x0.clone()) * mask.clone();
        let hidden = self.wavenet.forward(hidden, mask.clone(), g, training);
        let out = self.end.forward(hidden);
        let shift = out.clone().narrow(1, 0, half);
        let logs = out.narrow(1, half, channels - half);
        if reverse {
            let z1 = (x1 - shift) * logs.neg().exp() * mask.clone();
            (Tensor::cat(vec![x0, z1], 1), Tensor::zeros([batch], &mask.device()))
        } else {
            let z1 = (shift + logs.clone().exp() * x1) * mask.clone();
            let logdet = (logs * mask).sum_dim(2).sum_dim(1).reshape([batch]);
            (Tensor::cat(vec![x0, z1], 1), logdet)
        }
    }
}

/// One flow step: ActNorm, channel mixing, coupling.
#[derive(Module, Debug)]
pub struct FlowStep<B: Backend> {
    pub actnorm: ActNorm<B>,
    pub invconv: InvConvNear<B>,
    pub coupling: CouplingBlock<B>,
}

impl<B: Backend> FlowStep<B> {
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        mask: Tensor<B, 3>,
        g: Option<Tensor<B, 3>>,
        reverse: bool,
        training: bool,
    ) -> (Tensor<B, 3>, Tensor<B, 1>) {
        if reverse {
            let (x, ld_c) = self.coupling.forward(x, mask.clone(), g, true, training);
            let (x, ld_i) = self.invconv.forward(x, mask.clone(), true);
            let (x, ld_a) = self.actnorm.forward(x, mask, true);
            (x, ld_a + ld_i + ld_c)
        } else {
            let (x, ld_a) = self.actnorm.forward(x, mask.clone(), false);
            let (x, ld_i) = self.invconv.forward(x, mask.clone(), false);
            let (x, ld_c) = self.coupling.forward(x, mask, g, false, training);
            (x, ld_a + ld_i + ld_c)
        }
    }
}

/// Fold `n` consecutive frames into channels: `[b, c, t]` → `[b, c·n, t/n]`.
pub fn squeeze<B: Backend>(x: Tensor<B, 3>, mask: Tensor<B, 3>, n: usize) -> (Tensor<B, 3>, Tensor<B, 3>) {
    let [batch, channels, time] = x.dims();
    let time = (time / n) * n;
    let x = x.narrow(2, 0, time);
    let squeezed = x
        .reshape([batch, channels, time / n, n])
        .permute([0, 3, 1, 2])
        .reshape([batch, channels * n, time / n]);
    let mask = mask
        .narrow(2, 0, time)
        .reshape([batch, 1, time / n, n])
        .narrow(3, n - 1, 1)
        .reshape([batch, 1, time / n]);
    (squeezed * mask.clone(), mask)
}

/// Inverse of [`squeeze`].
pub fn unsqueeze<B: Backend>(x: Tensor<B, 3>, mask: Tensor<B, 3>, n: usize) -> (Tensor<B, 3>, Tensor<B, 3>) {
    let [batch, channels, time] = x.dims();
    let unsqueezed = x
        .reshape([batch, n, channels / n, time])
        .permute([0, 2, 3, 1])
        .reshape([batch, channels / n, time * n]);
    let mask = mask
        .unsqueeze_dim::<4>(3)
        .repeat_dim(3, n)
        .reshape([batch, 1, time * n]);
    (unsqueezed * mask.clone(), mask)
}

struct Lu {
    permutation: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    diag: Vec<f64>,
}

/// Gram-Schmidt orthonormalization of the rows of an `n × n` matrix.
fn orthogonalize(mut m: Vec<f64>, n: usize) -> Vec<f64> {
    for i in 0..n {
        for j in 0..i {
            let dot: f64 = (0..n).map(|k| m[i * n + k] * m[j * n + k]).sum();
            for k in 0..n {
                m[i * n + k] -= dot * m[j * n + k];
            }
        }
        let norm = (0..n).map(|k| m[i * n + k].powi(2)).sum::<f64>().sqrt().max(1e-12);
        for k in 0..n {
            m[i * n + k] /= norm;
        }
    }
    m
}

/// `A = P·L·U` with partial pivoting; `U` is returned without its diagonal.
fn lu_decompose(a: &[f64], n: usize) -> Lu {
    let mut u = a.to_vec();
    let mut lower = vec![0.0; n * n];
    let mut perm: Vec<usize> = (0..n).collect();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&x, &y| u[x * n + col].abs().total_cmp(&u[y * n + col].abs()))
            .unwrap_or(col);
        if pivot != col {
            for k in 0..n {
                u.swap(col * n + k, pivot * n + k);
            }
            for k in 0..col {
                lower.swap(col * n + k, pivot * n + k);
            }
            perm.swap(col, pivot);
        }
        for row in col + 1..n {
            let factor = u[row * n + col] / u[col * n + col];
            lower[row * n + col] = factor;
            for k in col..n {
                u[row * n + k] -= factor * u[col * n + k];
            }
        }
    }
    let diag: Vec<f64> = (0..n).map(|i| u[i * n + i]).collect();
    for i in 0..n {
        u[i * n + i] = 0.0;
    }
    // Rows of P·A were reordered by `perm`, so A = Pᵀ·L·U.
    let mut permutation = vec![0.0; n * n];
    for (row, &src) in perm.iter().enumerate() {
        permutation[src * n + row] = 1.0;
    }
    Lu {
        permutation,
        lower,
        upper: u,
        diag,
    }
}

/// Gauss-Jordan inverse of an `n × n` matrix.
fn invert(a: &[f64], n: usize) -> Vec<f64> {
    let mut m = a.to_vec();
    let mut inv = vec![0.0; n * n];
    for i in 0..n {
        inv[i * n + i] = 1.0;
    }
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&x, &y| m[x * n + col].abs().total_cmp(&m[y * n + col].abs()))
            .unwrap_or(col);
        for k in 0..n {
            m.swap(col * n + k, pivot * n + k);
            inv.swap(col * n + k, pivot * n + k);
        }
        let p = m[col * n + col];
        for k in 0..n {
            m[col * n + k] /= p;
            inv[col * n + k] /= p;
        }
        for row in 0..n {
            if row != col {
                let factor = m[row * n + col];
                for k in 0..n {
                    m[row * n + k] -= factor * m[col * n + k];
                    inv[row * n + k] -= factor * inv[col * n + k];
                }
            }
        }
    }
    inv
}
