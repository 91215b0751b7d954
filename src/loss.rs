//! Training criteria for both model families.
//!
//! [`LossAggregator`] turns model predictions plus the batch into a
//! [`LossBreakdown`]: a weighted total used for backpropagation and the
//! unweighted components kept for logging. Components are checked for
//! finiteness on the host before any backward pass.

use crate::config::{KlScheduleConfig, KlScheduleKind, LossConfig, ReconstructionLoss};
use crate::data::DeviceBatch;
use crate::error::TrainError;
use crate::train::distributed::{reduce_metrics, Collective};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor, TensorData};
use std::collections::BTreeMap;

/// Name of the component that is logged as the run's headline loss.
pub const MAIN_LOSS: &str = "loss";

/// Loss components of one forward pass.
#[derive(Debug, Clone)]
pub struct LossBreakdown<B: Backend> {
    /// Weighted sum used for backpropagation.
    pub total: Tensor<B, 1>,
    /// Named unweighted components; always contains [`MAIN_LOSS`].
    pub components: Vec<(&'static str, Tensor<B, 1>)>,
}

impl<B: Backend> LossBreakdown<B> {
    /// Pull every component to the host, failing on the first non-finite value.
    pub fn to_host(&self, step: usize) -> Result<Vec<(&'static str, f32)>, TrainError> {
        let total = scalar(self.total.clone());
        if !total.is_finite() {
            return Err(TrainError::NonFiniteLoss {
                step,
                component: "total".to_string(),
                value: total,
            });
        }
        let mut values = Vec::with_capacity(self.components.len());
        for (name, tensor) in &self.components {
            let value = scalar(tensor.clone());
            if !value.is_finite() {
                return Err(TrainError::NonFiniteLoss {
                    step,
                    component: (*name).to_string(),
                    value,
                });
            }
            values.push((*name, value));
        }
        Ok(values)
    }
}

pub(crate) fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f32 {
    tensor.into_scalar().elem::<f32>()
}

/// Predictions of the autoregressive model needed by its criterion.
#[derive(Debug, Clone)]
pub struct TacotronPrediction<B: Backend> {
    /// `[batch, t_out, n_mels]`.
    pub decoder_frames: Tensor<B, 3>,
    /// `[batch, t_out, n_mels]`.
    pub postnet_frames: Tensor<B, 3>,
    /// `[batch, t_out / r]`.
    pub stop_logits: Tensor<B, 2>,
    /// `[batch, t_out / r, t_in]`.
    pub alignments: Tensor<B, 3>,
    /// Backward decoder output, already flipped back to forward time.
    pub backward_frames: Option<Tensor<B, 3>>,
}

/// Predictions of the flow model needed by its criterion.
#[derive(Debug, Clone)]
pub struct GlowPrediction<B: Backend> {
    /// Latent `[batch, n_mels, t_out]`.
    pub z: Tensor<B, 3>,
    pub y_mean: Tensor<B, 3>,
    pub y_log_scale: Tensor<B, 3>,
    /// `[batch]`.
    pub logdet: Tensor<B, 1>,
    /// `[batch, 1, t_out]`.
    pub z_mask: Tensor<B, 3>,
    /// Predicted log durations `[batch, 1, t_in]`.
    pub log_durations: Tensor<B, 3>,
    /// `log(1 + frames per token)` from the alignment search `[batch, 1, t_in]`.
    pub log_duration_targets: Tensor<B, 3>,
    /// `[batch, 1, t_in]`.
    pub x_mask: Tensor<B, 3>,
    /// Posterior `(mean, log variance)` of the variational latent.
    pub posterior: Option<(Tensor<B, 2>, Tensor<B, 2>)>,
}

/// Step-dependent weight of the KL term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KlSchedule {
    kind: KlScheduleKind,
    weight: f32,
    start_step: usize,
    warmup_steps: usize,
}

impl KlSchedule {
    pub fn new(config: &KlScheduleConfig) -> Self {
        Self {
            kind: config.kind,
            weight: config.weight,
            start_step: config.start_step,
            warmup_steps: config.warmup_steps,
        }
    }

    pub fn weight_at(&self, step: usize) -> f32 {
        match self.kind {
            KlScheduleKind::Constant => self.weight,
            KlScheduleKind::Linear => {
                if step < self.start_step {
                    return 0.0;
                }
                if self.warmup_steps == 0 {
                    return self.weight;
                }
                let progress = (step - self.start_step) as f32 / self.warmup_steps as f32;
                self.weight * progress.min(1.0)
            }
        }
    }
}

/// Combines every criterion of a model family into one scalar.
#[derive(Debug, Clone)]
pub struct LossAggregator {
    config: LossConfig,
    kl: KlSchedule,
}

impl LossAggregator {
    pub fn new(config: &LossConfig) -> Self {
        Self {
            config: config.clone(),
            kl: KlSchedule::new(&config.kl),
        }
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    pub fn kl_weight(&self, step: usize) -> f32 {
        self.kl.weight_at(step)
    }

    fn reconstruction<B: Backend>(
        &self,
        prediction: Tensor<B, 3>,
        target: Tensor<B, 3>,
        mask: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        match self.config.reconstruction {
            ReconstructionLoss::L1 => masked_l1(prediction, target, mask),
            ReconstructionLoss::Mse => masked_mse(prediction, target, mask),
        }
    }

    /// Criterion of the attention-based model.
    ///
    /// With `separate_stopnet` the stop loss still enters `total` (its input is
    /// detached inside the decoder) but is left out of the logged main loss.
    pub fn tacotron<B: Backend>(
        &self,
        prediction: &TacotronPrediction<B>,
        batch: &DeviceBatch<B>,
        separate_stopnet: bool,
    ) -> LossBreakdown<B> {
        let cfg = &self.config;
        let device = batch.mel.device();
        let decoder_loss = self.reconstruction(
            prediction.decoder_frames.clone(),
            batch.mel.clone(),
            batch.mel_mask.clone(),
        );
        let postnet_loss = self.reconstruction(
            prediction.postnet_frames.clone(),
            batch.mel.clone(),
            batch.mel_mask.clone(),
        );
        let steps = prediction.stop_logits.dims()[1];
        let step_mask = decoder_step_mask::<B>(&batch.mel_lengths, batch.r, steps, &device);
        let stop_loss = bce_with_logits(
            prediction.stop_logits.clone(),
            batch.stop_targets.clone(),
            step_mask,
            cfg.stopnet_pos_weight,
        );

        let mut main = decoder_loss.clone().mul_scalar(cfg.decoder_loss_weight)
            + postnet_loss.clone().mul_scalar(cfg.postnet_loss_weight);
        let mut components = vec![
            ("decoder_loss", decoder_loss),
            ("postnet_loss", postnet_loss),
            ("stopnet_loss", stop_loss.clone()),
        ];

        if cfg.ga_alpha > 0.0 {
            let ga = guided_attention_loss(
                prediction.alignments.clone(),
                &batch.text_lengths,
                &batch.mel_lengths,
                batch.r,
                cfg.ga_sigma,
            );
            main = main + ga.clone().mul_scalar(cfg.ga_alpha);
            components.push(("ga_loss", ga));
        }

        if let Some(backward) = &prediction.backward_frames {
            let backward_loss =
                self.reconstruction(backward.clone(), batch.mel.clone(), batch.mel_mask.clone());
            let consistency = masked_l1(
                backward.clone(),
                prediction.decoder_frames.clone().detach(),
                batch.mel_mask.clone(),
            );
            main = main
                + backward_loss.clone().mul_scalar(cfg.decoder_backward_weight)
                + consistency.clone().mul_scalar(cfg.decoder_consistency_weight);
            components.push(("decoder_b_loss", backward_loss));
            components.push(("decoder_c_loss", consistency));
        }

        let weighted_stop = stop_loss.mul_scalar(cfg.stopnet_loss_weight);
        let (total, logged) = if separate_stopnet {
            (main.clone() + weighted_stop, main)
        } else {
            let total = main + weighted_stop;
            (total.clone(), total)
        };
        components.insert(0, (MAIN_LOSS, logged));
        LossBreakdown { total, components }
    }

    /// Criterion of the flow model at global `step`.
    pub fn glow<B: Backend>(&self, prediction: &GlowPrediction<B>, step: usize) -> LossBreakdown<B> {
        let log_mle = flow_nll(
            prediction.z.clone(),
            prediction.y_mean.clone(),
            prediction.y_log_scale.clone(),
            prediction.logdet.clone(),
            prediction.z_mask.clone(),
        );
        let duration = duration_loss(
            prediction.log_durations.clone(),
            prediction.log_duration_targets.clone(),
            prediction.x_mask.clone(),
        );
        let mut total = log_mle.clone() + duration.clone().mul_scalar(self.config.duration_loss_weight);
        let mut components = vec![("log_mle", log_mle), ("loss_dur", duration)];
        if let Some((mean, log_var)) = &prediction.posterior {
            let kl = kl_divergence(mean.clone(), log_var.clone());
            let weight = self.kl_weight(step);
            total = total + kl.clone().mul_scalar(weight);
            components.push(("kl", kl));
            components.push((
                "kl_weight",
                Tensor::from_data(TensorData::new(vec![weight], [1]), &prediction.z.device()),
            ));
        }
        components.insert(0, (MAIN_LOSS, total.clone()));
        LossBreakdown { total, components }
    }

    /// Batch-size weighted average of logged components across workers.
    pub fn reduce(
        &self,
        values: &[(&'static str, f32)],
        batch_size: usize,
        collective: &dyn Collective,
    ) -> Result<Vec<(&'static str, f32)>, TrainError> {
        reduce_metrics(values, batch_size, collective)
    }
}

/// `Σ |p - t| · mask / (Σ mask · n_mels)`.
pub fn masked_l1<B: Backend>(prediction: Tensor<B, 3>, target: Tensor<B, 3>, mask: Tensor<B, 2>) -> Tensor<B, 1> {
    let channels = prediction.dims()[2] as f32;
    let mask3 = mask.clone().unsqueeze_dim::<3>(2);
    let error = ((prediction - target).abs() * mask3).sum();
    error / mask.sum().mul_scalar(channels).clamp_min(1.0)
}

/// `Σ (p - t)² · mask / (Σ mask · n_mels)`.
pub fn masked_mse<B: Backend>(prediction: Tensor<B, 3>, target: Tensor<B, 3>, mask: Tensor<B, 2>) -> Tensor<B, 1> {
    let channels = prediction.dims()[2] as f32;
    let mask3 = mask.clone().unsqueeze_dim::<3>(2);
    let error = ((prediction - target).powf_scalar(2.0) * mask3).sum();
    error / mask.sum().mul_scalar(channels).clamp_min(1.0)
}

/// Masked mean of binary cross-entropy on logits with a positive-class weight.
///
/// Uses `log(1 + e^{-x}) = log(1 + e^{-|x|}) + max(-x, 0)` to stay finite for
/// large logits.
pub fn bce_with_logits<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    mask: Tensor<B, 2>,
    pos_weight: f32,
) -> Tensor<B, 1> {
    let log_one_plus = logits.clone().abs().neg().exp().add_scalar(1.0).log()
        + logits.clone().neg().clamp_min(0.0);
    let weight = targets.clone().mul_scalar(pos_weight - 1.0).add_scalar(1.0);
    let per_step = (targets.neg().add_scalar(1.0) * logits + weight * log_one_plus) * mask.clone();
    per_step.sum() / mask.sum().clamp_min(1.0)
}

/// Valid decoder steps per item: `ceil(mel_len / r)`.
pub fn decoder_step_mask<B: Backend>(mel_lengths: &[usize], r: usize, steps: usize, device: &B::Device) -> Tensor<B, 2> {
    let lengths: Vec<usize> = mel_lengths.iter().map(|len| len.div_ceil(r)).collect();
    crate::data::sequence_mask::<B>(&lengths, steps, device)
}

/// Soft diagonal penalty `1 - exp(-(n/N - t/T)² / 2σ²)` averaged over valid cells.
pub fn guided_attention_loss<B: Backend>(
    alignments: Tensor<B, 3>,
    text_lengths: &[usize],
    mel_lengths: &[usize],
    r: usize,
    sigma: f32,
) -> Tensor<B, 1> {
    let [batch, steps, t_in] = alignments.dims();
    let mut weights = vec![0.0_f32; batch * steps * t_in];
    let mut mask = vec![0.0_f32; batch * steps * t_in];
    for b in 0..batch {
        let n_len = text_lengths[b].min(t_in);
        let t_len = mel_lengths[b].div_ceil(r).min(steps);
        for t in 0..t_len {
            for n in 0..n_len {
                let idx = (b * steps + t) * t_in + n;
                let diff = n as f32 / n_len as f32 - t as f32 / t_len as f32;
                weights[idx] = 1.0 - (-(diff * diff) / (2.0 * sigma * sigma)).exp();
                mask[idx] = 1.0;
            }
        }
    }
    let device = alignments.device();
    let weights = Tensor::<B, 3>::from_data(TensorData::new(weights, [batch, steps, t_in]), &device);
    let mask = Tensor::<B, 3>::from_data(TensorData::new(mask, [batch, steps, t_in]), &device);
    (alignments * weights * mask.clone()).sum() / mask.sum().clamp_min(1.0)
}

/// Negative log-likelihood of `z` under `N(y_mean, exp(y_log_scale)²)` per
/// valid frame and channel, including the flow's log-determinant.
pub fn flow_nll<B: Backend>(
    z: Tensor<B, 3>,
    y_mean: Tensor<B, 3>,
    y_log_scale: Tensor<B, 3>,
    logdet: Tensor<B, 1>,
    z_mask: Tensor<B, 3>,
) -> Tensor<B, 1> {
    let channels = z.dims()[1] as f32;
    let scale_term = (y_log_scale.clone() * z_mask.clone()).sum();
    let distance = ((y_log_scale.mul_scalar(-2.0).exp() * (z - y_mean).powf_scalar(2.0)) * z_mask.clone())
        .sum()
        .mul_scalar(0.5);
    let normalizer = z_mask.sum().mul_scalar(channels).clamp_min(1.0);
    ((scale_term + distance - logdet.sum()) / normalizer).add_scalar(0.5 * (2.0 * std::f32::consts::PI).ln())
}

/// `Σ (log_dur_pred - log_dur_target)² / Σ x_lengths`.
pub fn duration_loss<B: Backend>(
    log_durations: Tensor<B, 3>,
    targets: Tensor<B, 3>,
    x_mask: Tensor<B, 3>,
) -> Tensor<B, 1> {
    ((log_durations - targets).powf_scalar(2.0) * x_mask.clone()).sum() / x_mask.sum().clamp_min(1.0)
}

/// `-½ · mean_b Σ (1 + log σ² - μ² - σ²)`.
pub fn kl_divergence<B: Backend>(mean: Tensor<B, 2>, log_var: Tensor<B, 2>) -> Tensor<B, 1> {
    let batch = mean.dims()[0] as f32;
    let inner = log_var.clone().add_scalar(1.0) - mean.powf_scalar(2.0) - log_var.exp();
    inner.sum().mul_scalar(-0.5 / batch)
}

/// Running averages of named loss components over one epoch.
///
/// Averages are keyed `avg_<name>`; the last raw value is kept under `<name>`.
#[derive(Debug, Default, Clone)]
pub struct LossRecord {
    last: BTreeMap<String, f32>,
    sums: BTreeMap<String, (f64, usize)>,
}

impl LossRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.last.clear();
        self.sums.clear();
    }

    pub fn update(&mut self, name: &str, value: f32) {
        self.last.insert(name.to_string(), value);
        let entry = self.sums.entry(format!("avg_{name}")).or_insert((0.0, 0));
        entry.0 += f64::from(value);
        entry.1 += 1;
    }

    pub fn update_all(&mut self, values: &[(&'static str, f32)]) {
        for (name, value) in values {
            self.update(name, *value);
        }
    }

    pub fn last(&self, name: &str) -> Option<f32> {
        self.last.get(name).copied()
    }

    /// Running mean, looked up by component name (without the `avg_` prefix).
    pub fn average(&self, name: &str) -> Option<f32> {
        self.sums
            .get(&format!("avg_{name}"))
            .filter(|(_, count)| *count > 0)
            .map(|(sum, count)| (*sum / *count as f64) as f32)
    }

    /// All running means keyed `avg_<name>`.
    pub fn averages(&self) -> BTreeMap<String, f32> {
        self.sums
            .iter()
            .filter(|(_, (_, count))| *count > 0)
            .map(|(key, (sum, count))| (key.clone(), (*sum / *count as f64) as f32))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn tensor2(values: Vec<f32>, shape: [usize; 2]) -> Tensor<TestBackend, 2> {
        Tensor::from_data(TensorData::new(values, shape), &NdArrayDevice::default())
    }

    fn tensor3(values: Vec<f32>, shape: [usize; 3]) -> Tensor<TestBackend, 3> {
        Tensor::from_data(TensorData::new(values, shape), &NdArrayDevice::default())
    }

    #[test]
    fn l1_ignores_padded_frames() {
        let prediction = tensor3(vec![1.0, 1.0, 1.0, 100.0], [1, 4, 1]);
        let target = tensor3(vec![0.0; 4], [1, 4, 1]);
        let mask = tensor2(vec![1.0, 1.0, 1.0, 0.0], [1, 4]);
        let loss = scalar(masked_l1(prediction, target, mask));
        assert!((loss - 1.0).abs() < 1e-6);
    }

    #[test]
    fn bce_matches_reference_values() {
        let logits = tensor2(vec![0.0, 2.0], [1, 2]);
        let targets = tensor2(vec![0.0, 1.0], [1, 2]);
        let mask = tensor2(vec![1.0, 1.0], [1, 2]);
        let loss = scalar(bce_with_logits(logits, targets, mask, 1.0));
        let expected = (2.0_f32.ln() + (1.0 + (-2.0_f32).exp()).ln()) / 2.0;
        assert!((loss - expected).abs() < 1e-5, "{loss} vs {expected}");
    }

    #[test]
    fn bce_stays_finite_for_extreme_logits() {
        let logits = tensor2(vec![-500.0, 500.0], [1, 2]);
        let targets = tensor2(vec![1.0, 0.0], [1, 2]);
        let mask = tensor2(vec![1.0, 1.0], [1, 2]);
        let loss = scalar(bce_with_logits(logits, targets, mask, 10.0));
        assert!(loss.is_finite());
    }

    #[test]
    fn guided_attention_is_zero_on_the_diagonal() {
        let eye = tensor3(
            vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            [1, 3, 3],
        );
        let loss = scalar(guided_attention_loss(eye, &[3], &[3], 1, 0.4));
        assert!(loss.abs() < 1e-6);
        let anti = tensor3(
            vec![0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0],
            [1, 3, 3],
        );
        assert!(scalar(guided_attention_loss(anti, &[3], &[3], 1, 0.4)) > 0.0);
    }

    #[test]
    fn kl_schedule_ramps_linearly() {
        let schedule = KlSchedule::new(&KlScheduleConfig {
            kind: KlScheduleKind::Linear,
            weight: 2.0,
            start_step: 10,
            warmup_steps: 100,
        });
        assert_eq!(schedule.weight_at(0), 0.0);
        assert!((schedule.weight_at(60) - 1.0).abs() < 1e-6);
        assert_eq!(schedule.weight_at(1000), 2.0);
        let constant = KlSchedule::new(&KlScheduleConfig {
            kind: KlScheduleKind::Constant,
            weight: 0.3,
            ..KlScheduleConfig::default()
        });
        assert_eq!(constant.weight_at(0), 0.3);
    }

    #[test]
    fn kl_of_standard_normal_is_zero() {
        let device = NdArrayDevice::default();
        let mean = Tensor::<TestBackend, 2>::zeros([2, 4], &device);
        let log_var = Tensor::<TestBackend, 2>::zeros([2, 4], &device);
        assert!(scalar(kl_divergence(mean, log_var)).abs() < 1e-7);
    }

    #[test]
    fn nll_of_perfect_standard_normal_fit() {
        let device = NdArrayDevice::default();
        let z = Tensor::<TestBackend, 3>::zeros([1, 2, 3], &device);
        let mask = Tensor::<TestBackend, 3>::ones([1, 1, 3], &device);
        let loss = scalar(flow_nll(
            z.clone(),
            z.clone(),
            z,
            Tensor::zeros([1], &device),
            mask,
        ));
        assert!((loss - 0.5 * (2.0 * std::f32::consts::PI).ln()).abs() < 1e-5);
    }

    #[test]
    fn non_finite_component_is_reported() {
        let device = NdArrayDevice::default();
        let breakdown = LossBreakdown::<TestBackend> {
            total: Tensor::from_data(TensorData::new(vec![1.0_f32], [1]), &device),
            components: vec![(
                "decoder_loss",
                Tensor::from_data(TensorData::new(vec![f32::NAN], [1]), &device),
            )],
        };
        match breakdown.to_host(7) {
            Err(TrainError::NonFiniteLoss { step, component, .. }) => {
                assert_eq!(step, 7);
                assert_eq!(component, "decoder_loss");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn record_keeps_running_means() {
        let mut record = LossRecord::new();
        record.update("loss", 1.0);
        record.update("loss", 3.0);
        assert_eq!(record.average("loss"), Some(2.0));
        assert_eq!(record.last("loss"), Some(3.0));
        assert_eq!(record.averages().get("avg_loss"), Some(&2.0));
        record.reset();
        assert!(record.is_empty());
    }
}
