//! Dynamic loss scaling.
//!
//! The loss is multiplied by `scale` before the backward pass and gradients
//! are divided by it afterwards. A non-finite gradient marks the step as an
//! overflow: the optimizer step is skipped and the scale backs off. After
//! `growth_interval` clean steps the scale grows again.

use crate::config::MixedPrecisionConfig;
use crate::train::clip::{global_norm, scale_gradients};
use burn::module::AutodiffModule;
use burn::optim::GradientsParams;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Persisted scaler state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub scale: f32,
    pub growth_tracker: usize,
}

#[derive(Debug, Clone)]
pub struct GradientScaler {
    enabled: bool,
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    growth_tracker: usize,
    found_overflow: bool,
}

impl GradientScaler {
    pub fn new(config: &MixedPrecisionConfig) -> Self {
        Self {
            enabled: config.enabled,
            scale: if config.enabled { config.init_scale } else { 1.0 },
            growth_factor: config.growth_factor,
            backoff_factor: config.backoff_factor,
            growth_interval: config.growth_interval.max(1),
            growth_tracker: 0,
            found_overflow: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scale_value(&self) -> f32 {
        self.scale
    }

    /// Loss to backpropagate.
    pub fn scale<B: AutodiffBackend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        if self.enabled {
            loss.mul_scalar(self.scale)
        } else {
            loss
        }
    }

    /// Divide gradients by the scale and record whether any is non-finite.
    pub fn unscale<B, M>(&mut self, model: &M, grads: GradientsParams) -> GradientsParams
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        if !self.enabled {
            self.found_overflow = false;
            return grads;
        }
        let grads = scale_gradients(model, grads, 1.0 / self.scale, &[]);
        self.found_overflow = !global_norm(model, &grads, &[]).is_finite();
        grads
    }

    /// Whether the optimizer step should run for the last unscaled gradients.
    pub fn step(&self) -> bool {
        !self.found_overflow
    }

    /// Adjust the scale after a step.
    pub fn update(&mut self) {
        if !self.enabled {
            return;
        }
        if self.found_overflow {
            self.scale = (self.scale * self.backoff_factor).max(1.0);
            self.growth_tracker = 0;
            tracing::warn!(scale = self.scale, "gradient overflow, skipping optimizer step");
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        }
        self.found_overflow = false;
    }

    pub fn state(&self) -> ScalerState {
        ScalerState {
            scale: self.scale,
            growth_tracker: self.growth_tracker,
        }
    }

    pub fn load_state(&mut self, state: ScalerState) {
        self.scale = state.scale;
        self.growth_tracker = state.growth_tracker;
    }

    #[cfg(test)]
    pub(crate) fn mark_overflow(&mut self, overflow: bool) {
        self.found_overflow = overflow;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> MixedPrecisionConfig {
        MixedPrecisionConfig {
            enabled: true,
            init_scale: 1024.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2,
        }
    }

    #[test]
    fn overflow_backs_off_and_skips() {
        let mut scaler = GradientScaler::new(&enabled());
        scaler.mark_overflow(true);
        assert!(!scaler.step());
        scaler.update();
        assert_eq!(scaler.scale_value(), 512.0);
        assert!(scaler.step());
    }

    #[test]
    fn clean_steps_grow_the_scale() {
        let mut scaler = GradientScaler::new(&enabled());
        scaler.update();
        assert_eq!(scaler.scale_value(), 1024.0);
        scaler.update();
        assert_eq!(scaler.scale_value(), 2048.0);
        assert_eq!(scaler.state().growth_tracker, 0);
    }

    #[test]
    fn disabled_scaler_is_inert() {
        let mut scaler = GradientScaler::new(&MixedPrecisionConfig::default());
        scaler.update();
        assert_eq!(scaler.scale_value(), 1.0);
        assert!(scaler.step());
    }

    #[test]
    fn state_round_trips() {
        let mut scaler = GradientScaler::new(&enabled());
        scaler.update();
        let mut other = GradientScaler::new(&enabled());
        other.load_state(scaler.state());
        assert_eq!(other.state(), scaler.state());
    }
}
