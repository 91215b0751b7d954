//! Learning-rate schedule.

use crate::config::OptimizerConfig;
use serde::{Deserialize, Serialize};

/// Persisted schedule position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub last_step: usize,
}

/// Warmup-based noam schedule, or a constant rate when disabled.
///
/// `lr(step) = base · warmup^0.5 · min(step · warmup^-1.5, step^-0.5)`, with
/// steps counted from 1. The rate peaks at `base` when `step == warmup`.
#[derive(Debug, Clone)]
pub struct NoamScheduler {
    base_lr: f64,
    warmup: Option<usize>,
    last_step: usize,
}

impl NoamScheduler {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            base_lr: config.lr,
            warmup: config.noam_schedule.then_some(config.warmup_steps.max(1)),
            last_step: 0,
        }
    }

    pub fn is_warmup_based(&self) -> bool {
        self.warmup.is_some()
    }

    /// Rate for a 1-based step.
    pub fn lr_at(&self, step: usize) -> f64 {
        let Some(warmup) = self.warmup else {
            return self.base_lr;
        };
        let step = step.max(1) as f64;
        let warmup = warmup as f64;
        self.base_lr * warmup.sqrt() * (step * warmup.powf(-1.5)).min(step.powf(-0.5))
    }

    /// Advance one step and return the new rate.
    pub fn step(&mut self) -> f64 {
        self.last_step += 1;
        self.current_lr()
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.last_step)
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            last_step: self.last_step,
        }
    }

    pub fn load_state(&mut self, state: SchedulerState) {
        self.last_step = state.last_step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(noam: bool) -> OptimizerConfig {
        OptimizerConfig {
            lr: 1e-3,
            noam_schedule: noam,
            warmup_steps: 100,
            ..OptimizerConfig::default()
        }
    }

    #[test]
    fn noam_peaks_at_warmup() {
        let scheduler = NoamScheduler::new(&config(true));
        assert!((scheduler.lr_at(100) - 1e-3).abs() < 1e-12);
        assert!(scheduler.lr_at(50) < scheduler.lr_at(100));
        assert!(scheduler.lr_at(400) < scheduler.lr_at(100));
        assert!((scheduler.lr_at(400) - 5e-4).abs() < 1e-12);
    }

    #[test]
    fn state_restores_position() {
        let mut scheduler = NoamScheduler::new(&config(true));
        for _ in 0..7 {
            scheduler.step();
        }
        let mut restored = NoamScheduler::new(&config(true));
        restored.load_state(scheduler.state());
        assert_eq!(restored.step(), scheduler.step());
    }

    #[test]
    fn constant_without_noam() {
        let mut scheduler = NoamScheduler::new(&config(false));
        assert_eq!(scheduler.step(), 1e-3);
        assert_eq!(scheduler.lr_at(10_000), 1e-3);
    }
}
