//! Data-dependent initialization of activation normalization layers.

use crate::data::DeviceBatch;
use crate::model::AcousticModel;
use burn::tensor::backend::Backend;

/// What the initializer did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdiOutcome {
    /// `layers` normalization layers were set from batch statistics.
    Calibrated { layers: usize },
    /// Training resumed past step zero; the model keeps its restored statistics.
    Skipped,
    /// The model has no data-dependent layers.
    NotApplicable,
}

/// One-shot calibration before the first optimizer step.
#[derive(Debug, Default)]
pub struct DataDependentInitializer {
    done: bool,
}

impl DataDependentInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether calibration still has to happen for a run at `global_step`.
    pub fn is_pending<B: Backend, M: AcousticModel<B>>(&self, model: &M, global_step: usize) -> bool {
        !self.done && global_step == 0 && model.has_data_dependent_init()
    }

    /// Calibrate `model` on `batch` unless the run is past step zero or this
    /// initializer already ran.
    pub fn run<B, M>(&mut self, model: M, batch: &DeviceBatch<B>, global_step: usize) -> (M, DdiOutcome)
    where
        B: Backend,
        M: AcousticModel<B>,
    {
        if !model.has_data_dependent_init() {
            return (model, DdiOutcome::NotApplicable);
        }
        if global_step > 0 || self.done {
            tracing::info!(global_step, "Skipping data-dependent initialization");
            return (model, DdiOutcome::Skipped);
        }
        let (model, layers) = model.calibrate(batch);
        self.done = true;
        tracing::info!(layers, "Data-dependent initialization done");
        (model, DdiOutcome::Calibrated { layers })
    }
}
