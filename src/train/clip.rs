//! Global gradient-norm utilities over a module's parameters.

use burn::module::{AutodiffModule, ModuleVisitor, Param, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use std::marker::PhantomData;

struct SquaredNorm<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    exclude: &'a [ParamId],
    total: f64,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorm<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if self.exclude.contains(&param.id) {
            return;
        }
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(param.id) {
            let squared: f32 = grad.clone().mul(grad).sum().into_scalar().elem();
            self.total += f64::from(squared);
        }
    }
}

struct Rescale<'a, B: AutodiffBackend> {
    grads: GradientsParams,
    factor: f32,
    exclude: &'a [ParamId],
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Rescale<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if self.exclude.contains(&param.id) {
            return;
        }
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(param.id) {
            self.grads
                .register::<B::InnerBackend, D>(param.id, grad.mul_scalar(self.factor));
        }
    }
}

/// L2 norm over every gradient of `model` not listed in `exclude`.
/// Non-finite when any gradient holds a NaN or infinity.
pub fn global_norm<B, M>(model: &M, grads: &GradientsParams, exclude: &[ParamId]) -> f32
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = SquaredNorm::<B> {
        grads,
        exclude,
        total: 0.0,
        _backend: PhantomData,
    };
    model.visit(&mut visitor);
    visitor.total.sqrt() as f32
}

/// Multiply every gradient not listed in `exclude` by `factor`.
pub fn scale_gradients<B, M>(model: &M, grads: GradientsParams, factor: f32, exclude: &[ParamId]) -> GradientsParams
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = Rescale::<B> {
        grads,
        factor,
        exclude,
        _backend: PhantomData,
    };
    model.visit(&mut visitor);
    visitor.grads
}

/// Rescale gradients so their joint norm is at most `max_norm`.
///
/// Returns the gradients and the norm measured before clipping. Parameters in
/// `exclude` are neither measured nor rescaled.
pub fn clip_grad_norm<B, M>(
    model: &M,
    grads: GradientsParams,
    max_norm: f32,
    exclude: &[ParamId],
) -> (GradientsParams, f32)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let norm = global_norm(model, &grads, exclude);
    if max_norm <= 0.0 || !norm.is_finite() || norm <= max_norm {
        return (grads, norm);
    }
    let factor = max_norm / (norm + 1e-6);
    (scale_gradients(model, grads, factor, exclude), norm)
}
