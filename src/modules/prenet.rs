//! Decoder prenet and a dropout that can stay active at inference.

use burn::module::Module;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};
use burn_nn::{Linear, LinearConfig};

/// Inverted dropout applied only when `active` is set.
pub fn dropout<B: Backend, const D: usize>(x: Tensor<B, D>, prob: f64, active: bool) -> Tensor<B, D> {
    if !active || prob <= 0.0 {
        return x;
    }
    let keep = 1.0 - prob;
    let mask = Tensor::<B, D>::random(x.shape(), Distribution::Bernoulli(keep), &x.device());
    x * mask.div_scalar(keep as f32)
}

/// Stack of `Linear -> ReLU -> Dropout(0.5)` layers.
///
/// With `always_dropout` the dropout stays on during inference, which keeps
/// the autoregressive decoder from copying its own outputs.
#[derive(Module, Debug)]
pub struct Prenet<B: Backend> {
    layers: Vec<Linear<B>>,
    always_dropout: bool,
}

impl<B: Backend> Prenet<B> {
    pub const DROPOUT: f64 = 0.5;

    pub fn new(input: usize, dims: &[usize], always_dropout: bool, device: &B::Device) -> Self {
        let mut layers = Vec::with_capacity(dims.len());
        let mut fan_in = input;
        for &dim in dims {
            layers.push(LinearConfig::new(fan_in, dim).with_bias(false).init(device));
            fan_in = dim;
        }
        Self {
            layers,
            always_dropout,
        }
    }

    pub fn output_dim(&self) -> usize {
        self.layers
            .last()
            .map(|layer| layer.weight.dims()[1])
            .unwrap_or(0)
    }

    pub fn forward(&self, x: Tensor<B, 2>, training: bool) -> Tensor<B, 2> {
        let active = training || self.always_dropout;
        self.layers.iter().fold(x, |x, layer| {
            dropout(relu(layer.forward(x)), Self::DROPOUT, active)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn prenet_shapes_follow_dims() {
        let device = NdArrayDevice::default();
        let prenet = Prenet::<TestBackend>::new(10, &[8, 4], false, &device);
        assert_eq!(prenet.output_dim(), 4);
        let out = prenet.forward(Tensor::ones([3, 10], &device), false);
        assert_eq!(out.dims(), [3, 4]);
    }

    #[test]
    fn inactive_dropout_is_identity() {
        let device = NdArrayDevice::default();
        let x = Tensor::<TestBackend, 2>::ones([2, 5], &device);
        let y = dropout(x.clone(), 0.5, false);
        let diff: f32 = (x - y).abs().sum().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn active_dropout_zeroes_or_rescales() {
        let device = NdArrayDevice::default();
        let x = Tensor::<TestBackend, 2>::ones([4, 64], &device);
        let y = dropout(x, 0.5, true).into_data();
        let values = y.as_slice::<f32>().expect("slice");
        assert!(values.iter().all(|v| *v == 0.0 || (*v - 2.0).abs() < 1e-6));
    }
}
