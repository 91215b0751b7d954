//! Character encoder and post-net of the autoregressive model.

use crate::modules::conv::{forward_same, same_conv1d};
use crate::modules::prenet::dropout;
use crate::modules::rnn::BiGru;
use burn::module::Module;
use burn::tensor::activation::{relu, tanh};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use burn_nn::conv::Conv1d;

const ENCODER_KERNEL: usize = 5;
const CONV_DROPOUT: f64 = 0.5;

/// Convolution stack followed by a bidirectional GRU.
#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    convs: Vec<Conv1d<B>>,
    rnn: BiGru<B>,
}

impl<B: Backend> Encoder<B> {
    pub fn new(input_dim: usize, output_dim: usize, num_convs: usize, device: &B::Device) -> Self {
        let mut convs = Vec::with_capacity(num_convs);
        let mut channels = input_dim;
        for _ in 0..num_convs {
            convs.push(
                same_conv1d(channels, output_dim, ENCODER_KERNEL).init(device),
            );
            channels = output_dim;
        }
        Self {
            convs,
            rnn: BiGru::new(channels, output_dim / 2, device),
        }
    }

    /// `x: [batch, t_in, input_dim]` → `[batch, t_in, output_dim]`, zero on padding.
    pub fn forward(&self, x: Tensor<B, 3>, lengths: &[usize], mask: Tensor<B, 2>, training: bool) -> Tensor<B, 3> {
        let gate = mask.clone().unsqueeze_dim::<3>(1);
        let x = self.convs.iter().fold(x.swap_dims(1, 2), |x, conv| {
            dropout(relu(forward_same(conv, x)), CONV_DROPOUT, training) * gate.clone()
        });
        self.rnn.forward(x.swap_dims(1, 2), lengths, mask)
    }
}

/// Convolutional residual refinement of decoder frames.
#[derive(Module, Debug)]
pub struct Postnet<B: Backend> {
    convs: Vec<Conv1d<B>>,
}

impl<B: Backend> Postnet<B> {
    pub fn new(num_mels: usize, channels: usize, kernel: usize, layers: usize, device: &B::Device) -> Self {
        let layers = layers.max(1);
        let convs = (0..layers)
            .map(|idx| {
                let input = if idx == 0 { num_mels } else { channels };
                let output = if idx + 1 == layers { num_mels } else { channels };
                same_conv1d(input, output, kernel).init(device)
            })
            .collect();
        Self { convs }
    }

    /// Residual `[batch, t_out, n_mels]` to add to `frames`.
    pub fn forward(&self, frames: Tensor<B, 3>, mask: Tensor<B, 2>, training: bool) -> Tensor<B, 3> {
        let last = self.convs.len() - 1;
        let x = self
            .convs
            .iter()
            .enumerate()
            .fold(frames.swap_dims(1, 2), |x, (idx, conv)| {
                let y = forward_same(conv, x);
                let y = if idx == last { y } else { tanh(y) };
                dropout(y, CONV_DROPOUT, training)
            });
        x.swap_dims(1, 2) * mask.unsqueeze_dim::<3>(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn encoder_shapes_and_padding() {
        let device = NdArrayDevice::default();
        let encoder = Encoder::<TestBackend>::new(6, 8, 2, &device);
        let x = Tensor::<TestBackend, 3>::ones([2, 5, 6], &device);
        let mask = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0_f32, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0], [2, 5]),
            &device,
        );
        let out = encoder.forward(x, &[5, 2], mask, false);
        assert_eq!(out.dims(), [2, 5, 8]);
        let padded: f32 = out.narrow(0, 1, 1).narrow(1, 2, 3).abs().sum().into_scalar();
        assert_eq!(padded, 0.0);
    }

    #[test]
    fn postnet_keeps_frame_shape() {
        let device = NdArrayDevice::default();
        let postnet = Postnet::<TestBackend>::new(4, 6, 5, 3, &device);
        let frames = Tensor::<TestBackend, 3>::ones([1, 7, 4], &device);
        let out = postnet.forward(frames, Tensor::ones([1, 7], &device), false);
        assert_eq!(out.dims(), [1, 7, 4]);
    }
}
