//! Global style tokens: a reference encoder summarizes a target mel into a
//! query that attends over a bank of learned style embeddings.

use crate::modules::conv::{forward_same, same_conv1d};
use crate::modules::rnn::{GruCell, GruCellConfig};
use burn::module::{Module, Param};
use burn::tensor::activation::{relu, softmax, tanh};
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};
use burn_nn::conv::Conv1d;
use burn_nn::{Linear, LinearConfig};

const REFERENCE_CHANNELS: usize = 128;

#[derive(Module, Debug)]
pub struct ReferenceEncoder<B: Backend> {
    convs: Vec<Conv1d<B>>,
    rnn: GruCell<B>,
}

impl<B: Backend> ReferenceEncoder<B> {
    pub fn new(num_mels: usize, output_dim: usize, device: &B::Device) -> Self {
        let conv = |input| same_conv1d(input, REFERENCE_CHANNELS, 3).init(device);
        Self {
            convs: vec![conv(num_mels), conv(REFERENCE_CHANNELS)],
            rnn: GruCellConfig::new(REFERENCE_CHANNELS, output_dim).init(device),
        }
    }

    /// `mel: [batch, t_out, n_mels]`, `mask: [batch, t_out]` → `[batch, output_dim]`.
    pub fn forward(&self, mel: Tensor<B, 3>, mask: Tensor<B, 2>) -> Tensor<B, 2> {
        let gate = mask.clone().unsqueeze_dim::<3>(1);
        let x = self
            .convs
            .iter()
            .fold(mel.swap_dims(1, 2), |x, conv| relu(forward_same(conv, x)) * gate.clone());
        let (_, last) = self.rnn.run(x.swap_dims(1, 2), Some(mask));
        last
    }
}

#[derive(Module, Debug)]
pub struct StyleTokenLayer<B: Backend> {
    tokens: Param<Tensor<B, 2>>,
    query: Linear<B>,
}

impl<B: Backend> StyleTokenLayer<B> {
    pub fn new(num_tokens: usize, query_dim: usize, token_dim: usize, device: &B::Device) -> Self {
        let tokens = Tensor::random([num_tokens, token_dim], Distribution::Normal(0.0, 0.5), device);
        Self {
            tokens: Param::from_tensor(tokens),
            query: LinearConfig::new(query_dim, token_dim).init(device),
        }
    }

    pub fn num_tokens(&self) -> usize {
        self.tokens.dims()[0]
    }

    /// Attention weights over tokens for a reference summary.
    pub fn token_weights(&self, reference: Tensor<B, 2>) -> Tensor<B, 2> {
        let keys = tanh(self.tokens.val());
        let scale = (keys.dims()[1] as f32).sqrt();
        let scores = self.query.forward(reference).matmul(keys.transpose()).div_scalar(scale);
        softmax(scores, 1)
    }

    /// Style embedding `[batch, token_dim]` for given token weights.
    pub fn embed(&self, weights: Tensor<B, 2>) -> Tensor<B, 2> {
        weights.matmul(tanh(self.tokens.val()))
    }
}

/// Reference encoder plus style token attention.
#[derive(Module, Debug)]
pub struct GlobalStyleTokens<B: Backend> {
    reference: ReferenceEncoder<B>,
    tokens: StyleTokenLayer<B>,
}

impl<B: Backend> GlobalStyleTokens<B> {
    pub fn new(num_mels: usize, num_tokens: usize, embedding_dim: usize, device: &B::Device) -> Self {
        Self {
            reference: ReferenceEncoder::new(num_mels, embedding_dim, device),
            tokens: StyleTokenLayer::new(num_tokens, embedding_dim, embedding_dim, device),
        }
    }

    /// Style embedding from a reference mel.
    pub fn forward(&self, mel: Tensor<B, 3>, mask: Tensor<B, 2>) -> Tensor<B, 2> {
        let summary = self.reference.forward(mel, mask);
        self.tokens.embed(self.tokens.token_weights(summary))
    }

    /// Style embedding with uniform token weights, used without a reference.
    pub fn neutral(&self, batch: usize, device: &B::Device) -> Tensor<B, 2> {
        let count = self.tokens.num_tokens();
        let weights = Tensor::ones([batch, count], device).div_scalar(count as f32);
        self.tokens.embed(weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn style_embedding_shapes() {
        let device = NdArrayDevice::default();
        let gst = GlobalStyleTokens::<TestBackend>::new(4, 5, 8, &device);
        let mel = Tensor::<TestBackend, 3>::ones([2, 6, 4], &device);
        let mask = Tensor::<TestBackend, 2>::ones([2, 6], &device);
        assert_eq!(gst.forward(mel, mask).dims(), [2, 8]);
        assert_eq!(gst.neutral(3, &device).dims(), [3, 8]);
    }

    #[test]
    fn token_weights_are_distributions() {
        let device = NdArrayDevice::default();
        let layer = StyleTokenLayer::<TestBackend>::new(4, 3, 6, &device);
        let weights = layer.token_weights(Tensor::ones([2, 3], &device));
        let sums: Vec<f32> = weights.sum_dim(1).into_data().iter::<f32>().collect();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }
}
