//! Length-preserving 1-D convolution.
//!
//! Convolutions are built without padding and the input is zero-padded
//! explicitly, so a kernel may be wider than the sequence it slides over.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use burn_nn::conv::{Conv1d, Conv1dConfig};

/// An odd-kernel convolution to be run through [`forward_same`].
pub fn same_conv1d(input: usize, output: usize, kernel: usize) -> Conv1dConfig {
    Conv1dConfig::new(input, output, kernel)
}

/// `x: [batch, channels, time]` → `[batch, out_channels, time]`.
pub fn forward_same<B: Backend>(conv: &Conv1d<B>, x: Tensor<B, 3>) -> Tensor<B, 3> {
    let pad = (conv.kernel_size - 1) / 2 * conv.dilation;
    if pad == 0 {
        return conv.forward(x);
    }
    let [batch, channels, _] = x.dims();
    let zeros = Tensor::<B, 3>::zeros([batch, channels, pad], &x.device());
    conv.forward(Tensor::cat(vec![zeros.clone(), x, zeros], 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn kernel_wider_than_sequence_keeps_length() {
        let device = NdArrayDevice::default();
        let conv = same_conv1d(2, 32, 31).with_bias(false).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 3>::random([3, 2, 3], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(forward_same(&conv, x).dims(), [3, 32, 3]);
    }

    #[test]
    fn pointwise_kernel_is_untouched() {
        let device = NdArrayDevice::default();
        let conv = same_conv1d(4, 8, 1).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 3>::ones([1, 4, 5], &device);
        assert_eq!(forward_same(&conv, x).dims(), [1, 8, 5]);
    }
}
