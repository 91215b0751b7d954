//! Recurrent cells built from linear layers.

use burn::module::Module;
use burn::tensor::activation::{sigmoid, tanh};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use burn_nn::{Linear, LinearConfig};

/// Configuration for a [`GruCell`].
#[derive(Debug, Clone)]
pub struct GruCellConfig {
    pub input_size: usize,
    pub hidden_size: usize,
}

impl GruCellConfig {
    pub fn new(input_size: usize, hidden_size: usize) -> Self {
        Self {
            input_size,
            hidden_size,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> GruCell<B> {
        GruCell {
            input: LinearConfig::new(self.input_size, 3 * self.hidden_size).init(device),
            hidden: LinearConfig::new(self.hidden_size, 3 * self.hidden_size).init(device),
            hidden_size: self.hidden_size,
        }
    }
}

/// Single-step gated recurrent unit.
///
/// `r = σ(W_r x + U_r h)`, `z = σ(W_z x + U_z h)`, `n = tanh(W_n x + r ⊙ U_n h)`,
/// `h' = (1 - z) ⊙ n + z ⊙ h`.
#[derive(Module, Debug)]
pub struct GruCell<B: Backend> {
    input: Linear<B>,
    hidden: Linear<B>,
    hidden_size: usize,
}

impl<B: Backend> GruCell<B> {
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// `x: [batch, input]`, `h: [batch, hidden]` → `[batch, hidden]`.
    pub fn forward(&self, x: Tensor<B, 2>, h: Tensor<B, 2>) -> Tensor<B, 2> {
        let size = self.hidden_size;
        let gi = self.input.forward(x);
        let gh = self.hidden.forward(h.clone());
        let r = sigmoid(gi.clone().narrow(1, 0, size) + gh.clone().narrow(1, 0, size));
        let z = sigmoid(gi.clone().narrow(1, size, size) + gh.clone().narrow(1, size, size));
        let n = tanh(gi.narrow(1, 2 * size, size) + r * gh.narrow(1, 2 * size, size));
        z.clone().neg().add_scalar(1.0) * n + z * h
    }

    pub fn zero_state(&self, batch: usize, device: &B::Device) -> Tensor<B, 2> {
        Tensor::zeros([batch, self.hidden_size], device)
    }

    /// Run over `[batch, time, input]`. Hidden states freeze past each length,
    /// so the returned final state is the state at the last valid step.
    pub fn run(
        &self,
        x: Tensor<B, 3>,
        mask: Option<Tensor<B, 2>>,
    ) -> (Tensor<B, 3>, Tensor<B, 2>) {
        let [batch, time, _] = x.dims();
        let device = x.device();
        let mut h = self.zero_state(batch, &device);
        let mut outputs = Vec::with_capacity(time);
        for t in 0..time {
            let step = x.clone().narrow(1, t, 1).reshape([batch, x.dims()[2]]);
            let next = self.forward(step, h.clone());
            h = match &mask {
                Some(mask) => {
                    let m = mask.clone().narrow(1, t, 1);
                    next * m.clone() + h * m.neg().add_scalar(1.0)
                }
                None => next,
            };
            outputs.push(h.clone().unsqueeze_dim::<3>(1));
        }
        (Tensor::cat(outputs, 1), h)
    }
}

/// Bidirectional GRU over padded sequences.
#[derive(Module, Debug)]
pub struct BiGru<B: Backend> {
    forward_cell: GruCell<B>,
    backward_cell: GruCell<B>,
}

impl<B: Backend> BiGru<B> {
    pub fn new(input_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        let config = GruCellConfig::new(input_size, hidden_size);
        Self {
            forward_cell: config.init(device),
            backward_cell: config.init(device),
        }
    }

    /// `x: [batch, time, input]` → `[batch, time, 2 * hidden]`, zero past each length.
    pub fn forward(&self, x: Tensor<B, 3>, lengths: &[usize], mask: Tensor<B, 2>) -> Tensor<B, 3> {
        let (fwd, _) = self.forward_cell.run(x.clone(), Some(mask.clone()));
        let reversed = reverse_padded(x, lengths);
        let (bwd, _) = self.backward_cell.run(reversed, Some(mask.clone()));
        let bwd = reverse_padded(bwd, lengths);
        let out = Tensor::cat(vec![fwd, bwd], 2);
        out * mask.unsqueeze_dim::<3>(2)
    }
}

/// Reverse each sequence within its own length; padding stays in place.
pub fn reverse_padded<B: Backend>(x: Tensor<B, 3>, lengths: &[usize]) -> Tensor<B, 3> {
    let [batch, time, dim] = x.dims();
    let mut indices = Vec::with_capacity(batch * time);
    for &len in lengths {
        let len = len.min(time);
        for t in 0..time {
            let src = if t < len { len - 1 - t } else { t };
            indices.push(src as i64);
        }
    }
    let indices = Tensor::<B, 2, Int>::from_data(TensorData::new(indices, [batch, time]), &x.device())
        .unsqueeze_dim::<3>(2)
        .repeat_dim(2, dim);
    x.gather(1, indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn reverse_respects_lengths() {
        let device = NdArrayDevice::default();
        let x = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(vec![1.0_f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], [2, 4, 1]),
            &device,
        );
        let reversed = reverse_padded(x, &[4, 2]);
        let data = reversed.into_data();
        let values = data.as_slice::<f32>().expect("slice");
        assert_eq!(values, &[4.0, 3.0, 2.0, 1.0, 6.0, 5.0, 7.0, 8.0]);
    }

    #[test]
    fn masked_run_freezes_hidden_after_length() {
        let device = NdArrayDevice::default();
        let cell = GruCellConfig::new(3, 5).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 3>::ones([1, 4, 3], &device);
        let mask = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0_f32, 1.0, 0.0, 0.0], [1, 4]),
            &device,
        );
        let (outputs, last) = cell.run(x, Some(mask));
        assert_eq!(outputs.dims(), [1, 4, 5]);
        let at_len = outputs.narrow(1, 1, 1).reshape([1, 5]);
        let diff: f32 = (at_len - last).abs().sum().into_scalar();
        assert!(diff < 1e-6);
    }

    #[test]
    fn bigru_zeroes_padding() {
        let device = NdArrayDevice::default();
        let rnn = BiGru::<TestBackend>::new(2, 3, &device);
        let x = Tensor::<TestBackend, 3>::ones([2, 3, 2], &device);
        let mask = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0_f32, 1.0, 1.0, 1.0, 0.0, 0.0], [2, 3]),
            &device,
        );
        let out = rnn.forward(x, &[3, 1], mask);
        assert_eq!(out.dims(), [2, 3, 6]);
        let padded: f32 = out.narrow(0, 1, 1).narrow(1, 1, 2).abs().sum().into_scalar();
        assert_eq!(padded, 0.0);
    }
}
