//! Alignment diagnostics.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// One item's alignment, stored row-major as `[decoder_steps][encoder_steps]`.
///
/// Each decoder row is a distribution over encoder positions.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentMatrix {
    encoder_steps: usize,
    decoder_steps: usize,
    weights: Vec<f32>,
}

impl AlignmentMatrix {
    pub fn new(decoder_steps: usize, encoder_steps: usize, weights: Vec<f32>) -> anyhow::Result<Self> {
        if weights.len() != decoder_steps * encoder_steps {
            anyhow::bail!(
                "alignment has {} weights, expected {decoder_steps}x{encoder_steps}",
                weights.len()
            );
        }
        Ok(Self {
            encoder_steps,
            decoder_steps,
            weights,
        })
    }

    /// Split `[batch, decoder_steps, encoder_steps]` into per-item matrices
    /// trimmed to each item's valid extent.
    pub fn from_batch<B: Backend>(
        alignments: Tensor<B, 3>,
        encoder_lengths: &[usize],
        decoder_lengths: &[usize],
    ) -> Vec<Self> {
        let [batch, steps, t_in] = alignments.dims();
        let values: Vec<f32> = alignments.into_data().iter::<f32>().collect();
        (0..batch)
            .map(|b| {
                let enc = encoder_lengths.get(b).copied().unwrap_or(t_in).min(t_in);
                let dec = decoder_lengths.get(b).copied().unwrap_or(steps).min(steps);
                let mut weights = Vec::with_capacity(enc * dec);
                for t in 0..dec {
                    let start = (b * steps + t) * t_in;
                    weights.extend_from_slice(&values[start..start + enc]);
                }
                Self {
                    encoder_steps: enc,
                    decoder_steps: dec,
                    weights,
                }
            })
            .collect()
    }

    pub fn encoder_steps(&self) -> usize {
        self.encoder_steps
    }

    pub fn decoder_steps(&self) -> usize {
        self.decoder_steps
    }

    pub fn row(&self, step: usize) -> &[f32] {
        &self.weights[step * self.encoder_steps..(step + 1) * self.encoder_steps]
    }

    pub fn get(&self, step: usize, position: usize) -> f32 {
        self.weights[step * self.encoder_steps + position]
    }

    pub fn row_sums(&self) -> Vec<f32> {
        (0..self.decoder_steps).map(|t| self.row(t).iter().sum()).collect()
    }

    /// Mean over decoder steps of the peak attention weight.
    pub fn diagonal_score(&self) -> f32 {
        if self.decoder_steps == 0 {
            return 0.0;
        }
        let total: f32 = (0..self.decoder_steps)
            .map(|t| self.row(t).iter().copied().fold(0.0_f32, f32::max))
            .sum();
        total / self.decoder_steps as f32
    }
}

/// Average [`AlignmentMatrix::diagonal_score`] over a batch. A sharp,
/// monotonic alignment scores close to 1.
pub fn alignment_diagonal_score(alignments: &[AlignmentMatrix]) -> f32 {
    if alignments.is_empty() {
        return 0.0;
    }
    alignments.iter().map(AlignmentMatrix::diagonal_score).sum::<f32>() / alignments.len() as f32
}

/// Alignment error logged during training: `1 - diagonal score`.
pub fn alignment_error(alignments: &[AlignmentMatrix]) -> f32 {
    1.0 - alignment_diagonal_score(alignments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::{NdArray, NdArrayDevice};

    #[test]
    fn sharp_alignment_scores_one() {
        let eye = AlignmentMatrix::new(2, 2, vec![1.0, 0.0, 0.0, 1.0]).expect("matrix");
        assert_eq!(eye.diagonal_score(), 1.0);
        let flat = AlignmentMatrix::new(2, 2, vec![0.5; 4]).expect("matrix");
        assert_eq!(alignment_diagonal_score(&[eye, flat]), 0.75);
    }

    #[test]
    fn from_batch_trims_padding() {
        let device = NdArrayDevice::default();
        let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let tensor = Tensor::<NdArray<f32>, 3>::from_data(TensorData::new(values, [2, 2, 3]), &device);
        let items = AlignmentMatrix::from_batch(tensor, &[3, 2], &[2, 1]);
        assert_eq!(items[0].decoder_steps(), 2);
        assert_eq!(items[1].encoder_steps(), 2);
        assert_eq!(items[1].decoder_steps(), 1);
        assert_eq!(items[1].row(0), &[6.0, 7.0]);
    }

    #[test]
    fn rejects_wrong_size() {
        assert!(AlignmentMatrix::new(2, 3, vec![0.0; 5]).is_err());
    }
}
