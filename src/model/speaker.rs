//! Speaker conditioning shared by both model families.

use crate::data::dataset::SpeakerRef;
use crate::data::SpeakerSource;
use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use burn_nn::{Embedding, EmbeddingConfig};

/// How the model receives a speaker vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerConditioning {
    None,
    /// Learned lookup table indexed by speaker id.
    Table { count: usize, dim: usize },
    /// Precomputed vectors supplied with each batch.
    External { dim: usize },
}

impl SpeakerConditioning {
    pub fn from_source(source: &SpeakerSource, table_dim: usize) -> Self {
        match source {
            SpeakerSource::None => Self::None,
            SpeakerSource::Ids(mapping) => Self::Table {
                count: mapping.len(),
                dim: table_dim,
            },
            SpeakerSource::External(table) => Self::External { dim: table.dim() },
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Table { dim, .. } | Self::External { dim } => *dim,
        }
    }
}

#[derive(Module, Debug)]
pub struct SpeakerEncoder<B: Backend> {
    table: Option<Embedding<B>>,
    dim: usize,
}

impl<B: Backend> SpeakerEncoder<B> {
    pub fn new(conditioning: SpeakerConditioning, device: &B::Device) -> Self {
        let table = match conditioning {
            SpeakerConditioning::Table { count, dim } => {
                Some(EmbeddingConfig::new(count.max(1), dim).init(device))
            }
            _ => None,
        };
        Self {
            table,
            dim: conditioning.dim(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Speaker vectors `[batch, dim]`, or `None` without conditioning.
    /// Missing inputs fall back to a zero vector.
    pub fn forward(
        &self,
        ids: Option<Tensor<B, 1, Int>>,
        vectors: Option<Tensor<B, 2>>,
        batch: usize,
        device: &B::Device,
    ) -> Option<Tensor<B, 2>> {
        if self.dim == 0 {
            return None;
        }
        let embedded = match (&self.table, ids, vectors) {
            (Some(table), Some(ids), _) => Some(
                table
                    .forward(ids.unsqueeze_dim::<2>(1))
                    .reshape([batch, self.dim]),
            ),
            (None, _, Some(vectors)) => Some(vectors),
            _ => None,
        };
        Some(embedded.unwrap_or_else(|| Tensor::zeros([batch, self.dim], device)))
    }
}

/// Single-item tensors for a synthesis speaker.
pub fn speaker_inputs<B: Backend>(
    speaker: Option<&SpeakerRef>,
    device: &B::Device,
) -> (Option<Tensor<B, 1, Int>>, Option<Tensor<B, 2>>) {
    match speaker {
        Some(SpeakerRef::Id(id)) => (
            Some(Tensor::from_data(TensorData::new(vec![*id], [1]), device)),
            None,
        ),
        Some(SpeakerRef::Vector(values)) => (
            None,
            Some(Tensor::from_data(
                TensorData::new(values.clone(), [1, values.len()]),
                device,
            )),
        ),
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn table_lookup_and_fallback() {
        let device = NdArrayDevice::default();
        let encoder = SpeakerEncoder::<TestBackend>::new(
            SpeakerConditioning::Table { count: 3, dim: 4 },
            &device,
        );
        let (ids, vectors) = speaker_inputs::<TestBackend>(Some(&SpeakerRef::Id(2)), &device);
        let out = encoder.forward(ids, vectors, 1, &device).expect("vector");
        assert_eq!(out.dims(), [1, 4]);
        let zeros = encoder.forward(None, None, 2, &device).expect("vector");
        assert_eq!(zeros.dims(), [2, 4]);
    }

    #[test]
    fn no_conditioning_yields_none() {
        let device = NdArrayDevice::default();
        let encoder = SpeakerEncoder::<TestBackend>::new(SpeakerConditioning::None, &device);
        assert!(encoder.forward(None, None, 1, &device).is_none());
    }
}
