//! Padded batches and their move onto the compute device.

use crate::data::dataset::SpeakerRef;
use crate::data::features::Features;
use anyhow::Result;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

/// One loaded utterance before padding.
#[derive(Debug, Clone)]
pub struct Sample {
    pub name: String,
    pub token_ids: Vec<i64>,
    pub features: Features,
    pub speaker: Option<SpeakerRef>,
}

/// A padded CPU-side batch produced by loader threads.
///
/// Text is right-padded with id 0, mel frames with zeros up to a multiple of
/// the model's frame multiple. Stop targets are grouped per decoder step.
#[derive(Debug, Clone)]
pub struct Batch {
    pub names: Vec<String>,
    pub text: Vec<i64>,
    pub text_lengths: Vec<usize>,
    pub max_text_len: usize,
    pub mel: Vec<f32>,
    pub mel_lengths: Vec<usize>,
    pub max_mel_len: usize,
    pub num_mels: usize,
    pub r: usize,
    /// `[batch, max_mel_len / r]`.
    pub stop_targets: Vec<f32>,
    pub speaker_ids: Option<Vec<i64>>,
    pub speaker_vectors: Option<(Vec<f32>, usize)>,
    /// `[batch, max_mel_len, max_text_len]`.
    pub attn_prior: Option<Vec<f32>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.text_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text_lengths.is_empty()
    }

    pub fn avg_text_length(&self) -> f32 {
        mean(&self.text_lengths)
    }

    pub fn avg_mel_length(&self) -> f32 {
        mean(&self.mel_lengths)
    }

    /// Move every field onto `device` as tensors.
    pub fn to_device<B: Backend>(&self, device: &B::Device) -> DeviceBatch<B> {
        let batch = self.len();
        let steps = self.max_mel_len / self.r;
        let text = Tensor::<B, 2, Int>::from_data(
            TensorData::new(self.text.clone(), [batch, self.max_text_len]),
            device,
        );
        let mel = Tensor::<B, 3>::from_data(
            TensorData::new(self.mel.clone(), [batch, self.max_mel_len, self.num_mels]),
            device,
        );
        let stop_targets = Tensor::<B, 2>::from_data(
            TensorData::new(self.stop_targets.clone(), [batch, steps]),
            device,
        );
        let speaker_ids = self.speaker_ids.as_ref().map(|ids| {
            Tensor::<B, 1, Int>::from_data(TensorData::new(ids.clone(), [batch]), device)
        });
        let speaker_vectors = self.speaker_vectors.as_ref().map(|(values, dim)| {
            Tensor::<B, 2>::from_data(TensorData::new(values.clone(), [batch, *dim]), device)
        });
        let attn_prior = self.attn_prior.as_ref().map(|values| {
            Tensor::<B, 3>::from_data(
                TensorData::new(values.clone(), [batch, self.max_mel_len, self.max_text_len]),
                device,
            )
        });
        DeviceBatch {
            text,
            text_lengths: self.text_lengths.clone(),
            text_mask: sequence_mask::<B>(&self.text_lengths, self.max_text_len, device),
            mel,
            mel_lengths: self.mel_lengths.clone(),
            mel_mask: sequence_mask::<B>(&self.mel_lengths, self.max_mel_len, device),
            stop_targets,
            speaker_ids,
            speaker_vectors,
            attn_prior,
            r: self.r,
        }
    }
}

/// A batch resident on the compute device.
#[derive(Debug, Clone)]
pub struct DeviceBatch<B: Backend> {
    /// `[batch, t_in]` token ids.
    pub text: Tensor<B, 2, Int>,
    pub text_lengths: Vec<usize>,
    /// `[batch, t_in]`, 1 on valid positions.
    pub text_mask: Tensor<B, 2>,
    /// `[batch, t_out, n_mels]`.
    pub mel: Tensor<B, 3>,
    pub mel_lengths: Vec<usize>,
    /// `[batch, t_out]`, 1 on valid frames.
    pub mel_mask: Tensor<B, 2>,
    /// `[batch, t_out / r]`.
    pub stop_targets: Tensor<B, 2>,
    pub speaker_ids: Option<Tensor<B, 1, Int>>,
    pub speaker_vectors: Option<Tensor<B, 2>>,
    pub attn_prior: Option<Tensor<B, 3>>,
    pub r: usize,
}

impl<B: Backend> DeviceBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.text_lengths.len()
    }
}

/// Float mask `[batch, max_len]` with ones before each length.
pub fn sequence_mask<B: Backend>(lengths: &[usize], max_len: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut values = vec![0.0_f32; lengths.len() * max_len];
    for (row, &len) in lengths.iter().enumerate() {
        for value in values[row * max_len..row * max_len + len.min(max_len)].iter_mut() {
            *value = 1.0;
        }
    }
    Tensor::from_data(TensorData::new(values, [lengths.len(), max_len]), device)
}

/// Per-step stop labels: a step is positive once any of its `r` frames is at
/// or past the last real frame.
pub fn stop_labels(mel_len: usize, padded_len: usize, r: usize) -> Vec<f32> {
    let steps = padded_len / r;
    (0..steps)
        .map(|step| {
            let last_frame = step * r + r - 1;
            if last_frame + 1 >= mel_len {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}

/// Pad and stack samples into a [`Batch`].
pub fn collate(samples: Vec<Sample>, frame_multiple: usize, r: usize) -> Result<Batch> {
    if samples.is_empty() {
        anyhow::bail!("cannot collate an empty batch");
    }
    let frame_multiple = frame_multiple.max(1);
    if frame_multiple % r != 0 {
        anyhow::bail!("frame multiple {frame_multiple} is not a multiple of r = {r}");
    }
    let batch = samples.len();
    let num_mels = samples[0].features.mel.cols;
    let max_text_len = samples.iter().map(|s| s.token_ids.len()).max().unwrap_or(0);
    let longest = samples.iter().map(|s| s.features.mel.rows).max().unwrap_or(0);
    let max_mel_len = longest.div_ceil(frame_multiple) * frame_multiple;

    let mut text = vec![0_i64; batch * max_text_len];
    let mut mel = vec![0.0_f32; batch * max_mel_len * num_mels];
    let mut stop_targets = Vec::with_capacity(batch * max_mel_len / r);
    let with_prior = samples.iter().any(|s| s.features.attn_prior.is_some());
    let mut attn_prior = with_prior.then(|| vec![0.0_f32; batch * max_mel_len * max_text_len]);
    let mut speaker_ids = Vec::new();
    let mut speaker_vectors = Vec::new();
    let mut speaker_dim = 0;

    for (row, sample) in samples.iter().enumerate() {
        let t_in = sample.token_ids.len();
        let t_out = sample.features.mel.rows;
        if sample.features.mel.cols != num_mels {
            anyhow::bail!("{} has {} mel channels, batch has {num_mels}", sample.name, sample.features.mel.cols);
        }
        text[row * max_text_len..row * max_text_len + t_in].copy_from_slice(&sample.token_ids);
        let base = row * max_mel_len * num_mels;
        mel[base..base + t_out * num_mels].copy_from_slice(&sample.features.mel.data);
        stop_targets.extend(stop_labels(t_out, max_mel_len, r));

        if let Some(prior_buf) = attn_prior.as_mut() {
            let base = row * max_mel_len * max_text_len;
            match &sample.features.attn_prior {
                Some(prior) => {
                    if prior.cols != t_in {
                        anyhow::bail!(
                            "{} attention prior covers {} symbols, text has {t_in}",
                            sample.name,
                            prior.cols
                        );
                    }
                    for frame in 0..t_out {
                        let dst = base + frame * max_text_len;
                        prior_buf[dst..dst + t_in].copy_from_slice(prior.row(frame));
                    }
                }
                None => {
                    for frame in 0..t_out {
                        let dst = base + frame * max_text_len;
                        prior_buf[dst..dst + t_in].fill(1.0);
                    }
                }
            }
        }

        match &sample.speaker {
            Some(SpeakerRef::Id(id)) => speaker_ids.push(*id),
            Some(SpeakerRef::Vector(vector)) => {
                if speaker_dim != 0 && vector.len() != speaker_dim {
                    anyhow::bail!("speaker vectors in one batch differ in length");
                }
                speaker_dim = vector.len();
                speaker_vectors.extend_from_slice(vector);
            }
            None => {}
        }
    }

    Ok(Batch {
        names: samples.iter().map(|s| s.name.clone()).collect(),
        text,
        text_lengths: samples.iter().map(|s| s.token_ids.len()).collect(),
        max_text_len,
        mel,
        mel_lengths: samples.iter().map(|s| s.features.mel.rows).collect(),
        max_mel_len,
        num_mels,
        r,
        stop_targets,
        speaker_ids: (speaker_ids.len() == batch).then_some(speaker_ids),
        speaker_vectors: (speaker_dim > 0).then_some((speaker_vectors, speaker_dim)),
        attn_prior,
    })
}

fn mean(values: &[usize]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<usize>() as f32 / values.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::features::Matrix;
    use burn_ndarray::{NdArray, NdArrayDevice};

    fn sample(tokens: usize, frames: usize) -> Sample {
        Sample {
            name: format!("utt_{tokens}_{frames}"),
            token_ids: (1..=tokens as i64).collect(),
            features: Features {
                mel: Matrix {
                    rows: frames,
                    cols: 2,
                    data: vec![1.0; frames * 2],
                },
                attn_prior: None,
            },
            speaker: Some(SpeakerRef::Id(3)),
        }
    }

    #[test]
    fn stop_labels_mark_last_frame() {
        assert_eq!(stop_labels(6, 6, 1), vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        assert_eq!(stop_labels(4, 6, 1), vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        // Group [4, 5] contains the last frame (index 4).
        assert_eq!(stop_labels(5, 6, 2), vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn collate_pads_text_and_frames() {
        let batch = collate(vec![sample(4, 5), sample(2, 3)], 2, 2).expect("collate");
        assert_eq!(batch.max_text_len, 4);
        assert_eq!(batch.max_mel_len, 6);
        assert_eq!(&batch.text[4..8], &[1, 2, 0, 0]);
        assert_eq!(batch.mel_lengths, vec![5, 3]);
        assert_eq!(batch.stop_targets.len(), 2 * 3);
        assert_eq!(batch.speaker_ids, Some(vec![3, 3]));
        // Padding frames stay zero.
        let second = &batch.mel[6 * 2..];
        assert!(second[3 * 2..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn device_batch_masks_padding() {
        let batch = collate(vec![sample(4, 6), sample(3, 6)], 1, 1).expect("collate");
        let device = NdArrayDevice::default();
        let on_device = batch.to_device::<NdArray<f32>>(&device);
        assert_eq!(on_device.text.dims(), [2, 4]);
        assert_eq!(on_device.mel.dims(), [2, 6, 2]);
        let mask = on_device.text_mask.to_data();
        let mask = mask.as_slice::<f32>().expect("mask");
        assert_eq!(mask, &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn mismatched_prior_is_rejected() {
        let mut with_prior = sample(3, 2);
        with_prior.features.attn_prior = Some(Matrix {
            rows: 2,
            cols: 5,
            data: vec![1.0; 10],
        });
        assert!(collate(vec![with_prior], 1, 1).is_err());
    }
}
