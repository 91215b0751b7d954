//! Acoustic feature files.
//!
//! Features are SafeTensors files holding a `mel` tensor `[frames, n_mels]`
//! and optionally an `attn_prior` tensor `[frames, text_len]`. WAV paths are
//! also accepted; their mel spectrogram is computed on the fly.

use crate::audio::{AudioProcessor, WavIo};
use anyhow::{Context, Result};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Row-major 2D float matrix decoded from a feature file.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Matrix {
    pub fn row(&self, idx: usize) -> &[f32] {
        &self.data[idx * self.cols..(idx + 1) * self.cols]
    }
}

/// Features of one utterance.
#[derive(Debug, Clone)]
pub struct Features {
    pub mel: Matrix,
    pub attn_prior: Option<Matrix>,
}

/// Load the features for one metadata item.
pub fn load_features(
    path: &Path,
    num_mels: usize,
    audio: Option<&dyn AudioProcessor>,
) -> Result<Features> {
    let is_wav = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));
    let features = if is_wav {
        let audio = audio.context("WAV features require an audio processor")?;
        let (samples, sample_rate) = WavIo::read_mono(path)?;
        if sample_rate != audio.sample_rate() {
            anyhow::bail!(
                "{} has sample rate {sample_rate}, expected {}",
                path.display(),
                audio.sample_rate()
            );
        }
        let frames = audio.mel_spectrogram(&samples);
        let rows = frames.len();
        Features {
            mel: Matrix {
                rows,
                cols: audio.num_mels(),
                data: frames.into_iter().flatten().collect(),
            },
            attn_prior: None,
        }
    } else {
        load_feature_file(path)?
    };

    if features.mel.cols != num_mels {
        anyhow::bail!(
            "{} has {} mel channels, expected {num_mels}",
            path.display(),
            features.mel.cols
        );
    }
    if features.mel.rows == 0 {
        anyhow::bail!("{} has no frames", path.display());
    }
    if let Some(prior) = &features.attn_prior {
        if prior.rows != features.mel.rows {
            anyhow::bail!(
                "{} attention prior covers {} frames, mel has {}",
                path.display(),
                prior.rows,
                features.mel.rows
            );
        }
    }
    Ok(features)
}

fn load_feature_file(path: &Path) -> Result<Features> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let tensors = SafeTensors::deserialize(&bytes)
        .with_context(|| format!("parsing {}", path.display()))?;
    let mel = tensors
        .tensor("mel")
        .with_context(|| format!("{} has no `mel` tensor", path.display()))?;
    let attn_prior = match tensors.tensor("attn_prior") {
        Ok(view) => Some(matrix_from_view(&view)?),
        Err(_) => None,
    };
    Ok(Features {
        mel: matrix_from_view(&mel)?,
        attn_prior,
    })
}

/// Decode a 2D F32 or BF16 tensor view.
pub fn matrix_from_view(view: &TensorView<'_>) -> Result<Matrix> {
    let [rows, cols]: [usize; 2] = view
        .shape()
        .try_into()
        .map_err(|_| anyhow::anyhow!("Expected 2D tensor, got shape {:?}", view.shape()))?;
    let data = decode_f32(view.dtype(), view.data())?;
    Ok(Matrix { rows, cols, data })
}

/// Decode little-endian F32 or BF16 bytes into `f32` values.
pub fn decode_f32(dtype: Dtype, bytes: &[u8]) -> Result<Vec<f32>> {
    let values = match dtype {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|chunk| {
                let bits = u16::from_le_bytes([chunk[0], chunk[1]]) as u32;
                f32::from_bits(bits << 16)
            })
            .collect(),
        other => anyhow::bail!("Unsupported dtype {other:?}"),
    };
    Ok(values)
}

/// Encode `f32` values as little-endian bytes.
pub fn encode_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Write a feature file with a `mel` tensor and optional attention prior.
pub fn save_features(path: &Path, mel: &Matrix, attn_prior: Option<&Matrix>) -> Result<()> {
    let mel_bytes = encode_f32(&mel.data);
    let prior_bytes = attn_prior.map(|prior| encode_f32(&prior.data));
    let mut tensors: HashMap<String, TensorView<'_>> = HashMap::new();
    tensors.insert(
        "mel".to_string(),
        TensorView::new(Dtype::F32, vec![mel.rows, mel.cols], &mel_bytes)?,
    );
    if let (Some(prior), Some(bytes)) = (attn_prior, prior_bytes.as_ref()) {
        tensors.insert(
            "attn_prior".to_string(),
            TensorView::new(Dtype::F32, vec![prior.rows, prior.cols], bytes)?,
        );
    }
    let bytes = safetensors::serialize(&tensors, &None)?;
    fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn decodes_bf16_payloads() {
        let values = [1.0_f32, -0.5_f32, 2.25_f32];
        let mut data = Vec::new();
        for value in values {
            let bf16 = (value.to_bits() >> 16) as u16;
            data.extend_from_slice(&bf16.to_le_bytes());
        }
        let decoded = decode_f32(Dtype::BF16, &data).expect("decode bf16");
        assert_eq!(decoded, values.to_vec());
    }

    #[test]
    fn feature_file_round_trips_with_prior() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("utt.safetensors");
        let mel = Matrix {
            rows: 3,
            cols: 2,
            data: vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
        };
        let prior = Matrix {
            rows: 3,
            cols: 4,
            data: vec![1.0; 12],
        };
        save_features(&path, &mel, Some(&prior)).expect("save");

        let loaded = load_features(&path, 2, None).expect("load");
        assert_eq!(loaded.mel, mel);
        assert_eq!(loaded.mel.row(2), &[4.0, 5.0]);
        assert_eq!(loaded.attn_prior.expect("prior").cols, 4);
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("utt.safetensors");
        let mel = Matrix {
            rows: 1,
            cols: 3,
            data: vec![0.0; 3],
        };
        save_features(&path, &mel, None).expect("save");
        let err = load_features(&path, 80, None).unwrap_err();
        assert!(err.to_string().contains("mel channels"));
    }
}
