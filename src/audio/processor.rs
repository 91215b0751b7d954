//! Mel spectrogram analysis and Griffin-Lim inversion.

use crate::audio::io::WavIo;
use crate::config::AudioConfig;
use crate::perf::{self, Metric};
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::f32::consts::PI;
use std::path::Path;

/// Spectral front end used for features, diagnostics and test synthesis.
///
/// Spectrograms are frame-major: `mel[t][m]`.
pub trait AudioProcessor: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn num_mels(&self) -> usize;
    /// Normalized log-mel spectrogram of a waveform.
    fn mel_spectrogram(&self, wav: &[f32]) -> Vec<Vec<f32>>;
    /// Approximate waveform for a normalized log-mel spectrogram.
    fn inv_mel_spectrogram(&self, mel: &[Vec<f32>]) -> Vec<f32>;
    fn save_wav(&self, wav: &[f32], path: &Path) -> Result<()>;
}

/// STFT-based [`AudioProcessor`] with a Slaney mel filterbank.
pub struct MelProcessor {
    config: AudioConfig,
    window: Vec<f32>,
    mel_basis: Vec<Vec<f32>>,
    inv_mel_basis: Vec<Vec<f32>>,
}

impl MelProcessor {
    pub fn new(config: &AudioConfig) -> Result<Self> {
        if config.win_length > config.fft_size || config.hop_length == 0 {
            anyhow::bail!(
                "Invalid STFT setup: win_length {} fft_size {} hop_length {}",
                config.win_length,
                config.fft_size,
                config.hop_length
            );
        }
        let fmax = config.mel_fmax.unwrap_or(config.sample_rate as f32 / 2.0);
        let mel_basis = mel_filterbank(
            config.fft_size,
            config.num_mels,
            config.sample_rate,
            config.mel_fmin,
            fmax,
        );
        let inv_mel_basis = transpose_normalized(&mel_basis, config.fft_size / 2 + 1);
        Ok(Self {
            config: config.clone(),
            window: padded_hann(config.win_length, config.fft_size),
            mel_basis,
            inv_mel_basis,
        })
    }

    fn stft(&self, wav: &[f32]) -> Vec<Vec<Complex<f32>>> {
        let n_fft = self.config.fft_size;
        let hop = self.config.hop_length;
        let pad = n_fft / 2;
        let mut padded = vec![0.0_f32; wav.len() + 2 * pad];
        padded[pad..pad + wav.len()].copy_from_slice(wav);

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n_fft);
        let frames = (padded.len() - n_fft) / hop + 1;
        let mut out = Vec::with_capacity(frames);
        for idx in 0..frames {
            let start = idx * hop;
            let mut frame: Vec<Complex<f32>> = padded[start..start + n_fft]
                .iter()
                .zip(self.window.iter())
                .map(|(sample, w)| Complex::new(sample * w, 0.0))
                .collect();
            fft.process(&mut frame);
            frame.truncate(n_fft / 2 + 1);
            out.push(frame);
        }
        out
    }

    fn istft(&self, spec: &[Vec<Complex<f32>>]) -> Vec<f32> {
        let n_fft = self.config.fft_size;
        let hop = self.config.hop_length;
        let pad = n_fft / 2;
        if spec.is_empty() {
            return Vec::new();
        }
        let total = n_fft + hop * (spec.len() - 1);
        let mut signal = vec![0.0_f32; total];
        let mut norm = vec![0.0_f32; total];

        let mut planner = FftPlanner::new();
        let ifft = planner.plan_fft_inverse(n_fft);
        let mut buffer = vec![Complex::new(0.0, 0.0); n_fft];
        for (idx, half) in spec.iter().enumerate() {
            for (bin, value) in half.iter().enumerate() {
                buffer[bin] = *value;
                if bin > 0 && bin < n_fft - bin {
                    buffer[n_fft - bin] = value.conj();
                }
            }
            ifft.process(&mut buffer);
            let start = idx * hop;
            for (offset, value) in buffer.iter().enumerate() {
                let w = self.window[offset];
                signal[start + offset] += value.re / n_fft as f32 * w;
                norm[start + offset] += w * w;
            }
        }
        for (sample, weight) in signal.iter_mut().zip(norm.iter()) {
            if *weight > 1e-8 {
                *sample /= weight;
            }
        }
        let end = total.saturating_sub(pad).max(pad);
        signal[pad..end].to_vec()
    }

    fn amp_to_db(&self, value: f32) -> f32 {
        20.0 * value.max(1e-5).log10() - self.config.ref_level_db
    }

    fn db_to_amp(&self, value: f32) -> f32 {
        10.0_f32.powf((value + self.config.ref_level_db) * 0.05)
    }

    fn normalize(&self, db: f32) -> f32 {
        if !self.config.signal_norm {
            return db;
        }
        let min = self.config.min_level_db;
        let max_norm = self.config.max_norm;
        let scaled = (db - min) / -min;
        if self.config.symmetric_norm {
            (2.0 * max_norm * scaled - max_norm).clamp(-max_norm, max_norm)
        } else {
            (max_norm * scaled).clamp(0.0, max_norm)
        }
    }

    fn denormalize(&self, value: f32) -> f32 {
        if !self.config.signal_norm {
            return value;
        }
        let min = self.config.min_level_db;
        let max_norm = self.config.max_norm;
        if self.config.symmetric_norm {
            (value.clamp(-max_norm, max_norm) + max_norm) * -min / (2.0 * max_norm) + min
        } else {
            value.clamp(0.0, max_norm) * -min / max_norm + min
        }
    }

    fn griffin_lim(&self, magnitudes: &[Vec<f32>]) -> Vec<f32> {
        let _span = perf::span(Metric::GriffinLim);
        let mut rng = StdRng::seed_from_u64(0);
        let mut angles: Vec<Vec<Complex<f32>>> = magnitudes
            .iter()
            .map(|frame| {
                frame
                    .iter()
                    .map(|_| Complex::from_polar(1.0, 2.0 * PI * rng.gen::<f32>()))
                    .collect()
            })
            .collect();
        let mut wav = self.istft(&apply_phase(magnitudes, &angles));
        for _ in 0..self.config.griffin_lim_iters {
            let rebuilt = self.stft(&wav);
            for (frame_angles, frame) in angles.iter_mut().zip(rebuilt.iter()) {
                for (angle, value) in frame_angles.iter_mut().zip(frame.iter()) {
                    let norm = value.norm();
                    *angle = if norm > 1e-12 {
                        value / norm
                    } else {
                        Complex::new(1.0, 0.0)
                    };
                }
            }
            wav = self.istft(&apply_phase(magnitudes, &angles));
        }
        wav
    }
}

impl AudioProcessor for MelProcessor {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn num_mels(&self) -> usize {
        self.config.num_mels
    }

    fn mel_spectrogram(&self, wav: &[f32]) -> Vec<Vec<f32>> {
        self.stft(wav)
            .iter()
            .map(|frame| {
                self.mel_basis
                    .iter()
                    .map(|filter| {
                        let energy: f32 = filter
                            .iter()
                            .zip(frame.iter())
                            .map(|(weight, value)| weight * value.norm())
                            .sum();
                        self.normalize(self.amp_to_db(energy))
                    })
                    .collect()
            })
            .collect()
    }

    fn inv_mel_spectrogram(&self, mel: &[Vec<f32>]) -> Vec<f32> {
        let magnitudes: Vec<Vec<f32>> = mel
            .iter()
            .map(|frame| {
                let amps: Vec<f32> = frame
                    .iter()
                    .map(|value| self.db_to_amp(self.denormalize(*value)))
                    .collect();
                self.inv_mel_basis
                    .iter()
                    .map(|row| {
                        let linear: f32 = row.iter().zip(amps.iter()).map(|(w, a)| w * a).sum();
                        linear.max(1e-10).powf(self.config.power)
                    })
                    .collect()
            })
            .collect();
        self.griffin_lim(&magnitudes)
    }

    fn save_wav(&self, wav: &[f32], path: &Path) -> Result<()> {
        let peak = wav.iter().fold(0.0_f32, |acc, v| acc.max(v.abs())).max(0.01);
        let scaled: Vec<f32> = wav.iter().map(|v| v / peak * 0.95).collect();
        WavIo::write_mono(path, &scaled, self.config.sample_rate)
    }
}

fn apply_phase(magnitudes: &[Vec<f32>], angles: &[Vec<Complex<f32>>]) -> Vec<Vec<Complex<f32>>> {
    magnitudes
        .iter()
        .zip(angles.iter())
        .map(|(mags, phases)| mags.iter().zip(phases.iter()).map(|(m, p)| p * *m).collect())
        .collect()
}

/// Hann window of `win_length` centered in `n_fft` zeros.
fn padded_hann(win_length: usize, n_fft: usize) -> Vec<f32> {
    let offset = (n_fft - win_length) / 2;
    let mut window = vec![0.0_f32; n_fft];
    for i in 0..win_length {
        window[offset + i] = 0.5 * (1.0 - (2.0 * PI * i as f32 / win_length as f32).cos());
    }
    window
}

fn hz_to_mel(hz: f32) -> f32 {
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4_f32.ln() / 27.0;
    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / logstep
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f32) -> f32 {
    const F_SP: f32 = 200.0 / 3.0;
    const MIN_LOG_HZ: f32 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4_f32.ln() / 27.0;
    if mel >= min_log_mel {
        MIN_LOG_HZ * (logstep * (mel - min_log_mel)).exp()
    } else {
        F_SP * mel
    }
}

/// Slaney-scale, area-normalized triangular filters `[n_mels][n_fft / 2 + 1]`.
fn mel_filterbank(n_fft: usize, n_mels: usize, sr: u32, fmin: f32, fmax: f32) -> Vec<Vec<f32>> {
    let n_freqs = n_fft / 2 + 1;
    let freqs: Vec<f32> = (0..n_freqs)
        .map(|i| i as f32 * sr as f32 / n_fft as f32)
        .collect();
    let (mel_min, mel_max) = (hz_to_mel(fmin), hz_to_mel(fmax));
    let points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut filters = vec![vec![0.0; n_freqs]; n_mels];
    for (m, filter) in filters.iter_mut().enumerate() {
        let (left, center, right) = (points[m], points[m + 1], points[m + 2]);
        let enorm = 2.0 / (right - left);
        for (bin, &freq) in freqs.iter().enumerate() {
            let lower = (freq - left) / (center - left);
            let upper = (right - freq) / (right - center);
            filter[bin] = lower.min(upper).max(0.0) * enorm;
        }
    }
    filters
}

/// Transpose scaled by each bin's squared filter energy: exact when a single
/// filter covers the bin, an approximation where filters overlap.
fn transpose_normalized(basis: &[Vec<f32>], n_freqs: usize) -> Vec<Vec<f32>> {
    (0..n_freqs)
        .map(|bin| {
            let column: Vec<f32> = basis.iter().map(|filter| filter[bin]).collect();
            let energy: f32 = column.iter().map(|w| w * w).sum();
            if energy > 0.0 {
                column.iter().map(|w| w / energy).collect()
            } else {
                column
            }
        })
        .collect()
}
