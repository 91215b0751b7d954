use anyhow::Result;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

#[derive(Debug, Default)]
pub struct WavIo;

impl WavIo {
    /// Read a WAV file and downmix all channels to mono.
    pub fn read_mono(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32)> {
        let mut reader = WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels as usize;
        if channels == 0 {
            anyhow::bail!("WAV file declares zero channels");
        }
        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
            SampleFormat::Int => {
                let max = (1_i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|sample| sample.map(|value| value as f32 / max))
                    .collect::<Result<_, _>>()?
            }
        };
        let mono = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        Ok((mono, spec.sample_rate))
    }

    /// Write mono samples as 16-bit PCM, clipping to `[-1, 1]`.
    pub fn write_mono(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> Result<()> {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec)?;
        for value in samples {
            let value = if value.is_finite() { value.clamp(-1.0, 1.0) } else { 0.0 };
            let scaled = (value * i16::MAX as f32).round() as i16;
            writer.write_sample(scaled)?;
        }
        writer.finalize()?;
        Ok(())
    }
}
