//! PNG heatmaps for spectrograms and attention alignments.
//!
//! Spectrograms are drawn with time on the x axis and mel bins growing upward.
//! Alignments put decoder steps on the x axis and encoder positions upward.

use crate::measures::AlignmentMatrix;
use anyhow::{Context, Result};
use image::{ImageBuffer, Rgb, RgbImage};
use std::path::Path;

/// Pixel height of every spectrogram / alignment cell.
const CELL: u32 = 2;
/// Rows of background between stacked panels.
const GAP: u32 = 4;

/// Dark blue → teal → yellow.
const PALETTE: [[f32; 3]; 5] = [
    [68.0, 1.0, 84.0],
    [59.0, 82.0, 139.0],
    [33.0, 145.0, 140.0],
    [94.0, 201.0, 98.0],
    [253.0, 231.0, 37.0],
];

fn color(value: f32) -> Rgb<u8> {
    let v = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    let scaled = v * (PALETTE.len() - 1) as f32;
    let lo = (scaled.floor() as usize).min(PALETTE.len() - 2);
    let t = scaled - lo as f32;
    let mut out = [0u8; 3];
    for (channel, value) in out.iter_mut().enumerate() {
        let a = PALETTE[lo][channel];
        let b = PALETTE[lo + 1][channel];
        *value = (a + (b - a) * t).round() as u8;
    }
    Rgb(out)
}

/// Columns are the first index of `values`, rows the second.
fn heatmap(columns: usize, rows: usize, value: impl Fn(usize, usize) -> f32, lo: f32, hi: f32) -> RgbImage {
    let width = (columns.max(1) as u32) * CELL;
    let height = (rows.max(1) as u32) * CELL;
    let range = (hi - lo).max(f32::EPSILON);
    ImageBuffer::from_fn(width, height, |x, y| {
        let column = (x / CELL) as usize;
        let row = rows.saturating_sub(1 + (y / CELL) as usize);
        if column >= columns || row >= rows {
            return color(0.0);
        }
        color((value(column, row) - lo) / range)
    })
}

fn value_range<'a>(values: impl Iterator<Item = &'a f32>) -> (f32, f32) {
    values
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)))
}

fn spectrogram_image(mel: &[Vec<f32>], lo: f32, hi: f32) -> RgbImage {
    let bins = mel.first().map_or(0, Vec::len);
    heatmap(mel.len(), bins, |t, m| mel[t].get(m).copied().unwrap_or(lo), lo, hi)
}

fn save(image: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image
        .save(path)
        .with_context(|| format!("writing {}", path.display()))
}

/// Heatmap of one `[frames][n_mels]` spectrogram.
pub fn plot_spectrogram(mel: &[Vec<f32>], path: &Path) -> Result<()> {
    let (lo, hi) = value_range(mel.iter().flatten());
    save(&spectrogram_image(mel, lo, hi), path)
}

/// Prediction above ground truth on a shared color scale.
pub fn plot_spectrogram_comparison(prediction: &[Vec<f32>], target: &[Vec<f32>], path: &Path) -> Result<()> {
    let (lo, hi) = value_range(prediction.iter().chain(target.iter()).flatten());
    let top = spectrogram_image(prediction, lo, hi);
    let bottom = spectrogram_image(target, lo, hi);
    let width = top.width().max(bottom.width());
    let height = top.height() + GAP + bottom.height();
    let mut canvas: RgbImage = ImageBuffer::from_pixel(width, height, Rgb([255, 255, 255]));
    image::imageops::replace(&mut canvas, &top, 0, 0);
    image::imageops::replace(&mut canvas, &bottom, 0, i64::from(top.height() + GAP));
    save(&canvas, path)
}

/// Alignment weights on a fixed `[0, 1]` scale.
pub fn plot_alignment(alignment: &AlignmentMatrix, path: &Path) -> Result<()> {
    let image = heatmap(
        alignment.decoder_steps(),
        alignment.encoder_steps(),
        |step, position| alignment.get(step, position),
        0.0,
        1.0,
    );
    save(&image, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn palette_endpoints() {
        assert_eq!(color(0.0), Rgb([68, 1, 84]));
        assert_eq!(color(1.0), Rgb([253, 231, 37]));
        assert_eq!(color(f32::NAN), color(0.0));
    }

    #[test]
    fn alignment_image_has_one_cell_per_weight() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("align.png");
        let alignment = AlignmentMatrix::new(3, 2, vec![1.0, 0.0, 0.5, 0.5, 0.0, 1.0]).expect("matrix");
        plot_alignment(&alignment, &path).expect("plot");
        let image = image::open(&path).expect("open").to_rgb8();
        assert_eq!(image.dimensions(), (3 * CELL, 2 * CELL));
        // Step 0 attends to position 0, drawn on the bottom row.
        assert_eq!(*image.get_pixel(0, 2 * CELL - 1), color(1.0));
        assert_eq!(*image.get_pixel(0, 0), color(0.0));
    }

    #[test]
    fn comparison_stacks_both_panels() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("cmp.png");
        let mel = vec![vec![0.0, 1.0, 2.0]; 5];
        plot_spectrogram_comparison(&mel, &mel[..4], &path).expect("plot");
        let image = image::open(&path).expect("open");
        assert_eq!(image.width(), 5 * CELL);
        assert_eq!(image.height(), 3 * CELL * 2 + GAP);
    }
}
