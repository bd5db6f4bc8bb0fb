//! Sample transforms: fixed-length spectrogram crops, waveform fragments and whitening.

use crate::npy::NpyArray;
use crate::types::{DatasetResult, VoiceDatasetError};
use rand::Rng;

/// Which channels of a `[C, F, T]` spectrogram survive a crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropChannels {
    /// Keep channel 0 only (1-D convolution models).
    First,
    /// Require exactly one channel (2-D convolution models add it back).
    Single,
}

/// Random fixed-length crop along the time axis, zero-padding short inputs on the right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomCrop {
    pub timesteps: usize,
    pub channels: CropChannels,
}

impl RandomCrop {
    pub fn new(timesteps: usize, channels: CropChannels) -> Self {
        Self {
            timesteps,
            channels,
        }
    }

    /// Crop `array` to `[F, timesteps]`.
    pub fn apply<R: Rng + ?Sized>(&self, array: &NpyArray, rng: &mut R) -> DatasetResult<CroppedSpectrogram> {
        let [channels, rows, length] = array.dims3()?;
        if channels == 0 || rows == 0 {
            return Err(VoiceDatasetError::Shape(format!(
                "cannot crop empty spectrogram of shape {:?}",
                array.shape
            )));
        }
        if self.channels == CropChannels::Single && channels != 1 {
            return Err(VoiceDatasetError::Shape(format!(
                "2-D models expect single-channel spectrograms, got {channels} channels"
            )));
        }
        let n = self.timesteps;
        let start = crop_start(length, n, rng);
        let copy_len = length.saturating_sub(start).min(n);

        // Channel 0 occupies the first rows*length values in C order.
        let mut out = vec![0.0f32; rows * n];
        for r in 0..rows {
            let src = r * length + start;
            out[r * n..r * n + copy_len].copy_from_slice(&array.data[src..src + copy_len]);
        }
        Ok(CroppedSpectrogram {
            data: out,
            rows,
            timesteps: n,
        })
    }
}

/// Output of [`RandomCrop::apply`], row-major `[rows, timesteps]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CroppedSpectrogram {
    pub data: Vec<f32>,
    pub rows: usize,
    pub timesteps: usize,
}

/// Start offset of a crop of `n` steps from a signal of `length` steps.
///
/// Any offset that keeps the window inside the signal is equally likely;
/// signals no longer than `n` always start at 0.
pub fn crop_start<R: Rng + ?Sized>(length: usize, n: usize, rng: &mut R) -> usize {
    if length <= n {
        0
    } else {
        rng.random_range(0..=length - n)
    }
}

/// Cut `fragment_length` samples starting at `start`, zero-padding past the end,
/// then keep every `downsampling`-th sample.
pub fn fragment(samples: &[f32], start: usize, fragment_length: usize, downsampling: usize) -> Vec<f32> {
    let step = downsampling.max(1);
    (0..fragment_length)
        .step_by(step)
        .map(|i| samples.get(start + i).copied().unwrap_or(0.0))
        .collect()
}

/// Standardise each `width`-long row of `values` in place to zero mean and unit variance.
pub fn whiten_rows(values: &mut [f32], width: usize) {
    if width == 0 {
        return;
    }
    for row in values.chunks_mut(width) {
        standardise(row);
    }
}

pub(crate) fn standardise(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|v| {
            let d = *v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let std = var.sqrt().max(1e-8);
    for v in values.iter_mut() {
        *v = ((*v as f64 - mean) / std) as f32;
    }
}
