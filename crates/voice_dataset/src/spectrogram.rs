//! Log-power STFT spectrograms computed on the fly from waveform datasets.

use crate::aug::{standardise, whiten_rows};
use crate::types::{
    DatasetResult, Normalisation, SpeakerDataset, SpeakerSample, VoiceDatasetError, SAMPLE_RATE,
};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

const LOG_FLOOR: f64 = 1e-10;

/// STFT framing in seconds at the native sample rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StftConfig {
    pub window_length: f64,
    pub window_hop: f64,
}

impl StftConfig {
    pub fn new(window_length: f64, window_hop: f64) -> Self {
        Self {
            window_length,
            window_hop,
        }
    }

    pub fn nperseg(&self) -> usize {
        (self.window_length * SAMPLE_RATE as f64) as usize
    }

    pub fn hop(&self) -> usize {
        (self.window_hop * SAMPLE_RATE as f64) as usize
    }

    /// Frequency bins per frame.
    pub fn bins(&self) -> usize {
        self.nperseg() / 2 + 1
    }
}

/// Hann-windowed short-time Fourier transform producing `[bins, frames]` log power.
pub struct Stft {
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    nperseg: usize,
    hop: usize,
}

impl Stft {
    pub fn new(config: StftConfig) -> DatasetResult<Self> {
        let nperseg = config.nperseg();
        let hop = config.hop();
        if nperseg < 2 || hop == 0 {
            return Err(VoiceDatasetError::Other(format!(
                "STFT window of {nperseg} samples with hop {hop} is too small"
            )));
        }
        let fft = FftPlanner::new().plan_fft_forward(nperseg);
        // Periodic Hann window.
        let window = (0..nperseg)
            .map(|i| 0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / nperseg as f64).cos()))
            .collect();
        Ok(Self {
            fft,
            window,
            nperseg,
            hop,
        })
    }

    pub fn bins(&self) -> usize {
        self.nperseg / 2 + 1
    }

    /// Frames produced for a signal of `len` samples; short signals yield one zero-padded frame.
    pub fn frames(&self, len: usize) -> usize {
        if len <= self.nperseg {
            1
        } else {
            (len - self.nperseg) / self.hop + 1
        }
    }

    /// Row-major `[bins, frames]` log power spectrogram of `samples`.
    pub fn log_power(&self, samples: &[f32]) -> Vec<f32> {
        let bins = self.bins();
        let frames = self.frames(samples.len());
        let mut out = vec![0.0f32; bins * frames];
        let mut buf = vec![Complex::new(0.0f64, 0.0); self.nperseg];
        for t in 0..frames {
            let start = t * self.hop;
            for (i, slot) in buf.iter_mut().enumerate() {
                let s = samples.get(start + i).copied().unwrap_or(0.0) as f64;
                *slot = Complex::new(s * self.window[i], 0.0);
            }
            self.fft.process(&mut buf);
            for (f, c) in buf.iter().take(bins).enumerate() {
                out[f * frames + t] = (c.norm_sqr() + LOG_FLOOR).ln() as f32;
            }
        }
        out
    }
}

/// Wraps a waveform dataset (`[1, T]` samples) and serves normalised spectrograms.
pub struct SpectrogramDataset<D> {
    inner: D,
    stft: Stft,
    normalisation: Normalisation,
}

impl<D: SpeakerDataset> SpectrogramDataset<D> {
    pub fn new(inner: D, stft: StftConfig, normalisation: Normalisation) -> DatasetResult<Self> {
        Ok(Self {
            inner,
            stft: Stft::new(stft)?,
            normalisation,
        })
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: SpeakerDataset> SpeakerDataset for SpectrogramDataset<D> {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn num_classes(&self) -> usize {
        self.inner.num_classes()
    }

    fn label(&self, index: usize) -> usize {
        self.inner.label(index)
    }

    fn get(&self, index: usize) -> DatasetResult<SpeakerSample> {
        let wave = self.inner.get(index)?;
        if wave.rows != 1 {
            return Err(VoiceDatasetError::Shape(format!(
                "spectrograms need a single waveform row, got {}",
                wave.rows
            )));
        }
        let mut values = self.stft.log_power(&wave.features);
        let frames = self.stft.frames(wave.features.len());
        match self.normalisation {
            Normalisation::Global => standardise(&mut values),
            Normalisation::PerFrequency => whiten_rows(&mut values, frames),
            Normalisation::None => {}
        }
        SpeakerSample::new(values, self.stft.bins(), frames, wave.label)
    }
}
