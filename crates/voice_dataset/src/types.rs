//! Core types, error definitions, and the dataset capability trait.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Native sample rate every corpus is expected to be recorded at.
pub const SAMPLE_RATE: u32 = 16_000;

pub type DatasetResult<T> = Result<T, VoiceDatasetError>;

#[derive(Debug, Error)]
pub enum VoiceDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("npy parse error at {path}: {msg}")]
    Npy { path: PathBuf, msg: String },
    #[error("wav decode error at {path}: {source}")]
    Wav {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },
    #[error("csv error at {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("unexpected sample rate {rate} Hz at {path} (expected {SAMPLE_RATE} Hz)")]
    SampleRate { path: PathBuf, rate: u32 },
    #[error("shape error: {0}")]
    Shape(String),
    #[error("no samples found under {path}")]
    Empty { path: PathBuf },
    #[error("{0}")]
    Other(String),
}

impl VoiceDatasetError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VoiceDatasetError::Io {
            path: path.into(),
            source,
        }
    }
}

/// One loaded example: a `[rows, timesteps]` feature matrix and its class.
///
/// `rows` is 1 for raw waveform and the number of frequency bins for spectrograms.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerSample {
    /// Row-major `[rows, timesteps]` values.
    pub features: Vec<f32>,
    pub rows: usize,
    pub timesteps: usize,
    pub label: usize,
}

impl SpeakerSample {
    pub fn new(features: Vec<f32>, rows: usize, timesteps: usize, label: usize) -> DatasetResult<Self> {
        if features.len() != rows * timesteps {
            return Err(VoiceDatasetError::Shape(format!(
                "feature buffer has {} values, expected {rows}x{timesteps}",
                features.len()
            )));
        }
        Ok(Self {
            features,
            rows,
            timesteps,
            label,
        })
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.timesteps]
    }
}

/// Labeled collection of audio-derived samples, one speaker class per sample.
///
/// `get` may be stochastic (random fragments/crops), so two calls with the same
/// index are not required to return identical features.
pub trait SpeakerDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct classes (speakers).
    fn num_classes(&self) -> usize;

    /// Class of sample `index`, without loading audio.
    fn label(&self, index: usize) -> usize;

    fn get(&self, index: usize) -> DatasetResult<SpeakerSample>;
}

/// How waveform fragments are cut from utterances.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FragmentConfig {
    /// Fragment length in seconds at the native sample rate.
    pub n_seconds: f64,
    /// Keep every `downsampling`-th sample of the fragment.
    pub downsampling: usize,
    /// Random fragment offset; otherwise fragments start at 0.
    pub stochastic: bool,
    /// Zero-pad utterances shorter than a fragment instead of dropping them.
    pub pad: bool,
}

impl FragmentConfig {
    pub fn new(n_seconds: f64, downsampling: usize) -> Self {
        Self {
            n_seconds,
            downsampling: downsampling.max(1),
            stochastic: true,
            pad: false,
        }
    }

    /// Fragment length in native-rate samples.
    pub fn fragment_length(&self) -> usize {
        (self.n_seconds * SAMPLE_RATE as f64) as usize
    }

    /// Fragment length after decimation.
    pub fn output_length(&self) -> usize {
        self.fragment_length().div_ceil(self.downsampling.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Normalisation {
    /// Standardise the whole spectrogram to zero mean, unit variance.
    Global,
    /// Standardise each frequency row independently.
    PerFrequency,
    None,
}

/// Row of a cached corpus index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtteranceRecord {
    pub speaker_id: String,
    pub filepath: PathBuf,
    /// Length in frames at the native sample rate.
    pub frames: usize,
}
