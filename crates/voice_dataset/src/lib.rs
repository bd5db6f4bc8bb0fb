//! Speech datasets, transforms, splitting, and Burn-compatible batch loading for voicemap.
//!
//! This crate provides:
//! - The `SpeakerDataset` capability trait and `.npy` / WAV readers
//! - LibriSpeech and Speakers in the Wild corpora (raw or spectrogram)
//! - Random crops, waveform fragments, and whitening
//! - Train/validation splits with optional stratification
//! - A prefetching batch loader

pub mod audio;
pub mod aug;
pub mod batch;
pub mod concat;
pub mod corpus;
pub mod factory;
pub mod folder;
pub mod npy;
pub mod spectrogram;
pub mod splits;
pub mod types;

pub use aug::{crop_start, fragment, whiten_rows, CropChannels, CroppedSpectrogram, RandomCrop};
pub use batch::{BatchStream, DataLoader, HostBatch, LoaderConfig, Subset};
pub use concat::ClassConcatDataset;
pub use corpus::WaveformCorpus;
pub use factory::{
    build_corpora, build_held_out, layout_present, spectrogram_crop, Corpora, CorpusLayout,
    DatasetSource, HeldOut,
};
pub use folder::DatasetFolder;
pub use npy::NpyArray;
pub use spectrogram::{SpectrogramDataset, Stft, StftConfig};
pub use splits::{split_indices, split_indices_stratified, validation_count, SplitIndices, VALIDATION_FRACTION};
pub use types::*;

#[cfg(feature = "burn-runtime")]
pub use batch::SpeakerBatch;
