//! Builds the training and held-out corpora for a dataset variant.

use crate::aug::{CropChannels, RandomCrop};
use crate::concat::ClassConcatDataset;
use crate::corpus::WaveformCorpus;
use crate::folder::DatasetFolder;
use crate::spectrogram::{SpectrogramDataset, StftConfig};
use crate::types::{DatasetResult, FragmentConfig, Normalisation, SpeakerDataset};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const LIBRISPEECH_TRAIN_SUBSETS: [&str; 3] =
    ["train-clean-100", "train-clean-360", "train-other-500"];
pub const LIBRISPEECH_HELD_OUT_SUBSET: &str = "dev-clean";
pub const SITW_SPLIT: &str = "dev";
pub const SITW_LIST: &str = "enroll-core";

/// How samples are produced from the corpora on disk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DatasetSource {
    /// `.npy` spectrograms, randomly cropped to a fixed number of timesteps.
    PrecomputedSpectrogram { crop: RandomCrop },
    /// Spectrograms computed from waveform fragments at load time.
    OnTheFlySpectrogram {
        stft: StftConfig,
        normalisation: Normalisation,
    },
    /// Decimated waveform fragments.
    RawWaveform,
}

impl DatasetSource {
    /// Choose the variant from the `spectrogram` and `precompute` flags.
    pub fn from_flags(
        spectrogram: bool,
        precompute: bool,
        crop: RandomCrop,
        stft: StftConfig,
    ) -> Self {
        match (spectrogram, precompute) {
            (true, true) => DatasetSource::PrecomputedSpectrogram { crop },
            (true, false) => DatasetSource::OnTheFlySpectrogram {
                stft,
                normalisation: Normalisation::Global,
            },
            (false, _) => DatasetSource::RawWaveform,
        }
    }

    pub fn is_raw_waveform(&self) -> bool {
        matches!(self, DatasetSource::RawWaveform)
    }
}

/// Corpus directories relative to the data root.
#[derive(Debug, Clone)]
pub struct CorpusLayout {
    pub data_root: PathBuf,
    pub librispeech: PathBuf,
    pub librispeech_spectrograms: PathBuf,
    pub sitw: PathBuf,
    pub sitw_spectrograms: PathBuf,
}

impl CorpusLayout {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        Self {
            librispeech: data_root.join("LibriSpeech"),
            librispeech_spectrograms: data_root.join("LibriSpeech.spec"),
            sitw: data_root.join("sitw"),
            sitw_spectrograms: data_root.join("sitw.spec"),
            data_root,
        }
    }
}

/// Corpora used by one training run.
pub struct Corpora {
    /// Training corpus; split into train/validation by the caller.
    pub train: Arc<dyn SpeakerDataset>,
    /// Same-domain speakers never seen in training.
    pub librispeech_unseen: Arc<dyn SpeakerDataset>,
    /// Cross-domain speakers.
    pub sitw: Arc<dyn SpeakerDataset>,
}

/// Held-out corpora available for verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeldOut {
    LibriSpeechDevClean,
    SitwDev,
}

const NPY_EXTENSIONS: [&str; 1] = [".npy"];

pub fn build_corpora(
    layout: &CorpusLayout,
    source: &DatasetSource,
    fragment: FragmentConfig,
) -> DatasetResult<Corpora> {
    let train: Arc<dyn SpeakerDataset> = match source {
        DatasetSource::PrecomputedSpectrogram { crop } => {
            let members = LIBRISPEECH_TRAIN_SUBSETS
                .iter()
                .map(|subset| {
                    let folder = DatasetFolder::new(
                        layout.librispeech_spectrograms.join(subset),
                        &NPY_EXTENSIONS,
                        Some(*crop),
                    )?;
                    Ok(Arc::new(folder) as Arc<dyn SpeakerDataset>)
                })
                .collect::<DatasetResult<Vec<_>>>()?;
            Arc::new(ClassConcatDataset::new(members))
        }
        DatasetSource::OnTheFlySpectrogram {
            stft,
            normalisation,
        } => Arc::new(SpectrogramDataset::new(
            WaveformCorpus::librispeech(&layout.librispeech, &LIBRISPEECH_TRAIN_SUBSETS, fragment)?,
            *stft,
            *normalisation,
        )?),
        DatasetSource::RawWaveform => Arc::new(WaveformCorpus::librispeech(
            &layout.librispeech,
            &LIBRISPEECH_TRAIN_SUBSETS,
            fragment,
        )?),
    };
    let librispeech_unseen = build_held_out(layout, source, fragment, HeldOut::LibriSpeechDevClean)?;
    let sitw = build_held_out(layout, source, fragment, HeldOut::SitwDev)?;
    Ok(Corpora {
        train,
        librispeech_unseen,
        sitw,
    })
}

/// Build a single held-out corpus with the same sample variant as training.
pub fn build_held_out(
    layout: &CorpusLayout,
    source: &DatasetSource,
    fragment: FragmentConfig,
    which: HeldOut,
) -> DatasetResult<Arc<dyn SpeakerDataset>> {
    let waveform = |layout: &CorpusLayout| -> DatasetResult<WaveformCorpus> {
        match which {
            HeldOut::LibriSpeechDevClean => WaveformCorpus::librispeech(
                &layout.librispeech,
                &[LIBRISPEECH_HELD_OUT_SUBSET],
                fragment,
            ),
            HeldOut::SitwDev => {
                WaveformCorpus::speakers_in_the_wild(&layout.sitw, SITW_SPLIT, SITW_LIST, fragment)
            }
        }
    };
    Ok(match source {
        DatasetSource::PrecomputedSpectrogram { crop } => {
            let root: PathBuf = match which {
                HeldOut::LibriSpeechDevClean => layout
                    .librispeech_spectrograms
                    .join(LIBRISPEECH_HELD_OUT_SUBSET),
                HeldOut::SitwDev => layout.sitw_spectrograms.join(SITW_SPLIT),
            };
            Arc::new(DatasetFolder::new(root, &NPY_EXTENSIONS, Some(*crop))?)
        }
        DatasetSource::OnTheFlySpectrogram {
            stft,
            normalisation,
        } => Arc::new(SpectrogramDataset::new(waveform(layout)?, *stft, *normalisation)?),
        DatasetSource::RawWaveform => Arc::new(waveform(layout)?),
    })
}

/// Crop for precomputed spectrograms: channel handling follows the conv dimensionality.
pub fn spectrogram_crop(timesteps: usize, dim: usize) -> RandomCrop {
    let channels = if dim == 1 {
        CropChannels::First
    } else {
        CropChannels::Single
    };
    RandomCrop::new(timesteps, channels)
}

/// Whether `root` looks like a data root for `source`.
pub fn layout_present(layout: &CorpusLayout, source: &DatasetSource) -> bool {
    let dir: &Path = match source {
        DatasetSource::PrecomputedSpectrogram { .. } => &layout.librispeech_spectrograms,
        _ => &layout.librispeech,
    };
    dir.is_dir()
}
