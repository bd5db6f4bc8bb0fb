//! Raw-waveform speech corpora (LibriSpeech, Speakers in the Wild).

use crate::audio;
use crate::aug::{crop_start, fragment};
use crate::types::{
    DatasetResult, FragmentConfig, SpeakerDataset, SpeakerSample, UtteranceRecord,
    VoiceDatasetError,
};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

const AUDIO_EXTENSION: &str = "wav";

#[derive(Debug, Clone)]
struct Utterance {
    path: PathBuf,
    frames: usize,
    label: usize,
}

/// Utterances of labelled speakers, served as fixed-length waveform fragments `[1, T]`.
#[derive(Debug, Clone)]
pub struct WaveformCorpus {
    name: String,
    speakers: Vec<String>,
    utterances: Vec<Utterance>,
    fragment: FragmentConfig,
}

impl WaveformCorpus {
    /// Build from index records; utterances shorter than one fragment are
    /// dropped unless the fragment config pads.
    pub fn from_records(
        name: impl Into<String>,
        records: Vec<UtteranceRecord>,
        fragment: FragmentConfig,
    ) -> DatasetResult<Self> {
        let name = name.into();
        let min_frames = if fragment.pad {
            1
        } else {
            fragment.fragment_length()
        };
        let total = records.len();
        let kept: Vec<UtteranceRecord> = records
            .into_iter()
            .filter(|r| r.frames >= min_frames)
            .collect();
        if kept.is_empty() {
            return Err(VoiceDatasetError::Other(format!(
                "{name}: no utterances of at least {min_frames} frames (of {total} indexed)"
            )));
        }
        let speakers: Vec<String> = kept
            .iter()
            .map(|r| r.speaker_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let utterances = kept
            .into_iter()
            .map(|r| {
                let label = speakers
                    .binary_search(&r.speaker_id)
                    .unwrap_or_default();
                Utterance {
                    path: r.filepath,
                    frames: r.frames,
                    label,
                }
            })
            .collect::<Vec<_>>();
        tracing::info!(
            corpus = %name,
            utterances = utterances.len(),
            dropped = total - utterances.len(),
            speakers = speakers.len(),
            "loaded waveform corpus"
        );
        Ok(Self {
            name,
            speakers,
            utterances,
            fragment,
        })
    }

    /// LibriSpeech subsets under `root` (`<root>/<subset>/<speaker>/<chapter>/*.wav`).
    ///
    /// Each subset's index is cached as `<root>/<subset>.index.csv`.
    pub fn librispeech(root: &Path, subsets: &[&str], fragment: FragmentConfig) -> DatasetResult<Self> {
        let mut records = Vec::new();
        for subset in subsets {
            records.extend(load_or_build_index(root, subset)?);
        }
        Self::from_records(format!("librispeech[{}]", subsets.join(",")), records, fragment)
    }

    /// Speakers in the Wild: `<root>/<split>/lists/<list>.lst` with `<speaker> <path>` lines.
    pub fn speakers_in_the_wild(
        root: &Path,
        split: &str,
        list: &str,
        fragment: FragmentConfig,
    ) -> DatasetResult<Self> {
        let split_dir = root.join(split);
        let list_path = split_dir.join("lists").join(format!("{list}.lst"));
        let raw = fs::read_to_string(&list_path).map_err(|e| VoiceDatasetError::io(&list_path, e))?;
        let entries: Vec<(String, PathBuf)> = raw
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let speaker = parts.next()?;
                let rel = parts.next()?;
                Some((speaker.to_string(), split_dir.join(rel)))
            })
            .collect();
        if entries.is_empty() {
            return Err(VoiceDatasetError::Empty { path: list_path });
        }
        let records = entries
            .into_par_iter()
            .map(|(speaker_id, filepath)| {
                let info = audio::probe(&filepath)?;
                Ok(UtteranceRecord {
                    speaker_id,
                    filepath,
                    frames: info.frames,
                })
            })
            .collect::<DatasetResult<Vec<_>>>()?;
        Self::from_records(format!("sitw[{split}/{list}]"), records, fragment)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn speakers(&self) -> &[String] {
        &self.speakers
    }
}

impl SpeakerDataset for WaveformCorpus {
    fn len(&self) -> usize {
        self.utterances.len()
    }

    fn num_classes(&self) -> usize {
        self.speakers.len()
    }

    fn label(&self, index: usize) -> usize {
        self.utterances[index].label
    }

    fn get(&self, index: usize) -> DatasetResult<SpeakerSample> {
        let utt = &self.utterances[index];
        let frag_len = self.fragment.fragment_length();
        let start = if self.fragment.stochastic {
            crop_start(utt.frames, frag_len, &mut rand::rng())
        } else {
            0
        };
        let raw = audio::read_mono(&utt.path, start, frag_len)?;
        let samples = fragment(&raw, 0, frag_len, self.fragment.downsampling);
        let len = samples.len();
        SpeakerSample::new(samples, 1, len, utt.label)
    }
}

/// Load `<root>/<subset>.index.csv`, building and caching it on first use.
pub fn load_or_build_index(root: &Path, subset: &str) -> DatasetResult<Vec<UtteranceRecord>> {
    let cache = root.join(format!("{subset}.index.csv"));
    if cache.exists() {
        let mut reader = csv::Reader::from_path(&cache).map_err(|e| VoiceDatasetError::Csv {
            path: cache.clone(),
            source: e,
        })?;
        let records = reader
            .deserialize()
            .collect::<Result<Vec<UtteranceRecord>, _>>()
            .map_err(|e| VoiceDatasetError::Csv {
                path: cache.clone(),
                source: e,
            })?;
        tracing::debug!(path = %cache.display(), records = records.len(), "using cached index");
        return Ok(records);
    }

    let records = build_index(&root.join(subset))?;
    let csv_err = |e: csv::Error| VoiceDatasetError::Csv {
        path: cache.clone(),
        source: e,
    };
    let mut writer = csv::Writer::from_path(&cache).map_err(csv_err)?;
    for record in &records {
        writer.serialize(record).map_err(csv_err)?;
    }
    writer.flush().map_err(|e| VoiceDatasetError::io(&cache, e))?;
    tracing::info!(path = %cache.display(), records = records.len(), "wrote corpus index");
    Ok(records)
}

/// Index every WAV under `subset_dir`, taking the speaker from the first directory level.
pub fn build_index(subset_dir: &Path) -> DatasetResult<Vec<UtteranceRecord>> {
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(subset_dir).map_err(|e| VoiceDatasetError::io(subset_dir, e))? {
        let entry = entry.map_err(|e| VoiceDatasetError::io(subset_dir, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let speaker = entry.file_name().to_string_lossy().into_owned();
        let mut wavs = Vec::new();
        collect_wavs(&path, &mut wavs)?;
        files.extend(wavs.into_iter().map(|p| (speaker.clone(), p)));
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    if files.is_empty() {
        return Err(VoiceDatasetError::Empty {
            path: subset_dir.to_path_buf(),
        });
    }
    files
        .into_par_iter()
        .map(|(speaker_id, filepath)| {
            let info = audio::probe(&filepath)?;
            Ok(UtteranceRecord {
                speaker_id,
                filepath,
                frames: info.frames,
            })
        })
        .collect()
}

fn collect_wavs(dir: &Path, out: &mut Vec<PathBuf>) -> DatasetResult<()> {
    for entry in fs::read_dir(dir).map_err(|e| VoiceDatasetError::io(dir, e))? {
        let entry = entry.map_err(|e| VoiceDatasetError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            collect_wavs(&path, out)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(AUDIO_EXTENSION))
        {
            out.push(path);
        }
    }
    Ok(())
}
