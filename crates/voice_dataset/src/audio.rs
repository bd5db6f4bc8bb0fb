//! WAV access: header probing and mono fragment reads.

use crate::types::{DatasetResult, VoiceDatasetError, SAMPLE_RATE};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    pub frames: usize,
    pub sample_rate: u32,
    pub channels: u16,
}

fn open(path: &Path) -> DatasetResult<hound::WavReader<BufReader<File>>> {
    hound::WavReader::open(path).map_err(|e| match e {
        hound::Error::IoError(source) => VoiceDatasetError::io(path, source),
        other => VoiceDatasetError::Wav {
            path: path.to_path_buf(),
            source: other,
        },
    })
}

/// Read the header only.
pub fn probe(path: &Path) -> DatasetResult<WavInfo> {
    let reader = open(path)?;
    let spec = reader.spec();
    Ok(WavInfo {
        frames: reader.duration() as usize,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Read up to `frames` frames starting at frame `start`, averaged to mono and scaled to [-1, 1].
///
/// Fails unless the file is recorded at [`SAMPLE_RATE`].
pub fn read_mono(path: &Path, start: usize, frames: usize) -> DatasetResult<Vec<f32>> {
    let mut reader = open(path)?;
    let spec = reader.spec();
    if spec.sample_rate != SAMPLE_RATE {
        return Err(VoiceDatasetError::SampleRate {
            path: path.to_path_buf(),
            rate: spec.sample_rate,
        });
    }
    let wav_err = |e: hound::Error| VoiceDatasetError::Wav {
        path: path.to_path_buf(),
        source: e,
    };
    if start > 0 {
        reader.seek(start as u32).map_err(|e| VoiceDatasetError::io(path, e))?;
    }
    let channels = spec.channels.max(1) as usize;
    let wanted = frames * channels;
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .take(wanted)
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<_, _>>()
                .map_err(wav_err)?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .take(wanted)
            .collect::<Result<_, _>>()
            .map_err(wav_err)?,
    };
    if channels == 1 {
        return Ok(interleaved);
    }
    Ok(interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect())
}

/// Write 16-bit mono PCM at [`SAMPLE_RATE`]; used to build fixtures and exports.
pub fn write_mono(path: &Path, samples: &[f32]) -> DatasetResult<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| VoiceDatasetError::io(parent, e))?;
    }
    let wav_err = |e: hound::Error| VoiceDatasetError::Wav {
        path: path.to_path_buf(),
        source: e,
    };
    let mut writer = hound::WavWriter::create(path, spec).map_err(wav_err)?;
    for s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(v).map_err(wav_err)?;
    }
    writer.finalize().map_err(wav_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_read_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<f32> = (0..1000).map(|i| (i as f32 / 1000.0) - 0.5).collect();
        write_mono(&path, &samples).unwrap();

        let info = probe(&path).unwrap();
        assert_eq!(info.frames, 1000);
        assert_eq!(info.sample_rate, SAMPLE_RATE);

        let frag = read_mono(&path, 500, 10).unwrap();
        assert_eq!(frag.len(), 10);
        assert!((frag[0] - samples[500]).abs() < 1e-3);

        let tail = read_mono(&path, 995, 10).unwrap();
        assert_eq!(tail.len(), 5);
    }

    #[test]
    fn other_sample_rates_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fast.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.finalize().unwrap();
        assert!(matches!(
            read_mono(&path, 0, 1),
            Err(VoiceDatasetError::SampleRate { rate: 8_000, .. })
        ));
    }
}
