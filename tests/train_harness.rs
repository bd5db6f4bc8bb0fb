#![cfg(all(feature = "training", feature = "voice-dataset"))]

use anyhow::Result;
use clap::Parser;
use std::fs;
use std::path::Path;
use tempfile::tempdir;
use voicemap::training::{run_eval, run_train, CheckpointMeta, EvalArgs, ModelKind, TrainArgs};
use voicemap::voice_dataset::{npy, CorpusLayout};

/// Spectrogram rows for `--window-length 0.001` (16-sample frames, 9 bins).
const BINS: usize = 9;

/// `utterances` spectrograms `[1, BINS, frames]` whose energy sits in a
/// speaker-specific bin.
fn write_speaker(root: &Path, speaker: usize, utterances: usize, frames: usize) -> Result<()> {
    for u in 0..utterances {
        let mut data = vec![-4.0f32; BINS * frames];
        let bin = speaker % BINS;
        for t in 0..frames {
            data[bin * frames + t] = 2.0 + ((t + u) % 3) as f32 * 0.1;
        }
        npy::save_f32(
            &root.join(format!("{speaker}")).join("0001").join(format!("{u}.npy")),
            &data,
            &[1, BINS, frames],
        )?;
    }
    Ok(())
}

fn write_corpora(data_root: &Path) -> Result<()> {
    let layout = CorpusLayout::new(data_root);
    let mut speaker = 0;
    for subset in voicemap::voice_dataset::factory::LIBRISPEECH_TRAIN_SUBSETS {
        for _ in 0..2 {
            write_speaker(&layout.librispeech_spectrograms.join(subset), speaker, 5, 40)?;
            speaker += 1;
        }
    }
    for held_out in [100, 101] {
        write_speaker(&layout.librispeech_spectrograms.join("dev-clean"), held_out, 3, 40)?;
    }
    for (i, sitw) in [102, 103].into_iter().enumerate() {
        // shorter than the crop on purpose: zero padded
        write_speaker(&layout.sitw_spectrograms.join("dev"), sitw, 3, 24 + i * 20)?;
    }
    Ok(())
}

fn train_args(config: &Path, model: &str, epochs: usize) -> Result<TrainArgs> {
    Ok(TrainArgs::try_parse_from([
        "train",
        "--model",
        model,
        "--dim",
        "1",
        "--lr",
        "0.01",
        "--weight-decay",
        "0.0001",
        "--momentum",
        "0.9",
        "--epochs",
        &epochs.to_string(),
        "--filters",
        "4",
        "--batch-size",
        "3",
        "--n-seconds",
        "0.32",
        "--downsampling",
        "1",
        "--window-length",
        "0.001",
        "--window-hop",
        "0.01",
        "--seed",
        "7",
        "--num-workers",
        "2",
        "--verification-pairs",
        "20",
        "--config",
        config.to_str().expect("utf8 path"),
    ])?)
}

#[test]
fn precomputed_run_writes_checkpoint_log_and_evaluates() -> Result<()> {
    let temp = tempdir()?;
    let data_root = temp.path().join("data");
    let out_root = temp.path().join("out");
    write_corpora(&data_root)?;
    let config = temp.path().join("voicemap.toml");
    fs::write(
        &config,
        format!(
            "path = \"{}\"\ndata_path = \"{}\"\n",
            out_root.display(),
            data_root.display()
        ),
    )?;

    let args = train_args(&config, "baseline", 2)?;
    assert_eq!(args.model, ModelKind::Baseline);
    assert_eq!(args.in_channels(), BINS);
    assert_eq!(args.crop_timesteps(), 32);

    let summary = run_train(args)?;
    assert_eq!(summary.num_classes, 6);
    assert_eq!(summary.history.len(), 2);
    assert!(summary.param_str.starts_with("model=baseline__dim=1__lr=0.01__"));
    assert_eq!(
        summary.checkpoint,
        out_root
            .join("models")
            .join(format!("classifier_{}.bin", summary.param_str))
    );
    assert!(summary.checkpoint.exists());
    for key in [
        "val_loss",
        "sitw_dev_eer",
        "sitw_dev_auc",
        "librispeech_dev_clean_eer",
        "librispeech_dev_clean_auc",
    ] {
        assert!(summary.history[0].contains_key(key), "missing {key}");
    }

    let log = fs::read_to_string(&summary.log)?;
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("epoch,accuracy,librispeech_dev_clean_auc"));

    let sidecar = summary.checkpoint.with_extension("json");
    let meta = CheckpointMeta::load(&sidecar)?;
    assert_eq!(meta.param_str, summary.param_str);
    assert_eq!(meta.classifier.num_classes, 6);
    assert_eq!(meta.classifier.in_channels, BINS);

    let eval = EvalArgs::try_parse_from([
        "eval",
        "--checkpoint",
        summary.checkpoint.to_str().expect("utf8 path"),
        "--corpus",
        "librispeech-dev-clean",
        "--pairs",
        "16",
        "--seed",
        "3",
        "--config",
        config.to_str().expect("utf8 path"),
    ])?;
    let scores = run_eval(&eval)?;
    assert!((0.0..=1.0).contains(&scores.eer));
    assert!((0.0..=1.0).contains(&scores.auc));
    Ok(())
}

#[test]
fn missing_corpora_fail_before_training() -> Result<()> {
    let temp = tempdir()?;
    let config = temp.path().join("voicemap.toml");
    fs::write(
        &config,
        format!(
            "path = \"{}\"\ndata_path = \"{}\"\n",
            temp.path().join("out").display(),
            temp.path().join("nowhere").display()
        ),
    )?;
    let err = run_train(train_args(&config, "resnet", 1)?).expect_err("no corpora");
    assert!(err.to_string().contains("no corpora"));
    Ok(())
}
