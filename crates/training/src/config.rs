//! Command-line hyperparameters and the values derived from them.

use anyhow::bail;
use clap::{ArgAction, Parser, ValueEnum};
use models::ClassifierConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use voice_dataset::{spectrogram_crop, DatasetSource, FragmentConfig, StftConfig};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Baseline,
    Resnet,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Baseline => "baseline",
            ModelKind::Resnet => "resnet",
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

pub const DEFAULT_VERIFICATION_PAIRS: usize = 25_000;

/// Parse a flag by its first letter: `t`/`T` is true, anything else false.
pub fn parse_flag(raw: &str) -> Result<bool, String> {
    match raw.chars().next() {
        Some(c) => Ok(c.eq_ignore_ascii_case(&'t')),
        None => Err("expected a value such as True or False".to_string()),
    }
}

/// Verification needs at least one same-speaker and one different-speaker trial.
pub fn check_pair_count(flag: &str, pairs: usize) -> anyhow::Result<()> {
    if pairs < 2 {
        bail!("{flag} must be at least 2, got {pairs}");
    }
    Ok(())
}

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(
    name = "train",
    about = "Train a speaker classifier on LibriSpeech with SITW and dev-clean verification"
)]
pub struct TrainArgs {
    /// Architecture to train.
    #[arg(long, value_enum)]
    pub model: ModelKind,
    /// Convolution dimensionality (1 or 2).
    #[arg(long)]
    pub dim: usize,
    /// Initial learning rate.
    #[arg(long)]
    pub lr: f64,
    #[arg(long)]
    pub weight_decay: f64,
    #[arg(long)]
    pub momentum: f64,
    #[arg(long)]
    pub epochs: usize,
    /// Width of the first convolutional layer.
    #[arg(long)]
    pub filters: usize,
    #[arg(long)]
    pub batch_size: usize,
    /// Clip length in seconds.
    #[arg(long)]
    pub n_seconds: f64,
    /// Keep every n-th audio sample.
    #[arg(long)]
    pub downsampling: usize,
    /// Use spectrograms rather than raw waveform as inputs.
    #[arg(long, action = ArgAction::Set, default_value = "True", value_parser = parse_flag)]
    pub spectrogram: bool,
    /// Read precomputed spectrograms instead of computing them from raw audio.
    #[arg(long, action = ArgAction::Set, default_value = "True", value_parser = parse_flag)]
    pub precompute_spect: bool,
    /// STFT window length in seconds.
    #[arg(long)]
    pub window_length: f64,
    /// STFT window hop in seconds.
    #[arg(long)]
    pub window_hop: f64,

    /// Backend to use (ndarray, or wgpu if built with `backend-wgpu`).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Seed for the split, shuffling and verification pairs.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Hold out the same fraction of every speaker for validation.
    #[arg(long, default_value_t = false)]
    pub stratify: bool,
    /// Trial pairs per verification corpus and epoch.
    #[arg(long, default_value_t = DEFAULT_VERIFICATION_PAIRS)]
    pub verification_pairs: usize,
    /// Loader threads per batch (defaults to the number of CPU cores).
    #[arg(long)]
    pub num_workers: Option<usize>,
    /// Project paths file (TOML).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

fn python_bool(v: bool) -> &'static str {
    if v {
        "True"
    } else {
        "False"
    }
}

/// Shortest round-trip float text with a signed, two-digit exponent
/// (`1e-05`, `2.5e+16`), so artifact names match earlier runs.
fn python_float(v: f64) -> String {
    if v.is_nan() {
        return "nan".into();
    }
    let text = format!("{v:?}");
    let Some((mantissa, exponent)) = text.split_once('e') else {
        return text;
    };
    let (sign, digits) = match exponent.strip_prefix('-') {
        Some(digits) => ('-', digits),
        None => ('+', exponent),
    };
    format!("{mantissa}e{sign}{digits:0>2}")
}

impl TrainArgs {
    /// `key=value` pairs of the hyperparameters joined with `__`; names run artifacts.
    pub fn param_str(&self) -> String {
        [
            format!("model={}", self.model.as_str()),
            format!("dim={}", self.dim),
            format!("lr={}", python_float(self.lr)),
            format!("weight_decay={}", python_float(self.weight_decay)),
            format!("momentum={}", python_float(self.momentum)),
            format!("epochs={}", self.epochs),
            format!("filters={}", self.filters),
            format!("batch_size={}", self.batch_size),
            format!("n_seconds={}", python_float(self.n_seconds)),
            format!("downsampling={}", self.downsampling),
            format!("spectrogram={}", python_bool(self.spectrogram)),
            format!("precompute_spect={}", python_bool(self.precompute_spect)),
            format!("window_length={}", python_float(self.window_length)),
            format!("window_hop={}", python_float(self.window_hop)),
        ]
        .join("__")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.spectrogram {
            if !matches!(self.dim, 1 | 2) {
                bail!("spectrogram models support --dim 1 or 2, got {}", self.dim);
            }
        } else if self.dim != 1 {
            bail!("raw waveform models support --dim 1 only, got {}", self.dim);
        }
        for (name, value) in [
            ("--n-seconds", self.n_seconds),
            ("--window-length", self.window_length),
            ("--window-hop", self.window_hop),
            ("--lr", self.lr),
        ] {
            if !(value.is_finite() && value > 0.0) {
                bail!("{name} must be positive, got {value}");
            }
        }
        for (name, value) in [
            ("--batch-size", self.batch_size),
            ("--filters", self.filters),
            ("--downsampling", self.downsampling),
        ] {
            if value == 0 {
                bail!("{name} must be positive");
            }
        }
        check_pair_count("--verification-pairs", self.verification_pairs)?;
        if self.spectrogram && self.crop_timesteps() == 0 {
            bail!(
                "--n-seconds {} is shorter than one --window-hop {}",
                self.n_seconds,
                self.window_hop
            );
        }
        Ok(())
    }

    /// Input channels seen by the model.
    pub fn in_channels(&self) -> usize {
        if self.spectrogram && self.dim == 1 {
            self.stft().bins()
        } else {
            1
        }
    }

    /// Timesteps kept by the random crop of precomputed spectrograms.
    pub fn crop_timesteps(&self) -> usize {
        (self.n_seconds / self.window_hop) as usize
    }

    pub fn stft(&self) -> StftConfig {
        StftConfig::new(self.window_length, self.window_hop)
    }

    pub fn fragment(&self) -> FragmentConfig {
        FragmentConfig::new(self.n_seconds, self.downsampling)
    }

    pub fn dataset_source(&self) -> DatasetSource {
        DatasetSource::from_flags(
            self.spectrogram,
            self.precompute_spect,
            spectrogram_crop(self.crop_timesteps(), self.dim),
            self.stft(),
        )
    }

    pub fn classifier(&self, num_classes: usize) -> ClassifierConfig {
        let build = match self.model {
            ModelKind::Baseline => ClassifierConfig::baseline,
            ModelKind::Resnet => ClassifierConfig::residual,
        };
        build(self.in_channels(), self.filters, num_classes, self.dim)
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
            .filter(|n| *n > 0)
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "train",
            "--model",
            "resnet",
            "--dim",
            "1",
            "--lr",
            "0.01",
            "--weight-decay",
            "0.0001",
            "--momentum",
            "0.9",
            "--epochs",
            "30",
            "--filters",
            "32",
            "--batch-size",
            "64",
            "--n-seconds",
            "3",
            "--downsampling",
            "1",
            "--window-length",
            "0.02",
            "--window-hop",
            "0.01",
        ]
    }

    #[test]
    fn parses_required_flags_and_defaults() {
        let args = TrainArgs::try_parse_from(base_args()).unwrap();
        assert_eq!(args.model, ModelKind::Resnet);
        assert!(args.spectrogram);
        assert!(args.precompute_spect);
        assert_eq!(args.backend, BackendKind::NdArray);
        assert!(!args.stratify);
        assert_eq!(args.verification_pairs, 25_000);
        assert_eq!(args.in_channels(), 161);
        assert_eq!(args.crop_timesteps(), 300);
        args.validate().unwrap();
    }

    #[test]
    fn verification_needs_two_pairs() {
        let mut argv = base_args();
        argv.extend(["--verification-pairs", "1"]);
        let err = TrainArgs::try_parse_from(argv).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("--verification-pairs"));

        let mut argv = base_args();
        argv.extend(["--verification-pairs", "2"]);
        TrainArgs::try_parse_from(argv).unwrap().validate().unwrap();
    }

    #[test]
    fn param_str_lists_hyperparameters_in_order() {
        let args = TrainArgs::try_parse_from(base_args()).unwrap();
        assert_eq!(
            args.param_str(),
            "model=resnet__dim=1__lr=0.01__weight_decay=0.0001__momentum=0.9__epochs=30__\
             filters=32__batch_size=64__n_seconds=3.0__downsampling=1__spectrogram=True__\
             precompute_spect=True__window_length=0.02__window_hop=0.01"
        );
    }

    #[test]
    fn floats_use_two_digit_exponents() {
        assert_eq!(python_float(3.0), "3.0");
        assert_eq!(python_float(0.0001), "0.0001");
        assert_eq!(python_float(1e-5), "1e-05");
        assert_eq!(python_float(2.5e-7), "2.5e-07");
        assert_eq!(python_float(1e16), "1e+16");
        assert_eq!(python_float(1.5e-100), "1.5e-100");

        let mut argv = base_args();
        argv[8] = "0.00001";
        let args = TrainArgs::try_parse_from(argv).unwrap();
        assert!(args.param_str().contains("__weight_decay=1e-05__"));
    }

    #[test]
    fn flags_read_the_first_letter() {
        assert_eq!(parse_flag("True"), Ok(true));
        assert_eq!(parse_flag("t"), Ok(true));
        assert_eq!(parse_flag("false"), Ok(false));
        assert_eq!(parse_flag("yes"), Ok(false));
        assert!(parse_flag("").is_err());

        let mut argv = base_args();
        argv.extend(["--spectrogram", "False", "--precompute-spect", "f"]);
        let args = TrainArgs::try_parse_from(argv).unwrap();
        assert!(!args.spectrogram);
        assert!(!args.precompute_spect);
        assert_eq!(args.in_channels(), 1);
        assert!(args.dataset_source().is_raw_waveform());
    }

    #[test]
    fn unsupported_dims_are_rejected() {
        let mut argv = base_args();
        argv[4] = "3";
        assert!(TrainArgs::try_parse_from(argv.clone()).unwrap().validate().is_err());

        argv[4] = "2";
        let args = TrainArgs::try_parse_from(argv.clone()).unwrap();
        assert_eq!(args.in_channels(), 1);
        args.validate().unwrap();

        argv.extend(["--spectrogram", "false"]);
        assert!(TrainArgs::try_parse_from(argv).unwrap().validate().is_err());
    }

    #[test]
    fn unknown_models_fail_to_parse() {
        let mut argv = base_args();
        argv[2] = "vgg";
        assert!(TrainArgs::try_parse_from(argv).is_err());
    }

    #[test]
    fn missing_hyperparameters_fail_to_parse() {
        let argv: Vec<&str> = base_args().into_iter().take(5).collect();
        assert!(TrainArgs::try_parse_from(argv).is_err());
    }
}
