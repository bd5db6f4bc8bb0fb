//! Verification of a saved checkpoint on one held-out corpus.

use std::path::PathBuf;

use anyhow::Context;
use burn::tensor::backend::Backend;
use clap::{Parser, ValueEnum};
use models::{Architecture, BaselineClassifier, ResidualClassifier, SpeakerModel};
use rand::rngs::StdRng;
use rand::SeedableRng;
use voice_dataset::{build_held_out, CorpusLayout, HeldOut, SpeakerDataset};

use crate::callbacks::CheckpointMeta;
use crate::config::{check_pair_count, BackendKind, DEFAULT_VERIFICATION_PAIRS};
use crate::fit::BatchPreparation;
use crate::paths::{sidecar_for, ProjectPaths};
use crate::util::{load_classifier, validate_backend_choice};
use crate::verification::{evaluate_verification, sample_pairs, VerificationScores};
use crate::{Runtime, TrainBackend};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalCorpus {
    Sitw,
    LibrispeechDevClean,
}

impl From<EvalCorpus> for HeldOut {
    fn from(corpus: EvalCorpus) -> Self {
        match corpus {
            EvalCorpus::Sitw => HeldOut::SitwDev,
            EvalCorpus::LibrispeechDevClean => HeldOut::LibriSpeechDevClean,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "eval",
    about = "Speaker verification EER/AUC of a classifier checkpoint on a held-out corpus"
)]
pub struct EvalArgs {
    /// Checkpoint (`.bin`) written by `train`; its `.json` sidecar must sit next to it.
    #[arg(long)]
    pub checkpoint: PathBuf,
    #[arg(long, value_enum, default_value_t = EvalCorpus::Sitw)]
    pub corpus: EvalCorpus,
    /// Trial pairs to score.
    #[arg(long, default_value_t = DEFAULT_VERIFICATION_PAIRS)]
    pub pairs: usize,
    /// Embedding batch size (defaults to the training batch size).
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Project paths file (TOML).
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub seed: Option<u64>,
}

pub fn run_eval(args: &EvalArgs) -> anyhow::Result<VerificationScores> {
    validate_backend_choice(args.backend)?;
    check_pair_count("--pairs", args.pairs)?;
    let meta = CheckpointMeta::load(&sidecar_for(&args.checkpoint))?;
    let paths = ProjectPaths::load(args.config.as_deref())?;
    let source = meta.args.dataset_source();
    let layout = CorpusLayout::new(&paths.data_path);
    let dataset = build_held_out(&layout, &source, meta.args.fragment(), args.corpus.into())
        .with_context(|| format!("building {:?} under {}", args.corpus, layout.data_root.display()))?;
    tracing::info!(
        checkpoint = %args.checkpoint.display(),
        corpus = ?args.corpus,
        samples = dataset.len(),
        speakers = dataset.num_classes(),
        "evaluating"
    );

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    };
    let pairs = sample_pairs(dataset.as_ref(), args.pairs, &mut rng)?;
    let job = EvalJob {
        meta: &meta,
        args,
        dataset: dataset.as_ref(),
        pairs: &pairs,
        prepare: BatchPreparation::for_source(&source),
    };
    match args.backend {
        BackendKind::NdArray => job.run::<TrainBackend>(&Runtime::default()),
        #[cfg(feature = "backend-wgpu")]
        BackendKind::Wgpu => job.run::<crate::WgpuBackend>(&Runtime::default()),
        #[cfg(not(feature = "backend-wgpu"))]
        BackendKind::Wgpu => anyhow::bail!("wgpu backend not built"),
    }
}

struct EvalJob<'a> {
    meta: &'a CheckpointMeta,
    args: &'a EvalArgs,
    dataset: &'a dyn SpeakerDataset,
    pairs: &'a [crate::verification::TrialPair],
    prepare: BatchPreparation,
}

impl EvalJob<'_> {
    fn run<B: Backend>(&self, runtime: &Runtime<B>) -> anyhow::Result<VerificationScores> {
        match self.meta.classifier.architecture {
            Architecture::Baseline => self.score::<B, BaselineClassifier<B>>(runtime),
            Architecture::Resnet => self.score::<B, ResidualClassifier<B>>(runtime),
        }
    }

    fn score<B: Backend, M: SpeakerModel<B>>(
        &self,
        runtime: &Runtime<B>,
    ) -> anyhow::Result<VerificationScores> {
        let model = load_classifier::<B, M>(&self.args.checkpoint, &self.meta.classifier, &runtime.device)?;
        evaluate_verification::<B, M>(
            &model,
            self.dataset,
            self.pairs,
            self.prepare,
            self.args.batch_size.unwrap_or(self.meta.args.batch_size),
            &runtime.device,
        )
    }
}
