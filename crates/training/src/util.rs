use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::{AutodiffBackend, Backend};
use models::{BaselineClassifier, ClassifierConfig, ResidualClassifier, SpeakerModel};
use voice_dataset::{
    build_corpora, layout_present, split_indices, split_indices_stratified, Corpora, CorpusLayout,
    DataLoader, LoaderConfig, SpeakerDataset, Subset, VALIDATION_FRACTION,
};

use crate::callbacks::{
    Callback, CheckpointMeta, CsvLogger, Evaluate, ModelCheckpoint, ReduceLROnPlateau,
};
use crate::config::{BackendKind, ModelKind, TrainArgs};
use crate::fit::{fit, BatchPreparation, EpochLogs, FitConfig};
use crate::paths::ProjectPaths;
use crate::verification::VerificationMetrics;
use crate::{Runtime, TrainBackend};

/// Install the `tracing` fmt subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
}

/// Fail fast when `kind` was not compiled into this binary.
pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    if kind == BackendKind::Wgpu && !cfg!(feature = "backend-wgpu") {
        bail!("--backend wgpu requested but this build lacks the `backend-wgpu` feature");
    }
    Ok(())
}

/// Rebuild a classifier from its config and load checkpointed weights.
pub fn load_classifier<B: Backend, M: SpeakerModel<B>>(
    path: &Path,
    config: &ClassifierConfig,
    device: &B::Device,
) -> anyhow::Result<M> {
    config.validate()?;
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    M::init(config, device)
        .load_file(path, &recorder, device)
        .with_context(|| format!("loading checkpoint {}", path.display()))
}

/// Where a finished run left its artifacts.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub param_str: String,
    pub num_classes: usize,
    pub checkpoint: PathBuf,
    pub log: PathBuf,
    pub history: Vec<EpochLogs>,
}

impl RunSummary {
    pub fn best_val_loss(&self) -> Option<f64> {
        self.history
            .iter()
            .filter_map(|logs| logs.get("val_loss").copied())
            .min_by(f64::total_cmp)
    }
}

/// Everything a run needs before the backend and model type are fixed.
struct PreparedRun {
    args: TrainArgs,
    param_str: String,
    paths: ProjectPaths,
    corpora: Corpora,
    train_loader: DataLoader,
    val_loader: DataLoader,
    prepare: BatchPreparation,
    classifier: ClassifierConfig,
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<RunSummary> {
    args.validate()?;
    validate_backend_choice(args.backend)?;

    let paths = ProjectPaths::load(args.config.as_deref())?;
    paths.setup_dirs()?;
    let param_str = args.param_str();
    tracing::info!(%param_str, "starting run");

    let source = args.dataset_source();
    let layout = CorpusLayout::new(&paths.data_path);
    if !layout_present(&layout, &source) {
        bail!(
            "no corpora under {}; expected LibriSpeech{} there",
            layout.data_root.display(),
            if args.spectrogram && args.precompute_spect {
                ".spec"
            } else {
                ""
            }
        );
    }
    let corpora = build_corpora(&layout, &source, args.fragment())
        .with_context(|| format!("building corpora under {}", layout.data_root.display()))?;
    let num_classes = corpora.train.num_classes();
    tracing::info!(
        num_classes,
        samples = corpora.train.len(),
        sitw = corpora.sitw.len(),
        librispeech_unseen = corpora.librispeech_unseen.len(),
        "corpora ready"
    );

    let split = if args.stratify {
        split_indices_stratified(corpora.train.as_ref(), VALIDATION_FRACTION, args.seed)?
    } else {
        split_indices(corpora.train.len(), VALIDATION_FRACTION, args.seed)?
    };
    tracing::info!(train = split.train.len(), val = split.val.len(), "split");
    let train: Arc<dyn SpeakerDataset> = Arc::new(Subset::new(corpora.train.clone(), split.train));
    let val: Arc<dyn SpeakerDataset> = Arc::new(Subset::new(corpora.train.clone(), split.val));

    let loader_cfg = LoaderConfig {
        num_workers: args.num_workers(),
        seed: args.seed,
        ..LoaderConfig::new(args.batch_size)
    };
    let train_loader = DataLoader::new(train, loader_cfg.clone())?;
    let val_loader = DataLoader::new(
        val,
        LoaderConfig {
            seed: args.seed.map(|s| s.wrapping_add(1)),
            ..loader_cfg
        },
    )?;

    let run = PreparedRun {
        prepare: BatchPreparation::for_source(&source),
        classifier: args.classifier(num_classes),
        param_str,
        paths,
        corpora,
        train_loader,
        val_loader,
        args,
    };
    let backend = run.args.backend;
    match backend {
        BackendKind::NdArray => train_on::<Autodiff<TrainBackend>>(run, &Runtime::default()),
        #[cfg(feature = "backend-wgpu")]
        BackendKind::Wgpu => {
            train_on::<Autodiff<crate::WgpuBackend>>(run, &Runtime::default())
        }
        #[cfg(not(feature = "backend-wgpu"))]
        BackendKind::Wgpu => bail!("wgpu backend not built"),
    }
}

fn train_on<B: AutodiffBackend>(run: PreparedRun, runtime: &Runtime<B>) -> anyhow::Result<RunSummary> {
    let kind = run.args.model;
    match kind {
        ModelKind::Baseline => train_model::<B, BaselineClassifier<B>>(run, runtime),
        ModelKind::Resnet => train_model::<B, ResidualClassifier<B>>(run, runtime),
    }
}

fn train_model<B, M>(run: PreparedRun, runtime: &Runtime<B>) -> anyhow::Result<RunSummary>
where
    B: AutodiffBackend,
    M: SpeakerModel<B> + AutodiffModule<B>,
    M::InnerModule: SpeakerModel<B::InnerBackend>,
{
    let PreparedRun {
        args,
        param_str,
        paths,
        corpora,
        train_loader,
        val_loader,
        prepare,
        classifier,
    } = run;
    classifier.validate()?;
    let device = &runtime.device;
    let model = M::init(&classifier, device);
    tracing::info!(
        model = args.model.as_str(),
        params = model.num_params(),
        classes = classifier.num_classes,
        "model ready"
    );

    let fit_cfg = FitConfig::from_args(&args);
    let mut optim = fit_cfg.sgd().init::<B, M>();

    let checkpoint = paths.checkpoint_path(&param_str);
    let log = paths.log_path(&param_str);
    let meta = CheckpointMeta {
        param_str: param_str.clone(),
        classifier: classifier.clone(),
        args: args.clone(),
    };
    let mut callbacks: Vec<Box<dyn Callback<B, M>>> = vec![
        Box::new(Evaluate::new(val_loader, prepare)),
        Box::new(
            VerificationMetrics::new(
                corpora.sitw.clone(),
                args.verification_pairs,
                "sitw_dev_",
                prepare,
                args.batch_size,
            )
            .with_seed(args.seed),
        ),
        Box::new(
            VerificationMetrics::new(
                corpora.librispeech_unseen.clone(),
                args.verification_pairs,
                "librispeech_dev_clean_",
                prepare,
                args.batch_size,
            )
            .with_seed(args.seed.map(|s| s.wrapping_add(2))),
        ),
        Box::new(
            ReduceLROnPlateau::new("val_loss")
                .with_patience(5)
                .with_min_delta(0.1)
                .with_factor(0.1),
        ),
        Box::new(ModelCheckpoint::new(&checkpoint, "val_loss").with_meta(meta)),
        Box::new(CsvLogger::new(&log)),
    ];

    let outcome = fit(
        model,
        &mut optim,
        &fit_cfg,
        &train_loader,
        prepare,
        &mut callbacks,
        device,
    )?;
    tracing::info!(
        checkpoint = %checkpoint.display(),
        log = %log.display(),
        final_lr = outcome.learning_rate,
        "training finished"
    );
    Ok(RunSummary {
        param_str,
        num_classes: classifier.num_classes,
        checkpoint,
        log,
        history: outcome.history,
    })
}
