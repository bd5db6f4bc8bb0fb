#![recursion_limit = "256"]

pub mod callbacks;
pub mod config;
pub mod eval;
pub mod fit;
pub mod metrics;
pub mod paths;
pub mod util;
pub mod verification;

use burn::tensor::backend::Backend;

pub use callbacks::{
    Callback, CheckpointMeta, CsvLogger, Evaluate, ModelCheckpoint, ReduceLROnPlateau,
    TrainingContext,
};
pub use config::{BackendKind, ModelKind, TrainArgs};
pub use eval::{run_eval, EvalArgs, EvalCorpus};
pub use fit::{fit, gradient_step, BatchPreparation, EpochLogs, FitConfig, FitOutcome};
pub use paths::ProjectPaths;
pub use util::{init_tracing, load_classifier, run_train, RunSummary};
pub use verification::{evaluate_verification, sample_pairs, VerificationMetrics, VerificationScores};

/// Default backend for training and eval; runs in double precision.
pub type TrainBackend = burn_ndarray::NdArray<f64>;
#[cfg(feature = "backend-wgpu")]
pub type WgpuBackend = burn_wgpu::Wgpu<f32>;

/// Device a run executes on, chosen once at startup.
#[derive(Debug, Clone)]
pub struct Runtime<B: Backend> {
    pub device: B::Device,
}

impl<B: Backend> Runtime<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Default for Runtime<B> {
    fn default() -> Self {
        Self::new(B::Device::default())
    }
}
