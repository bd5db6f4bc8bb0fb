//! Epoch hooks: validation, learning-rate schedule, checkpointing, CSV logging.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::module::{AutodiffModule, Module};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use models::{ClassifierConfig, SpeakerModel};
use serde::{Deserialize, Serialize};
use voice_dataset::DataLoader;

use crate::config::TrainArgs;
use crate::fit::{accuracy, BatchPreparation, EpochLogs};
use crate::paths::sidecar_for;

/// State handed to callbacks at the end of an epoch.
pub struct TrainingContext<'a, B: AutodiffBackend, M> {
    pub model: &'a M,
    pub device: &'a B::Device,
    /// Learning rate for the next epoch; callbacks may lower it.
    pub learning_rate: f64,
}

pub trait Callback<B: AutodiffBackend, M> {
    fn on_train_begin(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_epoch_begin(&mut self, _epoch: usize) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _epoch: usize,
        _logs: &mut EpochLogs,
        _ctx: &mut TrainingContext<'_, B, M>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_train_end(&mut self, _history: &[EpochLogs]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Value of `key`, or a warning and `None` when the epoch did not log it.
pub(crate) fn monitored(logs: &EpochLogs, key: &str, callback: &str) -> Option<f64> {
    let value = logs.get(key).copied();
    if value.is_none() {
        tracing::warn!(callback, monitor = key, "monitored metric missing; skipping this epoch");
    }
    value
}

/// Mean loss and accuracy over a held-out loader, logged as `val_loss` and
/// `val_accuracy`.
pub struct Evaluate {
    loader: DataLoader,
    prepare: BatchPreparation,
}

impl Evaluate {
    pub fn new(loader: DataLoader, prepare: BatchPreparation) -> Self {
        Self { loader, prepare }
    }
}

impl<B, M> Callback<B, M> for Evaluate
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    M::InnerModule: SpeakerModel<B::InnerBackend>,
{
    fn on_epoch_end(
        &mut self,
        epoch: usize,
        logs: &mut EpochLogs,
        ctx: &mut TrainingContext<'_, B, M>,
    ) -> anyhow::Result<()> {
        let model = ctx.model.valid();
        let loss_fn = CrossEntropyLossConfig::new().init::<B::InnerBackend>(ctx.device);
        let mut loss_sum = 0.0;
        let mut correct_sum = 0.0;
        let mut seen = 0usize;
        for batch in self.loader.iter() {
            let batch =
                batch.with_context(|| format!("loading validation batch in epoch {epoch}"))?;
            let batch = self.prepare.prepare::<B::InnerBackend>(batch, ctx.device);
            let size = batch.targets.dims()[0];
            let logits = model.forward(batch.inputs);
            let loss = loss_fn
                .forward(logits.clone(), batch.targets.clone())
                .into_scalar()
                .elem::<f64>();
            loss_sum += loss * size as f64;
            correct_sum += accuracy(logits, batch.targets) * size as f64;
            seen += size;
        }
        if seen == 0 {
            tracing::warn!(epoch, "validation loader produced no full batch; val metrics skipped");
            return Ok(());
        }
        logs.insert("val_loss".into(), loss_sum / seen as f64);
        logs.insert("val_accuracy".into(), correct_sum / seen as f64);
        Ok(())
    }
}

/// Multiplies the learning rate by `factor` once `monitor` has failed to drop
/// by more than `min_delta` for `patience` epochs.
#[derive(Debug, Clone)]
pub struct ReduceLROnPlateau {
    pub monitor: String,
    pub patience: usize,
    pub min_delta: f64,
    pub factor: f64,
    pub min_lr: f64,
    pub cooldown: usize,
    best: f64,
    wait: usize,
    cooldown_left: usize,
}

impl ReduceLROnPlateau {
    pub fn new(monitor: impl Into<String>) -> Self {
        Self {
            monitor: monitor.into(),
            patience: 10,
            min_delta: 1e-4,
            factor: 0.1,
            min_lr: 0.0,
            cooldown: 0,
            best: f64::INFINITY,
            wait: 0,
            cooldown_left: 0,
        }
    }

    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    fn reset(&mut self) {
        self.best = f64::INFINITY;
        self.wait = 0;
        self.cooldown_left = 0;
    }

    /// Feed one epoch's value; returns the learning rate to use next.
    pub fn observe(&mut self, current: f64, learning_rate: f64) -> f64 {
        if self.cooldown_left > 0 {
            self.cooldown_left -= 1;
            self.wait = 0;
        }
        if current < self.best - self.min_delta {
            self.best = current;
            self.wait = 0;
            return learning_rate;
        }
        if self.cooldown_left > 0 {
            return learning_rate;
        }
        self.wait += 1;
        if self.wait < self.patience {
            return learning_rate;
        }
        self.wait = 0;
        self.cooldown_left = self.cooldown;
        let reduced = (learning_rate * self.factor).max(self.min_lr);
        if reduced < learning_rate {
            tracing::info!(monitor = %self.monitor, from = learning_rate, to = reduced, "reducing learning rate");
        }
        reduced
    }
}

impl<B: AutodiffBackend, M> Callback<B, M> for ReduceLROnPlateau {
    fn on_train_begin(&mut self) -> anyhow::Result<()> {
        self.reset();
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _epoch: usize,
        logs: &mut EpochLogs,
        ctx: &mut TrainingContext<'_, B, M>,
    ) -> anyhow::Result<()> {
        if let Some(current) = monitored(logs, &self.monitor, "ReduceLROnPlateau") {
            ctx.learning_rate = self.observe(current, ctx.learning_rate);
        }
        Ok(())
    }
}

/// Sidecar written next to every checkpoint so it can be rebuilt without the
/// original command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub param_str: String,
    pub classifier: ClassifierConfig,
    pub args: TrainArgs,
}

impl CheckpointMeta {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file =
            File::open(path).with_context(|| format!("opening checkpoint sidecar {}", path.display()))?;
        serde_json::from_reader(file)
            .with_context(|| format!("parsing checkpoint sidecar {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let file =
            File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)
            .with_context(|| format!("writing {}", path.display()))
    }
}

/// Writes the model weights (`.bin`) and a [`CheckpointMeta`] sidecar
/// (`.json`) whenever `monitor` reaches a new minimum.
pub struct ModelCheckpoint {
    path: PathBuf,
    monitor: String,
    save_best_only: bool,
    meta: Option<CheckpointMeta>,
    best: f64,
}

impl ModelCheckpoint {
    /// `path` should end in `.bin`; the recorder forces that extension.
    pub fn new(path: impl Into<PathBuf>, monitor: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            monitor: monitor.into(),
            save_best_only: true,
            meta: None,
            best: f64::INFINITY,
        }
    }

    pub fn with_save_best_only(mut self, save_best_only: bool) -> Self {
        self.save_best_only = save_best_only;
        self
    }

    pub fn with_meta(mut self, meta: CheckpointMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    fn save<B: AutodiffBackend, M: AutodiffModule<B>>(&self, model: &M) -> anyhow::Result<()> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        model
            .valid()
            .save_file(&self.path, &recorder)
            .with_context(|| format!("saving checkpoint {}", self.path.display()))?;
        if let Some(meta) = &self.meta {
            meta.save(&sidecar_for(&self.path))?;
        }
        Ok(())
    }
}

impl<B, M> Callback<B, M> for ModelCheckpoint
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    fn on_train_begin(&mut self) -> anyhow::Result<()> {
        self.best = f64::INFINITY;
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        epoch: usize,
        logs: &mut EpochLogs,
        ctx: &mut TrainingContext<'_, B, M>,
    ) -> anyhow::Result<()> {
        if !self.save_best_only {
            return self.save::<B, M>(ctx.model);
        }
        let Some(current) = monitored(logs, &self.monitor, "ModelCheckpoint") else {
            return Ok(());
        };
        if current < self.best {
            tracing::debug!(epoch, monitor = %self.monitor, previous = self.best, current, "saving checkpoint");
            self.best = current;
            self.save::<B, M>(ctx.model)?;
        }
        Ok(())
    }
}

/// One CSV row per epoch: `epoch` then every logged key, sorted. The header
/// is fixed by the first epoch.
pub struct CsvLogger {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    keys: Option<Vec<String>>,
}

impl CsvLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            keys: None,
        }
    }

    fn write_epoch(&mut self, epoch: usize, logs: &EpochLogs) -> anyhow::Result<()> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                self.keys = None;
                csv::Writer::from_path(&self.path)
                    .with_context(|| format!("creating {}", self.path.display()))?
            }
        };
        let writer = self.writer.insert(writer);
        if self.keys.is_none() {
            let keys: Vec<String> = logs.keys().cloned().collect();
            writer.write_record(std::iter::once("epoch").chain(keys.iter().map(String::as_str)))?;
            self.keys = Some(keys);
        }
        let keys = self.keys.as_deref().unwrap_or_default();
        let row: Vec<String> = std::iter::once(epoch.to_string())
            .chain(keys.iter().map(|k| logs.get(k).map(f64::to_string).unwrap_or_default()))
            .collect();
        writer.write_record(&row)?;
        writer.flush()?;
        Ok(())
    }
}

impl<B: AutodiffBackend, M> Callback<B, M> for CsvLogger {
    fn on_train_begin(&mut self) -> anyhow::Result<()> {
        self.writer = None;
        self.keys = None;
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        epoch: usize,
        logs: &mut EpochLogs,
        _ctx: &mut TrainingContext<'_, B, M>,
    ) -> anyhow::Result<()> {
        self.write_epoch(epoch, logs)
    }

    fn on_train_end(&mut self, _history: &[EpochLogs]) -> anyhow::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use models::BaselineClassifier;

    type B = Autodiff<NdArray<f32>>;
    type M = BaselineClassifier<B>;

    fn logs(pairs: &[(&str, f64)]) -> EpochLogs {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn model() -> M {
        let device = Default::default();
        M::init(&ClassifierConfig::baseline(4, 2, 3, 1), &device)
    }

    #[test]
    fn plateau_reduces_after_patience_epochs() {
        let mut plateau = ReduceLROnPlateau::new("val_loss")
            .with_patience(2)
            .with_min_delta(0.1);
        let mut lr = 1.0;
        lr = plateau.observe(2.0, lr);
        assert_eq!(lr, 1.0);
        // 1.95 is not a drop of more than min_delta
        lr = plateau.observe(1.95, lr);
        assert_eq!(lr, 1.0);
        lr = plateau.observe(1.95, lr);
        assert!((lr - 0.1).abs() < 1e-12);
        // wait restarts after a reduction
        lr = plateau.observe(1.99, lr);
        assert!((lr - 0.1).abs() < 1e-12);
        lr = plateau.observe(1.5, lr);
        assert!((lr - 0.1).abs() < 1e-12);
    }

    #[test]
    fn plateau_applies_factor_and_floor() {
        let mut plateau = ReduceLROnPlateau::new("val_loss")
            .with_patience(1)
            .with_factor(0.5);
        plateau.min_lr = 0.3;
        let mut lr = 1.0;
        lr = plateau.observe(1.0, lr);
        assert_eq!(lr, 1.0);
        lr = plateau.observe(1.0, lr);
        assert_eq!(lr, 0.5);
        lr = plateau.observe(1.0, lr);
        assert_eq!(lr, 0.3);
        lr = plateau.observe(1.0, lr);
        assert_eq!(lr, 0.3);
    }

    #[test]
    fn plateau_skips_missing_monitor() {
        let model = model();
        let device = Default::default();
        let mut plateau = ReduceLROnPlateau::new("val_loss").with_patience(1);
        let mut ctx = TrainingContext::<B, M> {
            model: &model,
            device: &device,
            learning_rate: 0.5,
        };
        for epoch in 1..=3 {
            Callback::<B, M>::on_epoch_end(&mut plateau, epoch, &mut logs(&[("loss", 1.0)]), &mut ctx)
                .unwrap();
        }
        assert_eq!(ctx.learning_rate, 0.5);
    }

    #[test]
    fn checkpoint_written_only_on_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classifier_lr=0.01__dim=1.bin");
        let sidecar = dir.path().join("classifier_lr=0.01__dim=1.json");
        let model = model();
        let device = Default::default();
        let meta = CheckpointMeta {
            param_str: "lr=0.01__dim=1".into(),
            classifier: ClassifierConfig::baseline(4, 2, 3, 1),
            args: test_args(),
        };
        let mut checkpoint = ModelCheckpoint::new(&path, "val_loss").with_meta(meta);
        Callback::<B, M>::on_train_begin(&mut checkpoint).unwrap();
        let mut ctx = TrainingContext::<B, M> {
            model: &model,
            device: &device,
            learning_rate: 0.1,
        };

        let mut written = Vec::new();
        for (epoch, val_loss) in [1.0, 0.8, 0.9, 0.5].into_iter().enumerate() {
            Callback::<B, M>::on_epoch_end(
                &mut checkpoint,
                epoch + 1,
                &mut logs(&[("val_loss", val_loss)]),
                &mut ctx,
            )
            .unwrap();
            written.push(path.exists());
            if path.exists() {
                std::fs::remove_file(&path).unwrap();
            }
        }
        assert_eq!(written, vec![true, true, false, true]);
        assert_eq!(checkpoint.best(), 0.5);

        let meta = CheckpointMeta::load(&sidecar).unwrap();
        assert_eq!(meta.classifier.num_classes, 3);
    }

    #[test]
    fn checkpoint_every_epoch_when_not_best_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("every.bin");
        let model = model();
        let device = Default::default();
        let mut checkpoint = ModelCheckpoint::new(&path, "val_loss").with_save_best_only(false);
        assert_eq!(checkpoint.path(), path.as_path());
        Callback::<B, M>::on_train_begin(&mut checkpoint).unwrap();
        let mut ctx = TrainingContext::<B, M> {
            model: &model,
            device: &device,
            learning_rate: 0.1,
        };
        // worse values and a missing monitor still save
        for (epoch, epoch_logs) in [
            logs(&[("val_loss", 0.5)]),
            logs(&[("val_loss", 0.9)]),
            logs(&[("loss", 1.0)]),
        ]
        .into_iter()
        .enumerate()
        {
            let mut epoch_logs = epoch_logs;
            Callback::<B, M>::on_epoch_end(&mut checkpoint, epoch + 1, &mut epoch_logs, &mut ctx)
                .unwrap();
            assert!(path.exists(), "epoch {}", epoch + 1);
            std::fs::remove_file(&path).unwrap();
        }
        assert!(!dir.path().join("every.json").exists());
    }

    #[test]
    fn checkpoint_round_trips_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        let model = model();
        let device = Default::default();
        let mut checkpoint = ModelCheckpoint::new(&path, "val_loss");
        let mut ctx = TrainingContext::<B, M> {
            model: &model,
            device: &device,
            learning_rate: 0.1,
        };
        Callback::<B, M>::on_epoch_end(&mut checkpoint, 1, &mut logs(&[("val_loss", 1.0)]), &mut ctx)
            .unwrap();

        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let cfg = ClassifierConfig::baseline(4, 2, 3, 1);
        let loaded = BaselineClassifier::<NdArray<f32>>::init(&cfg, &device)
            .load_file(&path, &recorder, &device)
            .unwrap();
        let input = burn::tensor::Tensor::<NdArray<f32>, 3>::ones([2, 4, 16], &device);
        let expected = model.valid().forward(input.clone()).into_data();
        let actual = loaded.forward(input).into_data();
        expected.assert_approx_eq::<f32>(&actual, burn::tensor::Tolerance::<f32>::default());
    }

    #[test]
    fn csv_has_one_header_and_a_row_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let model = model();
        let device = Default::default();
        let mut logger = CsvLogger::new(&path);
        Callback::<B, M>::on_train_begin(&mut logger).unwrap();
        let mut ctx = TrainingContext::<B, M> {
            model: &model,
            device: &device,
            learning_rate: 0.1,
        };
        for epoch in 1..=3 {
            let mut epoch_logs = logs(&[
                ("val_loss", 1.0 / epoch as f64),
                ("loss", 2.0),
                ("accuracy", 0.5),
            ]);
            Callback::<B, M>::on_epoch_end(&mut logger, epoch, &mut epoch_logs, &mut ctx).unwrap();
        }
        Callback::<B, M>::on_train_end(&mut logger, &[]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "epoch,accuracy,loss,val_loss");
        assert_eq!(lines[1], "1,0.5,2,1");
        assert!(lines[3].starts_with("3,"));
    }

    fn test_args() -> TrainArgs {
        use clap::Parser;
        TrainArgs::try_parse_from([
            "train", "--model", "baseline", "--dim", "1", "--lr", "0.01", "--weight-decay", "0",
            "--momentum", "0.9", "--epochs", "1", "--filters", "2", "--batch-size", "2",
            "--n-seconds", "0.1", "--downsampling", "1", "--window-length", "0.02",
            "--window-hop", "0.01",
        ])
        .unwrap()
    }
}
