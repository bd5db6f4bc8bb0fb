//! Epoch loop: gradient steps over the training loader, then callbacks.

use std::collections::BTreeMap;

use anyhow::{bail, Context};
use burn::module::AutodiffModule;
use burn::nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig};
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{GradientsParams, Optimizer, SgdConfig};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Int, Tensor};
use models::SpeakerModel;
use voice_dataset::{DataLoader, DatasetSource, HostBatch, SpeakerBatch};

use crate::callbacks::{Callback, TrainingContext};
use crate::config::TrainArgs;

/// Metric name to value for one epoch, kept sorted by name.
pub type EpochLogs = BTreeMap<String, f64>;

/// How host batches become backend tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPreparation {
    /// Cast features to the backend float type.
    Cast,
    /// Standardise every instance along time, then cast.
    Whiten,
}

impl BatchPreparation {
    pub fn for_source(source: &DatasetSource) -> Self {
        if source.is_raw_waveform() {
            BatchPreparation::Whiten
        } else {
            BatchPreparation::Cast
        }
    }

    pub fn prepare<B: Backend>(self, mut batch: HostBatch, device: &B::Device) -> SpeakerBatch<B> {
        if self == BatchPreparation::Whiten {
            batch.whiten();
        }
        batch.to_burn::<B>(device)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl FitConfig {
    pub fn from_args(args: &TrainArgs) -> Self {
        Self {
            epochs: args.epochs,
            learning_rate: args.lr,
            momentum: args.momentum,
            weight_decay: args.weight_decay,
        }
    }

    /// Classical momentum without dampening; `None` when momentum is zero.
    pub fn momentum_config(&self) -> Option<MomentumConfig> {
        (self.momentum > 0.0).then(|| {
            MomentumConfig::new()
                .with_momentum(self.momentum)
                .with_dampening(0.0)
        })
    }

    /// L2 penalty added to the gradients; `None` when zero.
    pub fn weight_decay_config(&self) -> Option<WeightDecayConfig> {
        (self.weight_decay > 0.0).then(|| WeightDecayConfig::new(self.weight_decay as f32))
    }

    pub fn sgd(&self) -> SgdConfig {
        SgdConfig::new()
            .with_momentum(self.momentum_config())
            .with_weight_decay(self.weight_decay_config())
    }
}

/// Mean metrics of one gradient step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub size: usize,
}

/// Fraction of rows whose arg-max matches the target.
pub fn accuracy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> f64 {
    let [rows, _] = logits.dims();
    if rows == 0 {
        return 0.0;
    }
    let predicted = logits.argmax(1).squeeze::<1>(1);
    let correct = predicted
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>();
    correct as f64 / rows as f64
}

/// Forward with targets, cross entropy, backward, one optimiser step.
pub fn gradient_step<B, M, O>(
    model: M,
    optim: &mut O,
    loss_fn: &CrossEntropyLoss<B>,
    batch: SpeakerBatch<B>,
    learning_rate: f64,
) -> (M, StepMetrics)
where
    B: AutodiffBackend,
    M: SpeakerModel<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let size = batch.targets.dims()[0];
    let logits = model.forward_with_targets(batch.inputs, batch.targets.clone());
    let loss = loss_fn.forward(logits.clone(), batch.targets.clone());
    let metrics = StepMetrics {
        loss: loss.clone().into_scalar().elem::<f64>(),
        accuracy: accuracy(logits, batch.targets),
        size,
    };
    let grads = GradientsParams::from_grads(loss.backward(), &model);
    (optim.step(learning_rate, model, grads), metrics)
}

pub struct FitOutcome<M> {
    pub model: M,
    pub history: Vec<EpochLogs>,
    /// Learning rate after the last epoch's callbacks.
    pub learning_rate: f64,
}

/// Run `cfg.epochs` epochs (1-indexed) over `loader`.
///
/// Epoch logs carry the sample-weighted mean `loss` and `accuracy` plus the
/// `lr` used for the epoch; callbacks run in order after each epoch and may
/// add keys or change the learning rate.
pub fn fit<B, M, O>(
    model: M,
    optim: &mut O,
    cfg: &FitConfig,
    loader: &DataLoader,
    prepare: BatchPreparation,
    callbacks: &mut [Box<dyn Callback<B, M>>],
    device: &B::Device,
) -> anyhow::Result<FitOutcome<M>>
where
    B: AutodiffBackend,
    M: SpeakerModel<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let loss_fn = CrossEntropyLossConfig::new().init::<B>(device);
    let mut model = model;
    let mut learning_rate = cfg.learning_rate;
    let mut history = Vec::with_capacity(cfg.epochs);

    for callback in callbacks.iter_mut() {
        callback.on_train_begin()?;
    }

    for epoch in 1..=cfg.epochs {
        for callback in callbacks.iter_mut() {
            callback.on_epoch_begin(epoch)?;
        }

        let mut loss_sum = 0.0;
        let mut correct_sum = 0.0;
        let mut seen = 0usize;
        for batch in loader.iter() {
            let batch = batch.with_context(|| format!("loading training batch in epoch {epoch}"))?;
            let batch = prepare.prepare::<B>(batch, device);
            let (next, step) = gradient_step(model, optim, &loss_fn, batch, learning_rate);
            model = next;
            loss_sum += step.loss * step.size as f64;
            correct_sum += step.accuracy * step.size as f64;
            seen += step.size;
        }
        if seen == 0 {
            bail!(
                "training loader produced no full batch (batch size {}, {} samples)",
                loader.config().batch_size,
                loader.dataset().len()
            );
        }

        let mut logs = EpochLogs::new();
        logs.insert("loss".into(), loss_sum / seen as f64);
        logs.insert("accuracy".into(), correct_sum / seen as f64);
        logs.insert("lr".into(), learning_rate);

        let mut ctx = TrainingContext::<B, M> {
            model: &model,
            device,
            learning_rate,
        };
        for callback in callbacks.iter_mut() {
            callback.on_epoch_end(epoch, &mut logs, &mut ctx)?;
        }
        learning_rate = ctx.learning_rate;

        tracing::info!(epoch, epochs = cfg.epochs, metrics = %format_logs(&logs), "epoch finished");
        history.push(logs);
    }

    for callback in callbacks.iter_mut() {
        callback.on_train_end(&history)?;
    }

    Ok(FitOutcome {
        model,
        history,
        learning_rate,
    })
}

pub(crate) fn format_logs(logs: &EpochLogs) -> String {
    logs.iter()
        .map(|(k, v)| format!("{k}={v:.4}"))
        .collect::<Vec<_>>()
        .join(" ")
}
