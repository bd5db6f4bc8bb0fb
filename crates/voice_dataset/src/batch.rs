//! Subsets and the prefetching batch loader used for training and validation.

use crate::aug::whiten_rows;
use crate::splits::seeded_rng;
use crate::types::{DatasetResult, SpeakerDataset, SpeakerSample, VoiceDatasetError};
use crossbeam_channel::{bounded, Receiver};
use rand::seq::SliceRandom;
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub(crate) const DEFAULT_LOG_EVERY_SAMPLES: usize = 5000;

/// View of `dataset` restricted to `indices`.
pub struct Subset {
    dataset: Arc<dyn SpeakerDataset>,
    indices: Vec<usize>,
}

impl Subset {
    pub fn new(dataset: Arc<dyn SpeakerDataset>, indices: Vec<usize>) -> Self {
        Self { dataset, indices }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl SpeakerDataset for Subset {
    fn len(&self) -> usize {
        self.indices.len()
    }

    /// Class count of the parent dataset; labels keep their parent ids.
    fn num_classes(&self) -> usize {
        self.dataset.num_classes()
    }

    fn label(&self, index: usize) -> usize {
        self.dataset.label(self.indices[index])
    }

    fn get(&self, index: usize) -> DatasetResult<SpeakerSample> {
        self.dataset.get(self.indices[index])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    /// Threads used to load the samples of one batch.
    pub num_workers: usize,
    /// Finished batches buffered ahead of the consumer.
    pub prefetch: usize,
    pub seed: Option<u64>,
}

impl LoaderConfig {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: true,
            drop_last: true,
            num_workers: thread::available_parallelism().map_or(1, |n| n.get()),
            prefetch: 2,
            seed: None,
        }
    }
}

/// Host-side batch: row-major `[B, rows, T]` features and class labels.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBatch {
    pub inputs: Vec<f32>,
    pub shape: [usize; 3],
    pub labels: Vec<usize>,
}

impl HostBatch {
    pub fn collate(samples: Vec<SpeakerSample>) -> DatasetResult<Self> {
        let Some(first) = samples.first() else {
            return Err(VoiceDatasetError::Other("cannot collate an empty batch".into()));
        };
        let [rows, timesteps] = first.shape();
        let mut inputs = Vec::with_capacity(samples.len() * rows * timesteps);
        let mut labels = Vec::with_capacity(samples.len());
        for sample in &samples {
            if sample.shape() != [rows, timesteps] {
                return Err(VoiceDatasetError::Shape(format!(
                    "batch mixes sample shapes {:?} and {:?}",
                    [rows, timesteps],
                    sample.shape()
                )));
            }
            inputs.extend_from_slice(&sample.features);
            labels.push(sample.label);
        }
        Ok(Self {
            inputs,
            shape: [samples.len(), rows, timesteps],
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.shape[0] == 0
    }

    /// Standardise every row of every instance along time.
    pub fn whiten(&mut self) {
        whiten_rows(&mut self.inputs, self.shape[2]);
    }

    #[cfg(feature = "burn-runtime")]
    pub fn to_burn<B: burn::tensor::backend::Backend>(&self, device: &B::Device) -> SpeakerBatch<B> {
        let inputs = burn::tensor::Tensor::<B, 1>::from_floats(self.inputs.as_slice(), device)
            .reshape(self.shape);
        let labels: Vec<i64> = self.labels.iter().map(|l| *l as i64).collect();
        let targets =
            burn::tensor::Tensor::<B, 1, burn::tensor::Int>::from_ints(labels.as_slice(), device);
        SpeakerBatch { inputs, targets }
    }
}

#[cfg(feature = "burn-runtime")]
pub struct SpeakerBatch<B: burn::tensor::backend::Backend> {
    /// `[B, rows, T]`
    pub inputs: burn::tensor::Tensor<B, 3>,
    /// `[B]` class ids.
    pub targets: burn::tensor::Tensor<B, 1, burn::tensor::Int>,
}

/// Batches a dataset, reshuffling on every pass.
///
/// Each call to [`DataLoader::iter`] spawns a producer thread that loads the
/// samples of each batch on a worker pool and hands finished batches through a
/// bounded channel.
pub struct DataLoader {
    dataset: Arc<dyn SpeakerDataset>,
    cfg: LoaderConfig,
    pool: Arc<rayon::ThreadPool>,
    passes: AtomicU64,
    log_every_samples: Option<usize>,
}

impl DataLoader {
    pub fn new(dataset: Arc<dyn SpeakerDataset>, cfg: LoaderConfig) -> DatasetResult<Self> {
        if cfg.batch_size == 0 {
            return Err(VoiceDatasetError::Other("batch size must be positive".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.num_workers.max(1))
            .thread_name(|i| format!("voice-loader-{i}"))
            .build()
            .map_err(|e| VoiceDatasetError::Other(format!("failed to start loader pool: {e}")))?;
        let log_every_samples = match std::env::var("VOICE_DATASET_LOG_EVERY") {
            Ok(val) => {
                if val.eq_ignore_ascii_case("off") || val.trim() == "0" {
                    None
                } else {
                    val.trim().parse::<usize>().ok().filter(|v| *v > 0)
                }
            }
            Err(_) => Some(DEFAULT_LOG_EVERY_SAMPLES),
        };
        Ok(Self {
            dataset,
            cfg,
            pool: Arc::new(pool),
            passes: AtomicU64::new(0),
            log_every_samples,
        })
    }

    pub fn dataset(&self) -> &Arc<dyn SpeakerDataset> {
        &self.dataset
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.cfg
    }

    /// Batches yielded by one pass.
    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.cfg.drop_last {
            n / self.cfg.batch_size
        } else {
            n.div_ceil(self.cfg.batch_size)
        }
    }

    /// Start a pass over the dataset.
    pub fn iter(&self) -> BatchStream {
        let pass = self.passes.fetch_add(1, Ordering::Relaxed);
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.cfg.shuffle {
            let mut rng = seeded_rng(self.cfg.seed.map(|s| s.wrapping_add(pass)));
            order.shuffle(&mut rng);
        }
        let batch_size = self.cfg.batch_size;
        let chunks: Vec<Vec<usize>> = order
            .chunks(batch_size)
            .filter(|c| !self.cfg.drop_last || c.len() == batch_size)
            .map(|c| c.to_vec())
            .collect();
        let expected = chunks.len();

        let (tx, rx) = bounded(self.cfg.prefetch.max(1));
        let dataset = self.dataset.clone();
        let pool = self.pool.clone();
        thread::spawn(move || {
            for chunk in chunks {
                let t_load = Instant::now();
                let loaded = pool.install(|| {
                    chunk
                        .par_iter()
                        .map(|i| dataset.get(*i))
                        .collect::<DatasetResult<Vec<_>>>()
                });
                let result = loaded.and_then(HostBatch::collate);
                let failed = result.is_err();
                if tx.send(result.map(|b| (b, t_load.elapsed()))).is_err() || failed {
                    break;
                }
            }
        });

        let now = Instant::now();
        BatchStream {
            rx,
            expected,
            received: 0,
            processed_samples: 0,
            total_load_time: Duration::ZERO,
            started: now,
            last_log: now,
            last_logged_samples: 0,
            log_every_samples: self.log_every_samples,
        }
    }
}

/// One pass of a [`DataLoader`]; dropping it stops the producer.
pub struct BatchStream {
    rx: Receiver<DatasetResult<(HostBatch, Duration)>>,
    expected: usize,
    received: usize,
    processed_samples: usize,
    total_load_time: Duration,
    started: Instant,
    last_log: Instant,
    last_logged_samples: usize,
    log_every_samples: Option<usize>,
}

impl BatchStream {
    /// Batches still to come in this pass.
    pub fn remaining(&self) -> usize {
        self.expected - self.received
    }

    fn maybe_log_progress(&mut self) {
        let Some(threshold) = self.log_every_samples else {
            return;
        };
        let processed_since = self
            .processed_samples
            .saturating_sub(self.last_logged_samples);
        if processed_since < threshold && self.last_log.elapsed() < Duration::from_secs(30) {
            return;
        }
        let secs = self.started.elapsed().as_secs_f32().max(0.001);
        tracing::info!(
            batches = self.received,
            samples = self.processed_samples,
            elapsed_s = format_args!("{secs:.1}"),
            rate = format_args!("{:.1}", self.processed_samples as f32 / secs),
            avg_load_ms = format_args!(
                "{:.2}",
                self.total_load_time.as_secs_f64() * 1000.0 / self.received.max(1) as f64
            ),
            "[dataset] progress"
        );
        self.last_logged_samples = self.processed_samples;
        self.last_log = Instant::now();
    }
}

impl Iterator for BatchStream {
    type Item = DatasetResult<HostBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.received >= self.expected {
            return None;
        }
        match self.rx.recv() {
            Ok(Ok((batch, load_elapsed))) => {
                self.received += 1;
                self.processed_samples += batch.len();
                self.total_load_time += load_elapsed;
                self.maybe_log_progress();
                Some(Ok(batch))
            }
            Ok(Err(e)) => {
                self.expected = self.received;
                Some(Err(e))
            }
            Err(_) => {
                self.expected = self.received;
                Some(Err(VoiceDatasetError::Other(
                    "loader thread stopped before the pass finished".into(),
                )))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}
