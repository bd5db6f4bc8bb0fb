//! Speaker verification on held-out speakers: sample trial pairs, embed each
//! utterance once, score pairs by cosine similarity.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use burn::module::AutodiffModule;
use burn::tensor::backend::{AutodiffBackend, Backend};
use models::SpeakerModel;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use voice_dataset::{HostBatch, SpeakerDataset};

use crate::callbacks::{Callback, TrainingContext};
use crate::config::check_pair_count;
use crate::fit::{BatchPreparation, EpochLogs};
use crate::metrics::{equal_error_rate, roc_auc};

/// Two sample indices and whether they share a speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialPair {
    pub first: usize,
    pub second: usize,
    pub same: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerificationScores {
    pub eer: f64,
    pub auc: f64,
}

/// Draw `num_pairs` trials: half same-speaker pairs (two distinct samples of a
/// speaker with at least two), the rest pairs of samples from two different
/// speakers. Reads labels only.
pub fn sample_pairs<R: Rng + ?Sized>(
    dataset: &dyn SpeakerDataset,
    num_pairs: usize,
    rng: &mut R,
) -> anyhow::Result<Vec<TrialPair>> {
    check_pair_count("pair count", num_pairs)?;
    let mut by_speaker: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for index in 0..dataset.len() {
        by_speaker.entry(dataset.label(index)).or_default().push(index);
    }
    let speakers: Vec<&Vec<usize>> = by_speaker.values().collect();
    let repeated: Vec<&Vec<usize>> = speakers.iter().copied().filter(|s| s.len() >= 2).collect();
    if repeated.is_empty() {
        bail!("no speaker has two samples; cannot form same-speaker pairs");
    }
    if speakers.len() < 2 {
        bail!("need at least two speakers to form different-speaker pairs");
    }

    let n_same = num_pairs / 2;
    let mut pairs = Vec::with_capacity(num_pairs);
    for _ in 0..n_same {
        let samples = repeated[rng.random_range(0..repeated.len())];
        let a = rng.random_range(0..samples.len());
        // shift the second draw past `a` so the two are distinct
        let mut b = rng.random_range(0..samples.len() - 1);
        if b >= a {
            b += 1;
        }
        pairs.push(TrialPair {
            first: samples[a],
            second: samples[b],
            same: true,
        });
    }
    for _ in n_same..num_pairs {
        let s = rng.random_range(0..speakers.len());
        let mut t = rng.random_range(0..speakers.len() - 1);
        if t >= s {
            t += 1;
        }
        let first = speakers[s][rng.random_range(0..speakers[s].len())];
        let second = speakers[t][rng.random_range(0..speakers[t].len())];
        pairs.push(TrialPair {
            first,
            second,
            same: false,
        });
    }
    Ok(pairs)
}

pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    dot / (na * nb).max(1e-12)
}

/// Embed every sample referenced by `pairs` once, in batches of `batch_size`.
pub fn embed_samples<B: Backend, M: SpeakerModel<B>>(
    model: &M,
    dataset: &dyn SpeakerDataset,
    indices: &[usize],
    prepare: BatchPreparation,
    batch_size: usize,
    device: &B::Device,
) -> anyhow::Result<BTreeMap<usize, Vec<f64>>> {
    let mut embeddings = BTreeMap::new();
    for chunk in indices.chunks(batch_size.max(1)) {
        let samples = chunk
            .par_iter()
            .map(|&index| dataset.get(index))
            .collect::<Result<Vec<_>, _>>()
            .context("loading verification samples")?;
        let batch = prepare.prepare::<B>(HostBatch::collate(samples)?, device);
        let embedded = model.embed(batch.inputs);
        let [rows, width] = embedded.dims();
        let values = embedded
            .into_data()
            .convert::<f64>()
            .to_vec::<f64>()
            .map_err(|e| anyhow!("reading embeddings: {e:?}"))?;
        debug_assert_eq!(rows, chunk.len());
        for (index, row) in chunk.iter().zip(values.chunks(width)) {
            embeddings.insert(*index, row.to_vec());
        }
    }
    Ok(embeddings)
}

/// EER and ROC AUC of cosine-similarity scores over `pairs`.
pub fn evaluate_verification<B: Backend, M: SpeakerModel<B>>(
    model: &M,
    dataset: &dyn SpeakerDataset,
    pairs: &[TrialPair],
    prepare: BatchPreparation,
    batch_size: usize,
    device: &B::Device,
) -> anyhow::Result<VerificationScores> {
    let unique: Vec<usize> = pairs
        .iter()
        .flat_map(|p| [p.first, p.second])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let embeddings = embed_samples(model, dataset, &unique, prepare, batch_size, device)?;

    let mut scores = Vec::with_capacity(pairs.len());
    let mut labels = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let (Some(a), Some(b)) = (embeddings.get(&pair.first), embeddings.get(&pair.second)) else {
            bail!("missing embedding for pair {pair:?}");
        };
        scores.push(cosine_similarity(a, b));
        labels.push(pair.same);
    }
    let eer = equal_error_rate(&scores, &labels)
        .context("verification needs both same- and different-speaker pairs")?;
    let auc = roc_auc(&scores, &labels)
        .context("verification needs both same- and different-speaker pairs")?;
    Ok(VerificationScores { eer, auc })
}

/// Logs `<prefix>eer` and `<prefix>auc` on a fixed set of trial pairs drawn
/// when training begins.
pub struct VerificationMetrics {
    dataset: Arc<dyn SpeakerDataset>,
    num_pairs: usize,
    prefix: String,
    prepare: BatchPreparation,
    batch_size: usize,
    seed: Option<u64>,
    pairs: Vec<TrialPair>,
}

impl VerificationMetrics {
    pub fn new(
        dataset: Arc<dyn SpeakerDataset>,
        num_pairs: usize,
        prefix: impl Into<String>,
        prepare: BatchPreparation,
        batch_size: usize,
    ) -> Self {
        Self {
            dataset,
            num_pairs,
            prefix: prefix.into(),
            prepare,
            batch_size,
            seed: None,
            pairs: Vec::new(),
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn pairs(&self) -> &[TrialPair] {
        &self.pairs
    }

    fn ensure_pairs(&mut self) -> anyhow::Result<()> {
        if self.pairs.is_empty() {
            let mut rng = match self.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_rng(&mut rand::rng()),
            };
            self.pairs = sample_pairs(self.dataset.as_ref(), self.num_pairs, &mut rng)
                .with_context(|| format!("sampling {} verification pairs", self.prefix))?;
        }
        Ok(())
    }
}

impl<B, M> Callback<B, M> for VerificationMetrics
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    M::InnerModule: SpeakerModel<B::InnerBackend>,
{
    fn on_train_begin(&mut self) -> anyhow::Result<()> {
        self.pairs.clear();
        self.ensure_pairs()
    }

    fn on_epoch_end(
        &mut self,
        epoch: usize,
        logs: &mut EpochLogs,
        ctx: &mut TrainingContext<'_, B, M>,
    ) -> anyhow::Result<()> {
        self.ensure_pairs()?;
        let model = ctx.model.valid();
        let scores = evaluate_verification::<B::InnerBackend, _>(
            &model,
            self.dataset.as_ref(),
            &self.pairs,
            self.prepare,
            self.batch_size,
            ctx.device,
        )
        .with_context(|| format!("{}verification in epoch {epoch}", self.prefix))?;
        logs.insert(format!("{}eer", self.prefix), scores.eer);
        logs.insert(format!("{}auc", self.prefix), scores.auc);
        Ok(())
    }
}
