//! Train/validation partitions of sample indices.

use crate::types::{DatasetResult, SpeakerDataset, VoiceDatasetError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;

/// Fraction of the training corpus held out for validation.
pub const VALIDATION_FRACTION: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
}

/// Number of validation samples for a dataset of `n`: `ceil(fraction * n)`.
pub fn validation_count(n: usize, fraction: f64) -> usize {
    ((fraction.clamp(0.0, 1.0) * n as f64).ceil() as usize).min(n)
}

pub(crate) fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

/// Random split of `0..n` with `ceil(fraction * n)` validation indices.
pub fn split_indices(n: usize, fraction: f64, seed: Option<u64>) -> DatasetResult<SplitIndices> {
    let n_val = validation_count(n, fraction);
    if n_val >= n {
        return Err(VoiceDatasetError::Other(format!(
            "cannot split {n} samples: no training samples would remain"
        )));
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut seeded_rng(seed));
    let train = order.split_off(n_val);
    Ok(SplitIndices { train, val: order })
}

/// Split that holds out `ceil(fraction * count)` samples of every class.
///
/// Classes with a single sample stay entirely in the training partition.
pub fn split_indices_stratified(
    dataset: &dyn SpeakerDataset,
    fraction: f64,
    seed: Option<u64>,
) -> DatasetResult<SplitIndices> {
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..dataset.len() {
        by_class.entry(dataset.label(i)).or_default().push(i);
    }
    let mut rng = seeded_rng(seed);
    let mut train = Vec::with_capacity(dataset.len());
    let mut val = Vec::new();
    for (_, mut members) in by_class {
        members.shuffle(&mut rng);
        let n_val = validation_count(members.len(), fraction).min(members.len() - 1);
        let rest = members.split_off(n_val);
        val.extend(members);
        train.extend(rest);
    }
    if train.is_empty() {
        return Err(VoiceDatasetError::Other(
            "stratified split left no training samples".into(),
        ));
    }
    train.shuffle(&mut rng);
    val.shuffle(&mut rng);
    Ok(SplitIndices { train, val })
}
