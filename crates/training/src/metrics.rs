//! Verification scores: ROC AUC and equal error rate.

use std::cmp::Ordering;

/// Area under the ROC curve via the rank-sum statistic; tied scores share
/// their average rank. `None` when either class is absent.
pub fn roc_auc(scores: &[f64], labels: &[bool]) -> Option<f64> {
    debug_assert_eq!(scores.len(), labels.len());
    let positives = labels.iter().filter(|l| **l).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }
    let order = sorted_order(scores);
    let mut rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // ranks are 1-based; the tie group i..=j shares their mean
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if labels[idx] {
                rank_sum += rank;
            }
        }
        i = j + 1;
    }
    let p = positives as f64;
    let n = negatives as f64;
    Some((rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// Rate at which false acceptances equal false rejections, sweeping the
/// threshold over every distinct score. `None` when either class is absent.
pub fn equal_error_rate(scores: &[f64], labels: &[bool]) -> Option<f64> {
    debug_assert_eq!(scores.len(), labels.len());
    let positives = labels.iter().filter(|l| **l).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }
    // Descending sweep: after consuming a tie group, every score at or above
    // the threshold is accepted.
    let mut order = sorted_order(scores);
    order.reverse();
    let (p, n) = (positives as f64, negatives as f64);
    let mut accepted_pos = 0usize;
    let mut accepted_neg = 0usize;
    // threshold above every score: reject everything
    let mut best = (f64::INFINITY, 1.0);
    let mut consider = |fpr: f64, fnr: f64| {
        let gap = (fpr - fnr).abs();
        if gap < best.0 {
            best = (gap, (fpr + fnr) / 2.0);
        }
    };
    consider(0.0, 1.0);
    let mut i = 0;
    while i < order.len() {
        let score = scores[order[i]];
        while i < order.len() && scores[order[i]] == score {
            if labels[order[i]] {
                accepted_pos += 1;
            } else {
                accepted_neg += 1;
            }
            i += 1;
        }
        consider(accepted_neg as f64 / n, 1.0 - accepted_pos as f64 / p);
    }
    Some(best.1)
}

fn sorted_order(scores: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].partial_cmp(&scores[b]).unwrap_or(Ordering::Equal));
    order
}
