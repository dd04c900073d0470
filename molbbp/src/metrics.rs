//! Evaluation metrics on host-side score/target matrices.
//!
//! Scores and targets are row-major `(num_graphs, num_tasks)`. NaN targets
//! are missing labels and are dropped column by column; column metrics are
//! then averaged over the columns where they are defined.

use serde::Serialize;

use crate::config::TaskType;

const NUM_CALIBRATION_BINS: usize = 10;

#[derive(Clone, Debug, Default, Serialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub auroc: f64,
    pub auprc: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub ece: f64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RegressionMetrics {
    pub mae: f64,
    pub rmse: f64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum Metrics {
    Classification(ClassificationMetrics),
    Regression(RegressionMetrics),
}

impl Metrics {
    /// The number used to pick the best epoch and to report progress
    pub fn headline(&self) -> (&'static str, f64) {
        match self {
            Metrics::Classification(m) => ("auroc", m.auroc),
            Metrics::Regression(m) => ("mae", m.mae),
        }
    }

    /// Expected calibration error, classification only
    pub fn ece(&self) -> Option<f64> {
        match self {
            Metrics::Classification(m) => Some(m.ece),
            Metrics::Regression(_) => None,
        }
    }
}

/// * `scores` - probabilities (classification) or predictions (regression)
/// * `targets` - labels or observed values, NaN if missing
pub fn evaluate(task: TaskType, scores: &[Vec<f32>], targets: &[Vec<f32>]) -> Metrics {
    let columns = observed_columns(scores, targets);
    match task {
        TaskType::Classification => {
            let per_column: Vec<ClassificationMetrics> = columns
                .iter()
                .map(|(s, y)| binary_classification(s, y))
                .collect();
            Metrics::Classification(ClassificationMetrics {
                accuracy: nan_mean(per_column.iter().map(|m| m.accuracy)),
                auroc: nan_mean(per_column.iter().map(|m| m.auroc)),
                auprc: nan_mean(per_column.iter().map(|m| m.auprc)),
                precision: nan_mean(per_column.iter().map(|m| m.precision)),
                recall: nan_mean(per_column.iter().map(|m| m.recall)),
                f1: nan_mean(per_column.iter().map(|m| m.f1)),
                ece: nan_mean(per_column.iter().map(|m| m.ece)),
            })
        }
        TaskType::Regression => {
            let (s, y): (Vec<f64>, Vec<f64>) = columns
                .into_iter()
                .flat_map(|(s, y)| s.into_iter().zip(y))
                .unzip();
            Metrics::Regression(RegressionMetrics {
                mae: mean_absolute_error(&s, &y),
                rmse: root_mean_squared_error(&s, &y),
            })
        }
    }
}

/// Split into per-task columns, dropping rows whose target is NaN
fn observed_columns(scores: &[Vec<f32>], targets: &[Vec<f32>]) -> Vec<(Vec<f64>, Vec<f64>)> {
    let ncol = targets.first().map(|t| t.len()).unwrap_or(0);
    (0..ncol)
        .map(|j| {
            scores
                .iter()
                .zip(targets.iter())
                .filter_map(|(s, t)| match (s.get(j), t.get(j)) {
                    (Some(&s), Some(&t)) if !t.is_nan() => Some((s as f64, t as f64)),
                    _ => None,
                })
                .unzip()
        })
        .collect()
}

fn nan_mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values
        .filter(|v| !v.is_nan())
        .fold((0., 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

/// All binary metrics of one column (threshold 0.5)
pub fn binary_classification(probs: &[f64], labels: &[f64]) -> ClassificationMetrics {
    let (mut tp, mut fp, mut tn, mut fn_) = (0usize, 0usize, 0usize, 0usize);
    for (&p, &y) in probs.iter().zip(labels.iter()) {
        match (p >= 0.5, y >= 0.5) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, false) => tn += 1,
            (false, true) => fn_ += 1,
        }
    }
    let ratio = |a: usize, b: usize| if b == 0 { f64::NAN } else { a as f64 / b as f64 };
    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    let f1 = if (precision + recall) > 0. {
        2. * precision * recall / (precision + recall)
    } else {
        f64::NAN
    };

    ClassificationMetrics {
        accuracy: ratio(tp + tn, tp + tn + fp + fn_),
        auroc: roc_auc(probs, labels),
        auprc: average_precision(probs, labels),
        precision,
        recall,
        f1,
        ece: expected_calibration_error(probs, labels, NUM_CALIBRATION_BINS),
    }
}

/// Area under the ROC curve via the Mann-Whitney statistic (ties get mid-ranks)
///
/// NaN when only one class is present.
pub fn roc_auc(scores: &[f64], labels: &[f64]) -> f64 {
    let n = scores.len().min(labels.len());
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0f64; n];
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && scores[order[j]] == scores[order[i]] {
            j += 1;
        }
        // ranks i+1..=j share their average
        let mid = (i + 1 + j) as f64 / 2.;
        for &k in order[i..j].iter() {
            ranks[k] = mid;
        }
        i = j;
    }

    let num_pos = labels[..n].iter().filter(|&&y| y >= 0.5).count();
    let num_neg = n - num_pos;
    if num_pos == 0 || num_neg == 0 {
        return f64::NAN;
    }
    let rank_sum: f64 = (0..n).filter(|&k| labels[k] >= 0.5).map(|k| ranks[k]).sum();
    let np = num_pos as f64;
    (rank_sum - np * (np + 1.) / 2.) / (np * num_neg as f64)
}

/// Area under the precision-recall curve as average precision:
/// Σ_k (R_k - R_{k-1}) P_k over distinct score thresholds
pub fn average_precision(scores: &[f64], labels: &[f64]) -> f64 {
    let n = scores.len().min(labels.len());
    let num_pos = labels[..n].iter().filter(|&&y| y >= 0.5).count();
    if num_pos == 0 {
        return f64::NAN;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let (mut tp, mut seen) = (0usize, 0usize);
    let mut prev_recall = 0.;
    let mut ap = 0.;
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j < n && scores[order[j]] == scores[order[i]] {
            if labels[order[j]] >= 0.5 {
                tp += 1;
            }
            j += 1;
        }
        seen += j - i;
        let recall = tp as f64 / num_pos as f64;
        let precision = tp as f64 / seen as f64;
        ap += (recall - prev_recall) * precision;
        prev_recall = recall;
        i = j;
    }
    ap
}

/// Σ_b |B_b|/n · |mean(y in B_b) - mean(p in B_b)| over equal-width bins
pub fn expected_calibration_error(probs: &[f64], labels: &[f64], num_bins: usize) -> f64 {
    let n = probs.len().min(labels.len());
    if n == 0 || num_bins == 0 {
        return f64::NAN;
    }
    let mut count = vec![0usize; num_bins];
    let mut conf = vec![0f64; num_bins];
    let mut hits = vec![0f64; num_bins];
    for (&p, &y) in probs.iter().zip(labels.iter()) {
        let b = ((p * num_bins as f64).floor() as usize).min(num_bins - 1);
        count[b] += 1;
        conf[b] += p;
        hits[b] += y;
    }
    (0..num_bins)
        .filter(|&b| count[b] > 0)
        .map(|b| {
            let c = count[b] as f64;
            (c / n as f64) * (hits[b] / c - conf[b] / c).abs()
        })
        .sum()
}

pub fn mean_absolute_error(pred: &[f64], obs: &[f64]) -> f64 {
    if pred.is_empty() {
        return f64::NAN;
    }
    pred.iter().zip(obs).map(|(p, y)| (p - y).abs()).sum::<f64>() / pred.len() as f64
}

pub fn root_mean_squared_error(pred: &[f64], obs: &[f64]) -> f64 {
    if pred.is_empty() {
        return f64::NAN;
    }
    let mse = pred.iter().zip(obs).map(|(p, y)| (p - y).powi(2)).sum::<f64>() / pred.len() as f64;
    mse.sqrt()
}
