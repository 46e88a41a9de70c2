//! Accuracy and per-class precision/recall/F1 reporting

use crate::error::PipelineError;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Binary label domain; both classes always appear in a report
pub const CLASSES: [usize; 2] = [0, 1];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    #[serde(rename = "f1-score")]
    pub f1_score: f64,
    pub support: usize,
}

/// Per-class rows keyed "0"/"1" plus accuracy, macro and weighted averages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    #[serde(flatten)]
    pub classes: BTreeMap<String, ClassMetrics>,
    pub accuracy: f64,
    #[serde(rename = "macro avg")]
    pub macro_avg: ClassMetrics,
    #[serde(rename = "weighted avg")]
    pub weighted_avg: ClassMetrics,
}

impl ClassificationReport {
    pub fn class(&self, label: usize) -> Option<&ClassMetrics> {
        self.classes.get(&label.to_string())
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Fraction of predictions equal to the true label.
///
/// # Arguments
/// * `y_true` - Ground-truth labels
/// * `y_pred` - Predicted labels, same length as `y_true`
///
/// # Returns
/// A value in [0, 1]. Empty or mismatched inputs are rejected.
pub fn accuracy(y_true: &Array1<usize>, y_pred: &Array1<usize>) -> crate::Result<f64> {
    check_lengths(y_true, y_pred)?;
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    Ok(ratio(correct, y_true.len()))
}

/// Build the report; undefined ratios (zero division) are reported as 0.0.
pub fn classification_report(
    y_true: &Array1<usize>,
    y_pred: &Array1<usize>,
) -> crate::Result<ClassificationReport> {
    let accuracy = accuracy(y_true, y_pred)?;

    let mut classes = BTreeMap::new();
    for label in CLASSES {
        let tp = y_true
            .iter()
            .zip(y_pred)
            .filter(|&(&t, &p)| t == label && p == label)
            .count();
        let predicted = y_pred.iter().filter(|&&p| p == label).count();
        let support = y_true.iter().filter(|&&t| t == label).count();

        let precision = ratio(tp, predicted);
        let recall = ratio(tp, support);
        let f1_score = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        classes.insert(
            label.to_string(),
            ClassMetrics {
                precision,
                recall,
                f1_score,
                support,
            },
        );
    }

    let total: usize = classes.values().map(|m| m.support).sum();
    let n_classes = classes.len() as f64;
    let average = |f: fn(&ClassMetrics) -> f64| -> (f64, f64) {
        let macro_ = classes.values().map(f).sum::<f64>() / n_classes;
        let weighted = if total == 0 {
            0.0
        } else {
            classes
                .values()
                .map(|m| f(m) * m.support as f64)
                .sum::<f64>()
                / total as f64
        };
        (macro_, weighted)
    };
    let (macro_p, weighted_p) = average(|m| m.precision);
    let (macro_r, weighted_r) = average(|m| m.recall);
    let (macro_f, weighted_f) = average(|m| m.f1_score);

    Ok(ClassificationReport {
        accuracy,
        macro_avg: ClassMetrics {
            precision: macro_p,
            recall: macro_r,
            f1_score: macro_f,
            support: total,
        },
        weighted_avg: ClassMetrics {
            precision: weighted_p,
            recall: weighted_r,
            f1_score: weighted_f,
            support: total,
        },
        classes,
    })
}

fn check_lengths(y_true: &Array1<usize>, y_pred: &Array1<usize>) -> crate::Result<()> {
    if y_true.len() != y_pred.len() {
        return Err(PipelineError::config(format!(
            "label vectors differ in length: {} vs {}",
            y_true.len(),
            y_pred.len()
        )));
    }
    if y_true.is_empty() {
        return Err(PipelineError::empty("no labels to score"));
    }
    Ok(())
}
