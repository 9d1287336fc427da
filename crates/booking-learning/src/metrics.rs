//! Binary classification metrics.
//!
//! Precision, recall and F1 are computed for a single positive label; a
//! zero denominator yields `0.0` rather than an error.

use crate::error::{Result, check_xy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Metric used to rank search candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scoring {
    #[default]
    Accuracy,
    Precision,
    Recall,
    F1,
}

impl Scoring {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scoring::Accuracy => "accuracy",
            Scoring::Precision => "precision",
            Scoring::Recall => "recall",
            Scoring::F1 => "f1",
        }
    }

    pub fn score(&self, metrics: &ClassificationMetrics) -> f64 {
        match self {
            Scoring::Accuracy => metrics.accuracy,
            Scoring::Precision => metrics.precision,
            Scoring::Recall => metrics.recall,
            Scoring::F1 => metrics.f1,
        }
    }
}

impl fmt::Display for Scoring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scoring {
    type Err = crate::LearningError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "accuracy" => Ok(Scoring::Accuracy),
            "precision" => Ok(Scoring::Precision),
            "recall" => Ok(Scoring::Recall),
            "f1" => Ok(Scoring::F1),
            other => Err(crate::LearningError::InvalidConfig(format!(
                "unknown scoring '{}', expected one of: accuracy, precision, recall, f1",
                other
            ))),
        }
    }
}

/// Accuracy, precision, recall and F1 of one prediction set.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl ClassificationMetrics {
    /// # Errors
    ///
    /// Shape errors when the two slices differ in length or are empty.
    pub fn compute(y_true: &[i64], y_pred: &[i64], positive: i64) -> Result<Self> {
        check_xy(y_true.len(), y_pred)?;

        let (mut tp, mut fp, mut fn_, mut correct) = (0usize, 0usize, 0usize, 0usize);
        for (&truth, &pred) in y_true.iter().zip(y_pred) {
            if truth == pred {
                correct += 1;
            }
            match (truth == positive, pred == positive) {
                (true, true) => tp += 1,
                (false, true) => fp += 1,
                (true, false) => fn_ += 1,
                (false, false) => {}
            }
        }

        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let accuracy = ratio(correct, y_true.len());
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };

        Ok(Self {
            accuracy,
            precision,
            recall,
            f1,
        })
    }

    /// Fixed-key map (`accuracy`, `precision`, `recall`, `f1`).
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("accuracy".to_string(), self.accuracy),
            ("precision".to_string(), self.precision),
            ("recall".to_string(), self.recall),
            ("f1".to_string(), self.f1),
        ])
    }
}

impl fmt::Display for ClassificationMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "accuracy={:.4} precision={:.4} recall={:.4} f1={:.4}",
            self.accuracy, self.precision, self.recall, self.f1
        )
    }
}
