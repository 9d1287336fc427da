//! SMOTE: Synthetic Minority Over-sampling Technique.
//!
//! Every class smaller than the majority class is grown to the majority
//! count. Each synthetic row picks a random minority row and one of its `k`
//! nearest same-class neighbours and interpolates between them:
//! `x_new = x + gap * (neighbour - x)` with `gap ~ U[0, 1)`.
//!
//! Output rows are the input rows in their original order followed by the
//! synthetic rows, grouped by class in ascending label order.

use crate::classes::EncodedLabels;
use crate::error::{LearningError, Result, check_finite, check_xy};
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Oversampler configuration.
#[derive(Debug, Clone)]
pub struct Smote {
    k_neighbors: usize,
    random_state: u64,
}

impl Default for Smote {
    fn default() -> Self {
        Self {
            k_neighbors: 5,
            random_state: 42,
        }
    }
}

fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Indices (into `points`) of the `k` nearest rows to each row, self excluded.
/// Ties are broken by index so results do not depend on thread scheduling.
fn nearest_neighbors(points: &Array2<f64>, k: usize) -> Vec<Vec<usize>> {
    let n = points.nrows();
    (0..n)
        .into_par_iter()
        .map(|i| {
            let row = points.row(i);
            let mut candidates: Vec<(f64, usize)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (squared_distance(row, points.row(j)), j))
                .collect();
            let by_distance =
                |a: &(f64, usize), b: &(f64, usize)| -> Ordering {
                    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
                };
            if k < candidates.len() {
                candidates.select_nth_unstable_by(k, by_distance);
                candidates.truncate(k);
            }
            candidates.sort_unstable_by(by_distance);
            candidates.into_iter().map(|(_, j)| j).collect()
        })
        .collect()
}

impl Smote {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_k_neighbors(mut self, k: usize) -> Self {
        self.k_neighbors = k;
        self
    }

    #[must_use]
    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = seed;
        self
    }

    pub fn k_neighbors(&self) -> usize {
        self.k_neighbors
    }

    /// Returns the balanced feature matrix and labels.
    ///
    /// # Errors
    ///
    /// [`LearningError::InvalidData`] when there are fewer than two classes
    /// or non-finite features; [`LearningError::InvalidConfig`] when
    /// `k_neighbors` is zero.
    pub fn fit_resample(
        &self,
        x: &Array2<f64>,
        y: &Array1<i64>,
    ) -> Result<(Array2<f64>, Array1<i64>)> {
        if self.k_neighbors == 0 {
            return Err(LearningError::InvalidConfig(
                "k_neighbors must be at least 1".to_string(),
            ));
        }
        let labels = y.to_vec();
        check_xy(x.nrows(), &labels)?;
        check_finite(x)?;

        let encoded = EncodedLabels::new(&labels);
        if encoded.n_classes() < 2 {
            return Err(LearningError::InvalidData(format!(
                "oversampling needs at least 2 classes, found {}",
                encoded.n_classes()
            )));
        }
        let counts = encoded.counts();
        let target = counts.iter().copied().max().unwrap_or_default();

        let mut rng = ChaCha8Rng::seed_from_u64(self.random_state);
        let mut synthetic_rows: Vec<Array1<f64>> = Vec::new();
        let mut synthetic_labels: Vec<i64> = Vec::new();

        for (code, &count) in counts.iter().enumerate() {
            let needed = target - count;
            if needed == 0 {
                continue;
            }
            let label = encoded.classes[code];
            let members: Vec<usize> = encoded
                .codes
                .iter()
                .enumerate()
                .filter(|(_, c)| **c == code)
                .map(|(i, _)| i)
                .collect();
            let points = x.select(Axis(0), &members);

            let k = self.k_neighbors.min(members.len() - 1);
            if k < self.k_neighbors {
                warn!(
                    "Class {} has only {} rows; using {} neighbours instead of {}",
                    label,
                    members.len(),
                    k,
                    self.k_neighbors
                );
            }
            debug!("Generating {} synthetic rows for class {}", needed, label);

            if k == 0 {
                for _ in 0..needed {
                    synthetic_rows.push(points.row(0).to_owned());
                    synthetic_labels.push(label);
                }
                continue;
            }

            let neighbors = nearest_neighbors(&points, k);
            for _ in 0..needed {
                let pick = rng.gen_range(0..members.len() * k);
                let (sample, slot) = (pick / k, pick % k);
                let gap: f64 = rng.r#gen();
                let base = points.row(sample);
                let neighbor = points.row(neighbors[sample][slot]);
                let new_row = &base + &((&neighbor - &base) * gap);
                synthetic_rows.push(new_row);
                synthetic_labels.push(label);
            }
        }

        let n_original = x.nrows();
        let mut x_out = Array2::<f64>::zeros((n_original + synthetic_rows.len(), x.ncols()));
        x_out.slice_mut(s![..n_original, ..]).assign(x);
        for (offset, row) in synthetic_rows.iter().enumerate() {
            x_out.row_mut(n_original + offset).assign(row);
        }
        let mut y_out = labels;
        y_out.extend(synthetic_labels);

        Ok((x_out, Array1::from(y_out)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::class_counts;
    use ndarray::array;

    fn imbalanced() -> (Array2<f64>, Array1<i64>) {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let n = 60;
        let x = Array2::from_shape_fn((n, 2), |_| rng.gen_range(0.0..1.0));
        let y: Array1<i64> = (0..n).map(|i| i64::from(i % 3 == 0)).collect();
        (x, y)
    }

    #[test]
    fn test_classes_balanced() {
        let (x, y) = imbalanced();
        let (x_res, y_res) = Smote::new().fit_resample(&x, &y).unwrap();
        let counts = class_counts(y_res.iter());
        assert_eq!(counts.get(&0), Some(&40));
        assert_eq!(counts.get(&1), Some(&40));
        assert_eq!(x_res.nrows(), 80);
    }

    #[test]
    fn test_original_rows_come_first() {
        let (x, y) = imbalanced();
        let (x_res, y_res) = Smote::new().fit_resample(&x, &y).unwrap();
        assert_eq!(x_res.slice(s![..60, ..]), x);
        assert_eq!(y_res.slice(s![..60]), y);
    }

    #[test]
    fn test_synthetic_rows_within_class_bounds() {
        let (x, y) = imbalanced();
        let (x_res, y_res) = Smote::new().fit_resample(&x, &y).unwrap();
        let minority: Vec<usize> = (0..60).filter(|&i| y[i] == 1).collect();
        for col in 0..2 {
            let values: Vec<f64> = minority.iter().map(|&i| x[[i, col]]).collect();
            let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            for row in 60..x_res.nrows() {
                assert_eq!(y_res[row], 1);
                assert!(x_res[[row, col]] >= lo - 1e-12 && x_res[[row, col]] <= hi + 1e-12);
            }
        }
    }

    #[test]
    fn test_reproducible() {
        let (x, y) = imbalanced();
        let a = Smote::new().with_random_state(9).fit_resample(&x, &y).unwrap();
        let b = Smote::new().with_random_state(9).fit_resample(&x, &y).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_minority_row_is_duplicated() {
        let x = array![[0.0], [1.0], [2.0], [9.0]];
        let y = array![0, 0, 0, 1];
        let (x_res, y_res) = Smote::new().fit_resample(&x, &y).unwrap();
        assert_eq!(y_res.len(), 6);
        assert_eq!(x_res[[4, 0]], 9.0);
        assert_eq!(x_res[[5, 0]], 9.0);
    }

    #[test]
    fn test_already_balanced_is_unchanged() {
        let x = array![[0.0], [1.0]];
        let y = array![0, 1];
        let (x_res, y_res) = Smote::new().fit_resample(&x, &y).unwrap();
        assert_eq!(x_res, x);
        assert_eq!(y_res, y);
    }

    #[test]
    fn test_single_class_rejected() {
        let x = array![[0.0], [1.0]];
        let y = array![1, 1];
        assert!(matches!(
            Smote::new().fit_resample(&x, &y),
            Err(LearningError::InvalidData(_))
        ));
    }

    #[test]
    fn test_nearest_neighbors_excludes_self() {
        let points = array![[0.0], [1.0], [3.0], [10.0]];
        let neighbors = nearest_neighbors(&points, 2);
        assert_eq!(neighbors[0], vec![1, 2]);
        assert_eq!(neighbors[3], vec![2, 1]);
    }
}
