//! Histogram gradient-boosted decision trees for binary classification.
//!
//! The booster minimises binary log-loss with second-order leaf values,
//! grows each tree leaf-wise on pre-binned features, and supports the three
//! LightGBM boosting modes:
//!
//! - **gbdt**: every round fits all (optionally bagged) rows.
//! - **goss**: after a warm-up of `1 / learning_rate` rounds, keeps the
//!   `top_rate` rows with the largest `|g * h|`, samples `other_rate` of the
//!   rest and up-weights them by `(n - top) / other`.
//! - **dart**: each round drops a random subset of existing trees, fits the
//!   new tree against the reduced ensemble with shrinkage
//!   `learning_rate / (k + 1)`, then rescales the `k` dropped trees by
//!   `k / (k + 1)`.

mod binning;
mod params;
mod tree;

pub use params::{BoostingType, GbdtParams, GbdtParamsBuilder, ParamValue};

use crate::classes::EncodedLabels;
use crate::error::{LearningError, Result, check_finite, check_xy};
use binning::FeatureBinner;
use ndarray::{Array1, Array2};
use rand::seq::{IteratorRandom, SliceRandom};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tree::{RegressionTree, TreeConfig, TreeLearner};

const MIN_HESSIAN: f64 = 1e-16;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Binary gradient-boosted tree classifier.
///
/// # Example
///
/// ```
/// use booking_learning::{GbdtParams, GradientBoostedClassifier};
/// use ndarray::{Array1, Array2};
///
/// let x = Array2::from_shape_fn((100, 1), |(i, _)| i as f64);
/// let y: Array1<i64> = (0..100).map(|i| i64::from(i >= 50)).collect();
/// let params = GbdtParams::builder().n_estimators(20).min_child_samples(5).build().unwrap();
///
/// let mut model = GradientBoostedClassifier::new(params);
/// model.fit(&x, &y).unwrap();
/// assert_eq!(model.predict(&x).unwrap(), y);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoostedClassifier {
    params: GbdtParams,
    classes: Vec<i64>,
    n_features: usize,
    init_score: f64,
    trees: Vec<RegressionTree>,
    tree_weights: Vec<f64>,
}

impl GradientBoostedClassifier {
    pub fn new(params: GbdtParams) -> Self {
        Self {
            params,
            classes: Vec::new(),
            n_features: 0,
            init_score: 0.0,
            trees: Vec::new(),
            tree_weights: Vec::new(),
        }
    }

    pub fn params(&self) -> &GbdtParams {
        &self.params
    }

    /// Sorted class labels seen during `fit`; the second is the positive class.
    pub fn classes(&self) -> &[i64] {
        &self.classes
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn is_fitted(&self) -> bool {
        self.classes.len() == 2
    }

    pub fn fit(&mut self, x: &Array2<f64>, y: &Array1<i64>) -> Result<()> {
        let params = self.params.clone();
        params.validate()?;
        let labels = y.to_vec();
        check_xy(x.nrows(), &labels)?;
        check_finite(x)?;
        if x.ncols() == 0 {
            return Err(LearningError::InvalidData(
                "feature matrix has no columns".to_string(),
            ));
        }

        let encoded = EncodedLabels::new(&labels);
        if encoded.n_classes() != 2 {
            return Err(LearningError::InvalidData(format!(
                "binary classification needs exactly 2 classes, found {}",
                encoded.n_classes()
            )));
        }

        let n = x.nrows();
        let n_features = x.ncols();
        let target: Vec<f64> = encoded.codes.iter().map(|&c| c as f64).collect();
        let positive_rate = (target.iter().sum::<f64>() / n as f64).clamp(1e-15, 1.0 - 1e-15);
        let init_score = (positive_rate / (1.0 - positive_rate)).ln();

        let binner = FeatureBinner::fit(x, params.max_bin);
        let bins = binner.transform(x);
        let tree_config = TreeConfig {
            num_leaves: params.num_leaves,
            max_depth: usize::try_from(params.max_depth).ok().filter(|&d| d > 0),
            min_child_samples: params.min_child_samples,
            min_child_weight: params.min_child_weight,
            min_split_gain: params.min_split_gain,
            reg_alpha: params.reg_alpha,
            reg_lambda: params.reg_lambda,
        };
        let learner = TreeLearner {
            bins: &bins,
            binner: &binner,
            config: &tree_config,
        };

        let mut rng = ChaCha8Rng::seed_from_u64(params.random_state);
        let mut raw = vec![init_score; n];
        let mut grad = vec![0.0; n];
        let mut hess = vec![0.0; n];
        let mut trees: Vec<RegressionTree> = Vec::with_capacity(params.n_estimators);
        let mut weights: Vec<f64> = Vec::with_capacity(params.n_estimators);
        // Per tree, the leaf each training row lands in; only kept for dart.
        let mut row_leaves: Vec<Vec<u16>> = Vec::new();
        let mut bag: Vec<u32> = (0..n as u32).collect();
        let goss_warmup = (1.0 / params.learning_rate) as usize;

        debug!(
            "Boosting {} rounds ({}) on {} rows x {} features, init score {:.4}",
            params.n_estimators, params.boosting_type, n, n_features, init_score
        );

        for round in 0..params.n_estimators {
            let dropped = if params.boosting_type == BoostingType::Dart {
                select_dropped(&params, trees.len(), &mut rng)
            } else {
                Vec::new()
            };
            for &t in &dropped {
                for (i, score) in raw.iter_mut().enumerate() {
                    *score -= weights[t] * trees[t].leaf_value(row_leaves[t][i] as usize);
                }
            }

            for i in 0..n {
                let p = sigmoid(raw[i]);
                grad[i] = p - target[i];
                hess[i] = (p * (1.0 - p)).max(MIN_HESSIAN);
            }

            let rows = match params.boosting_type {
                BoostingType::Goss if round >= goss_warmup => {
                    goss_sample(&params, &mut grad, &mut hess, &mut rng)
                }
                _ if params.subsample < 1.0 && params.subsample_freq > 0 => {
                    if round % params.subsample_freq == 0 {
                        let k = ((params.subsample * n as f64) as usize).max(1);
                        bag = (0..n as u32).choose_multiple(&mut rng, k);
                        bag.sort_unstable();
                    }
                    bag.clone()
                }
                _ => (0..n as u32).collect(),
            };

            let features: Vec<usize> = if params.colsample_bytree < 1.0 {
                let k = ((params.colsample_bytree * n_features as f64).ceil() as usize)
                    .clamp(1, n_features);
                let mut chosen = (0..n_features).choose_multiple(&mut rng, k);
                chosen.sort_unstable();
                chosen
            } else {
                (0..n_features).collect()
            };

            let k = dropped.len() as f64;
            let shrinkage = params.learning_rate / (1.0 + k);
            let tree = learner.fit(rows, &grad, &hess, &features, shrinkage);

            if !dropped.is_empty() {
                let factor = k / (k + 1.0);
                for &t in &dropped {
                    weights[t] *= factor;
                    for (i, score) in raw.iter_mut().enumerate() {
                        *score += weights[t] * trees[t].leaf_value(row_leaves[t][i] as usize);
                    }
                }
            }

            let leaves: Vec<u16> = (0..n)
                .map(|i| tree.leaf_index_binned(&bins, i) as u16)
                .collect();
            for (score, &leaf) in raw.iter_mut().zip(&leaves) {
                *score += tree.leaf_value(leaf as usize);
            }
            if params.boosting_type == BoostingType::Dart {
                row_leaves.push(leaves);
            }
            trees.push(tree);
            weights.push(1.0);
        }

        self.classes = encoded.classes;
        self.n_features = n_features;
        self.init_score = init_score;
        self.trees = trees;
        self.tree_weights = weights;
        Ok(())
    }

    fn check_input(&self, x: &Array2<f64>) -> Result<()> {
        if !self.is_fitted() {
            return Err(LearningError::NotFitted);
        }
        if x.ncols() != self.n_features {
            return Err(LearningError::ShapeMismatch {
                expected: format!("{} features", self.n_features),
                actual: format!("{} features", x.ncols()),
            });
        }
        Ok(())
    }

    /// Raw log-odds of the positive class.
    pub fn decision_function(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        self.check_input(x)?;
        Ok(x.rows()
            .into_iter()
            .map(|row| {
                self.trees
                    .iter()
                    .zip(&self.tree_weights)
                    .fold(self.init_score, |acc, (tree, w)| {
                        acc + w * tree.predict_row(row)
                    })
            })
            .collect())
    }

    /// Probability of `classes()[1]` per row.
    pub fn predict_proba(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        Ok(self.decision_function(x)?.mapv(sigmoid))
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<i64>> {
        let raw = self.decision_function(x)?;
        let (negative, positive) = (self.classes[0], self.classes[1]);
        Ok(raw.mapv(|score| if score > 0.0 { positive } else { negative }))
    }

    /// Number of splits made on each feature across all trees.
    pub fn feature_importances(&self) -> Result<Array1<f64>> {
        if !self.is_fitted() {
            return Err(LearningError::NotFitted);
        }
        let mut counts = Array1::<f64>::zeros(self.n_features);
        for tree in &self.trees {
            for feature in tree.split_features() {
                counts[feature] += 1.0;
            }
        }
        Ok(counts)
    }
}

fn select_dropped(params: &GbdtParams, n_trees: usize, rng: &mut ChaCha8Rng) -> Vec<usize> {
    if n_trees == 0 || rng.r#gen::<f64>() < params.skip_drop {
        return Vec::new();
    }
    let mut rate = params.drop_rate;
    if params.max_drop > 0 {
        rate = rate.min(params.max_drop as f64 / n_trees as f64);
    }
    (0..n_trees).filter(|_| rng.r#gen::<f64>() < rate).collect()
}

/// Returns the sampled rows (ascending) and reweights the random part in place.
fn goss_sample(
    params: &GbdtParams,
    grad: &mut [f64],
    hess: &mut [f64],
    rng: &mut ChaCha8Rng,
) -> Vec<u32> {
    let n = grad.len();
    let top_k = ((params.top_rate * n as f64) as usize).max(1);
    let other_k = (params.other_rate * n as f64) as usize;
    if top_k + other_k >= n {
        return (0..n as u32).collect();
    }

    let mut order: Vec<u32> = (0..n as u32).collect();
    order.sort_by(|&a, &b| {
        let ma = (grad[a as usize] * hess[a as usize]).abs();
        let mb = (grad[b as usize] * hess[b as usize]).abs();
        mb.total_cmp(&ma)
    });
    let (top, rest) = order.split_at_mut(top_k);
    let mut rows = top.to_vec();

    if other_k > 0 {
        let (sampled, _) = rest.partial_shuffle(rng, other_k);
        let multiplier = (n - top_k) as f64 / other_k as f64;
        for &r in sampled.iter() {
            grad[r as usize] *= multiplier;
            hess[r as usize] *= multiplier;
        }
        rows.extend_from_slice(sampled);
    }
    rows.sort_unstable();
    rows
}

static_assertions::assert_impl_all!(GradientBoostedClassifier: Send, Sync);
