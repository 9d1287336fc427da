//! Random forest classifier.
//!
//! A bagged ensemble of CART trees grown to purity with Gini impurity and a
//! random feature subset per node. The pipeline uses it only for its
//! mean-decrease-in-impurity importances, which decide which columns survive
//! feature selection, so the importance computation follows the usual
//! convention exactly: per-tree importances normalised to sum to one, averaged
//! over the trees that split at least once, then normalised again.

use crate::classes::EncodedLabels;
use crate::error::{LearningError, Result, check_finite, check_xy};
use ndarray::{Array1, Array2};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How many features each split considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MaxFeatures {
    /// `sqrt(n_features)`, the classification default.
    #[default]
    Sqrt,
    Log2,
    All,
    Count(usize),
}

impl MaxFeatures {
    fn resolve(self, n_features: usize) -> usize {
        let n = match self {
            MaxFeatures::Sqrt => (n_features as f64).sqrt() as usize,
            MaxFeatures::Log2 => (n_features as f64).log2() as usize,
            MaxFeatures::All => n_features,
            MaxFeatures::Count(n) => n,
        };
        n.clamp(1, n_features.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        class: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// One fitted CART tree; classes are indices into the forest's class list.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClassificationTree {
    nodes: Vec<Node>,
    /// Unnormalised weighted impurity decrease per feature.
    importances: Vec<f64>,
}

impl ClassificationTree {
    fn predict_row(&self, x: &Array2<f64>, row: usize) -> usize {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { class } => return *class,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if x[[row, *feature]] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    impurity_left: f64,
    impurity_right: f64,
    n_left: usize,
    /// Weighted child impurity, lower is better.
    score: f64,
}

fn gini(counts: &[usize], n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    1.0 - counts
        .iter()
        .map(|&c| {
            let p = c as f64 / n;
            p * p
        })
        .sum::<f64>()
}

struct TreeGrower<'a> {
    x: &'a Array2<f64>,
    y: &'a [usize],
    n_classes: usize,
    max_features: usize,
    max_depth: Option<usize>,
    min_samples_split: usize,
    min_samples_leaf: usize,
    rng: ChaCha8Rng,
    nodes: Vec<Node>,
    importances: Vec<f64>,
}

impl<'a> TreeGrower<'a> {
    fn grow(mut self, rows: Vec<usize>) -> ClassificationTree {
        self.grow_node(rows, 0);
        ClassificationTree {
            nodes: self.nodes,
            importances: self.importances,
        }
    }

    fn grow_node(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let n = rows.len();
        let mut counts = vec![0usize; self.n_classes];
        for &r in &rows {
            counts[self.y[r]] += 1;
        }
        let impurity = gini(&counts, n);
        let majority = counts
            .iter()
            .enumerate()
            .fold((0, 0), |best, (class, &c)| if c > best.1 { (class, c) } else { best })
            .0;

        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf { class: majority });

        let depth_exhausted = self.max_depth.is_some_and(|max| depth >= max);
        if impurity <= f64::EPSILON
            || n < self.min_samples_split
            || n < 2 * self.min_samples_leaf
            || depth_exhausted
        {
            return idx;
        }

        let Some(split) = self.best_split(&rows, &counts) else {
            return idx;
        };

        let n_right = n - split.n_left;
        self.importances[split.feature] += n as f64 * impurity
            - split.n_left as f64 * split.impurity_left
            - n_right as f64 * split.impurity_right;

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&r| self.x[[r, split.feature]] <= split.threshold);

        let left = self.grow_node(left_rows, depth + 1);
        let right = self.grow_node(right_rows, depth + 1);
        self.nodes[idx] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        idx
    }

    /// Draws features in random order until `max_features` non-constant ones
    /// have been scanned, keeping the split with the lowest child impurity.
    fn best_split(&mut self, rows: &[usize], counts: &[usize]) -> Option<SplitCandidate> {
        let n = rows.len();
        let mut features: Vec<usize> = (0..self.x.ncols()).collect();
        features.shuffle(&mut self.rng);

        let mut best: Option<SplitCandidate> = None;
        let mut visited = 0;
        let mut pairs: Vec<(f64, usize)> = Vec::with_capacity(n);
        let mut left = vec![0usize; self.n_classes];
        let mut right = vec![0usize; self.n_classes];

        for feature in features {
            if visited >= self.max_features {
                break;
            }
            pairs.clear();
            pairs.extend(rows.iter().map(|&r| (self.x[[r, feature]], self.y[r])));
            pairs.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));
            if pairs[0].0 == pairs[n - 1].0 {
                continue;
            }
            visited += 1;

            left.iter_mut().for_each(|c| *c = 0);
            for i in 0..n - 1 {
                left[pairs[i].1] += 1;
                if pairs[i].0 == pairs[i + 1].0 {
                    continue;
                }
                let n_left = i + 1;
                let n_right = n - n_left;
                if n_left < self.min_samples_leaf || n_right < self.min_samples_leaf {
                    continue;
                }
                for class in 0..self.n_classes {
                    right[class] = counts[class] - left[class];
                }
                let impurity_left = gini(&left, n_left);
                let impurity_right = gini(&right, n_right);
                let score = (n_left as f64 * impurity_left + n_right as f64 * impurity_right)
                    / n as f64;
                if best.as_ref().is_none_or(|b| score < b.score) {
                    let lo = pairs[i].0;
                    let hi = pairs[i + 1].0;
                    let mut threshold = lo / 2.0 + hi / 2.0;
                    if threshold == hi || !threshold.is_finite() {
                        threshold = lo;
                    }
                    best = Some(SplitCandidate {
                        feature,
                        threshold,
                        impurity_left,
                        impurity_right,
                        n_left,
                        score,
                    });
                }
            }
        }
        best
    }
}

/// Random forest classifier with bootstrap sampling and Gini splits.
///
/// # Example
///
/// ```
/// use booking_learning::RandomForestClassifier;
/// use ndarray::{array, Array1};
///
/// let x = array![[0.0, 1.0], [1.0, 1.0], [2.0, 0.0], [3.0, 0.0]];
/// let y: Array1<i64> = array![0, 0, 1, 1];
/// let mut forest = RandomForestClassifier::new(10).with_random_state(42);
/// forest.fit(&x, &y).unwrap();
/// assert_eq!(forest.feature_importances().unwrap().len(), 2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForestClassifier {
    n_estimators: usize,
    max_depth: Option<usize>,
    min_samples_split: usize,
    min_samples_leaf: usize,
    max_features: MaxFeatures,
    bootstrap: bool,
    random_state: u64,
    trees: Vec<ClassificationTree>,
    classes: Vec<i64>,
    n_features: usize,
}

impl Default for RandomForestClassifier {
    fn default() -> Self {
        Self::new(100)
    }
}

impl RandomForestClassifier {
    pub fn new(n_estimators: usize) -> Self {
        Self {
            n_estimators,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: MaxFeatures::Sqrt,
            bootstrap: true,
            random_state: 42,
            trees: Vec::new(),
            classes: Vec::new(),
            n_features: 0,
        }
    }

    #[must_use]
    pub fn with_max_depth(mut self, depth: Option<usize>) -> Self {
        self.max_depth = depth;
        self
    }

    #[must_use]
    pub fn with_min_samples_leaf(mut self, n: usize) -> Self {
        self.min_samples_leaf = n.max(1);
        self
    }

    #[must_use]
    pub fn with_max_features(mut self, max_features: MaxFeatures) -> Self {
        self.max_features = max_features;
        self
    }

    #[must_use]
    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    #[must_use]
    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = seed;
        self
    }

    pub fn n_estimators(&self) -> usize {
        self.n_estimators
    }

    pub fn classes(&self) -> &[i64] {
        &self.classes
    }

    pub fn fit(&mut self, x: &Array2<f64>, y: &Array1<i64>) -> Result<()> {
        if self.n_estimators == 0 {
            return Err(LearningError::InvalidConfig(
                "n_estimators must be at least 1".to_string(),
            ));
        }
        let labels = y.to_vec();
        check_xy(x.nrows(), &labels)?;
        check_finite(x)?;
        if x.ncols() == 0 {
            return Err(LearningError::InvalidData(
                "feature matrix has no columns".to_string(),
            ));
        }

        let encoded = EncodedLabels::new(&labels);
        let n_rows = x.nrows();
        let n_features = x.ncols();
        let max_features = self.max_features.resolve(n_features);

        let mut master = ChaCha8Rng::seed_from_u64(self.random_state);
        let seeds: Vec<u64> = (0..self.n_estimators).map(|_| master.next_u64()).collect();

        debug!(
            "Fitting random forest: {} trees, {} rows, {} features ({} per split)",
            self.n_estimators, n_rows, n_features, max_features
        );

        let trees: Vec<ClassificationTree> = seeds
            .par_iter()
            .map(|&seed| {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let rows: Vec<usize> = if self.bootstrap {
                    (0..n_rows).map(|_| rng.gen_range(0..n_rows)).collect()
                } else {
                    (0..n_rows).collect()
                };
                TreeGrower {
                    x,
                    y: &encoded.codes,
                    n_classes: encoded.n_classes(),
                    max_features,
                    max_depth: self.max_depth,
                    min_samples_split: self.min_samples_split,
                    min_samples_leaf: self.min_samples_leaf,
                    rng,
                    nodes: Vec::new(),
                    importances: vec![0.0; n_features],
                }
                .grow(rows)
            })
            .collect();

        self.trees = trees;
        self.classes = encoded.classes;
        self.n_features = n_features;
        Ok(())
    }

    /// Majority vote over the trees; ties go to the smaller label.
    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<i64>> {
        if self.trees.is_empty() {
            return Err(LearningError::NotFitted);
        }
        if x.ncols() != self.n_features {
            return Err(LearningError::ShapeMismatch {
                expected: format!("{} features", self.n_features),
                actual: format!("{} features", x.ncols()),
            });
        }
        let predictions: Vec<i64> = (0..x.nrows())
            .into_par_iter()
            .map(|row| {
                let mut votes = vec![0usize; self.classes.len()];
                for tree in &self.trees {
                    votes[tree.predict_row(x, row)] += 1;
                }
                let winner = votes
                    .iter()
                    .enumerate()
                    .fold((0, 0), |best, (class, &v)| if v > best.1 { (class, v) } else { best })
                    .0;
                self.classes[winner]
            })
            .collect();
        Ok(Array1::from(predictions))
    }

    /// Mean decrease in impurity per feature, summing to one.
    ///
    /// All zeros when no tree managed a single split.
    pub fn feature_importances(&self) -> Result<Array1<f64>> {
        if self.trees.is_empty() {
            return Err(LearningError::NotFitted);
        }
        let mut total = Array1::<f64>::zeros(self.n_features);
        let mut contributing = 0usize;
        for tree in self.trees.iter().filter(|t| t.node_count() > 1) {
            let sum: f64 = tree.importances.iter().sum();
            if sum > 0.0 {
                for (acc, value) in total.iter_mut().zip(&tree.importances) {
                    *acc += value / sum;
                }
            }
            contributing += 1;
        }
        if contributing == 0 {
            return Ok(total);
        }
        total /= contributing as f64;
        let sum = total.sum();
        if sum > 0.0 {
            total /= sum;
        }
        Ok(total)
    }
}

static_assertions::assert_impl_all!(RandomForestClassifier: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// Feature 0 decides the label, feature 1 is noise.
    fn informative_dataset() -> (Array2<f64>, Array1<i64>) {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let n = 200;
        let mut x = Array2::<f64>::zeros((n, 2));
        let mut y = Array1::<i64>::zeros(n);
        for i in 0..n {
            let signal = rng.gen_range(0.0..10.0);
            x[[i, 0]] = signal;
            x[[i, 1]] = rng.gen_range(0.0..10.0);
            y[i] = i64::from(signal > 5.0);
        }
        (x, y)
    }

    #[test]
    fn test_gini() {
        assert_eq!(gini(&[5, 0], 5), 0.0);
        assert!((gini(&[5, 5], 10) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_max_features_resolve() {
        assert_eq!(MaxFeatures::Sqrt.resolve(17), 4);
        assert_eq!(MaxFeatures::All.resolve(3), 3);
        assert_eq!(MaxFeatures::Count(10).resolve(3), 3);
        assert_eq!(MaxFeatures::Log2.resolve(1), 1);
    }

    #[test]
    fn test_informative_feature_ranks_first() {
        let (x, y) = informative_dataset();
        let mut forest = RandomForestClassifier::new(25).with_random_state(42);
        forest.fit(&x, &y).unwrap();

        let importances = forest.feature_importances().unwrap();
        assert!(importances[0] > importances[1]);
        assert!((importances.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fit_is_reproducible() {
        let (x, y) = informative_dataset();
        let mut a = RandomForestClassifier::new(10).with_random_state(3);
        let mut b = RandomForestClassifier::new(10).with_random_state(3);
        a.fit(&x, &y).unwrap();
        b.fit(&x, &y).unwrap();
        assert_eq!(
            a.feature_importances().unwrap(),
            b.feature_importances().unwrap()
        );
    }

    #[test]
    fn test_predict_separable() {
        let x = array![[0.0], [1.0], [2.0], [10.0], [11.0], [12.0]];
        let y = array![0, 0, 0, 1, 1, 1];
        let mut forest = RandomForestClassifier::new(15)
            .with_bootstrap(false)
            .with_random_state(1);
        forest.fit(&x, &y).unwrap();
        assert_eq!(forest.predict(&x).unwrap(), y);
        assert_eq!(forest.classes(), &[0, 1]);
    }

    #[test]
    fn test_constant_features_give_zero_importance() {
        let x = array![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0]];
        let y = array![0, 1, 0];
        let mut forest = RandomForestClassifier::new(3);
        forest.fit(&x, &y).unwrap();
        assert_eq!(forest.feature_importances().unwrap(), array![0.0, 0.0]);
    }

    #[test]
    fn test_not_fitted() {
        let forest = RandomForestClassifier::default();
        assert!(matches!(
            forest.feature_importances(),
            Err(LearningError::NotFitted)
        ));
    }

    #[test]
    fn test_rejects_non_finite() {
        let x = array![[f64::NAN], [1.0]];
        let y = array![0, 1];
        let mut forest = RandomForestClassifier::new(2);
        assert!(matches!(
            forest.fit(&x, &y),
            Err(LearningError::InvalidData(_))
        ));
    }
}
