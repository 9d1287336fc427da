//! Randomized hyperparameter search with stratified cross-validation.
//!
//! Candidates are drawn up front from a [`ParamSpace`] with a seeded RNG
//! (parameters visited in name order), every (candidate, fold) pair is fitted
//! on a dedicated rayon pool, and the candidate with the best mean fold score
//! is refitted on the full training set. Identical inputs and seed always
//! produce the same winner.

use crate::boosting::{GbdtParams, GradientBoostedClassifier, ParamValue};
use crate::classes::EncodedLabels;
use crate::error::{LearningError, Result, check_xy};
use crate::metrics::{ClassificationMetrics, Scoring};
use ndarray::{Array1, Array2, Axis};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Distribution a single hyperparameter is sampled from.
///
/// Serialized externally tagged, e.g. `{randint: [100, 500]}`,
/// `{uniform: [0.01, 0.2]}`, `{choice: [gbdt, dart, goss]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamDistribution {
    /// Integer drawn uniformly from `[low, high)`.
    Randint(i64, i64),
    /// Float drawn uniformly from `[loc, loc + scale]`.
    Uniform(f64, f64),
    /// One of the listed values, uniformly.
    Choice(Vec<ParamValue>),
}

impl ParamDistribution {
    fn validate(&self, name: &str) -> Result<()> {
        let ok = match self {
            ParamDistribution::Randint(low, high) => low < high,
            ParamDistribution::Uniform(loc, scale) => loc.is_finite() && *scale >= 0.0,
            ParamDistribution::Choice(values) => !values.is_empty(),
        };
        if ok {
            Ok(())
        } else {
            Err(LearningError::InvalidConfig(format!(
                "invalid distribution for '{}': {:?}",
                name, self
            )))
        }
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> ParamValue {
        match self {
            ParamDistribution::Randint(low, high) => ParamValue::Int(rng.gen_range(*low..*high)),
            ParamDistribution::Uniform(loc, scale) => {
                ParamValue::Float(loc + scale * rng.r#gen::<f64>())
            }
            ParamDistribution::Choice(values) => values
                .choose(rng)
                .cloned()
                .unwrap_or(ParamValue::Int(0)),
        }
    }
}

/// Named hyperparameter distributions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSpace(BTreeMap<String, ParamDistribution>);

impl ParamSpace {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, distribution: ParamDistribution) -> Self {
        self.0.insert(name.into(), distribution);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, name: &str) -> Option<&ParamDistribution> {
        self.0.get(name)
    }

    pub fn validate(&self) -> Result<()> {
        self.0
            .iter()
            .try_for_each(|(name, dist)| dist.validate(name))
    }

    /// One candidate: a value for every parameter, drawn in name order.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> BTreeMap<String, ParamValue> {
        self.0
            .iter()
            .map(|(name, dist)| (name.clone(), dist.sample(rng)))
            .collect()
    }
}

/// Search settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Number of sampled candidates (default: 4).
    pub n_iter: usize,
    /// Stratified folds per candidate (default: 2).
    pub cv: usize,
    /// Worker threads; `-1` uses every core, `-2` all but one (default: -1).
    pub n_jobs: i32,
    /// `0` silent, `1` summary, `2` one line per candidate (default: 2).
    pub verbose: u8,
    pub random_state: u64,
    pub scoring: Scoring,
    /// Label treated as positive by precision, recall and F1 (default: 1).
    pub positive_class: i64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            n_iter: 4,
            cv: 2,
            n_jobs: -1,
            verbose: 2,
            random_state: 42,
            scoring: Scoring::Accuracy,
            positive_class: 1,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_iter == 0 {
            return Err(LearningError::InvalidConfig(
                "n_iter must be at least 1".to_string(),
            ));
        }
        if self.cv < 2 {
            return Err(LearningError::InvalidConfig(
                "cv must be at least 2".to_string(),
            ));
        }
        if self.n_jobs == 0 {
            return Err(LearningError::InvalidConfig(
                "n_jobs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn threads(&self) -> usize {
        if self.n_jobs > 0 {
            return self.n_jobs as usize;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as i64;
        (cores + 1 + i64::from(self.n_jobs)).max(1) as usize
    }
}

/// Stratified k-fold splitter without shuffling.
///
/// Rows of each class are dealt to folds in their original order so every
/// fold keeps (up to rounding) the overall class proportions.
#[derive(Debug, Clone, Copy)]
pub struct StratifiedKFold {
    n_splits: usize,
}

/// Train and test row indices of one fold.
pub type Fold = (Vec<usize>, Vec<usize>);

impl StratifiedKFold {
    pub fn new(n_splits: usize) -> Self {
        Self { n_splits }
    }

    pub fn split(&self, y: &[i64]) -> Result<Vec<Fold>> {
        let k = self.n_splits;
        if k < 2 {
            return Err(LearningError::InvalidConfig(
                "n_splits must be at least 2".to_string(),
            ));
        }
        if y.len() < k {
            return Err(LearningError::InvalidData(format!(
                "cannot split {} rows into {} folds",
                y.len(),
                k
            )));
        }
        let encoded = EncodedLabels::new(y);
        let counts = encoded.counts();
        let smallest = counts.iter().copied().min().unwrap_or_default();
        if smallest < k {
            warn!(
                "The least populated class has only {} members, fewer than {} folds",
                smallest, k
            );
        }

        let mut sorted = encoded.codes.clone();
        sorted.sort_unstable();
        let mut allocation = vec![vec![0usize; encoded.n_classes()]; k];
        for (pos, &class) in sorted.iter().enumerate() {
            allocation[pos % k][class] += 1;
        }

        let mut fold_of = vec![0usize; y.len()];
        for class in 0..encoded.n_classes() {
            let mut slots = (0..k).flat_map(|fold| std::iter::repeat_n(fold, allocation[fold][class]));
            for (row, _) in encoded
                .codes
                .iter()
                .enumerate()
                .filter(|(_, c)| **c == class)
            {
                fold_of[row] = slots.next().unwrap_or(k - 1);
            }
        }

        Ok((0..k)
            .map(|fold| {
                (0..y.len()).partition(|&row| fold_of[row] != fold)
            })
            .collect())
    }
}

/// Cross-validation result of one candidate.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateResult {
    pub params: BTreeMap<String, ParamValue>,
    pub fold_scores: Vec<f64>,
    /// `NaN` when any fold failed to fit.
    pub mean_score: f64,
}

/// Best candidate, refitted on all training rows, plus every candidate's scores.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best_estimator: GradientBoostedClassifier,
    pub best_params: BTreeMap<String, ParamValue>,
    pub best_score: f64,
    pub candidates: Vec<CandidateResult>,
}

/// Randomized search over [`GradientBoostedClassifier`] hyperparameters.
///
/// # Example
///
/// ```
/// use booking_learning::{ParamDistribution, ParamSpace, RandomizedSearch, SearchConfig};
/// use ndarray::{Array1, Array2};
///
/// let x = Array2::from_shape_fn((80, 1), |(i, _)| i as f64);
/// let y: Array1<i64> = (0..80).map(|i| i64::from(i % 2 == 0 && i > 30)).collect();
/// let space = ParamSpace::new()
///     .with("n_estimators", ParamDistribution::Randint(5, 10))
///     .with("min_child_samples", ParamDistribution::Randint(2, 5));
/// let config = SearchConfig { n_iter: 2, n_jobs: 1, ..SearchConfig::default() };
///
/// let outcome = RandomizedSearch::new(space, config).fit(&x, &y).unwrap();
/// assert_eq!(outcome.candidates.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct RandomizedSearch {
    space: ParamSpace,
    base: GbdtParams,
    config: SearchConfig,
}

impl RandomizedSearch {
    pub fn new(space: ParamSpace, config: SearchConfig) -> Self {
        Self {
            space,
            base: GbdtParams::default(),
            config,
        }
    }

    /// Parameters the sampled values are applied on top of.
    #[must_use]
    pub fn with_base_params(mut self, base: GbdtParams) -> Self {
        self.base = base;
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    fn candidate_params(&self, sampled: &BTreeMap<String, ParamValue>) -> Result<GbdtParams> {
        let mut params = self.base.clone();
        for (name, value) in sampled {
            params.set(name, value)?;
        }
        params.validate()?;
        Ok(params)
    }

    fn score_fold(
        &self,
        params: &GbdtParams,
        x: &Array2<f64>,
        y: &Array1<i64>,
        fold: &Fold,
    ) -> Result<f64> {
        let (train, test) = fold;
        let mut model = GradientBoostedClassifier::new(params.clone());
        model.fit(&x.select(Axis(0), train), &y.select(Axis(0), train))?;
        let predicted = model.predict(&x.select(Axis(0), test))?;
        let truth = y.select(Axis(0), test);
        let metrics = ClassificationMetrics::compute(
            &truth.to_vec(),
            &predicted.to_vec(),
            self.config.positive_class,
        )?;
        Ok(self.config.scoring.score(&metrics))
    }

    /// Runs the search and refits the winner on `x`/`y`.
    ///
    /// # Errors
    ///
    /// Invalid settings or distributions, unknown parameter names, and
    /// [`LearningError::TrainingFailed`] when no candidate fits on every fold.
    pub fn fit(&self, x: &Array2<f64>, y: &Array1<i64>) -> Result<SearchOutcome> {
        self.config.validate()?;
        self.space.validate()?;
        let labels = y.to_vec();
        check_xy(x.nrows(), &labels)?;

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.random_state);
        let sampled: Vec<BTreeMap<String, ParamValue>> = (0..self.config.n_iter)
            .map(|_| self.space.sample(&mut rng))
            .collect();
        let params: Vec<GbdtParams> = sampled
            .iter()
            .map(|s| self.candidate_params(s))
            .collect::<Result<_>>()?;
        let folds = StratifiedKFold::new(self.config.cv).split(&labels)?;

        if self.config.verbose >= 1 {
            info!(
                "Fitting {} folds for each of {} candidates, totalling {} fits",
                folds.len(),
                params.len(),
                folds.len() * params.len()
            );
        }

        let tasks: Vec<(usize, usize)> = (0..params.len())
            .flat_map(|c| (0..folds.len()).map(move |f| (c, f)))
            .collect();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.threads())
            .build()
            .map_err(|e| LearningError::TrainingFailed(format!("thread pool: {}", e)))?;
        let scores: Vec<f64> = pool.install(|| {
            tasks
                .par_iter()
                .map(|&(c, f)| match self.score_fold(&params[c], x, y, &folds[f]) {
                    Ok(score) => score,
                    Err(e) => {
                        warn!("Candidate {} failed on fold {}: {}", c, f, e);
                        f64::NAN
                    }
                })
                .collect()
        });

        let candidates: Vec<CandidateResult> = sampled
            .into_iter()
            .enumerate()
            .map(|(c, params)| {
                let fold_scores = scores[c * folds.len()..(c + 1) * folds.len()].to_vec();
                let mean_score = fold_scores.iter().sum::<f64>() / fold_scores.len() as f64;
                CandidateResult {
                    params,
                    fold_scores,
                    mean_score,
                }
            })
            .collect();

        if self.config.verbose >= 2 {
            for (c, candidate) in candidates.iter().enumerate() {
                debug!(
                    "Candidate {}/{}: mean {} = {:.4} {:?}",
                    c + 1,
                    candidates.len(),
                    self.config.scoring,
                    candidate.mean_score,
                    candidate.params
                );
            }
        }

        let best = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.mean_score.is_nan())
            .fold(None, |best: Option<(usize, f64)>, (i, c)| match best {
                Some((_, score)) if score >= c.mean_score => best,
                _ => Some((i, c.mean_score)),
            });
        let Some((best_idx, best_score)) = best else {
            return Err(LearningError::TrainingFailed(
                "every search candidate failed to fit".to_string(),
            ));
        };

        let mut best_estimator = GradientBoostedClassifier::new(params[best_idx].clone());
        best_estimator.fit(x, y)?;

        if self.config.verbose >= 1 {
            info!(
                "Best {} {:.4} with {:?}",
                self.config.scoring, best_score, candidates[best_idx].params
            );
        }

        Ok(SearchOutcome {
            best_estimator,
            best_params: candidates[best_idx].params.clone(),
            best_score,
            candidates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boosting::BoostingType;
    use crate::classes::class_counts;

    fn dataset() -> (Array2<f64>, Array1<i64>) {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let n = 120;
        let x = Array2::from_shape_fn((n, 2), |_| rng.gen_range(0.0..1.0));
        let y = x.rows().into_iter().map(|r| i64::from(r[0] > 0.4)).collect();
        (x, y)
    }

    fn small_space() -> ParamSpace {
        ParamSpace::new()
            .with("n_estimators", ParamDistribution::Randint(5, 15))
            .with("num_leaves", ParamDistribution::Randint(2, 6))
            .with("learning_rate", ParamDistribution::Uniform(0.05, 0.2))
            .with("min_child_samples", ParamDistribution::Randint(3, 6))
            .with(
                "boosting_type",
                ParamDistribution::Choice(vec!["gbdt".into(), "dart".into(), "goss".into()]),
            )
    }

    #[test]
    fn test_randint_upper_bound_exclusive() {
        let dist = ParamDistribution::Randint(3, 5);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for _ in 0..200 {
            match dist.sample(&mut rng) {
                ParamValue::Int(v) => assert!((3..5).contains(&v)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_uniform_uses_loc_scale() {
        let dist = ParamDistribution::Uniform(0.01, 0.2);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for _ in 0..200 {
            match dist.sample(&mut rng) {
                ParamValue::Float(v) => assert!((0.01..=0.21).contains(&v)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_invalid_distribution_rejected() {
        let space = ParamSpace::new().with("n_estimators", ParamDistribution::Randint(5, 5));
        assert!(space.validate().is_err());
        let space = ParamSpace::new().with("boosting_type", ParamDistribution::Choice(vec![]));
        assert!(space.validate().is_err());
    }

    #[test]
    fn test_stratified_folds_cover_rows_once() {
        let y: Vec<i64> = (0..10).map(|i| i64::from(i < 4)).collect();
        let folds = StratifiedKFold::new(2).split(&y).unwrap();
        assert_eq!(folds.len(), 2);

        let mut seen: Vec<usize> = folds.iter().flat_map(|(_, test)| test.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        for (train, test) in &folds {
            assert_eq!(train.len() + test.len(), 10);
            let counts = class_counts(test.iter().map(|&i| &y[i]));
            assert_eq!(counts.get(&1), Some(&2));
            assert_eq!(counts.get(&0), Some(&3));
        }
    }

    #[test]
    fn test_search_picks_params_from_space() {
        let (x, y) = dataset();
        let config = SearchConfig {
            n_iter: 3,
            n_jobs: 2,
            ..SearchConfig::default()
        };
        let outcome = RandomizedSearch::new(small_space(), config).fit(&x, &y).unwrap();

        assert_eq!(outcome.candidates.len(), 3);
        let best = &outcome.candidates
            .iter()
            .find(|c| c.params == outcome.best_params)
            .unwrap();
        assert_eq!(best.mean_score, outcome.best_score);
        assert!(outcome
            .candidates
            .iter()
            .all(|c| c.mean_score.is_nan() || c.mean_score <= outcome.best_score));
        match &outcome.best_params["num_leaves"] {
            ParamValue::Int(v) => assert!((2..6).contains(v)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(outcome.best_estimator.is_fitted());
        assert!((0.0..=1.0).contains(&outcome.best_score));
    }

    #[test]
    fn test_search_reproducible() {
        let (x, y) = dataset();
        let config = SearchConfig {
            n_iter: 2,
            n_jobs: 2,
            ..SearchConfig::default()
        };
        let a = RandomizedSearch::new(small_space(), config.clone()).fit(&x, &y).unwrap();
        let b = RandomizedSearch::new(small_space(), config).fit(&x, &y).unwrap();
        assert_eq!(a.best_params, b.best_params);
        assert_eq!(a.best_score, b.best_score);
        assert_eq!(
            a.best_estimator.decision_function(&x).unwrap(),
            b.best_estimator.decision_function(&x).unwrap()
        );
    }

    #[test]
    fn test_unknown_parameter_fails_fast() {
        let (x, y) = dataset();
        let space = ParamSpace::new().with("n_trees", ParamDistribution::Randint(1, 3));
        let err = RandomizedSearch::new(space, SearchConfig::default())
            .fit(&x, &y)
            .unwrap_err();
        assert!(matches!(err, LearningError::UnknownParameter(_)));
    }

    #[test]
    fn test_base_params_apply() {
        let (x, y) = dataset();
        let base = GbdtParams {
            boosting_type: BoostingType::Goss,
            n_estimators: 8,
            min_child_samples: 4,
            ..GbdtParams::default()
        };
        let config = SearchConfig {
            n_iter: 1,
            n_jobs: 1,
            ..SearchConfig::default()
        };
        let space = ParamSpace::new().with("num_leaves", ParamDistribution::Randint(3, 4));
        let outcome = RandomizedSearch::new(space, config)
            .with_base_params(base)
            .fit(&x, &y)
            .unwrap();
        assert_eq!(outcome.best_estimator.params().boosting_type, BoostingType::Goss);
        assert_eq!(outcome.best_estimator.params().num_leaves, 3);
        assert_eq!(outcome.best_estimator.n_trees(), 8);
    }

    #[test]
    fn test_config_validation() {
        let config = SearchConfig {
            cv: 1,
            ..SearchConfig::default()
        };
        assert!(config.validate().is_err());
        let config = SearchConfig {
            n_jobs: 0,
            ..SearchConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_space_deserializes_from_json() {
        let json = r#"{"n_estimators": {"randint": [100, 500]},
                       "learning_rate": {"uniform": [0.01, 0.2]},
                       "boosting_type": {"choice": ["gbdt", "dart"]}}"#;
        let space: ParamSpace = serde_json::from_str(json).unwrap();
        assert_eq!(space.len(), 3);
        assert_eq!(
            space.get("n_estimators"),
            Some(&ParamDistribution::Randint(100, 500))
        );
    }
}
