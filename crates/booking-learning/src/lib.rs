//! booking-learning: tree ensembles, oversampling and hyperparameter search
//! for tabular binary classification.
//!
//! This crate provides the numeric side of the booking cancellation pipeline.
//! Everything works on dense `ndarray` matrices (`Array2<f64>` features,
//! `Array1<i64>` labels) and is reproducible from a `u64` seed.
//!
//! # Features
//!
//! - **Random forest** ([`RandomForestClassifier`]): bagged Gini trees with
//!   mean-decrease-in-impurity feature importances
//! - **Gradient boosting** ([`GradientBoostedClassifier`]): histogram-based,
//!   leaf-wise trees with `gbdt`, `goss` and `dart` boosting
//! - **Oversampling** ([`Smote`]): synthetic minority rows by neighbour
//!   interpolation
//! - **Hyperparameter search** ([`RandomizedSearch`]): sampled candidates
//!   scored with stratified k-fold cross-validation on a rayon pool
//! - **Metrics** ([`ClassificationMetrics`]): accuracy, precision, recall, F1
//! - **Persistence** ([`TrainedModel`]): save/load with bit-identical
//!   predictions
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use booking_learning::{
//!     ParamDistribution, ParamSpace, RandomizedSearch, SearchConfig, Smote, TrainedModel,
//! };
//!
//! let (x_bal, y_bal) = Smote::new().fit_resample(&x, &y)?;
//!
//! let space = ParamSpace::new()
//!     .with("n_estimators", ParamDistribution::Randint(100, 500))
//!     .with("learning_rate", ParamDistribution::Uniform(0.01, 0.2));
//! let outcome = RandomizedSearch::new(space, SearchConfig::default()).fit(&x_bal, &y_bal)?;
//!
//! let model = TrainedModel::new(outcome.best_estimator, feature_names, "booking_status")?;
//! model.save("artifacts/model/lgbm_model.pkl")?;
//! ```
//!
//! # Thread Safety
//!
//! All fitted models are `Send + Sync`. Fitting uses rayon internally: the
//! forest builds trees in parallel, SMOTE searches neighbours in parallel,
//! and the search runs candidates × folds on its own pool sized by
//! [`SearchConfig::n_jobs`].

mod boosting;
mod classes;
mod error;
mod forest;
mod metrics;
mod model;
mod search;
mod smote;

pub use boosting::{
    BoostingType, GbdtParams, GbdtParamsBuilder, GradientBoostedClassifier, ParamValue,
};
pub use classes::class_counts;
pub use error::{LearningError, Result};
pub use forest::{MaxFeatures, RandomForestClassifier};
pub use metrics::{ClassificationMetrics, Scoring};
pub use model::TrainedModel;
pub use search::{
    CandidateResult, Fold, ParamDistribution, ParamSpace, RandomizedSearch, SearchConfig,
    SearchOutcome, StratifiedKFold,
};
pub use smote::Smote;
