//! Label bookkeeping shared by the classifiers and the oversampler.

use std::collections::BTreeMap;

/// Sorted distinct labels plus each row's position in that list.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EncodedLabels {
    pub classes: Vec<i64>,
    pub codes: Vec<usize>,
}

impl EncodedLabels {
    pub fn new<'a>(labels: impl IntoIterator<Item = &'a i64>) -> Self {
        let labels: Vec<i64> = labels.into_iter().copied().collect();
        let mut classes = labels.clone();
        classes.sort_unstable();
        classes.dedup();
        let codes = labels
            .iter()
            .map(|label| classes.binary_search(label).unwrap_or_default())
            .collect();
        Self { classes, codes }
    }

    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }

    /// Row count per class, indexed like `classes`.
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.classes.len()];
        for &code in &self.codes {
            counts[code] += 1;
        }
        counts
    }
}

/// Row count per label, ordered by label.
pub fn class_counts<'a>(labels: impl IntoIterator<Item = &'a i64>) -> BTreeMap<i64, usize> {
    let mut counts = BTreeMap::new();
    for &label in labels {
        *counts.entry(label).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_labels_sorted() {
        let encoded = EncodedLabels::new(&[5, 1, 5, 3]);
        assert_eq!(encoded.classes, vec![1, 3, 5]);
        assert_eq!(encoded.codes, vec![2, 0, 2, 1]);
        assert_eq!(encoded.counts(), vec![1, 1, 2]);
    }

    #[test]
    fn test_class_counts() {
        let counts = class_counts(&[1, 0, 1, 1]);
        assert_eq!(counts.get(&0), Some(&1));
        assert_eq!(counts.get(&1), Some(&3));
    }
}
