//! Feature discretisation for histogram-based tree learning.
//!
//! Each feature is mapped to at most `max_bin` bins. Bin `b` holds every
//! value `v` with `upper_bounds[b - 1] < v <= upper_bounds[b]`, and the last
//! upper bound is always `+inf`, so a split "bin <= b" is exactly the raw
//! comparison "value <= upper_bounds[b]".

use ndarray::Array2;

#[derive(Debug, Clone)]
pub(crate) struct FeatureBinner {
    upper_bounds: Vec<Vec<f64>>,
}

/// Column-major bin indices.
#[derive(Debug, Clone)]
pub(crate) struct BinnedMatrix {
    columns: Vec<Vec<u8>>,
}

impl BinnedMatrix {
    #[inline]
    pub fn bin(&self, feature: usize, row: usize) -> u8 {
        self.columns[feature][row]
    }

    pub fn column(&self, feature: usize) -> &[u8] {
        &self.columns[feature]
    }
}

fn midpoint(lo: f64, hi: f64) -> f64 {
    let mid = lo / 2.0 + hi / 2.0;
    if mid >= hi || !mid.is_finite() { lo } else { mid }
}

fn bounds_for(mut values: Vec<f64>, max_bin: usize) -> Vec<f64> {
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let mut distinct = values.clone();
    distinct.dedup();

    let mut bounds: Vec<f64> = if distinct.len() <= max_bin {
        distinct.windows(2).map(|w| midpoint(w[0], w[1])).collect()
    } else {
        let n = values.len();
        let mut cuts: Vec<f64> = (1..max_bin)
            .map(|i| values[(i * n / max_bin).min(n - 1)])
            .collect();
        cuts.dedup();
        // A cut equal to the maximum would leave the last bin empty.
        if let Some(&max) = distinct.last() {
            cuts.retain(|&c| c < max);
        }
        cuts
    };
    bounds.push(f64::INFINITY);
    bounds
}

impl FeatureBinner {
    /// Learns bin boundaries per column; `max_bin` must be in `2..=255`.
    pub fn fit(x: &Array2<f64>, max_bin: usize) -> Self {
        let upper_bounds = x
            .columns()
            .into_iter()
            .map(|column| bounds_for(column.to_vec(), max_bin))
            .collect();
        Self { upper_bounds }
    }

    pub fn n_bins(&self, feature: usize) -> usize {
        self.upper_bounds[feature].len()
    }

    pub fn n_features(&self) -> usize {
        self.upper_bounds.len()
    }

    /// Raw-value threshold equivalent to "bin <= `bin`".
    pub fn threshold(&self, feature: usize, bin: usize) -> f64 {
        self.upper_bounds[feature][bin]
    }

    pub fn transform(&self, x: &Array2<f64>) -> BinnedMatrix {
        let columns = x
            .columns()
            .into_iter()
            .zip(&self.upper_bounds)
            .map(|(column, bounds)| {
                column
                    .iter()
                    .map(|&v| bounds.partition_point(|&b| b < v) as u8)
                    .collect()
            })
            .collect();
        BinnedMatrix { columns }
    }
}
