//! Leaf-wise regression trees fitted to gradient statistics.
//!
//! The learner keeps a gradient/hessian histogram per open leaf, always splits
//! the leaf with the largest gain next, and derives the larger child's
//! histogram by subtracting the smaller child's from the parent's.

use super::binning::{BinnedMatrix, FeatureBinner};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TreeNode {
    Leaf {
        leaf: usize,
    },
    Split {
        feature: usize,
        bin: u8,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RegressionTree {
    nodes: Vec<TreeNode>,
    leaf_values: Vec<f64>,
}

impl RegressionTree {
    pub fn predict_row(&self, row: ArrayView1<'_, f64>) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { leaf } => return self.leaf_values[*leaf],
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => idx = if row[*feature] <= *threshold { *left } else { *right },
            }
        }
    }

    pub fn leaf_index_binned(&self, bins: &BinnedMatrix, row: usize) -> usize {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { leaf } => return *leaf,
                TreeNode::Split {
                    feature,
                    bin,
                    left,
                    right,
                    ..
                } => {
                    idx = if bins.bin(*feature, row) <= *bin {
                        *left
                    } else {
                        *right
                    }
                }
            }
        }
    }

    pub fn leaf_value(&self, leaf: usize) -> f64 {
        self.leaf_values[leaf]
    }

    pub fn num_leaves(&self) -> usize {
        self.leaf_values.len()
    }

    pub fn split_features(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes.iter().filter_map(|node| match node {
            TreeNode::Split { feature, .. } => Some(*feature),
            TreeNode::Leaf { .. } => None,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TreeConfig {
    pub num_leaves: usize,
    pub max_depth: Option<usize>,
    pub min_child_samples: usize,
    pub min_child_weight: f64,
    pub min_split_gain: f64,
    pub reg_alpha: f64,
    pub reg_lambda: f64,
}

impl TreeConfig {
    fn threshold_l1(&self, g: f64) -> f64 {
        let reduced = (g.abs() - self.reg_alpha).max(0.0);
        reduced.copysign(g)
    }

    fn leaf_gain(&self, g: f64, h: f64) -> f64 {
        let t = self.threshold_l1(g);
        t * t / (h + self.reg_lambda)
    }

    fn leaf_output(&self, g: f64, h: f64) -> f64 {
        -self.threshold_l1(g) / (h + self.reg_lambda)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BinStats {
    g: f64,
    h: f64,
    n: usize,
}

/// Per-feature bin statistics; features outside the sampled set stay empty.
#[derive(Debug, Clone)]
struct Histogram {
    features: Vec<Vec<BinStats>>,
}

impl Histogram {
    fn build(
        bins: &BinnedMatrix,
        binner: &FeatureBinner,
        features: &[usize],
        rows: &[u32],
        grad: &[f64],
        hess: &[f64],
    ) -> Self {
        let mut hist = vec![Vec::new(); binner.n_features()];
        for &f in features {
            let column = bins.column(f);
            let mut stats = vec![BinStats::default(); binner.n_bins(f)];
            for &r in rows {
                let r = r as usize;
                let s = &mut stats[column[r] as usize];
                s.g += grad[r];
                s.h += hess[r];
                s.n += 1;
            }
            hist[f] = stats;
        }
        Self { features: hist }
    }

    fn subtract(&self, other: &Histogram) -> Histogram {
        let features = self
            .features
            .iter()
            .zip(&other.features)
            .map(|(a, b)| {
                a.iter()
                    .zip(b)
                    .map(|(x, y)| BinStats {
                        g: x.g - y.g,
                        h: x.h - y.h,
                        n: x.n - y.n,
                    })
                    .collect()
            })
            .collect();
        Histogram { features }
    }
}

#[derive(Debug, Clone, Copy)]
struct SplitInfo {
    feature: usize,
    bin: usize,
    gain: f64,
}

struct OpenLeaf {
    node: usize,
    rows: Vec<u32>,
    hist: Histogram,
    sum_g: f64,
    sum_h: f64,
    depth: usize,
    split: Option<SplitInfo>,
}

pub(crate) struct TreeLearner<'a> {
    pub bins: &'a BinnedMatrix,
    pub binner: &'a FeatureBinner,
    pub config: &'a TreeConfig,
}

impl TreeLearner<'_> {
    /// Grows one tree on `rows`; leaf outputs are multiplied by `shrinkage`.
    pub fn fit(
        &self,
        rows: Vec<u32>,
        grad: &[f64],
        hess: &[f64],
        features: &[usize],
        shrinkage: f64,
    ) -> RegressionTree {
        let mut nodes = vec![TreeNode::Leaf { leaf: 0 }];
        let hist = Histogram::build(self.bins, self.binner, features, &rows, grad, hess);
        let (sum_g, sum_h) = sums(&rows, grad, hess);
        let mut root = OpenLeaf {
            node: 0,
            rows,
            hist,
            sum_g,
            sum_h,
            depth: 0,
            split: None,
        };
        root.split = self.find_split(&root, features);
        let mut leaves = vec![root];

        while leaves.len() < self.config.num_leaves {
            let best = leaves
                .iter()
                .enumerate()
                .filter_map(|(i, leaf)| leaf.split.map(|s| (i, s.gain)))
                .fold(None, |best: Option<(usize, f64)>, (i, gain)| match best {
                    Some((_, g)) if g >= gain => best,
                    _ => Some((i, gain)),
                });
            let Some((idx, _)) = best else {
                break;
            };

            let parent = leaves.remove(idx);
            let Some(split) = parent.split else {
                break;
            };
            let column = self.bins.column(split.feature);
            let (left_rows, right_rows): (Vec<u32>, Vec<u32>) = parent
                .rows
                .iter()
                .partition(|&&r| column[r as usize] as usize <= split.bin);

            let (left_hist, right_hist) = if left_rows.len() <= right_rows.len() {
                let small =
                    Histogram::build(self.bins, self.binner, features, &left_rows, grad, hess);
                let large = parent.hist.subtract(&small);
                (small, large)
            } else {
                let small =
                    Histogram::build(self.bins, self.binner, features, &right_rows, grad, hess);
                let large = parent.hist.subtract(&small);
                (large, small)
            };

            let left_node = nodes.len();
            let right_node = left_node + 1;
            nodes.push(TreeNode::Leaf { leaf: 0 });
            nodes.push(TreeNode::Leaf { leaf: 0 });
            nodes[parent.node] = TreeNode::Split {
                feature: split.feature,
                bin: split.bin as u8,
                threshold: self.binner.threshold(split.feature, split.bin),
                left: left_node,
                right: right_node,
            };

            let (left_g, left_h) = sums(&left_rows, grad, hess);
            let depth = parent.depth + 1;
            for (node, rows, hist, sum_g, sum_h) in [
                (left_node, left_rows, left_hist, left_g, left_h),
                (
                    right_node,
                    right_rows,
                    right_hist,
                    parent.sum_g - left_g,
                    parent.sum_h - left_h,
                ),
            ] {
                let mut child = OpenLeaf {
                    node,
                    rows,
                    hist,
                    sum_g,
                    sum_h,
                    depth,
                    split: None,
                };
                if self.config.max_depth.is_none_or(|max| depth < max) {
                    child.split = self.find_split(&child, features);
                }
                leaves.push(child);
            }
        }

        let mut leaf_values = Vec::with_capacity(leaves.len());
        for (i, leaf) in leaves.iter().enumerate() {
            nodes[leaf.node] = TreeNode::Leaf { leaf: i };
            leaf_values.push(self.config.leaf_output(leaf.sum_g, leaf.sum_h) * shrinkage);
        }
        RegressionTree { nodes, leaf_values }
    }

    fn find_split(&self, leaf: &OpenLeaf, features: &[usize]) -> Option<SplitInfo> {
        let cfg = self.config;
        let n = leaf.rows.len();
        if n < 2 * cfg.min_child_samples {
            return None;
        }
        let parent_gain = cfg.leaf_gain(leaf.sum_g, leaf.sum_h);
        let mut best: Option<SplitInfo> = None;

        for &f in features {
            let stats = &leaf.hist.features[f];
            let (mut gl, mut hl, mut nl) = (0.0, 0.0, 0usize);
            for (bin, s) in stats.iter().enumerate().take(stats.len().saturating_sub(1)) {
                gl += s.g;
                hl += s.h;
                nl += s.n;
                if nl < cfg.min_child_samples {
                    continue;
                }
                let nr = n - nl;
                if nr < cfg.min_child_samples {
                    break;
                }
                let hr = leaf.sum_h - hl;
                if hl < cfg.min_child_weight || hr < cfg.min_child_weight {
                    continue;
                }
                let gr = leaf.sum_g - gl;
                let gain = cfg.leaf_gain(gl, hl) + cfg.leaf_gain(gr, hr) - parent_gain;
                if best.is_none_or(|b| gain > b.gain) {
                    best = Some(SplitInfo {
                        feature: f,
                        bin,
                        gain,
                    });
                }
            }
        }
        best.filter(|b| b.gain > cfg.min_split_gain)
    }
}

fn sums(rows: &[u32], grad: &[f64], hess: &[f64]) -> (f64, f64) {
    rows.iter().fold((0.0, 0.0), |(g, h), &r| {
        (g + grad[r as usize], h + hess[r as usize])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    fn config(num_leaves: usize) -> TreeConfig {
        TreeConfig {
            num_leaves,
            max_depth: None,
            min_child_samples: 1,
            min_child_weight: 1e-3,
            min_split_gain: 0.0,
            reg_alpha: 0.0,
            reg_lambda: 0.0,
        }
    }

    #[test]
    fn test_single_split_separates_gradients() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let binner = FeatureBinner::fit(&x, 255);
        let bins = binner.transform(&x);
        let grad = [1.0, 1.0, -1.0, -1.0];
        let hess = [1.0; 4];
        let cfg = config(2);
        let learner = TreeLearner {
            bins: &bins,
            binner: &binner,
            config: &cfg,
        };
        let tree = learner.fit(vec![0, 1, 2, 3], &grad, &hess, &[0], 1.0);

        assert_eq!(tree.num_leaves(), 2);
        assert_eq!(tree.predict_row(x.row(0)), -1.0);
        assert_eq!(tree.predict_row(x.row(3)), 1.0);
        assert_eq!(tree.split_features().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_leaf_budget_respected() {
        let x = Array2::from_shape_fn((64, 2), |(i, j)| (i * (j + 1)) as f64);
        let binner = FeatureBinner::fit(&x, 255);
        let bins = binner.transform(&x);
        let grad: Vec<f64> = (0..64).map(|i| if i % 3 == 0 { 1.0 } else { -0.5 }).collect();
        let hess = vec![0.25; 64];
        let cfg = config(5);
        let learner = TreeLearner {
            bins: &bins,
            binner: &binner,
            config: &cfg,
        };
        let tree = learner.fit((0..64).collect(), &grad, &hess, &[0, 1], 0.1);
        assert!(tree.num_leaves() <= 5);
        for row in 0..64 {
            let leaf = tree.leaf_index_binned(&bins, row);
            assert_eq!(tree.leaf_value(leaf), tree.predict_row(x.row(row)));
        }
    }

    #[test]
    fn test_min_child_samples_blocks_split() {
        let x = array![[0.0], [1.0], [2.0]];
        let binner = FeatureBinner::fit(&x, 255);
        let bins = binner.transform(&x);
        let mut cfg = config(4);
        cfg.min_child_samples = 2;
        let learner = TreeLearner {
            bins: &bins,
            binner: &binner,
            config: &cfg,
        };
        let tree = learner.fit(vec![0, 1, 2], &[1.0, -1.0, 1.0], &[1.0; 3], &[0], 1.0);
        assert_eq!(tree.num_leaves(), 1);
    }

    #[test]
    fn test_l1_threshold() {
        let mut cfg = config(2);
        cfg.reg_alpha = 1.0;
        assert_eq!(cfg.threshold_l1(0.5), 0.0);
        assert_eq!(cfg.threshold_l1(-3.0), -2.0);
    }
}
