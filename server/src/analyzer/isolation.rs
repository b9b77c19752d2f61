//! Isolation forest
//!
//! Random axis-aligned splits isolate outliers in fewer steps than inliers.
//! Scores follow the `-2^(-E[h(x)] / c(psi))` convention, so they fall in
//! `[-1, 0]` and anything well below `-0.5` is unusual.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::features::{FeatureVector, FEATURE_COUNT};
use super::model::{AnomalyModel, TrainedModel};
use crate::error::AnalyzerError;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone)]
pub struct IsolationForest {
    pub trees: usize,
    pub sample_size: usize,
    pub seed: u64,
}

impl Default for IsolationForest {
    fn default() -> Self {
        Self {
            trees: 100,
            sample_size: 256,
            seed: 42,
        }
    }
}

impl AnomalyModel for IsolationForest {
    fn name(&self) -> &'static str {
        "isolation_forest"
    }

    fn fit(&self, batch: &[FeatureVector]) -> Result<Box<dyn TrainedModel>, AnalyzerError> {
        if batch.len() < 2 {
            return Err(AnalyzerError::Training(format!(
                "isolation forest needs at least 2 samples, got {}", batch.len()
            )));
        }

        let psi = self.sample_size.min(batch.len());
        let max_depth = (psi as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(self.seed);

        let trees = (0..self.trees.max(1))
            .map(|_| {
                let sample = rand::seq::index::sample(&mut rng, batch.len(), psi).into_vec();
                IsolationTree::grow(batch, sample, max_depth, &mut rng)
            })
            .collect();

        Ok(Box::new(FittedForest {
            trees,
            normaliser: average_path_length(psi),
        }))
    }
}

struct FittedForest {
    trees: Vec<IsolationTree>,
    normaliser: f64,
}

impl TrainedModel for FittedForest {
    fn score(&self, vector: &FeatureVector) -> f64 {
        let mean_depth = self.trees.iter()
            .map(|tree| tree.path_length(vector))
            .sum::<f64>() / self.trees.len() as f64;

        -(2f64).powf(-mean_depth / self.normaliser)
    }
}

// ============================================================================
// TREE
// ============================================================================

enum Node {
    Leaf { size: usize },
    Split { feature: usize, threshold: f64, left: usize, right: usize },
}

struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn grow(batch: &[FeatureVector], sample: Vec<usize>, max_depth: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.build(batch, sample, 0, max_depth, rng);
        tree
    }

    fn build(
        &mut self,
        batch: &[FeatureVector],
        rows: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { size: rows.len() });

        if depth >= max_depth || rows.len() <= 1 {
            return id;
        }

        // Only features that still vary can split this node
        let candidates: Vec<(usize, f64, f64)> = (0..FEATURE_COUNT)
            .filter_map(|feature| {
                let (min, max) = rows.iter()
                    .map(|&r| batch[r].values[feature])
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
                (max > min).then_some((feature, min, max))
            })
            .collect();

        if candidates.is_empty() {
            return id;
        }

        let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(min..max);
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows.into_iter()
            .partition(|&r| batch[r].values[feature] < threshold);

        let left = self.build(batch, left_rows, depth + 1, max_depth, rng);
        let right = self.build(batch, right_rows, depth + 1, max_depth, rng);
        self.nodes[id] = Node::Split { feature, threshold, left, right };
        id
    }

    fn path_length(&self, vector: &FeatureVector) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match self.nodes[node] {
                Node::Leaf { size } => return depth + average_path_length(size),
                Node::Split { feature, threshold, left, right } => {
                    node = if vector.values[feature] < threshold { left } else { right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Average unsuccessful-search path length in a BST of `n` nodes
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal_traffic(count: usize, seed: u64) -> Vec<FeatureVector> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| FeatureVector::from_values([
                rng.gen_range(400.0..600.0),
                rng.gen_range(40.0..60.0),
                if rng.gen_bool(0.7) { 1.0 } else { 2.0 },
                1.0,
                rng.gen_range(1.0..10.0),
            ]))
            .collect()
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        assert!((average_path_length(256) - 10.244).abs() < 0.01);
    }

    #[test]
    fn test_outlier_scores_lower_than_inliers() {
        let batch = normal_traffic(1000, 7);
        let forest = IsolationForest::default().fit(&batch).unwrap();

        let inlier = forest.score(&FeatureVector::from_values([500.0, 50.0, 1.0, 1.0, 5.0]));
        let outlier = forest.score(&FeatureVector::from_values([60_000.0, 900.0, 5.0, 3.0, 400.0]));

        assert!(outlier < inlier, "outlier {} should score below inlier {}", outlier, inlier);
        assert!(outlier < -0.5, "outlier scored {}", outlier);
        assert!((-1.0..=0.0).contains(&inlier));
    }

    #[test]
    fn test_fixed_seed_is_deterministic() {
        let batch = normal_traffic(300, 11);
        let a = IsolationForest::default().fit(&batch).unwrap();
        let b = IsolationForest::default().fit(&batch).unwrap();
        let sample = FeatureVector::from_values([800.0, 10.0, 2.0, 1.0, 3.0]);

        assert_eq!(a.score(&sample), b.score(&sample));
    }

    #[test]
    fn test_too_few_samples() {
        let batch = normal_traffic(1, 1);
        assert!(IsolationForest::default().fit(&batch).is_err());
    }
}
