//! Model contract and immutable snapshots
//!
//! Any model family plugs in through [`AnomalyModel`] (training) and
//! [`TrainedModel`] (scoring). A [`ModelSnapshot`] bundles the fitted scaler
//! with the fitted model and is never mutated after construction.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::features::{FeatureVector, FEATURE_COUNT};
use crate::error::AnalyzerError;

// ============================================================================
// CONTRACT
// ============================================================================

/// Trains a scorer from a batch of already-scaled vectors
pub trait AnomalyModel: Send + Sync {
    fn name(&self) -> &'static str;

    fn fit(&self, batch: &[FeatureVector]) -> Result<Box<dyn TrainedModel>, AnalyzerError>;
}

/// Fitted scorer. Lower scores are more anomalous.
pub trait TrainedModel: Send + Sync {
    fn score(&self, vector: &FeatureVector) -> f64;
}

// ============================================================================
// SCALER
// ============================================================================

/// Per-feature standardisation (zero mean, unit variance)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StandardScaler {
    mean: [f64; FEATURE_COUNT],
    scale: [f64; FEATURE_COUNT],
}

impl StandardScaler {
    pub fn fit(batch: &[FeatureVector]) -> Self {
        let n = batch.len().max(1) as f64;
        let mut mean = [0.0; FEATURE_COUNT];
        let mut scale = [1.0; FEATURE_COUNT];

        for i in 0..FEATURE_COUNT {
            mean[i] = batch.iter().map(|v| v.values[i]).sum::<f64>() / n;
            let variance = batch.iter()
                .map(|v| (v.values[i] - mean[i]).powi(2))
                .sum::<f64>() / n;
            let std = variance.sqrt();
            // Constant features pass through unscaled
            if std > f64::EPSILON {
                scale[i] = std;
            }
        }

        Self { mean, scale }
    }

    pub fn transform(&self, vector: &FeatureVector) -> FeatureVector {
        let mut values = vector.values;
        for (i, value) in values.iter_mut().enumerate() {
            *value = (*value - self.mean[i]) / self.scale[i];
        }
        FeatureVector::from_values(values)
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

pub struct ModelSnapshot {
    pub version: u64,
    pub model_name: &'static str,
    pub trained_at: DateTime<Utc>,
    pub samples: usize,
    scaler: StandardScaler,
    model: Box<dyn TrainedModel>,
}

impl ModelSnapshot {
    /// Fit scaler and model on `batch`
    pub fn train(
        model: &dyn AnomalyModel,
        batch: &[FeatureVector],
        version: u64,
    ) -> Result<Self, AnalyzerError> {
        if batch.is_empty() {
            return Err(AnalyzerError::Training("empty training batch".to_string()));
        }

        let scaler = StandardScaler::fit(batch);
        let scaled: Vec<FeatureVector> = batch.iter().map(|v| scaler.transform(v)).collect();
        let fitted = model.fit(&scaled)?;

        Ok(Self {
            version,
            model_name: model.name(),
            trained_at: Utc::now(),
            samples: batch.len(),
            scaler,
            model: fitted,
        })
    }

    /// Scale then score
    pub fn score(&self, vector: &FeatureVector) -> f64 {
        self.model.score(&self.scaler.transform(vector))
    }

    pub fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            version: self.version,
            model_name: self.model_name,
            trained_at: self.trained_at,
            samples: self.samples,
        }
    }
}

impl std::fmt::Debug for ModelSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSnapshot")
            .field("version", &self.version)
            .field("model_name", &self.model_name)
            .field("samples", &self.samples)
            .finish()
    }
}

/// Serializable snapshot metadata
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub version: u64,
    pub model_name: &'static str,
    pub trained_at: DateTime<Utc>,
    pub samples: usize,
}
