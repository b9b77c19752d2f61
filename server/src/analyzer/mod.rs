//! Anomaly Analyzer
//!
//! Turns network observations into feature vectors, keeps the training buffer
//! and connection-frequency table, and scores against the current
//! [`ModelSnapshot`]. Retraining happens off the hot path on a dedicated
//! thread; the finished snapshot is swapped in atomically so scorers never see
//! a half-trained model.

pub mod features;
pub mod frequency;
pub mod isolation;
pub mod model;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AnalyzerConfig;
use crate::error::AnalyzerError;
use crate::telemetry::{NetworkObservation, TelemetryEvent};

pub use features::FeatureVector;
pub use frequency::{ConnectionFrequencyTable, ConnectionKey};
pub use isolation::IsolationForest;
pub use model::{AnomalyModel, ModelSnapshot, SnapshotInfo, TrainedModel};

// ============================================================================
// RESULTS
// ============================================================================

pub const REASON_EXTREME_SCORE: &str = "extremely suspicious traffic pattern";
pub const REASON_PROTOCOL: &str = "suspicious protocol";
pub const REASON_TIME: &str = "suspicious activity time";
pub const REASON_FREQUENCY: &str = "high connection frequency";
pub const REASON_UNCLASSIFIED: &str = "unclassified anomaly";

const EXTREME_SCORE: f64 = -0.8;
const RISKY_PROTOCOL: f64 = 3.0;
const RISKY_TIME: f64 = 2.0;
const HIGH_FREQUENCY: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyResult {
    pub is_anomaly: bool,
    pub score: f64,
    pub reasons: Vec<String>,
}

impl AnomalyResult {
    pub fn normal() -> Self {
        Self {
            is_anomaly: false,
            score: 0.0,
            reasons: Vec::new(),
        }
    }

    /// Reasons joined for display
    pub fn describe(&self) -> String {
        self.reasons.join(" | ")
    }
}

/// Reasons for an anomalous score, in fixed order. Never empty.
pub fn explain(score: f64, vector: &FeatureVector) -> Vec<String> {
    let mut reasons = Vec::new();
    if score < EXTREME_SCORE {
        reasons.push(REASON_EXTREME_SCORE.to_string());
    }
    if vector.protocol_risk() > RISKY_PROTOCOL {
        reasons.push(REASON_PROTOCOL.to_string());
    }
    if vector.time_risk() > RISKY_TIME {
        reasons.push(REASON_TIME.to_string());
    }
    if vector.connection_frequency() > HIGH_FREQUENCY {
        reasons.push(REASON_FREQUENCY.to_string());
    }
    if reasons.is_empty() {
        reasons.push(REASON_UNCLASSIFIED.to_string());
    }
    reasons
}

/// Pipeline view of one scored event
#[derive(Debug, Clone)]
pub struct Assessment {
    /// Present for network observations only
    pub features: Option<FeatureVector>,
    pub result: AnomalyResult,
}

// ============================================================================
// RETRAIN POLICY
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RetrainPolicy {
    pub interval: usize,
    pub min_samples: usize,
}

impl RetrainPolicy {
    pub fn should_retrain(&self, buffered: usize) -> bool {
        buffered > 0
            && self.interval > 0
            && buffered % self.interval == 0
            && buffered > self.min_samples
    }
}

impl From<&AnalyzerConfig> for RetrainPolicy {
    fn from(config: &AnalyzerConfig) -> Self {
        Self {
            interval: config.retrain_interval,
            min_samples: config.min_training_samples,
        }
    }
}

// ============================================================================
// ANALYZER
// ============================================================================

struct ModelSlot {
    model: Arc<dyn AnomalyModel>,
    current: ArcSwapOption<ModelSnapshot>,
    retraining: AtomicBool,
    versions: AtomicU64,
}

impl ModelSlot {
    /// Fit on `batch` and publish the result
    fn train_and_swap(&self, batch: &[FeatureVector]) -> Result<Arc<ModelSnapshot>, AnalyzerError> {
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        let snapshot = Arc::new(ModelSnapshot::train(self.model.as_ref(), batch, version)?);
        self.current.store(Some(snapshot.clone()));

        tracing::info!(
            version,
            samples = batch.len(),
            model = snapshot.model_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model snapshot swapped in"
        );
        Ok(snapshot)
    }
}

/// Clears the in-progress flag however the retrain thread exits
struct RetrainGuard(Arc<ModelSlot>);

impl Drop for RetrainGuard {
    fn drop(&mut self) {
        self.0.retraining.store(false, Ordering::SeqCst);
    }
}

pub struct Analyzer {
    config: AnalyzerConfig,
    policy: RetrainPolicy,
    frequency: ConnectionFrequencyTable,
    training: Mutex<Vec<FeatureVector>>,
    slot: Arc<ModelSlot>,
}

impl Analyzer {
    /// Analyzer backed by the configured isolation forest
    pub fn new(config: AnalyzerConfig) -> Self {
        let forest = IsolationForest {
            trees: config.trees,
            sample_size: config.sample_size,
            seed: config.seed,
        };
        Self::with_model(config, Arc::new(forest))
    }

    pub fn with_model(config: AnalyzerConfig, model: Arc<dyn AnomalyModel>) -> Self {
        Self {
            policy: RetrainPolicy::from(&config),
            config,
            frequency: ConnectionFrequencyTable::new(),
            training: Mutex::new(Vec::new()),
            slot: Arc::new(ModelSlot {
                model,
                current: ArcSwapOption::const_empty(),
                retraining: AtomicBool::new(false),
                versions: AtomicU64::new(0),
            }),
        }
    }

    /// Score one event. Fails with `ModelNotReady` until the first snapshot exists.
    pub fn score(&self, event: &TelemetryEvent) -> Result<AnomalyResult, AnalyzerError> {
        self.evaluate(event).1
    }

    /// Infallible pipeline entry: an unready model yields a normal result
    pub fn assess(&self, event: &TelemetryEvent) -> Assessment {
        let (features, outcome) = self.evaluate(event);
        let result = match outcome {
            Ok(result) => result,
            Err(AnalyzerError::ModelNotReady) => AnomalyResult::normal(),
            Err(e) => {
                tracing::warn!("scoring failed, treating event as normal: {}", e);
                AnomalyResult::normal()
            }
        };
        Assessment { features, result }
    }

    fn evaluate(&self, event: &TelemetryEvent) -> (Option<FeatureVector>, Result<AnomalyResult, AnalyzerError>) {
        match event {
            // Host samples go through the resource-threshold path instead
            TelemetryEvent::SystemStat(_) => (None, Ok(AnomalyResult::normal())),
            TelemetryEvent::NetworkObservation(observation) => {
                let vector = self.observe(observation);
                (Some(vector), self.score_vector(&vector))
            }
        }
    }

    /// Extract features, record the connection and buffer the vector
    pub fn observe(&self, observation: &NetworkObservation) -> FeatureVector {
        let key = ConnectionKey::new(observation.src_ip.as_str(), observation.dst_ip.as_str());
        let frequency = self.frequency.record(&key);
        let vector = features::extract(observation, frequency);

        let buffered = {
            let mut training = self.training.lock();
            training.push(vector);
            training.len()
        };

        if self.policy.should_retrain(buffered) {
            self.spawn_retrain();
        }

        vector
    }

    /// Score against the snapshot current right now
    pub fn score_vector(&self, vector: &FeatureVector) -> Result<AnomalyResult, AnalyzerError> {
        let snapshot = self.slot.current.load_full().ok_or(AnalyzerError::ModelNotReady)?;
        let score = snapshot.score(vector);

        if score < self.config.anomaly_threshold {
            Ok(AnomalyResult {
                is_anomaly: true,
                score,
                reasons: explain(score, vector),
            })
        } else {
            Ok(AnomalyResult {
                is_anomaly: false,
                score,
                reasons: Vec::new(),
            })
        }
    }

    /// Fit a new snapshot on a copy of the buffer on a dedicated thread.
    ///
    /// Returns `None` when a retrain is already running or the thread could
    /// not be spawned.
    pub fn spawn_retrain(&self) -> Option<JoinHandle<()>> {
        if self.slot.retraining.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                buffered = self.training_len(),
                "retrain already in progress, skipping trigger"
            );
            return None;
        }

        let batch = self.training.lock().clone();
        let guard = RetrainGuard(self.slot.clone());

        let spawned = std::thread::Builder::new()
            .name("netguard-retrain".to_string())
            .spawn(move || {
                if let Err(e) = guard.0.train_and_swap(&batch) {
                    tracing::error!(samples = batch.len(), "retrain failed: {}", e);
                }
                drop(guard);
            });

        match spawned {
            Ok(handle) => {
                tracing::info!(samples = self.training_len(), "retrain started");
                Some(handle)
            }
            Err(e) => {
                // The closure, and with it the guard, was dropped
                tracing::error!("could not spawn retrain thread: {}", e);
                None
            }
        }
    }

    /// Synchronous retrain on the current buffer
    pub fn retrain_now(&self) -> Result<SnapshotInfo, AnalyzerError> {
        let batch = self.training.lock().clone();
        self.slot.train_and_swap(&batch).map(|s| s.info())
    }

    pub fn snapshot(&self) -> Option<Arc<ModelSnapshot>> {
        self.slot.current.load_full()
    }

    pub fn is_retraining(&self) -> bool {
        self.slot.retraining.load(Ordering::SeqCst)
    }

    pub fn training_len(&self) -> usize {
        self.training.lock().len()
    }

    /// Drop connection keys idle for a whole window
    pub fn sweep(&self) -> usize {
        self.frequency.sweep(Instant::now())
    }

    pub fn tracked_connections(&self) -> usize {
        self.frequency.tracked_keys()
    }
}

#[cfg(test)]
mod tests;
