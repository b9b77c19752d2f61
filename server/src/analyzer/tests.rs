use super::*;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use crate::telemetry::SystemStat;

struct ConstScore(f64);

impl TrainedModel for ConstScore {
    fn score(&self, _: &FeatureVector) -> f64 {
        self.0
    }
}

/// Scores everything with a fixed value and counts fits
struct FixedModel {
    score: f64,
    fits: AtomicUsize,
    delay: Duration,
}

impl FixedModel {
    fn new(score: f64) -> Arc<Self> {
        Arc::new(Self { score, fits: AtomicUsize::new(0), delay: Duration::ZERO })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self { score: -0.1, fits: AtomicUsize::new(0), delay })
    }
}

impl AnomalyModel for FixedModel {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn fit(&self, _: &[FeatureVector]) -> Result<Box<dyn TrainedModel>, AnalyzerError> {
        std::thread::sleep(self.delay);
        self.fits.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ConstScore(self.score)))
    }
}

fn config(retrain_interval: usize, min_training_samples: usize) -> AnalyzerConfig {
    AnalyzerConfig {
        retrain_interval,
        min_training_samples,
        ..AnalyzerConfig::default()
    }
}

fn network(protocol: &str, timestamp: &str, size: u64) -> NetworkObservation {
    NetworkObservation {
        src_ip: "192.168.1.10".to_string(),
        dst_ip: "192.168.1.1".to_string(),
        protocol: protocol.to_string(),
        size,
        summary: "IP / TCP 192.168.1.10:51000 > 192.168.1.1:443 S".to_string(),
        timestamp: timestamp.to_string(),
    }
}

fn observation(protocol: &str, timestamp: &str, size: u64) -> TelemetryEvent {
    TelemetryEvent::NetworkObservation(network(protocol, timestamp, size))
}

fn wait_for_snapshot(analyzer: &Analyzer) -> Arc<ModelSnapshot> {
    for _ in 0..500 {
        if let Some(snapshot) = analyzer.snapshot() {
            return snapshot;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("no snapshot after retrain trigger");
}

#[test]
fn test_retrain_policy_boundaries() {
    let policy = RetrainPolicy { interval: 1000, min_samples: 100 };
    assert!(policy.should_retrain(1000));
    assert!(policy.should_retrain(2000));
    assert!(!policy.should_retrain(2999));
    assert!(!policy.should_retrain(0));

    let eager = RetrainPolicy { interval: 50, min_samples: 100 };
    assert!(!eager.should_retrain(50));
    assert!(!eager.should_retrain(100));
    assert!(eager.should_retrain(150));
}

#[test]
fn test_score_before_training_is_not_ready() {
    let analyzer = Analyzer::with_model(config(1000, 100), FixedModel::new(-0.9));
    let event = observation("tcp", "2024-03-01T12:00:00", 60);

    assert!(matches!(analyzer.score(&event), Err(AnalyzerError::ModelNotReady)));

    let assessment = analyzer.assess(&event);
    assert!(!assessment.result.is_anomaly);
    assert!(assessment.features.is_some());
    assert_eq!(analyzer.training_len(), 2);
}

#[test]
fn test_buffer_triggers_background_retrain() {
    let model = FixedModel::new(-0.1);
    let analyzer = Analyzer::with_model(config(10, 5), model.clone());

    for _ in 0..9 {
        analyzer.assess(&observation("tcp", "2024-03-01T12:00:00", 60));
    }
    assert!(analyzer.snapshot().is_none());

    analyzer.assess(&observation("tcp", "2024-03-01T12:00:00", 60));
    let snapshot = wait_for_snapshot(&analyzer);

    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.samples, 10);
    assert_eq!(model.fits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_small_buffer_never_retrains() {
    let model = FixedModel::new(-0.1);
    let analyzer = Analyzer::with_model(config(10, 100), model.clone());

    for _ in 0..100 {
        analyzer.assess(&observation("tcp", "2024-03-01T12:00:00", 60));
    }
    std::thread::sleep(Duration::from_millis(50));

    assert!(analyzer.snapshot().is_none());
    assert_eq!(model.fits.load(Ordering::SeqCst), 0);
}

#[test]
fn test_concurrent_trigger_is_skipped() {
    let model = FixedModel::slow(Duration::from_millis(200));
    let analyzer = Analyzer::with_model(config(1000, 100), model.clone());
    analyzer.observe(&network("tcp", "2024-03-01T12:00:00", 60));

    let first = analyzer.spawn_retrain().expect("first retrain starts");
    assert!(analyzer.is_retraining());
    assert!(analyzer.spawn_retrain().is_none());

    first.join().unwrap();
    assert!(!analyzer.is_retraining());
    assert_eq!(model.fits.load(Ordering::SeqCst), 1);

    analyzer.spawn_retrain().expect("flag cleared").join().unwrap();
    assert_eq!(analyzer.snapshot().unwrap().version, 2);
}

#[test]
fn test_reasons_follow_feature_values() {
    let analyzer = Analyzer::with_model(config(1000, 100), FixedModel::new(-0.9));
    analyzer.assess(&observation("tcp", "2024-03-01T12:00:00", 60));
    analyzer.retrain_now().unwrap();

    let result = analyzer.score(&observation("gre", "2024-03-01T03:30:00", 60)).unwrap();
    assert!(result.is_anomaly);
    assert_eq!(result.reasons, vec![REASON_EXTREME_SCORE, REASON_PROTOCOL, REASON_TIME]);
    assert_eq!(
        result.describe(),
        "extremely suspicious traffic pattern | suspicious protocol | suspicious activity time"
    );
}

#[test]
fn test_unexplained_anomaly_gets_fallback_reason() {
    let analyzer = Analyzer::with_model(config(1000, 100), FixedModel::new(-0.6));
    analyzer.assess(&observation("tcp", "2024-03-01T12:00:00", 60));
    analyzer.retrain_now().unwrap();

    let result = analyzer.score(&observation("tcp", "2024-03-01T12:00:00", 60)).unwrap();
    assert!(result.is_anomaly);
    assert_eq!(result.reasons, vec![REASON_UNCLASSIFIED]);
}

#[test]
fn test_score_above_threshold_is_normal() {
    let analyzer = Analyzer::with_model(config(1000, 100), FixedModel::new(-0.3));
    analyzer.assess(&observation("tcp", "2024-03-01T12:00:00", 60));
    analyzer.retrain_now().unwrap();

    let result = analyzer.score(&observation("icmp", "2024-03-01T02:00:00", 60)).unwrap();
    assert!(!result.is_anomaly);
    assert!(result.reasons.is_empty());
}

#[test]
fn test_high_frequency_reason() {
    let vector = FeatureVector::from_values([60.0, 10.0, 1.0, 1.0, 101.0]);
    assert_eq!(explain(-0.6, &vector), vec![REASON_FREQUENCY]);

    let at_limit = FeatureVector::from_values([60.0, 10.0, 3.0, 2.0, 100.0]);
    assert_eq!(explain(-0.8, &at_limit), vec![REASON_UNCLASSIFIED]);
}

#[test]
fn test_system_stats_are_not_modelled() {
    let analyzer = Analyzer::with_model(config(1000, 100), FixedModel::new(-0.9));
    let stat = TelemetryEvent::SystemStat(SystemStat {
        cpu_percent: 99.0,
        memory_percent: 99.0,
        disk_percent: 50.0,
        net_io: Default::default(),
        timestamp: "2024-03-01T12:00:00".to_string(),
        hostname: None,
    });

    let assessment = analyzer.assess(&stat);
    assert!(!assessment.result.is_anomaly);
    assert!(assessment.features.is_none());
    assert_eq!(analyzer.training_len(), 0);
    assert_eq!(analyzer.tracked_connections(), 0);
}

#[test]
fn test_isolation_forest_scoring_is_deterministic() {
    let analyzer = Analyzer::new(config(1000, 100));
    for i in 0..300u64 {
        let hour = 9 + (i % 8);
        analyzer.assess(&observation("tcp", &format!("2024-03-01T{:02}:00:00", hour), 400 + (i % 50) * 4));
    }
    let info = analyzer.retrain_now().unwrap();
    assert_eq!(info.model_name, "isolation_forest");
    assert_eq!(info.samples, 300);

    let sample = FeatureVector::from_values([50_000.0, 48.0, 5.0, 3.0, 1.0]);
    let first = analyzer.score_vector(&sample).unwrap();
    let second = analyzer.score_vector(&sample).unwrap();
    assert_eq!(first.score, second.score);
    assert_eq!(first.is_anomaly, second.is_anomaly);

    let typical = analyzer.score_vector(&FeatureVector::from_values([500.0, 48.0, 1.0, 1.0, 150.0])).unwrap();
    assert!(first.score < typical.score, "outlier {} vs typical {}", first.score, typical.score);
}
