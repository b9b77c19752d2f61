//! Per-session processing
//!
//! Pops decrypted frames off a session's queue in order and runs
//! decode → analyze → alert on each. Malformed payloads are dropped without
//! closing the session.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinSet;

use crate::alerts::{Alert, AlertContext, AlertEngine, ANOMALY_TYPE, RESOURCE_THRESHOLD_TYPE};
use crate::analyzer::{Analyzer, FeatureVector};
use crate::config::Thresholds;
use crate::error::DecodeError;
use crate::metrics::Metrics;
use crate::session::FrameQueue;
use crate::telemetry::{self, NetworkObservation, SystemStat, TelemetryEvent};

/// Log the first malformed payload of a session, then every Nth
const MALFORMED_LOG_EVERY: u64 = 100;

/// What happened to one frame
#[derive(Debug)]
pub enum FrameOutcome {
    Malformed(DecodeError),
    Accepted,
    Alerted(Arc<Alert>),
}

/// Per-session counters, returned when the session's queue is drained
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub frames: u64,
    pub malformed: u64,
    pub alerts: u64,
}

/// Closes the queue however processing ends, so a reader blocked on a
/// full queue is released even after a panic
struct CloseOnExit(Arc<FrameQueue>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.close();
    }
}

pub struct Pipeline {
    analyzer: Arc<Analyzer>,
    alerts: Arc<AlertEngine>,
    thresholds: Thresholds,
    metrics: Metrics,
    dispatches: Mutex<JoinSet<()>>,
}

impl Pipeline {
    pub fn new(analyzer: Arc<Analyzer>, alerts: Arc<AlertEngine>, thresholds: Thresholds, metrics: Metrics) -> Self {
        Self {
            analyzer,
            alerts,
            thresholds,
            metrics,
            dispatches: Mutex::new(JoinSet::new()),
        }
    }

    pub fn analyzer(&self) -> &Arc<Analyzer> {
        &self.analyzer
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.alerts
    }

    /// Drain `queue` until it is closed and empty
    pub async fn run(self: Arc<Self>, session_id: String, queue: Arc<FrameQueue>) -> SessionStats {
        let _closer = CloseOnExit(queue.clone());
        let mut stats = SessionStats::default();

        while let Some(frame) = queue.pop().await {
            stats.frames += 1;
            match self.process_frame(&session_id, &frame).await {
                FrameOutcome::Malformed(e) => {
                    stats.malformed += 1;
                    if stats.malformed == 1 || stats.malformed % MALFORMED_LOG_EVERY == 0 {
                        tracing::warn!(
                            session = %session_id,
                            malformed = stats.malformed,
                            "Dropping frame: {}", e
                        );
                    }
                }
                FrameOutcome::Alerted(_) => stats.alerts += 1,
                FrameOutcome::Accepted => {}
            }
        }

        if queue.dropped() > 0 {
            tracing::warn!(session = %session_id, dropped = queue.dropped(), "Frames evicted by queue policy");
        }
        stats
    }

    /// decode → analyze → alert for one plaintext payload
    pub async fn process_frame(&self, session_id: &str, payload: &[u8]) -> FrameOutcome {
        let event = match telemetry::decode(payload) {
            Ok(event) => event,
            Err(e) => return FrameOutcome::Malformed(e),
        };

        let context = match &event {
            TelemetryEvent::NetworkObservation(observation) => {
                let assessment = self.analyzer.assess(&event);
                match assessment.features {
                    Some(features) if assessment.result.is_anomaly => Some(anomaly_context(
                        session_id,
                        observation,
                        &features,
                        assessment.result.score,
                        assessment.result.describe(),
                    )),
                    _ => None,
                }
            }
            TelemetryEvent::SystemStat(stat) => resource_context(session_id, stat, &self.thresholds),
        };

        match context {
            Some(context) => FrameOutcome::Alerted(self.raise(context).await),
            None => FrameOutcome::Accepted,
        }
    }

    /// Record the alert now; notify in the background
    async fn raise(&self, context: AlertContext) -> Arc<Alert> {
        let alert = match self.alerts.raise(context).await {
            Ok(alert) => alert,
            Err(e) => e.alert,
        };

        if self.alerts.should_notify(&alert) {
            let engine = self.alerts.clone();
            let pending = alert.clone();
            let mut dispatches = self.dispatches.lock();
            while dispatches.try_join_next().is_some() {}
            dispatches.spawn(async move {
                let report = engine.dispatch(pending).await;
                tracing::debug!(alert_id = ?report.alert_id, delivered = report.delivered(), "Dispatch finished");
            });
        }
        alert
    }

    /// Notification dispatches still running
    pub fn pending_notifications(&self) -> usize {
        let mut dispatches = self.dispatches.lock();
        while dispatches.try_join_next().is_some() {}
        dispatches.len()
    }

    /// Wait up to `grace` for in-flight notifications, then abort the rest.
    /// Returns how many were abandoned.
    pub async fn drain_notifications(&self, grace: Duration) -> usize {
        let mut pending = std::mem::take(&mut *self.dispatches.lock());
        if pending.is_empty() {
            return 0;
        }

        tracing::info!(pending = pending.len(), "Waiting for in-flight notifications");
        let drained = tokio::time::timeout(grace, async {
            while pending.join_next().await.is_some() {}
        })
        .await;
        if drained.is_ok() {
            return 0;
        }

        let abandoned = pending.len();
        tracing::warn!(abandoned, "Notification grace period elapsed, abandoning sends");
        pending.abort_all();
        while pending.join_next().await.is_some() {}
        abandoned
    }

    /// Counts a frame handed over to processing
    pub fn record_frame(&self) {
        self.metrics.packets_processed.inc();
    }
}

fn anomaly_context(
    session_id: &str,
    observation: &NetworkObservation,
    features: &FeatureVector,
    score: f64,
    description: String,
) -> AlertContext {
    AlertContext::new(ANOMALY_TYPE, description)
        .with_source("session", session_id)
        .with_source("src_ip", observation.src_ip.as_str())
        .with_source("dst_ip", observation.dst_ip.as_str())
        .with_source("protocol", observation.protocol.as_str())
        .suspicious_connections(features.connection_frequency())
        .with_extra("score", score)
        .with_extra("features", features.to_log_entry())
        .with_extra("packet_summary", observation.summary.as_str())
        .with_extra("size", observation.size)
        .with_extra("observed_at", observation.timestamp.as_str())
}

/// `None` unless cpu or memory is above its threshold
fn resource_context(session_id: &str, stat: &SystemStat, thresholds: &Thresholds) -> Option<AlertContext> {
    let mut exceeded = Vec::new();
    if stat.cpu_percent > thresholds.cpu_percent {
        exceeded.push(format!("cpu {:.1}% above {:.1}%", stat.cpu_percent, thresholds.cpu_percent));
    }
    if stat.memory_percent > thresholds.memory_percent {
        exceeded.push(format!("memory {:.1}% above {:.1}%", stat.memory_percent, thresholds.memory_percent));
    }
    if exceeded.is_empty() {
        return None;
    }

    let mut context = AlertContext::new(RESOURCE_THRESHOLD_TYPE, exceeded.join(" | "))
        .with_source("session", session_id)
        .cpu_percent(stat.cpu_percent)
        .memory_percent(stat.memory_percent)
        .with_extra("disk_percent", stat.disk_percent)
        .with_extra("network_io", json!(stat.net_io))
        .with_extra("observed_at", stat.timestamp.as_str());
    if let Some(hostname) = &stat.hostname {
        context = context.with_source("hostname", hostname.as_str());
    }
    Some(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::alerts::{AlertStore, BroadcastBus, MemoryAlertHistory, NotificationChannel};
    use crate::analyzer::{
        AnomalyModel, TrainedModel, REASON_EXTREME_SCORE, REASON_FREQUENCY, REASON_PROTOCOL, REASON_TIME,
    };
    use crate::config::{AnalyzerConfig, QueuePolicy};
    use crate::error::{AnalyzerError, NotificationError};

    struct Fixture {
        pipeline: Arc<Pipeline>,
        history: Arc<MemoryAlertHistory>,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(Analyzer::new(AnalyzerConfig::default())), Vec::new())
    }

    fn fixture_with(analyzer: Arc<Analyzer>, channels: Vec<Arc<dyn NotificationChannel>>) -> Fixture {
        let metrics = Metrics::new();
        let history = Arc::new(MemoryAlertHistory::new());
        let engine = Arc::new(AlertEngine::new(
            Thresholds::default(),
            history.clone(),
            Arc::new(BroadcastBus::default()),
            channels,
            Duration::from_secs(10),
            metrics.clone(),
        ));
        Fixture {
            pipeline: Arc::new(Pipeline::new(analyzer, engine, Thresholds::default(), metrics)),
            history,
        }
    }

    /// Every vector gets the same score
    struct FlatScore(f64);

    impl TrainedModel for FlatScore {
        fn score(&self, _: &FeatureVector) -> f64 {
            self.0
        }
    }

    impl AnomalyModel for FlatScore {
        fn name(&self) -> &'static str {
            "flat"
        }

        fn fit(&self, _: &[FeatureVector]) -> Result<Box<dyn TrainedModel>, AnalyzerError> {
            Ok(Box::new(FlatScore(self.0)))
        }
    }

    /// Channel that takes `delay` to deliver
    struct SlowChannel {
        delay: Duration,
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl NotificationChannel for SlowChannel {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn send(&self, _: &Alert) -> Result<(), NotificationError> {
            tokio::time::sleep(self.delay).await;
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn slow_channel(delay: Duration) -> Arc<SlowChannel> {
        Arc::new(SlowChannel { delay, delivered: AtomicUsize::new(0) })
    }

    fn packet(protocol: &str, timestamp: &str) -> Vec<u8> {
        json!({
            "timestamp": timestamp,
            "packet_summary": "IP / GRE 172.16.0.5 > 203.0.113.7",
            "protocol": protocol,
            "size": 1400,
            "src_ip": "172.16.0.5",
            "dst_ip": "203.0.113.7"
        })
        .to_string()
        .into_bytes()
    }

    /// Pipeline whose model flags everything; one observation is spent on training
    async fn trained_fixture(score: f64) -> Fixture {
        let analyzer = Arc::new(Analyzer::with_model(AnalyzerConfig::default(), Arc::new(FlatScore(score))));
        let f = fixture_with(analyzer, Vec::new());
        let seed = f.pipeline.process_frame("agent-test", &packet("tcp", "2024-03-01T12:00:00")).await;
        assert!(matches!(seed, FrameOutcome::Accepted));
        f.pipeline.analyzer().retrain_now().unwrap();
        f
    }

    fn system_stats(cpu: f64, memory: f64) -> Vec<u8> {
        json!({
            "type": "system_stats",
            "data": {
                "timestamp": "2024-03-01T12:00:00",
                "cpu_percent": cpu,
                "memory_percent": memory,
                "disk_usage": 40.0,
                "network_io": {"bytes_sent": 10, "bytes_recv": 20},
                "hostname": "db-02"
            }
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped_without_alert() {
        let f = fixture();
        let outcome = f.pipeline
            .process_frame("agent-test", br#"{"packet_summary":"x","protocol":"tcp","size":1}"#)
            .await;

        assert!(matches!(outcome, FrameOutcome::Malformed(_)));
        assert_eq!(f.history.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_observation_before_training_raises_nothing() {
        let f = fixture();
        let payload = br#"{"timestamp":"2024-03-01T03:00:00","packet_summary":"IP / ICMP","protocol":"icmp","size":98,"src_ip":"10.0.0.1","dst_ip":"10.0.0.2"}"#;

        assert!(matches!(f.pipeline.process_frame("agent-test", payload).await, FrameOutcome::Accepted));
        assert_eq!(f.pipeline.analyzer().training_len(), 1);
    }

    #[tokio::test]
    async fn test_resource_threshold_alert() {
        let f = fixture();

        let outcome = f.pipeline.process_frame("agent-test", &system_stats(97.0, 40.0)).await;
        let alert = match outcome {
            FrameOutcome::Alerted(alert) => alert,
            other => panic!("expected alert, got {:?}", other),
        };
        assert_eq!(alert.alert_type, RESOURCE_THRESHOLD_TYPE);
        assert_eq!(alert.severity, 6);
        assert_eq!(alert.source["hostname"], "db-02");
        assert_eq!(alert.data["cpu_percent"], 97.0);

        let quiet = f.pipeline.process_frame("agent-test", &system_stats(20.0, 30.0)).await;
        assert!(matches!(quiet, FrameOutcome::Accepted));
        assert_eq!(f.history.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_counts() {
        let f = fixture();
        let queue = Arc::new(FrameQueue::new(8, QueuePolicy::Block));
        queue.push(b"garbage".to_vec()).await.unwrap();
        queue.push(system_stats(99.0, 99.0)).await.unwrap();
        queue.push(system_stats(10.0, 10.0)).await.unwrap();
        queue.close();

        let stats = f.pipeline.clone().run("agent-test".to_string(), queue).await;
        assert_eq!(stats, SessionStats { frames: 3, malformed: 1, alerts: 1 });
    }

    #[tokio::test]
    async fn test_anomalous_observation_raises_anomaly_alert() {
        let f = trained_fixture(-0.9).await;

        let outcome = f.pipeline.process_frame("agent-7", &packet("gre", "2024-03-01T03:15:00")).await;
        let alert = match outcome {
            FrameOutcome::Alerted(alert) => alert,
            other => panic!("expected alert, got {:?}", other),
        };

        assert_eq!(alert.alert_type, ANOMALY_TYPE);
        assert_eq!(
            alert.description,
            [REASON_EXTREME_SCORE, REASON_PROTOCOL, REASON_TIME].join(" | ")
        );
        assert_eq!(alert.source["session"], "agent-7");
        assert_eq!(alert.source["src_ip"], "172.16.0.5");
        assert_eq!(alert.source["dst_ip"], "203.0.113.7");
        assert_eq!(alert.source["protocol"], "gre");
        assert_eq!(alert.data["score"], -0.9);
        assert_eq!(alert.data["suspicious_connections"], 2.0);
        assert_eq!(alert.data["features"]["protocol_risk"], 5.0);
        assert_eq!(alert.severity, 7);
        assert_eq!(f.history.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_high_connection_frequency_raises_severity() {
        let f = trained_fixture(-0.6).await;

        // The training observation was the first connection of this pair
        let mut last = None;
        for _ in 0..100 {
            last = Some(f.pipeline.process_frame("agent-7", &packet("tcp", "2024-03-01T12:00:00")).await);
        }
        let alert = match last {
            Some(FrameOutcome::Alerted(alert)) => alert,
            other => panic!("expected alert, got {:?}", other),
        };

        assert_eq!(alert.data["suspicious_connections"], 101.0);
        assert_eq!(alert.description, REASON_FREQUENCY);
        assert_eq!(alert.severity, 9);

        let earlier = f.history.recent(2).await.unwrap();
        assert_eq!(earlier[1].severity, 7);
    }

    #[tokio::test]
    async fn test_score_above_threshold_raises_nothing() {
        let f = trained_fixture(-0.2).await;
        let outcome = f.pipeline.process_frame("agent-7", &packet("gre", "2024-03-01T03:15:00")).await;
        assert!(matches!(outcome, FrameOutcome::Accepted));
        assert_eq!(f.history.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_notifications() {
        let channel = slow_channel(Duration::from_millis(100));
        let f = fixture_with(
            Arc::new(Analyzer::new(AnalyzerConfig::default())),
            vec![channel.clone() as Arc<dyn NotificationChannel>],
        );

        // cpu and memory over threshold: severity 7, notified
        let outcome = f.pipeline.process_frame("agent-test", &system_stats(99.0, 99.0)).await;
        assert!(matches!(outcome, FrameOutcome::Alerted(ref a) if a.severity == 7));
        assert_eq!(f.pipeline.pending_notifications(), 1);
        assert_eq!(channel.delivered.load(Ordering::SeqCst), 0);

        assert_eq!(f.pipeline.drain_notifications(Duration::from_secs(2)).await, 0);
        assert_eq!(channel.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(f.pipeline.pending_notifications(), 0);
    }

    #[tokio::test]
    async fn test_drain_abandons_sends_after_grace() {
        let channel = slow_channel(Duration::from_secs(3600));
        let f = fixture_with(
            Arc::new(Analyzer::new(AnalyzerConfig::default())),
            vec![channel.clone() as Arc<dyn NotificationChannel>],
        );

        f.pipeline.process_frame("agent-test", &system_stats(99.0, 99.0)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_secs(2),
            f.pipeline.drain_notifications(Duration::from_millis(50)),
        )
        .await
        .unwrap();
        assert_eq!(abandoned, 1);
        assert_eq!(channel.delivered.load(Ordering::SeqCst), 0);
    }
}
