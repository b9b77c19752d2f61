use super::*;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;

use crate::alerts::{AlertEngine, AlertStore, BroadcastBus, MemoryAlertHistory};
use crate::analyzer::Analyzer;
use crate::config::{AnalyzerConfig, QueuePolicy, Thresholds};
use crate::crypto::generate_key;
use crate::pipeline::Pipeline;

const MAX_FRAME: usize = 4096;

struct Fixture {
    ctx: Arc<SessionContext>,
    metrics: Metrics,
    history: Arc<MemoryAlertHistory>,
    cipher: FrameCipher,
    shutdown: watch::Sender<bool>,
}

fn context(history: Arc<dyn AlertStore>, metrics: &Metrics, cipher: &FrameCipher, queue_capacity: usize) -> Arc<SessionContext> {
    let engine = Arc::new(AlertEngine::new(
        Thresholds::default(),
        history,
        Arc::new(BroadcastBus::default()),
        Vec::new(),
        Duration::from_secs(1),
        metrics.clone(),
    ));
    let pipeline = Arc::new(Pipeline::new(
        Arc::new(Analyzer::new(AnalyzerConfig::default())),
        engine,
        Thresholds::default(),
        metrics.clone(),
    ));

    Arc::new(SessionContext {
        cipher: cipher.clone(),
        registry: Arc::new(SessionRegistry::new(metrics.clone())),
        pipeline,
        max_frame_bytes: MAX_FRAME,
        queue_capacity,
        queue_policy: QueuePolicy::Block,
    })
}

fn fixture() -> Fixture {
    let metrics = Metrics::new();
    let history = Arc::new(MemoryAlertHistory::new());
    let cipher = FrameCipher::from_hex(&generate_key()).unwrap();
    let (shutdown, _) = watch::channel(false);

    Fixture {
        ctx: context(history.clone(), &metrics, &cipher, 16),
        metrics,
        history,
        cipher,
        shutdown,
    }
}

/// History backend that crashes the processing task
struct CrashingHistory;

#[async_trait]
impl AlertStore for CrashingHistory {
    async fn append(&self, _: &crate::alerts::Alert) -> Result<(), crate::error::StorageError> {
        panic!("history backend crashed");
    }

    async fn recent(&self, _: usize) -> Result<Vec<crate::alerts::Alert>, crate::error::StorageError> {
        Ok(Vec::new())
    }

    async fn count(&self) -> Result<u64, crate::error::StorageError> {
        Ok(0)
    }
}

impl Fixture {
    fn connect(&self) -> (DuplexStream, tokio::task::JoinHandle<SessionEnd>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(run_session(
            server,
            "127.0.0.1:50000".to_string(),
            self.ctx.clone(),
            self.shutdown.subscribe(),
        ));
        (client, handle)
    }

    async fn wait_for_sessions(&self, expected: usize) {
        for _ in 0..200 {
            if self.ctx.registry.len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("registry never reached {} sessions", expected);
    }

    async fn wait_for_alerts(&self, expected: u64) {
        for _ in 0..200 {
            if self.history.count().await.unwrap() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("history never reached {} alerts", expected);
    }
}

async fn send<W: AsyncWrite + Unpin>(client: &mut W, cipher: &FrameCipher, payload: &[u8]) {
    frame::write_frame(client, &cipher.encrypt(payload).unwrap(), MAX_FRAME).await.unwrap();
}

fn hot_cpu() -> Vec<u8> {
    serde_json::json!({
        "type": "system_stats",
        "data": {
            "timestamp": "2024-03-01T12:00:00",
            "cpu_percent": 98.0,
            "memory_percent": 50.0,
            "disk_usage": 40.0,
            "network_io": {}
        }
    })
    .to_string()
    .into_bytes()
}

#[test]
fn test_state_machine_transitions() {
    use SessionStatus::*;
    assert!(Accepting.can_transition_to(Active));
    assert!(Active.can_transition_to(Closing));
    assert!(Closing.can_transition_to(Closed));
    assert!(!Active.can_transition_to(Accepting));
    assert!(!Active.can_transition_to(Closed));
    for next in [Accepting, Active, Closing, Closed] {
        assert!(!Closed.can_transition_to(next));
    }
}

#[test]
fn test_session_ids_are_unique_and_shaped() {
    let a = next_session_id();
    let b = next_session_id();
    assert_ne!(a, b);

    let parts: Vec<&str> = a.split('-').collect();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0], "agent");
    assert_eq!(parts[1].len(), 14);
    assert!(parts[2].parse::<u64>().is_ok());
}

#[tokio::test]
async fn test_invalid_transition_and_idempotent_close() {
    let metrics = Metrics::new();
    let registry = Arc::new(SessionRegistry::new(metrics.clone()));
    let (_client, server) = tokio::io::duplex(64);

    let mut session = AgentSession::accept(server, "peer", registry.clone());
    assert_eq!(metrics.active_agents.get(), 1);
    session.activate().unwrap();
    assert!(matches!(
        session.transition(SessionStatus::Accepting),
        Err(SessionError::InvalidTransition { from: SessionStatus::Active, to: SessionStatus::Accepting })
    ));

    session.close().await;
    session.close().await;
    assert_eq!(session.status(), SessionStatus::Closed);
    assert!(session.transition(SessionStatus::Active).is_err());
    assert_eq!(metrics.active_agents.get(), 0);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_drop_guard_cleans_up_once() {
    let metrics = Metrics::new();
    let registry = Arc::new(SessionRegistry::new(metrics.clone()));
    let (_client, server) = tokio::io::duplex(64);

    let mut session = AgentSession::accept(server, "peer", registry.clone());
    session.activate().unwrap();
    assert_eq!(registry.get(session.id()).unwrap().status, SessionStatus::Active);

    drop(session);
    assert_eq!(metrics.active_agents.get(), 0);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_wrong_key_closes_only_that_session() {
    let f = fixture();
    let (mut client, handle) = f.connect();
    f.wait_for_sessions(1).await;
    assert_eq!(f.metrics.active_agents.get(), 1);

    let stranger = FrameCipher::from_hex(&generate_key()).unwrap();
    send(&mut client, &stranger, &hot_cpu()).await;

    let end = handle.await.unwrap();
    assert!(matches!(end, SessionEnd::Failed(SessionError::Decryption)));
    assert_eq!(f.metrics.active_agents.get(), 0);
    assert!(f.ctx.registry.is_empty());
    assert_eq!(f.history.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_malformed_payload_keeps_session_active() {
    let f = fixture();
    let (mut client, handle) = f.connect();

    send(&mut client, &f.cipher, br#"{"packet_summary":"x","protocol":"tcp","size":1}"#).await;
    send(&mut client, &f.cipher, &hot_cpu()).await;
    f.wait_for_alerts(1).await;

    let sessions = f.ctx.registry.list();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Active);
    assert_eq!(f.metrics.packets_processed.get(), 2);

    drop(client);
    assert!(matches!(handle.await.unwrap(), SessionEnd::EndOfStream));
    assert_eq!(f.history.count().await.unwrap(), 1);
    assert_eq!(f.metrics.active_agents.get(), 0);
}

#[tokio::test]
async fn test_processing_failure_closes_session() {
    let metrics = Metrics::new();
    let cipher = FrameCipher::from_hex(&generate_key()).unwrap();
    let ctx = context(Arc::new(CrashingHistory), &metrics, &cipher, 2);
    let (_stop, shutdown) = watch::channel(false);

    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(run_session(server, "127.0.0.1:50001".to_string(), ctx.clone(), shutdown));

    // More frames than the queue holds; the session may close mid-way
    for _ in 0..10 {
        let body = cipher.encrypt(&hot_cpu()).unwrap();
        if frame::write_frame(&mut client, &body, MAX_FRAME).await.is_err() {
            break;
        }
    }

    let end = tokio::time::timeout(Duration::from_secs(2), handle).await
        .expect("session must end once its processor is gone")
        .unwrap();
    assert!(matches!(end, SessionEnd::Failed(SessionError::ProcessingStopped)));
    assert!(ctx.registry.is_empty());
    assert_eq!(metrics.active_agents.get(), 0);
}

#[tokio::test]
async fn test_oversized_frame_closes_session() {
    let f = fixture();
    let (mut client, handle) = f.connect();

    frame::write_frame(&mut client, &vec![0u8; MAX_FRAME + 1], usize::MAX).await.unwrap();

    assert!(matches!(
        handle.await.unwrap(),
        SessionEnd::Failed(SessionError::FrameTooLarge { .. })
    ));
    assert!(f.ctx.registry.is_empty());
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let f = fixture();
    let (mut good, good_handle) = f.connect();
    let (mut bad, bad_handle) = f.connect();
    f.wait_for_sessions(2).await;

    bad.write_all(&[0, 0, 0, 3, 1, 2, 3]).await.unwrap();
    assert!(matches!(bad_handle.await.unwrap(), SessionEnd::Failed(SessionError::Decryption)));
    assert_eq!(f.metrics.active_agents.get(), 1);

    send(&mut good, &f.cipher, &hot_cpu()).await;
    f.wait_for_alerts(1).await;
    assert_eq!(f.ctx.registry.list()[0].status, SessionStatus::Active);

    drop(good);
    assert!(matches!(good_handle.await.unwrap(), SessionEnd::EndOfStream));
    assert_eq!(f.metrics.active_agents.get(), 0);
}

#[tokio::test]
async fn test_shutdown_signal_ends_sessions() {
    let f = fixture();
    let (_client, handle) = f.connect();
    f.wait_for_sessions(1).await;

    f.shutdown.send(true).unwrap();

    assert!(matches!(handle.await.unwrap(), SessionEnd::Shutdown));
    assert_eq!(f.metrics.active_agents.get(), 0);
}

#[tokio::test]
async fn test_server_accepts_tcp_agents_and_drains_on_shutdown() {
    let f = fixture();
    let server = AgentServer::bind("127.0.0.1:0", f.ctx.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let running = tokio::spawn(server.run(f.shutdown.subscribe(), Duration::from_secs(2)));

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    send(&mut stream, &f.cipher, &hot_cpu()).await;
    f.wait_for_alerts(1).await;
    assert_eq!(f.ctx.registry.len(), 1);

    f.shutdown.send(true).unwrap();
    running.await.unwrap();
    assert!(f.ctx.registry.is_empty());
    assert_eq!(f.metrics.active_agents.get(), 0);
}

