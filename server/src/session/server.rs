//! Agent listener and per-session task

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use super::{AgentSession, FrameQueue, SessionRegistry};
use crate::config::QueuePolicy;
use crate::crypto::FrameCipher;
use crate::error::SessionError;
use crate::pipeline::Pipeline;

/// Everything a session task needs, shared by all sessions
pub struct SessionContext {
    pub cipher: FrameCipher,
    pub registry: Arc<SessionRegistry>,
    pub pipeline: Arc<Pipeline>,
    pub max_frame_bytes: usize,
    pub queue_capacity: usize,
    pub queue_policy: QueuePolicy,
}

/// Why a session ended
#[derive(Debug)]
pub enum SessionEnd {
    EndOfStream,
    Shutdown,
    Failed(SessionError),
}

/// Aborts the processing task if the session task goes away first
struct ProcessorHandle(JoinHandle<crate::pipeline::SessionStats>);

impl Drop for ProcessorHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drive one agent connection until it ends, then clean it up
pub async fn run_session<S>(
    stream: S,
    peer: String,
    ctx: Arc<SessionContext>,
    mut shutdown: watch::Receiver<bool>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut session = AgentSession::accept(stream, peer, ctx.registry.clone());
    if let Err(e) = session.activate() {
        session.close().await;
        return SessionEnd::Failed(e);
    }
    let session_id = session.id().to_string();
    tracing::info!(session = %session_id, peer = %session.peer(), "Agent connected");

    let queue = Arc::new(FrameQueue::new(ctx.queue_capacity, ctx.queue_policy));
    let mut processor = ProcessorHandle(tokio::spawn(
        ctx.pipeline.clone().run(session_id.clone(), queue.clone()),
    ));

    // Set when the processor ends before the reader does
    let mut processed = None;

    let end = loop {
        if *shutdown.borrow() {
            break SessionEnd::Shutdown;
        }

        tokio::select! {
            _ = shutdown.changed() => break SessionEnd::Shutdown,
            joined = &mut processor.0 => {
                processed = Some(joined);
                break SessionEnd::Failed(SessionError::ProcessingStopped);
            }
            frame = session.read_frame(&ctx.cipher, ctx.max_frame_bytes) => match frame {
                Ok(Some(payload)) => {
                    // Only a stopped processor closes the queue this early
                    if queue.push(payload).await.is_err() {
                        break SessionEnd::Failed(SessionError::ProcessingStopped);
                    }
                    ctx.pipeline.record_frame();
                }
                Ok(None) => break SessionEnd::EndOfStream,
                Err(e) => break SessionEnd::Failed(e),
            },
        }
    };

    match &end {
        SessionEnd::Failed(SessionError::Decryption) => {
            tracing::warn!(session = %session_id, "Decryption failed, closing session");
        }
        SessionEnd::Failed(e) => tracing::warn!(session = %session_id, "Session error: {}", e),
        SessionEnd::EndOfStream => tracing::info!(session = %session_id, "Agent disconnected"),
        SessionEnd::Shutdown => tracing::info!(session = %session_id, "Closing session for shutdown"),
    }

    // Frames already queued are still processed
    queue.close();
    let joined = match processed {
        Some(joined) => joined,
        None => (&mut processor.0).await,
    };
    match joined {
        Ok(stats) => tracing::debug!(
            session = %session_id,
            frames = stats.frames,
            malformed = stats.malformed,
            alerts = stats.alerts,
            "Session processing finished"
        ),
        Err(e) => tracing::error!(session = %session_id, "Processing task failed: {}", e),
    }

    session.close().await;
    end
}

pub struct AgentServer {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
}

impl AgentServer {
    pub async fn bind(addr: &str, ctx: Arc<SessionContext>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until shutdown, then give sessions `grace` to finish before
    /// aborting the rest
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, grace: Duration) {
        let mut sessions = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!("set_nodelay failed for {}: {}", peer, e);
                        }
                        sessions.spawn(run_session(stream, peer.to_string(), self.ctx.clone(), shutdown.clone()));
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Session task failed: {}", e);
                    }
                }
            }
        }

        tracing::info!(sessions = sessions.len(), "Agent listener stopped, draining sessions");
        let drained = tokio::time::timeout(grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(remaining = sessions.len(), "Grace period elapsed, aborting sessions");
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }
    }
}
