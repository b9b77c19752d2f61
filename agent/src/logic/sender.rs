//! Frame Sender
//!
//! Drains the record channel, seals each record as one length-prefixed frame
//! and writes it to the server. A lost connection is re-established with
//! exponential backoff and the pending frame is retried on the new one.

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use super::crypto::{FrameSealer, SealError};
use super::record::Record;
use crate::constants::{MAX_FRAME_BYTES, RECONNECT_BASE_MS, RECONNECT_MAX_MS};

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum SendError {
    Io(std::io::Error),
    Encode(serde_json::Error),
    Seal(SealError),
    FrameTooLarge(usize),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Io(e) => write!(f, "I/O error: {}", e),
            SendError::Encode(e) => write!(f, "cannot encode record: {}", e),
            SendError::Seal(e) => write!(f, "{}", e),
            SendError::FrameTooLarge(n) => write!(f, "frame of {} bytes exceeds limit", n),
        }
    }
}

impl std::error::Error for SendError {}

impl From<std::io::Error> for SendError {
    fn from(e: std::io::Error) -> Self {
        SendError::Io(e)
    }
}

// ============================================================================
// BACKOFF
// ============================================================================

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, current: base }
    }

    /// Delay to wait now; doubles the next one up to `max`
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(RECONNECT_BASE_MS),
            Duration::from_millis(RECONNECT_MAX_MS),
        )
    }
}

// ============================================================================
// FRAMING
// ============================================================================

/// JSON-serialise and seal one record
pub fn encode(record: &Record, sealer: &FrameSealer) -> Result<Vec<u8>, SendError> {
    let json = serde_json::to_vec(record).map_err(SendError::Encode)?;
    sealer.seal(&json).map_err(SendError::Seal)
}

/// `u32` big-endian length prefix followed by the body
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max_frame_bytes: usize) -> Result<(), SendError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > max_frame_bytes || body.len() > u32::MAX as usize {
        return Err(SendError::FrameTooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// SENDER LOOP
// ============================================================================

pub struct Sender {
    addr: String,
    sealer: FrameSealer,
    max_frame_bytes: usize,
    backoff: Backoff,
    stream: Option<TcpStream>,
    sent: u64,
}

impl Sender {
    pub fn new(addr: impl Into<String>, sealer: FrameSealer) -> Self {
        Self {
            addr: addr.into(),
            sealer,
            max_frame_bytes: MAX_FRAME_BYTES,
            backoff: Backoff::default(),
            stream: None,
            sent: 0,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Deliver records until shutdown or until every producer is gone.
    /// Returns the number of frames written.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Record>, mut shutdown: watch::Receiver<bool>) -> u64 {
        log::info!("Sender started (server: {})", self.addr);

        'records: loop {
            let record = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                record = rx.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            let body = match encode(&record, &self.sealer) {
                Ok(body) if body.len() <= self.max_frame_bytes => body,
                Ok(body) => {
                    log::error!("Dropping record: {}", SendError::FrameTooLarge(body.len()));
                    continue;
                }
                Err(e) => {
                    log::error!("Dropping record: {}", e);
                    continue;
                }
            };

            loop {
                if self.stream.is_none() {
                    match connect(&self.addr, &mut self.backoff, &mut shutdown).await {
                        Some(stream) => self.stream = Some(stream),
                        None => break 'records,
                    }
                }
                let Some(stream) = self.stream.as_mut() else { continue };

                match write_frame(stream, &body, self.max_frame_bytes).await {
                    Ok(()) => {
                        self.sent += 1;
                        break;
                    }
                    Err(e) => {
                        log::warn!("Connection to {} lost: {}", self.addr, e);
                        self.stream = None;
                    }
                }
            }
        }

        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        log::info!("Sender stopped ({} frames sent)", self.sent);
        self.sent
    }
}

/// Connect, retrying with backoff. `None` once shutdown is requested.
async fn connect(addr: &str, backoff: &mut Backoff, shutdown: &mut watch::Receiver<bool>) -> Option<TcpStream> {
    loop {
        let attempt = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return None,
            attempt = TcpStream::connect(addr) => attempt,
        };

        match attempt {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                backoff.reset();
                log::info!("Connected to {}", addr);
                return Some(stream);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                log::warn!("Connect to {} failed: {} (retry in {:?})", addr, e, delay);
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
