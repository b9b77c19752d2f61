//! Connection Monitor - socket-table sampler
//!
//! Reads `/proc/net/tcp` and `/proc/net/udp` and reports each connection the
//! first time it shows up as a network observation. Other platforms have no
//! socket table to read and report nothing.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use super::record::{offer, Offer, Record};

// ============================================================================
// SOCKET TABLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// Kernel socket state (`st` column)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    Unknown,
}

impl ConnState {
    pub fn from_hex(s: &str) -> Self {
        match u8::from_str_radix(s, 16).unwrap_or(0) {
            0x01 => ConnState::Established,
            0x02 => ConnState::SynSent,
            0x03 => ConnState::SynRecv,
            0x04 => ConnState::FinWait1,
            0x05 => ConnState::FinWait2,
            0x06 => ConnState::TimeWait,
            0x07 => ConnState::Close,
            0x08 => ConnState::CloseWait,
            0x09 => ConnState::LastAck,
            0x0A => ConnState::Listen,
            0x0B => ConnState::Closing,
            _ => ConnState::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnState::Established => "ESTABLISHED",
            ConnState::SynSent => "SYN_SENT",
            ConnState::SynRecv => "SYN_RECV",
            ConnState::FinWait1 => "FIN_WAIT1",
            ConnState::FinWait2 => "FIN_WAIT2",
            ConnState::TimeWait => "TIME_WAIT",
            ConnState::Close => "CLOSE",
            ConnState::CloseWait => "CLOSE_WAIT",
            ConnState::LastAck => "LAST_ACK",
            ConnState::Listen => "LISTEN",
            ConnState::Closing => "CLOSING",
            ConnState::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub protocol: Protocol,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub state: ConnState,
    pub tx_queue: u64,
    pub rx_queue: u64,
}

type ConnKey = (Protocol, Ipv4Addr, u16, Ipv4Addr, u16);

impl Connection {
    /// Has a peer; listening and unbound sockets do not
    pub fn is_observable(&self) -> bool {
        !self.remote_ip.is_unspecified() && self.state != ConnState::Listen
    }

    pub fn summary(&self) -> String {
        format!(
            "{} {}:{} > {}:{} {}",
            self.protocol.name(),
            self.local_ip,
            self.local_port,
            self.remote_ip,
            self.remote_port,
            self.state.label()
        )
    }

    fn key(&self) -> ConnKey {
        (self.protocol, self.local_ip, self.local_port, self.remote_ip, self.remote_port)
    }
}

/// Parse one `/proc/net/{tcp,udp}` table; malformed rows are skipped
pub fn parse_proc_net(content: &str, protocol: Protocol) -> Vec<Connection> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| parse_row(line, protocol))
        .collect()
}

fn parse_row(line: &str, protocol: Protocol) -> Option<Connection> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return None;
    }

    let (local_ip, local_port) = parse_addr(parts[1])?;
    let (remote_ip, remote_port) = parse_addr(parts[2])?;
    let (tx, rx) = parts[4].split_once(':')?;

    Some(Connection {
        protocol,
        local_ip,
        local_port,
        remote_ip,
        remote_port,
        state: ConnState::from_hex(parts[3]),
        tx_queue: u64::from_str_radix(tx, 16).ok()?,
        rx_queue: u64::from_str_radix(rx, 16).ok()?,
    })
}

/// `0100007F:0CEA` -> 127.0.0.1:3306 (address in host byte order)
fn parse_addr(s: &str) -> Option<(Ipv4Addr, u16)> {
    let (ip_hex, port_hex) = s.split_once(':')?;
    if ip_hex.len() != 8 {
        return None;
    }
    let ip = u32::from_str_radix(ip_hex, 16).ok()?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    Some((Ipv4Addr::from(ip.to_ne_bytes()), port))
}

// ============================================================================
// OBSERVATIONS
// ============================================================================

/// Bare observation object the server scores with its anomaly model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkObservation {
    pub timestamp: String,
    pub packet_summary: String,
    pub protocol: String,
    pub size: u64,
    pub src_ip: String,
    pub dst_ip: String,
}

impl NetworkObservation {
    pub fn from_connection(conn: &Connection, timestamp: String) -> Self {
        Self {
            timestamp,
            packet_summary: conn.summary(),
            protocol: conn.protocol.name().to_string(),
            size: conn.tx_queue + conn.rx_queue,
            src_ip: conn.local_ip.to_string(),
            dst_ip: conn.remote_ip.to_string(),
        }
    }
}

pub struct ConnectionMonitor {
    seen: HashSet<ConnKey>,
    max_per_sample: usize,
    source: fn() -> Vec<Connection>,
}

impl ConnectionMonitor {
    pub fn new(max_per_sample: usize) -> Self {
        Self::with_source(read_socket_table, max_per_sample)
    }

    pub fn with_source(source: fn() -> Vec<Connection>, max_per_sample: usize) -> Self {
        Self {
            seen: HashSet::new(),
            max_per_sample: max_per_sample.max(1),
            source,
        }
    }

    /// Connections not present in the previous sample. Connections past the
    /// per-sample cap stay unseen and are reported on the next round.
    pub fn observe(&mut self, connections: Vec<Connection>) -> Vec<NetworkObservation> {
        let timestamp = Local::now().to_rfc3339();
        let mut current = HashSet::with_capacity(connections.len());
        let mut fresh = Vec::new();

        for conn in connections.iter().filter(|c| c.is_observable()) {
            let key = conn.key();
            if self.seen.contains(&key) {
                current.insert(key);
                continue;
            }
            if fresh.len() >= self.max_per_sample {
                continue;
            }
            if current.insert(key) {
                fresh.push(NetworkObservation::from_connection(conn, timestamp.clone()));
            }
        }

        self.seen = current;
        fresh
    }

    pub fn sample(&mut self) -> Vec<NetworkObservation> {
        let connections = (self.source)();
        self.observe(connections)
    }
}

#[cfg(target_os = "linux")]
pub fn read_socket_table() -> Vec<Connection> {
    let mut connections = Vec::new();
    for (path, protocol) in [("/proc/net/tcp", Protocol::Tcp), ("/proc/net/udp", Protocol::Udp)] {
        match std::fs::read_to_string(path) {
            Ok(content) => connections.extend(parse_proc_net(&content, protocol)),
            Err(e) => log::debug!("Cannot read {}: {}", path, e),
        }
    }
    connections
}

#[cfg(not(target_os = "linux"))]
pub fn read_socket_table() -> Vec<Connection> {
    Vec::new()
}

// ============================================================================
// PRODUCER LOOP
// ============================================================================

/// Sample the socket table every `interval` until shutdown, feeding the same
/// bounded channel as the system monitor.
pub async fn run(
    mut monitor: ConnectionMonitor,
    interval: Duration,
    tx: mpsc::Sender<Record>,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    log::info!("Connection monitor started (interval: {}ms)", interval.as_millis());

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut produced = 0u64;

    'outer: loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = ticker.tick() => {}
        }

        let observations = monitor.sample();
        if !observations.is_empty() {
            log::debug!("{} new connections", observations.len());
        }

        for observation in observations {
            match offer(&tx, Record::NetworkObservation(observation)) {
                Offer::Queued => produced += 1,
                Offer::Dropped => {}
                Offer::Closed => {
                    log::warn!("Sender gone, stopping connection monitor");
                    break 'outer;
                }
            }
        }
    }

    log::info!("Connection monitor stopped ({} observations)", produced);
    produced
}
