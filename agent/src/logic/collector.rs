//! System Monitor - host resource sampler
//!
//! Samples CPU, memory, root-disk usage and cumulative network counters with
//! `sysinfo` and pushes one `system_stats` record per interval into the
//! sender channel.

use std::path::Path;
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use sysinfo::{Disks, Networks, System};
use tokio::sync::{mpsc, watch};

use super::record::{offer, Offer, Record};

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// Cumulative interface counters summed over all interfaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct NetworkIo {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

/// One host resource sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_usage: f64,
    pub network_io: NetworkIo,
    pub timestamp: String,
    pub hostname: String,
}

// ============================================================================
// MONITOR
// ============================================================================

pub struct SystemMonitor {
    sys: System,
    disks: Disks,
    networks: Networks,
    hostname: String,
}

impl SystemMonitor {
    pub fn new() -> Self {
        let mut sys = System::new();
        // First CPU reading is only a baseline
        sys.refresh_cpu();
        sys.refresh_memory();

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            hostname,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn sample(&mut self) -> SystemStats {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();
        self.disks.refresh();
        self.networks.refresh();

        let network_io = self.networks.iter()
            .fold(NetworkIo::default(), |acc, (_name, data)| NetworkIo {
                bytes_sent: acc.bytes_sent + data.total_transmitted(),
                bytes_recv: acc.bytes_recv + data.total_received(),
            });

        let disk_usage = root_disk_usage(
            self.disks.iter().map(|d| (d.mount_point(), d.total_space(), d.available_space())),
        );

        SystemStats {
            cpu_percent: round2(self.sys.global_cpu_info().cpu_usage() as f64),
            memory_percent: round2(percent(self.sys.used_memory(), self.sys.total_memory())),
            disk_usage: round2(disk_usage),
            network_io,
            timestamp: Local::now().to_rfc3339(),
            hostname: self.hostname.clone(),
        }
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Usage of the disk mounted at `/`; falls back to the largest disk
/// (Windows has no `/` mount).
pub fn root_disk_usage<'a, I>(disks: I) -> f64
where
    I: IntoIterator<Item = (&'a Path, u64, u64)>,
{
    let mut root = None;
    let mut largest: Option<(u64, u64)> = None;

    for (mount, total, available) in disks {
        if mount == Path::new("/") {
            root = Some((total, available));
        }
        if largest.map_or(true, |(t, _)| total > t) {
            largest = Some((total, available));
        }
    }

    root.or(largest)
        .map(|(total, available)| percent(total.saturating_sub(available), total))
        .unwrap_or(0.0)
}

// ============================================================================
// PRODUCER LOOP
// ============================================================================

/// Sample every `interval` until shutdown. A full channel drops the new
/// sample instead of stalling the sampler.
pub async fn run(
    mut monitor: SystemMonitor,
    interval: Duration,
    tx: mpsc::Sender<Record>,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    log::info!("System monitor started (interval: {}s, host: {})", interval.as_secs(), monitor.hostname());

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut produced = 0u64;

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = ticker.tick() => {}
        }

        let stats = monitor.sample();
        log::debug!("Sampled cpu={}% mem={}% disk={}%", stats.cpu_percent, stats.memory_percent, stats.disk_usage);

        match offer(&tx, Record::SystemStats(stats)) {
            Offer::Queued => produced += 1,
            Offer::Dropped => {}
            Offer::Closed => {
                log::warn!("Sender gone, stopping system monitor");
                break;
            }
        }
    }

    log::info!("System monitor stopped ({} samples)", produced);
    produced
}
