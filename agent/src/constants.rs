//! Central Configuration Constants
//!
//! Single source of truth for agent defaults. Every value can be
//! overridden through a `NETGUARD_*` environment variable.

/// Default server address (agent listener)
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:8080";

/// Default sample interval (seconds)
pub const DEFAULT_SAMPLE_INTERVAL: u64 = 5;

/// Default socket-table sample interval (milliseconds)
pub const DEFAULT_CONNECTION_INTERVAL_MS: u64 = 2_000;

/// New connections reported per socket-table sample at most
pub const MAX_OBSERVATIONS_PER_SAMPLE: usize = 256;

/// Default capacity of the producer -> sender channel
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Largest frame the server accepts by default
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Reconnect backoff bounds (milliseconds)
pub const RECONNECT_BASE_MS: u64 = 500;
pub const RECONNECT_MAX_MS: u64 = 30_000;

/// App version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// App name
pub const APP_NAME: &str = "NetGuard Agent";

// ============================================
// Helper functions to read from env with fallback
// ============================================

/// Get server address from environment or use default
pub fn get_server_addr() -> String {
    std::env::var("NETGUARD_SERVER_ADDR")
        .unwrap_or_else(|_| DEFAULT_SERVER_ADDR.to_string())
}

/// Get the hex frame key; there is no default
pub fn get_encryption_key() -> Option<String> {
    std::env::var("NETGUARD_ENCRYPTION_KEY")
        .ok()
        .filter(|k| !k.trim().is_empty())
}

/// Get sample interval from environment or use default
pub fn get_sample_interval() -> u64 {
    std::env::var("NETGUARD_SAMPLE_INTERVAL")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|s| *s > 0)
        .unwrap_or(DEFAULT_SAMPLE_INTERVAL)
}

/// Get socket-table sample interval from environment or use default
pub fn get_connection_interval_ms() -> u64 {
    std::env::var("NETGUARD_CONNECTION_INTERVAL_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|s| *s > 0)
        .unwrap_or(DEFAULT_CONNECTION_INTERVAL_MS)
}

/// Get queue capacity from environment or use default
pub fn get_queue_capacity() -> usize {
    std::env::var("NETGUARD_QUEUE_CAPACITY")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|c| *c > 0)
        .unwrap_or(DEFAULT_QUEUE_CAPACITY)
}
