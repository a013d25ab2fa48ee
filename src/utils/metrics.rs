//! Proxy statistics
//!
//! Atomic counters shared between the event loop and whoever wants to report
//! on it. Connection counting follows the session lifecycle: a client datagram
//! arriving outside a session starts a connection, a client disconnect
//! completes one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Counters for one proxy instance
#[derive(Debug)]
pub struct ProxyMetrics {
    /// Connections started
    pub connections_total: AtomicU64,
    /// Connections started but not yet completed
    pub connections_active: AtomicU64,
    /// Connections ended by a client disconnect
    pub connections_completed: AtomicU64,
    /// Datagrams received from the client
    pub datagrams_from_client: AtomicU64,
    /// Datagrams received from the login server
    pub datagrams_from_server: AtomicU64,
    /// Datagrams or sub-packets that could not be handled
    pub datagrams_dropped: AtomicU64,
    /// Login requests detected
    pub logins_seen: AtomicU64,
    /// Login requests carrying substituted credentials
    pub logins_rewritten: AtomicU64,
    /// Server listings rewritten
    pub listings_filtered: AtomicU64,
    /// Bytes sent to the login server
    pub bytes_to_server: AtomicU64,
    /// Bytes sent to the client
    pub bytes_to_client: AtomicU64,
    start_time: Instant,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_completed: AtomicU64::new(0),
            datagrams_from_client: AtomicU64::new(0),
            datagrams_from_server: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            logins_seen: AtomicU64::new(0),
            logins_rewritten: AtomicU64::new(0),
            listings_filtered: AtomicU64::new(0),
            bytes_to_server: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_started(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed connection; the active count never goes below zero
    pub fn connection_completed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        self.connections_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_datagram(&self) {
        self.datagrams_from_client.fetch_add(1, Ordering::Relaxed);
    }

    pub fn server_datagram(&self) {
        self.datagrams_from_server.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self, count: u64) {
        if count > 0 {
            self.datagrams_dropped.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn login_seen(&self) {
        self.logins_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn login_rewritten(&self) {
        self.logins_rewritten.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listing_filtered(&self) {
        self.listings_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent_to_server(&self, byte_count: u64) {
        self.bytes_to_server.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn sent_to_client(&self, byte_count: u64) {
        self.bytes_to_client.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_completed: self.connections_completed.load(Ordering::Relaxed),
            datagrams_from_client: self.datagrams_from_client.load(Ordering::Relaxed),
            datagrams_from_server: self.datagrams_from_server.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            logins_seen: self.logins_seen.load(Ordering::Relaxed),
            logins_rewritten: self.logins_rewritten.load(Ordering::Relaxed),
            listings_filtered: self.listings_filtered.load(Ordering::Relaxed),
            bytes_to_server: self.bytes_to_server.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connections_completed = snapshot.connections_completed,
            datagrams_from_client = snapshot.datagrams_from_client,
            datagrams_from_server = snapshot.datagrams_from_server,
            datagrams_dropped = snapshot.datagrams_dropped,
            logins_seen = snapshot.logins_seen,
            logins_rewritten = snapshot.logins_rewritten,
            listings_filtered = snapshot.listings_filtered,
            bytes_to_server = snapshot.bytes_to_server,
            bytes_to_client = snapshot.bytes_to_client,
            uptime_seconds = snapshot.uptime_seconds,
            "Proxy metrics snapshot"
        );
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_completed: u64,
    pub datagrams_from_client: u64,
    pub datagrams_from_server: u64,
    pub datagrams_dropped: u64,
    pub logins_seen: u64,
    pub logins_rewritten: u64,
    pub listings_filtered: u64,
    pub bytes_to_server: u64,
    pub bytes_to_client: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}
