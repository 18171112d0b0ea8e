//! Observability and Metrics
//!
//! Per-server counters for connections, frames and faults.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

use crate::protocol::fault::FaultKind;

/// Metrics collector shared by the accept loop and every connection actor
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted into an actor
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Connections refused because the peer is banned
    pub rejected_banned: AtomicU64,
    /// Connections refused because the server is full
    pub rejected_capacity: AtomicU64,
    /// Frames read off the wire
    pub frames_received: AtomicU64,
    /// Frames written
    pub frames_sent: AtomicU64,
    /// Total payload bytes received
    pub bytes_received: AtomicU64,
    /// Total payload bytes sent
    pub bytes_sent: AtomicU64,
    /// Packets that went through a dispatch pass
    pub packets_dispatched: AtomicU64,
    /// Handler invocations
    pub handlers_invoked: AtomicU64,
    pub framing_faults: AtomicU64,
    pub payload_faults: AtomicU64,
    pub no_match: AtomicU64,
    pub handler_faults: AtomicU64,
    pub capacity_faults: AtomicU64,
    pub timeouts: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            rejected_banned: AtomicU64::new(0),
            rejected_capacity: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_dispatched: AtomicU64::new(0),
            handlers_invoked: AtomicU64::new(0),
            framing_faults: AtomicU64::new(0),
            payload_faults: AtomicU64::new(0),
            no_match: AtomicU64::new(0),
            handler_faults: AtomicU64::new(0),
            capacity_faults: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_banned(&self) {
        self.rejected_banned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_over_capacity(&self) {
        self.rejected_capacity.fetch_add(1, Ordering::Relaxed);
        self.capacity_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame received
    pub fn frame_received(&self, byte_count: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    /// Record a frame sent
    pub fn frame_sent(&self, byte_count: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    /// Record a completed dispatch pass
    pub fn packet_dispatched(&self, invoked: usize) {
        self.packets_dispatched.fetch_add(1, Ordering::Relaxed);
        self.handlers_invoked.fetch_add(invoked as u64, Ordering::Relaxed);
    }

    /// Record a fault by kind
    pub fn fault(&self, kind: FaultKind) {
        let counter = match kind {
            FaultKind::Framing => &self.framing_faults,
            FaultKind::Payload => &self.payload_faults,
            FaultKind::NoMatch => &self.no_match,
            FaultKind::Handler => &self.handler_faults,
            FaultKind::Capacity => &self.capacity_faults,
            FaultKind::Timeout => &self.timeouts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            rejected_banned: self.rejected_banned.load(Ordering::Relaxed),
            rejected_capacity: self.rejected_capacity.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_dispatched: self.packets_dispatched.load(Ordering::Relaxed),
            handlers_invoked: self.handlers_invoked.load(Ordering::Relaxed),
            framing_faults: self.framing_faults.load(Ordering::Relaxed),
            payload_faults: self.payload_faults.load(Ordering::Relaxed),
            no_match: self.no_match.load(Ordering::Relaxed),
            handler_faults: self.handler_faults.load(Ordering::Relaxed),
            capacity_faults: self.capacity_faults.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            rejected_banned = snapshot.rejected_banned,
            rejected_capacity = snapshot.rejected_capacity,
            frames_received = snapshot.frames_received,
            frames_sent = snapshot.frames_sent,
            packets_dispatched = snapshot.packets_dispatched,
            framing_faults = snapshot.framing_faults,
            payload_faults = snapshot.payload_faults,
            handler_faults = snapshot.handler_faults,
            uptime_seconds = snapshot.uptime_seconds,
            "Server metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub rejected_banned: u64,
    pub rejected_capacity: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_dispatched: u64,
    pub handlers_invoked: u64,
    pub framing_faults: u64,
    pub payload_faults: u64,
    pub no_match: u64,
    pub handler_faults: u64,
    pub capacity_faults: u64,
    pub timeouts: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let metrics = Metrics::new();
        metrics.connection_established();
        metrics.connection_established();
        metrics.connection_closed();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_total, 2);
        assert_eq!(snap.connections_active, 1);
    }

    #[test]
    fn test_fault_counters() {
        let metrics = Metrics::new();
        metrics.fault(FaultKind::Payload);
        metrics.fault(FaultKind::Payload);
        metrics.fault(FaultKind::NoMatch);
        metrics.connection_over_capacity();

        let snap = metrics.snapshot();
        assert_eq!(snap.payload_faults, 2);
        assert_eq!(snap.no_match, 1);
        assert_eq!(snap.capacity_faults, 1);
        assert_eq!(snap.rejected_capacity, 1);
    }
}
