//! Connection Metrics
//!
//! Per-connection counters for delivery, reliability and backpressure.
//! Uses atomic counters so the driver thread and sending threads can record
//! without sharing a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug)]
pub struct Metrics {
    /// Messages handed to the transport (first transmissions only)
    pub messages_sent: AtomicU64,
    /// Messages decoded and dispatched to listeners
    pub messages_received: AtomicU64,
    /// Certified messages acknowledged by the peer
    pub messages_certified: AtomicU64,
    /// Certified messages that exhausted their retry budget
    pub messages_failed: AtomicU64,
    /// Retransmissions of certified messages
    pub retransmits: AtomicU64,
    /// Sends rejected because the outbound queue was full
    pub queue_full_rejections: AtomicU64,
    /// Duplicate certified deliveries dropped
    pub duplicates_dropped: AtomicU64,
    /// Bodies that failed to decode
    pub conversion_errors: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_certified: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            retransmits: AtomicU64::new(0),
            queue_full_rejections: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            conversion_errors: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_certified(&self) {
        self.messages_certified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retransmit(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_full(&self) {
        self.queue_full_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_dropped(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conversion_error(&self) {
        self.conversion_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_out(&self, count: usize) {
        self.bytes_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_in(&self, count: usize) {
        self.bytes_received.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_certified: self.messages_certified.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            queue_full_rejections: self.queue_full_rejections.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            conversion_errors: self.conversion_errors.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self, peer_id: u16) {
        let s = self.snapshot();
        info!(
            peer_id,
            messages_sent = s.messages_sent,
            messages_received = s.messages_received,
            messages_certified = s.messages_certified,
            messages_failed = s.messages_failed,
            retransmits = s.retransmits,
            queue_full_rejections = s.queue_full_rejections,
            duplicates_dropped = s.duplicates_dropped,
            conversion_errors = s.conversion_errors,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            uptime_seconds = s.uptime_seconds,
            "Connection metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_certified: u64,
    pub messages_failed: u64,
    pub retransmits: u64,
    pub queue_full_rejections: u64,
    pub duplicates_dropped: u64,
    pub conversion_errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
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
            duration_us = self.start.elapsed().as_micros() as u64,
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.message_sent();
        metrics.message_sent();
        metrics.retransmit();
        metrics.bytes_out(128);
        let s = metrics.snapshot();
        assert_eq!(s.messages_sent, 2);
        assert_eq!(s.retransmits, 1);
        assert_eq!(s.bytes_sent, 128);
        assert_eq!(s.messages_failed, 0);
    }
}
