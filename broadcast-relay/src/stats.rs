use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide relay counters. Cheap to update from any task.
#[derive(Debug, Default)]
pub struct RelayStats {
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
    current_connections: AtomicU64,
    peak_connections: AtomicU64,
    messages_received: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    slow_consumers_disconnected: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`], suitable for logging as JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub current_connections: u64,
    pub peak_connections: u64,
    pub messages_received: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub slow_consumers_disconnected: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connected(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        let current = self.current_connections.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_connections.fetch_max(current, Ordering::Relaxed);
    }

    pub fn record_disconnected(&self) {
        // Saturating; never wraps below zero.
        let _ = self
            .current_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, frames: u64) {
        self.frames_delivered.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow_consumer_disconnected(&self) {
        self.slow_consumers_disconnected
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            current_connections: self.current_connections.load(Ordering::Relaxed),
            peak_connections: self.peak_connections.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            slow_consumers_disconnected: self.slow_consumers_disconnected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracks_highest_concurrency() {
        let stats = RelayStats::new();
        stats.record_connected();
        stats.record_connected();
        stats.record_disconnected();
        stats.record_connected();
        stats.record_disconnected();
        stats.record_disconnected();
        stats.record_disconnected();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_connections, 3);
        assert_eq!(snapshot.peak_connections, 2);
        assert_eq!(snapshot.current_connections, 0);
    }

    #[test]
    fn snapshot_serializes_as_flat_json() {
        let stats = RelayStats::new();
        stats.record_message();
        stats.record_delivered(3);

        let json = serde_json::to_value(stats.snapshot()).expect("serialize snapshot");
        assert_eq!(json["messages_received"], 1);
        assert_eq!(json["frames_delivered"], 3);
    }
}
