use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Sliding window used for the publish rate
const RATE_WINDOW_MS: i64 = 5000;

/// Tracks delivery metrics for the local event bus
#[derive(Clone)]
pub struct DeliveryMetrics {
    /// Total values published (lifetime counter)
    published: Arc<AtomicU64>,

    /// Listener invocations
    deliveries: Arc<AtomicU64>,

    /// Listener invocations that returned an error
    failures: Arc<AtomicU64>,

    /// Publish timestamps for rate calculation (sliding 5-second window)
    publish_timestamps: Arc<RwLock<VecDeque<i64>>>,
}

impl DeliveryMetrics {
    pub fn new() -> Self {
        Self {
            published: Arc::new(AtomicU64::new(0)),
            deliveries: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
            publish_timestamps: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    /// Record a publish (call from LocalManagement before fan-out)
    pub fn record_publish(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);

        let now = Utc::now().timestamp_millis();
        let mut timestamps = self
            .publish_timestamps
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        timestamps.push_back(now);

        // Prune old timestamps (keep last 5 seconds)
        while let Some(&oldest) = timestamps.front() {
            if now - oldest > RATE_WINDOW_MS {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_delivery(&self, failed: bool) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Publishes per second over the last 5 seconds
    pub fn publish_rate(&self) -> f64 {
        let timestamps = self
            .publish_timestamps
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        timestamps.len() as f64 / (RATE_WINDOW_MS as f64 / 1000.0)
    }

    pub fn snapshot(&self, active_subscriptions: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            publish_rate: self.publish_rate(),
            active_subscriptions,
        }
    }
}

impl Default for DeliveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of delivery metrics at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub deliveries: u64,
    pub failures: u64,
    pub publish_rate: f64,
    pub active_subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_publishes_and_deliveries() {
        let metrics = DeliveryMetrics::new();
        metrics.record_publish();
        metrics.record_publish();
        metrics.record_delivery(false);
        metrics.record_delivery(true);

        let snapshot = metrics.snapshot(3);
        assert_eq!(snapshot.published, 2);
        assert_eq!(snapshot.deliveries, 2);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.active_subscriptions, 3);
        assert!(snapshot.publish_rate > 0.0);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = DeliveryMetrics::new();
        let clone = metrics.clone();
        clone.record_publish();
        assert_eq!(metrics.snapshot(0).published, 1);
    }
}
