//! Queue monitor for tracking queue depth and health

use super::{QueueStats, WorkQueue};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Queue monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Monitoring interval
    pub interval: Duration,
    /// Warning threshold for pending keys
    pub pending_warning_threshold: usize,
    /// Warning threshold for keys backing off after failures
    pub backoff_warning_threshold: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pending_warning_threshold: 1000,
            backoff_warning_threshold: 100,
        }
    }
}

/// Queue monitor
pub struct QueueMonitor<K> {
    queue: Arc<WorkQueue<K>>,
    config: MonitorConfig,
}

impl<K> QueueMonitor<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a new queue monitor
    pub fn new(queue: Arc<WorkQueue<K>>) -> Self {
        Self::with_config(queue, MonitorConfig::default())
    }

    /// Create a new queue monitor with custom configuration
    pub fn with_config(queue: Arc<WorkQueue<K>>, config: MonitorConfig) -> Self {
        Self { queue, config }
    }

    /// Start monitoring until `shutdown` is cancelled
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut ticker = interval(self.config.interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check_health();
                    }
                }
            }
        })
    }

    /// Check queue health, returning the stats that were inspected
    pub fn check_health(&self) -> QueueStats {
        let stats = self.queue.stats();

        debug!(
            pending = stats.pending,
            processing = stats.processing,
            backing_off = stats.backing_off,
            total_added = stats.total_added,
            "Work queue status"
        );

        if stats.pending > self.config.pending_warning_threshold {
            warn!(
                "High number of pending keys: {} (threshold: {})",
                stats.pending, self.config.pending_warning_threshold
            );
        }

        if stats.backing_off > self.config.backoff_warning_threshold {
            warn!(
                "High number of keys backing off: {} (threshold: {})",
                stats.backing_off, self.config.backoff_warning_threshold
            );
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_health_reports_stats() {
        let queue = Arc::new(WorkQueue::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
        ));
        queue.add("a".to_string());
        queue.add("b".to_string());

        let monitor = QueueMonitor::with_config(
            Arc::clone(&queue),
            MonitorConfig {
                interval: Duration::from_millis(10),
                pending_warning_threshold: 1,
                backoff_warning_threshold: 1,
            },
        );
        let stats = monitor.check_health();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_cancel() {
        let queue: Arc<WorkQueue<String>> = Arc::new(WorkQueue::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
        ));
        let shutdown = CancellationToken::new();
        let handle = QueueMonitor::with_config(
            queue,
            MonitorConfig {
                interval: Duration::from_millis(5),
                ..Default::default()
            },
        )
        .start(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
