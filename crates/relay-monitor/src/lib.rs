//! Performance Monitor (C7): a 30s sampler and a 5-minute snapshot emitter
//! over the Queue Broker and Worker Pool metrics (spec §4.7).

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_core::QueueName;
use relay_queue::{QueueBroker, QueueCounts};
use relay_worker::WorkerMetrics;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(30);
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub message: String,
}

/// Threshold defaults from spec §4.7 "Alerts are emitted when...".
#[derive(Debug, Clone, Copy)]
pub struct AlertThresholds {
    pub queue_depth_warn: u64,
    pub error_rate_crit: f64,
    pub processing_ms_warn: f64,
    pub memory_frac_warn: f64,
    pub jobs_per_sec_info: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            queue_depth_warn: 5_000,
            error_rate_crit: 0.05,
            processing_ms_warn: 10_000.0,
            memory_frac_warn: 0.80,
            jobs_per_sec_info: 50.0,
        }
    }
}

/// The 30-second sample and its derived rates (spec §4.7, first ticker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub queues: HashMap<String, QueueCounts>,
    pub jobs_per_second: f64,
    pub error_rate: f64,
    pub avg_processing_ms: Option<f64>,
    pub memory_heap_fraction: f64,
    pub cpu_fraction: f64,
}

struct PreviousSample {
    at: std::time::Instant,
    completed_plus_failed: u64,
}

/// Owns the sampling loop, the latest snapshot, and the `sysinfo::System`
/// handle used for memory/CPU sampling.
pub struct PerformanceMonitor {
    broker: Arc<dyn QueueBroker>,
    salesforce_metrics: Arc<WorkerMetrics>,
    thresholds: AlertThresholds,
    system: StdMutex<System>,
    previous: StdMutex<Option<PreviousSample>>,
    latest: RwLock<Option<MetricsSnapshot>>,
}

impl PerformanceMonitor {
    pub fn new(broker: Arc<dyn QueueBroker>, salesforce_metrics: Arc<WorkerMetrics>, thresholds: AlertThresholds) -> Arc<Self> {
        Arc::new(Self {
            broker,
            salesforce_metrics,
            thresholds,
            system: StdMutex::new(System::new_all()),
            previous: StdMutex::new(None),
            latest: RwLock::new(None),
        })
    }

    /// The most recent sample, if at least one tick has completed. Read by
    /// the admin HTTP surface's `GET /queue/monitor/metrics` handler.
    pub async fn latest_snapshot(&self) -> Option<MetricsSnapshot> {
        self.latest.read().await.clone()
    }

    /// Spawn the 30s sampler and 5-min snapshot-emission tickers.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let sampler = self.clone();
        let sampler_shutdown = shutdown.clone();
        let sample_handle = tokio::spawn(async move { sampler.run_sampler(sampler_shutdown).await });

        let emitter = self.clone();
        let emit_handle = tokio::spawn(async move { emitter.run_snapshot_emitter(shutdown).await });

        vec![sample_handle, emit_handle]
    }

    async fn run_sampler(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(SAMPLE_INTERVAL) => {}
            }
            self.sample_once().await;
        }
    }

    async fn run_snapshot_emitter(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(SNAPSHOT_INTERVAL) => {}
            }
            if let Some(snapshot) = self.latest_snapshot().await {
                tracing::info!(
                    jobs_per_second = snapshot.jobs_per_second,
                    error_rate = snapshot.error_rate,
                    avg_processing_ms = snapshot.avg_processing_ms,
                    memory_heap_fraction = snapshot.memory_heap_fraction,
                    cpu_fraction = snapshot.cpu_fraction,
                    "performance monitor: 5-minute metrics snapshot"
                );
            }
        }
    }

    /// One 30s sample: per-queue counts, derived rates, resource fractions,
    /// and any threshold-crossing alerts (spec §4.7).
    async fn sample_once(&self) {
        let mut queues = HashMap::new();
        let mut completed_plus_failed = 0u64;
        for queue in QueueName::ALL {
            match self.broker.counts(queue).await {
                Ok(counts) => {
                    completed_plus_failed += counts.completed + counts.failed;
                    queues.insert(queue.as_str().to_string(), counts);
                }
                Err(err) => {
                    tracing::error!(queue = %queue, error = %err, "performance monitor: failed to sample queue counts");
                }
            }
        }

        let now = std::time::Instant::now();
        let jobs_per_second = {
            let mut previous = self.previous.lock().unwrap();
            let rate = match previous.as_ref() {
                Some(prev) => {
                    let elapsed = now.duration_since(prev.at).as_secs_f64();
                    if elapsed > 0.0 {
                        (completed_plus_failed.saturating_sub(prev.completed_plus_failed)) as f64 / elapsed
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
            *previous = Some(PreviousSample { at: now, completed_plus_failed });
            rate
        };

        let (failed_total, denominator): (u64, u64) = queues.values().fold((0, 0), |(f, d), c| (f + c.failed, d + c.completed + c.failed));
        let error_rate = if denominator > 0 { failed_total as f64 / denominator as f64 } else { 0.0 };

        let avg_processing_ms = self.salesforce_metrics.avg_processing_ms().await;

        let (memory_heap_fraction, cpu_fraction) = {
            let mut system = self.system.lock().unwrap();
            system.refresh_memory();
            system.refresh_cpu_usage();
            let total = system.total_memory();
            let heap_fraction = if total > 0 { system.used_memory() as f64 / total as f64 } else { 0.0 };
            let cpu_fraction = system.global_cpu_usage() as f64 / 100.0;
            (heap_fraction, cpu_fraction)
        };

        let snapshot = MetricsSnapshot {
            sampled_at: Utc::now(),
            queues,
            jobs_per_second,
            error_rate,
            avg_processing_ms,
            memory_heap_fraction,
            cpu_fraction,
        };

        for alert in self.evaluate_alerts(&snapshot) {
            match alert.severity {
                AlertSeverity::Critical => tracing::error!(severity = alert.severity.as_str(), "{}", alert.message),
                AlertSeverity::Warning => tracing::warn!(severity = alert.severity.as_str(), "{}", alert.message),
                AlertSeverity::Info => tracing::info!(severity = alert.severity.as_str(), "{}", alert.message),
            }
        }

        *self.latest.write().await = Some(snapshot);
    }

    /// Threshold-crossing alerts for a given snapshot. Exposed so the admin
    /// HTTP surface's `GET /queue/monitor/alerts` can re-evaluate against the
    /// latest snapshot on demand, independent of the logging done in
    /// `sample_once`.
    pub fn evaluate_alerts(&self, snapshot: &MetricsSnapshot) -> Vec<Alert> {
        let mut alerts = Vec::new();

        for (queue, counts) in &snapshot.queues {
            let depth = counts.waiting + counts.active + counts.delayed;
            if depth > self.thresholds.queue_depth_warn {
                alerts.push(Alert { severity: AlertSeverity::Warning, message: format!("queue {queue} depth {depth} exceeds warning threshold") });
            }
        }

        if snapshot.error_rate > self.thresholds.error_rate_crit {
            alerts.push(Alert { severity: AlertSeverity::Critical, message: format!("error rate {:.3} exceeds critical threshold", snapshot.error_rate) });
        }

        if let Some(avg_ms) = snapshot.avg_processing_ms {
            if avg_ms > self.thresholds.processing_ms_warn {
                alerts.push(Alert { severity: AlertSeverity::Warning, message: format!("avg processing time {avg_ms:.0}ms exceeds warning threshold") });
            }
        }

        if snapshot.memory_heap_fraction > self.thresholds.memory_frac_warn {
            alerts.push(Alert {
                severity: AlertSeverity::Warning,
                message: format!("memory heap fraction {:.2} exceeds warning threshold", snapshot.memory_heap_fraction),
            });
        }

        if snapshot.jobs_per_second > self.thresholds.jobs_per_sec_info {
            alerts.push(Alert {
                severity: AlertSeverity::Info,
                message: format!("jobs_per_second {:.1} exceeds informational threshold", snapshot.jobs_per_second),
            });
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_queue::{EnqueueOptions, InMemoryQueueBroker};
    use serde_json::json;

    #[tokio::test]
    async fn sample_once_populates_a_snapshot_for_every_queue() {
        let broker: Arc<dyn QueueBroker> = Arc::new(InMemoryQueueBroker::new());
        broker.enqueue(QueueName::Email, "job", json!(null), EnqueueOptions::default()).await.unwrap();

        let metrics = Arc::new(WorkerMetrics::new());
        let monitor = PerformanceMonitor::new(broker, metrics, AlertThresholds::default());
        monitor.sample_once().await;

        let snapshot = monitor.latest_snapshot().await.unwrap();
        assert_eq!(snapshot.queues.len(), 3);
        assert_eq!(snapshot.queues.get("email").unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn error_rate_alert_fires_above_threshold() {
        let broker: Arc<dyn QueueBroker> = Arc::new(InMemoryQueueBroker::new());
        let id = broker.enqueue(QueueName::Email, "job", json!(null), EnqueueOptions::default()).await.unwrap();
        broker.reserve(QueueName::Email, "w1", 30_000).await.unwrap();
        broker.fail(QueueName::Email, &id, "boom").await.unwrap();

        let metrics = Arc::new(WorkerMetrics::new());
        let monitor = PerformanceMonitor::new(broker, metrics, AlertThresholds::default());
        monitor.sample_once().await;

        let snapshot = monitor.latest_snapshot().await.unwrap();
        assert_eq!(snapshot.error_rate, 1.0);
        let alerts = monitor.evaluate_alerts(&snapshot);
        assert!(alerts.iter().any(|a| matches!(a.severity, AlertSeverity::Critical)));
    }

    #[tokio::test]
    async fn jobs_per_second_is_zero_on_the_first_sample() {
        let broker: Arc<dyn QueueBroker> = Arc::new(InMemoryQueueBroker::new());
        let metrics = Arc::new(WorkerMetrics::new());
        let monitor = PerformanceMonitor::new(broker, metrics, AlertThresholds::default());
        monitor.sample_once().await;

        let snapshot = monitor.latest_snapshot().await.unwrap();
        assert_eq!(snapshot.jobs_per_second, 0.0);
    }
}
