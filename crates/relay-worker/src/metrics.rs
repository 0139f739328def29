//! Per-worker-pool counters the Performance Monitor (C7) samples (spec
//! §4.7: `avg_processing_ms over the last 100 completed items`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

const PROCESSING_MS_WINDOW: usize = 100;

#[derive(Default)]
pub struct WorkerMetrics {
    completed: AtomicU64,
    failed: AtomicU64,
    recent_processing_ms: Mutex<VecDeque<u64>>,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_completed(&self, processing_ms: u64) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.push_processing_ms(processing_ms);
    }

    pub fn record_failed(&self, _processing_ms: u64) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn push_processing_ms(&self, processing_ms: u64) {
        if let Ok(mut recent) = self.recent_processing_ms.try_lock() {
            if recent.len() >= PROCESSING_MS_WINDOW {
                recent.pop_front();
            }
            recent.push_back(processing_ms);
        }
    }

    pub fn completed_total(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed_total(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Average of the last (up to) 100 completed processing durations, or
    /// `None` if nothing has completed yet.
    pub async fn avg_processing_ms(&self) -> Option<f64> {
        let recent = self.recent_processing_ms.lock().await;
        if recent.is_empty() {
            return None;
        }
        Some(recent.iter().sum::<u64>() as f64 / recent.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn averages_recorded_durations() {
        let metrics = WorkerMetrics::new();
        metrics.record_completed(100);
        metrics.record_completed(200);
        assert_eq!(metrics.avg_processing_ms().await, Some(150.0));
        assert_eq!(metrics.completed_total(), 2);
    }

    #[tokio::test]
    async fn window_caps_at_100_entries() {
        let metrics = WorkerMetrics::new();
        for i in 0..150 {
            metrics.record_completed(i);
        }
        let avg = metrics.avg_processing_ms().await.unwrap();
        let expected: f64 = (50..150).sum::<u64>() as f64 / 100.0;
        assert_eq!(avg, expected);
    }
}
