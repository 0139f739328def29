//! `SettingsSnapshot`: a TTL-refreshed cache in front of
//! [`relay_core::collaborators::SettingsProvider`] (spec §7 redesign flag
//! "Global live settings read on every audit write").
//!
//! The original read `security.enable_audit_log` from a live settings
//! singleton on every single audit write; here the snapshot is refreshed at
//! most once per [`SettingsSnapshot::TTL`] and shared by every caller that
//! needs to know whether audit writes are currently enabled.

use std::sync::Arc;
use std::time::Duration;

use relay_core::collaborators::SettingsProvider;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Clone, Copy)]
struct Cached {
    enabled: bool,
    fetched_at: Instant,
}

pub struct SettingsSnapshot {
    provider: Arc<dyn SettingsProvider>,
    cached: Mutex<Option<Cached>>,
}

impl SettingsSnapshot {
    pub const TTL: Duration = Duration::from_secs(30);

    pub fn new(provider: Arc<dyn SettingsProvider>) -> Self {
        Self { provider, cached: Mutex::new(None) }
    }

    /// Whether audit writes are currently enabled, refreshing from the
    /// underlying provider at most once per [`Self::TTL`].
    pub async fn audit_log_enabled(&self) -> bool {
        let mut cached = self.cached.lock().await;
        let now = Instant::now();
        if let Some(entry) = *cached {
            if now.duration_since(entry.fetched_at) < Self::TTL {
                return entry.enabled;
            }
        }
        let enabled = self.provider.audit_log_enabled().await;
        *cached = Some(Cached { enabled, fetched_at: now });
        enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicBool, Ordering};

    struct CountingProvider {
        calls: AtomicU32,
        enabled: AtomicBool,
    }

    #[async_trait]
    impl SettingsProvider for CountingProvider {
        async fn audit_log_enabled(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.enabled.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn caches_within_ttl() {
        let provider = Arc::new(CountingProvider { calls: AtomicU32::new(0), enabled: AtomicBool::new(true) });
        let snapshot = SettingsSnapshot::new(provider.clone());

        assert!(snapshot.audit_log_enabled().await);
        assert!(snapshot.audit_log_enabled().await);
        assert!(snapshot.audit_log_enabled().await);

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refreshes_after_ttl_elapses() {
        tokio::time::pause();
        let provider = Arc::new(CountingProvider { calls: AtomicU32::new(0), enabled: AtomicBool::new(true) });
        let snapshot = SettingsSnapshot::new(provider.clone());

        assert!(snapshot.audit_log_enabled().await);
        provider.enabled.store(false, Ordering::SeqCst);
        tokio::time::advance(SettingsSnapshot::TTL + Duration::from_millis(1)).await;

        assert!(!snapshot.audit_log_enabled().await);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}
