//! Dynamically registered stats providers and the bounded refresh rendezvous.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::export::health::HealthMetrics;
use crate::stats::snapshot::Snapshot;

/// External source of counters the kernel path cannot see.
///
/// Providers report cumulative counters through their [`ProviderHandle`],
/// usually in response to [`StatsProvider::request_stats_update`].
pub trait StatsProvider: Send + Sync {
    /// Asks the provider to report fresh counters tagged with `token`.
    fn request_stats_update(&self, token: u64);

    /// Sets the global alert threshold in bytes.
    fn set_alert(&self, _bytes: i64) {}

    /// Sets warning and limit thresholds for one interface.
    fn set_warning_and_limit(&self, _iface: &str, _warning: i64, _limit: i64) {}
}

/// Threshold callbacks raised by providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    AlertReached { tag: String },
    WarningOrLimitReached { tag: String },
}

/// Receives warning/limit callbacks forwarded from providers.
pub trait PolicyListener: Send + Sync {
    fn on_warning_or_limit_reached(&self, tag: &str);
}

struct ProviderEntry {
    tag: String,
    provider: Arc<dyn StatsProvider>,
    iface: Snapshot,
    uid: Snapshot,
}

struct Round {
    token: u64,
    permits: Arc<Semaphore>,
    awaiting: HashSet<u64>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    next_token: u64,
    providers: BTreeMap<u64, ProviderEntry>,
    round: Option<Round>,
    retired_iface: Snapshot,
    retired_uid: Snapshot,
}

impl Inner {
    /// Releases the permit `id` owes the current round, if any.
    fn release(&mut self, id: u64) {
        if let Some(round) = self.round.as_mut() {
            if round.awaiting.remove(&id) {
                round.permits.add_permits(1);
            }
        }
    }
}

pub struct ProviderRegistry {
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<ProviderEvent>,
    health: Arc<HealthMetrics>,
}

impl ProviderRegistry {
    /// Creates the registry and the receiver for provider threshold events.
    pub fn new(health: Arc<HealthMetrics>) -> (Arc<Self>, mpsc::UnboundedReceiver<ProviderEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            events,
            health,
        });
        (registry, rx)
    }

    /// Adds a provider. It stays registered until the handle is unregistered
    /// or dropped.
    pub fn register(
        self: &Arc<Self>,
        tag: impl Into<String>,
        provider: Arc<dyn StatsProvider>,
    ) -> ProviderHandle {
        let tag = tag.into();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.providers.insert(
            id,
            ProviderEntry {
                tag: tag.clone(),
                provider,
                iface: Snapshot::default(),
                uid: Snapshot::default(),
            },
        );
        self.health
            .providers_registered
            .set(inner.providers.len() as f64);
        info!(tag = %tag, id, "registered stats provider");

        ProviderHandle {
            id,
            tag,
            registry: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Asks every provider to refresh and waits up to `timeout` for all of
    /// them to answer. Returns false if the wait timed out.
    ///
    /// Answers arriving after the deadline still update the provider's cache
    /// and are picked up by the next poll.
    pub async fn refresh(&self, timeout: Duration) -> bool {
        let (token, permits, targets) = {
            let mut inner = self.inner.lock();
            inner.next_token += 1;
            let token = inner.next_token;
            let permits = Arc::new(Semaphore::new(0));
            let targets: Vec<Arc<dyn StatsProvider>> = inner
                .providers
                .values()
                .map(|e| Arc::clone(&e.provider))
                .collect();
            let awaiting = inner.providers.keys().copied().collect();
            inner.round = Some(Round {
                token,
                permits: Arc::clone(&permits),
                awaiting,
            });
            (token, permits, targets)
        };

        let expected = u32::try_from(targets.len()).unwrap_or(u32::MAX);
        for provider in &targets {
            provider.request_stats_update(token);
        }

        let answered = expected == 0
            || matches!(
                tokio::time::timeout(timeout, permits.acquire_many(expected)).await,
                Ok(Ok(_))
            );
        if !answered {
            warn!(token, expected, "provider refresh timed out");
        }

        let mut inner = self.inner.lock();
        if inner.round.as_ref().is_some_and(|r| r.token == token) {
            inner.round = None;
        }
        answered
    }

    /// Cumulative interface counters of all providers, including those that
    /// have unregistered.
    pub fn iface_snapshot(&self, now: i64) -> Snapshot {
        let inner = self.inner.lock();
        let mut out = Snapshot::new(now);
        out.combine(&inner.retired_iface);
        for entry in inner.providers.values() {
            out.combine(&entry.iface);
        }
        out
    }

    /// Cumulative per-uid counters of all providers, including those that
    /// have unregistered.
    pub fn uid_snapshot(&self, now: i64) -> Snapshot {
        let inner = self.inner.lock();
        let mut out = Snapshot::new(now);
        out.combine(&inner.retired_uid);
        for entry in inner.providers.values() {
            out.combine(&entry.uid);
        }
        out
    }

    fn providers(&self) -> Vec<Arc<dyn StatsProvider>> {
        self.inner
            .lock()
            .providers
            .values()
            .map(|e| Arc::clone(&e.provider))
            .collect()
    }

    pub fn set_alert(&self, bytes: i64) {
        for provider in self.providers() {
            provider.set_alert(bytes);
        }
    }

    pub fn set_warning_and_limit(&self, iface: &str, warning: i64, limit: i64) {
        for provider in self.providers() {
            provider.set_warning_and_limit(iface, warning, limit);
        }
    }

    fn update(&self, id: u64, token: u64, iface: Snapshot, uid: Snapshot) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.providers.get_mut(&id) else {
            debug!(id, "stats update from unregistered provider ignored");
            return;
        };
        entry.iface = iface;
        entry.uid = uid;
        if inner.round.as_ref().is_some_and(|r| r.token == token) {
            inner.release(id);
        }
    }

    fn unregister(&self, id: u64) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.providers.remove(&id) else {
            return;
        };
        // Keep the last cumulative values so combined totals never go backwards.
        inner.retired_iface.combine(&entry.iface);
        inner.retired_uid.combine(&entry.uid);
        inner.release(id);
        self.health
            .providers_registered
            .set(inner.providers.len() as f64);
        info!(tag = %entry.tag, id, "unregistered stats provider");
    }

    fn send(&self, event: ProviderEvent) {
        if self.events.send(event).is_err() {
            debug!("provider event receiver closed");
        }
    }
}

/// Registration of one provider. Dropping it unregisters the provider.
pub struct ProviderHandle {
    id: u64,
    tag: String,
    registry: Arc<ProviderRegistry>,
}

impl ProviderHandle {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Stores the provider's cumulative counters. A matching `token` also
    /// completes its part of the current refresh round.
    pub fn notify_stats_updated(&self, token: u64, iface: Snapshot, uid: Snapshot) {
        self.registry.update(self.id, token, iface, uid);
    }

    pub fn notify_alert_reached(&self) {
        self.registry.send(ProviderEvent::AlertReached {
            tag: self.tag.clone(),
        });
    }

    pub fn notify_warning_or_limit_reached(&self) {
        self.registry.send(ProviderEvent::WarningOrLimitReached {
            tag: self.tag.clone(),
        });
    }

    /// Removes the provider. Safe to call more than once.
    pub fn unregister(&self) {
        self.registry.unregister(self.id);
    }
}

impl Drop for ProviderHandle {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::snapshot::EntryKey;
    use crate::stats::Counters;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct RecordingProvider {
        last_token: AtomicU64,
        alerts: Mutex<Vec<i64>>,
    }

    impl StatsProvider for RecordingProvider {
        fn request_stats_update(&self, token: u64) {
            self.last_token.store(token, Ordering::SeqCst);
        }

        fn set_alert(&self, bytes: i64) {
            self.alerts.lock().push(bytes);
        }
    }

    fn registry() -> (Arc<ProviderRegistry>, mpsc::UnboundedReceiver<ProviderEvent>) {
        ProviderRegistry::new(Arc::new(HealthMetrics::detached().expect("metrics")))
    }

    fn iface_stats(rx: i64) -> Snapshot {
        Snapshot::new(0).with(EntryKey::iface("tun0"), Counters::bytes(rx, 0))
    }

    #[tokio::test]
    async fn test_refresh_without_providers_completes() {
        let (registry, _rx) = registry();
        assert!(registry.refresh(Duration::from_millis(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_times_out_when_provider_is_silent() {
        let (registry, _rx) = registry();
        let provider = Arc::new(RecordingProvider::default());
        let _handle = registry.register("vpn", provider.clone());

        assert!(!registry.refresh(Duration::from_millis(100)).await);
        assert_eq!(provider.last_token.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_completes_when_provider_answers() {
        let (registry, _rx) = registry();
        let provider = Arc::new(RecordingProvider::default());
        let handle = registry.register("vpn", provider.clone());

        let refresh = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.refresh(Duration::from_secs(5)).await })
        };
        while provider.last_token.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let token = provider.last_token.load(Ordering::SeqCst);
        handle.notify_stats_updated(token, iface_stats(10), Snapshot::default());

        assert!(refresh.await.expect("join"));
        assert_eq!(registry.iface_snapshot(0).total().rx_bytes, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_answer_updates_cache() {
        let (registry, _rx) = registry();
        let provider = Arc::new(RecordingProvider::default());
        let handle = registry.register("vpn", provider.clone());

        assert!(!registry.refresh(Duration::from_millis(100)).await);
        handle.notify_stats_updated(1, iface_stats(42), Snapshot::default());
        assert_eq!(registry.iface_snapshot(0).total().rx_bytes, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_mid_round_releases_permit() {
        let (registry, _rx) = registry();
        let provider = Arc::new(RecordingProvider::default());
        let handle = registry.register("vpn", provider.clone());

        let refresh = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.refresh(Duration::from_secs(60)).await })
        };
        while provider.last_token.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        drop(handle);

        assert!(refresh.await.expect("join"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_keeps_cumulative_totals() {
        let (registry, _rx) = registry();
        let handle = registry.register("vpn", Arc::new(RecordingProvider::default()));
        handle.notify_stats_updated(0, iface_stats(100), Snapshot::default());

        handle.unregister();
        handle.unregister();
        assert_eq!(registry.iface_snapshot(0).total().rx_bytes, 100);

        let second = registry.register("vpn2", Arc::new(RecordingProvider::default()));
        second.notify_stats_updated(0, iface_stats(5), Snapshot::default());
        assert_eq!(registry.iface_snapshot(0).total().rx_bytes, 105);
    }

    #[test]
    fn test_events_and_alerts_are_forwarded() {
        let (registry, mut rx) = registry();
        let provider = Arc::new(RecordingProvider::default());
        let handle = registry.register("vpn", provider.clone());

        handle.notify_alert_reached();
        handle.notify_warning_or_limit_reached();
        assert_eq!(
            rx.try_recv().expect("alert"),
            ProviderEvent::AlertReached {
                tag: "vpn".to_string()
            }
        );
        assert_eq!(
            rx.try_recv().expect("limit"),
            ProviderEvent::WarningOrLimitReached {
                tag: "vpn".to_string()
            }
        );

        registry.set_alert(2048);
        assert_eq!(*provider.alerts.lock(), vec![2048]);
    }
}
