//! Concurrency Tracker
//!
//! Per-provider in-flight counters. A slot is claimed with a single
//! compare-and-increment so concurrent callers can never push a provider past
//! `max_concurrent`, and handed out as a [`Reservation`] guard whose `Drop`
//! gives it back. Every exit path of the holder (return, `?`, panic, task
//! abort, dropped stream) therefore releases exactly once.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::registry::ProviderRegistry;

// ============================================================================
// Load State
// ============================================================================

/// Counters for one provider
struct ProviderLoad {
    current: AtomicU32,
    max_concurrent: u32,
    total_reservations: AtomicU64,
    total_releases: AtomicU64,
    peak: AtomicU32,
}

impl ProviderLoad {
    fn new(max_concurrent: u32) -> Self {
        Self {
            current: AtomicU32::new(0),
            max_concurrent: max_concurrent.max(1),
            total_reservations: AtomicU64::new(0),
            total_releases: AtomicU64::new(0),
            peak: AtomicU32::new(0),
        }
    }
}

/// Point-in-time view of a provider's load
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LoadSnapshot {
    /// Requests currently holding a slot
    pub current_requests: u32,
    /// Capacity
    pub max_concurrent: u32,
}

impl LoadSnapshot {
    /// Whether no slot is free
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.current_requests >= self.max_concurrent
    }
}

/// Lifetime counters for a provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    /// Successful reservations
    pub total_reservations: u64,
    /// Releases
    pub total_releases: u64,
    /// Highest observed `current_requests`
    pub peak: u32,
}

// ============================================================================
// Concurrency Tracker
// ============================================================================

/// Per-provider capacity enforcement
///
/// The provider set is fixed at construction; only the counters move.
pub struct ConcurrencyTracker {
    loads: HashMap<String, ProviderLoad>,
    /// Fired after every release so admission waiters can re-evaluate
    released: Notify,
}

impl ConcurrencyTracker {
    /// Create a tracker for every provider in the registry
    #[must_use]
    pub fn new(registry: &ProviderRegistry) -> Self {
        Self::with_capacities(
            registry
                .list_providers()
                .iter()
                .map(|p| (p.id.clone(), p.max_concurrent)),
        )
    }

    /// Create a tracker from `(provider_id, max_concurrent)` pairs
    #[must_use]
    pub fn with_capacities(capacities: impl IntoIterator<Item = (String, u32)>) -> Self {
        Self {
            loads: capacities
                .into_iter()
                .map(|(id, max)| (id, ProviderLoad::new(max)))
                .collect(),
            released: Notify::new(),
        }
    }

    /// Claim one slot if `current_requests < max_concurrent`
    ///
    /// Check and increment are one atomic step. Returns false, without
    /// mutating anything, when the provider is saturated or unknown.
    pub fn try_reserve(&self, provider_id: &str) -> bool {
        let Some(load) = self.loads.get(provider_id) else {
            tracing::warn!(provider = %provider_id, "Reservation attempted for unknown provider");
            return false;
        };

        let mut current = load.current.load(Ordering::Relaxed);
        loop {
            if current >= load.max_concurrent {
                return false;
            }

            match load.current.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    load.total_reservations.fetch_add(1, Ordering::Relaxed);
                    load.peak.fetch_max(current + 1, Ordering::Relaxed);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Give one slot back
    ///
    /// Releasing an idle provider is a bug elsewhere; the counter is clamped
    /// at zero and the event logged.
    pub fn release(&self, provider_id: &str) {
        let Some(load) = self.loads.get(provider_id) else {
            tracing::error!(provider = %provider_id, "Release for unknown provider");
            return;
        };

        let mut current = load.current.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                tracing::error!(
                    provider = %provider_id,
                    "Release without matching reservation, load clamped at zero"
                );
                return;
            }

            match load.current.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        load.total_releases.fetch_add(1, Ordering::Relaxed);
        self.released.notify_waiters();
    }

    /// Claim a slot wrapped in a guard that releases on drop
    pub fn reserve(self: &Arc<Self>, provider_id: &str) -> Option<Reservation> {
        self.try_reserve(provider_id).then(|| Reservation {
            tracker: Arc::clone(self),
            provider_id: provider_id.to_string(),
        })
    }

    /// Future that resolves on the next release of any provider
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    /// Current load of a provider
    #[must_use]
    pub fn snapshot(&self, provider_id: &str) -> Option<LoadSnapshot> {
        self.loads.get(provider_id).map(|load| LoadSnapshot {
            current_requests: load.current.load(Ordering::Acquire),
            max_concurrent: load.max_concurrent,
        })
    }

    /// Current requests for a provider (0 for unknown ids)
    #[must_use]
    pub fn current_requests(&self, provider_id: &str) -> u32 {
        self.snapshot(provider_id)
            .map_or(0, |s| s.current_requests)
    }

    /// Lifetime counters for a provider
    #[must_use]
    pub fn stats(&self, provider_id: &str) -> Option<LoadStats> {
        self.loads.get(provider_id).map(|load| LoadStats {
            total_reservations: load.total_reservations.load(Ordering::Relaxed),
            total_releases: load.total_releases.load(Ordering::Relaxed),
            peak: load.peak.load(Ordering::Relaxed),
        })
    }
}

impl fmt::Debug for ConcurrencyTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (id, load) in &self.loads {
            map.entry(
                id,
                &format_args!(
                    "{}/{}",
                    load.current.load(Ordering::Relaxed),
                    load.max_concurrent
                ),
            );
        }
        map.finish()
    }
}

// ============================================================================
// Reservation Guard
// ============================================================================

/// One claimed slot on a provider (RAII guard)
///
/// Dropping the guard releases the slot.
#[must_use = "dropping a reservation releases the slot immediately"]
pub struct Reservation {
    tracker: Arc<ConcurrencyTracker>,
    provider_id: String,
}

impl Reservation {
    /// Provider this slot belongs to
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.tracker.release(&self.provider_id);
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("provider_id", &self.provider_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Barrier;
    use tokio::task::JoinSet;

    fn tracker(max: u32) -> Arc<ConcurrencyTracker> {
        Arc::new(ConcurrencyTracker::with_capacities([("gpu".to_string(), max)]))
    }

    #[test]
    fn test_reserve_until_saturated() {
        let tracker = tracker(2);

        assert!(tracker.try_reserve("gpu"));
        assert!(tracker.try_reserve("gpu"));
        assert!(!tracker.try_reserve("gpu"));
        assert_eq!(
            tracker.snapshot("gpu"),
            Some(LoadSnapshot {
                current_requests: 2,
                max_concurrent: 2
            })
        );

        tracker.release("gpu");
        assert_eq!(tracker.current_requests("gpu"), 1);
        assert!(tracker.try_reserve("gpu"));
    }

    #[test]
    fn test_release_clamps_at_zero() {
        let tracker = tracker(1);
        tracker.release("gpu");
        tracker.release("gpu");
        assert_eq!(tracker.current_requests("gpu"), 0);
        assert!(tracker.try_reserve("gpu"));
        assert!(!tracker.try_reserve("gpu"));
    }

    #[test]
    fn test_unknown_provider() {
        let tracker = tracker(1);
        assert!(!tracker.try_reserve("missing"));
        tracker.release("missing");
        assert_eq!(tracker.snapshot("missing"), None);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let tracker = tracker(1);
        {
            let reservation = tracker.reserve("gpu").unwrap();
            assert_eq!(reservation.provider_id(), "gpu");
            assert!(tracker.reserve("gpu").is_none());
        }
        assert_eq!(tracker.current_requests("gpu"), 0);

        let stats = tracker.stats("gpu").unwrap();
        assert_eq!(stats.total_reservations, 1);
        assert_eq!(stats.total_releases, 1);
        assert_eq!(stats.peak, 1);
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let tracker = tracker(1);
        let inner = Arc::clone(&tracker);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _reservation = inner.reserve("gpu").unwrap();
            panic!("upstream exploded");
        }));

        assert!(result.is_err());
        assert_eq!(tracker.current_requests("gpu"), 0);
    }

    #[tokio::test]
    async fn test_guard_releases_on_task_abort() {
        let tracker = tracker(1);
        let holder = Arc::clone(&tracker);
        let (held_tx, held_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            let _reservation = holder.reserve("gpu").unwrap();
            let _ = held_tx.send(());
            std::future::pending::<()>().await;
        });

        held_rx.await.unwrap();
        assert_eq!(tracker.current_requests("gpu"), 1);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(tracker.current_requests("gpu"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_exceed_capacity() {
        for (max, extra) in [(1_u32, 7_usize), (3, 5), (8, 24)] {
            let tracker = tracker(max);
            let attempts = max as usize + extra;
            let barrier = Arc::new(Barrier::new(attempts));
            let granted = Arc::new(AtomicUsize::new(0));
            let mut set = JoinSet::new();

            for _ in 0..attempts {
                let tracker = Arc::clone(&tracker);
                let barrier = Arc::clone(&barrier);
                let granted = Arc::clone(&granted);
                set.spawn(async move {
                    barrier.wait().await;
                    let ok = tracker.try_reserve("gpu");
                    if ok {
                        granted.fetch_add(1, Ordering::SeqCst);
                    }
                    ok
                });
            }

            let mut failed = 0;
            while let Some(result) = set.join_next().await {
                if !result.unwrap() {
                    failed += 1;
                }
            }

            assert_eq!(granted.load(Ordering::SeqCst), max as usize);
            assert_eq!(failed, extra);
            assert_eq!(tracker.current_requests("gpu"), max);
            assert_eq!(tracker.stats("gpu").unwrap().peak, max);
        }
    }

    #[tokio::test]
    async fn test_release_wakes_listeners() {
        let tracker = tracker(1);
        let reservation = tracker.reserve("gpu").unwrap();

        let notified = tracker.released();
        tokio::pin!(notified);
        notified.as_mut().enable();

        drop(reservation);
        tokio::time::timeout(std::time::Duration::from_secs(1), notified)
            .await
            .expect("release should notify");
    }
}
