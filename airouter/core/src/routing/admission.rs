//! Admission Queue
//!
//! Bounded in-memory wait for requests that found every candidate saturated.
//! Waiters are kept sorted by priority (agent before user) and arrival, and
//! freed slots are handed to them in that order: [`AdmissionQueue::pump`]
//! reserves on behalf of the first waiter that can use a provider and passes
//! the [`Reservation`] through a oneshot channel. New arrivals check
//! [`AdmissionQueue::is_contended`] before reserving so they cannot overtake
//! a queued request of equal or higher priority.
//!
//! Waiters re-evaluate on every release (event-driven) and on a coarse poll
//! interval, whichever fires first. Nothing is persisted.

use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};

use super::concurrency::{ConcurrencyTracker, Reservation};
use super::health::HealthMonitor;
use super::policy::RequestPriority;
use crate::registry::RegistryHandle;

/// Admission failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    /// Deadline passed without a free slot
    #[error("No slot freed within {}ms", .waited.as_millis())]
    Timeout {
        /// Time spent waiting
        waited: Duration,
    },

    /// The queue dropped the waiter
    #[error("Admission queue closed")]
    Closed,
}

struct Waiter {
    seq: u64,
    priority: RequestPriority,
    candidates: Vec<String>,
    grant: oneshot::Sender<Reservation>,
}

impl Waiter {
    fn rank(&self) -> (Reverse<RequestPriority>, u64) {
        (Reverse(self.priority), self.seq)
    }
}

/// Priority-ordered wait for provider slots
pub struct AdmissionQueue {
    tracker: Arc<ConcurrencyTracker>,
    registry: RegistryHandle,
    health: Arc<HealthMonitor>,
    waiters: Mutex<Vec<Waiter>>,
    next_seq: AtomicU64,
    poll_interval: Duration,
}

impl AdmissionQueue {
    /// Create a queue over the shared tracker
    #[must_use]
    pub fn new(
        tracker: Arc<ConcurrencyTracker>,
        registry: RegistryHandle,
        health: Arc<HealthMonitor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            tracker,
            registry,
            health,
            waiters: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Number of queued requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Whether nobody is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Whether a queued request with at least `priority` is waiting for the
    /// provider
    #[must_use]
    pub fn is_contended(&self, provider_id: &str, priority: RequestPriority) -> bool {
        self.waiters
            .lock()
            .iter()
            .any(|w| w.priority >= priority && w.candidates.iter().any(|c| c == provider_id))
    }

    /// Wait until one of `candidates` can be reserved or `deadline` passes
    ///
    /// Candidates are tried in the given order each time the waiter is
    /// served. Dropping the returned future leaves the queue cleanly.
    ///
    /// # Errors
    ///
    /// [`AdmissionError::Timeout`] once the deadline passes.
    pub async fn wait(
        &self,
        priority: RequestPriority,
        candidates: Vec<String>,
        deadline: Instant,
    ) -> Result<Reservation, AdmissionError> {
        let started = Instant::now();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (grant, mut granted) = oneshot::channel();

        self.enqueue(Waiter {
            seq,
            priority,
            candidates,
            grant,
        });
        let _registration = Registration { queue: self, seq };

        tracing::debug!(seq, priority = priority.as_str(), queued = self.len(), "Request queued for admission");
        self.pump();

        match tokio::time::timeout_at(deadline, self.wait_for_grant(&mut granted)).await {
            Ok(Some(reservation)) => Ok(reservation),
            Ok(None) => Err(AdmissionError::Closed),
            Err(_) => {
                self.remove(seq);
                // A grant may have landed between the deadline and removal
                granted.try_recv().map_err(|_| AdmissionError::Timeout {
                    waited: started.elapsed(),
                })
            }
        }
    }

    async fn wait_for_grant(&self, granted: &mut oneshot::Receiver<Reservation>) -> Option<Reservation> {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let released = self.tracker.released();
            tokio::pin!(released);
            released.as_mut().enable();

            match granted.try_recv() {
                Ok(reservation) => return Some(reservation),
                Err(oneshot::error::TryRecvError::Closed) => return None,
                Err(oneshot::error::TryRecvError::Empty) => {}
            }

            tokio::select! {
                result = &mut *granted => return result.ok(),
                () = &mut released => {}
                _ = poll.tick() => {}
            }

            self.pump();
        }
    }

    /// Hand free slots to waiters in priority order
    pub fn pump(&self) {
        let mut waiters = self.waiters.lock();
        let mut i = 0;
        while i < waiters.len() {
            if waiters[i].grant.is_closed() {
                waiters.remove(i);
                continue;
            }

            let reservation = waiters[i]
                .candidates
                .iter()
                .filter(|id| self.registry.is_enabled(id) && self.health.is_provider_healthy(id))
                .find_map(|id| self.tracker.reserve(id));

            match reservation {
                Some(reservation) => {
                    let waiter = waiters.remove(i);
                    tracing::debug!(
                        seq = waiter.seq,
                        provider = %reservation.provider_id(),
                        "Admission slot granted"
                    );
                    // A receiver that vanished returns the slot on drop
                    let _ = waiter.grant.send(reservation);
                }
                None => i += 1,
            }
        }
    }

    fn enqueue(&self, waiter: Waiter) {
        let mut waiters = self.waiters.lock();
        let rank = waiter.rank();
        let pos = waiters.partition_point(|w| w.rank() <= rank);
        waiters.insert(pos, waiter);
    }

    fn remove(&self, seq: u64) {
        self.waiters.lock().retain(|w| w.seq != seq);
    }
}

impl std::fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("waiting", &self.len())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// Removes a waiter when its future completes or is dropped
struct Registration<'a> {
    queue: &'a AdmissionQueue,
    seq: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.queue.remove(self.seq);
    }
}
