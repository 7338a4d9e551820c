// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publisher Confirmation Tracking
//!
//! Every confirmed publish gets a strictly increasing sequence number and an
//! entry in the pending set. Broker acks and nacks retire entries one at a time
//! or, with `multiple`, everything up to and including a high-water mark.
//!
//! The tracker never retries anything: nack-ed payloads are handed back to the
//! caller, and timeouts report the sequences still outstanding.

use crate::{
    config::MAX_POLL_INTERVAL,
    errors::TrackerError,
    pending::{PendingEntry, PendingSet},
};
use bytes::Bytes;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};
use tracing::debug;

/// A broker confirmation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmOutcome {
    pub sequence: u64,
    /// Resolves every pending sequence `<= sequence` at once.
    pub multiple: bool,
    /// `true` for ack, `false` for nack.
    pub positive: bool,
}

impl ConfirmOutcome {
    pub fn ack(sequence: u64, multiple: bool) -> Self {
        ConfirmOutcome {
            sequence,
            multiple,
            positive: true,
        }
    }

    pub fn nack(sequence: u64, multiple: bool) -> Self {
        ConfirmOutcome {
            sequence,
            multiple,
            positive: false,
        }
    }
}

/// What a single [`ConfirmTracker::resolve`] call retired.
#[derive(Debug, Clone)]
pub struct Resolution<P> {
    pub outcome: ConfirmOutcome,
    /// Sequences removed by this outcome, ascending.
    pub resolved: Vec<u64>,
    /// Payloads of the removed entries, only filled for nacks.
    pub nacked: Vec<(u64, P)>,
}

impl<P> Resolution<P> {
    /// `true` when the outcome matched nothing still pending.
    pub fn is_stale(&self) -> bool {
        self.resolved.is_empty()
    }
}

// What became of a watched sequence that left the pending set without an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Nacked,
    Abandoned,
}

struct State<P> {
    pending: PendingSet<u64, P>,
    // Sequences whose outcome a waiter will collect.
    watched: BTreeSet<u64>,
    verdicts: BTreeMap<u64, Verdict>,
}

impl<P> State<P> {
    fn settle(&mut self, sequence: u64, verdict: Verdict) {
        if self.watched.contains(&sequence) {
            self.verdicts.insert(sequence, verdict);
        }
    }

    fn unwatch(&mut self, sequences: &[u64]) {
        for sequence in sequences {
            self.watched.remove(sequence);
            self.verdicts.remove(sequence);
        }
    }
}

/// Tracks published messages until the broker confirms them.
pub struct ConfirmTracker<P = Bytes> {
    last_sequence: AtomicU64,
    state: Mutex<State<P>>,
    changed: Notify,
    poll_interval: Duration,
}

impl<P> Default for ConfirmTracker<P> {
    fn default() -> Self {
        Self::new(MAX_POLL_INTERVAL)
    }
}

impl<P> ConfirmTracker<P> {
    /// Creates an empty tracker.
    ///
    /// `poll_interval` bounds how long a wait sleeps between two checks of the
    /// pending set; it is clamped to at most 100ms.
    pub fn new(poll_interval: Duration) -> Self {
        ConfirmTracker {
            last_sequence: AtomicU64::new(0),
            state: Mutex::new(State {
                pending: PendingSet::new(),
                watched: BTreeSet::new(),
                verdicts: BTreeMap::new(),
            }),
            changed: Notify::new(),
            poll_interval: poll_interval.clamp(Duration::from_millis(1), MAX_POLL_INTERVAL),
        }
    }

    /// Returns a fresh sequence number. The first one is 1, like AMQP delivery tags.
    pub fn next_sequence(&self) -> u64 {
        self.last_sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Records a publish as awaiting confirmation.
    ///
    /// Its outcome is only reported through [`Resolution`]s; use
    /// [`register_watched`](Self::register_watched) when a caller will
    /// [`wait_for`](Self::wait_for) it.
    pub fn register(&self, sequence: u64, payload: P) -> Result<(), TrackerError> {
        self.lock().pending.insert(sequence, payload)
    }

    /// Records a publish whose nack or loss is kept for a later `wait_for`.
    pub fn register_watched(&self, sequence: u64, payload: P) -> Result<(), TrackerError> {
        let mut state = self.lock();
        state.pending.insert(sequence, payload)?;
        state.watched.insert(sequence);
        Ok(())
    }

    /// Removes an entry without resolving it, e.g. when the send itself failed.
    pub fn forget(&self, sequence: u64) -> Option<P> {
        let removed = {
            let mut state = self.lock();
            state.unwatch(&[sequence]);
            state.pending.remove(&sequence)
        };
        if removed.is_some() {
            self.changed.notify_waiters();
        }
        removed.map(|entry| entry.payload)
    }

    /// Applies a broker confirmation.
    ///
    /// Resolving sequences that are no longer pending is a no-op and yields an
    /// empty (stale) resolution.
    pub fn resolve(&self, outcome: ConfirmOutcome) -> Resolution<P> {
        let removed: Vec<(u64, PendingEntry<P>)> = {
            let mut state = self.lock();
            let removed = if outcome.multiple {
                state.pending.remove_up_to(&outcome.sequence)
            } else {
                state
                    .pending
                    .remove(&outcome.sequence)
                    .map(|entry| vec![(outcome.sequence, entry)])
                    .unwrap_or_default()
            };

            if !outcome.positive {
                for (seq, _) in &removed {
                    state.settle(*seq, Verdict::Nacked);
                }
            }
            removed
        };

        if removed.is_empty() {
            debug!(
                sequence = outcome.sequence,
                multiple = outcome.multiple,
                "stale confirmation ignored"
            );
        } else {
            self.changed.notify_waiters();
        }

        let resolved = removed.iter().map(|(seq, _)| *seq).collect();
        let nacked = if outcome.positive {
            vec![]
        } else {
            removed
                .into_iter()
                .map(|(seq, entry)| (seq, entry.payload))
                .collect()
        };

        Resolution {
            outcome,
            resolved,
            nacked,
        }
    }

    /// Waits until nothing is pending or `timeout` elapses.
    ///
    /// The wait is woken on every removal and re-checks the set at least once
    /// per poll interval. Entries still pending on timeout are left in place.
    /// A timeout too large to represent waits without a deadline.
    pub async fn await_drain(&self, timeout: Duration) -> bool {
        self.wait_while(timeout, |state| !state.pending.is_empty()).await
    }

    /// Waits for every pending entry to be confirmed.
    ///
    /// Fails with `ConfirmTimeout` listing the outstanding sequences if the set
    /// did not drain in time. Individual nacks are reported by `resolve`.
    pub async fn wait_for_confirms(&self, timeout: Duration) -> Result<(), TrackerError> {
        if self.await_drain(timeout).await {
            return Ok(());
        }

        Err(TrackerError::ConfirmTimeout {
            outstanding: self.outstanding(),
            timeout,
        })
    }

    /// Waits for the outcome of `sequences`, registered with `register_watched`.
    ///
    /// Only these sequences are examined; nacks of other publishes stay with
    /// their own waiters. Whatever happens, the sequences stop being watched
    /// once this returns or is dropped.
    ///
    /// # Returns
    /// * `ConfirmTimeout` with the sequences still pending, or evicted unconfirmed
    /// * `Nacked` with the sequences the broker rejected
    pub async fn wait_for(
        &self,
        sequences: &[u64],
        timeout: Duration,
    ) -> Result<(), TrackerError> {
        let _watch = Watch {
            tracker: self,
            sequences,
        };

        self.wait_while(timeout, |state| {
            sequences.iter().any(|seq| state.pending.contains(seq))
        })
        .await;

        let (outstanding, nacked) = {
            let state = self.lock();
            let mut outstanding = vec![];
            let mut nacked = vec![];
            for seq in sequences {
                match state.verdicts.get(seq) {
                    Some(Verdict::Nacked) => nacked.push(*seq),
                    Some(Verdict::Abandoned) => outstanding.push(*seq),
                    None if state.pending.contains(seq) => outstanding.push(*seq),
                    None => {}
                }
            }
            (outstanding, nacked)
        };

        if !outstanding.is_empty() {
            Err(TrackerError::ConfirmTimeout {
                outstanding,
                timeout,
            })
        } else if !nacked.is_empty() {
            Err(TrackerError::Nacked(nacked))
        } else {
            Ok(())
        }
    }

    /// Removes entries pending for at least `max_age`, returning their sequences.
    pub fn evict_stale(&self, max_age: Duration) -> Vec<u64> {
        let evicted: Vec<u64> = {
            let mut state = self.lock();
            let evicted: Vec<u64> = state
                .pending
                .evict_older_than(max_age)
                .into_iter()
                .map(|(seq, _)| seq)
                .collect();
            for seq in &evicted {
                state.settle(*seq, Verdict::Abandoned);
            }
            evicted
        };

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted stale confirmations");
            self.changed.notify_waiters();
        }
        evicted
    }

    /// Empties the tracker for shutdown.
    pub fn drain_all(&self) -> Vec<(u64, P)> {
        let drained = {
            let mut state = self.lock();
            let drained = state.pending.drain();
            for (seq, _) in &drained {
                state.settle(*seq, Verdict::Abandoned);
            }
            drained
        };
        self.changed.notify_waiters();
        drained
            .into_iter()
            .map(|(seq, entry)| (seq, entry.payload))
            .collect()
    }

    pub fn outstanding(&self) -> Vec<u64> {
        self.lock().pending.keys()
    }

    /// Number of sequences a waiter is still watching.
    pub fn watched(&self) -> usize {
        self.lock().watched.len()
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    // Returns false if `busy` still holds when the deadline passes.
    async fn wait_while<F>(&self, timeout: Duration, busy: F) -> bool
    where
        F: Fn(&State<P>) -> bool,
    {
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let changed = self.changed.notified();
            let still_busy = busy(&*self.lock());
            if !still_busy {
                return true;
            }

            let mut pause = self.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                pause = pause.min(deadline - now);
            }

            let _ = tokio::time::timeout(pause, changed).await;
        }
    }

    // Critical sections never panic while holding the lock.
    fn lock(&self) -> MutexGuard<'_, State<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Stops watching the sequences when `wait_for` ends, including when its future is dropped.
struct Watch<'a, P> {
    tracker: &'a ConfirmTracker<P>,
    sequences: &'a [u64],
}

impl<P> Drop for Watch<'_, P> {
    fn drop(&mut self) {
        self.tracker.lock().unwatch(self.sequences);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tracker_with(n: usize) -> ConfirmTracker<String> {
        let tracker = ConfirmTracker::default();
        for _ in 0..n {
            let seq = tracker.next_sequence();
            tracker.register(seq, format!("body-{seq}")).unwrap();
        }
        tracker
    }

    #[test]
    fn sequences_start_at_one_and_increase() {
        let tracker: ConfirmTracker<()> = ConfirmTracker::default();
        assert_eq!(tracker.next_sequence(), 1);
        assert_eq!(tracker.next_sequence(), 2);
        assert_eq!(tracker.next_sequence(), 3);
    }

    #[test]
    fn duplicate_registration_fails() {
        let tracker = tracker_with(1);
        assert_eq!(
            tracker.register(1, "again".to_owned()),
            Err(TrackerError::DuplicateKey("1".to_owned()))
        );
    }

    #[test]
    fn multiple_ack_retires_up_to_sequence() {
        let tracker = tracker_with(5);
        let res = tracker.resolve(ConfirmOutcome::ack(3, true));

        assert_eq!(res.resolved, vec![1, 2, 3]);
        assert!(res.nacked.is_empty());
        assert_eq!(tracker.outstanding(), vec![4, 5]);
    }

    #[test]
    fn single_ack_retires_one() {
        let tracker = tracker_with(5);
        let res = tracker.resolve(ConfirmOutcome::ack(3, false));

        assert_eq!(res.resolved, vec![3]);
        assert_eq!(tracker.outstanding(), vec![1, 2, 4, 5]);
    }

    #[test]
    fn stale_resolution_is_a_no_op() {
        let tracker = tracker_with(2);
        tracker.resolve(ConfirmOutcome::ack(1, false));

        let res = tracker.resolve(ConfirmOutcome::ack(1, false));
        assert!(res.is_stale());
        assert_eq!(tracker.len(), 1);

        let res = tracker.resolve(ConfirmOutcome::nack(42, false));
        assert!(res.is_stale());
        assert!(res.nacked.is_empty());
    }

    #[test]
    fn nack_hands_back_payloads() {
        let tracker = tracker_with(4);
        let res = tracker.resolve(ConfirmOutcome::nack(2, true));

        assert_eq!(
            res.nacked,
            vec![(1, "body-1".to_owned()), (2, "body-2".to_owned())]
        );
        assert_eq!(tracker.outstanding(), vec![3, 4]);
    }

    #[test]
    fn forget_removes_without_resolution() {
        let tracker = tracker_with(2);
        assert_eq!(tracker.forget(2), Some("body-2".to_owned()));
        assert_eq!(tracker.forget(2), None);
        assert_eq!(tracker.outstanding(), vec![1]);
    }

    #[test]
    fn drain_all_returns_everything() {
        let tracker = tracker_with(3);
        let drained = tracker.drain_all();

        assert_eq!(drained.len(), 3);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn await_drain_true_when_already_empty() {
        let tracker: ConfirmTracker<()> = ConfirmTracker::default();
        assert!(tracker.await_drain(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn await_drain_times_out_and_keeps_entries() {
        let tracker = tracker_with(2);
        let started = Instant::now();

        assert!(!tracker.await_drain(Duration::from_millis(150)).await);
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(tracker.outstanding(), vec![1, 2]);
    }

    #[tokio::test]
    async fn await_drain_wakes_on_resolution() {
        let tracker = Arc::new(tracker_with(3));

        let resolver = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resolver.resolve(ConfirmOutcome::ack(2, true));
            tokio::time::sleep(Duration::from_millis(20)).await;
            resolver.resolve(ConfirmOutcome::ack(3, false));
        });

        assert!(tracker.await_drain(Duration::from_secs(5)).await);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn wait_for_confirms_reports_outstanding() {
        let tracker = tracker_with(3);
        tracker.resolve(ConfirmOutcome::ack(1, false));

        let err = tracker
            .wait_for_confirms(Duration::from_millis(50))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            TrackerError::ConfirmTimeout {
                outstanding: vec![2, 3],
                timeout: Duration::from_millis(50),
            }
        );
    }

    #[tokio::test]
    async fn wait_for_confirms_ignores_nacks() {
        let tracker = tracker_with(3);
        tracker.resolve(ConfirmOutcome::ack(1, false));
        tracker.resolve(ConfirmOutcome::nack(3, true));

        assert_eq!(
            tracker.wait_for_confirms(Duration::from_millis(50)).await,
            Ok(())
        );
    }

    fn watched_tracker(n: usize) -> ConfirmTracker<String> {
        let tracker = ConfirmTracker::default();
        for _ in 0..n {
            let seq = tracker.next_sequence();
            tracker.register_watched(seq, format!("body-{seq}")).unwrap();
        }
        tracker
    }

    #[tokio::test]
    async fn wait_for_reports_only_its_own_nacks() {
        let tracker = watched_tracker(3);
        tracker.resolve(ConfirmOutcome::ack(1, false));
        tracker.resolve(ConfirmOutcome::nack(2, false));
        tracker.resolve(ConfirmOutcome::ack(3, false));

        let timeout = Duration::from_millis(50);
        assert_eq!(tracker.wait_for(&[1], timeout).await, Ok(()));
        assert_eq!(tracker.wait_for(&[3], timeout).await, Ok(()));
        assert_eq!(
            tracker.wait_for(&[2], timeout).await,
            Err(TrackerError::Nacked(vec![2]))
        );
        assert_eq!(tracker.watched(), 0);
    }

    #[tokio::test]
    async fn wait_for_consumes_its_verdicts() {
        let tracker = watched_tracker(2);
        tracker.resolve(ConfirmOutcome::nack(2, true));

        let timeout = Duration::from_millis(50);
        assert_eq!(
            tracker.wait_for(&[1, 2], timeout).await,
            Err(TrackerError::Nacked(vec![1, 2]))
        );
        assert_eq!(tracker.wait_for(&[1, 2], timeout).await, Ok(()));
    }

    #[test]
    fn unwatched_nacks_are_not_kept() {
        let tracker = tracker_with(100);
        tracker.resolve(ConfirmOutcome::nack(100, true));

        assert!(tracker.is_empty());
        assert_eq!(tracker.watched(), 0);
        assert!(tracker.lock().verdicts.is_empty());
    }

    #[tokio::test]
    async fn wait_for_times_out_and_stops_watching() {
        let tracker = watched_tracker(2);
        tracker.resolve(ConfirmOutcome::ack(1, false));

        assert_eq!(
            tracker.wait_for(&[1, 2], Duration::from_millis(50)).await,
            Err(TrackerError::ConfirmTimeout {
                outstanding: vec![2],
                timeout: Duration::from_millis(50),
            })
        );
        assert_eq!(tracker.watched(), 0);

        tracker.resolve(ConfirmOutcome::nack(2, false));
        assert!(tracker.lock().verdicts.is_empty());
    }

    #[tokio::test]
    async fn evicted_entry_is_not_reported_as_confirmed() {
        let tracker = Arc::new(watched_tracker(1));

        let evictor = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            evictor.evict_stale(Duration::ZERO);
        });

        assert_eq!(
            tracker.wait_for(&[1], Duration::from_secs(5)).await,
            Err(TrackerError::ConfirmTimeout {
                outstanding: vec![1],
                timeout: Duration::from_secs(5),
            })
        );
    }

    #[tokio::test]
    async fn dropped_wait_stops_watching() {
        let tracker = watched_tracker(1);

        let wait = tracker.wait_for(&[1], Duration::from_secs(5));
        let _ = tokio::time::timeout(Duration::from_millis(20), wait).await;

        assert_eq!(tracker.watched(), 0);
        assert_eq!(tracker.outstanding(), vec![1]);
    }

    #[tokio::test]
    async fn unbounded_timeout_waits_without_deadline() {
        let tracker = Arc::new(tracker_with(1));

        let resolver = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resolver.resolve(ConfirmOutcome::ack(1, false));
        });

        assert!(tracker.await_drain(Duration::MAX).await);
        assert_eq!(tracker.wait_for_confirms(Duration::MAX).await, Ok(()));
    }

    #[tokio::test]
    async fn unbounded_timeout_is_still_cancellable() {
        let tracker = tracker_with(1);

        let drained = tokio::time::timeout(
            Duration::from_millis(150),
            tracker.await_drain(Duration::MAX),
        )
        .await;
        assert!(drained.is_err());
        assert_eq!(tracker.outstanding(), vec![1]);
    }

    #[test]
    fn evict_stale_removes_old_entries() {
        let tracker = tracker_with(2);
        assert!(tracker.evict_stale(Duration::from_secs(3600)).is_empty());
        assert_eq!(tracker.evict_stale(Duration::ZERO), vec![1, 2]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn concurrent_registration_and_resolution() {
        let tracker: Arc<ConfirmTracker<u64>> = Arc::new(ConfirmTracker::default());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        let seq = tracker.next_sequence();
                        tracker.register(seq, seq).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.len(), 1000);
        let res = tracker.resolve(ConfirmOutcome::ack(1000, true));
        assert_eq!(res.resolved.len(), 1000);
        assert!(tracker.is_empty());
    }
}
