use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use amqmux_frame::CloseReason;

/// How a confirm-wait ended.
#[derive(Debug)]
pub(crate) enum WaitOutcome {
    /// Every outstanding publish was resolved and none were nacked.
    AllAcked,
    /// Every outstanding publish was resolved but at least one was nacked
    /// since the previous successful wait.
    SomeNacked,
    /// A nack was observed while entries were still outstanding
    /// (fail-fast mode only).
    NackObserved,
    /// The deadline passed with entries still outstanding.
    TimedOut,
    /// The channel force-closed; all entries were resolved as failed.
    Aborted(CloseReason),
}

struct TrackerState {
    /// Sequence numbers awaiting broker resolution, in assignment order.
    outstanding: BTreeSet<u64>,
    /// Whether any nack arrived since the last successful wait.
    nacked: bool,
    aborted: Option<CloseReason>,
}

/// Tracks published sequence numbers awaiting broker acknowledgement.
///
/// The reader path resolves entries; publisher threads record them; waiter
/// threads block on the set draining. All three meet on one mutex.
pub(crate) struct ConfirmTracker {
    state: Mutex<TrackerState>,
    resolved: Condvar,
}

impl ConfirmTracker {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                outstanding: BTreeSet::new(),
                nacked: false,
                aborted: None,
            }),
            resolved: Condvar::new(),
        }
    }

    /// Record a freshly assigned sequence number. Must run inside the same
    /// writer-serialized section that transmits the publish frame.
    pub(crate) fn record(&self, seq: u64) {
        let mut state = self.lock();
        state.outstanding.insert(seq);
    }

    /// Broker acknowledged `delivery_tag` (and everything below it when
    /// `multiple` is set).
    pub(crate) fn handle_ack(&self, delivery_tag: u64, multiple: bool) {
        self.settle(delivery_tag, multiple, false);
    }

    /// Broker rejected `delivery_tag` (and everything below it when
    /// `multiple` is set).
    pub(crate) fn handle_nack(&self, delivery_tag: u64, multiple: bool) {
        self.settle(delivery_tag, multiple, true);
    }

    fn settle(&self, delivery_tag: u64, multiple: bool, failed: bool) {
        let mut state = self.lock();
        let removed = if multiple {
            let keep = match delivery_tag.checked_add(1) {
                Some(bound) => state.outstanding.split_off(&bound),
                None => BTreeSet::new(),
            };
            let removed = std::mem::replace(&mut state.outstanding, keep);
            removed.len()
        } else if state.outstanding.remove(&delivery_tag) {
            1
        } else {
            tracing::warn!(delivery_tag, "confirm for unknown sequence number");
            0
        };

        if failed {
            state.nacked = true;
        }
        tracing::trace!(delivery_tag, multiple, failed, removed, "confirms settled");
        self.resolved.notify_all();
    }

    /// Block until every outstanding entry is resolved or `timeout`
    /// elapses. A successful wait reports whether any nack occurred since
    /// the previous successful wait and resets that flag.
    pub(crate) fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(reason) = &state.aborted {
                return WaitOutcome::Aborted(reason.clone());
            }
            if state.outstanding.is_empty() {
                let nacked = std::mem::take(&mut state.nacked);
                return if nacked {
                    WaitOutcome::SomeNacked
                } else {
                    WaitOutcome::AllAcked
                };
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return WaitOutcome::TimedOut;
            };
            let (guard, _) = self
                .resolved
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Like [`wait`](Self::wait), but fails the moment a nack is observed
    /// instead of waiting for unrelated entries still in flight.
    pub(crate) fn wait_fail_fast(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(reason) = &state.aborted {
                return WaitOutcome::Aborted(reason.clone());
            }
            if state.nacked {
                state.nacked = false;
                return WaitOutcome::NackObserved;
            }
            if state.outstanding.is_empty() {
                return WaitOutcome::AllAcked;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return WaitOutcome::TimedOut;
            };
            let (guard, _) = self
                .resolved
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Force-close: resolve every outstanding entry as failed and release
    /// all waiters with the stored reason.
    pub(crate) fn abort(&self, reason: CloseReason) {
        let mut state = self.lock();
        if state.aborted.is_some() {
            return;
        }
        if !state.outstanding.is_empty() {
            state.nacked = true;
            state.outstanding.clear();
        }
        state.aborted = Some(reason);
        self.resolved.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn outstanding_len(&self) -> usize {
        self.lock().outstanding.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use amqmux_frame::close;

    use super::*;

    #[test]
    fn single_ack_resolves_exactly_one_entry() {
        let tracker = ConfirmTracker::new();
        tracker.record(1);
        tracker.record(2);

        tracker.handle_ack(1, false);
        assert_eq!(tracker.outstanding_len(), 1);

        tracker.handle_ack(2, false);
        assert!(matches!(
            tracker.wait(Duration::from_millis(50)),
            WaitOutcome::AllAcked
        ));
    }

    #[test]
    fn multiple_ack_resolves_contiguous_range() {
        let tracker = ConfirmTracker::new();
        for seq in 1..=5 {
            tracker.record(seq);
        }

        tracker.handle_ack(4, true);
        assert_eq!(tracker.outstanding_len(), 1);

        tracker.handle_ack(5, false);
        assert!(matches!(
            tracker.wait(Duration::from_millis(50)),
            WaitOutcome::AllAcked
        ));
    }

    #[test]
    fn nack_is_reported_then_reset_by_successful_wait() {
        let tracker = ConfirmTracker::new();
        tracker.record(1);
        tracker.handle_nack(1, false);

        assert!(matches!(
            tracker.wait(Duration::from_millis(50)),
            WaitOutcome::SomeNacked
        ));
        // Flag was reset by the successful wait above.
        assert!(matches!(
            tracker.wait(Duration::from_millis(50)),
            WaitOutcome::AllAcked
        ));
    }

    #[test]
    fn fail_fast_raises_on_nack_with_entries_still_outstanding() {
        let tracker = ConfirmTracker::new();
        for seq in 1..=6 {
            tracker.record(seq);
        }
        // Nack 1..=5 with `multiple`; entry 6 remains in flight.
        tracker.handle_nack(5, true);

        assert!(matches!(
            tracker.wait_fail_fast(Duration::from_millis(50)),
            WaitOutcome::NackObserved
        ));
        assert_eq!(tracker.outstanding_len(), 1);
    }

    #[test]
    fn wait_times_out_with_unresolved_entries() {
        let tracker = ConfirmTracker::new();
        tracker.record(1);
        assert!(matches!(
            tracker.wait(Duration::from_millis(20)),
            WaitOutcome::TimedOut
        ));
    }

    #[test]
    fn abort_releases_waiters_with_reason() {
        let tracker = Arc::new(ConfirmTracker::new());
        tracker.record(1);

        let waiter = thread::spawn({
            let tracker = Arc::clone(&tracker);
            move || tracker.wait(Duration::from_secs(5))
        });

        thread::sleep(Duration::from_millis(20));
        tracker.abort(CloseReason::library(close::CHANNEL_ERROR, "force close"));

        match waiter.join().unwrap() {
            WaitOutcome::Aborted(reason) => assert_eq!(reason.code, close::CHANNEL_ERROR),
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[test]
    fn reader_thread_drains_waiting_publisher() {
        let tracker = Arc::new(ConfirmTracker::new());
        for seq in 1..=3 {
            tracker.record(seq);
        }

        let reader = thread::spawn({
            let tracker = Arc::clone(&tracker);
            move || {
                thread::sleep(Duration::from_millis(10));
                tracker.handle_ack(3, true);
            }
        });

        assert!(matches!(
            tracker.wait(Duration::from_secs(2)),
            WaitOutcome::AllAcked
        ));
        reader.join().unwrap();
    }
}
