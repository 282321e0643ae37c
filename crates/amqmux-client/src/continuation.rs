use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use amqmux_frame::{Method, MethodKind};

use crate::error::{ChannelError, Result};

/// Single-slot completion cell shared between one blocked caller and the
/// connection's reader path. The reader only ever resolves; the caller only
/// ever waits.
#[derive(Clone)]
pub(crate) struct Promise {
    inner: Arc<PromiseState>,
}

struct PromiseState {
    slot: Mutex<Option<Result<Method>>>,
    ready: Condvar,
}

impl Promise {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(PromiseState {
                slot: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// Settle the promise. The first completion wins; later ones are
    /// dropped so a racing timeout/teardown cannot double-complete.
    pub(crate) fn complete(&self, result: Result<Method>) {
        let mut slot = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(result);
            self.inner.ready.notify_all();
        }
    }

    /// Block until completion or until `timeout` elapses.
    ///
    /// Returns `None` on timeout, leaving the slot untouched so a late
    /// resolution is still recorded (and discarded with the promise).
    pub(crate) fn wait(&self, timeout: Duration) -> Option<Result<Method>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if slot.is_some() {
                return slot.take();
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, _) = self
                .inner
                .ready
                .wait_timeout(slot, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }
}

/// What happened when an inbound reply was matched against the queue.
#[derive(Debug)]
pub(crate) enum Resolution {
    /// The oldest continuation matched and was completed.
    Completed,
    /// A reply arrived with nothing pending. Fatal while the channel is
    /// open; expected for stale replies during teardown.
    NonePending { got: MethodKind },
    /// The oldest continuation expected a different reply kind.
    Mismatch {
        expected: &'static [MethodKind],
        got: MethodKind,
    },
}

struct Continuation {
    expected: &'static [MethodKind],
    promise: Promise,
    enqueued_at: Instant,
}

/// Strict per-channel FIFO of pending synchronous requests.
///
/// The protocol never reorders replies within a channel, so position is the
/// whole correlation scheme: requests are pushed in transmission order
/// (under the channel's writer lock) and replies pop from the front.
pub(crate) struct ContinuationQueue {
    pending: Mutex<VecDeque<Continuation>>,
}

impl ContinuationQueue {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Register a pending request. Must be called before the request frame
    /// is handed to the transport, inside the same serialized section.
    pub(crate) fn push(&self, expected: &'static [MethodKind]) -> Promise {
        let promise = Promise::new();
        let mut pending = self.lock();
        pending.push_back(Continuation {
            expected,
            promise: promise.clone(),
            enqueued_at: Instant::now(),
        });
        promise
    }

    /// Complete the oldest continuation with an inbound reply.
    pub(crate) fn resolve(&self, method: Method) -> Resolution {
        let got = method.kind();
        let front = { self.lock().pop_front() };
        let Some(continuation) = front else {
            return Resolution::NonePending { got };
        };

        if !continuation.expected.contains(&got) {
            continuation.promise.complete(Err(ChannelError::Protocol(format!(
                "expected reply {:?}, got {:?}",
                continuation.expected, got
            ))));
            return Resolution::Mismatch {
                expected: continuation.expected,
                got,
            };
        }

        tracing::trace!(
            reply = ?got,
            waited = ?continuation.enqueued_at.elapsed(),
            "continuation resolved"
        );
        continuation.promise.complete(Ok(method));
        Resolution::Completed
    }

    /// Fail every pending continuation, oldest first.
    pub(crate) fn fail_all(&self, mut make_error: impl FnMut() -> ChannelError) {
        let drained: Vec<Continuation> = { self.lock().drain(..).collect() };
        for continuation in drained {
            continuation.promise.complete(Err(make_error()));
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Continuation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use amqmux_frame::CloseReason;

    use super::*;

    #[test]
    fn resolves_in_fifo_order() {
        let queue = ContinuationQueue::new();
        let first = queue.push(&[MethodKind::QueueDeclareOk]);
        let second = queue.push(&[MethodKind::BasicQosOk]);

        assert!(matches!(
            queue.resolve(Method::QueueDeclareOk {
                queue: "q".to_string(),
                message_count: 1,
                consumer_count: 0,
            }),
            Resolution::Completed
        ));
        assert!(matches!(
            queue.resolve(Method::BasicQosOk),
            Resolution::Completed
        ));

        let first_reply = first.wait(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(first_reply.kind(), MethodKind::QueueDeclareOk);
        let second_reply = second.wait(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(second_reply.kind(), MethodKind::BasicQosOk);
        assert!(queue.is_empty());
    }

    #[test]
    fn reply_kind_mismatch_fails_the_caller() {
        let queue = ContinuationQueue::new();
        let promise = queue.push(&[MethodKind::TxSelectOk]);

        let resolution = queue.resolve(Method::BasicQosOk);
        assert!(matches!(
            resolution,
            Resolution::Mismatch {
                got: MethodKind::BasicQosOk,
                ..
            }
        ));

        let err = promise.wait(Duration::from_secs(1)).unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(_)));
    }

    #[test]
    fn reply_with_nothing_pending_is_reported() {
        let queue = ContinuationQueue::new();
        assert!(matches!(
            queue.resolve(Method::BasicQosOk),
            Resolution::NonePending {
                got: MethodKind::BasicQosOk
            }
        ));
    }

    #[test]
    fn either_of_two_expected_kinds_matches() {
        let queue = ContinuationQueue::new();
        let promise = queue.push(&[MethodKind::BasicGetOk, MethodKind::BasicGetEmpty]);

        assert!(matches!(
            queue.resolve(Method::BasicGetEmpty),
            Resolution::Completed
        ));
        let reply = promise.wait(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(reply.kind(), MethodKind::BasicGetEmpty);
    }

    #[test]
    fn fail_all_completes_every_pending_caller_in_order() {
        let queue = ContinuationQueue::new();
        let promises: Vec<_> = (0..3)
            .map(|_| queue.push(&[MethodKind::QueueBindOk]))
            .collect();

        let mut order = Vec::new();
        queue.fail_all(|| {
            order.push(order.len());
            ChannelError::ChannelClosed(CloseReason::application())
        });
        assert_eq!(order, vec![0, 1, 2]);

        for promise in promises {
            let err = promise.wait(Duration::from_secs(1)).unwrap().unwrap_err();
            assert!(matches!(err, ChannelError::ChannelClosed(_)));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn wait_times_out_without_completion() {
        let promise = Promise::new();
        assert!(promise.wait(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn reader_thread_unblocks_waiting_caller() {
        let queue = std::sync::Arc::new(ContinuationQueue::new());
        let promise = queue.push(&[MethodKind::TxCommitOk]);

        let resolver = thread::spawn({
            let queue = std::sync::Arc::clone(&queue);
            move || {
                thread::sleep(Duration::from_millis(10));
                queue.resolve(Method::TxCommitOk);
            }
        });

        let reply = promise.wait(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(reply.kind(), MethodKind::TxCommitOk);
        resolver.join().unwrap();
    }

    #[test]
    fn late_completion_after_timeout_is_discarded() {
        let promise = Promise::new();
        assert!(promise.wait(Duration::from_millis(10)).is_none());

        promise.complete(Ok(Method::TxSelectOk));
        // The slot still holds the late value; a second wait observes it,
        // but the caller that timed out has already walked away.
        let late = promise.wait(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(late.kind(), MethodKind::TxSelectOk);
    }
}
