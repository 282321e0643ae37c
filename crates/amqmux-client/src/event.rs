use std::sync::{Mutex, PoisonError};

use amqmux_frame::{CloseReason, ReturnedMessage};

/// Asynchronous broker notifications, fanned out through one point per
/// channel in frame-arrival order.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Broker confirmed publishes up to (or exactly at) a sequence number.
    Ack { delivery_tag: u64, multiple: bool },
    /// Broker rejected publishes up to (or exactly at) a sequence number.
    Nack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
    /// A mandatory/immediate publish came back unrouted.
    Return(ReturnedMessage),
    /// Broker paused (`false`) or resumed (`true`) publishing.
    Flow { active: bool },
    /// Broker cancelled a consumer (queue deleted, node failover).
    CancelledByBroker { consumer_tag: String },
    /// A consumer or event callback panicked; the panic was contained at
    /// the dispatch boundary instead of unwinding into frame routing.
    CallbackException { context: String },
    /// Terminal notification; fired exactly once per channel.
    Shutdown(CloseReason),
}

/// Receives a channel's event stream. At most one sink is registered per
/// channel; registering again replaces the previous one.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: ChannelEvent);
}

type ShutdownListener = Box<dyn FnOnce(&CloseReason) + Send>;

/// Write-once terminal state with replay for late observers.
///
/// The close reason is recorded when shutdown begins (first writer wins);
/// listeners fire when shutdown completes. An observer attaching after
/// settlement is invoked immediately with the stored reason, so no one can
/// miss the notification by subscribing late.
pub(crate) struct ShutdownCell {
    state: Mutex<CellState>,
}

struct CellState {
    reason: Option<CloseReason>,
    settled: bool,
    listeners: Vec<ShutdownListener>,
}

impl ShutdownCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CellState {
                reason: None,
                settled: false,
                listeners: Vec::new(),
            }),
        }
    }

    /// Record the close reason. Returns false if one was already stored.
    pub(crate) fn set_reason(&self, reason: CloseReason) -> bool {
        let mut state = self.lock();
        if state.reason.is_some() {
            return false;
        }
        state.reason = Some(reason);
        true
    }

    /// The stored reason, if shutdown has begun.
    pub(crate) fn reason(&self) -> Option<CloseReason> {
        self.lock().reason.clone()
    }

    /// Fire listeners with the stored reason. Subsequent calls are no-ops.
    pub(crate) fn settle(&self) {
        let (reason, listeners) = {
            let mut state = self.lock();
            if state.settled {
                return;
            }
            let Some(reason) = state.reason.clone() else {
                return;
            };
            state.settled = true;
            (reason, std::mem::take(&mut state.listeners))
        };
        for listener in listeners {
            listener(&reason);
        }
    }

    /// Attach a listener; replayed immediately if already settled.
    pub(crate) fn observe(&self, listener: ShutdownListener) {
        let replay = {
            let mut state = self.lock();
            if state.settled {
                state.reason.clone()
            } else {
                state.listeners.push(listener);
                return;
            }
        };
        if let Some(reason) = replay {
            listener(&reason);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CellState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
