use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use amqmux_frame::Delivery;

use crate::channel::Channel;

/// Receives deliveries for one consumer tag.
///
/// Callbacks run on the channel's dispatcher, one delivery at a time per
/// channel, never on the connection's read path. A panic inside a callback
/// is contained at the dispatch boundary and surfaced as a
/// [`ChannelEvent::CallbackException`](crate::event::ChannelEvent).
pub trait Consumer: Send + Sync {
    /// One inbound message. Use the channel to settle it unless the
    /// consumer was started with `no_ack`.
    fn handle_delivery(&self, channel: &Channel, delivery: Delivery);

    /// The broker cancelled this consumer (queue deleted, node failover).
    fn handle_cancel(&self, _consumer_tag: &str) {}
}

/// What happened to one dispatched delivery.
#[derive(Debug)]
pub(crate) enum DispatchOutcome {
    Delivered,
    /// The callback panicked; the payload's message, for the exception event.
    CallbackPanicked(String),
    /// No registration and no default consumer. A client bug or a
    /// client/broker desynchronization; must not be silently dropped.
    UnknownTag(String),
}

/// Outcome of a broker-initiated cancel notification.
#[derive(Debug)]
pub(crate) enum CancelOutcome {
    Done,
    Panicked(String),
    NotRegistered,
}

/// Tag-to-handler mapping owned by the channel's dispatcher.
///
/// Mutations arrive through the same ordered queue as deliveries, so a
/// registration is always visible before the first delivery that can
/// reference it and removal never races a delivery already queued behind it.
pub(crate) struct DispatchTable {
    consumers: HashMap<String, Arc<dyn Consumer>>,
    default: Option<Arc<dyn Consumer>>,
}

impl DispatchTable {
    pub(crate) fn new() -> Self {
        Self {
            consumers: HashMap::new(),
            default: None,
        }
    }

    pub(crate) fn register(&mut self, tag: String, consumer: Arc<dyn Consumer>) {
        if self.consumers.insert(tag.clone(), consumer).is_some() {
            tracing::warn!(tag = %tag, "consumer tag re-registered, previous handler replaced");
        }
    }

    pub(crate) fn remove(&mut self, tag: &str) -> Option<Arc<dyn Consumer>> {
        self.consumers.remove(tag)
    }

    pub(crate) fn set_default(&mut self, consumer: Arc<dyn Consumer>) {
        self.default = Some(consumer);
    }

    /// Route one delivery to its handler, falling back to the default.
    pub(crate) fn dispatch(&self, channel: &Channel, delivery: Delivery) -> DispatchOutcome {
        let tag = delivery.consumer_tag.clone();
        let Some(consumer) = self.consumers.get(&tag).or(self.default.as_ref()) else {
            return DispatchOutcome::UnknownTag(tag);
        };

        let consumer = Arc::clone(consumer);
        match catch_unwind(AssertUnwindSafe(|| consumer.handle_delivery(channel, delivery))) {
            Ok(()) => DispatchOutcome::Delivered,
            Err(payload) => DispatchOutcome::CallbackPanicked(format!(
                "consumer {tag:?} panicked: {}",
                panic_message(&payload)
            )),
        }
    }

    /// Drop a registration on the broker's initiative and tell the handler.
    pub(crate) fn notify_cancel(&mut self, tag: &str) -> CancelOutcome {
        let Some(consumer) = self.consumers.remove(tag) else {
            return CancelOutcome::NotRegistered;
        };
        match catch_unwind(AssertUnwindSafe(|| consumer.handle_cancel(tag))) {
            Ok(()) => CancelOutcome::Done,
            Err(payload) => CancelOutcome::Panicked(format!(
                "cancel handler for {tag:?} panicked: {}",
                panic_message(&payload)
            )),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "opaque panic payload"
    }
}
