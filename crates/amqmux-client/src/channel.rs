use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use amqmux_frame::{
    close, validate_shortstr, BasicProperties, CloseReason, Delivery, FieldTable, Method,
    MethodKind, ReturnedMessage,
};
use amqmux_transport::FrameTransport;
use bytes::Bytes;

use crate::config::ChannelConfig;
use crate::confirm::{ConfirmTracker, WaitOutcome};
use crate::consumer::{CancelOutcome, Consumer, DispatchOutcome, DispatchTable};
use crate::continuation::{ContinuationQueue, Promise, Resolution};
use crate::error::{ChannelError, Result};
use crate::event::{ChannelEvent, EventSink, ShutdownCell};
use crate::options::{
    ConsumeOptions, ExchangeDeclareOptions, GetResult, PublishOptions, QueueDeclareOptions,
    QueueInfo,
};

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// One numbered, multiplexed session on a connection.
///
/// The channel turns the connection's asynchronous frame stream into
/// synchronous-looking operations: callers block on their own continuation
/// while the connection's reader resolves it. Outbound transmission is
/// serialized per channel so continuation order and confirm sequence order
/// always match wire order.
pub struct Channel {
    number: u16,
    config: ChannelConfig,
    transport: Arc<dyn FrameTransport>,
    state: AtomicU8,
    shutdown_cell: ShutdownCell,
    continuations: ContinuationQueue,
    confirms: ConfirmTracker,
    confirm_mode: AtomicBool,
    flow_active: AtomicBool,
    /// Serializes "enqueue continuation / assign sequence number, then
    /// write frame" so reply order and confirm order match the wire.
    writer: Mutex<WriterState>,
    /// Consumers awaiting their ConsumeOk, aligned with continuation FIFO.
    pending_consumers: Mutex<VecDeque<Arc<dyn Consumer>>>,
    event_sink: Mutex<Option<Arc<dyn EventSink>>>,
    dispatch_tx: Sender<DispatchItem>,
}

struct WriterState {
    next_publish_seq: u64,
}

enum DispatchItem {
    Register {
        tag: String,
        consumer: Arc<dyn Consumer>,
    },
    Remove {
        tag: String,
    },
    SetDefault(Arc<dyn Consumer>),
    Deliver(Delivery),
    Event(ChannelEvent),
    BrokerCancel {
        tag: String,
    },
    Shutdown(CloseReason),
}

impl Channel {
    /// Create a channel and spawn its dispatcher. Does not perform the
    /// open handshake; the connection does that once the channel is
    /// registered for frame routing.
    pub(crate) fn new(
        number: u16,
        transport: Arc<dyn FrameTransport>,
        config: ChannelConfig,
    ) -> Result<Arc<Self>> {
        let (dispatch_tx, dispatch_rx) = mpsc::channel();
        let channel = Arc::new(Self {
            number,
            config,
            transport,
            state: AtomicU8::new(STATE_OPEN),
            shutdown_cell: ShutdownCell::new(),
            continuations: ContinuationQueue::new(),
            confirms: ConfirmTracker::new(),
            confirm_mode: AtomicBool::new(false),
            flow_active: AtomicBool::new(true),
            writer: Mutex::new(WriterState {
                next_publish_seq: 1,
            }),
            pending_consumers: Mutex::new(VecDeque::new()),
            event_sink: Mutex::new(None),
            dispatch_tx,
        });

        let weak = Arc::downgrade(&channel);
        thread::Builder::new()
            .name(format!("amqmux-channel-{number}"))
            .spawn(move || run_dispatcher(weak, dispatch_rx))
            .map_err(|err| ChannelError::Internal(format!("failed to spawn dispatcher: {err}")))?;

        Ok(channel)
    }

    /// Perform the open handshake with the broker.
    pub(crate) fn open(&self) -> Result<()> {
        self.rpc(Method::ChannelOpen, &[MethodKind::ChannelOpenOk])?;
        Ok(())
    }

    /// This channel's number on its connection.
    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_OPEN
    }

    /// False while the broker has publishing paused on this channel.
    pub fn is_flow_active(&self) -> bool {
        self.flow_active.load(Ordering::SeqCst)
    }

    /// True once confirm mode has been enabled; never reverts.
    pub fn is_confirm_mode(&self) -> bool {
        self.confirm_mode.load(Ordering::SeqCst)
    }

    /// The sequence number the next publish will be assigned.
    pub fn next_publish_seq_no(&self) -> u64 {
        self.writer_lock().next_publish_seq
    }

    /// The stored terminal reason, if the channel has begun shutting down.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shutdown_cell.reason()
    }

    /// Register the event sink, replacing any previous one.
    pub fn set_event_handler(&self, sink: Arc<dyn EventSink>) {
        *self
            .event_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Observe the terminal shutdown notification.
    ///
    /// If the channel already shut down, the listener runs immediately with
    /// the stored reason; otherwise it runs exactly once at shutdown.
    pub fn on_shutdown(&self, listener: impl FnOnce(&CloseReason) + Send + 'static) {
        self.shutdown_cell.observe(Box::new(listener));
    }

    /// Route deliveries with no matching consumer tag here instead of
    /// treating them as fatal.
    pub fn set_default_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<()> {
        self.ensure_open()?;
        self.enqueue(DispatchItem::SetDefault(consumer));
        Ok(())
    }

    // ---- synchronous operations ------------------------------------------

    pub fn exchange_declare(
        &self,
        exchange: &str,
        kind: &str,
        options: &ExchangeDeclareOptions,
    ) -> Result<()> {
        validate_shortstr("exchange", exchange)?;
        self.rpc(
            exchange_declare_method(exchange, kind, options, false, false),
            &[MethodKind::ExchangeDeclareOk],
        )?;
        Ok(())
    }

    /// Check an exchange exists without modifying it. A missing exchange is
    /// a broker-side channel close, surfaced as `ChannelClosed`.
    pub fn exchange_declare_passive(&self, exchange: &str) -> Result<()> {
        validate_shortstr("exchange", exchange)?;
        self.rpc(
            exchange_declare_method(exchange, "", &ExchangeDeclareOptions::default(), true, false),
            &[MethodKind::ExchangeDeclareOk],
        )?;
        Ok(())
    }

    pub fn exchange_declare_nowait(
        &self,
        exchange: &str,
        kind: &str,
        options: &ExchangeDeclareOptions,
    ) -> Result<()> {
        validate_shortstr("exchange", exchange)?;
        self.send_nowait(exchange_declare_method(exchange, kind, options, false, true))
    }

    pub fn exchange_delete(&self, exchange: &str, if_unused: bool) -> Result<()> {
        validate_shortstr("exchange", exchange)?;
        self.rpc(
            Method::ExchangeDelete {
                exchange: exchange.to_string(),
                if_unused,
                no_wait: false,
            },
            &[MethodKind::ExchangeDeleteOk],
        )?;
        Ok(())
    }

    pub fn exchange_delete_nowait(&self, exchange: &str, if_unused: bool) -> Result<()> {
        validate_shortstr("exchange", exchange)?;
        self.send_nowait(Method::ExchangeDelete {
            exchange: exchange.to_string(),
            if_unused,
            no_wait: true,
        })
    }

    pub fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        validate_shortstr("destination", destination)?;
        validate_shortstr("source", source)?;
        validate_shortstr("routing key", routing_key)?;
        self.rpc(
            Method::ExchangeBind {
                destination: destination.to_string(),
                source: source.to_string(),
                routing_key: routing_key.to_string(),
                no_wait: false,
                arguments,
            },
            &[MethodKind::ExchangeBindOk],
        )?;
        Ok(())
    }

    pub fn exchange_bind_nowait(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        validate_shortstr("destination", destination)?;
        validate_shortstr("source", source)?;
        validate_shortstr("routing key", routing_key)?;
        self.send_nowait(Method::ExchangeBind {
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
            no_wait: true,
            arguments,
        })
    }

    pub fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        validate_shortstr("destination", destination)?;
        validate_shortstr("source", source)?;
        validate_shortstr("routing key", routing_key)?;
        self.rpc(
            Method::ExchangeUnbind {
                destination: destination.to_string(),
                source: source.to_string(),
                routing_key: routing_key.to_string(),
                no_wait: false,
                arguments,
            },
            &[MethodKind::ExchangeUnbindOk],
        )?;
        Ok(())
    }

    pub fn exchange_unbind_nowait(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        validate_shortstr("destination", destination)?;
        validate_shortstr("source", source)?;
        validate_shortstr("routing key", routing_key)?;
        self.send_nowait(Method::ExchangeUnbind {
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
            no_wait: true,
            arguments,
        })
    }

    /// Declare a queue. An empty name asks the broker to generate one; the
    /// actual name comes back in the result.
    pub fn queue_declare(&self, queue: &str, options: &QueueDeclareOptions) -> Result<QueueInfo> {
        validate_shortstr("queue", queue)?;
        let reply = self.rpc(
            queue_declare_method(queue, options, false, false),
            &[MethodKind::QueueDeclareOk],
        )?;
        queue_info_from_reply(reply)
    }

    /// Check a queue exists and report its current message and consumer
    /// counts. A missing queue is a broker-side channel close.
    pub fn queue_declare_passive(&self, queue: &str) -> Result<QueueInfo> {
        validate_shortstr("queue", queue)?;
        let reply = self.rpc(
            queue_declare_method(queue, &QueueDeclareOptions::default(), true, false),
            &[MethodKind::QueueDeclareOk],
        )?;
        queue_info_from_reply(reply)
    }

    /// Declare without waiting for confirmation. With a broker-generated
    /// name the caller never learns the resulting queue name.
    pub fn queue_declare_nowait(&self, queue: &str, options: &QueueDeclareOptions) -> Result<()> {
        validate_shortstr("queue", queue)?;
        self.send_nowait(queue_declare_method(queue, options, false, true))
    }

    pub fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        validate_shortstr("queue", queue)?;
        validate_shortstr("exchange", exchange)?;
        validate_shortstr("routing key", routing_key)?;
        self.rpc(
            Method::QueueBind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                no_wait: false,
                arguments,
            },
            &[MethodKind::QueueBindOk],
        )?;
        Ok(())
    }

    pub fn queue_bind_nowait(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        validate_shortstr("queue", queue)?;
        validate_shortstr("exchange", exchange)?;
        validate_shortstr("routing key", routing_key)?;
        self.send_nowait(Method::QueueBind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            no_wait: true,
            arguments,
        })
    }

    pub fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        validate_shortstr("queue", queue)?;
        validate_shortstr("exchange", exchange)?;
        validate_shortstr("routing key", routing_key)?;
        self.rpc(
            Method::QueueUnbind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                arguments,
            },
            &[MethodKind::QueueUnbindOk],
        )?;
        Ok(())
    }

    /// Drop every message currently on the queue; reports how many went.
    pub fn queue_purge(&self, queue: &str) -> Result<u32> {
        validate_shortstr("queue", queue)?;
        let reply = self.rpc(
            Method::QueuePurge {
                queue: queue.to_string(),
                no_wait: false,
            },
            &[MethodKind::QueuePurgeOk],
        )?;
        match reply {
            Method::QueuePurgeOk { message_count } => Ok(message_count),
            other => Err(unexpected_reply(other)),
        }
    }

    pub fn queue_purge_nowait(&self, queue: &str) -> Result<()> {
        validate_shortstr("queue", queue)?;
        self.send_nowait(Method::QueuePurge {
            queue: queue.to_string(),
            no_wait: true,
        })
    }

    pub fn queue_delete(&self, queue: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        validate_shortstr("queue", queue)?;
        let reply = self.rpc(
            Method::QueueDelete {
                queue: queue.to_string(),
                if_unused,
                if_empty,
                no_wait: false,
            },
            &[MethodKind::QueueDeleteOk],
        )?;
        match reply {
            Method::QueueDeleteOk { message_count } => Ok(message_count),
            other => Err(unexpected_reply(other)),
        }
    }

    pub fn queue_delete_nowait(&self, queue: &str, if_unused: bool, if_empty: bool) -> Result<()> {
        validate_shortstr("queue", queue)?;
        self.send_nowait(Method::QueueDelete {
            queue: queue.to_string(),
            if_unused,
            if_empty,
            no_wait: true,
        })
    }

    /// Messages currently ready on the queue.
    pub fn message_count(&self, queue: &str) -> Result<u32> {
        Ok(self.queue_declare_passive(queue)?.message_count)
    }

    /// Consumers currently attached to the queue.
    pub fn consumer_count(&self, queue: &str) -> Result<u32> {
        Ok(self.queue_declare_passive(queue)?.consumer_count)
    }

    pub fn basic_qos(&self, prefetch_size: u32, prefetch_count: u16, global: bool) -> Result<()> {
        self.rpc(
            Method::BasicQos {
                prefetch_size,
                prefetch_count,
                global,
            },
            &[MethodKind::BasicQosOk],
        )?;
        Ok(())
    }

    /// Ask the broker to redeliver all unacknowledged deliveries.
    pub fn basic_recover(&self, requeue: bool) -> Result<()> {
        self.rpc(
            Method::BasicRecover { requeue },
            &[MethodKind::BasicRecoverOk],
        )?;
        Ok(())
    }

    /// Start a consumer. An empty `consumer_tag` asks the broker to
    /// generate one; the effective tag is returned either way and the
    /// handler is registered before any delivery for it can be dispatched.
    pub fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String> {
        validate_shortstr("queue", queue)?;
        validate_shortstr("consumer tag", consumer_tag)?;
        self.ensure_open()?;

        let promise = {
            let writer = self.writer_lock();
            self.ensure_open()?;
            self.pending_consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(consumer);
            let promise = self.continuations.push(&[MethodKind::BasicConsumeOk]);
            if let Err(err) = self.transport.send(
                self.number,
                consume_method(queue, consumer_tag, options, false),
            ) {
                drop(writer);
                self.fail_for_transport(&err);
                return Err(err.into());
            }
            promise
        };

        match self.await_reply(promise)? {
            Method::BasicConsumeOk { consumer_tag } => Ok(consumer_tag),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Start a consumer without broker confirmation. The tag must be
    /// client-supplied; no reply will carry a generated one back.
    pub fn basic_consume_nowait(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
        consumer: Arc<dyn Consumer>,
    ) -> Result<String> {
        if consumer_tag.is_empty() {
            return Err(ChannelError::ConsumerTagRequired);
        }
        validate_shortstr("queue", queue)?;
        validate_shortstr("consumer tag", consumer_tag)?;
        self.ensure_open()?;

        let writer = self.writer_lock();
        self.ensure_open()?;
        // Registration goes into the dispatch queue before the frame hits
        // the wire, so it is ordered ahead of the first delivery.
        self.enqueue(DispatchItem::Register {
            tag: consumer_tag.to_string(),
            consumer,
        });
        if let Err(err) = self
            .transport
            .send(self.number, consume_method(queue, consumer_tag, options, true))
        {
            drop(writer);
            self.fail_for_transport(&err);
            return Err(err.into());
        }
        Ok(consumer_tag.to_string())
    }

    /// Stop a consumer. Deliveries already in flight are still dispatched
    /// before the registration is removed.
    pub fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        validate_shortstr("consumer tag", consumer_tag)?;
        self.rpc(
            Method::BasicCancel {
                consumer_tag: consumer_tag.to_string(),
                no_wait: false,
            },
            &[MethodKind::BasicCancelOk],
        )?;
        Ok(())
    }

    pub fn basic_cancel_nowait(&self, consumer_tag: &str) -> Result<()> {
        validate_shortstr("consumer tag", consumer_tag)?;
        self.ensure_open()?;
        {
            let writer = self.writer_lock();
            self.ensure_open()?;
            if let Err(err) = self.transport.send(
                self.number,
                Method::BasicCancel {
                    consumer_tag: consumer_tag.to_string(),
                    no_wait: true,
                },
            ) {
                drop(writer);
                self.fail_for_transport(&err);
                return Err(err.into());
            }
        }
        self.enqueue(DispatchItem::Remove {
            tag: consumer_tag.to_string(),
        });
        Ok(())
    }

    /// Retrieve one message synchronously. Returns an explicit empty result
    /// when the queue has nothing, never a null conflated with failure.
    pub fn basic_get(&self, queue: &str, no_ack: bool) -> Result<GetResult> {
        validate_shortstr("queue", queue)?;
        let reply = self.rpc(
            Method::BasicGet {
                queue: queue.to_string(),
                no_ack,
            },
            &[MethodKind::BasicGetOk, MethodKind::BasicGetEmpty],
        )?;
        match reply {
            Method::BasicGetOk(message) => Ok(GetResult::Message(message)),
            Method::BasicGetEmpty => Ok(GetResult::Empty),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Publish a message. Never blocks on acknowledgement; in confirm mode
    /// the assigned sequence number is returned.
    pub fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: &PublishOptions,
        properties: BasicProperties,
        body: impl Into<Bytes>,
    ) -> Result<Option<u64>> {
        validate_shortstr("exchange", exchange)?;
        validate_shortstr("routing key", routing_key)?;
        self.ensure_open()?;
        let body = body.into();

        let mut writer = self.writer_lock();
        self.ensure_open()?;
        let seq = if self.confirm_mode.load(Ordering::SeqCst) {
            let seq = writer.next_publish_seq;
            writer.next_publish_seq += 1;
            self.confirms.record(seq);
            Some(seq)
        } else {
            None
        };
        if let Err(err) = self.transport.send(
            self.number,
            Method::BasicPublish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                mandatory: options.mandatory,
                immediate: options.immediate,
                properties,
                body,
            },
        ) {
            drop(writer);
            self.fail_for_transport(&err);
            return Err(err.into());
        }
        Ok(seq)
    }

    /// Settle one delivery, or everything up to `delivery_tag` with
    /// `multiple`. The broker is authoritative for delivery-tag state; no
    /// local bookkeeping happens here.
    pub fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.send_nowait(Method::BasicAck {
            delivery_tag,
            multiple,
        })
    }

    pub fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.send_nowait(Method::BasicNack {
            delivery_tag,
            multiple,
            requeue,
        })
    }

    pub fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.send_nowait(Method::BasicReject {
            delivery_tag,
            requeue,
        })
    }

    /// Put the channel into publisher-confirm mode. Irreversible for the
    /// channel's lifetime.
    pub fn confirm_select(&self) -> Result<()> {
        self.rpc(
            Method::ConfirmSelect { no_wait: false },
            &[MethodKind::ConfirmSelectOk],
        )?;
        self.confirm_mode.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn confirm_select_nowait(&self) -> Result<()> {
        self.send_nowait(Method::ConfirmSelect { no_wait: true })?;
        self.confirm_mode.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn tx_select(&self) -> Result<()> {
        self.rpc(Method::TxSelect, &[MethodKind::TxSelectOk])?;
        Ok(())
    }

    pub fn tx_commit(&self) -> Result<()> {
        self.rpc(Method::TxCommit, &[MethodKind::TxCommitOk])?;
        Ok(())
    }

    pub fn tx_rollback(&self) -> Result<()> {
        self.rpc(Method::TxRollback, &[MethodKind::TxRollbackOk])?;
        Ok(())
    }

    /// Block until every publish since the last successful wait is
    /// resolved. Returns `true` when all were acked, `false` when at least
    /// one nack arrived (the nack flag resets either way).
    pub fn wait_for_confirms(&self, timeout: Duration) -> Result<bool> {
        if !self.confirm_mode.load(Ordering::SeqCst) {
            return Err(ChannelError::NotInConfirmMode);
        }
        match self.confirms.wait(timeout) {
            WaitOutcome::AllAcked => Ok(true),
            WaitOutcome::SomeNacked | WaitOutcome::NackObserved => Ok(false),
            WaitOutcome::TimedOut => Err(ChannelError::ConfirmTimeout(timeout)),
            WaitOutcome::Aborted(reason) => Err(ChannelError::ChannelClosed(reason)),
        }
    }

    /// Like [`wait_for_confirms`](Self::wait_for_confirms), but errors the
    /// moment a nack is observed — without waiting for unrelated publishes
    /// still in flight — and closes the channel.
    pub fn wait_for_confirms_or_die(&self, timeout: Duration) -> Result<()> {
        if !self.confirm_mode.load(Ordering::SeqCst) {
            return Err(ChannelError::NotInConfirmMode);
        }
        match self.confirms.wait_fail_fast(timeout) {
            WaitOutcome::AllAcked => Ok(()),
            WaitOutcome::NackObserved | WaitOutcome::SomeNacked => {
                let reason = CloseReason::library(
                    close::PRECONDITION_FAILED,
                    "publishes negatively acknowledged",
                );
                self.notify_broker_close(&reason);
                self.shutdown(reason);
                Err(ChannelError::PublishesNacked)
            }
            WaitOutcome::TimedOut => Err(ChannelError::ConfirmTimeout(timeout)),
            WaitOutcome::Aborted(reason) => Err(ChannelError::ChannelClosed(reason)),
        }
    }

    /// Close the channel with a clean handshake. Idempotent: closing an
    /// already-closing channel reports success.
    pub fn close(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let reason = CloseReason::application();
        self.shutdown_cell.set_reason(reason.clone());
        // Callers blocked on earlier requests complete with the close
        // error, in the order they were issued, before the handshake.
        self.continuations
            .fail_all(|| ChannelError::ChannelClosed(reason.clone()));

        let outcome = self.close_handshake(&reason);
        self.shutdown(reason);
        outcome
    }

    fn close_handshake(&self, reason: &CloseReason) -> Result<()> {
        let promise = {
            let writer = self.writer_lock();
            let promise = self.continuations.push(&[MethodKind::ChannelCloseOk]);
            if let Err(err) = self.transport.send(
                self.number,
                Method::ChannelClose {
                    reply_code: reason.code,
                    reply_text: reason.text.clone(),
                },
            ) {
                drop(writer);
                // Transport gone while closing: the shutdown that follows
                // is the whole remedy.
                tracing::debug!(channel = self.number, error = %err, "close request not transmitted");
                return Ok(());
            }
            promise
        };

        match promise.wait(self.config.rpc_timeout) {
            Some(Ok(_)) => Ok(()),
            // Racing a broker-initiated close still ends closed; that is
            // what the caller asked for.
            Some(Err(ChannelError::ChannelClosed(_))) => Ok(()),
            Some(Err(err)) => Err(err),
            None => Err(ChannelError::RpcTimeout(self.config.rpc_timeout)),
        }
    }

    // ---- inbound routing (connection reader context) ---------------------

    /// Handle one decoded inbound method. Called from the connection's
    /// single reader; synchronous replies resolve continuations right here,
    /// everything asynchronous is handed to the dispatcher in arrival order.
    pub(crate) fn handle_frame(&self, method: Method) {
        match method {
            Method::ChannelClose {
                reply_code,
                reply_text,
            } => {
                let reason = CloseReason::broker(reply_code, reply_text);
                {
                    let _writer = self.writer_lock();
                    let _ = self.transport.send(self.number, Method::ChannelCloseOk);
                }
                self.shutdown(reason);
            }
            Method::ChannelFlow { active } => {
                self.flow_active.store(active, Ordering::SeqCst);
                {
                    let _writer = self.writer_lock();
                    let _ = self
                        .transport
                        .send(self.number, Method::ChannelFlowOk { active });
                }
                self.enqueue(DispatchItem::Event(ChannelEvent::Flow { active }));
            }
            Method::BasicDeliver(delivery) => self.enqueue(DispatchItem::Deliver(delivery)),
            Method::BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
                properties,
                body,
            } => {
                self.enqueue(DispatchItem::Event(ChannelEvent::Return(ReturnedMessage {
                    reply_code,
                    reply_text,
                    exchange,
                    routing_key,
                    properties,
                    body,
                })));
            }
            Method::BasicAck {
                delivery_tag,
                multiple,
            } => {
                if self.confirm_mode.load(Ordering::SeqCst) {
                    self.confirms.handle_ack(delivery_tag, multiple);
                    self.enqueue(DispatchItem::Event(ChannelEvent::Ack {
                        delivery_tag,
                        multiple,
                    }));
                } else {
                    tracing::warn!(
                        channel = self.number,
                        delivery_tag,
                        "broker ack outside confirm mode ignored"
                    );
                }
            }
            Method::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            } => {
                if self.confirm_mode.load(Ordering::SeqCst) {
                    self.confirms.handle_nack(delivery_tag, multiple);
                    self.enqueue(DispatchItem::Event(ChannelEvent::Nack {
                        delivery_tag,
                        multiple,
                        requeue,
                    }));
                } else {
                    tracing::warn!(
                        channel = self.number,
                        delivery_tag,
                        "broker nack outside confirm mode ignored"
                    );
                }
            }
            Method::BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                if !no_wait {
                    let _writer = self.writer_lock();
                    let _ = self.transport.send(
                        self.number,
                        Method::BasicCancelOk {
                            consumer_tag: consumer_tag.clone(),
                        },
                    );
                }
                self.enqueue(DispatchItem::BrokerCancel { tag: consumer_tag });
            }
            method if method.kind().is_synchronous_reply() => self.resolve_reply(method),
            method => {
                let kind = method.kind();
                tracing::warn!(channel = self.number, ?kind, "unroutable inbound method");
                let reason = CloseReason::library(
                    close::CHANNEL_ERROR,
                    format!("unroutable inbound method {kind:?}"),
                );
                self.notify_broker_close(&reason);
                self.shutdown(reason);
            }
        }
    }

    fn resolve_reply(&self, method: Method) {
        // While the close handshake runs, only its confirmation matters;
        // replies to already-failed requests are expected stragglers. After
        // the channel is fully closed, everything inbound is a straggler.
        let state = self.state.load(Ordering::SeqCst);
        if state == STATE_CLOSED
            || (state == STATE_CLOSING && method.kind() != MethodKind::ChannelCloseOk)
        {
            tracing::trace!(
                channel = self.number,
                kind = ?method.kind(),
                "stale reply during teardown dropped"
            );
            return;
        }

        // Consume/cancel replies adjust the dispatch table through the
        // dispatcher queue, so registry changes stay ordered with
        // deliveries already queued behind them.
        match &method {
            Method::BasicConsumeOk { consumer_tag } => {
                let pending = self
                    .pending_consumers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                match pending {
                    Some(consumer) => self.enqueue(DispatchItem::Register {
                        tag: consumer_tag.clone(),
                        consumer,
                    }),
                    None => tracing::warn!(
                        channel = self.number,
                        tag = %consumer_tag,
                        "consume-ok with no pending consumer"
                    ),
                }
            }
            Method::BasicCancelOk { consumer_tag } => self.enqueue(DispatchItem::Remove {
                tag: consumer_tag.clone(),
            }),
            _ => {}
        }

        match self.continuations.resolve(method) {
            Resolution::Completed => {}
            Resolution::NonePending { got } => {
                let reason = CloseReason::library(
                    close::CHANNEL_ERROR,
                    format!("reply {got:?} with no pending request"),
                );
                self.notify_broker_close(&reason);
                self.shutdown(reason);
            }
            Resolution::Mismatch { expected, got } => {
                let reason = CloseReason::library(
                    close::CHANNEL_ERROR,
                    format!("expected reply {expected:?}, got {got:?}"),
                );
                self.notify_broker_close(&reason);
                self.shutdown(reason);
            }
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Force the channel into its terminal state. The first caller wins the
    /// close reason; teardown runs exactly once: pending requests fail in
    /// FIFO order, outstanding confirms resolve as failed, and the
    /// shutdown notification fires.
    pub(crate) fn shutdown(&self, reason: CloseReason) {
        self.shutdown_cell.set_reason(reason);
        if self.state.swap(STATE_CLOSED, Ordering::SeqCst) == STATE_CLOSED {
            return;
        }
        let stored = self
            .shutdown_cell
            .reason()
            .unwrap_or_else(CloseReason::application);

        self.continuations
            .fail_all(|| ChannelError::ChannelClosed(stored.clone()));
        self.confirms.abort(stored.clone());
        self.pending_consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.enqueue(DispatchItem::Shutdown(stored.clone()));
        self.shutdown_cell.settle();
        tracing::debug!(channel = self.number, reason = %stored, "channel shut down");
    }

    // ---- internals -------------------------------------------------------

    fn rpc(&self, request: Method, expected: &'static [MethodKind]) -> Result<Method> {
        self.ensure_open()?;
        let promise = {
            let writer = self.writer_lock();
            self.ensure_open()?;
            let promise = self.continuations.push(expected);
            if let Err(err) = self.transport.send(self.number, request) {
                drop(writer);
                self.fail_for_transport(&err);
                return Err(err.into());
            }
            promise
        };
        self.await_reply(promise)
    }

    fn await_reply(&self, promise: Promise) -> Result<Method> {
        let timeout = self.config.rpc_timeout;
        match promise.wait(timeout) {
            Some(result) => result,
            None => {
                // A late reply would desynchronize the FIFO, so the whole
                // channel goes down, not just this call.
                let reason = CloseReason::library(
                    close::CHANNEL_ERROR,
                    format!("no reply within {timeout:?}"),
                );
                self.notify_broker_close(&reason);
                self.shutdown(reason);
                Err(ChannelError::RpcTimeout(timeout))
            }
        }
    }

    /// Transmit a request that carries its own no-wait flag (or expects no
    /// reply at all). Local validation has already happened by the time
    /// this runs.
    fn send_nowait(&self, method: Method) -> Result<()> {
        self.ensure_open()?;
        let writer = self.writer_lock();
        self.ensure_open()?;
        if let Err(err) = self.transport.send(self.number, method) {
            drop(writer);
            self.fail_for_transport(&err);
            return Err(err.into());
        }
        Ok(())
    }

    fn fail_for_transport(&self, err: &amqmux_transport::TransportError) {
        self.shutdown(CloseReason::library(
            close::INTERNAL_ERROR,
            format!("transport failure: {err}"),
        ));
    }

    fn notify_broker_close(&self, reason: &CloseReason) {
        let _writer = self.writer_lock();
        let _ = self.transport.send(
            self.number,
            Method::ChannelClose {
                reply_code: reason.code,
                reply_text: reason.text.clone(),
            },
        );
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.load(Ordering::SeqCst) == STATE_OPEN {
            Ok(())
        } else {
            Err(ChannelError::ChannelClosed(
                self.shutdown_cell
                    .reason()
                    .unwrap_or_else(|| CloseReason::library(close::CHANNEL_ERROR, "channel unusable")),
            ))
        }
    }

    fn enqueue(&self, item: DispatchItem) {
        if self.dispatch_tx.send(item).is_err() {
            tracing::trace!(channel = self.number, "dispatcher gone, item dropped");
        }
    }

    fn emit_event(&self, event: ChannelEvent) {
        let sink = self
            .event_sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            if catch_unwind(AssertUnwindSafe(|| sink.on_event(event))).is_err() {
                tracing::warn!(channel = self.number, "event sink panicked");
            }
        }
    }

    fn writer_lock(&self) -> MutexGuard<'_, WriterState> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.state.load(Ordering::SeqCst) != STATE_CLOSED {
            self.shutdown(CloseReason::library(
                close::REPLY_SUCCESS,
                "channel dropped without close",
            ));
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.number)
            .field("state", &self.state.load(Ordering::SeqCst))
            .field("confirm_mode", &self.confirm_mode.load(Ordering::SeqCst))
            .finish()
    }
}

/// Dispatcher loop: one thread per channel applies deliveries, registry
/// changes and events in the exact order the reader enqueued them.
fn run_dispatcher(channel: Weak<Channel>, items: Receiver<DispatchItem>) {
    let mut table = DispatchTable::new();
    while let Ok(item) = items.recv() {
        match item {
            DispatchItem::Register { tag, consumer } => table.register(tag, consumer),
            DispatchItem::Remove { tag } => {
                table.remove(&tag);
            }
            DispatchItem::SetDefault(consumer) => table.set_default(consumer),
            DispatchItem::Deliver(delivery) => {
                let Some(channel) = channel.upgrade() else {
                    break;
                };
                match table.dispatch(&channel, delivery) {
                    DispatchOutcome::Delivered => {}
                    DispatchOutcome::CallbackPanicked(context) => {
                        channel.emit_event(ChannelEvent::CallbackException { context });
                    }
                    DispatchOutcome::UnknownTag(tag) => {
                        tracing::error!(
                            channel = channel.number,
                            tag = %tag,
                            "delivery for unknown consumer and no default registered"
                        );
                        let reason = CloseReason::library(
                            close::INTERNAL_ERROR,
                            format!("delivery for unknown consumer tag {tag:?}"),
                        );
                        channel.notify_broker_close(&reason);
                        channel.shutdown(reason);
                    }
                }
            }
            DispatchItem::BrokerCancel { tag } => {
                let Some(channel) = channel.upgrade() else {
                    break;
                };
                match table.notify_cancel(&tag) {
                    CancelOutcome::Done => {}
                    CancelOutcome::NotRegistered => {
                        tracing::debug!(channel = channel.number, tag = %tag, "cancel for unknown consumer");
                    }
                    CancelOutcome::Panicked(context) => {
                        channel.emit_event(ChannelEvent::CallbackException { context });
                    }
                }
                channel.emit_event(ChannelEvent::CancelledByBroker { consumer_tag: tag });
            }
            DispatchItem::Event(event) => {
                let Some(channel) = channel.upgrade() else {
                    break;
                };
                channel.emit_event(event);
            }
            DispatchItem::Shutdown(reason) => {
                if let Some(channel) = channel.upgrade() {
                    channel.emit_event(ChannelEvent::Shutdown(reason));
                }
                break;
            }
        }
    }
}

fn exchange_declare_method(
    exchange: &str,
    kind: &str,
    options: &ExchangeDeclareOptions,
    passive: bool,
    no_wait: bool,
) -> Method {
    Method::ExchangeDeclare {
        exchange: exchange.to_string(),
        kind: kind.to_string(),
        passive,
        durable: options.durable,
        auto_delete: options.auto_delete,
        internal: options.internal,
        no_wait,
        arguments: options.arguments.clone(),
    }
}

fn queue_declare_method(
    queue: &str,
    options: &QueueDeclareOptions,
    passive: bool,
    no_wait: bool,
) -> Method {
    Method::QueueDeclare {
        queue: queue.to_string(),
        passive,
        durable: options.durable,
        exclusive: options.exclusive,
        auto_delete: options.auto_delete,
        no_wait,
        arguments: options.arguments.clone(),
    }
}

fn consume_method(
    queue: &str,
    consumer_tag: &str,
    options: &ConsumeOptions,
    no_wait: bool,
) -> Method {
    Method::BasicConsume {
        queue: queue.to_string(),
        consumer_tag: consumer_tag.to_string(),
        no_local: options.no_local,
        no_ack: options.no_ack,
        exclusive: options.exclusive,
        no_wait,
        arguments: options.arguments.clone(),
    }
}

fn queue_info_from_reply(reply: Method) -> Result<QueueInfo> {
    match reply {
        Method::QueueDeclareOk {
            queue,
            message_count,
            consumer_count,
        } => Ok(QueueInfo {
            name: queue,
            message_count,
            consumer_count,
        }),
        other => Err(unexpected_reply(other)),
    }
}

fn unexpected_reply(reply: Method) -> ChannelError {
    ChannelError::Protocol(format!("unexpected reply {:?}", reply.kind()))
}
