//! End-to-end exercises against a scripted in-process broker.
//!
//! The broker side of the loopback answers protocol methods the way a real
//! broker would: open/close handshakes, declare replies, publisher
//! confirms, and deliveries to registered consumers. Frames flow back in
//! through `Connection::route_frame`, i.e. the same single-reader path the
//! production codec would use.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use amqmux_client::{
    Channel, ChannelConfig, ChannelError, ConnectionConfig, ConsumeOptions, Consumer,
    PublishOptions, QueueDeclareOptions,
};
use amqmux_frame::{close, BasicProperties, Delivery, GetMessage, Method};
use amqmux_transport::{loopback, LoopbackReceiver};
use bytes::Bytes;

struct BrokerState {
    queues: HashMap<String, VecDeque<Bytes>>,
    /// queue name -> (channel, consumer tag)
    consumers: HashMap<String, (u16, String)>,
    confirm_channels: HashSet<u16>,
    publish_seq: HashMap<u16, u64>,
    next_ctag: u64,
    next_delivery_tag: u64,
}

fn spawn_broker(
    connection: Arc<amqmux_client::Connection>,
    wire: LoopbackReceiver,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut state = BrokerState {
            queues: HashMap::new(),
            consumers: HashMap::new(),
            confirm_channels: HashSet::new(),
            publish_seq: HashMap::new(),
            next_ctag: 1,
            next_delivery_tag: 1,
        };

        while let Some((number, method)) = wire.recv() {
            match method {
                Method::ChannelOpen => connection.route_frame(number, Method::ChannelOpenOk),
                Method::ChannelClose { .. } => {
                    connection.route_frame(number, Method::ChannelCloseOk);
                }
                Method::ChannelCloseOk => {}

                Method::QueueDeclare { queue, passive, .. } => {
                    if passive && !state.queues.contains_key(&queue) {
                        connection.route_frame(
                            number,
                            Method::ChannelClose {
                                reply_code: close::NOT_FOUND,
                                reply_text: format!("no queue '{queue}'"),
                            },
                        );
                        continue;
                    }
                    let name = if queue.is_empty() {
                        format!("amq.gen-{}", state.queues.len() + 1)
                    } else {
                        queue
                    };
                    let backlog = state.queues.entry(name.clone()).or_default();
                    let message_count = backlog.len() as u32;
                    let consumer_count = u32::from(state.consumers.contains_key(&name));
                    connection.route_frame(
                        number,
                        Method::QueueDeclareOk {
                            queue: name,
                            message_count,
                            consumer_count,
                        },
                    );
                }
                Method::QueueBind { .. } => connection.route_frame(number, Method::QueueBindOk),
                Method::QueueUnbind { .. } => {
                    connection.route_frame(number, Method::QueueUnbindOk);
                }
                Method::QueuePurge { queue, .. } => {
                    let purged = state
                        .queues
                        .get_mut(&queue)
                        .map(|backlog| {
                            let n = backlog.len() as u32;
                            backlog.clear();
                            n
                        })
                        .unwrap_or(0);
                    connection.route_frame(
                        number,
                        Method::QueuePurgeOk {
                            message_count: purged,
                        },
                    );
                }
                Method::QueueDelete { queue, .. } => {
                    let removed = state
                        .queues
                        .remove(&queue)
                        .map(|backlog| backlog.len() as u32)
                        .unwrap_or(0);
                    connection.route_frame(
                        number,
                        Method::QueueDeleteOk {
                            message_count: removed,
                        },
                    );
                }

                Method::ExchangeDeclare { .. } => {
                    connection.route_frame(number, Method::ExchangeDeclareOk);
                }
                Method::ExchangeDelete { .. } => {
                    connection.route_frame(number, Method::ExchangeDeleteOk);
                }
                Method::ExchangeBind { .. } => {
                    connection.route_frame(number, Method::ExchangeBindOk);
                }
                Method::ExchangeUnbind { .. } => {
                    connection.route_frame(number, Method::ExchangeUnbindOk);
                }

                Method::BasicQos { .. } => connection.route_frame(number, Method::BasicQosOk),
                Method::BasicRecover { .. } => {
                    connection.route_frame(number, Method::BasicRecoverOk);
                }

                Method::BasicConsume {
                    queue,
                    consumer_tag,
                    no_wait,
                    ..
                } => {
                    let tag = if consumer_tag.is_empty() {
                        let tag = format!("ctag-{}", state.next_ctag);
                        state.next_ctag += 1;
                        tag
                    } else {
                        consumer_tag
                    };
                    state.consumers.insert(queue, (number, tag.clone()));
                    if !no_wait {
                        connection
                            .route_frame(number, Method::BasicConsumeOk { consumer_tag: tag });
                    }
                }
                Method::BasicCancel {
                    consumer_tag,
                    no_wait,
                } => {
                    state
                        .consumers
                        .retain(|_, (_, tag)| *tag != consumer_tag);
                    if !no_wait {
                        connection.route_frame(
                            number,
                            Method::BasicCancelOk { consumer_tag },
                        );
                    }
                }

                Method::BasicPublish {
                    routing_key, body, ..
                } => {
                    // Default-exchange semantics: the routing key names the
                    // queue directly.
                    if let Some((consumer_channel, tag)) =
                        state.consumers.get(&routing_key).cloned()
                    {
                        let delivery_tag = state.next_delivery_tag;
                        state.next_delivery_tag += 1;
                        connection.route_frame(
                            consumer_channel,
                            Method::BasicDeliver(Delivery {
                                consumer_tag: tag,
                                delivery_tag,
                                redelivered: false,
                                exchange: String::new(),
                                routing_key: routing_key.clone(),
                                properties: BasicProperties::default(),
                                body: body.clone(),
                            }),
                        );
                    } else {
                        state
                            .queues
                            .entry(routing_key.clone())
                            .or_default()
                            .push_back(body);
                    }

                    if state.confirm_channels.contains(&number) {
                        let seq = state.publish_seq.entry(number).or_insert(1);
                        let delivery_tag = *seq;
                        *seq += 1;
                        connection.route_frame(
                            number,
                            Method::BasicAck {
                                delivery_tag,
                                multiple: false,
                            },
                        );
                    }
                }

                Method::BasicGet { queue, .. } => {
                    let next = state
                        .queues
                        .get_mut(&queue)
                        .and_then(|backlog| backlog.pop_front());
                    match next {
                        Some(body) => {
                            let remaining = state
                                .queues
                                .get(&queue)
                                .map(|backlog| backlog.len() as u32)
                                .unwrap_or(0);
                            let delivery_tag = state.next_delivery_tag;
                            state.next_delivery_tag += 1;
                            connection.route_frame(
                                number,
                                Method::BasicGetOk(GetMessage {
                                    delivery_tag,
                                    redelivered: false,
                                    exchange: String::new(),
                                    routing_key: queue,
                                    message_count: remaining,
                                    properties: BasicProperties::default(),
                                    body,
                                }),
                            );
                        }
                        None => connection.route_frame(number, Method::BasicGetEmpty),
                    }
                }

                Method::ConfirmSelect { no_wait } => {
                    state.confirm_channels.insert(number);
                    if !no_wait {
                        connection.route_frame(number, Method::ConfirmSelectOk);
                    }
                }

                Method::TxSelect => connection.route_frame(number, Method::TxSelectOk),
                Method::TxCommit => connection.route_frame(number, Method::TxCommitOk),
                Method::TxRollback => connection.route_frame(number, Method::TxRollbackOk),

                // Client-side settlements carry no reply.
                Method::BasicAck { .. }
                | Method::BasicNack { .. }
                | Method::BasicReject { .. }
                | Method::ChannelFlowOk { .. } => {}

                other => panic!("broker got unexpected method {:?}", other.kind()),
            }
        }
    })
}

fn connect() -> (
    Arc<amqmux_client::Connection>,
    Arc<amqmux_transport::LoopbackTransport>,
    JoinHandle<()>,
) {
    let (transport, wire) = loopback();
    let config = ConnectionConfig::default().with_channel_config(
        ChannelConfig::default().with_rpc_timeout(Duration::from_secs(2)),
    );
    let connection = amqmux_client::Connection::new(transport.clone(), config);
    let broker = spawn_broker(Arc::clone(&connection), wire);
    (connection, transport, broker)
}

struct Collector {
    seen: Mutex<mpsc::Sender<Delivery>>,
    ack: bool,
}

impl Consumer for Collector {
    fn handle_delivery(&self, channel: &Channel, delivery: Delivery) {
        if self.ack {
            channel.basic_ack(delivery.delivery_tag, false).unwrap();
        }
        self.seen.lock().unwrap().send(delivery).unwrap();
    }
}

#[test]
fn full_publish_consume_session() {
    let (connection, transport, broker) = connect();
    let channel = connection.open_channel().unwrap();

    let info = channel
        .queue_declare("jobs", &QueueDeclareOptions::default())
        .unwrap();
    assert_eq!(info.name, "jobs");
    assert_eq!(info.message_count, 0);

    channel.confirm_select().unwrap();

    let (tx, deliveries) = mpsc::channel();
    let tag = channel
        .basic_consume(
            "jobs",
            "",
            &ConsumeOptions::default(),
            Arc::new(Collector {
                seen: Mutex::new(tx),
                ack: true,
            }),
        )
        .unwrap();
    assert_eq!(tag, "ctag-1");

    for body in ["first", "second"] {
        let seq = channel
            .basic_publish(
                "",
                "jobs",
                &PublishOptions::default(),
                BasicProperties::default(),
                body,
            )
            .unwrap();
        assert!(seq.is_some());
    }
    assert!(channel.wait_for_confirms(Duration::from_secs(2)).unwrap());

    let first = deliveries.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = deliveries.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first.body, Bytes::from_static(b"first"));
    assert_eq!(second.body, Bytes::from_static(b"second"));
    assert!(second.delivery_tag > first.delivery_tag);

    channel.basic_cancel(&tag).unwrap();
    channel.close().unwrap();
    assert!(!channel.is_open());

    transport.close();
    broker.join().unwrap();
}

#[test]
fn passive_declare_failure_closes_only_that_channel() {
    let (connection, transport, broker) = connect();
    let doomed = connection.open_channel().unwrap();

    let err = doomed.queue_declare_passive("missing").unwrap_err();
    match err {
        ChannelError::ChannelClosed(reason) => {
            assert_eq!(reason.code, close::NOT_FOUND);
            assert!(reason.text.contains("missing"));
        }
        other => panic!("expected channel-closed, got {other}"),
    }
    assert!(!doomed.is_open());

    // Channels are independent: a fresh one on the same connection works.
    let fresh = connection.open_channel().unwrap();
    let info = fresh
        .queue_declare("jobs", &QueueDeclareOptions::default())
        .unwrap();
    assert_eq!(info.name, "jobs");

    transport.close();
    broker.join().unwrap();
}

#[test]
fn get_drains_backlog_then_reports_empty() {
    let (connection, transport, broker) = connect();
    let channel = connection.open_channel().unwrap();
    channel
        .queue_declare("inbox", &QueueDeclareOptions::default())
        .unwrap();

    channel
        .basic_publish(
            "",
            "inbox",
            &PublishOptions::default(),
            BasicProperties::default(),
            "only",
        )
        .unwrap();

    let first = channel.basic_get("inbox", false).unwrap();
    let message = first.message().expect("backlogged message");
    assert_eq!(message.body, Bytes::from_static(b"only"));
    assert_eq!(message.message_count, 0);
    channel.basic_ack(message.delivery_tag, false).unwrap();

    let second = channel.basic_get("inbox", false).unwrap();
    assert!(second.is_empty());

    transport.close();
    broker.join().unwrap();
}

#[test]
fn passive_declare_reports_backlog_counts() {
    let (connection, transport, broker) = connect();
    let channel = connection.open_channel().unwrap();
    channel
        .queue_declare("metrics", &QueueDeclareOptions::default())
        .unwrap();

    for i in 0..3 {
        channel
            .basic_publish(
                "",
                "metrics",
                &PublishOptions::default(),
                BasicProperties::default(),
                format!("m{i}"),
            )
            .unwrap();
    }

    let info = channel.queue_declare_passive("metrics").unwrap();
    assert_eq!(info.message_count, 3);
    assert_eq!(info.consumer_count, 0);
    assert_eq!(channel.message_count("metrics").unwrap(), 3);

    transport.close();
    broker.join().unwrap();
}

#[test]
fn generated_queue_name_comes_back_from_declare() {
    let (connection, transport, broker) = connect();
    let channel = connection.open_channel().unwrap();

    let info = channel
        .queue_declare("", &QueueDeclareOptions::default())
        .unwrap();
    assert!(info.name.starts_with("amq.gen-"));

    transport.close();
    broker.join().unwrap();
}
