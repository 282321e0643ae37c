use bytes::Bytes;

use crate::content::{BasicProperties, Delivery, FieldTable, GetMessage};
use crate::error::{FrameError, Result};

/// Maximum byte length of a short-string field (names, routing keys, tags).
pub const MAX_SHORTSTR: usize = 255;

/// Validate a short-string field against the protocol's 255-byte limit.
///
/// Applied to queue and exchange names, routing keys and consumer tags
/// before anything is handed to the transport.
pub fn validate_shortstr(label: &'static str, value: &str) -> Result<()> {
    if value.len() > MAX_SHORTSTR {
        return Err(FrameError::ShortStringTooLong {
            label,
            len: value.len(),
            max: MAX_SHORTSTR,
        });
    }
    Ok(())
}

/// A decoded protocol method, content already assembled where applicable.
///
/// Both directions share the one type: the transport encodes outbound
/// variants, the reader hands inbound variants to the channel engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ChannelOpen,
    ChannelOpenOk,
    /// Broker-to-client pause/resume signal.
    ChannelFlow {
        active: bool,
    },
    ChannelFlowOk {
        active: bool,
    },
    ChannelClose {
        reply_code: u16,
        reply_text: String,
    },
    ChannelCloseOk,

    ExchangeDeclare {
        exchange: String,
        kind: String,
        passive: bool,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeDeclareOk,
    ExchangeDelete {
        exchange: String,
        if_unused: bool,
        no_wait: bool,
    },
    ExchangeDeleteOk,
    ExchangeBind {
        destination: String,
        source: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeBindOk,
    ExchangeUnbind {
        destination: String,
        source: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeUnbindOk,

    QueueDeclare {
        queue: String,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueBindOk,
    QueueUnbind {
        queue: String,
        exchange: String,
        routing_key: String,
        arguments: FieldTable,
    },
    QueueUnbindOk,
    QueuePurge {
        queue: String,
        no_wait: bool,
    },
    QueuePurgeOk {
        message_count: u32,
    },
    QueueDelete {
        queue: String,
        if_unused: bool,
        if_empty: bool,
        no_wait: bool,
    },
    QueueDeleteOk {
        message_count: u32,
    },

    BasicQos {
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    },
    BasicQosOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    /// Client-to-broker cancel, or broker-initiated consumer cancellation.
    BasicCancel {
        consumer_tag: String,
        no_wait: bool,
    },
    BasicCancelOk {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
        properties: BasicProperties,
        body: Bytes,
    },
    BasicReturn {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
        properties: BasicProperties,
        body: Bytes,
    },
    BasicDeliver(Delivery),
    BasicGet {
        queue: String,
        no_ack: bool,
    },
    BasicGetOk(GetMessage),
    BasicGetEmpty,
    /// Settles deliveries client-side, or confirms publishes broker-side.
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicNack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
    BasicReject {
        delivery_tag: u64,
        requeue: bool,
    },
    BasicRecover {
        requeue: bool,
    },
    BasicRecoverOk,

    ConfirmSelect {
        no_wait: bool,
    },
    ConfirmSelectOk,

    TxSelect,
    TxSelectOk,
    TxCommit,
    TxCommitOk,
    TxRollback,
    TxRollbackOk,
}

/// Fieldless discriminant used for continuation matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow,
    ChannelFlowOk,
    ChannelClose,
    ChannelCloseOk,
    ExchangeDeclare,
    ExchangeDeclareOk,
    ExchangeDelete,
    ExchangeDeleteOk,
    ExchangeBind,
    ExchangeBindOk,
    ExchangeUnbind,
    ExchangeUnbindOk,
    QueueDeclare,
    QueueDeclareOk,
    QueueBind,
    QueueBindOk,
    QueueUnbind,
    QueueUnbindOk,
    QueuePurge,
    QueuePurgeOk,
    QueueDelete,
    QueueDeleteOk,
    BasicQos,
    BasicQosOk,
    BasicConsume,
    BasicConsumeOk,
    BasicCancel,
    BasicCancelOk,
    BasicPublish,
    BasicReturn,
    BasicDeliver,
    BasicGet,
    BasicGetOk,
    BasicGetEmpty,
    BasicAck,
    BasicNack,
    BasicReject,
    BasicRecover,
    BasicRecoverOk,
    ConfirmSelect,
    ConfirmSelectOk,
    TxSelect,
    TxSelectOk,
    TxCommit,
    TxCommitOk,
    TxRollback,
    TxRollbackOk,
}

impl Method {
    /// The discriminant of this method.
    pub fn kind(&self) -> MethodKind {
        match self {
            Method::ChannelOpen => MethodKind::ChannelOpen,
            Method::ChannelOpenOk => MethodKind::ChannelOpenOk,
            Method::ChannelFlow { .. } => MethodKind::ChannelFlow,
            Method::ChannelFlowOk { .. } => MethodKind::ChannelFlowOk,
            Method::ChannelClose { .. } => MethodKind::ChannelClose,
            Method::ChannelCloseOk => MethodKind::ChannelCloseOk,
            Method::ExchangeDeclare { .. } => MethodKind::ExchangeDeclare,
            Method::ExchangeDeclareOk => MethodKind::ExchangeDeclareOk,
            Method::ExchangeDelete { .. } => MethodKind::ExchangeDelete,
            Method::ExchangeDeleteOk => MethodKind::ExchangeDeleteOk,
            Method::ExchangeBind { .. } => MethodKind::ExchangeBind,
            Method::ExchangeBindOk => MethodKind::ExchangeBindOk,
            Method::ExchangeUnbind { .. } => MethodKind::ExchangeUnbind,
            Method::ExchangeUnbindOk => MethodKind::ExchangeUnbindOk,
            Method::QueueDeclare { .. } => MethodKind::QueueDeclare,
            Method::QueueDeclareOk { .. } => MethodKind::QueueDeclareOk,
            Method::QueueBind { .. } => MethodKind::QueueBind,
            Method::QueueBindOk => MethodKind::QueueBindOk,
            Method::QueueUnbind { .. } => MethodKind::QueueUnbind,
            Method::QueueUnbindOk => MethodKind::QueueUnbindOk,
            Method::QueuePurge { .. } => MethodKind::QueuePurge,
            Method::QueuePurgeOk { .. } => MethodKind::QueuePurgeOk,
            Method::QueueDelete { .. } => MethodKind::QueueDelete,
            Method::QueueDeleteOk { .. } => MethodKind::QueueDeleteOk,
            Method::BasicQos { .. } => MethodKind::BasicQos,
            Method::BasicQosOk => MethodKind::BasicQosOk,
            Method::BasicConsume { .. } => MethodKind::BasicConsume,
            Method::BasicConsumeOk { .. } => MethodKind::BasicConsumeOk,
            Method::BasicCancel { .. } => MethodKind::BasicCancel,
            Method::BasicCancelOk { .. } => MethodKind::BasicCancelOk,
            Method::BasicPublish { .. } => MethodKind::BasicPublish,
            Method::BasicReturn { .. } => MethodKind::BasicReturn,
            Method::BasicDeliver(_) => MethodKind::BasicDeliver,
            Method::BasicGet { .. } => MethodKind::BasicGet,
            Method::BasicGetOk(_) => MethodKind::BasicGetOk,
            Method::BasicGetEmpty => MethodKind::BasicGetEmpty,
            Method::BasicAck { .. } => MethodKind::BasicAck,
            Method::BasicNack { .. } => MethodKind::BasicNack,
            Method::BasicReject { .. } => MethodKind::BasicReject,
            Method::BasicRecover { .. } => MethodKind::BasicRecover,
            Method::BasicRecoverOk => MethodKind::BasicRecoverOk,
            Method::ConfirmSelect { .. } => MethodKind::ConfirmSelect,
            Method::ConfirmSelectOk => MethodKind::ConfirmSelectOk,
            Method::TxSelect => MethodKind::TxSelect,
            Method::TxSelectOk => MethodKind::TxSelectOk,
            Method::TxCommit => MethodKind::TxCommit,
            Method::TxCommitOk => MethodKind::TxCommitOk,
            Method::TxRollback => MethodKind::TxRollback,
            Method::TxRollbackOk => MethodKind::TxRollbackOk,
        }
    }
}

impl MethodKind {
    /// True for inbound methods that complete a pending synchronous request.
    ///
    /// Everything else arriving from the broker is an asynchronous event
    /// (delivery, return, confirm, flow, close) and is routed around the
    /// continuation queue.
    pub fn is_synchronous_reply(self) -> bool {
        matches!(
            self,
            MethodKind::ChannelOpenOk
                | MethodKind::ChannelCloseOk
                | MethodKind::ExchangeDeclareOk
                | MethodKind::ExchangeDeleteOk
                | MethodKind::ExchangeBindOk
                | MethodKind::ExchangeUnbindOk
                | MethodKind::QueueDeclareOk
                | MethodKind::QueueBindOk
                | MethodKind::QueueUnbindOk
                | MethodKind::QueuePurgeOk
                | MethodKind::QueueDeleteOk
                | MethodKind::BasicQosOk
                | MethodKind::BasicConsumeOk
                | MethodKind::BasicCancelOk
                | MethodKind::BasicGetOk
                | MethodKind::BasicGetEmpty
                | MethodKind::BasicRecoverOk
                | MethodKind::ConfirmSelectOk
                | MethodKind::TxSelectOk
                | MethodKind::TxCommitOk
                | MethodKind::TxRollbackOk
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortstr_accepts_up_to_limit() {
        let max = "q".repeat(MAX_SHORTSTR);
        assert!(validate_shortstr("queue", &max).is_ok());
        assert!(validate_shortstr("queue", "").is_ok());
    }

    #[test]
    fn shortstr_rejects_over_limit() {
        let long = "k".repeat(MAX_SHORTSTR + 1);
        let err = validate_shortstr("routing key", &long).unwrap_err();
        match err {
            FrameError::ShortStringTooLong { label, len, max } => {
                assert_eq!(label, "routing key");
                assert_eq!(len, 256);
                assert_eq!(max, 255);
            }
        }
    }

    #[test]
    fn shortstr_limit_is_bytes_not_chars() {
        // 128 two-byte characters: 128 chars, 256 bytes.
        let wide = "é".repeat(128);
        assert_eq!(wide.chars().count(), 128);
        assert!(validate_shortstr("queue", &wide).is_err());
    }

    #[test]
    fn reply_classification() {
        assert!(MethodKind::QueueDeclareOk.is_synchronous_reply());
        assert!(MethodKind::BasicGetEmpty.is_synchronous_reply());
        assert!(MethodKind::ChannelCloseOk.is_synchronous_reply());

        // Broker-initiated traffic never pops a continuation.
        assert!(!MethodKind::BasicDeliver.is_synchronous_reply());
        assert!(!MethodKind::BasicReturn.is_synchronous_reply());
        assert!(!MethodKind::BasicAck.is_synchronous_reply());
        assert!(!MethodKind::BasicNack.is_synchronous_reply());
        assert!(!MethodKind::ChannelFlow.is_synchronous_reply());
        assert!(!MethodKind::ChannelClose.is_synchronous_reply());
        assert!(!MethodKind::BasicCancel.is_synchronous_reply());
    }

    #[test]
    fn kind_matches_variant() {
        let method = Method::QueueDeclare {
            queue: "jobs".to_string(),
            passive: false,
            durable: true,
            exclusive: false,
            auto_delete: false,
            no_wait: false,
            arguments: FieldTable::new(),
        };
        assert_eq!(method.kind(), MethodKind::QueueDeclare);

        let reply = Method::QueueDeclareOk {
            queue: "jobs".to_string(),
            message_count: 0,
            consumer_count: 0,
        };
        assert_eq!(reply.kind(), MethodKind::QueueDeclareOk);
    }
}
