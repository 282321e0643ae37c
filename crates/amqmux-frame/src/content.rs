use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Header and argument tables.
///
/// Wire-format encoding of field tables belongs to the codec layer; within
/// the client they are opaque structured values.
pub type FieldTable = BTreeMap<String, serde_json::Value>;

/// Read access to message metadata, independent of its concrete
/// representation.
pub trait PropertyBag {
    fn content_type(&self) -> Option<&str>;
    fn correlation_id(&self) -> Option<&str>;
    fn reply_to(&self) -> Option<&str>;
    fn header(&self, key: &str) -> Option<&serde_json::Value>;
}

/// The standard per-message property set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "FieldTable::is_empty")]
    pub headers: FieldTable,
    /// 1 = transient, 2 = persistent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

impl PropertyBag for BasicProperties {
    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    fn header(&self, key: &str) -> Option<&serde_json::Value> {
        self.headers.get(key)
    }
}

/// One message pushed to a registered consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub consumer_tag: String,
    /// Broker-assigned identifier used to ack/nack/reject this delivery.
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// A mandatory/immediate publish the broker handed back unrouted.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// A message retrieved synchronously with a get operation.
#[derive(Debug, Clone, PartialEq)]
pub struct GetMessage {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    /// Messages left on the queue after this one was removed.
    pub message_count: u32,
    pub properties: BasicProperties,
    pub body: Bytes,
}
