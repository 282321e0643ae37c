use amqmux_frame::{FieldTable, GetMessage};

/// Attributes for exchange declaration.
#[derive(Debug, Clone, Default)]
pub struct ExchangeDeclareOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: FieldTable,
}

/// Attributes for queue declaration.
#[derive(Debug, Clone, Default)]
pub struct QueueDeclareOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

/// Attributes for starting a consumer.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub no_local: bool,
    /// Broker considers deliveries settled as soon as they are sent.
    pub no_ack: bool,
    pub exclusive: bool,
    pub arguments: FieldTable,
}

/// Attributes for publishing.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Hand the message back (as a return event) if it cannot be routed.
    pub mandatory: bool,
    /// Hand the message back if no consumer can take it immediately.
    pub immediate: bool,
}

/// What a queue declaration (or passive introspection) reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// Actual queue name; broker-generated when declared with an empty one.
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Outcome of a synchronous get: a message or an explicitly empty queue.
#[derive(Debug, Clone, PartialEq)]
pub enum GetResult {
    Message(GetMessage),
    Empty,
}

impl GetResult {
    /// True when the queue had nothing to hand over.
    pub fn is_empty(&self) -> bool {
        matches!(self, GetResult::Empty)
    }

    /// The retrieved message, if any.
    pub fn message(&self) -> Option<&GetMessage> {
        match self {
            GetResult::Message(message) => Some(message),
            GetResult::Empty => None,
        }
    }
}
