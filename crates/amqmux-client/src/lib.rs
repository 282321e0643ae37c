//! Client-side channel engine for AMQP-family brokers.
//!
//! One connection multiplexes many numbered channels. Each channel gives
//! synchronous-looking operations (declare a queue, get a typed reply) on
//! top of the connection's asynchronous frame stream: callers block on
//! their own continuation, the connection's single reader resolves them,
//! and a per-channel dispatcher pushes deliveries and broker events to
//! registered handlers off the read path.

pub mod channel;
pub mod config;
mod confirm;
pub mod connection;
pub mod consumer;
mod continuation;
pub mod error;
pub mod event;
pub mod options;

pub use channel::Channel;
pub use config::{ChannelConfig, ConnectionConfig};
pub use connection::Connection;
pub use consumer::Consumer;
pub use error::{ChannelError, Result};
pub use event::{ChannelEvent, EventSink};
pub use options::{
    ConsumeOptions, ExchangeDeclareOptions, GetResult, PublishOptions, QueueDeclareOptions,
    QueueInfo,
};
