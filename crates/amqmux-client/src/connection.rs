use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use amqmux_frame::{CloseReason, Method};
use amqmux_transport::FrameTransport;

use crate::channel::Channel;
use crate::config::ConnectionConfig;
use crate::error::{ChannelError, Result};

/// Owns channel-number allocation and routes inbound frames to the right
/// channel.
///
/// One logical reader per connection calls [`route_frame`](Self::route_frame);
/// channels proceed independently and concurrently on top of that. Channel
/// number 0 belongs to the connection itself and is never allocated.
pub struct Connection {
    transport: Arc<dyn FrameTransport>,
    config: ConnectionConfig,
    channels: Mutex<ChannelTable>,
    closed: Mutex<Option<CloseReason>>,
}

struct ChannelTable {
    map: HashMap<u16, Arc<Channel>>,
    /// Released numbers, reused lowest-first before the counter grows.
    free: BTreeSet<u16>,
    next: u16,
}

impl Connection {
    pub fn new(transport: Arc<dyn FrameTransport>, config: ConnectionConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            channels: Mutex::new(ChannelTable {
                map: HashMap::new(),
                free: BTreeSet::new(),
                next: 1,
            }),
            closed: Mutex::new(None),
        })
    }

    /// Allocate a number, register the channel for routing and perform the
    /// open handshake. The number returns to the pool when the channel
    /// shuts down, however that happens.
    pub fn open_channel(self: &Arc<Self>) -> Result<Arc<Channel>> {
        if let Some(reason) = self.close_reason() {
            return Err(ChannelError::ChannelClosed(reason));
        }

        let number = self.allocate()?;
        let channel = match Channel::new(
            number,
            Arc::clone(&self.transport),
            self.config.channel.clone(),
        ) {
            Ok(channel) => channel,
            Err(err) => {
                self.recycle(number);
                return Err(err);
            }
        };

        self.table_lock().map.insert(number, Arc::clone(&channel));
        let connection = Arc::downgrade(self);
        channel.on_shutdown(move |_| {
            if let Some(connection) = connection.upgrade() {
                connection.release_channel(number);
            }
        });

        channel.open()?;
        Ok(channel)
    }

    /// Remove a channel from routing and return its number to the pool.
    /// Called automatically when a channel shuts down.
    pub fn release_channel(&self, number: u16) {
        let mut table = self.table_lock();
        if table.map.remove(&number).is_some() || (number >= 1 && number < table.next) {
            table.free.insert(number);
        }
    }

    /// Route one decoded inbound frame. Called from the connection's single
    /// reader context.
    pub fn route_frame(&self, number: u16, method: Method) {
        if number == 0 {
            match method {
                Method::ChannelClose {
                    reply_code,
                    reply_text,
                } => {
                    self.shutdown(CloseReason::broker(reply_code, reply_text));
                }
                other => {
                    tracing::warn!(kind = ?other.kind(), "unexpected method on channel 0");
                }
            }
            return;
        }

        let channel = { self.table_lock().map.get(&number).cloned() };
        match channel {
            Some(channel) => channel.handle_frame(method),
            // Frames racing a local release are expected, not an error.
            None => tracing::debug!(channel = number, "frame for unknown channel dropped"),
        }
    }

    /// Force-close every channel, e.g. on transport loss or a
    /// connection-level close from the broker. Idempotent; the first
    /// reason wins.
    pub fn shutdown(&self, reason: CloseReason) {
        {
            let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
            if closed.is_some() {
                return;
            }
            *closed = Some(reason.clone());
        }
        tracing::debug!(reason = %reason, "connection shutting down");

        let channels: Vec<Arc<Channel>> = {
            let mut table = self.table_lock();
            table.map.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.shutdown(reason.clone());
        }
    }

    /// The stored terminal reason, if the connection has shut down.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some()
    }

    /// Channels currently registered for routing.
    pub fn open_channels(&self) -> usize {
        self.table_lock().map.len()
    }

    fn allocate(&self) -> Result<u16> {
        let mut table = self.table_lock();
        if let Some(&number) = table.free.iter().next() {
            table.free.remove(&number);
            return Ok(number);
        }
        if table.next > self.config.channel_max {
            return Err(ChannelError::ChannelLimitReached {
                max: self.config.channel_max,
            });
        }
        let number = table.next;
        table.next += 1;
        Ok(number)
    }

    /// Undo an allocation that never reached the routing table.
    fn recycle(&self, number: u16) {
        self.table_lock().free.insert(number);
    }

    fn table_lock(&self) -> std::sync::MutexGuard<'_, ChannelTable> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("channels", &self.open_channels())
            .field("closed", &self.is_closed())
            .finish()
    }
}
