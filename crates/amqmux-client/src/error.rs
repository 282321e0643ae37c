use std::time::Duration;

use amqmux_frame::CloseReason;

/// Errors surfaced by channel and connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel (or its connection) has shut down; the stored reason is
    /// the one every observer converges on.
    #[error("channel closed: {0}")]
    ChannelClosed(CloseReason),

    /// A synchronous request got no reply in time. The channel is closed as
    /// a consequence, since a late reply would desynchronize correlation.
    #[error("no reply within {0:?}")]
    RpcTimeout(Duration),

    /// Outstanding publisher confirms were not resolved in time.
    #[error("publisher confirms not resolved within {0:?}")]
    ConfirmTimeout(Duration),

    /// The broker negatively acknowledged at least one publish.
    #[error("broker negatively acknowledged one or more publishes")]
    PublishesNacked,

    /// A confirm-wait was attempted on a channel that never enabled
    /// confirm mode.
    #[error("channel is not in confirm mode")]
    NotInConfirmMode,

    /// A no-wait consume needs a client-supplied tag; no reply will carry
    /// a broker-generated one back.
    #[error("no-wait consume requires a client-supplied consumer tag")]
    ConsumerTagRequired,

    /// The connection refused to allocate another channel number.
    #[error("channel limit reached (max {max})")]
    ChannelLimitReached { max: u16 },

    /// The peer violated the protocol's correlation rules.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Unexpected condition inside the client itself.
    #[error("internal error: {0}")]
    Internal(String),

    /// Local frame validation failed (oversized names, routing keys).
    #[error("frame error: {0}")]
    Frame(#[from] amqmux_frame::FrameError),

    /// The transport refused or lost the frame.
    #[error("transport error: {0}")]
    Transport(#[from] amqmux_transport::TransportError),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
