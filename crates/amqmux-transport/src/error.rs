/// Errors that can occur while handing frames to the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The underlying connection is gone; nothing can be transmitted.
    #[error("transport closed")]
    Closed,

    /// The transport refused the frame (encoder limits, broker negotiation).
    #[error("frame rejected by transport: {0}")]
    Rejected(String),

    /// An I/O error occurred on the physical connection.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
