use amqmux_frame::Method;

use crate::error::Result;

/// Outbound half of the connection.
///
/// Implementations encode the method and write it to the wire. They must be
/// safe to call concurrently from arbitrary caller contexts across
/// different channels; ordering *within* one channel is the caller's duty —
/// the channel engine serializes its own sends so continuation order and
/// confirm sequence order match wire order.
pub trait FrameTransport: Send + Sync {
    /// Transmit one method on the given channel number.
    fn send(&self, channel: u16, method: Method) -> Result<()>;
}
