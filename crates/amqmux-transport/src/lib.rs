//! The boundary between the channel engine and the physical connection.
//!
//! The real socket/TLS transport and the byte-level codec live outside this
//! workspace. The engine only needs two things from them: a way to hand
//! decoded methods out for transmission (the [`FrameTransport`] trait), and
//! a single reader context pushing inbound methods back in (the connection's
//! `route_frame`, over in `amqmux-client`). The [`loopback`] pair stands in
//! for both ends inside tests.

pub mod error;
pub mod loopback;
pub mod traits;

pub use error::{Result, TransportError};
pub use loopback::{loopback, LoopbackReceiver, LoopbackTransport};
pub use traits::FrameTransport;
