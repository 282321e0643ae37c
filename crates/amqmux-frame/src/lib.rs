//! Decoded protocol vocabulary shared by the rest of the workspace.
//!
//! The byte-level codec lives outside this workspace; it hands over fully
//! decoded methods (content frames already assembled onto their method) and
//! accepts methods for encoding. This crate defines that decoded shape plus
//! the bit-exact limits the client must enforce before transmission.

pub mod close;
pub mod content;
pub mod error;
pub mod method;

pub use close::{CloseReason, Initiator, REPLY_SUCCESS};
pub use content::{
    BasicProperties, Delivery, FieldTable, GetMessage, PropertyBag, ReturnedMessage,
};
pub use error::{FrameError, Result};
pub use method::{validate_shortstr, Method, MethodKind, MAX_SHORTSTR};
