use serde::{Deserialize, Serialize};

/// Operation completed successfully.
pub const REPLY_SUCCESS: u16 = 200;

/// Mandatory publish could not be routed.
pub const NO_ROUTE: u16 = 312;

/// Immediate publish found no consumers.
pub const NO_CONSUMERS: u16 = 313;

/// Passive declare (or introspection) target does not exist.
pub const NOT_FOUND: u16 = 404;

/// Declared entity exists with incompatible attributes.
pub const PRECONDITION_FAILED: u16 = 406;

/// Channel-level protocol violation detected by either side.
pub const CHANNEL_ERROR: u16 = 504;

/// Unexpected condition inside the client library itself.
pub const INTERNAL_ERROR: u16 = 541;

/// Which side initiated a channel shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Initiator {
    /// The application asked the channel to close.
    Application,
    /// The client library closed the channel (timeout, protocol violation).
    Library,
    /// The broker sent a close method.
    Broker,
}

/// The terminal reason a channel (or connection) shut down.
///
/// Written at most once per channel; every observer after the fact sees the
/// same stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReason {
    pub code: u16,
    pub text: String,
    pub initiator: Initiator,
}

impl CloseReason {
    /// A clean application-initiated close.
    pub fn application() -> Self {
        Self {
            code: REPLY_SUCCESS,
            text: "goodbye".to_string(),
            initiator: Initiator::Application,
        }
    }

    /// A close forced by the client library.
    pub fn library(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            initiator: Initiator::Library,
        }
    }

    /// A close received from the broker.
    pub fn broker(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            initiator: Initiator::Broker,
        }
    }

    /// True when the close carries a non-error reply code.
    pub fn is_clean(&self) -> bool {
        self.code == REPLY_SUCCESS
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} close, code={} text={:?}",
            self.initiator, self.code, self.text
        )
    }
}
