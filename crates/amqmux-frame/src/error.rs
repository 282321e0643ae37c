/// Errors raised while validating decoded protocol data.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A short-string field exceeds the protocol's 255-byte limit.
    #[error("{label} too long ({len} bytes, max {max})")]
    ShortStringTooLong {
        label: &'static str,
        len: usize,
        max: usize,
    },
}

pub type Result<T> = std::result::Result<T, FrameError>;
