//! Encoder validation errors.

/// Reasons a command cannot be encoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum FrameError {
    /// A payload or requested length exceeds what the frame can carry.
    #[error("{what} is {len} bytes, limit is {max}")]
    TooLong {
        /// Which field overflowed.
        what: &'static str,
        /// Offending length.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// Command text contained a NUL byte.
    #[error("interior NUL byte in command text")]
    InteriorNul,
}
