//! Error types for amlboot operations.

use std::time::Duration;

use amlboot_proto::FrameError;

/// Alias for `Result<T, amlboot::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by transport and protocol operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No device matched the requested IDs and index.
    #[error("no device {vendor_id:04x}:{product_id:04x} at index {index}")]
    DeviceNotFound {
        /// USB vendor ID searched for.
        vendor_id: u16,
        /// USB product ID searched for.
        product_id: u16,
        /// Zero-based match index.
        index: usize,
    },

    /// The session was already closed, or the handle is stale.
    #[error("invalid or closed session handle")]
    InvalidHandle,

    /// Blocking and streaming transfers were mixed on one pipe.
    #[error("pipe {pipe:#04x} is busy with streaming transfers")]
    Busy {
        /// The contended pipe.
        pipe: u8,
    },

    /// An operation did not complete in time; its URB was cancelled.
    #[error("{op}: timed out after {after:?}")]
    Timeout {
        /// The operation that timed out.
        op: &'static str,
        /// The timeout that elapsed.
        after: Duration,
    },

    /// The OS reported a transfer failure.
    #[error("{op}: {status}")]
    Transfer {
        /// The operation that failed.
        op: &'static str,
        /// Classified OS status.
        status: TransferStatus,
    },

    /// Total bytes moved differ from the requested length.
    #[error("{op}: moved {actual} of {expected} bytes")]
    SizeMismatch {
        /// The operation that came up short.
        op: &'static str,
        /// Requested length.
        expected: usize,
        /// Bytes actually moved.
        actual: usize,
    },

    /// The device refused a transfer start command.
    #[error("{op}: device rejected the transfer header")]
    ChecksumRejected {
        /// The rejected command.
        op: &'static str,
    },

    /// The device replied with unexpected status content.
    #[error("{op}: unexpected reply {reply:?}")]
    Protocol {
        /// The command whose reply was wrong.
        op: &'static str,
        /// Printable form of the reply.
        reply: String,
    },

    /// The transport detected a broken internal invariant. The session
    /// must be torn down.
    #[error("transport consistency violated: {0}")]
    FatalConsistency(String),

    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A command could not be encoded.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// An I/O error from discovery, configuration, or file handling.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Builds a [`Error::Protocol`] from raw reply bytes, trimming at the
    /// first NUL.
    pub(crate) fn protocol(op: &'static str, reply: &[u8]) -> Self {
        let end = reply.iter().position(|&b| b == 0).unwrap_or(reply.len());
        Self::Protocol {
            op,
            reply: String::from_utf8_lossy(&reply[..end]).into_owned(),
        }
    }

    /// True for failures worth another attempt: a stalled or failed
    /// transfer, or a timeout, but not a vanished device.
    pub(crate) const fn is_transient(&self) -> bool {
        match self {
            Self::Transfer { status, .. } => !matches!(status, TransferStatus::Disconnected),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// True when no later attempt on the same session can succeed: the
    /// device is gone, the session is closed or broken, or the frame itself
    /// cannot be encoded.
    pub(crate) const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Transfer {
                status: TransferStatus::Disconnected,
                ..
            } | Self::FatalConsistency(_)
                | Self::InvalidHandle
                | Self::Frame(_)
        )
    }
}

/// OS transfer status, classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TransferStatus {
    /// The endpoint stalled.
    #[error("endpoint stalled")]
    Stall,
    /// The transfer was cancelled before completing.
    #[error("transfer cancelled")]
    Cancelled,
    /// The device went away.
    #[error("device disconnected")]
    Disconnected,
    /// The device sent more data than requested.
    #[error("babble / overflow")]
    Overflow,
    /// Protocol-level fault on the bus.
    #[error("bus protocol fault")]
    Fault,
    /// The device kept accepting transfers without moving any data.
    #[error("gave up after {0} zero-length transfers in a row")]
    NoProgress(u32),
    /// Any other OS error code.
    #[error("os error {0}")]
    Os(i32),
}

impl TransferStatus {
    /// Classifies a Linux errno.
    #[cfg(target_os = "linux")]
    pub(crate) const fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EPIPE => Self::Stall,
            libc::ENOENT | libc::ECONNRESET => Self::Cancelled,
            libc::ENODEV | libc::ESHUTDOWN => Self::Disconnected,
            libc::EOVERFLOW => Self::Overflow,
            libc::EPROTO | libc::EILSEQ | libc::ETIME => Self::Fault,
            other => Self::Os(other),
        }
    }

    /// Classifies an I/O error returned by a transfer call.
    pub(crate) fn from_io(err: &std::io::Error) -> Self {
        match err.raw_os_error() {
            #[cfg(target_os = "linux")]
            Some(errno) => Self::from_errno(errno),
            #[cfg(not(target_os = "linux"))]
            Some(code) => Self::Os(code),
            None if err.kind() == std::io::ErrorKind::NotConnected => Self::Disconnected,
            None => Self::Fault,
        }
    }
}
