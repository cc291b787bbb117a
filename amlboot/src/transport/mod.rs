//! USB transport: blocking control/bulk transfers and bulk-in streaming.
//!
//! [`Transport`] is the uniform contract. Two models implement it:
//!
//! - [`Engine`]: URBs are queued to a [`CompletionPort`] and a worker thread
//!   moves them from pending to ready as the OS reports completions. Callers
//!   wait on a condition variable. On Linux the port is usbdevfs.
//! - `Direct` (Linux only): every bounded transfer is a single synchronous
//!   ioctl, and streaming maps straight onto kernel URB queuing. An
//!   unbounded bulk read is queued as an URB so `close` can discard it.

mod engine;
mod urb;
#[cfg(target_os = "linux")]
pub(crate) mod usbfs;

use std::fmt;
use std::time::Duration;

use amlboot_proto::Setup;
use serde::Serialize;

use crate::error::{Error, Result, TransferStatus};

pub use engine::{CompletionPort, Engine, PortEvent, Submission};
pub use urb::{UrbId, UrbKind};

/// Timeout for a blocking transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Timeout {
    /// 1500 ms for control transfers; no limit for bulk transfers and reaps.
    #[default]
    Default,
    /// Wait until the transfer completes or the session closes.
    Infinite,
    /// Wait at most this long.
    After(Duration),
}

impl Timeout {
    /// Default control transfer timeout.
    pub const CONTROL_DEFAULT: Duration = Duration::from_millis(1500);

    /// Maps a signed millisecond count: negative selects the default, zero
    /// is rejected.
    pub fn from_millis(ms: i64) -> Result<Self> {
        match u64::try_from(ms) {
            Err(_) => Ok(Self::Default),
            Ok(0) => Err(Error::InvalidArgument("timeout of 0 ms".into())),
            Ok(n) => Ok(Self::After(Duration::from_millis(n))),
        }
    }

    /// Resolves to a concrete bound, `None` meaning unbounded.
    pub(crate) fn resolve(self, default: Option<Duration>) -> Result<Option<Duration>> {
        match self {
            Self::Default => Ok(default),
            Self::Infinite => Ok(None),
            Self::After(d) if d.is_zero() => {
                Err(Error::InvalidArgument("timeout of 0 ms".into()))
            }
            Self::After(d) => Ok(Some(d)),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::After(d)
    }
}

/// Endpoints of the claimed interface. The control pipe is always 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipeSet {
    /// Primary bulk-in endpoint.
    pub bulk_in: u8,
    /// Primary bulk-out endpoint.
    pub bulk_out: u8,
    /// Second bulk-in endpoint, if the interface has one.
    pub bulk_in_alt: Option<u8>,
    /// Second bulk-out endpoint, if the interface has one.
    pub bulk_out_alt: Option<u8>,
}

impl Default for PipeSet {
    fn default() -> Self {
        Self {
            bulk_in: 0x81,
            bulk_out: 0x02,
            bulk_in_alt: None,
            bulk_out_alt: None,
        }
    }
}

impl PipeSet {
    /// True if `pipe` is one of the bulk-in endpoints.
    pub fn is_bulk_in(&self, pipe: u8) -> bool {
        pipe == self.bulk_in || Some(pipe) == self.bulk_in_alt
    }

    /// True if `pipe` is one of the bulk-out endpoints.
    pub fn is_bulk_out(&self, pipe: u8) -> bool {
        pipe == self.bulk_out || Some(pipe) == self.bulk_out_alt
    }
}

/// A completed streaming URB handed back by [`Transport::reap`].
#[derive(Debug)]
pub struct Reaped {
    /// Handle returned by [`Transport::submit`].
    pub id: UrbId,
    /// Endpoint the URB was queued on.
    pub pipe: u8,
    /// The buffer, truncated to the bytes actually received.
    pub data: Vec<u8>,
    /// Completion error, if any.
    pub status: Option<TransferStatus>,
}

/// Uniform transfer contract over one open device.
///
/// All methods take `&self`: a session may be closed from one thread while
/// another is blocked in a transfer, which then returns an error.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Endpoints available on this session.
    fn pipes(&self) -> PipeSet;

    /// Blocking control transfer. `data.len()` must equal `setup.length`;
    /// the direction bit of `setup.request_type` decides whether it is
    /// sent or filled.
    fn control(&self, setup: &Setup, data: &mut [u8], timeout: Timeout) -> Result<usize>;

    /// Blocking bulk read into `buf`.
    fn bulk_in(&self, pipe: u8, buf: &mut [u8], timeout: Timeout) -> Result<usize>;

    /// Blocking bulk write of `data`.
    fn bulk_out(&self, pipe: u8, data: &[u8], timeout: Timeout) -> Result<usize>;

    /// Queues a streaming bulk-in read. The transport owns `buf` until it is
    /// reaped.
    fn submit(&self, pipe: u8, buf: Vec<u8>) -> Result<UrbId>;

    /// Waits for the next completed streaming URB, in completion order.
    fn reap(&self, timeout: Timeout) -> Result<Reaped>;

    /// Cancels a streaming URB. It is still delivered by [`reap`](Self::reap),
    /// with a cancelled status. Discarding an URB that already completed
    /// succeeds.
    fn discard(&self, id: UrbId) -> Result<()>;

    /// Issues a USB port reset.
    fn reset(&self) -> Result<()>;

    /// Cancels everything pending and releases the device. A second call
    /// returns [`Error::InvalidHandle`].
    fn close(&self) -> Result<()>;
}

/// Checks that a control data buffer agrees with its setup packet.
pub(crate) fn check_control(setup: &Setup, data: &[u8]) -> Result<()> {
    if data.len() == usize::from(setup.length) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "control buffer is {} bytes but wLength is {}",
            data.len(),
            setup.length
        )))
    }
}
