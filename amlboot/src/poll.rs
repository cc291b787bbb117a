//! Busy-status polling on the bulk-in pipe.

use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{Config, PollConfig};
use crate::error::{Error, Result};
use crate::transport::{Timeout, Transport};

/// Size of one status read.
const STATUS_LEN: usize = 512;

/// Reads status replies until the device stops reporting busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StatusPoll {
    /// Operation name for errors.
    op: &'static str,
    /// Prefix of a "still working" reply.
    busy: &'static [u8],
    /// Prefix of a successful reply.
    success: &'static [u8],
    /// Interval and overall budget.
    poll: PollConfig,
    /// Timeout of each status read.
    read_timeout: Duration,
}

impl StatusPoll {
    /// Status after a media block write.
    pub fn media(config: &Config) -> Self {
        Self {
            op: "media status",
            busy: b"Continue:32",
            success: b"OK!!",
            poll: config.media_poll,
            read_timeout: config.bulk_in_timeout(),
        }
    }

    /// Status after a bootloader bulk command.
    pub fn bulk_command(config: &Config) -> Self {
        Self {
            op: "bulkcmd",
            busy: b"Continue:34",
            success: b"success",
            poll: config.bulk_cmd_poll,
            read_timeout: config.bulk_in_timeout(),
        }
    }

    /// Polls until success, returning the reply text.
    pub fn run(&self, t: &dyn Transport) -> Result<String> {
        let started = Instant::now();
        let pipe = t.pipes().bulk_in;
        let mut buf = [0u8; STATUS_LEN];
        loop {
            let n = t.bulk_in(pipe, &mut buf, self.read_timeout.into())?;
            let reply = &buf[..n];
            if reply.starts_with(self.success) {
                return Ok(reply_text(reply));
            }
            if !reply.starts_with(self.busy) {
                return Err(Error::protocol(self.op, reply));
            }
            if started.elapsed() >= self.poll.budget() {
                return Err(Error::Timeout {
                    op: self.op,
                    after: self.poll.budget(),
                });
            }
            debug!(op = self.op, "device busy");
            thread::sleep(self.poll.interval());
        }
    }
}

/// Reply bytes up to the first NUL, as text.
pub(crate) fn reply_text(reply: &[u8]) -> String {
    let end = reply.iter().position(|&b| b == 0).unwrap_or(reply.len());
    String::from_utf8_lossy(&reply[..end]).into_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fake::FakeDevice;

    fn fast(config: &mut Config) {
        config.media_poll = PollConfig {
            interval_ms: 1,
            budget_ms: 50,
        };
        config.bulk_cmd_poll = config.media_poll;
    }

    #[test]
    fn busy_then_success() {
        let mut config = Config::default();
        fast(&mut config);
        let dev = FakeDevice::new();
        dev.bulk_reply(b"Continue:34");
        dev.bulk_reply(b"Continue:34");
        dev.bulk_reply(b"success\0\0junk");
        assert_eq!(StatusPoll::bulk_command(&config).run(&dev).unwrap(), "success");
    }

    #[test]
    fn unexpected_reply_is_protocol_error() {
        let dev = FakeDevice::new();
        dev.bulk_reply(b"not OK!!");
        let err = StatusPoll::media(&Config::default()).run(&dev).unwrap_err();
        assert!(matches!(err, Error::Protocol { op: "media status", reply } if reply == "not OK!!"));
    }

    #[test]
    fn truncated_busy_marker_is_protocol_error() {
        let dev = FakeDevice::new();
        dev.bulk_reply(b"Cont");
        assert!(matches!(
            StatusPoll::media(&Config::default()).run(&dev),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn stays_busy_past_budget() {
        let mut config = Config::default();
        fast(&mut config);
        let dev = FakeDevice::new();
        for _ in 0..1000 {
            dev.bulk_reply(b"Continue:32");
        }
        assert!(matches!(
            StatusPoll::media(&config).run(&dev),
            Err(Error::Timeout { op: "media status", .. })
        ));
    }
}
