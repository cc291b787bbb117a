//! Chunked large-memory and media transfers.
//!
//! A transfer announces itself with a start command carrying the address,
//! total size, whole-payload checksum and the current sequence number, then
//! moves the buffer in bulk chunks of at most `cap` bytes. Each chunk
//! consumes one sequence number. A short chunk or a rejected start ends the
//! attempt; the next attempt restarts the whole buffer.

use std::time::Duration;

use amlboot_proto::{Command, Direction, TransferHeader, checksum16, checksum32};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result, TransferStatus};
use crate::seq::Sequence;
use crate::transport::{Timeout, Transport};

/// Sends one encoded command and returns the IN reply (empty for OUT).
pub(crate) fn exec(t: &dyn Transport, cmd: Command<'_>, floor: Duration) -> Result<Vec<u8>> {
    let frame = cmd.encode()?;
    let setup = frame.setup;
    let mut data = frame.data;
    debug!(
        request = setup.request,
        value = setup.value,
        index = setup.index,
        len = data.len(),
        "control frame"
    );
    let timeout = Timeout::After(frame.timeout.max(floor));
    let n = t.control(&setup, &mut data, timeout)?;
    if setup.direction() == Direction::In {
        data.truncate(n);
        Ok(data)
    } else if n < data.len() {
        Err(Error::SizeMismatch {
            op: "control",
            expected: data.len(),
            actual: n,
        })
    } else {
        Ok(Vec::new())
    }
}

/// Which start command announces the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    /// Large-memory transfer, 16-bit checksum.
    LargeMem,
    /// Media block transfer, 32-bit checksum.
    Media,
}

impl Stream {
    /// Name used in errors and logs.
    const fn op(self, write: bool) -> &'static str {
        match (self, write) {
            (Self::LargeMem, true) => "write_large_mem",
            (Self::LargeMem, false) => "read_large_mem",
            (Self::Media, true) => "write_media",
            (Self::Media, false) => "read_media",
        }
    }

    /// Start command for a write.
    const fn write_cmd(self, h: TransferHeader) -> Command<'static> {
        match self {
            Self::LargeMem => Command::WriteLargeMem(h),
            Self::Media => Command::WriteMedia(h),
        }
    }

    /// Start command for a read.
    const fn read_cmd(self, h: TransferHeader) -> Command<'static> {
        match self {
            Self::LargeMem => Command::ReadLargeMem(h),
            Self::Media => Command::ReadMedia(h),
        }
    }
}

/// Limits for one chunked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkPolicy {
    /// Largest bulk transfer.
    pub cap: usize,
    /// Whole-buffer attempts.
    pub attempts: u32,
    /// Consecutive zero-byte chunks tolerated.
    pub max_zero_chunks: u32,
    /// Floor for the start command's timeout.
    pub control_timeout: Duration,
    /// Per-chunk bulk-in timeout.
    pub bulk_in_timeout: Duration,
    /// Per-chunk bulk-out timeout.
    pub bulk_out_timeout: Duration,
}

impl ChunkPolicy {
    /// Policy for `stream` from `config`.
    pub fn new(stream: Stream, config: &Config) -> Self {
        Self {
            cap: match stream {
                Stream::LargeMem => config.large_mem_chunk,
                Stream::Media => config.media_chunk,
            }
            .max(1),
            attempts: config.attempts.max(1),
            max_zero_chunks: config.max_zero_chunks,
            control_timeout: config.control_timeout(),
            bulk_in_timeout: config.bulk_in_timeout(),
            bulk_out_timeout: config.bulk_out_timeout(),
        }
    }
}

/// One direction of a chunked transfer.
trait Mover {
    /// Moves `range` of the buffer in one bulk transfer.
    fn chunk(&mut self, t: &dyn Transport, start: usize, end: usize) -> Result<usize>;
}

/// Host-to-device chunks.
struct Outbound<'a> {
    /// Source buffer.
    data: &'a [u8],
    /// Bulk-out pipe.
    pipe: u8,
    /// Per-chunk timeout.
    timeout: Duration,
}

impl Mover for Outbound<'_> {
    fn chunk(&mut self, t: &dyn Transport, start: usize, end: usize) -> Result<usize> {
        t.bulk_out(self.pipe, &self.data[start..end], self.timeout.into())
    }
}

/// Device-to-host chunks.
struct Inbound<'a> {
    /// Destination buffer.
    buf: &'a mut [u8],
    /// Bulk-in pipe.
    pipe: u8,
    /// Per-chunk timeout.
    timeout: Duration,
}

impl Mover for Inbound<'_> {
    fn chunk(&mut self, t: &dyn Transport, start: usize, end: usize) -> Result<usize> {
        t.bulk_in(self.pipe, &mut self.buf[start..end], self.timeout.into())
    }
}

/// Converts a buffer length to the 32-bit wire size.
fn wire_len(op: &'static str, len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| Error::InvalidArgument(format!("{op}: {len} bytes exceeds 4 GiB")))
}

/// Attempt loop shared by both directions.
#[allow(clippy::too_many_arguments)]
fn transfer(
    t: &dyn Transport,
    seq: &Sequence,
    op: &'static str,
    start_cmd: impl Fn(TransferHeader) -> Command<'static>,
    mut header: TransferHeader,
    total: usize,
    policy: &ChunkPolicy,
    mover: &mut dyn Mover,
) -> Result<()> {
    let mut zero_run = 0u32;
    let mut moved = 0usize;
    let mut rejected = false;

    for attempt in 1..=policy.attempts {
        moved = 0;
        header.seq = seq.current();
        if let Err(e) = exec(t, start_cmd(header), policy.control_timeout) {
            if e.is_terminal() {
                return Err(e);
            }
            warn!(op, attempt, error = %e, "device rejected transfer start");
            rejected = true;
            continue;
        }
        rejected = false;

        while moved < total {
            let end = moved + (total - moved).min(policy.cap);
            let s = seq.advance();
            debug!(op, seq = s, offset = moved, len = end - moved, "chunk");
            let n = mover.chunk(t, moved, end)?;
            if n == 0 {
                zero_run += 1;
                if zero_run > policy.max_zero_chunks {
                    warn!(op, zero_run, "too many zero-length chunks");
                    return Err(Error::Transfer {
                        op,
                        status: TransferStatus::NoProgress(zero_run),
                    });
                }
                warn!(op, attempt, offset = moved, zero_run, "zero-length chunk; retrying");
                continue;
            }
            zero_run = 0;
            moved += n.min(end - moved);
            if moved < end {
                warn!(op, attempt, offset = moved, "short chunk; restarting transfer");
                break;
            }
        }

        if moved == total {
            info!(op, addr = header.addr, len = total, attempt, "transfer complete");
            return Ok(());
        }
    }

    if rejected {
        Err(Error::ChecksumRejected { op })
    } else {
        Err(Error::SizeMismatch {
            op,
            expected: total,
            actual: moved,
        })
    }
}

/// Writes `data` to `addr` (a block index for media).
pub(crate) fn write(
    t: &dyn Transport,
    seq: &Sequence,
    stream: Stream,
    addr: u32,
    data: &[u8],
    policy: &ChunkPolicy,
) -> Result<()> {
    let op = stream.op(true);
    #[allow(clippy::cast_possible_truncation)]
    let header = TransferHeader {
        addr,
        size: wire_len(op, data.len())?,
        checksum: match stream {
            Stream::LargeMem => u32::from(checksum16(data)),
            Stream::Media => checksum32(data),
        },
        seq: 0,
        chunk: policy.cap as u32,
    };
    let mut mover = Outbound {
        data,
        pipe: t.pipes().bulk_out,
        timeout: policy.bulk_out_timeout,
    };
    transfer(
        t,
        seq,
        op,
        |h| stream.write_cmd(h),
        header,
        data.len(),
        policy,
        &mut mover,
    )
}

/// Fills `buf` from `addr` (a block index for media).
pub(crate) fn read(
    t: &dyn Transport,
    seq: &Sequence,
    stream: Stream,
    addr: u32,
    buf: &mut [u8],
    policy: &ChunkPolicy,
) -> Result<()> {
    let op = stream.op(false);
    let total = buf.len();
    #[allow(clippy::cast_possible_truncation)]
    let header = TransferHeader {
        addr,
        size: wire_len(op, total)?,
        checksum: 0,
        seq: 0,
        chunk: policy.cap as u32,
    };
    let mut mover = Inbound {
        buf,
        pipe: t.pipes().bulk_in,
        timeout: policy.bulk_in_timeout,
    };
    transfer(
        t,
        seq,
        op,
        |h| stream.read_cmd(h),
        header,
        total,
        policy,
        &mut mover,
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use amlboot_proto::request;
    use proptest::prelude::*;

    use super::*;
    use crate::fake::{Chunk, FakeDevice, stream_byte};

    fn policy(cap: usize) -> ChunkPolicy {
        ChunkPolicy {
            cap,
            ..ChunkPolicy::new(Stream::LargeMem, &Config::default())
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7) as u8).collect()
    }

    #[test]
    fn scenario_74565_bytes_in_4k_chunks() {
        let dev = FakeDevice::new();
        let t: Arc<FakeDevice> = Arc::clone(&dev);
        let seq = Sequence::default();
        for _ in 0..7 {
            seq.advance();
        }
        let data = payload(0x12345);

        write(&t, &seq, Stream::LargeMem, 0x0100_0000, &data, &policy(0x1000)).unwrap();

        let lens = dev.bulk_lens();
        assert_eq!(lens.len(), 19);
        assert!(lens[..18].iter().all(|&l| l == 4096));
        assert_eq!(lens[18], 837);
        assert_eq!(dev.written(), data);
        assert_eq!(seq.current(), 7 + 19);

        let headers = dev.headers(request::WRITE_LARGE_MEM);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].addr, 0x0100_0000);
        assert_eq!(headers[0].size, 0x12345);
        assert_eq!(headers[0].seq, 7);
        assert_eq!(headers[0].checksum, u32::from(checksum16(&data)));
    }

    #[test]
    fn six_zero_chunks_abort_with_transfer_error() {
        let dev = FakeDevice::new();
        dev.script([Chunk::Zero; 6]);
        let err = write(&dev, &Sequence::default(), Stream::LargeMem, 0, &payload(100), &policy(64))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transfer {
                status: TransferStatus::NoProgress(6),
                ..
            }
        ));
    }

    #[test]
    fn five_zero_chunks_are_tolerated() {
        let dev = FakeDevice::new();
        dev.script([Chunk::Zero; 5]);
        let data = payload(100);
        write(&dev, &Sequence::default(), Stream::LargeMem, 0, &data, &policy(64)).unwrap();
        assert_eq!(dev.written(), data);
    }

    #[test]
    fn short_chunks_exhaust_four_attempts() {
        let dev = FakeDevice::new();
        dev.script([Chunk::Short(1); 4]);
        let err = write(&dev, &Sequence::default(), Stream::LargeMem, 0, &payload(50), &policy(64))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::SizeMismatch {
                expected: 50,
                actual: 49,
                ..
            }
        ));
        assert_eq!(dev.requests(request::WRITE_LARGE_MEM).len(), 4);
    }

    #[test]
    fn short_chunk_restarts_from_the_beginning() {
        let dev = FakeDevice::new();
        dev.script([Chunk::Full, Chunk::Short(10)]);
        let seq = Sequence::default();
        let data = payload(200);
        write(&dev, &seq, Stream::LargeMem, 0, &data, &policy(64)).unwrap();

        let headers = dev.headers(request::WRITE_LARGE_MEM);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].seq, 0);
        assert_eq!(headers[1].seq, 2);
        assert_eq!(&dev.written()[118..], &data[..]);
    }

    #[test]
    fn rejected_starts_report_checksum_rejected() {
        let dev = FakeDevice::new();
        dev.reject_starts(4);
        let err = write(&dev, &Sequence::default(), Stream::Media, 3, &payload(10), &policy(64))
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumRejected { op: "write_media" }));
        assert!(dev.bulk_lens().is_empty());
    }

    #[test]
    fn one_rejected_start_then_success() {
        let dev = FakeDevice::new();
        dev.reject_starts(1);
        let data = payload(10);
        write(&dev, &Sequence::default(), Stream::Media, 3, &data, &policy(64)).unwrap();
        let headers = dev.headers(request::WRITE_MEDIA);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1].checksum, checksum32(&data));
    }

    #[test]
    fn short_start_write_costs_one_attempt() {
        let dev = FakeDevice::new();
        dev.short_starts(1);
        let seq = Sequence::default();
        let data = payload(5000);
        write(&dev, &seq, Stream::LargeMem, 0x1000, &data, &policy(4096)).unwrap();
        assert_eq!(dev.requests(request::WRITE_LARGE_MEM).len(), 2);
        assert_eq!(dev.written(), data);
        assert_eq!(seq.current(), 2);
    }

    #[test]
    fn short_starts_on_every_attempt_report_rejection() {
        let dev = FakeDevice::new();
        dev.short_starts(4);
        let err = write(&dev, &Sequence::default(), Stream::LargeMem, 0, &payload(10), &policy(64))
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumRejected { op: "write_large_mem" }));
        assert_eq!(dev.requests(request::WRITE_LARGE_MEM).len(), 4);
        assert!(dev.bulk_lens().is_empty());
    }

    #[test]
    fn vanished_device_on_start_is_not_retried() {
        let dev = FakeDevice::new();
        dev.fail_starts(TransferStatus::Disconnected, 1);
        let err = write(&dev, &Sequence::default(), Stream::Media, 0, &payload(10), &policy(64))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transfer {
                status: TransferStatus::Disconnected,
                ..
            }
        ));
        assert_eq!(dev.requests(request::WRITE_MEDIA).len(), 1);
    }

    #[test]
    fn hard_chunk_error_propagates_at_once() {
        let dev = FakeDevice::new();
        dev.script([Chunk::Full, Chunk::Fail(TransferStatus::Stall)]);
        let err = write(&dev, &Sequence::default(), Stream::LargeMem, 0, &payload(300), &policy(64))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transfer {
                status: TransferStatus::Stall,
                ..
            }
        ));
        assert_eq!(dev.requests(request::WRITE_LARGE_MEM).len(), 1);
    }

    #[test]
    fn read_fills_buffer_and_sends_zero_checksum() {
        let dev = FakeDevice::new();
        let seq = Sequence::default();
        let mut buf = vec![0u8; 5000];
        read(&dev, &seq, Stream::LargeMem, 0x40, &mut buf, &policy(4096)).unwrap();
        assert!(buf.iter().enumerate().all(|(i, &b)| b == stream_byte(i)));
        assert_eq!(seq.current(), 2);
        let headers = dev.headers(request::READ_LARGE_MEM);
        assert_eq!(headers[0].checksum, 0);
        assert_eq!(headers[0].size, 5000);
    }

    #[test]
    fn empty_write_sends_only_the_start() {
        let dev = FakeDevice::new();
        write(&dev, &Sequence::default(), Stream::LargeMem, 0, &[], &policy(64)).unwrap();
        assert!(dev.bulk_lens().is_empty());
        assert_eq!(dev.requests(request::WRITE_LARGE_MEM).len(), 1);
    }

    proptest! {
        #[test]
        fn prop_chunks_cover_the_buffer(len in 0usize..20_000, cap in 1usize..5_000) {
            let dev = FakeDevice::new();
            let seq = Sequence::default();
            let data = payload(len);
            write(&dev, &seq, Stream::LargeMem, 0, &data, &policy(cap)).unwrap();
            let lens = dev.bulk_lens();
            prop_assert_eq!(lens.iter().sum::<usize>(), len);
            prop_assert_eq!(lens.len(), len.div_ceil(cap));
            prop_assert!(lens.iter().all(|&l| l <= cap));
            prop_assert_eq!(seq.current() as usize, lens.len());
            prop_assert_eq!(dev.written(), data);
        }
    }
}
