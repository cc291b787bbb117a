//! Scriptable in-memory device for tests.

#![allow(clippy::unwrap_used, clippy::missing_docs_in_private_items)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use amlboot_proto::{Direction, Setup, TransferHeader, request};

use crate::config::{Config, PollConfig};
use crate::device::{Connector, DeviceId, DeviceInfo, select};
use crate::error::{Error, Result, TransferStatus};
use crate::rom::BootRom;
use crate::seq::Sequences;
use crate::transport::{PipeSet, Reaped, Timeout, Transport, UrbId};

/// What the next bulk transfer does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Chunk {
    /// Moves every byte.
    Full,
    /// Moves nothing.
    Zero,
    /// Moves all but this many bytes.
    Short(usize),
    /// Fails outright.
    Fail(TransferStatus),
}

/// What the next transfer start command does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartFault {
    /// Fails with this status.
    Fail(TransferStatus),
    /// Accepts one byte less than sent.
    Short,
}

#[derive(Debug, Default)]
struct State {
    controls: Vec<(Setup, Vec<u8>)>,
    chunks: VecDeque<Chunk>,
    start_faults: VecDeque<StartFault>,
    replies: HashMap<u8, VecDeque<Vec<u8>>>,
    bulk_replies: VecDeque<Vec<u8>>,
    bulk_lens: Vec<usize>,
    written: Vec<u8>,
    read_offset: usize,
    closes: usize,
}

/// A device that records every frame and follows a fault script.
#[derive(Debug, Default)]
pub(crate) struct FakeDevice {
    state: Mutex<State>,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Queues behaviours for upcoming bulk transfers; unscripted ones are
    /// [`Chunk::Full`].
    pub fn script(&self, chunks: impl IntoIterator<Item = Chunk>) {
        self.lock().chunks.extend(chunks);
    }

    /// Makes the next `n` transfer start commands stall.
    pub fn reject_starts(&self, n: usize) {
        self.fail_starts(TransferStatus::Stall, n);
    }

    /// Makes the next `n` transfer start commands fail with `status`.
    pub fn fail_starts(&self, status: TransferStatus, n: usize) {
        self.lock()
            .start_faults
            .extend(std::iter::repeat_n(StartFault::Fail(status), n));
    }

    /// Makes the next `n` transfer start commands accept one byte less than
    /// the header.
    pub fn short_starts(&self, n: usize) {
        self.lock()
            .start_faults
            .extend(std::iter::repeat_n(StartFault::Short, n));
    }

    /// Queues the reply to the next IN control transfer with `request`.
    pub fn reply(&self, request: u8, bytes: &[u8]) {
        self.lock()
            .replies
            .entry(request)
            .or_default()
            .push_back(bytes.to_vec());
    }

    /// Queues a bulk-in reply, served before any streamed data.
    pub fn bulk_reply(&self, bytes: &[u8]) {
        self.lock().bulk_replies.push_back(bytes.to_vec());
    }

    /// Every control transfer so far, OUT payloads included.
    pub fn controls(&self) -> Vec<(Setup, Vec<u8>)> {
        self.lock().controls.clone()
    }

    /// Control transfers with `request`.
    pub fn requests(&self, request: u8) -> Vec<(Setup, Vec<u8>)> {
        self.controls()
            .into_iter()
            .filter(|(s, _)| s.request == request)
            .collect()
    }

    /// Transfer headers sent with `request`.
    pub fn headers(&self, request: u8) -> Vec<TransferHeader> {
        self.requests(request)
            .iter()
            .filter_map(|(s, d)| TransferHeader::from_wire(d, s.value))
            .collect()
    }

    /// Bytes requested by each bulk transfer that moved data.
    pub fn bulk_lens(&self) -> Vec<usize> {
        self.lock().bulk_lens.clone()
    }

    /// Everything accepted on the bulk-out pipe.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    /// Number of sessions closed.
    pub fn closes(&self) -> usize {
        self.lock().closes
    }
}

/// Byte the fake returns at stream offset `i`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn stream_byte(i: usize) -> u8 {
    (i % 251) as u8
}

impl Transport for Arc<FakeDevice> {
    fn pipes(&self) -> PipeSet {
        PipeSet::default()
    }

    fn control(&self, setup: &Setup, data: &mut [u8], _timeout: Timeout) -> Result<usize> {
        let mut st = self.lock();
        st.controls.push((*setup, data.to_vec()));
        let is_start = matches!(
            setup.request,
            request::WRITE_LARGE_MEM
                | request::READ_LARGE_MEM
                | request::WRITE_MEDIA
                | request::READ_MEDIA
        );
        if is_start {
            match st.start_faults.pop_front() {
                Some(StartFault::Fail(status)) => {
                    return Err(Error::Transfer {
                        op: "control",
                        status,
                    });
                }
                Some(StartFault::Short) => return Ok(data.len().saturating_sub(1)),
                None => {}
            }
        }
        if setup.direction() == Direction::Out {
            return Ok(data.len());
        }
        if let Some(reply) = st
            .replies
            .get_mut(&setup.request)
            .and_then(VecDeque::pop_front)
        {
            let n = reply.len().min(data.len());
            data[..n].copy_from_slice(&reply[..n]);
            return Ok(n);
        }
        if setup.request == request::READ_MEM {
            let addr = (u32::from(setup.value) << 16) | u32::from(setup.index);
            for (i, b) in data.iter_mut().enumerate() {
                *b = stream_byte(addr as usize + i);
            }
        }
        Ok(data.len())
    }

    fn bulk_in(&self, _pipe: u8, buf: &mut [u8], _timeout: Timeout) -> Result<usize> {
        let mut st = self.lock();
        if let Some(reply) = st.bulk_replies.pop_front() {
            let n = reply.len().min(buf.len());
            buf[..n].copy_from_slice(&reply[..n]);
            return Ok(n);
        }
        let n = match st.chunks.pop_front().unwrap_or(Chunk::Full) {
            Chunk::Full => buf.len(),
            Chunk::Zero => 0,
            Chunk::Short(k) => buf.len().saturating_sub(k),
            Chunk::Fail(status) => {
                return Err(Error::Transfer {
                    op: "bulk_in",
                    status,
                });
            }
        };
        for (i, b) in buf[..n].iter_mut().enumerate() {
            *b = stream_byte(st.read_offset + i);
        }
        st.read_offset += n;
        if n > 0 {
            st.bulk_lens.push(buf.len());
        }
        Ok(n)
    }

    fn bulk_out(&self, _pipe: u8, data: &[u8], _timeout: Timeout) -> Result<usize> {
        let mut st = self.lock();
        let n = match st.chunks.pop_front().unwrap_or(Chunk::Full) {
            Chunk::Full => data.len(),
            Chunk::Zero => 0,
            Chunk::Short(k) => data.len().saturating_sub(k),
            Chunk::Fail(status) => {
                return Err(Error::Transfer {
                    op: "bulk_out",
                    status,
                });
            }
        };
        st.written.extend_from_slice(&data[..n]);
        if n > 0 {
            st.bulk_lens.push(data.len());
        }
        Ok(n)
    }

    fn submit(&self, pipe: u8, _buf: Vec<u8>) -> Result<UrbId> {
        Err(Error::Busy { pipe })
    }

    fn reap(&self, _timeout: Timeout) -> Result<Reaped> {
        Err(Error::InvalidArgument("no streaming URBs queued".into()))
    }

    fn discard(&self, _id: UrbId) -> Result<()> {
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.lock().closes += 1;
        Ok(())
    }
}

/// Connector that hands out one [`FakeDevice`].
#[derive(Debug)]
pub(crate) struct FakeConnector {
    pub device: Arc<FakeDevice>,
    opens: AtomicUsize,
}

impl FakeConnector {
    pub fn new(device: &Arc<FakeDevice>) -> Self {
        Self {
            device: Arc::clone(device),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    fn scan(&self, vendor_id: u16, product_id: u16) -> Result<Vec<DeviceInfo>> {
        Ok(vec![DeviceInfo {
            path: PathBuf::from("/dev/bus/usb/001/002"),
            bus: 1,
            address: 2,
            vendor_id,
            product_id,
            interface: 0,
            pipes: PipeSet::default(),
        }])
    }

    fn connect(&self, id: &DeviceId, _config: &Config) -> Result<Box<dyn Transport>> {
        select(self.scan(id.vendor_id, id.product_id)?, id)?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Arc::clone(&self.device)))
    }
}

/// A [`BootRom`] over `dev` with millisecond polls and no password pause.
pub(crate) fn boot_rom(dev: &Arc<FakeDevice>, seqs: &Arc<Sequences>) -> (BootRom, Arc<FakeConnector>) {
    let fast = PollConfig {
        interval_ms: 1,
        budget_ms: 100,
    };
    let config = Config {
        password_settle_ms: 0,
        media_poll: fast,
        bulk_cmd_poll: fast,
        ..Config::default()
    };
    let conn = Arc::new(FakeConnector::new(dev));
    let rom = BootRom::new(
        Arc::clone(&conn) as Arc<dyn Connector>,
        DeviceId::from_config(&config, 0),
        config,
        Arc::clone(seqs),
    );
    (rom, conn)
}
