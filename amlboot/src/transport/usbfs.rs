//! Linux usbdevfs backends.
//!
//! [`UsbfsPort`] is the [`CompletionPort`] for the queued model: URBs go in
//! with `SUBMITURB`, and completions come back through `poll` plus
//! `REAPURBNDELAY`. A self-pipe wakes the poll on close.
//!
//! [`Direct`] is the synchronous model: bounded transfers are single
//! `CONTROL`/`BULK` ioctls and streaming reads use the same URB path as the
//! queued model, driven from the caller's thread. An unbounded bulk read is
//! an URB too, so that `close` can discard it.

#![allow(unsafe_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use amlboot_proto::Setup;
use nix::errno::Errno;
use nix::fcntl::Flock;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, warn};

use super::engine::{CompletionPort, PortEvent, Submission};
use super::urb::{UrbId, UrbKind};
use super::{PipeSet, Reaped, Timeout, Transport, check_control};
use crate::error::{Error, Result, TransferStatus};
use crate::sys::{self, RawUrb};

/// Locks a mutex, recovering from poisoning.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Converts a resolved timeout to usbdevfs milliseconds, where 0 means
/// forever.
fn millis(limit: Option<Duration>) -> u32 {
    limit.map_or(0, |d| u32::try_from(d.as_millis()).unwrap_or(u32::MAX).max(1))
}

/// How long one poll by an unbounded bulk-in waiter lasts before it looks
/// at the closed flag again.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// A claimed device for [`Direct`]: synchronous transfers, plus URBs whose
/// completions can be polled for with a bound.
pub(crate) trait SyncPort: CompletionPort {
    /// One `USBDEVFS_CONTROL`; `ms == 0` waits forever.
    fn control_sync(&self, setup: &Setup, data: &mut [u8], ms: u32) -> io::Result<usize>;

    /// One `USBDEVFS_BULK` read.
    fn bulk_in_sync(&self, pipe: u8, buf: &mut [u8], ms: u32) -> io::Result<usize>;

    /// One `USBDEVFS_BULK` write.
    fn bulk_out_sync(&self, pipe: u8, data: &[u8], ms: u32) -> io::Result<usize>;

    /// Waits up to `timeout` (forever if `None`) for the next event, `None`
    /// when the time runs out. Returns [`PortEvent::Quit`] once released.
    fn poll_event(&self, timeout: Option<Duration>) -> io::Result<Option<PortEvent>>;
}

/// A claimed usbdevfs device node with its in-flight URBs.
pub(crate) struct UsbfsPort {
    /// The locked device node, `None` once released.
    dev: RwLock<Option<Flock<File>>>,
    /// Claimed interface number.
    iface: u8,
    /// Endpoints of the claimed interface.
    pipes: PipeSet,
    /// Kernel-visible URB structs by token.
    inflight: Mutex<HashMap<u64, Box<RawUrb>>>,
    /// Read end of the wake pipe.
    quit_rx: OwnedFd,
    /// Write end of the wake pipe.
    quit_tx: OwnedFd,
}

impl fmt::Debug for UsbfsPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbfsPort")
            .field("iface", &self.iface)
            .field("pipes", &self.pipes)
            .field("inflight", &lock(&self.inflight).len())
            .finish_non_exhaustive()
    }
}

impl UsbfsPort {
    /// Claims `iface` on an opened device node.
    pub fn open(dev: Flock<File>, iface: u8, pipes: PipeSet) -> io::Result<Self> {
        sys::claim_interface(dev.as_fd(), iface)?;
        let (quit_rx, quit_tx) = sys::pipe()?;
        Ok(Self {
            dev: RwLock::new(Some(dev)),
            iface,
            pipes,
            inflight: Mutex::new(HashMap::new()),
            quit_rx,
            quit_tx,
        })
    }

    /// Runs `f` on the device descriptor, or fails if it was released.
    fn with_fd<R>(&self, f: impl FnOnce(BorrowedFd<'_>) -> io::Result<R>) -> io::Result<R> {
        let guard = self.dev.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(dev) => f(dev.as_fd()),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Takes one completed URB if the kernel has one.
    fn reap_one(&self) -> io::Result<Option<PortEvent>> {
        let ptr = match self.with_fd(sys::reap_urb_nonblock) {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.raw_os_error() == Some(libc::ENODEV) => {
                return Ok(Some(PortEvent::Disconnected));
            }
            Err(e) => return Err(e),
        };
        let mut inflight = lock(&self.inflight);
        let token = inflight
            .iter()
            .find(|(_, urb)| std::ptr::eq(urb.as_ref(), ptr.cast_const()))
            .map(|(t, _)| *t);
        let Some(urb) = token.and_then(|t| inflight.remove(&t)) else {
            return Err(io::Error::other("kernel returned an URB that was never submitted"));
        };
        Ok(Some(PortEvent::Completed {
            token: urb.token(),
            actual: urb.actual(),
            status: urb.errno().map(TransferStatus::from_errno),
        }))
    }

    /// Waits up to `timeout` (forever if `None`) for the next event.
    /// Returns `None` when the time runs out.
    pub fn next_event(&self, timeout: Option<Duration>) -> io::Result<Option<PortEvent>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(ev) = self.reap_one()? {
                return Ok(Some(ev));
            }
            let wait = match deadline {
                None => PollTimeout::NONE,
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    let ms = u16::try_from(left.as_millis()).unwrap_or(u16::MAX).max(1);
                    PollTimeout::from(ms)
                }
            };
            let (dev_flags, quit_flags) = {
                let guard = self.dev.read().unwrap_or_else(PoisonError::into_inner);
                let Some(dev) = guard.as_ref() else {
                    return Ok(Some(PortEvent::Quit));
                };
                let mut fds = [
                    PollFd::new(dev.as_fd(), PollFlags::POLLOUT),
                    PollFd::new(self.quit_rx.as_fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, wait) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }
                (fds[0].revents(), fds[1].revents())
            };
            if quit_flags.is_some_and(|f| f.contains(PollFlags::POLLIN)) {
                return Ok(Some(PortEvent::Quit));
            }
            if dev_flags.is_some_and(|f| f.intersects(PollFlags::POLLHUP | PollFlags::POLLERR)) {
                return Ok(Some(
                    self.reap_one()?.unwrap_or(PortEvent::Disconnected),
                ));
            }
        }
    }
}

impl CompletionPort for UsbfsPort {
    fn pipes(&self) -> PipeSet {
        self.pipes
    }

    unsafe fn submit(&self, token: u64, sub: Submission<'_>) -> io::Result<()> {
        let endpoint = if sub.kind == UrbKind::Control {
            0
        } else {
            sub.pipe
        };
        let mut urb = Box::new(RawUrb::new(endpoint, sub.buf, token));
        let ptr: *mut RawUrb = &raw mut *urb;
        let mut inflight = lock(&self.inflight);
        // SAFETY: the box stays in `inflight` until it is reaped or the
        // descriptor is closed, and the caller keeps the data buffer alive
        // for at least as long.
        self.with_fd(|fd| unsafe { sys::submit_urb(fd, ptr) })?;
        inflight.insert(token, urb);
        Ok(())
    }

    fn cancel(&self, token: u64) -> io::Result<()> {
        let inflight = lock(&self.inflight);
        let Some(urb) = inflight.get(&token) else {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        };
        let ptr = (&raw const **urb).cast_mut();
        match self.with_fd(|fd| sys::discard_urb(fd, ptr)) {
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                Err(io::Error::from(io::ErrorKind::NotFound))
            }
            other => other,
        }
    }

    fn wait(&self) -> io::Result<PortEvent> {
        loop {
            if let Some(ev) = self.next_event(None)? {
                return Ok(ev);
            }
        }
    }

    fn wake(&self) -> io::Result<()> {
        sys::poke(self.quit_tx.as_fd())
    }

    fn reset(&self) -> io::Result<()> {
        self.with_fd(sys::reset)
    }

    fn release(&self) -> io::Result<()> {
        let dev = self
            .dev
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(dev) = dev else {
            return Ok(());
        };
        if let Err(e) = sys::release_interface(dev.as_fd(), self.iface) {
            debug!(error = %e, "release interface failed");
        }
        // Closing the node makes the kernel kill and free every URB still
        // queued on it.
        drop(dev);
        lock(&self.inflight).clear();
        Ok(())
    }
}

impl SyncPort for UsbfsPort {
    fn control_sync(&self, setup: &Setup, data: &mut [u8], ms: u32) -> io::Result<usize> {
        self.with_fd(|fd| sys::control(fd, setup, data, ms))
    }

    fn bulk_in_sync(&self, pipe: u8, buf: &mut [u8], ms: u32) -> io::Result<usize> {
        self.with_fd(|fd| sys::bulk_in(fd, pipe, buf, ms))
    }

    fn bulk_out_sync(&self, pipe: u8, data: &[u8], ms: u32) -> io::Result<usize> {
        self.with_fd(|fd| sys::bulk_out(fd, pipe, data, ms))
    }

    fn poll_event(&self, timeout: Option<Duration>) -> io::Result<Option<PortEvent>> {
        self.next_event(timeout)
    }
}

/// A completion picked up by a thread that was waiting for another URB.
#[derive(Debug, Clone, Copy)]
struct Done {
    /// Token of the finished URB.
    token: u64,
    /// Bytes transferred.
    actual: usize,
    /// Completion error, if any.
    status: Option<TransferStatus>,
}

/// Synchronous usbdevfs transport.
#[derive(Debug)]
pub(crate) struct Direct<P: SyncPort = UsbfsPort> {
    /// Device node and URB bookkeeping.
    port: P,
    /// Streaming buffers by token, with their pipe.
    streams: Mutex<HashMap<u64, (u8, Vec<u8>)>>,
    /// Pipes with a blocking bulk-in in progress.
    blocking: Mutex<HashSet<u8>>,
    /// Tokens of unbounded bulk-in URBs in flight.
    waiters: Mutex<HashSet<u64>>,
    /// Completions reaped on behalf of another thread.
    early: Mutex<VecDeque<Done>>,
    /// Next URB token.
    next: AtomicU64,
    /// How long `close` waits for unbounded bulk-in URBs to come back.
    drain: Duration,
    /// Set by `close`.
    closed: AtomicBool,
}

impl<P: SyncPort> Direct<P> {
    /// Wraps a claimed port.
    pub fn new(port: P, drain: Duration) -> Self {
        Self {
            port,
            streams: Mutex::new(HashMap::new()),
            blocking: Mutex::new(HashSet::new()),
            waiters: Mutex::new(HashSet::new()),
            early: Mutex::new(VecDeque::new()),
            next: AtomicU64::new(1),
            drain,
            closed: AtomicBool::new(false),
        }
    }

    /// Fails once the session is closed.
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::InvalidHandle)
        } else {
            Ok(())
        }
    }

    /// Maps a failed synchronous ioctl.
    fn fail(op: &'static str, limit: Option<Duration>, e: &io::Error) -> Error {
        if e.raw_os_error() == Some(libc::ETIMEDOUT) {
            Error::Timeout {
                op,
                after: limit.unwrap_or_default(),
            }
        } else {
            Error::Transfer {
                op,
                status: TransferStatus::from_io(e),
            }
        }
    }

    /// Discards `token`, logging anything but "already finished".
    fn cancel_quietly(&self, token: u64) {
        if let Err(e) = self.port.cancel(token) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(token, error = %e, "discard failed");
            }
        }
    }

    /// Takes the first parked completion whose token `want` accepts.
    fn take_early(&self, want: impl Fn(u64) -> bool) -> Option<Done> {
        let mut early = lock(&self.early);
        let pos = early.iter().position(|d| want(d.token))?;
        early.remove(pos)
    }

    /// Bulk read with no time limit, as an URB that `close` can discard.
    fn bulk_in_urb(&self, pipe: u8, buf: &mut [u8]) -> Result<usize> {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        lock(&self.waiters).insert(token);
        let sub = Submission {
            kind: UrbKind::BulkIn,
            pipe,
            buf,
        };
        // SAFETY: `await_urb` returns only after the completion for `token`
        // was seen or the port was released, so `buf` outlives the URB.
        let done = match unsafe { self.port.submit(token, sub) } {
            Ok(()) => self.await_urb(token),
            Err(e) => Err(Error::Transfer {
                op: "bulk_in",
                status: TransferStatus::from_io(&e),
            }),
        };
        lock(&self.waiters).remove(&token);
        let done = done?;
        match done.status {
            None => Ok(done.actual),
            Some(status) => Err(Error::Transfer {
                op: "bulk_in",
                status,
            }),
        }
    }

    /// Polls in short slices until `token` completes, discarding it once
    /// the session starts closing.
    fn await_urb(&self, token: u64) -> Result<Done> {
        let mut cancelled = false;
        loop {
            if let Some(done) = self.take_early(|t| t == token) {
                return Ok(done);
            }
            if !cancelled && self.closed.load(Ordering::Acquire) {
                cancelled = true;
                self.cancel_quietly(token);
            }
            match self.port.poll_event(Some(WAIT_SLICE)) {
                Ok(Some(PortEvent::Completed {
                    token: t,
                    actual,
                    status,
                })) => {
                    let done = Done {
                        token: t,
                        actual,
                        status,
                    };
                    if t == token {
                        return Ok(done);
                    }
                    lock(&self.early).push_back(done);
                }
                // Released: the kernel has killed the URB.
                Ok(Some(PortEvent::Quit)) => {
                    return Err(Error::Transfer {
                        op: "bulk_in",
                        status: TransferStatus::Cancelled,
                    });
                }
                Ok(Some(PortEvent::Disconnected)) => {
                    return Err(Error::Transfer {
                        op: "bulk_in",
                        status: TransferStatus::Disconnected,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    // The kernel may still own `buf`; keep waiting.
                    warn!(token, error = %e, "polling for bulk-in completion failed");
                    if !cancelled {
                        cancelled = true;
                        self.cancel_quietly(token);
                    }
                    thread::sleep(WAIT_SLICE);
                }
            }
        }
    }
}

impl<P: SyncPort> Transport for Direct<P> {
    fn pipes(&self) -> PipeSet {
        self.port.pipes()
    }

    fn control(&self, setup: &Setup, data: &mut [u8], timeout: Timeout) -> Result<usize> {
        self.check_open()?;
        check_control(setup, data)?;
        let limit = timeout.resolve(Some(Timeout::CONTROL_DEFAULT))?;
        self.port
            .control_sync(setup, data, millis(limit))
            .map_err(|e| Self::fail("control", limit, &e))
    }

    fn bulk_in(&self, pipe: u8, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        self.check_open()?;
        if !self.port.pipes().is_bulk_in(pipe) {
            return Err(Error::InvalidArgument(format!(
                "{pipe:#04x} is not a bulk-in pipe"
            )));
        }
        let limit = timeout.resolve(None)?;
        {
            let streams = lock(&self.streams);
            if streams.values().any(|(p, _)| *p == pipe) {
                return Err(Error::Busy { pipe });
            }
            lock(&self.blocking).insert(pipe);
        }
        let res = match limit {
            Some(_) => self
                .port
                .bulk_in_sync(pipe, buf, millis(limit))
                .map_err(|e| Self::fail("bulk_in", limit, &e)),
            None => self.bulk_in_urb(pipe, buf),
        };
        lock(&self.blocking).remove(&pipe);
        res
    }

    fn bulk_out(&self, pipe: u8, data: &[u8], timeout: Timeout) -> Result<usize> {
        self.check_open()?;
        if !self.port.pipes().is_bulk_out(pipe) {
            return Err(Error::InvalidArgument(format!(
                "{pipe:#04x} is not a bulk-out pipe"
            )));
        }
        let limit = timeout.resolve(None)?;
        self.port
            .bulk_out_sync(pipe, data, millis(limit))
            .map_err(|e| Self::fail("bulk_out", limit, &e))
    }

    fn submit(&self, pipe: u8, buf: Vec<u8>) -> Result<UrbId> {
        self.check_open()?;
        if !self.port.pipes().is_bulk_in(pipe) {
            return Err(Error::InvalidArgument(format!(
                "{pipe:#04x} is not a bulk-in pipe"
            )));
        }
        if lock(&self.blocking).contains(&pipe) {
            return Err(Error::Busy { pipe });
        }
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        let mut streams = lock(&self.streams);
        let (_, data) = streams.entry(token).or_insert((pipe, buf));
        let sub = Submission {
            kind: UrbKind::Reap,
            pipe,
            buf: data,
        };
        // SAFETY: the buffer stays in `streams`, untouched, until its
        // completion is reaped or `close` has released the port.
        if let Err(e) = unsafe { self.port.submit(token, sub) } {
            streams.remove(&token);
            return Err(Error::Transfer {
                op: "submit",
                status: TransferStatus::from_io(&e),
            });
        }
        Ok(UrbId::from_token(token))
    }

    fn reap(&self, timeout: Timeout) -> Result<Reaped> {
        self.check_open()?;
        let queued: HashSet<u64> = lock(&self.streams).keys().copied().collect();
        if queued.is_empty() {
            return Err(Error::InvalidArgument("no streaming URBs queued".into()));
        }
        let limit = timeout.resolve(None)?;
        let deadline = limit.map(|d| Instant::now() + d);
        let expired = || Error::Timeout {
            op: "reap",
            after: limit.unwrap_or_default(),
        };
        loop {
            let done = match self.take_early(|t| queued.contains(&t)) {
                Some(done) => done,
                None => {
                    let left = match deadline {
                        None => None,
                        Some(d) => {
                            let left = d.saturating_duration_since(Instant::now());
                            if left.is_zero() {
                                return Err(expired());
                            }
                            Some(left)
                        }
                    };
                    match self.port.poll_event(left)? {
                        Some(PortEvent::Completed {
                            token,
                            actual,
                            status,
                        }) => Done {
                            token,
                            actual,
                            status,
                        },
                        Some(_) => {
                            return Err(Error::Transfer {
                                op: "reap",
                                status: TransferStatus::Disconnected,
                            });
                        }
                        None => return Err(expired()),
                    }
                }
            };
            if lock(&self.waiters).contains(&done.token) {
                lock(&self.early).push_back(done);
                continue;
            }
            let Some((pipe, mut data)) = lock(&self.streams).remove(&done.token) else {
                return Err(Error::FatalConsistency(format!(
                    "reaped unknown token {:#x}",
                    done.token
                )));
            };
            data.truncate(done.actual);
            return Ok(Reaped {
                id: UrbId::from_token(done.token),
                pipe,
                data,
                status: done.status,
            });
        }
    }

    fn discard(&self, id: UrbId) -> Result<()> {
        self.check_open()?;
        match self.port.cancel(id.to_token()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn reset(&self) -> Result<()> {
        self.check_open()?;
        self.port.reset()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidHandle);
        }
        let mut tokens: Vec<u64> = lock(&self.streams).keys().copied().collect();
        tokens.extend(lock(&self.waiters).iter().copied());
        for token in tokens {
            self.cancel_quietly(token);
        }
        // Waiters leave once their discard lands. Releasing the port kills
        // whatever is left after the drain bound.
        let deadline = Instant::now() + self.drain;
        while !lock(&self.waiters).is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        let stuck = lock(&self.waiters).len();
        if stuck > 0 {
            warn!(stuck, "bulk-in URBs still queued at close");
        }
        let released = self.port.release();
        lock(&self.streams).clear();
        lock(&self.early).clear();
        released.map_err(Error::Io)
    }
}

impl<P: SyncPort> Drop for Direct<P> {
    fn drop(&mut self) {
        match self.close() {
            Ok(()) | Err(Error::InvalidHandle) => {}
            Err(e) => warn!(error = %e, "error closing session on drop"),
        }
    }
}
