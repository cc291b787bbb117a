//! Completion-queue transport engine.
//!
//! Every transfer becomes an URB that is handed to a [`CompletionPort`] and
//! parked on the pending queue. A worker thread blocks in
//! [`CompletionPort::wait`]; for each completion it takes the session lock,
//! moves the URB to the ready queue and broadcasts. Callers wait on the
//! condition variable, re-checking the ready queue on every wake.
//!
//! Buffers stay in the arena from submission until the completion arrives,
//! even if the caller gives up waiting, so the OS never writes into freed
//! memory.

#![allow(unsafe_code)]

use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use amlboot_proto::{Direction, Setup};
use tracing::{debug, error, warn};

use super::urb::{Arena, Queues, Urb, UrbId, UrbKind, Xids};
use super::{PipeSet, Reaped, Timeout, Transport, check_control};
use crate::error::{Error, Result, TransferStatus};

/// A transfer handed to [`CompletionPort::submit`].
#[derive(Debug)]
pub struct Submission<'a> {
    /// Purpose of the transfer.
    pub kind: UrbKind,
    /// Endpoint address; 0 for control.
    pub pipe: u8,
    /// Data buffer. Control buffers start with the setup packet.
    pub buf: &'a mut [u8],
}

/// What [`CompletionPort::wait`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PortEvent {
    /// A submitted transfer finished, successfully or not.
    Completed {
        /// Token passed to `submit`.
        token: u64,
        /// Data bytes transferred, excluding any setup packet.
        actual: usize,
        /// Completion error, if any.
        status: Option<TransferStatus>,
    },
    /// The quit sentinel posted by [`CompletionPort::wake`].
    Quit,
    /// The device is gone; no further completions will arrive.
    Disconnected,
}

/// OS completion queue behind an [`Engine`].
pub trait CompletionPort: Send + Sync + fmt::Debug + 'static {
    /// Endpoints of the claimed interface.
    fn pipes(&self) -> PipeSet;

    /// Queues a transfer with the OS.
    ///
    /// # Safety
    ///
    /// `sub.buf` must stay valid, and must not be read or written by the
    /// caller, until `wait` has returned the completion for `token` or
    /// `release` has returned.
    unsafe fn submit(&self, token: u64, sub: Submission<'_>) -> io::Result<()>;

    /// Requests cancellation. Returns `ErrorKind::NotFound` if the transfer
    /// has already completed. A cancelled transfer still produces a
    /// completion.
    fn cancel(&self, token: u64) -> io::Result<()>;

    /// Blocks until the next event.
    fn wait(&self) -> io::Result<PortEvent>;

    /// Makes a blocked `wait` return [`PortEvent::Quit`].
    fn wake(&self) -> io::Result<()>;

    /// Issues a port reset.
    fn reset(&self) -> io::Result<()>;

    /// Releases the OS handle. Transfers still queued are destroyed by the
    /// OS.
    fn release(&self) -> io::Result<()>;
}

/// Mutable session state, guarded by [`Shared::state`].
#[derive(Debug, Default)]
struct State {
    /// Every URB the engine currently owns.
    arena: Arena,
    /// Pending and ready sets.
    queues: Queues,
    /// Transaction ids.
    xids: Xids,
    /// Set once `close` starts.
    closing: bool,
    /// Set once `close` finishes.
    closed: bool,
    /// Set when the device disappears.
    disconnected: bool,
    /// First consistency violation, if any.
    fatal: Option<String>,
    /// Force-unlinked URBs whose buffers must outlive the OS handle.
    orphans: Vec<Urb>,
}

impl State {
    /// Error for operations attempted on a session that can no longer
    /// carry them.
    fn check_usable(&self, op: &'static str) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidHandle);
        }
        if self.closing {
            return Err(Error::Transfer {
                op,
                status: TransferStatus::Cancelled,
            });
        }
        if let Some(msg) = &self.fatal {
            return Err(Error::FatalConsistency(msg.clone()));
        }
        if self.disconnected {
            return Err(Error::Transfer {
                op,
                status: TransferStatus::Disconnected,
            });
        }
        Ok(())
    }

    /// Records the first consistency violation and returns it as an error.
    fn poison(&mut self, err: Error) -> Error {
        if let Error::FatalConsistency(msg) = &err {
            error!(%msg, "transport state corrupted; session must be closed");
            self.fatal.get_or_insert_with(|| msg.clone());
        }
        err
    }

    /// True if any URB of `kind` on `pipe` is still owned by the engine.
    fn has_on_pipe(&self, kind: UrbKind, pipe: u8) -> bool {
        self.arena
            .iter()
            .any(|(_, u)| u.kind == kind && u.pipe == pipe)
    }

    /// Gives up on `id`: drops it if it already completed, otherwise leaves
    /// it pending for the worker to discard on arrival.
    fn abandon(&mut self, id: UrbId) {
        if self.queues.take_ready(id) {
            self.arena.remove(id);
        } else if let Some(urb) = self.arena.get_mut(id) {
            urb.abandoned = true;
        }
    }
}

/// State shared with the worker.
#[derive(Debug)]
struct Shared<P> {
    /// OS completion queue.
    port: P,
    /// Session state.
    state: Mutex<State>,
    /// Broadcast on every completion and on close.
    cond: Condvar,
}

impl<P: CompletionPort> Shared<P> {
    /// Locks the state, recovering from a poisoned lock.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Worker side: moves a completed URB from pending to ready.
    fn complete(&self, id: UrbId, actual: usize, status: Option<TransferStatus>) {
        let mut st = self.lock();
        let State { arena, queues, .. } = &mut *st;
        let abandoned = match arena.get_mut(id) {
            Some(urb) => {
                urb.len = actual.min(urb.requested);
                urb.status = status;
                urb.abandoned
            }
            None => {
                st.poison(Error::FatalConsistency(format!(
                    "completion for unknown {id:?}"
                )));
                self.cond.notify_all();
                return;
            }
        };
        if abandoned {
            if queues.unlink_pending(id) {
                arena.remove(id);
                debug!(?id, ?status, "dropped completion nobody waits for");
            } else {
                st.poison(Error::FatalConsistency(format!(
                    "abandoned {id:?} completed but was not pending"
                )));
            }
        } else if let Err(e) = queues.complete(id) {
            st.poison(e);
        }
        self.cond.notify_all();
    }

    /// Worker thread body.
    fn run(&self) {
        loop {
            match self.port.wait() {
                Ok(PortEvent::Quit) => break,
                Ok(PortEvent::Completed {
                    token,
                    actual,
                    status,
                }) => self.complete(UrbId::from_token(token), actual, status),
                Ok(PortEvent::Disconnected) => {
                    warn!("device disconnected");
                    self.lock().disconnected = true;
                    self.cond.notify_all();
                    break;
                }
                Err(e) => {
                    let mut st = self.lock();
                    if !st.closing {
                        st.poison(Error::FatalConsistency(format!(
                            "completion port failed: {e}"
                        )));
                    }
                    self.cond.notify_all();
                    break;
                }
            }
        }
        debug!("completion worker exiting");
    }
}

/// Completion-queue [`Transport`] over a [`CompletionPort`].
#[derive(Debug)]
pub struct Engine<P: CompletionPort> {
    /// State shared with the worker.
    shared: Arc<Shared<P>>,
    /// Worker handle, taken by `close`.
    worker: Mutex<Option<JoinHandle<()>>>,
    /// How long `close` waits for cancelled URBs to drain.
    drain: Duration,
}

impl<P: CompletionPort> Engine<P> {
    /// Starts the completion worker for `port`.
    pub fn start(port: P, drain: Duration) -> Result<Self> {
        let shared = Arc::new(Shared {
            port,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("amlboot-completion".into())
                .spawn(move || shared.run())?
        };
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            drain,
        })
    }

    /// Submits an URB while holding the lock and records it as pending.
    fn submit_locked(
        &self,
        st: &mut State,
        op: &'static str,
        kind: UrbKind,
        pipe: u8,
        data: Vec<u8>,
    ) -> Result<UrbId> {
        let mut urb = Urb::new(kind, pipe, data);
        urb.xid = st.xids.issue(kind);
        let id = st.arena.insert(urb);
        let Some(urb) = st.arena.get_mut(id) else {
            return Err(st.poison(Error::FatalConsistency(format!(
                "{id:?} vanished after insert"
            ))));
        };
        let sub = Submission {
            kind,
            pipe,
            buf: &mut urb.data,
        };
        // SAFETY: the URB stays in the arena until its completion is
        // consumed or `close` has released the port; its heap buffer is not
        // touched in between.
        if let Err(e) = unsafe { self.shared.port.submit(id.to_token(), sub) } {
            st.arena.remove(id);
            return Err(Error::Transfer {
                op,
                status: TransferStatus::from_io(&e),
            });
        }
        if let Err(e) = st.queues.push_pending(id) {
            return Err(st.poison(e));
        }
        Ok(id)
    }

    /// Submits one URB and waits for it.
    fn transfer(
        &self,
        op: &'static str,
        kind: UrbKind,
        pipe: u8,
        data: Vec<u8>,
        limit: Option<Duration>,
    ) -> Result<Urb> {
        let shared = &*self.shared;
        let mut st = shared.lock();
        st.check_usable(op)?;
        if kind == UrbKind::BulkIn && st.has_on_pipe(UrbKind::Reap, pipe) {
            return Err(Error::Busy { pipe });
        }
        let id = self.submit_locked(&mut st, op, kind, pipe, data)?;

        let mut deadline = limit.map(|t| Instant::now() + t);
        let mut cancelled = false;
        loop {
            if st.queues.take_ready(id) {
                let Some(urb) = st.arena.remove(id) else {
                    return Err(st.poison(Error::FatalConsistency(format!(
                        "ready {id:?} missing from arena"
                    ))));
                };
                if let Err(e) = st.xids.consume(kind, urb.xid) {
                    return Err(st.poison(e));
                }
                return match urb.status {
                    None => Ok(urb),
                    Some(TransferStatus::Cancelled) if cancelled => Err(Error::Timeout {
                        op,
                        after: limit.unwrap_or_default(),
                    }),
                    Some(status) => Err(Error::Transfer { op, status }),
                };
            }
            if let Err(e) = st.check_usable(op) {
                st.abandon(id);
                return Err(e);
            }
            st = match deadline {
                None => shared.cond.wait(st).unwrap_or_else(PoisonError::into_inner),
                Some(d) => {
                    let now = Instant::now();
                    if now < d {
                        shared
                            .cond
                            .wait_timeout(st, d - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    } else if cancelled {
                        warn!(op, ?id, "cancelled URB did not come back; abandoning it");
                        st.abandon(id);
                        return Err(Error::Timeout {
                            op,
                            after: limit.unwrap_or_default(),
                        });
                    } else {
                        debug!(op, ?id, "timed out; cancelling");
                        cancel(&shared.port, id);
                        cancelled = true;
                        deadline = Some(now + self.drain);
                        st
                    }
                }
            };
        }
    }

    /// Resolves a bulk pipe and rejects ones the interface lacks.
    fn check_pipe(&self, pipe: u8, is_in: bool) -> Result<()> {
        let pipes = self.shared.port.pipes();
        let ok = if is_in {
            pipes.is_bulk_in(pipe)
        } else {
            pipes.is_bulk_out(pipe)
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "{pipe:#04x} is not a bulk-{} pipe",
                if is_in { "in" } else { "out" }
            )))
        }
    }
}

/// Requests cancellation, treating "already completed" as success.
fn cancel<P: CompletionPort>(port: &P, id: UrbId) {
    match port.cancel(id.to_token()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(?id, error = %e, "cancel failed"),
    }
}

impl<P: CompletionPort> Transport for Engine<P> {
    fn pipes(&self) -> PipeSet {
        self.shared.port.pipes()
    }

    fn control(&self, setup: &Setup, data: &mut [u8], timeout: Timeout) -> Result<usize> {
        check_control(setup, data)?;
        let limit = timeout.resolve(Some(Timeout::CONTROL_DEFAULT))?;
        let is_in = setup.direction() == Direction::In;
        let mut buf = Vec::with_capacity(Setup::LEN + data.len());
        buf.extend_from_slice(&setup.to_bytes());
        if is_in {
            buf.resize(Setup::LEN + data.len(), 0);
        } else {
            buf.extend_from_slice(data);
        }
        let urb = self.transfer("control", UrbKind::Control, 0, buf, limit)?;
        let n = urb.len.min(data.len());
        if is_in {
            data[..n].copy_from_slice(&urb.data[Setup::LEN..Setup::LEN + n]);
        }
        Ok(n)
    }

    fn bulk_in(&self, pipe: u8, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        self.check_pipe(pipe, true)?;
        let limit = timeout.resolve(None)?;
        let urb = self.transfer("bulk_in", UrbKind::BulkIn, pipe, vec![0; buf.len()], limit)?;
        let n = urb.len.min(buf.len());
        buf[..n].copy_from_slice(&urb.data[..n]);
        Ok(n)
    }

    fn bulk_out(&self, pipe: u8, data: &[u8], timeout: Timeout) -> Result<usize> {
        self.check_pipe(pipe, false)?;
        let limit = timeout.resolve(None)?;
        let urb = self.transfer("bulk_out", UrbKind::BulkOut, pipe, data.to_vec(), limit)?;
        Ok(urb.len)
    }

    fn submit(&self, pipe: u8, buf: Vec<u8>) -> Result<UrbId> {
        self.check_pipe(pipe, true)?;
        let mut st = self.shared.lock();
        st.check_usable("submit")?;
        if st.has_on_pipe(UrbKind::BulkIn, pipe) {
            return Err(Error::Busy { pipe });
        }
        self.submit_locked(&mut st, "submit", UrbKind::Reap, pipe, buf)
    }

    fn reap(&self, timeout: Timeout) -> Result<Reaped> {
        let limit = timeout.resolve(None)?;
        let deadline = limit.map(|t| Instant::now() + t);
        let shared = &*self.shared;
        let mut st = shared.lock();
        loop {
            if st.closed {
                return Err(Error::InvalidHandle);
            }
            let State {
                arena,
                queues,
                xids,
                ..
            } = &mut *st;
            let found = queues
                .take_first_ready(|id| arena.get(id).is_some_and(|u| u.kind == UrbKind::Reap));
            if let Some(id) = found {
                let Some(urb) = arena.remove(id) else {
                    return Err(st.poison(Error::FatalConsistency(format!(
                        "ready {id:?} missing from arena"
                    ))));
                };
                if let Err(e) = xids.consume(UrbKind::Reap, urb.xid) {
                    return Err(st.poison(e));
                }
                let mut data = urb.data;
                data.truncate(urb.len);
                return Ok(Reaped {
                    id,
                    pipe: urb.pipe,
                    data,
                    status: urb.status,
                });
            }
            st.check_usable("reap")?;
            if !st
                .queues
                .pending()
                .any(|id| st.arena.get(id).is_some_and(|u| u.kind == UrbKind::Reap))
            {
                return Err(Error::InvalidArgument("no streaming URBs queued".into()));
            }
            st = match deadline {
                None => shared.cond.wait(st).unwrap_or_else(PoisonError::into_inner),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::Timeout {
                            op: "reap",
                            after: limit.unwrap_or_default(),
                        });
                    }
                    shared
                        .cond
                        .wait_timeout(st, d - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn discard(&self, id: UrbId) -> Result<()> {
        let st = self.shared.lock();
        if st.closed {
            return Err(Error::InvalidHandle);
        }
        if st.queues.is_pending(id) {
            cancel(&self.shared.port, id);
        }
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.shared.lock().check_usable("reset")?;
        self.shared.port.reset()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let shared = &*self.shared;
        {
            let mut st = shared.lock();
            if st.closed || st.closing {
                return Err(Error::InvalidHandle);
            }
            st.closing = true;
            let pending: Vec<UrbId> = st.queues.pending().collect();
            for id in pending {
                cancel(&shared.port, id);
            }
            shared.cond.notify_all();

            let deadline = Instant::now() + self.drain;
            while !st.queues.pending_is_empty() && !st.disconnected && st.fatal.is_none() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                st = shared
                    .cond
                    .wait_timeout(st, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }

        if let Err(e) = shared.port.wake() {
            warn!(error = %e, "failed to wake completion worker");
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                warn!("completion worker panicked");
            }
        }

        let mut st = shared.lock();
        let stuck = st.queues.drain_pending();
        if !stuck.is_empty() {
            warn!(count = stuck.len(), "force-unlinking URBs that never completed");
        }
        for id in stuck {
            if let Some(urb) = st.arena.remove(id) {
                st.orphans.push(urb);
            }
        }
        for id in st.queues.drain_ready() {
            st.arena.remove(id);
        }
        let released = shared.port.release();
        if released.is_ok() {
            st.orphans.clear();
        } else {
            // The OS may still own these buffers.
            std::mem::forget(std::mem::take(&mut st.orphans));
        }
        st.closed = true;
        shared.cond.notify_all();
        released.map_err(Error::Io)
    }
}

impl<P: CompletionPort> Drop for Engine<P> {
    fn drop(&mut self) {
        match self.close() {
            Ok(()) | Err(Error::InvalidHandle) => {}
            Err(e) => warn!(error = %e, "error closing session on drop"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::missing_docs_in_private_items)]
mod tests {
    use std::collections::{HashSet, VecDeque};

    use amlboot_proto::{VENDOR_IN, VENDOR_OUT};

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Mode {
        /// Complete every transfer as soon as it is submitted.
        Immediate,
        /// Hold transfers until cancelled or released by the test.
        Hold,
        /// Hold transfers and ignore cancellation.
        Stuck,
    }

    #[derive(Debug)]
    struct Inner {
        mode: Mutex<Mode>,
        events: Mutex<VecDeque<PortEvent>>,
        cond: Condvar,
        held: Mutex<Vec<(u64, usize)>>,
        cancelled: Mutex<HashSet<u64>>,
        released: Mutex<bool>,
    }

    #[derive(Debug, Clone)]
    struct MockPort(Arc<Inner>);

    impl MockPort {
        fn new(mode: Mode) -> Self {
            Self(Arc::new(Inner {
                mode: Mutex::new(mode),
                events: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                held: Mutex::new(Vec::new()),
                cancelled: Mutex::new(HashSet::new()),
                released: Mutex::new(false),
            }))
        }

        fn set_mode(&self, mode: Mode) {
            *self.0.mode.lock().unwrap() = mode;
        }

        fn push(&self, ev: PortEvent) {
            self.0.events.lock().unwrap().push_back(ev);
            self.0.cond.notify_all();
        }

        /// Completes the held transfer at `pos` with its full length.
        fn finish_held(&self, pos: usize) {
            let (token, len) = self.0.held.lock().unwrap().remove(pos);
            self.push(PortEvent::Completed {
                token,
                actual: len,
                status: None,
            });
        }

        fn held(&self) -> usize {
            self.0.held.lock().unwrap().len()
        }

        fn cancels(&self) -> usize {
            self.0.cancelled.lock().unwrap().len()
        }
    }

    impl CompletionPort for MockPort {
        fn pipes(&self) -> PipeSet {
            PipeSet {
                bulk_in_alt: Some(0x82),
                ..PipeSet::default()
            }
        }

        unsafe fn submit(&self, token: u64, sub: Submission<'_>) -> io::Result<()> {
            let mode = *self.0.mode.lock().unwrap();
            let data_len = match sub.kind {
                UrbKind::Control => sub.buf.len() - Setup::LEN,
                _ => sub.buf.len(),
            };
            if mode == Mode::Immediate {
                match sub.kind {
                    UrbKind::Control if sub.buf[0] & 0x80 != 0 => {
                        for (i, b) in sub.buf[Setup::LEN..].iter_mut().enumerate() {
                            *b = i as u8;
                        }
                    }
                    UrbKind::BulkIn | UrbKind::Reap => sub.buf.fill(0xA5),
                    _ => {}
                }
                self.push(PortEvent::Completed {
                    token,
                    actual: data_len,
                    status: None,
                });
            } else {
                self.0.held.lock().unwrap().push((token, data_len));
            }
            Ok(())
        }

        fn cancel(&self, token: u64) -> io::Result<()> {
            self.0.cancelled.lock().unwrap().insert(token);
            if *self.0.mode.lock().unwrap() == Mode::Stuck {
                return Ok(());
            }
            let mut held = self.0.held.lock().unwrap();
            let Some(pos) = held.iter().position(|(t, _)| *t == token) else {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            };
            held.remove(pos);
            drop(held);
            self.push(PortEvent::Completed {
                token,
                actual: 0,
                status: Some(TransferStatus::Cancelled),
            });
            Ok(())
        }

        fn wait(&self) -> io::Result<PortEvent> {
            let mut events = self.0.events.lock().unwrap();
            loop {
                if let Some(ev) = events.pop_front() {
                    return Ok(ev);
                }
                events = self.0.cond.wait(events).unwrap();
            }
        }

        fn wake(&self) -> io::Result<()> {
            self.push(PortEvent::Quit);
            Ok(())
        }

        fn reset(&self) -> io::Result<()> {
            Ok(())
        }

        fn release(&self) -> io::Result<()> {
            *self.0.released.lock().unwrap() = true;
            Ok(())
        }
    }

    fn engine(mode: Mode) -> (Engine<MockPort>, MockPort) {
        let port = MockPort::new(mode);
        let engine = Engine::start(port.clone(), Duration::from_millis(100)).unwrap();
        (engine, port)
    }

    fn setup_in(len: u16) -> Setup {
        Setup {
            request_type: VENDOR_IN,
            request: 0x20,
            value: 0,
            index: 0,
            length: len,
        }
    }

    #[test]
    fn control_in_returns_device_bytes() {
        let (engine, _port) = engine(Mode::Immediate);
        let mut buf = [0u8; 8];
        let n = engine
            .control(&setup_in(8), &mut buf, Timeout::Default)
            .unwrap();
        assert_eq!(n, 8);
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn control_out_reports_length() {
        let (engine, _port) = engine(Mode::Immediate);
        let setup = Setup {
            request_type: VENDOR_OUT,
            request: 0x01,
            value: 0,
            index: 0,
            length: 4,
        };
        let mut data = [1, 2, 3, 4];
        assert_eq!(engine.control(&setup, &mut data, Timeout::Default).unwrap(), 4);
    }

    #[test]
    fn rejects_zero_timeout_and_length_mismatch() {
        let (engine, _port) = engine(Mode::Immediate);
        let mut buf = [0u8; 4];
        let zero = Timeout::After(Duration::ZERO);
        assert!(matches!(
            engine.control(&setup_in(4), &mut buf, zero),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.control(&setup_in(8), &mut buf, Timeout::Default),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn timeout_cancels_only_that_urb() {
        let (engine, port) = engine(Mode::Hold);
        let mut buf = [0u8; 64];
        let err = engine
            .bulk_in(0x81, &mut buf, Duration::from_millis(20).into())
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { op: "bulk_in", .. }));
        assert_eq!(port.cancels(), 1);
        assert_eq!(port.held(), 0);

        port.set_mode(Mode::Immediate);
        assert_eq!(engine.bulk_in(0x81, &mut buf, Timeout::Default).unwrap(), 64);
        assert!(buf.iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn completion_racing_the_deadline_still_succeeds() {
        let (engine, port) = engine(Mode::Hold);
        let engine = Arc::new(engine);
        let reader = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut buf = [0u8; 16];
                engine.bulk_in(0x81, &mut buf, Duration::from_secs(5).into())
            })
        };
        while port.held() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        port.finish_held(0);
        assert_eq!(reader.join().unwrap().unwrap(), 16);
    }

    #[test]
    fn close_unblocks_infinite_bulk_in() {
        let (engine, port) = engine(Mode::Hold);
        let engine = Arc::new(engine);
        let reader = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut buf = [0u8; 512];
                engine.bulk_in(0x81, &mut buf, Timeout::from_millis(-1).unwrap())
            })
        };
        while port.held() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let started = Instant::now();
        engine.close().unwrap();
        let res = reader.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            res,
            Err(Error::Transfer {
                status: TransferStatus::Cancelled,
                ..
            })
        ));
        assert!(*port.0.released.lock().unwrap());
    }

    #[test]
    fn second_close_is_invalid_handle() {
        let (engine, _port) = engine(Mode::Immediate);
        engine.close().unwrap();
        assert!(matches!(engine.close(), Err(Error::InvalidHandle)));
        let mut buf = [0u8; 4];
        assert!(matches!(
            engine.bulk_in(0x81, &mut buf, Timeout::Default),
            Err(Error::InvalidHandle)
        ));
    }

    #[test]
    fn close_force_unlinks_urbs_that_never_drain() {
        let (engine, port) = engine(Mode::Stuck);
        engine.submit(0x81, vec![0; 64]).unwrap();
        let started = Instant::now();
        engine.close().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(port.cancels(), 1);
        assert!(*port.0.released.lock().unwrap());
    }

    #[test]
    fn mixing_streaming_and_blocking_on_a_pipe_is_busy() {
        let (engine, _port) = engine(Mode::Hold);
        engine.submit(0x81, vec![0; 64]).unwrap();
        let mut buf = [0u8; 64];
        assert!(matches!(
            engine.bulk_in(0x81, &mut buf, Duration::from_millis(10).into()),
            Err(Error::Busy { pipe: 0x81 })
        ));
        // The other bulk-in pipe is unaffected.
        assert!(matches!(
            engine.bulk_in(0x82, &mut buf, Duration::from_millis(10).into()),
            Err(Error::Timeout { .. })
        ));
    }

    #[test]
    fn reap_delivers_in_completion_order() {
        let (engine, port) = engine(Mode::Immediate);
        let a = engine.submit(0x81, vec![0; 32]).unwrap();
        let b = engine.submit(0x81, vec![0; 16]).unwrap();

        let first = engine.reap(Duration::from_secs(1).into()).unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.data.len(), 32);
        let second = engine.reap(Duration::from_secs(1).into()).unwrap();
        assert_eq!(second.id, b);
        assert!(second.data.iter().all(|&x| x == 0xA5));
        assert!(matches!(
            engine.reap(Timeout::Default),
            Err(Error::InvalidArgument(_))
        ));
        drop(port);
    }

    #[test]
    fn discarded_urb_is_reaped_as_cancelled() {
        let (engine, _port) = engine(Mode::Hold);
        let id = engine.submit(0x81, vec![0; 32]).unwrap();
        engine.discard(id).unwrap();
        let r = engine.reap(Duration::from_secs(1).into()).unwrap();
        assert_eq!(r.id, id);
        assert_eq!(r.status, Some(TransferStatus::Cancelled));
        assert!(r.data.is_empty());
        // Discarding something already reaped is not an error.
        engine.discard(id).unwrap();
    }

    #[test]
    fn out_of_order_completion_is_fatal() {
        let (engine, port) = engine(Mode::Hold);
        engine.submit(0x81, vec![0; 8]).unwrap();
        engine.submit(0x81, vec![0; 8]).unwrap();
        port.finish_held(1);
        let _newer = engine.reap(Duration::from_secs(1).into()).unwrap();
        port.finish_held(0);
        let err = engine.reap(Duration::from_secs(1).into()).unwrap_err();
        assert!(matches!(err, Error::FatalConsistency(_)));

        let mut buf = [0u8; 4];
        assert!(matches!(
            engine.control(&setup_in(4), &mut buf, Timeout::Default),
            Err(Error::FatalConsistency(_))
        ));
        engine.close().unwrap();
    }

    #[test]
    fn disconnect_fails_waiters() {
        let (engine, port) = engine(Mode::Hold);
        let engine = Arc::new(engine);
        let reader = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                engine.bulk_in(0x81, &mut buf, Timeout::Infinite)
            })
        };
        while port.held() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        port.push(PortEvent::Disconnected);
        assert!(matches!(
            reader.join().unwrap(),
            Err(Error::Transfer {
                status: TransferStatus::Disconnected,
                ..
            })
        ));
    }

    #[test]
    fn rejects_unknown_pipes() {
        let (engine, _port) = engine(Mode::Immediate);
        let mut buf = [0u8; 4];
        assert!(matches!(
            engine.bulk_in(0x02, &mut buf, Timeout::Default),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.bulk_out(0x81, &buf, Timeout::Default),
            Err(Error::InvalidArgument(_))
        ));
    }
}
