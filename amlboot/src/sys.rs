//! Linux usbdevfs FFI.
//!
//! Request codes and structs mirror `include/uapi/linux/usbdevice_fs.h`.
//! Every raw libc call in the crate lives here.

#![allow(unsafe_code, clippy::missing_docs_in_private_items)]

use std::ffi::c_void;
use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use amlboot_proto::Setup;

/// `_IOC` encoding from `asm-generic/ioctl.h`.
const fn ioc(dir: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | ((b'U' as libc::c_ulong) << 8) | nr
}

/// `_IOC_NONE`.
const NONE: libc::c_ulong = 0;
/// `_IOC_WRITE`.
const WRITE: libc::c_ulong = 1;
/// `_IOC_READ`.
const READ: libc::c_ulong = 2;

/// `USBDEVFS_CONTROL`: `_IOWR('U', 0, struct usbdevfs_ctrltransfer)`.
const USBDEVFS_CONTROL: libc::c_ulong = ioc(READ | WRITE, 0, size_of::<CtrlTransfer>());
/// `USBDEVFS_BULK`: `_IOWR('U', 2, struct usbdevfs_bulktransfer)`.
const USBDEVFS_BULK: libc::c_ulong = ioc(READ | WRITE, 2, size_of::<BulkTransfer>());
/// `USBDEVFS_SUBMITURB`: `_IOR('U', 10, struct usbdevfs_urb)`.
const USBDEVFS_SUBMITURB: libc::c_ulong = ioc(READ, 10, size_of::<RawUrb>());
/// `USBDEVFS_DISCARDURB`: `_IO('U', 11)`.
const USBDEVFS_DISCARDURB: libc::c_ulong = ioc(NONE, 11, 0);
/// `USBDEVFS_REAPURBNDELAY`: `_IOW('U', 13, void *)`.
const USBDEVFS_REAPURBNDELAY: libc::c_ulong = ioc(WRITE, 13, size_of::<*mut c_void>());
/// `USBDEVFS_CLAIMINTERFACE`: `_IOR('U', 15, unsigned int)`.
const USBDEVFS_CLAIMINTERFACE: libc::c_ulong = ioc(READ, 15, size_of::<libc::c_uint>());
/// `USBDEVFS_RELEASEINTERFACE`: `_IOR('U', 16, unsigned int)`.
const USBDEVFS_RELEASEINTERFACE: libc::c_ulong = ioc(READ, 16, size_of::<libc::c_uint>());
/// `USBDEVFS_IOCTL`: `_IOWR('U', 18, struct usbdevfs_ioctl)`.
const USBDEVFS_IOCTL: libc::c_ulong = ioc(READ | WRITE, 18, size_of::<IfaceIoctl>());
/// `USBDEVFS_RESET`: `_IO('U', 20)`.
const USBDEVFS_RESET: libc::c_ulong = ioc(NONE, 20, 0);
/// `USBDEVFS_DISCONNECT`: `_IO('U', 22)`.
const USBDEVFS_DISCONNECT: libc::c_ulong = ioc(NONE, 22, 0);
/// `USBDEVFS_DISCONNECT_CLAIM`: `_IOR('U', 27, struct usbdevfs_disconnect_claim)`.
const USBDEVFS_DISCONNECT_CLAIM: libc::c_ulong = ioc(READ, 27, size_of::<DisconnectClaim>());

/// `USBDEVFS_URB_TYPE_CONTROL`.
const URB_TYPE_CONTROL: u8 = 2;
/// `USBDEVFS_URB_TYPE_BULK`.
const URB_TYPE_BULK: u8 = 3;
/// `USBDEVFS_DISCONNECT_CLAIM_EXCEPT_DRIVER`.
const DISCONNECT_CLAIM_EXCEPT_DRIVER: u32 = 0x02;

/// `struct usbdevfs_ctrltransfer`.
#[repr(C)]
struct CtrlTransfer {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    timeout: u32,
    data: *mut c_void,
}

/// `struct usbdevfs_bulktransfer`.
#[repr(C)]
struct BulkTransfer {
    ep: libc::c_uint,
    len: libc::c_uint,
    timeout: libc::c_uint,
    data: *mut c_void,
}

/// `struct usbdevfs_disconnect_claim`.
#[repr(C)]
struct DisconnectClaim {
    interface: libc::c_uint,
    flags: libc::c_uint,
    driver: [libc::c_char; 256],
}

/// `struct usbdevfs_ioctl`.
#[repr(C)]
struct IfaceIoctl {
    ifno: libc::c_int,
    ioctl_code: libc::c_int,
    data: *mut c_void,
}

/// `struct usbdevfs_urb`, without the trailing isochronous descriptors.
#[repr(C)]
#[derive(Debug)]
pub struct RawUrb {
    typ: u8,
    endpoint: u8,
    status: libc::c_int,
    flags: libc::c_uint,
    buffer: *mut c_void,
    buffer_length: libc::c_int,
    actual_length: libc::c_int,
    start_frame: libc::c_int,
    number_of_packets: libc::c_int,
    error_count: libc::c_int,
    signr: libc::c_uint,
    usercontext: *mut c_void,
}

// SAFETY: the raw pointers are only handed to the kernel; the owner keeps
// the buffer alive for as long as the URB is in flight.
unsafe impl Send for RawUrb {}

impl RawUrb {
    /// Describes a transfer on `endpoint` (0 for control) over `buf`.
    /// Control buffers must start with the setup packet.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn new(endpoint: u8, buf: &mut [u8], token: u64) -> Self {
        Self {
            typ: if endpoint == 0 {
                URB_TYPE_CONTROL
            } else {
                URB_TYPE_BULK
            },
            endpoint,
            status: 0,
            flags: 0,
            buffer: buf.as_mut_ptr().cast(),
            buffer_length: buf.len() as libc::c_int,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            signr: 0,
            usercontext: token as usize as *mut c_void,
        }
    }

    /// Token passed to [`RawUrb::new`].
    pub fn token(&self) -> u64 {
        self.usercontext as usize as u64
    }

    /// Data bytes transferred, excluding any setup packet.
    #[allow(clippy::cast_sign_loss)]
    pub const fn actual(&self) -> usize {
        if self.actual_length < 0 {
            0
        } else {
            self.actual_length as usize
        }
    }

    /// Completion errno, if the URB failed.
    pub const fn errno(&self) -> Option<i32> {
        if self.status < 0 {
            Some(-self.status)
        } else {
            None
        }
    }
}

/// Runs an ioctl that takes a pointer argument.
fn ioctl<T>(fd: BorrowedFd<'_>, request: libc::c_ulong, arg: *mut T) -> io::Result<libc::c_int> {
    // SAFETY: callers pass a request code matching the layout of `*arg`,
    // and `arg` points to memory valid for the duration of the call.
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request, arg) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Synchronous control transfer. `timeout_ms` of 0 waits forever.
pub fn control(
    fd: BorrowedFd<'_>,
    setup: &Setup,
    data: &mut [u8],
    timeout_ms: u32,
) -> io::Result<usize> {
    let mut xfer = CtrlTransfer {
        request_type: setup.request_type,
        request: setup.request,
        value: setup.value,
        index: setup.index,
        length: setup.length,
        timeout: timeout_ms,
        data: data.as_mut_ptr().cast(),
    };
    let n = ioctl(fd, USBDEVFS_CONTROL, &raw mut xfer)?;
    Ok(usize::try_from(n).unwrap_or(0))
}

/// Synchronous bulk transfer over `len` bytes at `data`.
#[allow(clippy::cast_possible_truncation)]
fn bulk(
    fd: BorrowedFd<'_>,
    ep: u8,
    data: *mut u8,
    len: usize,
    timeout_ms: u32,
) -> io::Result<usize> {
    let mut xfer = BulkTransfer {
        ep: libc::c_uint::from(ep),
        len: len as libc::c_uint,
        timeout: timeout_ms,
        data: data.cast(),
    };
    let n = ioctl(fd, USBDEVFS_BULK, &raw mut xfer)?;
    Ok(usize::try_from(n).unwrap_or(0))
}

/// Synchronous bulk read.
pub fn bulk_in(fd: BorrowedFd<'_>, ep: u8, buf: &mut [u8], timeout_ms: u32) -> io::Result<usize> {
    bulk(fd, ep, buf.as_mut_ptr(), buf.len(), timeout_ms)
}

/// Synchronous bulk write. The kernel only reads from `data`.
pub fn bulk_out(fd: BorrowedFd<'_>, ep: u8, data: &[u8], timeout_ms: u32) -> io::Result<usize> {
    bulk(fd, ep, data.as_ptr().cast_mut(), data.len(), timeout_ms)
}

/// Queues an URB.
///
/// # Safety
///
/// `urb` and the buffer it describes must stay valid and unmoved until the
/// URB is reaped or the file descriptor is closed.
pub unsafe fn submit_urb(fd: BorrowedFd<'_>, urb: *mut RawUrb) -> io::Result<()> {
    ioctl(fd, USBDEVFS_SUBMITURB, urb).map(drop)
}

/// Cancels a queued URB. The kernel uses the pointer as a lookup key only.
pub fn discard_urb(fd: BorrowedFd<'_>, urb: *mut RawUrb) -> io::Result<()> {
    ioctl(fd, USBDEVFS_DISCARDURB, urb).map(drop)
}

/// Takes one completed URB without blocking. `WouldBlock` if none is ready.
pub fn reap_urb_nonblock(fd: BorrowedFd<'_>) -> io::Result<*mut RawUrb> {
    let mut out: *mut RawUrb = std::ptr::null_mut();
    ioctl(fd, USBDEVFS_REAPURBNDELAY, &raw mut out)?;
    Ok(out)
}

/// Claims `iface`, detaching any kernel driver bound to it.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn claim_interface(fd: BorrowedFd<'_>, iface: u8) -> io::Result<()> {
    let mut claim = DisconnectClaim {
        interface: libc::c_uint::from(iface),
        flags: DISCONNECT_CLAIM_EXCEPT_DRIVER,
        driver: [0; 256],
    };
    for (dst, src) in claim.driver.iter_mut().zip(b"usbfs") {
        *dst = *src as libc::c_char;
    }
    match ioctl(fd, USBDEVFS_DISCONNECT_CLAIM, &raw mut claim) {
        Ok(_) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENOTTY) => {
            // Kernels before 3.16: detach then claim.
            let mut cmd = IfaceIoctl {
                ifno: libc::c_int::from(iface),
                ioctl_code: USBDEVFS_DISCONNECT as libc::c_int,
                data: std::ptr::null_mut(),
            };
            match ioctl(fd, USBDEVFS_IOCTL, &raw mut cmd) {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENODATA) => {}
                Err(e) => return Err(e),
            }
            let mut n = libc::c_uint::from(iface);
            ioctl(fd, USBDEVFS_CLAIMINTERFACE, &raw mut n).map(drop)
        }
        Err(e) => Err(e),
    }
}

/// Releases a claimed interface.
pub fn release_interface(fd: BorrowedFd<'_>, iface: u8) -> io::Result<()> {
    let mut n = libc::c_uint::from(iface);
    ioctl(fd, USBDEVFS_RELEASEINTERFACE, &raw mut n).map(drop)
}

/// Resets the device's upstream port.
pub fn reset(fd: BorrowedFd<'_>) -> io::Result<()> {
    ioctl::<c_void>(fd, USBDEVFS_RESET, std::ptr::null_mut()).map(drop)
}

/// Creates a non-blocking close-on-exec pipe, returning `(read, write)`.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [0; 2];

    // SAFETY: pipe2() is a standard call; fds is a valid 2-element array.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: both FDs are valid after a successful pipe2() call.
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((read, write))
}

/// Writes one byte to a pipe, ignoring a full pipe.
pub fn poke(fd: BorrowedFd<'_>) -> io::Result<()> {
    let byte = 1u8;
    // SAFETY: writes one byte from a valid stack location.
    let ret = unsafe { libc::write(fd.as_raw_fd(), (&raw const byte).cast(), 1) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err);
        }
    }
    Ok(())
}
