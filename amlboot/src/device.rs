//! Device discovery and scoped sessions.
//!
//! A [`Connector`] finds the n-th device matching a vendor/product pair and
//! opens a [`Transport`] on it. [`Session`] wraps that transport and closes
//! it on every exit path.

use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;

use serde::Serialize;
use tracing::warn;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::transport::{PipeSet, Transport};

/// Which device to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    /// USB vendor ID.
    pub vendor_id: u16,
    /// USB product ID.
    pub product_id: u16,
    /// Zero-based index among matching devices.
    pub index: usize,
}

impl DeviceId {
    /// The `index`-th device with the IDs from `config`.
    pub const fn from_config(config: &Config, index: usize) -> Self {
        Self {
            vendor_id: config.vendor_id,
            product_id: config.product_id,
            index,
        }
    }
}

/// A device found by [`Connector::scan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Device node.
    pub path: PathBuf,
    /// Bus number.
    pub bus: u16,
    /// Device address on the bus.
    pub address: u16,
    /// USB vendor ID.
    pub vendor_id: u16,
    /// USB product ID.
    pub product_id: u16,
    /// Interface that will be claimed.
    pub interface: u8,
    /// Bulk endpoints of that interface.
    pub pipes: PipeSet,
}

/// Finds and opens devices.
pub trait Connector: Send + Sync + fmt::Debug {
    /// Lists every device matching the IDs, in a stable order.
    fn scan(&self, vendor_id: u16, product_id: u16) -> Result<Vec<DeviceInfo>>;

    /// Opens the device selected by `id`.
    fn connect(&self, id: &DeviceId, config: &Config) -> Result<Box<dyn Transport>>;
}

/// Picks the `id.index`-th entry of a scan.
pub(crate) fn select(found: Vec<DeviceInfo>, id: &DeviceId) -> Result<DeviceInfo> {
    found
        .into_iter()
        .nth(id.index)
        .ok_or(Error::DeviceNotFound {
            vendor_id: id.vendor_id,
            product_id: id.product_id,
            index: id.index,
        })
}

/// The connector for this platform.
pub fn system_connector() -> Result<Box<dyn Connector>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::UsbfsConnector::default()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "no USB backend for this platform",
        )))
    }
}

/// An open transport that is closed when dropped.
#[derive(Debug)]
pub struct Session {
    /// The transport.
    inner: Box<dyn Transport>,
    /// Set once closed explicitly.
    closed: bool,
}

impl Session {
    /// Opens the device selected by `id`.
    pub fn open(connector: &dyn Connector, id: &DeviceId, config: &Config) -> Result<Self> {
        connector.connect(id, config).map(Self::new)
    }

    /// Wraps an already open transport.
    pub fn new(inner: Box<dyn Transport>) -> Self {
        Self {
            inner,
            closed: false,
        }
    }

    /// Closes the session, reporting any error.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.inner.close()
    }
}

impl Deref for Session {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        match self.inner.close() {
            Ok(()) | Err(Error::InvalidHandle) => {}
            Err(e) => warn!(error = %e, "error closing session"),
        }
    }
}

/// Parsed device and configuration descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Descriptors {
    /// `idVendor`.
    pub vendor_id: u16,
    /// `idProduct`.
    pub product_id: u16,
    /// First interface of the first configuration.
    pub interface: u8,
    /// Its bulk endpoints, defaulting to 0x81/0x02.
    pub pipes: PipeSet,
}

/// `bDescriptorType` values.
const DT_CONFIG: u8 = 2;
/// Interface descriptor.
const DT_INTERFACE: u8 = 4;
/// Endpoint descriptor.
const DT_ENDPOINT: u8 = 5;

/// Parses the descriptor blob a usbfs node returns on read: the device
/// descriptor followed by configuration descriptors.
pub(crate) fn parse_descriptors(raw: &[u8]) -> Option<Descriptors> {
    if raw.len() < 18 || raw[1] != 1 {
        return None;
    }
    let vendor_id = u16::from_le_bytes([raw[8], raw[9]]);
    let product_id = u16::from_le_bytes([raw[10], raw[11]]);

    let mut interface = None;
    let mut in_target = false;
    let mut configs = 0;
    let mut ins = Vec::new();
    let mut outs = Vec::new();
    let mut rest = &raw[usize::from(raw[0])..];
    while rest.len() >= 2 {
        let len = usize::from(rest[0]);
        if len < 2 || len > rest.len() {
            break;
        }
        let desc = &rest[..len];
        match desc[1] {
            DT_CONFIG => {
                configs += 1;
                if configs > 1 {
                    break;
                }
            }
            DT_INTERFACE if len >= 4 => {
                let (number, alt) = (desc[2], desc[3]);
                if interface.is_none() && alt == 0 {
                    interface = Some(number);
                }
                in_target = interface == Some(number) && alt == 0;
            }
            DT_ENDPOINT if in_target && len >= 4 && desc[3] & 0x03 == 0x02 => {
                let addr = desc[2];
                if addr & 0x80 == 0 {
                    outs.push(addr);
                } else {
                    ins.push(addr);
                }
            }
            _ => {}
        }
        rest = &rest[len..];
    }

    let defaults = PipeSet::default();
    Some(Descriptors {
        vendor_id,
        product_id,
        interface: interface.unwrap_or(0),
        pipes: PipeSet {
            bulk_in: ins.first().copied().unwrap_or(defaults.bulk_in),
            bulk_out: outs.first().copied().unwrap_or(defaults.bulk_out),
            bulk_in_alt: ins.get(1).copied(),
            bulk_out_alt: outs.get(1).copied(),
        },
    })
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::{self, OpenOptions};
    use std::io;
    use std::path::{Path, PathBuf};

    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};
    use tracing::{debug, info};

    use super::{Connector, DeviceId, DeviceInfo, parse_descriptors, select};
    use crate::config::{Backend, Config};
    use crate::error::Result;
    use crate::transport::Transport;
    use crate::transport::usbfs::{Direct, UsbfsPort};
    use crate::transport::Engine;

    /// Discovers devices under a usbfs tree (`/dev/bus/usb`).
    #[derive(Debug, Clone)]
    pub(crate) struct UsbfsConnector {
        /// Root of the `BBB/DDD` tree.
        root: PathBuf,
    }

    impl Default for UsbfsConnector {
        fn default() -> Self {
            Self {
                root: PathBuf::from("/dev/bus/usb"),
            }
        }
    }

    /// Sorted numeric entries of a directory, as `(number, path)`.
    fn numbered(dir: &Path) -> io::Result<Vec<(u16, PathBuf)>> {
        let mut out: Vec<(u16, PathBuf)> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let n = e.file_name().to_str()?.parse().ok()?;
                Some((n, e.path()))
            })
            .collect();
        out.sort_unstable_by_key(|(n, _)| *n);
        Ok(out)
    }

    impl UsbfsConnector {
        /// A connector rooted somewhere other than `/dev/bus/usb`.
        #[cfg(test)]
        pub fn with_root(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }
    }

    impl Connector for UsbfsConnector {
        fn scan(&self, vendor_id: u16, product_id: u16) -> Result<Vec<DeviceInfo>> {
            let buses = match numbered(&self.root) {
                Ok(b) => b,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut found = Vec::new();
            for (bus, bus_dir) in buses {
                for (address, path) in numbered(&bus_dir)? {
                    let raw = match fs::read(&path) {
                        Ok(raw) => raw,
                        Err(e) => {
                            debug!(path = %path.display(), error = %e, "skipping unreadable node");
                            continue;
                        }
                    };
                    let Some(d) = parse_descriptors(&raw) else {
                        continue;
                    };
                    if d.vendor_id == vendor_id && d.product_id == product_id {
                        found.push(DeviceInfo {
                            path,
                            bus,
                            address,
                            vendor_id,
                            product_id,
                            interface: d.interface,
                            pipes: d.pipes,
                        });
                    }
                }
            }
            Ok(found)
        }

        fn connect(&self, id: &DeviceId, config: &Config) -> Result<Box<dyn Transport>> {
            let info = select(self.scan(id.vendor_id, id.product_id)?, id)?;
            let file = OpenOptions::new().read(true).write(true).open(&info.path)?;
            let dev = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
                if errno == Errno::EWOULDBLOCK {
                    io::Error::new(
                        io::ErrorKind::WouldBlock,
                        format!("{} is in use by another process", info.path.display()),
                    )
                } else {
                    io::Error::from(errno)
                }
            })?;
            let port = UsbfsPort::open(dev, info.interface, info.pipes)?;
            info!(
                path = %info.path.display(),
                backend = ?config.backend,
                bulk_in = info.pipes.bulk_in,
                bulk_out = info.pipes.bulk_out,
                "opened device"
            );
            Ok(match config.backend {
                Backend::Queued => Box::new(Engine::start(port, config.close_drain())?),
                Backend::Direct => Box::new(Direct::new(port, config.close_drain())),
            })
        }
    }

}
