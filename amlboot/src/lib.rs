//! USB boot-ROM flashing for Amlogic SoCs.
//!
//! `amlboot` talks to a chip sitting in USB boot mode (`1b8e:c003`): it
//! identifies the ROM, peeks and pokes memory, runs code, and streams
//! firmware and partition images with the ROM's chunked, checksummed
//! transfer protocol.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use amlboot::{BootRom, Config, DeviceId, Sequences};
//!
//! let config = Config::default();
//! let connector = amlboot::system_connector()?;
//! let rom = BootRom::new(
//!     Arc::from(connector),
//!     DeviceId::from_config(&config, 0),
//!     config,
//!     Arc::new(Sequences::new()),
//! );
//!
//! let ident = rom.identify(8)?;
//! println!("firmware {}", ident.firmware());
//! rom.write_large_mem(0xD900_0000, &std::fs::read("u-boot.bin")?)?;
//! rom.run(0xD900_0000)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! The transport layer lives in [`transport`]: a completion-port engine
//! ([`transport::Engine`]) driving asynchronous USB requests, and on Linux
//! a usbdevfs port plus a synchronous backend.

mod chunked;
mod config;
mod device;
mod error;
#[cfg(test)]
mod fake;
mod media;
mod poll;
mod rom;
mod seq;
#[cfg(target_os = "linux")]
mod sys;
pub mod transport;

pub use amlboot_proto::{ChipIdSource, Identity, PasswordState};
pub use config::{Backend, Config, PollConfig};
pub use device::{Connector, DeviceId, DeviceInfo, Session, system_connector};
pub use error::{Error, Result, TransferStatus};
pub use media::{Download, ImageFormat, MEDIA_BLOCK, Progress, Target, detect_format, is_sparse};
pub use rom::BootRom;
pub use seq::{Sequence, Sequences};
