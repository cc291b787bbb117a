//! Vendor command frames for the boot-ROM control endpoint.
//!
//! Every command is a vendor-class control transfer. Multi-byte fields are
//! little-endian at fixed offsets and must match the ROM bit for bit.

use std::time::Duration;

use crate::error::FrameError;

/// Amlogic USB vendor ID.
pub const VENDOR_ID: u16 = 0x1B8E;
/// Product ID exposed by the boot ROM in USB download mode.
pub const PRODUCT_ID: u16 = 0xC003;

/// `bmRequestType` for host-to-device vendor requests.
pub const VENDOR_OUT: u8 = 0x40;
/// `bmRequestType` for device-to-host vendor requests.
pub const VENDOR_IN: u8 = 0xC0;

/// Largest data stage the ROM accepts on the control pipe.
pub const MAX_CONTROL_PAYLOAD: usize = 64;
/// Size of a TPL / bulk command frame.
pub const TEXT_FRAME_LEN: usize = 68;
/// Size of a large-memory / media transfer header block.
pub const HEADER_BLOCK_LEN: usize = 128;
/// Largest bulk-chunk-size the ROM advertises in `wValue`.
pub const MAX_HEADER_CHUNK: u32 = 4096;
/// Size of an identify reply.
pub const IDENTIFY_LEN: usize = 8;
/// Size of a chip-info page.
pub const CHIP_INFO_LEN: usize = 64;
/// Size of a TPL status reply.
pub const TPL_STATUS_LEN: usize = 64;

/// Control timeout used when a command has no reason to wait longer.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for commands that trigger device-side storage work.
const EXTENDED_TIMEOUT: Duration = Duration::from_secs(60);

/// Vendor `bRequest` codes understood by the boot ROM.
pub mod request {
    /// Write up to 64 bytes of memory.
    pub const WRITE_MEM: u8 = 0x01;
    /// Read up to 64 bytes of memory.
    pub const READ_MEM: u8 = 0x02;
    /// Jump to an address.
    pub const RUN_IN_ADDR: u8 = 0x05;
    /// Announce a large-memory bulk write.
    pub const WRITE_LARGE_MEM: u8 = 0x11;
    /// Announce a large-memory bulk read.
    pub const READ_LARGE_MEM: u8 = 0x12;
    /// Query ROM version and state.
    pub const IDENTIFY_HOST: u8 = 0x20;
    /// Send a TPL text command.
    pub const TPL_CMD: u8 = 0x30;
    /// Read the last TPL result.
    pub const TPL_STAT: u8 = 0x31;
    /// Announce a media block write.
    pub const WRITE_MEDIA: u8 = 0x32;
    /// Announce a media block read.
    pub const READ_MEDIA: u8 = 0x33;
    /// Send a bootloader bulk command.
    pub const BULK_CMD: u8 = 0x34;
    /// Alternate bulk command channel; shares its code with the password request.
    pub const BULK_CMD_ALT: u8 = 0x35;
    /// Unlock a secured ROM.
    pub const PASSWORD: u8 = 0x35;
    /// Read a chip-info page.
    pub const GET_CHIP_INFO: u8 = 0x40;
}

/// Transfer direction of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Direction {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

/// A USB control setup packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setup {
    /// `bmRequestType`.
    pub request_type: u8,
    /// `bRequest`.
    pub request: u8,
    /// `wValue`.
    pub value: u16,
    /// `wIndex`.
    pub index: u16,
    /// `wLength`.
    pub length: u16,
}

impl Setup {
    /// Size of the serialized setup packet.
    pub const LEN: usize = 8;

    /// Data stage direction, from bit 7 of `bmRequestType`.
    pub const fn direction(&self) -> Direction {
        if self.request_type & 0x80 == 0 {
            Direction::Out
        } else {
            Direction::In
        }
    }

    /// Serializes the packet in USB wire order.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0] = self.request_type;
        out[1] = self.request;
        out[2..4].copy_from_slice(&self.value.to_le_bytes());
        out[4..6].copy_from_slice(&self.index.to_le_bytes());
        out[6..8].copy_from_slice(&self.length.to_le_bytes());
        out
    }
}

/// Fields shared by large-memory and media transfer headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferHeader {
    /// Device address (large-memory) or block index (media).
    pub addr: u32,
    /// Total bytes of the logical transfer.
    pub size: u32,
    /// Checksum of the whole payload.
    pub checksum: u32,
    /// Sequence number snapshot.
    pub seq: u32,
    /// Bytes per bulk chunk.
    pub chunk: u32,
}

impl TransferHeader {
    /// Lays the header out in its 128-byte block form.
    pub fn to_block(&self) -> [u8; HEADER_BLOCK_LEN] {
        let mut block = [0u8; HEADER_BLOCK_LEN];
        write_le32(&mut block, 0, self.addr);
        write_le32(&mut block, 4, self.size);
        write_le32(&mut block, 8, self.checksum);
        write_le32(&mut block, 12, self.seq);
        write_le32(&mut block, 64, self.chunk);
        block
    }

    /// Reads the leading fields back from a wire payload.
    ///
    /// The chunk size does not travel in the payload; pass the `wValue` it
    /// was advertised in.
    pub fn from_wire(payload: &[u8], chunk: u16) -> Option<Self> {
        if payload.len() < 16 {
            return None;
        }
        Some(Self {
            addr: read_le32(payload, 0),
            size: read_le32(payload, 4),
            checksum: read_le32(payload, 8),
            seq: read_le32(payload, 12),
            chunk: u32::from(chunk),
        })
    }

    /// `wValue`/`wIndex` pair: the chunk size clamped to what the ROM
    /// accepts, and the chunk count it implies.
    #[allow(clippy::cast_possible_truncation)]
    fn chunk_geometry(&self) -> (u16, u16) {
        let value = match self.chunk {
            0 => MAX_HEADER_CHUNK,
            c if c > MAX_HEADER_CHUNK => MAX_HEADER_CHUNK,
            c => c,
        };
        let count = self.size.div_ceil(value);
        (value as u16, count as u16)
    }
}

/// Which bulk-command request code to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum BulkChannel {
    /// Regular bootloader command channel.
    #[default]
    Primary,
    /// Alternate channel.
    Alternate,
}

/// A vendor command with its validated payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Command<'a> {
    /// Read `len` (≤ 64) bytes of memory.
    ReadMem {
        /// Source address.
        addr: u32,
        /// Bytes to read.
        len: usize,
    },
    /// Write up to 64 bytes of memory.
    WriteMem {
        /// Destination address.
        addr: u32,
        /// Bytes to write.
        data: &'a [u8],
    },
    /// Jump to `addr`.
    Run {
        /// Entry point.
        addr: u32,
    },
    /// Read `len` (≤ 8) identify bytes.
    Identify {
        /// Reply length.
        len: usize,
    },
    /// TPL text command.
    TplCommand {
        /// Command text, at most 63 bytes.
        text: &'a str,
    },
    /// Read the TPL status reply.
    TplStatus,
    /// Large-memory bulk write announcement.
    WriteLargeMem(TransferHeader),
    /// Large-memory bulk read announcement.
    ReadLargeMem(TransferHeader),
    /// Media block write announcement.
    WriteMedia(TransferHeader),
    /// Media block read announcement.
    ReadMedia(TransferHeader),
    /// Bootloader bulk command.
    BulkCommand {
        /// Command text, at most 63 bytes.
        text: &'a str,
        /// Request code to use.
        channel: BulkChannel,
    },
    /// Password unlock, at most 64 bytes.
    Password {
        /// Password bytes.
        data: &'a [u8],
    },
    /// Read a chip-info page.
    ChipInfo {
        /// Page index.
        page: u16,
        /// Bytes to read (≤ 64).
        len: usize,
    },
}

/// An encoded control transfer ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Setup packet; `length` matches `data.len()`.
    pub setup: Setup,
    /// OUT payload, or a zeroed buffer of the expected IN length.
    pub data: Vec<u8>,
    /// Timeout suited to this command.
    pub timeout: Duration,
}

impl Command<'_> {
    /// Encodes the command into a control frame.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Result<Frame, FrameError> {
        match *self {
            Self::ReadMem { addr, len } => {
                check_len("read length", len, MAX_CONTROL_PAYLOAD)?;
                Ok(frame_in(request::READ_MEM, (addr >> 16) as u16, addr as u16, len))
            }
            Self::WriteMem { addr, data } => {
                check_len("write payload", data.len(), MAX_CONTROL_PAYLOAD)?;
                Ok(frame_out(
                    request::WRITE_MEM,
                    (addr >> 16) as u16,
                    addr as u16,
                    data.to_vec(),
                ))
            }
            Self::Run { addr } => {
                let mut payload = addr.to_le_bytes();
                payload[0] |= 0x10;
                let go = u32::from_le_bytes(payload);
                Ok(frame_out(
                    request::RUN_IN_ADDR,
                    (go >> 16) as u16,
                    go as u16,
                    payload.to_vec(),
                ))
            }
            Self::Identify { len } => {
                check_len("identify length", len, IDENTIFY_LEN)?;
                Ok(frame_in(request::IDENTIFY_HOST, 0, 0, len))
            }
            Self::TplCommand { text } => {
                let block = text_frame(text)?;
                let value = u16::from_le_bytes([block[64], block[65]]);
                let index = u16::from_le_bytes([block[66], block[67]]);
                Ok(frame_out(
                    request::TPL_CMD,
                    value,
                    index,
                    block[..MAX_CONTROL_PAYLOAD].to_vec(),
                ))
            }
            Self::TplStatus => Ok(Frame {
                timeout: EXTENDED_TIMEOUT,
                ..frame_in(request::TPL_STAT, 0, 0, TPL_STATUS_LEN)
            }),
            Self::WriteLargeMem(header) => Ok(header_frame(request::WRITE_LARGE_MEM, &header)),
            Self::ReadLargeMem(header) => Ok(header_frame(request::READ_LARGE_MEM, &header)),
            Self::WriteMedia(header) => {
                let block = header.to_block();
                let mut payload = block[..32].to_vec();
                payload[16..18].copy_from_slice(&239u16.to_le_bytes());
                payload[18..20].copy_from_slice(&256u16.to_le_bytes());
                Ok(Frame {
                    timeout: EXTENDED_TIMEOUT,
                    ..frame_out(request::WRITE_MEDIA, 1, 0xFFFF, payload)
                })
            }
            Self::ReadMedia(header) => Ok(Frame {
                timeout: EXTENDED_TIMEOUT,
                ..header_frame(request::READ_MEDIA, &header)
            }),
            Self::BulkCommand { text, channel } => {
                let block = text_frame(text)?;
                let request = match channel {
                    BulkChannel::Primary => request::BULK_CMD,
                    BulkChannel::Alternate => request::BULK_CMD_ALT,
                };
                Ok(frame_out(request, 0, 2, block[..MAX_CONTROL_PAYLOAD].to_vec()))
            }
            Self::Password { data } => {
                check_len("password", data.len(), MAX_CONTROL_PAYLOAD)?;
                // The ROM sums the bytes as signed chars.
                #[allow(clippy::cast_possible_wrap)]
                let sum = data
                    .iter()
                    .fold(0i32, |acc, &b| acc.wrapping_add(i32::from(b as i8)));
                Ok(frame_out(request::PASSWORD, sum as u16, 0, data.to_vec()))
            }
            Self::ChipInfo { page, len } => {
                check_len("chip info length", len, CHIP_INFO_LEN)?;
                Ok(frame_in(request::GET_CHIP_INFO, 0, page, len))
            }
        }
    }
}

/// Builds the 68-byte text frame: NUL-terminated text, marker at byte 66.
pub fn text_frame(text: &str) -> Result<[u8; TEXT_FRAME_LEN], FrameError> {
    let bytes = text.as_bytes();
    if bytes.contains(&0) {
        return Err(FrameError::InteriorNul);
    }
    check_len("command text", bytes.len(), MAX_CONTROL_PAYLOAD - 1)?;
    let mut block = [0u8; TEXT_FRAME_LEN];
    block[..bytes.len()].copy_from_slice(bytes);
    block[66] = 1;
    Ok(block)
}

/// Frame carrying a transfer header: the first 16 bytes of the block go on
/// the wire, chunk geometry goes in `wValue`/`wIndex`.
fn header_frame(request: u8, header: &TransferHeader) -> Frame {
    let (value, index) = header.chunk_geometry();
    frame_out(request, value, index, header.to_block()[..16].to_vec())
}

/// Host-to-device frame with the default timeout.
#[allow(clippy::cast_possible_truncation)]
fn frame_out(request: u8, value: u16, index: u16, data: Vec<u8>) -> Frame {
    Frame {
        setup: Setup {
            request_type: VENDOR_OUT,
            request,
            value,
            index,
            length: data.len() as u16,
        },
        data,
        timeout: DEFAULT_TIMEOUT,
    }
}

/// Device-to-host frame expecting `len` bytes, with the default timeout.
#[allow(clippy::cast_possible_truncation)]
fn frame_in(request: u8, value: u16, index: u16, len: usize) -> Frame {
    Frame {
        setup: Setup {
            request_type: VENDOR_IN,
            request,
            value,
            index,
            length: len as u16,
        },
        data: vec![0; len],
        timeout: DEFAULT_TIMEOUT,
    }
}

/// Rejects `len > max`.
const fn check_len(what: &'static str, len: usize, max: usize) -> Result<(), FrameError> {
    if len > max {
        Err(FrameError::TooLong { what, len, max })
    } else {
        Ok(())
    }
}

/// Writes a little-endian u32 at `off`.
#[inline]
fn write_le32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

/// Reads a little-endian u32 at `off`.
#[inline]
fn read_le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}
