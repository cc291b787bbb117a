//! Wire format for the Amlogic USB boot ROM.
//!
//! Vendor control frames are built by [`Command::encode`]; large transfers
//! announce themselves with a [`TransferHeader`] carrying a payload checksum
//! from [`checksum16`] or [`checksum32`]. Nothing here performs I/O.

mod checksum;
mod error;
mod frame;
mod identity;

pub use checksum::{Checksum32, checksum16, checksum16_raw, checksum32};
pub use error::FrameError;
pub use frame::{
    BulkChannel, CHIP_INFO_LEN, Command, Direction, Frame, HEADER_BLOCK_LEN, IDENTIFY_LEN,
    MAX_CONTROL_PAYLOAD, MAX_HEADER_CHUNK, PRODUCT_ID, Setup, TEXT_FRAME_LEN, TPL_STATUS_LEN,
    TransferHeader, VENDOR_ID, VENDOR_IN, VENDOR_OUT, request, text_frame,
};
pub use identity::{CHIP_ID_LEN, ChipIdSource, Identity, PasswordState};
