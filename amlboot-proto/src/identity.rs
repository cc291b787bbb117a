//! Decoding of the identify-host reply.

use serde::Serialize;

/// Length of a chip ID.
pub const CHIP_ID_LEN: usize = 12;

/// ROM stage codes that can report a chip ID.
const CHIP_ID_STAGES: [u8; 2] = [0, 8];

/// Password state reported by a secured ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum PasswordState {
    /// A password is required and has been accepted.
    Accepted,
    /// A password is required and has not been accepted yet.
    Required,
}

/// Parsed identify reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// Reply bytes as received.
    raw: Vec<u8>,
    /// `(raw[0] << 8) | raw[1]`.
    version: u16,
    /// Boot stage the ROM reports in `raw[3]`.
    stage: u8,
    /// Password state, when the ROM reports one.
    password: Option<PasswordState>,
    /// Supported chip-info page map, when reported.
    page_map: Option<[u8; 2]>,
}

impl Identity {
    /// Parses an identify reply of 4 to 8 bytes.
    ///
    /// Returns `None` when the firmware version bytes are all zero, which
    /// the ROM reports when it is in a broken state.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let head = raw.get(..4)?;
        if head.iter().all(|&b| b == 0) {
            return None;
        }
        let stage = raw[3];
        let password = match (stage, raw.get(4), raw.get(5)) {
            (0, Some(1), Some(1)) => Some(PasswordState::Accepted),
            (0, Some(1), Some(_)) => Some(PasswordState::Required),
            _ => None,
        };
        let page_map = match (stage, raw.get(6), raw.get(7)) {
            (0, Some(&lo), Some(&hi)) if hi != 0 => Some([lo, hi]),
            _ => None,
        };
        Some(Self {
            raw: raw.to_vec(),
            version: u16::from_be_bytes([raw[0], raw[1]]),
            stage,
            password,
            page_map,
        })
    }

    /// Reply bytes as received.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Chip protocol version.
    pub const fn version(&self) -> u16 {
        self.version
    }

    /// Boot stage code.
    pub const fn stage(&self) -> u8 {
        self.stage
    }

    /// Password state, if the ROM is secured.
    pub const fn password(&self) -> Option<PasswordState> {
        self.password
    }

    /// Supported chip-info page map.
    pub const fn page_map(&self) -> Option<[u8; 2]> {
        self.page_map
    }

    /// Firmware version in the dashed decimal form the ROM tools print.
    pub fn firmware(&self) -> String {
        self.raw
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Where this chip keeps its ID, if it exposes one.
    pub fn chip_id_source(&self) -> Option<ChipIdSource> {
        if !CHIP_ID_STAGES.contains(&self.stage) {
            return None;
        }
        ChipIdSource::for_version(self.version)
    }
}

/// Location of the chip ID for a given chip version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChipIdSource {
    /// Inside a chip-info page.
    InfoPage {
        /// Page index.
        page: u16,
        /// Byte offset of the ID inside the page.
        offset: usize,
    },
    /// At a fixed memory address.
    Memory(u32),
}

impl ChipIdSource {
    /// Looks up the ID location for a chip version.
    pub const fn for_version(version: u16) -> Option<Self> {
        match version {
            0x200 | 0x201 => Some(Self::Memory(0xD901_3C24)),
            0x202 => Some(Self::Memory(0xC801_3C24)),
            0x203 => Some(Self::InfoPage { page: 1, offset: 20 }),
            0x204 => Some(Self::Memory(0xD900_D400)),
            0x205 | 0x300 => Some(Self::Memory(0xFFFC_D400)),
            _ => None,
        }
    }
}
