//! Partition and media-image workflows built on [`BootRom`].
//!
//! These drive the bootloader's `download` / `upload` commands and move the
//! image in 64 KiB media blocks, one block index per block.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::rom::BootRom;

/// Bytes per media block.
pub const MEDIA_BLOCK: usize = 0x10000;

/// Bytes of an image inspected for format detection.
const PROBE_LEN: usize = 0x2000;

/// Android sparse image magic, little-endian at offset 0.
const SPARSE_MAGIC: u32 = 0xED26_FF3A;

/// Most command text the bootloader accepts in one frame.
const MAX_COMMAND: usize = 63;

/// Where a download lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Target {
    /// Persistent storage (eMMC, NAND).
    Store,
    /// RAM.
    Mem,
}

/// Image encoding the bootloader should expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ImageFormat {
    /// Raw bytes.
    Normal,
    /// Android sparse image.
    Sparse,
    /// UBIFS volume image.
    Ubifs,
}

impl Target {
    /// Keyword used on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Mem => "mem",
        }
    }
}

impl ImageFormat {
    /// Keyword used on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Sparse => "sparse",
            Self::Ubifs => "ubifs",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "store" => Ok(Self::Store),
            "mem" => Ok(Self::Mem),
            other => Err(Error::InvalidArgument(format!(
                "unknown target {other:?} (expected store or mem)"
            ))),
        }
    }
}

impl FromStr for ImageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(Self::Normal),
            "sparse" => Ok(Self::Sparse),
            "ubifs" => Ok(Self::Ubifs),
            other => Err(Error::InvalidArgument(format!(
                "unknown image format {other:?}"
            ))),
        }
    }
}

/// True when `head` starts with a valid Android sparse header.
pub fn is_sparse(head: &[u8]) -> bool {
    if head.len() < 0x1C {
        return false;
    }
    let magic = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    let major = u16::from_le_bytes([head[4], head[5]]);
    // file header 28 bytes, chunk header 12 bytes
    magic == SPARSE_MAGIC && major == 1 && head[8..12] == [0x28, 0, 0x12, 0]
}

/// Sniffs the image format, leaving the reader at the start.
pub fn detect_format<R: Read + Seek>(image: &mut R) -> io::Result<ImageFormat> {
    let start = image.stream_position()?;
    let mut head = Vec::with_capacity(PROBE_LEN);
    image.by_ref().take(PROBE_LEN as u64).read_to_end(&mut head)?;
    image.seek(SeekFrom::Start(start))?;
    Ok(if is_sparse(&head) {
        info!("sparse image detected");
        ImageFormat::Sparse
    } else {
        ImageFormat::Normal
    })
}

/// Transfer progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Progress {
    /// Bytes moved so far.
    pub done: u64,
    /// Bytes in the whole transfer.
    pub total: u64,
}

/// Parameters of an image download.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Download {
    /// Storage or RAM.
    pub target: Target,
    /// Partition name, or a load address for [`Target::Mem`].
    pub partition: String,
    /// Image encoding.
    pub format: ImageFormat,
    /// Contents of a verify file, sent as `verify <contents>` at the end.
    pub verify: Option<String>,
}

impl Download {
    /// A download of `format` data to `partition` on `target`.
    pub fn new(target: Target, partition: impl Into<String>, format: ImageFormat) -> Self {
        Self {
            target,
            partition: partition.into(),
            format,
            verify: None,
        }
    }

    /// Sends `verify <contents>` once the image is in.
    #[must_use]
    pub fn verify(mut self, contents: Option<String>) -> Self {
        self.verify = contents;
        self
    }

    /// `download` command announcing `size` bytes.
    fn command(&self, size: u64) -> String {
        format!(
            "download {} {} {} {size:#x}",
            self.target, self.partition, self.format
        )
    }
}

/// `verify` command text, cut to what fits in one frame.
fn verify_command(contents: &str) -> String {
    let mut cmd = format!("verify {}", contents.trim_end_matches(['\r', '\n']));
    if cmd.len() > MAX_COMMAND {
        let mut end = MAX_COMMAND;
        while !cmd.is_char_boundary(end) {
            end -= 1;
        }
        cmd.truncate(end);
    }
    cmd
}

/// Fills `buf` as far as `reader` allows.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match reader.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

/// Converts a block count to a wire block index.
fn block_index(i: usize) -> Result<u32> {
    u32::try_from(i).map_err(|_| Error::InvalidArgument(format!("block index {i} too large")))
}

impl BootRom {
    /// Downloads `size` bytes of `image` through the bootloader.
    pub fn mwrite<R: Read>(
        &self,
        image: &mut R,
        size: u64,
        download: &Download,
        mut progress: impl FnMut(Progress),
    ) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument("image is empty".into()));
        }
        let status = self.tpl_command(&download.command(size))?;
        if !status.starts_with("success") {
            return Err(Error::Protocol {
                op: "download",
                reply: status,
            });
        }

        let mut buf = vec![0u8; MEDIA_BLOCK];
        let mut done = 0u64;
        let mut block = 0usize;
        while done < size {
            let want = usize::try_from(size - done).map_or(MEDIA_BLOCK, |r| r.min(MEDIA_BLOCK));
            let n = fill(image, &mut buf[..want])?;
            if n < want {
                return Err(Error::SizeMismatch {
                    op: "mwrite",
                    expected: usize::try_from(size).unwrap_or(usize::MAX),
                    actual: usize::try_from(done).unwrap_or(usize::MAX) + n,
                });
            }
            self.write_media(block_index(block)?, &buf[..n])?;
            done += n as u64;
            block += 1;
            progress(Progress { done, total: size });
        }
        info!(partition = %download.partition, size, blocks = block, "image downloaded");

        self.bulk_command("download get_status")?;
        if let Some(contents) = &download.verify {
            self.bulk_command(&verify_command(contents))?;
        }
        Ok(())
    }

    /// Flashes `image` to a storage partition, detecting sparse images
    /// when `format` is `None`.
    pub fn partition<R: Read + Seek>(
        &self,
        name: &str,
        image: &mut R,
        format: Option<ImageFormat>,
        verify: Option<String>,
        progress: impl FnMut(Progress),
    ) -> Result<()> {
        let format = match format {
            Some(f) => f,
            None => detect_format(image)?,
        };
        let start = image.stream_position()?;
        let size = image.seek(SeekFrom::End(0))? - start;
        image.seek(SeekFrom::Start(start))?;
        let download = Download::new(Target::Store, name, format).verify(verify);
        self.mwrite(image, size, &download, progress)
    }

    /// Uploads `size` bytes of a partition (or RAM) into `out`.
    pub fn mread<W: Write>(
        &self,
        target: Target,
        partition: &str,
        size: u64,
        out: &mut W,
        mut progress: impl FnMut(Progress),
    ) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument("read size is zero".into()));
        }
        self.bulk_command(&format!("upload {target} {partition} normal {size:#x}"))?;
        let mut done = 0u64;
        let mut block = 0usize;
        while done < size {
            let want = usize::try_from(size - done).map_or(MEDIA_BLOCK, |r| r.min(MEDIA_BLOCK));
            let data = self.read_media(block_index(block)?, want)?;
            out.write_all(&data)?;
            done += data.len() as u64;
            block += 1;
            progress(Progress { done, total: size });
        }
        out.flush()?;
        info!(partition, size, "upload complete");
        Ok(())
    }
}
