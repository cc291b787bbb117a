//! Media commands: mwrite, mread, partition.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use amlboot::{BootRom, Download, ImageFormat, Progress, Target};
use anyhow::{Context, Result};

use crate::{hex_view, human_size, parse_u64};

/// Arguments for `amlboot mwrite`.
#[derive(clap::Args)]
pub struct MwriteArgs {
    /// Image file.
    pub file: PathBuf,

    /// `store` or `mem`.
    #[arg(value_parser = parse_target)]
    pub target: Target,

    /// Partition name, or load address for `mem`.
    pub partition: String,

    /// `normal`, `sparse` or `ubifs`.
    #[arg(value_parser = parse_format)]
    pub format: ImageFormat,

    /// File whose contents are sent as `verify <contents>` afterwards.
    pub verify: Option<PathBuf>,
}

/// Arguments for `amlboot mread`.
#[derive(clap::Args)]
pub struct MreadArgs {
    /// `store` or `mem`.
    #[arg(value_parser = parse_target)]
    pub target: Target,

    /// Partition name, or start address for `mem`.
    pub partition: String,

    /// Bytes to upload.
    #[arg(value_parser = parse_u64)]
    pub size: u64,

    /// Output file; prints a hex view when omitted.
    pub file: Option<PathBuf>,
}

/// Arguments for `amlboot partition`.
#[derive(clap::Args)]
pub struct PartitionArgs {
    /// Partition name.
    pub partition: String,

    /// Image file.
    pub file: PathBuf,

    /// Image format; detected from the file when omitted.
    #[arg(value_parser = parse_format)]
    pub format: Option<ImageFormat>,

    /// File whose contents are sent as `verify <contents>` afterwards.
    pub verify: Option<PathBuf>,
}

fn parse_target(s: &str) -> Result<Target, String> {
    s.parse().map_err(|e: amlboot::Error| e.to_string())
}

fn parse_format(s: &str) -> Result<ImageFormat, String> {
    s.parse().map_err(|e: amlboot::Error| e.to_string())
}

fn open(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("opening {}", path.display()))
}

fn read_verify(path: Option<&Path>) -> Result<Option<String>> {
    path.map(|p| std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display())))
        .transpose()
}

/// Progress line on stderr, redrawn in place.
fn show(p: Progress) {
    let pct = p.done.saturating_mul(100) / p.total.max(1);
    eprint!("\r[{pct:3}%] {} / {}", human_size(p.done), human_size(p.total));
    if p.done >= p.total {
        eprintln!();
    }
}

pub fn mwrite(rom: &BootRom, args: &MwriteArgs) -> Result<()> {
    let mut file = open(&args.file)?;
    let size = file.metadata()?.len();
    let download = Download::new(args.target, args.partition.as_str(), args.format)
        .verify(read_verify(args.verify.as_deref())?);
    rom.mwrite(&mut file, size, &download, show)?;
    println!("mwrite success");
    Ok(())
}

pub fn partition(rom: &BootRom, args: &PartitionArgs) -> Result<()> {
    let mut file = open(&args.file)?;
    let verify = read_verify(args.verify.as_deref())?;
    rom.partition(&args.partition, &mut file, args.format, verify, show)?;
    println!("partition {} written", args.partition);
    Ok(())
}

pub fn mread(rom: &BootRom, args: &MreadArgs) -> Result<()> {
    match &args.file {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            let mut out = BufWriter::new(file);
            rom.mread(args.target, &args.partition, args.size, &mut out, show)?;
            out.flush()?;
        }
        None => {
            let mut data = Vec::new();
            rom.mread(args.target, &args.partition, args.size, &mut data, |_| {})?;
            io::stdout().write_all(hex_view(&data, 0).as_bytes())?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn verify_file_is_read_as_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verify");
        std::fs::write(&path, "sha1sum 0123\n").unwrap();
        assert_eq!(
            read_verify(Some(&path)).unwrap().as_deref(),
            Some("sha1sum 0123\n")
        );
        assert!(read_verify(None).unwrap().is_none());
        assert!(read_verify(Some(&dir.path().join("missing"))).is_err());
    }

    #[test]
    fn keywords_parse() {
        assert_eq!(parse_target("mem").unwrap(), Target::Mem);
        assert_eq!(parse_format("sparse").unwrap(), ImageFormat::Sparse);
        assert!(parse_format("ext4").is_err());
    }
}
