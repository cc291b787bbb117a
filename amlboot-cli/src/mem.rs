//! Memory commands: write, boot, cwr, read, dump.

use std::path::{Path, PathBuf};

use amlboot::BootRom;
use anyhow::{Context, Result};

use crate::{hex_view, human_size, parse_len, parse_u32};

/// Arguments for `amlboot write`, `boot` and `cwr`.
#[derive(clap::Args)]
pub struct WriteArgs {
    /// File to load.
    pub file: PathBuf,

    /// Load address.
    #[arg(value_parser = parse_u32)]
    pub addr: u32,
}

/// Arguments for `amlboot read`.
#[derive(clap::Args)]
pub struct ReadArgs {
    /// Start address.
    #[arg(value_parser = parse_u32)]
    pub addr: u32,

    /// Bytes to read.
    #[arg(value_parser = parse_len)]
    pub len: usize,
}

/// Arguments for `amlboot dump`.
#[derive(clap::Args)]
pub struct DumpArgs {
    /// Start address.
    #[arg(value_parser = parse_u32)]
    pub addr: u32,

    /// Bytes to read.
    #[arg(value_parser = parse_len)]
    pub len: usize,

    /// Output file; prints a hex view when omitted.
    pub file: Option<PathBuf>,
}

fn load(file: &Path) -> Result<Vec<u8>> {
    std::fs::read(file).with_context(|| format!("reading {}", file.display()))
}

pub fn write(rom: &BootRom, args: &WriteArgs) -> Result<()> {
    let data = load(&args.file)?;
    rom.write_large_mem(args.addr, &data)?;
    println!("wrote {} at {:#x}", human_size(data.len() as u64), args.addr);
    Ok(())
}

pub fn boot(rom: &BootRom, args: &WriteArgs) -> Result<()> {
    write(rom, args)?;
    rom.run(args.addr)?;
    println!("running at {:#x}", args.addr);
    Ok(())
}

pub fn control_write(rom: &BootRom, args: &WriteArgs) -> Result<()> {
    let data = load(&args.file)?;
    rom.write_mem(args.addr, &data)?;
    println!("wrote {} at {:#x}", human_size(data.len() as u64), args.addr);
    Ok(())
}

pub fn read(rom: &BootRom, args: &ReadArgs) -> Result<()> {
    let data = rom.read_mem(args.addr, args.len)?;
    print!("{}", hex_view(&data, u64::from(args.addr)));
    Ok(())
}

pub fn dump(rom: &BootRom, args: &DumpArgs) -> Result<()> {
    let data = rom.read_large_mem(args.addr, args.len)?;
    match &args.file {
        Some(path) => {
            std::fs::write(path, &data).with_context(|| format!("writing {}", path.display()))?;
            println!("saved {} to {}", human_size(data.len() as u64), path.display());
        }
        None => print!("{}", hex_view(&data, u64::from(args.addr))),
    }
    Ok(())
}
