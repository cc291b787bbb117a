//! CLI for flashing Amlogic SoCs over the USB boot ROM.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod mem;
mod media;
mod rom;

use std::path::PathBuf;
use std::sync::Arc;

use amlboot::{BootRom, Config, DeviceId, Sequences};
use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "amlboot", version, about = "Amlogic USB boot-ROM flashing tool")]
struct Cli {
    /// Which matching device to use, counting from 0.
    #[arg(short = 'd', long, global = true, default_value_t = 0)]
    device: usize,

    /// Configuration file (default: <config dir>/amlboot/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging; repeat for more detail. `AMLBOOT_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List attached boot-ROM devices.
    Scan {
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Identify the ROM: firmware version, stage, password state.
    Identify(rom::IdentifyArgs),

    /// Print the 12-byte chip ID.
    Chipid,

    /// Dump a 64-byte chip-info page.
    Chipinfo {
        /// Page index.
        #[arg(default_value_t = 0, value_parser = parse_u16)]
        page: u16,
    },

    /// Unlock a secured ROM with a password file.
    Password {
        /// File holding the password (at most 64 bytes).
        file: PathBuf,
    },

    /// Jump to an address.
    Run {
        /// Entry address.
        #[arg(value_parser = parse_u32)]
        addr: u32,
    },

    /// Load a file into memory with bulk transfers.
    Write(mem::WriteArgs),

    /// Load a file into memory and jump to it.
    Boot(mem::WriteArgs),

    /// Load a file into memory with 64-byte control transfers.
    Cwr(mem::WriteArgs),

    /// Show memory through control transfers.
    Read(mem::ReadArgs),

    /// Read memory with bulk transfers into a file or a hex view.
    Dump(mem::DumpArgs),

    /// Write a 32-bit register.
    Wreg {
        /// Register address.
        #[arg(value_parser = parse_u32)]
        addr: u32,
        /// Value to write.
        #[arg(value_parser = parse_u32)]
        value: u32,
    },

    /// Read a 32-bit register.
    Rreg {
        /// Register address.
        #[arg(value_parser = parse_u32)]
        addr: u32,
    },

    /// Send a TPL command and print its status.
    Tplcmd {
        /// Command text.
        text: String,
    },

    /// Print the last TPL status.
    Tplstat,

    /// Send a bootloader command and wait for it to finish.
    Bulkcmd {
        /// Command text.
        text: String,
    },

    /// Download an image to a partition or to memory.
    Mwrite(media::MwriteArgs),

    /// Upload a partition or memory range.
    Mread(media::MreadArgs),

    /// Flash an image to a storage partition.
    Partition(media::PartitionArgs),

    /// Reset the device's USB port.
    Reset,

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for scan/identify.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = cli.dispatch() {
        eprintln!("amlboot: {e:#}");
        std::process::exit(1);
    }
}

/// Installs the fmt subscriber: `AMLBOOT_LOG`, else `-v` level, else warn.
fn init_logging(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("AMLBOOT_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    /// Client for the selected device.
    fn rom(&self) -> Result<BootRom> {
        let config = Config::resolve(self.config.as_deref()).context("loading configuration")?;
        debug!(device = self.device, backend = ?config.backend, "configuration loaded");
        let connector = amlboot::system_connector()?;
        Ok(BootRom::new(
            Arc::from(connector),
            DeviceId::from_config(&config, self.device),
            config,
            Arc::new(Sequences::new()),
        ))
    }

    fn dispatch(self) -> Result<()> {
        if let Command::Completion { shell } = self.command {
            clap_complete::generate(shell, &mut Self::command(), "amlboot", &mut std::io::stdout());
            return Ok(());
        }
        let rom = self.rom()?;
        match self.command {
            Command::Scan { format } => rom::scan(&rom, format),
            Command::Identify(args) => rom::identify(&rom, &args),
            Command::Chipid => rom::chip_id(&rom),
            Command::Chipinfo { page } => rom::chip_info(&rom, page),
            Command::Password { file } => rom::password(&rom, &file),
            Command::Run { addr } => {
                rom.run(addr)?;
                Ok(())
            }
            Command::Write(args) => mem::write(&rom, &args),
            Command::Boot(args) => mem::boot(&rom, &args),
            Command::Cwr(args) => mem::control_write(&rom, &args),
            Command::Read(args) => mem::read(&rom, &args),
            Command::Dump(args) => mem::dump(&rom, &args),
            Command::Wreg { addr, value } => {
                rom.write_reg(addr, value)?;
                Ok(())
            }
            Command::Rreg { addr } => {
                println!("{addr:#010x}: {:#010x}", rom.read_reg(addr)?);
                Ok(())
            }
            Command::Tplcmd { text } => {
                println!("{}", rom.tpl_command(&text)?);
                Ok(())
            }
            Command::Tplstat => {
                println!("{}", rom.tpl_status()?);
                Ok(())
            }
            Command::Bulkcmd { text } => {
                println!("{}", rom.bulk_command(&text)?);
                Ok(())
            }
            Command::Mwrite(args) => media::mwrite(&rom, &args),
            Command::Mread(args) => media::mread(&rom, &args),
            Command::Partition(args) => media::partition(&rom, &args),
            Command::Reset => {
                rom.reset()?;
                Ok(())
            }
            Command::Completion { .. } => Ok(()),
        }
    }
}

/// Parses a decimal or `0x`-prefixed hex number.
pub(crate) fn parse_u64(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

/// [`parse_u64`] limited to 32 bits.
pub(crate) fn parse_u32(s: &str) -> Result<u32, String> {
    let v = parse_u64(s)?;
    u32::try_from(v).map_err(|_| format!("{s:?} does not fit in 32 bits"))
}

/// [`parse_u64`] limited to 16 bits.
fn parse_u16(s: &str) -> Result<u16, String> {
    let v = parse_u64(s)?;
    u16::try_from(v).map_err(|_| format!("{s:?} does not fit in 16 bits"))
}

/// [`parse_u64`] as a byte count.
pub(crate) fn parse_len(s: &str) -> Result<usize, String> {
    let v = parse_u64(s)?;
    usize::try_from(v).map_err(|_| format!("{s:?} is too large"))
}

/// Formats bytes into a human-readable size string.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}

/// Classic 16-bytes-per-line hex dump, addresses starting at `base`.
pub(crate) fn hex_view(data: &[u8], base: u64) -> String {
    let mut out = String::new();
    for (i, line) in data.chunks(16).enumerate() {
        let addr = base + (i as u64) * 16;
        let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = line
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        out.push_str(&format!("{addr:08x}  {:<47}  |{ascii}|\n", hex.join(" ")));
    }
    out
}
