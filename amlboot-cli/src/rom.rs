//! Device commands: scan, identify, chipid, chipinfo, password.

use std::path::Path;

use amlboot::{BootRom, Identity, PasswordState};
use amlboot_proto::{IDENTIFY_LEN, MAX_CONTROL_PAYLOAD};
use anyhow::{Context, Result, bail};
use clap::builder::TypedValueParser;

use crate::{OutputFormat, hex_view};

/// Arguments for `amlboot identify`.
#[derive(clap::Args)]
pub struct IdentifyArgs {
    /// Reply bytes to request (4 to 8).
    #[arg(long, default_value_t = IDENTIFY_LEN, value_parser = clap::value_parser!(u8).range(4..=8).map(usize::from))]
    pub len: usize,

    /// Output format.
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

pub fn scan(rom: &BootRom, format: OutputFormat) -> Result<()> {
    let found = rom.scan()?;
    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }
    if found.is_empty() {
        println!("No devices.");
        return Ok(());
    }
    println!("{:<6} {:<24} {:<10} {:<6} {:<6}", "INDEX", "PATH", "ID", "IN", "OUT");
    for (i, dev) in found.iter().enumerate() {
        println!(
            "{:<6} {:<24} {:<10} {:<#6x} {:<#6x}",
            i,
            dev.path.display(),
            format!("{:04x}:{:04x}", dev.vendor_id, dev.product_id),
            dev.pipes.bulk_in,
            dev.pipes.bulk_out,
        );
    }
    Ok(())
}

pub fn identify(rom: &BootRom, args: &IdentifyArgs) -> Result<()> {
    let ident = rom.identify(args.len)?;
    if matches!(args.format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&ident)?);
        return Ok(());
    }
    print!("{}", describe(&ident));
    Ok(())
}

/// Table form of an identify reply.
fn describe(ident: &Identity) -> String {
    let mut out = format!(
        "firmware: {}\nversion:  {:#06x}\nstage:    {}\n",
        ident.firmware(),
        ident.version(),
        ident.stage()
    );
    match ident.password() {
        Some(PasswordState::Required) => out.push_str("password: required\n"),
        Some(PasswordState::Accepted) => out.push_str("password: accepted\n"),
        _ => {}
    }
    if let Some([lo, hi]) = ident.page_map() {
        out.push_str(&format!("pages:    {lo:#04x} {hi:#04x}\n"));
    }
    out
}

pub fn chip_id(rom: &BootRom) -> Result<()> {
    let id = rom.chip_id()?;
    let hex: String = id.iter().map(|b| format!("{b:02x}")).collect();
    println!("{hex}");
    Ok(())
}

pub fn chip_info(rom: &BootRom, page: u16) -> Result<()> {
    print!("{}", hex_view(&rom.chip_info(page)?, 0));
    Ok(())
}

pub fn password(rom: &BootRom, file: &Path) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    if data.len() > MAX_CONTROL_PAYLOAD {
        bail!(
            "password is {} bytes; the ROM takes at most {MAX_CONTROL_PAYLOAD}",
            data.len()
        );
    }
    rom.password(&data)?;
    println!("password sent");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn describes_secured_rom() {
        let ident = Identity::parse(&[2, 4, 0, 0, 1, 0, 0x10, 0x02]).unwrap();
        let text = describe(&ident);
        assert!(text.contains("firmware: 2-4-0-0-1-0-16-2"));
        assert!(text.contains("version:  0x0204"));
        assert!(text.contains("password: required"));
        assert!(text.contains("pages:    0x10 0x02"));
    }

    #[test]
    fn describes_plain_rom() {
        let ident = Identity::parse(&[0, 9, 0, 8]).unwrap();
        let text = describe(&ident);
        assert!(text.contains("stage:    8"));
        assert!(!text.contains("password"));
    }
}
