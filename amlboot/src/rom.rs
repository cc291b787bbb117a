//! Boot-ROM client.
//!
//! Every operation opens a fresh [`Session`], does its work and closes the
//! session again, the way the ROM tools always have. Sequence numbers live
//! in a shared [`Sequences`] so they keep rising across those sessions.

use std::sync::Arc;
use std::thread;

use amlboot_proto::{
    BulkChannel, CHIP_ID_LEN, CHIP_INFO_LEN, ChipIdSource, Command, IDENTIFY_LEN, Identity,
    MAX_CONTROL_PAYLOAD,
};
use tracing::{debug, info, warn};

use crate::chunked::{self, ChunkPolicy, Stream};
use crate::config::Config;
use crate::device::{Connector, DeviceId, DeviceInfo, Session};
use crate::error::{Error, Result};
use crate::poll::{StatusPoll, reply_text};
use crate::seq::Sequences;
use crate::transport::Transport;

/// Status reads after a TPL command before giving up.
const TPL_STATUS_TRIES: usize = 5;

/// High-level operations against one boot-ROM device.
#[derive(Debug)]
pub struct BootRom {
    /// Opens sessions.
    connector: Arc<dyn Connector>,
    /// Which device.
    device: DeviceId,
    /// Timeouts and transfer policy.
    config: Config,
    /// Process-wide sequence counters.
    seqs: Arc<Sequences>,
}

impl BootRom {
    /// Creates a client. Pass the same `seqs` to every client in the
    /// process.
    pub fn new(
        connector: Arc<dyn Connector>,
        device: DeviceId,
        config: Config,
        seqs: Arc<Sequences>,
    ) -> Self {
        Self {
            connector,
            device,
            config,
            seqs,
        }
    }

    /// Active configuration.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Lists every attached device with this client's IDs.
    pub fn scan(&self) -> Result<Vec<DeviceInfo>> {
        self.connector
            .scan(self.device.vendor_id, self.device.product_id)
    }

    /// Runs `f` inside a scoped session.
    fn with_session<R>(&self, f: impl FnOnce(&dyn Transport) -> Result<R>) -> Result<R> {
        let session = Session::open(&*self.connector, &self.device, &self.config)?;
        let out = f(&*session);
        let closed = session.close();
        match (out, closed) {
            (Ok(v), Ok(())) => Ok(v),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!(error = %close_err, "close after failed operation");
                Err(e)
            }
        }
    }

    /// Sends one command on an open session.
    fn exec(&self, t: &dyn Transport, cmd: Command<'_>) -> Result<Vec<u8>> {
        chunked::exec(t, cmd, self.config.control_timeout())
    }

    /// Reads `len` bytes of memory in 64-byte control transfers.
    pub fn read_mem(&self, addr: u32, len: usize) -> Result<Vec<u8>> {
        self.with_session(|t| self.read_mem_on(t, addr, len))
    }

    /// [`read_mem`](Self::read_mem) on an open session.
    fn read_mem_on(&self, t: &dyn Transport, addr: u32, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let n = (len - out.len()).min(MAX_CONTROL_PAYLOAD);
            let at = offset_addr(addr, out.len())?;
            let piece = self.exec(t, Command::ReadMem { addr: at, len: n })?;
            if piece.len() < n {
                return Err(Error::SizeMismatch {
                    op: "read_mem",
                    expected: len,
                    actual: out.len() + piece.len(),
                });
            }
            out.extend_from_slice(&piece);
        }
        Ok(out)
    }

    /// Writes `data` in 64-byte control transfers.
    pub fn write_mem(&self, addr: u32, data: &[u8]) -> Result<()> {
        self.with_session(|t| {
            for (i, piece) in data.chunks(MAX_CONTROL_PAYLOAD).enumerate() {
                let at = offset_addr(addr, i * MAX_CONTROL_PAYLOAD)?;
                self.exec(t, Command::WriteMem { addr: at, data: piece })?;
            }
            Ok(())
        })
    }

    /// Reads one 32-bit register.
    pub fn read_reg(&self, addr: u32) -> Result<u32> {
        let bytes = self.read_mem(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Writes one 32-bit register.
    pub fn write_reg(&self, addr: u32, value: u32) -> Result<()> {
        self.write_mem(addr, &value.to_le_bytes())
    }

    /// Jumps to `addr`.
    pub fn run(&self, addr: u32) -> Result<()> {
        info!(addr = format_args!("{addr:#x}"), "run");
        self.with_session(|t| self.exec(t, Command::Run { addr }).map(drop))
    }

    /// Identifies the ROM, reading `len` (4 to 8) reply bytes.
    pub fn identify(&self, len: usize) -> Result<Identity> {
        if !(4..=IDENTIFY_LEN).contains(&len) {
            return Err(Error::InvalidArgument(format!(
                "identify length {len} outside 4..={IDENTIFY_LEN}"
            )));
        }
        self.with_session(|t| {
            let reply = self.exec(t, Command::Identify { len })?;
            Identity::parse(&reply).ok_or_else(|| Error::Protocol {
                op: "identify",
                reply: format!("{reply:02x?}"),
            })
        })
    }

    /// Reads the 12-byte chip ID.
    pub fn chip_id(&self) -> Result<[u8; CHIP_ID_LEN]> {
        let ident = self.identify(4)?;
        let Some(source) = ident.chip_id_source() else {
            return Err(Error::Protocol {
                op: "chipid",
                reply: format!(
                    "no chip ID for version {:#05x} at stage {}",
                    ident.version(),
                    ident.stage()
                ),
            });
        };
        debug!(?source, "chip ID location");
        let raw = match source {
            ChipIdSource::InfoPage { page, offset } => {
                let info = self.chip_info(page)?;
                info.get(offset..offset + CHIP_ID_LEN)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| Error::SizeMismatch {
                        op: "chipid",
                        expected: offset + CHIP_ID_LEN,
                        actual: info.len(),
                    })?
            }
            ChipIdSource::Memory(addr) => self.read_mem(addr, CHIP_ID_LEN)?,
            _ => {
                return Err(Error::Protocol {
                    op: "chipid",
                    reply: format!("unsupported chip ID source {source:?}"),
                });
            }
        };
        let mut id = [0u8; CHIP_ID_LEN];
        id.copy_from_slice(&raw[..CHIP_ID_LEN]);
        Ok(id)
    }

    /// Reads a 64-byte chip-info page.
    pub fn chip_info(&self, page: u16) -> Result<Vec<u8>> {
        self.with_session(|t| {
            let reply = self.exec(
                t,
                Command::ChipInfo {
                    page,
                    len: CHIP_INFO_LEN,
                },
            )?;
            if reply.len() < CHIP_INFO_LEN {
                return Err(Error::SizeMismatch {
                    op: "chipinfo",
                    expected: CHIP_INFO_LEN,
                    actual: reply.len(),
                });
            }
            Ok(reply)
        })
    }

    /// Sends the unlock password twice, pausing in between.
    pub fn password(&self, password: &[u8]) -> Result<()> {
        self.with_session(|t| {
            self.exec(t, Command::Password { data: password })?;
            thread::sleep(self.config.password_settle());
            self.exec(t, Command::Password { data: password })?;
            Ok(())
        })
    }

    /// Sends a TPL command and returns the status reply.
    pub fn tpl_command(&self, text: &str) -> Result<String> {
        self.with_session(|t| {
            self.exec(t, Command::TplCommand { text })?;
            let mut last = None;
            for attempt in 1..=TPL_STATUS_TRIES {
                match self.exec(t, Command::TplStatus) {
                    Ok(reply) => return Ok(reply_text(&reply)),
                    Err(e) if e.is_transient() => {
                        debug!(attempt, error = %e, "TPL status not ready");
                        last = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(last.unwrap_or(Error::Protocol {
                op: "tplstat",
                reply: String::new(),
            }))
        })
    }

    /// Reads the last TPL status reply.
    pub fn tpl_status(&self) -> Result<String> {
        self.with_session(|t| self.exec(t, Command::TplStatus).map(|r| reply_text(&r)))
    }

    /// Sends a bootloader bulk command and waits for it to finish.
    pub fn bulk_command(&self, text: &str) -> Result<String> {
        self.with_session(|t| self.bulk_command_on(t, text))
    }

    /// [`bulk_command`](Self::bulk_command) on an open session.
    fn bulk_command_on(&self, t: &dyn Transport, text: &str) -> Result<String> {
        self.exec(
            t,
            Command::BulkCommand {
                text,
                channel: BulkChannel::Primary,
            },
        )?;
        let reply = StatusPoll::bulk_command(&self.config).run(t)?;
        info!(command = text, %reply, "bulk command done");
        Ok(reply)
    }

    /// Writes `data` to `addr` with the chunked large-memory protocol.
    pub fn write_large_mem(&self, addr: u32, data: &[u8]) -> Result<()> {
        let policy = ChunkPolicy::new(Stream::LargeMem, &self.config);
        self.with_session(|t| {
            chunked::write(t, &self.seqs.write, Stream::LargeMem, addr, data, &policy)
        })
    }

    /// Reads `len` bytes from `addr` with the chunked large-memory protocol.
    pub fn read_large_mem(&self, addr: u32, len: usize) -> Result<Vec<u8>> {
        let policy = ChunkPolicy::new(Stream::LargeMem, &self.config);
        self.with_session(|t| {
            let mut buf = vec![0u8; len];
            chunked::read(t, &self.seqs.read, Stream::LargeMem, addr, &mut buf, &policy)?;
            Ok(buf)
        })
    }

    /// Writes one media block and waits for the device to commit it.
    pub fn write_media(&self, block: u32, data: &[u8]) -> Result<()> {
        let policy = ChunkPolicy::new(Stream::Media, &self.config);
        let poll = StatusPoll::media(&self.config);
        let attempts = self.config.media_attempts.max(1);
        self.with_session(|t| {
            let mut attempt = 1;
            loop {
                let res = chunked::write(t, &self.seqs.write, Stream::Media, block, data, &policy)
                    .and_then(|()| poll.run(t));
                match res {
                    Ok(_) => return Ok(()),
                    Err(e) if e.is_terminal() => return Err(e),
                    Err(e) if attempt >= attempts => return Err(e),
                    Err(e) => {
                        warn!(block, attempt, error = %e, "media block failed; retrying");
                        attempt += 1;
                    }
                }
            }
        })
    }

    /// Reads one media block of `len` bytes. A zero length returns at once
    /// without touching the device.
    pub fn read_media(&self, block: u32, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let policy = ChunkPolicy::new(Stream::Media, &self.config);
        self.with_session(|t| {
            let mut buf = vec![0u8; len];
            chunked::read(t, &self.seqs.read, Stream::Media, block, &mut buf, &policy)?;
            Ok(buf)
        })
    }

    /// Resets the device's USB port.
    pub fn reset(&self) -> Result<()> {
        self.with_session(|t| t.reset())
    }
}

/// `base + offset`, rejecting address wrap-around.
fn offset_addr(base: u32, offset: usize) -> Result<u32> {
    u32::try_from(offset)
        .ok()
        .and_then(|o| base.checked_add(o))
        .ok_or_else(|| Error::InvalidArgument(format!("{base:#x} + {offset:#x} overflows")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use amlboot_proto::{TPL_STATUS_LEN, request};

    use super::*;
    use crate::error::TransferStatus;
    use crate::fake::{Chunk, FakeDevice, boot_rom, stream_byte};

    fn rom(dev: &Arc<FakeDevice>) -> BootRom {
        boot_rom(dev, &Arc::new(Sequences::new())).0
    }

    #[test]
    fn every_operation_opens_and_closes_a_session() {
        let dev = FakeDevice::new();
        let (rom, conn) = boot_rom(&dev, &Arc::new(Sequences::new()));
        rom.run(0xD900_0000).unwrap();
        rom.write_reg(0xC110_0000, 7).unwrap();
        assert_eq!(conn.opens(), 2);
        assert_eq!(dev.closes(), 2);
    }

    #[test]
    fn scan_uses_configured_ids() {
        let dev = FakeDevice::new();
        let found = rom(&dev).scan().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].vendor_id, 0x1B8E);
        assert!(dev.controls().is_empty());
    }

    #[test]
    fn read_mem_splits_into_64_byte_pieces() {
        let dev = FakeDevice::new();
        let data = rom(&dev).read_mem(0x1000, 150).unwrap();
        let reads = dev.requests(request::READ_MEM);
        let lens: Vec<u16> = reads.iter().map(|(s, _)| s.length).collect();
        assert_eq!(lens, [64, 64, 22]);
        assert_eq!(reads[1].0.index, 0x1040);
        assert!(data.iter().enumerate().all(|(i, &b)| b == stream_byte(0x1000 + i)));
    }

    #[test]
    fn short_control_read_is_size_mismatch() {
        let dev = FakeDevice::new();
        dev.reply(request::READ_MEM, &[1, 2]);
        assert!(matches!(
            rom(&dev).read_mem(0, 4),
            Err(Error::SizeMismatch {
                expected: 4,
                actual: 2,
                ..
            })
        ));
    }

    #[test]
    fn write_mem_advances_address_per_piece() {
        let dev = FakeDevice::new();
        rom(&dev).write_mem(0x2000, &[0xAA; 100]).unwrap();
        let writes = dev.requests(request::WRITE_MEM);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].0.index, 0x2040);
        assert_eq!(writes[1].1.len(), 36);
    }

    #[test]
    fn write_mem_rejects_address_wrap() {
        let dev = FakeDevice::new();
        rom(&dev).write_mem(0xFFFF_FFC0, &[0xAA; 64]).unwrap();
        assert!(matches!(
            rom(&dev).write_mem(0xFFFF_FFC0, &[0xAA; 65]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn register_roundtrip_is_little_endian() {
        let dev = FakeDevice::new();
        dev.reply(request::READ_MEM, &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(rom(&dev).read_reg(0x10).unwrap(), 0x1234_5678);
        rom(&dev).write_reg(0x10, 0xAABB_CCDD).unwrap();
        let writes = dev.requests(request::WRITE_MEM);
        assert_eq!(writes[0].1, [0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn identify_parses_and_rejects_zero_firmware() {
        let dev = FakeDevice::new();
        dev.reply(request::IDENTIFY_HOST, &[0, 9, 0, 0, 1, 1, 0, 0]);
        let id = rom(&dev).identify(8).unwrap();
        assert_eq!(id.firmware(), "0-9-0-0-1-1-0-0");

        dev.reply(request::IDENTIFY_HOST, &[0, 0, 0, 0]);
        assert!(matches!(
            rom(&dev).identify(4),
            Err(Error::Protocol { op: "identify", .. })
        ));
        assert!(matches!(rom(&dev).identify(9), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn chip_id_from_memory() {
        let dev = FakeDevice::new();
        dev.reply(request::IDENTIFY_HOST, &[2, 4, 0, 0]);
        let id = rom(&dev).chip_id().unwrap();
        let reads = dev.requests(request::READ_MEM);
        assert_eq!(reads[0].0.value, 0xD900);
        assert_eq!(reads[0].0.index, 0xD400);
        assert_eq!(id[0], stream_byte(0xD900_D400));
    }

    #[test]
    fn chip_id_from_info_page() {
        let dev = FakeDevice::new();
        dev.reply(request::IDENTIFY_HOST, &[2, 3, 0, 8]);
        let page: Vec<u8> = (0..64).collect();
        dev.reply(request::GET_CHIP_INFO, &page);
        let id = rom(&dev).chip_id().unwrap();
        assert_eq!(id.to_vec(), (20..32).collect::<Vec<u8>>());
        assert_eq!(dev.requests(request::GET_CHIP_INFO)[0].0.index, 1);
    }

    #[test]
    fn chip_id_rejects_unknown_stage() {
        let dev = FakeDevice::new();
        dev.reply(request::IDENTIFY_HOST, &[2, 4, 0, 1]);
        assert!(matches!(
            rom(&dev).chip_id(),
            Err(Error::Protocol { op: "chipid", .. })
        ));
    }

    #[test]
    fn password_is_sent_twice() {
        let dev = FakeDevice::new();
        rom(&dev).password(b"secret").unwrap();
        let sends = dev.requests(request::PASSWORD);
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[1].1, b"secret");
    }

    #[test]
    fn tpl_command_returns_status_text() {
        let dev = FakeDevice::new();
        let mut status = vec![0u8; TPL_STATUS_LEN];
        status[..7].copy_from_slice(b"success");
        dev.reply(request::TPL_STAT, &status);
        let reply = rom(&dev).tpl_command("download store boot normal 0x100").unwrap();
        assert_eq!(reply, "success");
        let sent = &dev.requests(request::TPL_CMD)[0];
        assert_eq!(sent.0.index, 1);
        assert!(sent.1.starts_with(b"download store"));
    }

    #[test]
    fn bulk_command_polls_until_success() {
        let dev = FakeDevice::new();
        dev.bulk_reply(b"Continue:34");
        dev.bulk_reply(b"success");
        assert_eq!(rom(&dev).bulk_command("download get_status").unwrap(), "success");
    }

    #[test]
    fn sequences_rise_across_sessions() {
        let dev = FakeDevice::new();
        let seqs = Arc::new(Sequences::new());
        let (rom, _) = boot_rom(&dev, &seqs);
        rom.write_large_mem(0, &[1; 5000]).unwrap();
        rom.write_large_mem(0, &[2; 100]).unwrap();
        let (other, _) = boot_rom(&dev, &seqs);
        other.write_large_mem(0, &[3; 10]).unwrap();

        let seqs_seen: Vec<u32> = dev
            .headers(request::WRITE_LARGE_MEM)
            .iter()
            .map(|h| h.seq)
            .collect();
        assert_eq!(seqs_seen, [0, 2, 3]);
        assert_eq!(seqs.write.current(), 4);
        assert_eq!(seqs.read.current(), 0);
        assert_eq!(dev.closes(), 3);
    }

    #[test]
    fn media_read_of_zero_bytes_never_touches_the_device() {
        let dev = FakeDevice::new();
        let (rom, conn) = boot_rom(&dev, &Arc::new(Sequences::new()));
        assert!(rom.read_media(0, 0).unwrap().is_empty());
        assert_eq!(conn.opens(), 0);
        assert!(dev.controls().is_empty());
    }

    #[test]
    fn media_read_returns_streamed_bytes() {
        let dev = FakeDevice::new();
        let data = rom(&dev).read_media(5, 70_000).unwrap();
        assert_eq!(data.len(), 70_000);
        assert_eq!(dev.bulk_lens(), [65_536, 4_464]);
        assert_eq!(dev.headers(request::READ_MEDIA)[0].addr, 5);
    }

    #[test]
    fn media_write_retries_after_bad_status() {
        let dev = FakeDevice::new();
        dev.bulk_reply(b"not OK!!");
        dev.bulk_reply(b"OK!!");
        rom(&dev).write_media(9, &[0x5A; 1000]).unwrap();
        assert_eq!(dev.requests(request::WRITE_MEDIA).len(), 2);
    }

    #[test]
    fn media_write_gives_up_after_three_attempts() {
        let dev = FakeDevice::new();
        dev.script([Chunk::Fail(TransferStatus::Stall); 3]);
        assert!(matches!(
            rom(&dev).write_media(0, &[0; 10]),
            Err(Error::Transfer {
                status: TransferStatus::Stall,
                ..
            })
        ));
        assert_eq!(dev.requests(request::WRITE_MEDIA).len(), 3);
    }

    #[test]
    fn media_write_stops_when_the_device_vanishes() {
        let dev = FakeDevice::new();
        dev.fail_starts(TransferStatus::Disconnected, 1);
        assert!(matches!(
            rom(&dev).write_media(0, &[0; 10]),
            Err(Error::Transfer {
                status: TransferStatus::Disconnected,
                ..
            })
        ));
        assert_eq!(dev.requests(request::WRITE_MEDIA).len(), 1);
    }
}
