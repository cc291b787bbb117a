//! Tunables for discovery, timeouts, and transfer policy.
//!
//! Stored as JSON. Every field has a default, so a partial file (or no
//! file at all) is valid.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which transport model backs a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Backend {
    /// URBs queued to the OS and completed by a per-session worker thread.
    #[default]
    Queued,
    /// One synchronous ioctl per transfer, no worker.
    Direct,
}

/// Busy-poll budget for a status reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Pause between status reads, in milliseconds.
    pub interval_ms: u64,
    /// Total time allowed for the device to leave the busy state, in milliseconds.
    pub budget_ms: u64,
}

impl PollConfig {
    /// Pause between status reads.
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Total time allowed.
    pub const fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

/// Session and transfer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// USB vendor ID to match.
    pub vendor_id: u16,
    /// USB product ID to match.
    pub product_id: u16,
    /// Transport model.
    pub backend: Backend,
    /// Control transfer timeout for protocol commands, in milliseconds.
    pub control_timeout_ms: u64,
    /// Bulk-in timeout, in milliseconds.
    pub bulk_in_timeout_ms: u64,
    /// Bulk-out timeout, in milliseconds.
    pub bulk_out_timeout_ms: u64,
    /// How long `close` waits for cancelled URBs before force-unlinking them.
    pub close_drain_ms: u64,
    /// Chunk cap for large-memory transfers.
    pub large_mem_chunk: usize,
    /// Chunk cap for media transfers.
    pub media_chunk: usize,
    /// Whole-buffer attempts per chunked transfer.
    pub attempts: u32,
    /// Consecutive zero-byte chunks tolerated before giving up.
    pub max_zero_chunks: u32,
    /// Attempts per media block (command + data + status).
    pub media_attempts: u32,
    /// Status poll after a media block write.
    pub media_poll: PollConfig,
    /// Status poll after a bulk command.
    pub bulk_cmd_poll: PollConfig,
    /// Pause between the two password sends, in milliseconds.
    pub password_settle_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vendor_id: amlboot_proto::VENDOR_ID,
            product_id: amlboot_proto::PRODUCT_ID,
            backend: Backend::default(),
            control_timeout_ms: 5_000,
            bulk_in_timeout_ms: 90_000,
            bulk_out_timeout_ms: 50_000,
            close_drain_ms: 250,
            large_mem_chunk: 0x1000,
            media_chunk: 0x1_0000,
            attempts: 4,
            max_zero_chunks: 5,
            media_attempts: 3,
            media_poll: PollConfig {
                interval_ms: 500,
                budget_ms: 12 * 60 * 1000,
            },
            bulk_cmd_poll: PollConfig {
                interval_ms: 3_000,
                budget_ms: 20 * 60 * 1000,
            },
            password_settle_ms: 5_000,
        }
    }
}

impl Config {
    /// Loads configuration from a JSON file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Writes configuration to a JSON file.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// `<config dir>/amlboot/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("amlboot").join("config.json"))
    }

    /// Loads `path`, or the default path when it exists, or the defaults.
    pub fn resolve(path: Option<&Path>) -> io::Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }
        match Self::default_path() {
            Some(p) if p.is_file() => Self::load(&p),
            _ => Ok(Self::default()),
        }
    }

    /// Control transfer timeout.
    pub const fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    /// Bulk-in timeout.
    pub const fn bulk_in_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_in_timeout_ms)
    }

    /// Bulk-out timeout.
    pub const fn bulk_out_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_out_timeout_ms)
    }

    /// Close drain bound.
    pub const fn close_drain(&self) -> Duration {
        Duration::from_millis(self.close_drain_ms)
    }

    /// Pause between the two password sends.
    pub const fn password_settle(&self) -> Duration {
        Duration::from_millis(self.password_settle_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "backend": "direct", "attempts": 2 }"#).unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.backend, Backend::Direct);
        assert_eq!(cfg.attempts, 2);
        assert_eq!(cfg.vendor_id, 0x1B8E);
        assert_eq!(cfg.media_poll.interval(), Duration::from_millis(500));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = Config {
            product_id: 0xC004,
            ..Config::default()
        };
        cfg.save(&path).unwrap();
        assert_eq!(Config::resolve(Some(&path)).unwrap(), cfg);
    }

    #[test]
    fn rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ nope").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
