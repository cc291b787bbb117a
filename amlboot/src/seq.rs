//! Per-direction transfer sequence numbers.
//!
//! The ROM expects sequence numbers to keep rising for the whole life of
//! the host process, across every session opened against it. One
//! [`Sequences`] value is created up front and shared by reference with
//! everything that opens sessions.

use std::sync::atomic::{AtomicU32, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Sequence(AtomicU32);

impl Sequence {
    /// Value the next chunk will be tagged with.
    pub fn current(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Consumes one sequence number and returns it.
    pub fn advance(&self) -> u32 {
        self.0.fetch_add(1, Ordering::AcqRel)
    }
}

/// Process-wide counters for the two large-transfer streams.
#[derive(Debug, Default)]
pub struct Sequences {
    /// Host-to-device stream.
    pub write: Sequence,
    /// Device-to-host stream.
    pub read: Sequence,
}

impl Sequences {
    /// Creates counters starting at zero.
    pub fn new() -> Self {
        Self::default()
    }
}
