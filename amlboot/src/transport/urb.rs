//! Transfer buffers (URBs), their arena, and the pending/ready queues.
//!
//! URBs live in an [`Arena`] and are referred to by a generation-checked
//! [`UrbId`]. A stale id (its slot freed and reused) never aliases the new
//! occupant. The pending and ready sets are ordered queues of ids; an URB is
//! in at most one of them.

use std::collections::VecDeque;

use crate::error::{Error, Result, TransferStatus};

/// What an URB is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum UrbKind {
    /// Blocking control transfer. The buffer starts with the 8-byte setup
    /// packet.
    Control,
    /// Blocking bulk read.
    BulkIn,
    /// Blocking bulk write.
    BulkOut,
    /// Streaming bulk read, delivered through `reap`.
    Reap,
}

impl UrbKind {
    /// Number of kinds.
    const COUNT: usize = 4;

    /// Dense index for per-kind tables.
    const fn slot(self) -> usize {
        match self {
            Self::Control => 0,
            Self::BulkIn => 1,
            Self::BulkOut => 2,
            Self::Reap => 3,
        }
    }
}

/// Handle to an URB in an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UrbId {
    /// Slot index.
    index: u32,
    /// Slot generation at insertion time.
    generation: u32,
}

impl UrbId {
    /// Packs the id into an opaque 64-bit token for OS user-context fields.
    pub(crate) const fn to_token(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Inverse of [`to_token`](Self::to_token).
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

/// One transfer request.
#[derive(Debug)]
pub(crate) struct Urb {
    /// Purpose.
    pub kind: UrbKind,
    /// Endpoint address (0 for control).
    pub pipe: u8,
    /// Data buffer. Owned by the transport while pending.
    pub data: Vec<u8>,
    /// Bytes requested.
    pub requested: usize,
    /// Bytes actually transferred, valid once completed.
    pub len: usize,
    /// Transaction id, strictly increasing per kind.
    pub xid: u32,
    /// Completion error, if any.
    pub status: Option<TransferStatus>,
    /// Set when the waiter gave up; the completion is dropped on arrival.
    pub abandoned: bool,
}

impl Urb {
    /// Creates an URB that has not been submitted yet.
    pub fn new(kind: UrbKind, pipe: u8, data: Vec<u8>) -> Self {
        let requested = data.len();
        Self {
            kind,
            pipe,
            data,
            requested,
            len: 0,
            xid: 0,
            status: None,
            abandoned: false,
        }
    }
}

/// A slot in the arena.
#[derive(Debug, Default)]
struct Slot {
    /// Bumped every time the slot is vacated.
    generation: u32,
    /// Occupant.
    urb: Option<Urb>,
}

/// Storage for URBs addressed by [`UrbId`].
#[derive(Debug, Default)]
pub(crate) struct Arena {
    /// All slots, occupied or not.
    slots: Vec<Slot>,
    /// Indices of vacant slots.
    free: Vec<u32>,
}

impl Arena {
    /// Stores `urb` and returns its id.
    #[allow(clippy::cast_possible_truncation)]
    pub fn insert(&mut self, urb: Urb) -> UrbId {
        let index = self.free.pop().unwrap_or_else(|| {
            self.slots.push(Slot::default());
            (self.slots.len() - 1) as u32
        });
        let slot = &mut self.slots[index as usize];
        slot.urb = Some(urb);
        UrbId {
            index,
            generation: slot.generation,
        }
    }

    /// Borrows a live URB.
    pub fn get(&self, id: UrbId) -> Option<&Urb> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.urb.as_ref())
    }

    /// Mutably borrows a live URB.
    pub fn get_mut(&mut self, id: UrbId) -> Option<&mut Urb> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.urb.as_mut())
    }

    /// Takes the URB out and retires the id.
    pub fn remove(&mut self, id: UrbId) -> Option<Urb> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)?;
        let urb = slot.urb.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(urb)
    }

    /// Number of live URBs.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Live URBs with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (UrbId, &Urb)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            #[allow(clippy::cast_possible_truncation)]
            let id = UrbId {
                index: i as u32,
                generation: s.generation,
            };
            s.urb.as_ref().map(|u| (id, u))
        })
    }
}

/// Ordered pending and ready sets.
#[derive(Debug, Default)]
pub(crate) struct Queues {
    /// Submitted, not yet completed, in submission order.
    pending: VecDeque<UrbId>,
    /// Completed, not yet consumed, in completion order.
    ready: VecDeque<UrbId>,
}

impl Queues {
    /// Records a newly submitted URB.
    pub fn push_pending(&mut self, id: UrbId) -> Result<()> {
        if self.pending.contains(&id) || self.ready.contains(&id) {
            return Err(Error::FatalConsistency(format!("{id:?} queued twice")));
        }
        self.pending.push_back(id);
        Ok(())
    }

    /// Moves an URB from pending to ready.
    pub fn complete(&mut self, id: UrbId) -> Result<()> {
        if !self.unlink_pending(id) {
            return Err(Error::FatalConsistency(format!(
                "completion for {id:?} which is not pending"
            )));
        }
        self.ready.push_back(id);
        Ok(())
    }

    /// Removes an URB from the pending set without completing it.
    pub fn unlink_pending(&mut self, id: UrbId) -> bool {
        match self.pending.iter().position(|p| *p == id) {
            Some(pos) => {
                self.pending.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Removes `id` from the ready set if it is there.
    pub fn take_ready(&mut self, id: UrbId) -> bool {
        match self.ready.iter().position(|r| *r == id) {
            Some(pos) => {
                self.ready.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Removes and returns the oldest ready id matching `pred`.
    pub fn take_first_ready(&mut self, mut pred: impl FnMut(UrbId) -> bool) -> Option<UrbId> {
        let pos = self.ready.iter().position(|r| pred(*r))?;
        self.ready.remove(pos)
    }

    /// Ids still pending, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = UrbId> + '_ {
        self.pending.iter().copied()
    }

    /// True if `id` is pending.
    pub fn is_pending(&self, id: UrbId) -> bool {
        self.pending.contains(&id)
    }

    /// True if nothing is pending.
    pub fn pending_is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Empties the pending set, returning what was in it.
    pub fn drain_pending(&mut self) -> Vec<UrbId> {
        self.pending.drain(..).collect()
    }

    /// Empties the ready set, returning what was in it.
    pub fn drain_ready(&mut self) -> Vec<UrbId> {
        self.ready.drain(..).collect()
    }
}

/// Per-kind transaction id issue and in-order delivery check.
#[derive(Debug)]
pub(crate) struct Xids {
    /// Next id to hand out, per kind.
    next: [u32; UrbKind::COUNT],
    /// Last id consumed, per kind.
    last: [u32; UrbKind::COUNT],
}

impl Default for Xids {
    fn default() -> Self {
        Self {
            next: [1; UrbKind::COUNT],
            last: [0; UrbKind::COUNT],
        }
    }
}

impl Xids {
    /// Hands out the next id for `kind`.
    pub fn issue(&mut self, kind: UrbKind) -> u32 {
        let slot = &mut self.next[kind.slot()];
        let xid = *slot;
        *slot = slot.wrapping_add(1);
        xid
    }

    /// Records consumption of `xid`, failing if it does not move forward.
    pub fn consume(&mut self, kind: UrbKind, xid: u32) -> Result<()> {
        let last = &mut self.last[kind.slot()];
        if xid <= *last {
            return Err(Error::FatalConsistency(format!(
                "{kind:?} transaction {xid} delivered after {last}",
                last = *last
            )));
        }
        *last = xid;
        Ok(())
    }
}
