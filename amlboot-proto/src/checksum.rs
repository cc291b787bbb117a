//! Payload checksums embedded in transfer headers.
//!
//! Two flavours exist on the wire: a folded 16-bit ones'-complement sum for
//! large-memory transfers, and a plain wrapping 32-bit word sum for media
//! blocks.

/// Sum of little-endian 16-bit words, folded to 16 bits, not complemented.
///
/// An odd trailing byte is added as-is.
#[allow(clippy::cast_possible_truncation)]
pub fn checksum16_raw(buf: &[u8]) -> u16 {
    let mut words = buf.chunks_exact(2);
    let mut sum = words
        .by_ref()
        .fold(0u32, |acc, w| acc.wrapping_add(u32::from(u16::from_le_bytes([w[0], w[1]]))));
    if let [last] = words.remainder() {
        sum = sum.wrapping_add(u32::from(*last));
    }
    sum = (sum >> 16) + (sum & 0xFFFF);
    sum += sum >> 16;
    sum as u16
}

/// Complemented 16-bit sum, as carried in large-memory transfer headers.
#[inline]
pub fn checksum16(buf: &[u8]) -> u16 {
    !checksum16_raw(buf)
}

/// Wrapping sum of little-endian 32-bit words plus a masked 1–3 byte tail.
pub fn checksum32(buf: &[u8]) -> u32 {
    let mut sum = Checksum32::new();
    sum.update(buf);
    sum.finish()
}

/// Incremental form of [`checksum32`].
///
/// Feeding a buffer in any number of pieces yields the same value as
/// hashing it in one go.
#[derive(Debug, Clone, Copy, Default)]
pub struct Checksum32 {
    /// Running sum of complete words.
    sum: u32,
    /// Bytes of a word not yet complete.
    tail: [u8; 4],
    /// Number of valid bytes in `tail`.
    tail_len: usize,
}

impl Checksum32 {
    /// Creates an empty accumulator.
    pub const fn new() -> Self {
        Self {
            sum: 0,
            tail: [0; 4],
            tail_len: 0,
        }
    }

    /// Feeds more bytes.
    pub fn update(&mut self, mut data: &[u8]) {
        if self.tail_len > 0 {
            let take = (4 - self.tail_len).min(data.len());
            self.tail[self.tail_len..self.tail_len + take].copy_from_slice(&data[..take]);
            self.tail_len += take;
            data = &data[take..];
            if self.tail_len < 4 {
                return;
            }
            self.sum = self.sum.wrapping_add(u32::from_le_bytes(self.tail));
            self.tail_len = 0;
        }

        let mut words = data.chunks_exact(4);
        for w in words.by_ref() {
            self.sum = self
                .sum
                .wrapping_add(u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
        }
        let rest = words.remainder();
        self.tail[..rest.len()].copy_from_slice(rest);
        self.tail_len = rest.len();
    }

    /// Returns the checksum of everything fed so far.
    pub fn finish(&self) -> u32 {
        let mut word = [0u8; 4];
        word[..self.tail_len].copy_from_slice(&self.tail[..self.tail_len]);
        self.sum.wrapping_add(u32::from_le_bytes(word))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn checksum16_of_empty_is_all_ones() {
        assert_eq!(checksum16_raw(&[]), 0);
        assert_eq!(checksum16(&[]), 0xFFFF);
    }

    #[test]
    fn checksum16_folds_carry_twice() {
        // 0xFFFF + 0xFFFF = 0x1FFFE -> 0xFFFF after folding.
        assert_eq!(checksum16_raw(&[0xFF, 0xFF, 0xFF, 0xFF]), 0xFFFF);
        assert_eq!(checksum16(&[0xFF, 0xFF, 0xFF, 0xFF]), 0);
    }

    #[test]
    fn checksum16_adds_odd_tail_byte_unshifted() {
        assert_eq!(checksum16_raw(&[0x01, 0x02, 0x03]), 0x0201 + 0x03);
    }

    #[test]
    fn checksum32_masks_tail() {
        let base = [1, 0, 0, 0];
        assert_eq!(checksum32(&base), 1);
        assert_eq!(checksum32(&[1, 0, 0, 0, 0xAA]), 1 + 0xAA);
        assert_eq!(checksum32(&[1, 0, 0, 0, 0xAA, 0xBB]), 1 + 0xBBAA);
        assert_eq!(checksum32(&[1, 0, 0, 0, 0xAA, 0xBB, 0xCC]), 1 + 0x00CC_BBAA);
    }

    #[test]
    fn checksum32_wraps() {
        assert_eq!(checksum32(&[0xFF, 0xFF, 0xFF, 0xFF, 2, 0, 0, 0]), 1);
    }

    proptest! {
        #[test]
        fn prop_complement_restores_raw_sum(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            prop_assert_eq!(!checksum16(&data), checksum16_raw(&data));
        }

        #[test]
        fn prop_checksum32_split_invariant(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            cut in any::<prop::sample::Index>(),
        ) {
            let at = cut.index(data.len() / 4 + 1) * 4;
            let at = at.min(data.len());
            let mut sum = Checksum32::new();
            sum.update(&data[..at]);
            sum.update(&data[at..]);
            prop_assert_eq!(sum.finish(), checksum32(&data));
        }

        #[test]
        fn prop_checksum32_arbitrary_split_invariant(
            data in proptest::collection::vec(any::<u8>(), 0..512),
            pieces in proptest::collection::vec(1usize..9, 1..64),
        ) {
            let mut sum = Checksum32::new();
            let mut rest = &data[..];
            for n in pieces.iter().cycle() {
                if rest.is_empty() {
                    break;
                }
                let (head, tail) = rest.split_at((*n).min(rest.len()));
                sum.update(head);
                rest = tail;
            }
            prop_assert_eq!(sum.finish(), checksum32(&data));
        }

        #[test]
        fn prop_checksum32_tail_change_is_seen(
            words in proptest::collection::vec(any::<u8>(), 0..64),
            tail in proptest::collection::vec(any::<u8>(), 1..4),
            pos in any::<prop::sample::Index>(),
            delta in 1u8..=255,
        ) {
            let mut data = words.clone();
            data.truncate(words.len() / 4 * 4);
            data.extend_from_slice(&tail);
            let before = checksum32(&data);
            let idx = data.len() - tail.len() + pos.index(tail.len());
            data[idx] = data[idx].wrapping_add(delta);
            prop_assert_ne!(checksum32(&data), before);
        }
    }
}
