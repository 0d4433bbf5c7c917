//! Frame checksums computed directly over message chains.

use crate::message::RawMessage;

/// Checksum algorithm used by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ChecksumKind {
    /// CRC-32 (IEEE 802.3).
    #[default]
    Crc32 = 0,
    /// CRC-32C (Castagnoli).
    Crc32c = 1,
}

/// Incremental checksum routine. `update(update(0, a), b)` equals the
/// checksum of `a` followed by `b`.
pub struct Checksum {
    pub name: &'static str,
    pub update: fn(u32, &[u8]) -> u32,
}

fn crc32_update(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}

fn crc32c_update(crc: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(crc, data)
}

/// Routines indexed by [`ChecksumKind`].
pub static CHECKSUMS: [Checksum; 2] = [
    Checksum {
        name: "crc32",
        update: crc32_update,
    },
    Checksum {
        name: "crc32c",
        update: crc32c_update,
    },
];

impl ChecksumKind {
    #[inline]
    pub fn routine(self) -> &'static Checksum {
        &CHECKSUMS[self as usize]
    }

    /// Checksum of a contiguous slice.
    #[inline]
    pub fn compute(self, data: &[u8]) -> u32 {
        (self.routine().update)(0, data)
    }

    /// Continue a running checksum over `data`.
    #[inline]
    pub fn update(self, crc: u32, data: &[u8]) -> u32 {
        (self.routine().update)(crc, data)
    }
}

impl std::fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.routine().name)
    }
}

impl RawMessage {
    /// Checksum of the first `min(n, len)` bytes, without consuming them.
    pub fn checksum(&self, kind: ChecksumKind, n: usize) -> u32 {
        let update = kind.routine().update;
        let mut crc = 0;
        self.process(n, |chunk| crc = update(crc, chunk));
        crc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferAllocator;

    #[test]
    fn known_vectors() {
        assert_eq!(ChecksumKind::Crc32.compute(b"123456789"), 0xCBF4_3926);
        assert_eq!(ChecksumKind::Crc32c.compute(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn incremental_matches_whole() {
        for kind in [ChecksumKind::Crc32, ChecksumKind::Crc32c] {
            let crc = kind.update(kind.compute(b"12345"), b"6789");
            assert_eq!(crc, kind.compute(b"123456789"), "{kind}");
        }
    }

    #[test]
    fn message_checksum_ignores_layout() {
        let alloc = BufferAllocator::with_limit(1 << 20);
        let mut msg = RawMessage::from_slice(&alloc, b"1234").unwrap();
        msg.append(RawMessage::from_slice(&alloc, b"56789").unwrap())
            .unwrap();
        assert_eq!(msg.part_count(), 2);
        assert_eq!(msg.checksum(ChecksumKind::Crc32, usize::MAX), 0xCBF4_3926);
        assert_eq!(
            msg.checksum(ChecksumKind::Crc32c, 4),
            ChecksumKind::Crc32c.compute(b"1234")
        );
    }
}
