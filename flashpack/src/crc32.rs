// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

//! CRC32 (polynomial `0xEDB88320`, bit-reversed) as used by the boot ROM
//! and by the on-flash table formats.

use crc32fast::Hasher;

/// Initial value of the raw CRC32 register.
pub const INIT: u32 = 0xffff_ffff;

/// Update a running CRC32 register with more data.
///
/// `crc` is the raw shift register, seeded with [`INIT`] for a fresh
/// computation. The result is *not* XORed with `0xffffffff`, so it can be
/// fed back in to chain a computation across non-contiguous buffers. The
/// on-flash table headers store this raw value directly; callers that need
/// the canonical CRC32 apply the final XOR exactly once at the end of the
/// message, or use [`checksum`].
pub fn update(crc: u32, data: &[u8]) -> u32 {
    // crc32fast works in finalized form: both its initial value and its
    // output carry the final XOR, so strip and reapply it around the raw
    // register.
    let mut hasher = Hasher::new_with_initial(!crc);
    hasher.update(data);
    !hasher.finalize()
}

/// Canonical CRC32 of a complete message.
pub fn checksum(data: &[u8]) -> u32 {
    !update(INIT, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        assert_eq!(checksum(b"123456789"), 0xcbf43926);
    }

    #[test]
    fn empty_message() {
        assert_eq!(update(INIT, b""), INIT);
        assert_eq!(checksum(b""), 0);
    }

    #[test]
    fn chaining_matches_contiguous() {
        let data = b"The quick brown fox jumps over the lazy dog";

        for split in [0, 1, 7, data.len()] {
            let (a, b) = data.split_at(split);
            let chained = update(update(INIT, a), b);
            assert_eq!(chained, update(INIT, data));
        }
    }
}
