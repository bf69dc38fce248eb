// SPDX-FileCopyrightText: 2024-2025 The flashpack developers
// SPDX-License-Identifier: GPL-3.0-only

use num_traits::PrimInt;

/// Calculate the amount of padding that needs to be added to align the
/// specified offset to a page boundary.
pub fn calc<N: PrimInt>(offset: N, page_size: N) -> N {
    let r = offset % page_size;
    if r == N::zero() {
        N::zero()
    } else {
        page_size - r
    }
}

/// Round to the next multiple of the page size.
pub fn round<N: PrimInt>(offset: N, page_size: N) -> Option<N> {
    let remain = calc(offset, page_size);
    offset.checked_add(&remain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calc_and_round() {
        assert_eq!(calc(0u64, 512), 0);
        assert_eq!(calc(1u64, 512), 511);
        assert_eq!(calc(512u64, 512), 0);
        assert_eq!(calc(513u64, 512), 511);

        assert_eq!(round(48u64, 4096), Some(4096));
        assert_eq!(round(4096u64, 4096), Some(4096));
        assert_eq!(round(u64::MAX, 2), None);
    }
}
