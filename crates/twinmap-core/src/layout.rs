//! Region geometry constants and index arithmetic

/// Page size tracked by the engine.
pub const PAGE_SIZE: usize = 4096;

/// Mask selecting the in-page offset of an address.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Cache line size assumed for invalidation accounting.
pub const CACHE_LINE_SIZE: usize = 64;

/// Diffing granularity: one machine word.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Words per tracked page.
pub const WORDS_PER_PAGE: usize = PAGE_SIZE / WORD_SIZE;

/// Cache lines per tracked page.
pub const LINES_PER_PAGE: usize = PAGE_SIZE / CACHE_LINE_SIZE;

/// Shift converting an in-page word index to its cache line index.
pub const WORDS_PER_LINE_SHIFT: u32 = (CACHE_LINE_SIZE / WORD_SIZE).trailing_zeros();

/// Cache lines whose invalidation tally reaches this value are considered
/// evidence worth keeping; object-reuse cleanup refuses to clear them.
pub const MIN_INVALIDATES_WORTH_REPORTING: usize = 2;

/// Page index of a byte offset into the region.
pub const fn page_of(offset: usize) -> usize {
    offset / PAGE_SIZE
}

/// Cache line index of a byte offset into the region.
pub const fn line_of(offset: usize) -> usize {
    offset / CACHE_LINE_SIZE
}

/// Word index of a byte offset into the region.
pub const fn word_of(offset: usize) -> usize {
    offset / WORD_SIZE
}

/// Start address of the page containing `addr`.
pub const fn page_align_down(addr: usize) -> usize {
    addr & !PAGE_MASK
}

/// Round `len` up to the next page multiple; exact multiples are unchanged.
pub const fn round_up_to_page(len: usize) -> usize {
    (len + PAGE_MASK) & !PAGE_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_is_consistent() {
        assert_eq!(WORDS_PER_PAGE * WORD_SIZE, PAGE_SIZE);
        assert_eq!(LINES_PER_PAGE * CACHE_LINE_SIZE, PAGE_SIZE);
        assert_eq!(1usize << WORDS_PER_LINE_SHIFT, CACHE_LINE_SIZE / WORD_SIZE);
    }

    #[test]
    fn index_arithmetic() {
        assert_eq!(page_of(0), 0);
        assert_eq!(page_of(PAGE_SIZE - 1), 0);
        assert_eq!(page_of(PAGE_SIZE), 1);
        assert_eq!(line_of(CACHE_LINE_SIZE * 3 + 7), 3);
        assert_eq!(word_of(WORD_SIZE * 5), 5);
        assert_eq!(page_align_down(0x12345), 0x12000);
    }

    #[test]
    fn page_rounding() {
        assert_eq!(round_up_to_page(0), 0);
        assert_eq!(round_up_to_page(1), PAGE_SIZE);
        assert_eq!(round_up_to_page(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_up_to_page(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }
}
