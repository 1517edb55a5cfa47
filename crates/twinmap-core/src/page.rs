//! Per-page dirty records and twin buffers

use crate::layout::{PAGE_SIZE, WORDS_PER_PAGE};

/// Page-sized, page-aligned byte buffer.
///
/// Used both for twin snapshots and for per-word change-count blocks (one
/// machine word of count per tracked word fills exactly one page). The
/// alignment keeps the vectorized commit on aligned loads.
#[repr(C, align(4096))]
pub(crate) struct PageBuf([u8; PAGE_SIZE]);

impl PageBuf {
    pub(crate) fn boxed() -> Box<Self> {
        Box::new(PageBuf([0; PAGE_SIZE]))
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    pub(crate) fn as_words(&self) -> &[usize; WORDS_PER_PAGE] {
        unsafe { &*(self.0.as_ptr() as *const [usize; WORDS_PER_PAGE]) }
    }

    pub(crate) fn as_words_mut(&mut self) -> &mut [usize; WORDS_PER_PAGE] {
        unsafe { &mut *(self.0.as_mut_ptr() as *mut [usize; WORDS_PER_PAGE]) }
    }

    /// Overwrite the whole buffer from a page in memory.
    pub(crate) fn fill_from(&mut self, src: *const u8) {
        unsafe { std::ptr::copy_nonoverlapping(src, self.0.as_mut_ptr(), PAGE_SIZE) }
    }
}

/// Sharing state of a dirtied page within the current transaction.
///
/// The state only moves forward; the tracking buffers exist exactly when the
/// page is `SharedTracked`, so the commit path cannot pick the wrong
/// comparison without failing to match.
pub(crate) enum PageState {
    /// Only this process has dirtied the page so far.
    Private,
    /// Another process has touched the page, but no extra buffers exist yet.
    SharedPending,
    /// Contended page under full word tracking.
    SharedTracked {
        /// Rolling snapshot, updated at each recording pass.
        temp_twin: Box<PageBuf>,
        /// Per-word change tallies since promotion.
        word_counts: Box<PageBuf>,
    },
}

/// One record per page dirtied by this process in the current transaction.
pub(crate) struct PageEntry {
    pub(crate) page_no: usize,
    pub(crate) page_start: *mut u8,
    pub(crate) state: PageState,
    /// Snapshot taken at first write fault; baseline for commit diffing.
    pub(crate) orig_twin: Box<PageBuf>,
}

impl PageEntry {
    /// Capture the page's current bytes as the original twin.
    pub(crate) fn snapshot_original(&mut self) {
        self.orig_twin.fill_from(self.page_start);
    }
}
