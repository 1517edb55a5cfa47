//! Teardown reporting seam

use crate::counters::WordChange;

/// Counter snapshot of one region, handed to the analysis component at
/// teardown. Index `i` of `cache_invalidates` covers the cache line at
/// `base + i * CACHE_LINE_SIZE`; `word_changes` is laid out the same way at
/// word granularity.
#[derive(Debug)]
pub struct RegionReport {
    /// Start of the region's working range.
    pub base: usize,
    /// Tracked size in bytes.
    pub len: usize,
    pub is_heap: bool,
    /// For heap regions, one past the last live allocation.
    pub live_end: Option<usize>,
    pub cache_invalidates: Vec<usize>,
    pub word_changes: Vec<WordChange>,
}

/// Consumer of accumulated counters; implemented by the reporting and
/// analysis component outside this crate.
pub trait ReportSink {
    fn consume(&mut self, report: RegionReport);
}
