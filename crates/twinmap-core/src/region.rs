//! Region setup: dual mappings, geometry, protection

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};

use tracing::{debug, error, trace};

use crate::counters::CounterSet;
use crate::layout::{self, CACHE_LINE_SIZE, MIN_INVALIDATES_WORTH_REPORTING, PAGE_SIZE, WORD_SIZE};
use crate::mapping::{self, Backing, ProtFlags};
use crate::page::PageEntry;
use crate::pools::{EntryPool, TwinPool, INITIAL_TWIN_BUFFERS};
use crate::report::{RegionReport, ReportSink};
use crate::{Error, Result};

/// Whether a region tracks a heap or a fixed set of globals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    /// Dynamically sized; the tracked span is the full mapped capacity.
    Heap,
    /// Fixed at process start; `len` records the page-rounded content size.
    Globals { len: usize },
}

/// One tracked span of memory, mapped twice over a single backing segment.
///
/// The *working* mapping is what instrumented code reads and writes; once
/// protection is opened it is private to this process and write faults route
/// through [`Region::handle_write`]. The *persistent* mapping is shared by
/// every process in the group and receives committed words at transaction
/// end.
pub struct Region {
    pub(crate) kind: RegionKind,
    pub(crate) transient: NonNull<u8>,
    pub(crate) persistent: NonNull<u8>,
    pub(crate) backing: Backing,
    pub(crate) capacity: usize,
    pub(crate) protected: bool,
    /// Working mapping placed by the kernel, not at a caller-fixed address.
    owns_transient: bool,
    pub(crate) counters: CounterSet,
    /// Pages dirtied in the current transaction, ordered by page index.
    pub(crate) pages: BTreeMap<usize, PageEntry>,
    pub(crate) entries: EntryPool,
    pub(crate) twins: TwinPool,
}

impl Region {
    /// Establish both mappings over a fresh backing segment of `capacity`
    /// bytes (a whole number of pages).
    ///
    /// `start` fixes the working mapping's address (the globals case, where
    /// instrumented code already holds pointers into the range). `initial`
    /// contents are copied into the persistent view before the working view
    /// squashes the range, and mark the region as [`RegionKind::Globals`].
    ///
    /// Setup failures are unrecoverable: a process that cannot establish its
    /// mappings cannot participate in the shared protocol, so they log and
    /// abort instead of returning an error.
    pub fn attach(capacity: usize, start: Option<NonNull<u8>>, initial: Option<&[u8]>) -> Self {
        Self::try_attach(capacity, start, initial).unwrap_or_else(|e| fatal(&e))
    }

    /// [`Region::attach`] for a span of `nelts` elements of `T`.
    pub fn attach_typed<T>(nelts: usize, start: Option<NonNull<u8>>, initial: Option<&[u8]>) -> Self {
        Self::attach(nelts * std::mem::size_of::<T>(), start, initial)
    }

    fn try_attach(
        capacity: usize,
        start: Option<NonNull<u8>>,
        initial: Option<&[u8]>,
    ) -> Result<Self> {
        assert!(
            capacity > 0 && capacity % PAGE_SIZE == 0,
            "region capacity must be a whole number of pages"
        );

        let backing = Backing::new(capacity)?;
        let rw = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        let persistent = backing.map(None, capacity, rw, true, 0)?;

        let kind = match initial {
            Some(bytes) => {
                if bytes.len() > capacity {
                    return Err(Error::InitialTooLarge {
                        got: bytes.len(),
                        capacity,
                    });
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), persistent.as_ptr(), bytes.len())
                };
                RegionKind::Globals {
                    len: layout::round_up_to_page(bytes.len().max(1)),
                }
            }
            None => RegionKind::Heap,
        };

        let transient = backing.map(start.map(|p| p.as_ptr() as usize), capacity, rw, true, 0)?;
        let counters = CounterSet::for_capacity(capacity)?;

        debug!(
            transient = ?transient.as_ptr(),
            persistent = ?persistent.as_ptr(),
            capacity,
            ?kind,
            "region attached"
        );

        Ok(Self {
            kind,
            transient,
            persistent,
            backing,
            capacity,
            protected: false,
            owns_transient: start.is_none(),
            counters,
            pages: BTreeMap::new(),
            entries: EntryPool::new(),
            twins: TwinPool::with_capacity(INITIAL_TWIN_BUFFERS),
        })
    }

    /// Start of the working mapping.
    pub fn base(&self) -> *mut u8 {
        self.transient.as_ptr()
    }

    /// Tracked size in bytes: the recorded content size for globals, the
    /// full capacity for a heap.
    pub fn size(&self) -> usize {
        match self.kind {
            RegionKind::Heap => self.capacity,
            RegionKind::Globals { len } => len,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Whether `addr` falls inside `[base, base + size)`.
    pub fn in_range(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        let base = self.base() as usize;
        addr >= base && addr < base + self.size()
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Number of pages dirtied so far in the current transaction.
    pub fn dirty_pages(&self) -> usize {
        self.pages.len()
    }

    /// The region's shared counter arrays.
    pub fn counters(&self) -> &CounterSet {
        &self.counters
    }

    /// Arm the write-fault path: the working range becomes a private,
    /// read-only view, so the first write to each page traps.
    pub fn open_protection(&mut self) {
        self.remap_working(ProtFlags::PROT_READ, false)
            .unwrap_or_else(|e| fatal(&e));
        self.protected = true;
        trace!(base = ?self.base(), len = self.size(), "protection opened");
    }

    /// Disarm the fault path: the working range becomes a shared read-write
    /// view again, aliasing the persistent mapping directly.
    pub fn close_protection(&mut self) {
        self.remap_working(ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, true)
            .unwrap_or_else(|e| fatal(&e));
        self.protected = false;
        trace!(base = ?self.base(), len = self.size(), "protection closed");
    }

    fn remap_working(&self, prot: ProtFlags, shared: bool) -> Result<()> {
        self.backing
            .map(Some(self.base() as usize), self.size(), prot, shared, 0)
            .map(|_| ())
    }

    /// Flip part of the working range to the shared view in place.
    pub fn remap_shared(&self, start: *mut u8, len: usize, writable: bool) -> Result<()> {
        debug_assert!(self.in_range(start));
        let prot = if writable {
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        } else {
            ProtFlags::PROT_READ
        };
        let offset = start as usize - self.base() as usize;
        self.backing
            .map(Some(start as usize), len, prot, true, offset as i64)
            .map(|_| ())
    }

    /// Flip part of the working range back to a private read-only view.
    pub fn remap_private_readonly(&self, start: *mut u8, len: usize) -> Result<()> {
        debug_assert!(self.in_range(start));
        let offset = start as usize - self.base() as usize;
        self.backing
            .map(Some(start as usize), len, ProtFlags::PROT_READ, false, offset as i64)
            .map(|_| ())
    }

    pub(crate) fn persistent_page(&self, page_no: usize) -> *mut u8 {
        debug_assert!(page_no * PAGE_SIZE < self.capacity);
        unsafe { self.persistent.as_ptr().add(page_no * PAGE_SIZE) }
    }

    /// Read the persistent view's word at the offset of a working address.
    pub fn read_shared_word(&self, addr: *const u8) -> usize {
        debug_assert!(self.in_range(addr));
        let offset = addr as usize - self.base() as usize;
        unsafe { (self.persistent.as_ptr().add(offset) as *const usize).read_volatile() }
    }

    /// Write the persistent view's word at the offset of a working address.
    pub fn write_shared_word(&self, addr: *const u8, value: usize) {
        debug_assert!(self.in_range(addr));
        let offset = addr as usize - self.base() as usize;
        unsafe { (self.persistent.as_ptr().add(offset) as *mut usize).write_volatile(value) }
    }

    /// Clear the counters covering a reused heap object so its next tenant
    /// starts fresh.
    ///
    /// Refuses (returning `false`) when any involved cache line already
    /// carries reportable contention evidence.
    pub fn cleanup_object(&self, ptr: *const u8, len: usize) -> bool {
        assert!(matches!(self.kind, RegionKind::Heap));
        if !self.in_range(ptr) {
            return false;
        }

        let offset = ptr as usize - self.base() as usize;
        let first_line = layout::line_of(offset);
        let lines = (len / CACHE_LINE_SIZE).max(1);

        for line in first_line..first_line + lines {
            if self.counters.invalidations(line) >= MIN_INVALIDATES_WORTH_REPORTING {
                return false;
            }
        }
        for line in first_line..first_line + lines {
            self.counters.reset_line(line);
        }

        let first_word = layout::word_of(offset);
        let words = len.div_ceil(WORD_SIZE);
        for word in first_word..first_word + words {
            self.counters.reset_word(word);
        }
        true
    }

    /// Order this process's committed words against other processes'
    /// observations of the shared arrays.
    pub fn memory_barrier(&self) {
        fence(Ordering::SeqCst);
    }

    /// Hand the accumulated counters to the analysis sink.
    ///
    /// `live_end` bounds the scan for heap regions (one past the last live
    /// allocation); globals ignore it.
    pub fn finalize(&self, live_end: Option<usize>, sink: &mut dyn ReportSink) {
        sink.consume(RegionReport {
            base: self.base() as usize,
            len: self.size(),
            is_heap: matches!(self.kind, RegionKind::Heap),
            live_end,
            cache_invalidates: self.counters.invalidation_snapshot(),
            word_changes: self.counters.word_change_snapshot(),
        });
    }

    /// Tear the region down; mappings are removed on drop.
    pub fn detach(self) {}
}

impl Drop for Region {
    fn drop(&mut self) {
        // A caller-fixed working mapping (globals) stays: the range belongs
        // to the program image, not to us.
        if self.owns_transient {
            mapping::unmap(self.transient, self.capacity);
        }
        mapping::unmap(self.persistent, self.capacity);
    }
}

pub(crate) fn fatal(err: &Error) -> ! {
    // A process that cannot maintain its mapping invariants could silently
    // corrupt the shared view; it must not continue.
    error!("fatal region failure: {err}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_region_reports_full_capacity() {
        let region = Region::attach(4 * PAGE_SIZE, None, None);
        assert_eq!(region.size(), 4 * PAGE_SIZE);
        assert_eq!(region.kind(), RegionKind::Heap);
        assert_eq!(region.dirty_pages(), 0);
        assert!(!region.is_protected());
    }

    #[test]
    fn initial_contents_round_trip_through_base() {
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let region = Region::attach(4 * PAGE_SIZE, None, Some(&content));

        assert_eq!(region.kind(), RegionKind::Globals { len: 2 * PAGE_SIZE });
        assert_eq!(region.size(), 2 * PAGE_SIZE);

        let seen = unsafe { std::slice::from_raw_parts(region.base(), content.len()) };
        assert_eq!(seen, &content[..]);
    }

    #[test]
    fn in_range_matches_tracked_span() {
        let region = Region::attach(2 * PAGE_SIZE, None, None);
        let base = region.base();
        assert!(region.in_range(base));
        assert!(region.in_range(unsafe { base.add(2 * PAGE_SIZE - 1) }));
        assert!(!region.in_range(unsafe { base.add(2 * PAGE_SIZE) }));
    }

    #[test]
    fn shared_word_access_aliases_the_backing() {
        let region = Region::attach(PAGE_SIZE, None, None);
        let base = region.base();

        // Before protection opens, the working view is shared: a write
        // through it is a write to the backing segment.
        unsafe { (base as *mut usize).write_volatile(0xfeed) };
        assert_eq!(region.read_shared_word(base), 0xfeed);

        region.write_shared_word(base, 0xbeef);
        assert_eq!(unsafe { (base as *const usize).read_volatile() }, 0xbeef);
    }

    #[test]
    fn cleanup_object_refuses_contended_lines() {
        let region = Region::attach(PAGE_SIZE, None, None);
        let base = region.base();

        region.counters().record_word_changes(0, 7, 3);
        assert!(region.cleanup_object(base, CACHE_LINE_SIZE));
        assert_eq!(region.counters().word_change(0).version(), 0);

        // Push line 1 over the reporting threshold with two distinct owners.
        let line = 1;
        region.counters().record_cache_invalidate(line, 100);
        region.counters().record_cache_invalidate(line, 200);
        region.counters().record_cache_invalidate(line, 100);
        assert!(region.counters().invalidations(line) >= MIN_INVALIDATES_WORTH_REPORTING);
        assert!(!region.cleanup_object(unsafe { base.add(CACHE_LINE_SIZE) }, CACHE_LINE_SIZE));
        assert_eq!(region.counters().invalidations(line), 2);
    }
}
