//! Cross-process counter arrays
//!
//! One set per region, resident in anonymous shared mappings so every
//! process in the group observes the same cells. All cross-process mutation
//! goes through the atomic methods here; raw pointers never leave this
//! module.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::layout::{CACHE_LINE_SIZE, PAGE_SIZE, WORD_SIZE};
use crate::mapping;
use crate::Result;

/// Owner id recorded once a word has been written by more than one process.
pub const SHARED_OWNER: u16 = 0xFFFF;

/// Packed per-word change record: low 16 bits of the owning pid plus a
/// change-version tally.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WordChange {
    owner: u16,
    version: u16,
}

impl WordChange {
    pub fn owner(&self) -> u16 {
        self.owner
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn is_shared(&self) -> bool {
        self.owner == SHARED_OWNER
    }

    /// Fold `count` observed changes by `owner` into the record.
    ///
    /// An unowned word adopts the writer; a word with a different owner
    /// moves to [`SHARED_OWNER`] and never leaves it.
    pub fn record(&mut self, owner: u16, count: u16) {
        if self.owner == 0 {
            self.owner = owner;
        } else if self.owner != owner && self.owner != SHARED_OWNER {
            self.owner = SHARED_OWNER;
        }
        self.version = self.version.wrapping_add(count);
    }
}

/// Fixed-size array living in an anonymous shared mapping.
struct SharedArray<T> {
    ptr: NonNull<T>,
    len: usize,
}

impl<T> SharedArray<T> {
    /// Allocate; mmap hands the cells back zero-filled.
    fn zeroed(len: usize) -> Result<Self> {
        let ptr = mapping::map_shared_anon(len * std::mem::size_of::<T>())?.cast::<T>();
        Ok(Self { ptr, len })
    }

    fn get(&self, index: usize) -> &T {
        assert!(index < self.len);
        unsafe { &*self.ptr.as_ptr().add(index) }
    }

    fn ptr_at(&self, index: usize) -> *mut T {
        assert!(index < self.len);
        unsafe { self.ptr.as_ptr().add(index) }
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl<T> Drop for SharedArray<T> {
    fn drop(&mut self) {
        mapping::unmap(self.ptr.cast(), self.len * std::mem::size_of::<T>());
    }
}

/// The shared counter arrays of one region, sized from its geometry.
pub struct CounterSet {
    /// Distinct processes that dirtied each page since the last reset.
    page_users: SharedArray<AtomicUsize>,
    /// Cross-process invalidation tally per cache line.
    cache_invalidates: SharedArray<AtomicUsize>,
    /// Last process to write a word in each cache line.
    cache_last_owner: SharedArray<AtomicU32>,
    /// Packed (owner, version) record per machine word.
    word_changes: SharedArray<WordChange>,
}

impl CounterSet {
    pub(crate) fn for_capacity(capacity: usize) -> Result<Self> {
        debug_assert_eq!(capacity % PAGE_SIZE, 0);
        Ok(Self {
            page_users: SharedArray::zeroed(capacity / PAGE_SIZE)?,
            cache_invalidates: SharedArray::zeroed(capacity / CACHE_LINE_SIZE)?,
            cache_last_owner: SharedArray::zeroed(capacity / CACHE_LINE_SIZE)?,
            word_changes: SharedArray::zeroed(capacity / WORD_SIZE)?,
        })
    }

    /// Register the calling process as a user of `page`, returning how many
    /// registrations preceded it. Nonzero means the page is contended.
    pub fn note_page_user(&self, page: usize) -> usize {
        self.page_users.get(page).fetch_add(1, Ordering::SeqCst)
    }

    pub fn page_users(&self, page: usize) -> usize {
        self.page_users.get(page).load(Ordering::SeqCst)
    }

    /// Record that `tid` wrote into `line`.
    ///
    /// Swaps the line's last owner and bumps the invalidation tally when the
    /// previous owner was a different process. This is the single mutation
    /// point for both arrays; callers must invoke it at most once per line
    /// per diff pass.
    pub fn record_cache_invalidate(&self, line: usize, tid: u32) -> bool {
        let prev = self.cache_last_owner.get(line).swap(tid, Ordering::SeqCst);
        if prev != 0 && prev != tid {
            self.cache_invalidates.get(line).fetch_add(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn invalidations(&self, line: usize) -> usize {
        self.cache_invalidates.get(line).load(Ordering::SeqCst)
    }

    /// Fold `count` changes by the low pid bits `owner` into a word's record.
    ///
    /// Not atomic: only the owning process writes its own dirtied words
    /// during its own commit, and cross-process visibility rides on the
    /// commit stores plus the memory barrier at transaction boundaries.
    pub fn record_word_changes(&self, word: usize, owner: u16, count: u16) {
        let ptr = self.word_changes.ptr_at(word);
        unsafe {
            let mut cell = ptr.read();
            cell.record(owner, count);
            ptr.write(cell);
        }
    }

    pub fn word_change(&self, word: usize) -> WordChange {
        unsafe { self.word_changes.ptr_at(word).read() }
    }

    pub(crate) fn reset_line(&self, line: usize) {
        self.cache_invalidates.get(line).store(0, Ordering::SeqCst);
    }

    pub(crate) fn reset_word(&self, word: usize) {
        unsafe { self.word_changes.ptr_at(word).write(WordChange::default()) }
    }

    pub fn lines(&self) -> usize {
        self.cache_invalidates.len()
    }

    pub fn words(&self) -> usize {
        self.word_changes.len()
    }

    pub fn invalidation_snapshot(&self) -> Vec<usize> {
        (0..self.lines()).map(|i| self.invalidations(i)).collect()
    }

    pub fn word_change_snapshot(&self) -> Vec<WordChange> {
        (0..self.words()).map(|i| self.word_change(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_owner_transitions_are_one_directional() {
        let mut cell = WordChange::default();
        cell.record(7, 1);
        assert_eq!(cell.owner(), 7);
        assert_eq!(cell.version(), 1);

        cell.record(7, 2);
        assert_eq!(cell.owner(), 7);
        assert_eq!(cell.version(), 3);

        cell.record(9, 1);
        assert!(cell.is_shared());
        assert_eq!(cell.version(), 4);

        // Once shared, no single owner ever comes back.
        cell.record(7, 1);
        assert!(cell.is_shared());
        assert_eq!(cell.version(), 5);
    }

    #[test]
    fn invalidation_requires_a_different_previous_owner() {
        let counters = CounterSet::for_capacity(PAGE_SIZE).unwrap();

        // First writer: line adopts the owner, nothing to invalidate.
        assert!(!counters.record_cache_invalidate(0, 100));
        assert_eq!(counters.invalidations(0), 0);

        // Same process again: still nothing.
        assert!(!counters.record_cache_invalidate(0, 100));
        assert_eq!(counters.invalidations(0), 0);

        // A different process: one interleaving observed.
        assert!(counters.record_cache_invalidate(0, 200));
        assert_eq!(counters.invalidations(0), 1);

        // And back: another one.
        assert!(counters.record_cache_invalidate(0, 100));
        assert_eq!(counters.invalidations(0), 2);
    }

    #[test]
    fn page_user_counts_are_monotonic() {
        let counters = CounterSet::for_capacity(2 * PAGE_SIZE).unwrap();
        assert_eq!(counters.note_page_user(1), 0);
        assert_eq!(counters.note_page_user(1), 1);
        assert_eq!(counters.page_users(1), 2);
        assert_eq!(counters.page_users(0), 0);
    }

    #[test]
    fn word_records_fold_through_shared_memory() {
        let counters = CounterSet::for_capacity(PAGE_SIZE).unwrap();
        counters.record_word_changes(3, 42, 2);
        counters.record_word_changes(3, 43, 1);
        let cell = counters.word_change(3);
        assert!(cell.is_shared());
        assert_eq!(cell.version(), 3);
    }
}
