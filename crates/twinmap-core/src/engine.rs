//! Transaction engine: write interception, page promotion, commit, reset

use tracing::{debug, trace};

use crate::diff;
use crate::layout::{self, PAGE_SIZE};
use crate::mapping::{self, ProtFlags};
use crate::page::PageState;
use crate::region::{fatal, Region};

/// Identity recorded in the shared counters. Looked up per operation, never
/// cached: a forked child must record its own pid.
fn self_tid() -> u32 {
    nix::unistd::getpid().as_raw() as u32
}

impl Region {
    /// Handle the first write to a protected page in this transaction.
    ///
    /// Called with the faulting address. Unprotects the page, forces the
    /// kernel's copy-on-write to materialize, snapshots the page as the
    /// original twin and registers this process as a user of the page. No
    /// persistent bytes are touched here.
    pub fn handle_write(&mut self, addr: *const u8) {
        debug_assert!(self.in_range(addr));
        let page_start = layout::page_align_down(addr as usize) as *mut u8;

        mapping::protect(
            page_start,
            PAGE_SIZE,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        )
        .unwrap_or_else(|e| fatal(&e));

        let page_no = layout::page_of(addr as usize - self.base() as usize);
        let mut entry = self.entries.acquire(page_no, page_start);

        // Touch the page before snapshotting it, so the private copy exists
        // by the time the twin is taken. The volatile pair cannot collapse
        // into a no-op.
        unsafe {
            let word = page_start as *mut usize;
            let value = word.read_volatile();
            word.write_volatile(value);
        }

        entry.snapshot_original();

        let prior_users = self.counters.note_page_user(page_no);
        entry.state = if prior_users != 0 {
            PageState::SharedPending
        } else {
            PageState::Private
        };
        trace!(page = page_no, contended = prior_users != 0, "write fault");

        if let Some(stale) = self.pages.insert(page_no, entry) {
            // Re-dirtied page: the fresh record replaces the stale one.
            self.entries.release(stale, &mut self.twins);
        }
    }

    /// Between-synchronization scan of the write set.
    ///
    /// Promotes pages that other processes have started touching, allocating
    /// their tracking buffers exactly once, and records interim word changes
    /// for every tracked page. Runs outside the write-fault path.
    pub fn periodic_check(&mut self) {
        let tid = self_tid();
        for entry in self.pages.values_mut() {
            if matches!(entry.state, PageState::Private) {
                if self.counters.page_users(entry.page_no) == 1 {
                    // Still the sole writer; nothing to track.
                    continue;
                }
                entry.state = PageState::SharedPending;
            }

            let first_promotion = matches!(entry.state, PageState::SharedPending);
            if first_promotion {
                let mut word_counts = self.twins.acquire();
                word_counts.as_bytes_mut().fill(0);
                entry.state = PageState::SharedTracked {
                    temp_twin: self.twins.acquire(),
                    word_counts,
                };
                trace!(page = entry.page_no, "page promoted to shared tracking");
            }

            diff::record_changes_and_update(&self.counters, tid, entry, first_promotion);
        }
    }

    /// Commit the write set into the persistent view at transaction end.
    ///
    /// Tracked pages go through the checking commit (word tallies, cache
    /// invalidations, byte-wise merge) when `do_checking` is set; everything
    /// else takes the plain word-diff copy against the original twin.
    pub fn commit(&mut self, do_checking: bool) {
        if self.pages.is_empty() {
            return;
        }

        let tid = self_tid();
        for entry in self.pages.values() {
            let dest = self.persistent_page(entry.page_no);
            if do_checking && matches!(entry.state, PageState::SharedTracked { .. }) {
                diff::check_commit_page(&self.counters, tid, dest, entry);
            } else {
                diff::commit_page_diffs(entry.page_start, &entry.orig_twin, dest);
            }
        }
        debug!(pages = self.pages.len(), do_checking, "write set committed");
    }

    /// Start a transaction: discard the previous write set's private copies
    /// and re-arm protection.
    ///
    /// Must run before any further write is accepted; kept outside critical
    /// sections so the system calls do not serialize the process group.
    pub fn begin_transaction(&mut self) {
        self.update_all();
    }

    fn update_all(&mut self) {
        if self.pages.is_empty() {
            return;
        }

        let base = self.base() as usize;
        for (first, count) in coalesce_runs(self.pages.keys().copied()) {
            let start = (base + first * PAGE_SIZE) as *mut u8;
            let len = count * PAGE_SIZE;
            // One discard plus one reprotect per contiguous run.
            mapping::discard(start, len).unwrap_or_else(|e| fatal(&e));
            mapping::protect(start, len, ProtFlags::PROT_READ).unwrap_or_else(|e| fatal(&e));
        }
        debug!(pages = self.pages.len(), "write set reset");

        let drained = std::mem::take(&mut self.pages);
        for (_, entry) in drained {
            self.entries.release(entry, &mut self.twins);
        }
    }
}

/// Collapse an ordered sequence of page indexes into maximal contiguous
/// runs of `(first_page, page_count)`.
fn coalesce_runs(pages: impl Iterator<Item = usize>) -> Vec<(usize, usize)> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    for page in pages {
        match runs.last_mut() {
            Some((first, count)) if *first + *count == page => *count += 1,
            _ => runs.push((page, 1)),
        }
    }
    runs
}
