//! Word-granularity diffing between working copies, twins and the
//! persistent view

use crate::counters::CounterSet;
use crate::layout::{LINES_PER_PAGE, WORDS_PER_LINE_SHIFT, WORDS_PER_PAGE, WORD_SIZE};
use crate::page::{PageBuf, PageEntry, PageState};

/// Interim recording pass for a tracked page.
///
/// Diffs the working copy against the baseline twin, tallying every changed
/// word and recording at most one cache invalidation per line. On the first
/// promotion the baseline is the original twin; afterwards it is the
/// temporary twin, rolled forward word by word. The first promotion ends by
/// refreshing the original twin to the current working bytes (a one-shot
/// refresh that never recurs) and seeding the temporary twin from the same
/// bytes.
pub(crate) fn record_changes_and_update(
    counters: &CounterSet,
    tid: u32,
    entry: &mut PageEntry,
    first_promotion: bool,
) {
    let local = entry.page_start as *const usize;
    let line_base = entry.page_no * LINES_PER_PAGE;

    let orig = &mut entry.orig_twin;
    let PageState::SharedTracked {
        temp_twin,
        word_counts,
    } = &mut entry.state
    else {
        unreachable!("recording pass on an untracked page");
    };

    let counts = word_counts.as_words_mut();
    let baseline = if first_promotion {
        orig.as_words_mut()
    } else {
        temp_twin.as_words_mut()
    };

    let mut recorded_line = usize::MAX;
    for i in 0..WORDS_PER_PAGE {
        let value = unsafe { local.add(i).read() };
        if value == baseline[i] {
            continue;
        }

        let line = i >> WORDS_PER_LINE_SHIFT;
        if line != recorded_line {
            counters.record_cache_invalidate(line_base + line, tid);
            recorded_line = line;
        }

        // The temporary twin rolls forward; the original twin must keep the
        // commit baseline (past the one-shot refresh below).
        if !first_promotion {
            baseline[i] = value;
        }
        counts[i] = counts[i].wrapping_add(1);
    }

    if first_promotion {
        orig.fill_from(entry.page_start);
        temp_twin.fill_from(entry.page_start);
    }
}

/// Checking commit for a tracked page.
///
/// Words equal to the original twin did not move since the last reset; a
/// nonzero local tally on such a word is the changed-then-changed-back
/// pattern, which still feeds the shared record so the evidence survives.
/// Every other word is merged byte-wise into the persistent page, with a
/// fresh invalidation recorded at most once per line when the value is new
/// since the last recording pass.
pub(crate) fn check_commit_page(
    counters: &CounterSet,
    tid: u32,
    dest: *mut u8,
    entry: &PageEntry,
) {
    let local = entry.page_start as *const usize;
    let line_base = entry.page_no * LINES_PER_PAGE;
    let word_base = entry.page_no * WORDS_PER_PAGE;
    let owner = tid as u16;

    let orig = entry.orig_twin.as_words();
    let PageState::SharedTracked {
        temp_twin,
        word_counts,
    } = &entry.state
    else {
        unreachable!("checking commit on an untracked page");
    };
    let temp = temp_twin.as_words();
    let counts = word_counts.as_words();

    let mut recorded_line = usize::MAX;
    for i in 0..WORDS_PER_PAGE {
        let value = unsafe { local.add(i).read() };
        if value == orig[i] {
            if counts[i] != 0 {
                counters.record_word_changes(word_base + i, owner, counts[i] as u16);
            }
            continue;
        }

        if value != temp[i] {
            let line = i >> WORDS_PER_LINE_SHIFT;
            if line != recorded_line {
                counters.record_cache_invalidate(line_base + line, tid);
                recorded_line = line;
            }
            counters.record_word_changes(word_base + i, owner, (counts[i] as u16).wrapping_add(1));
        } else {
            counters.record_word_changes(word_base + i, owner, counts[i] as u16);
        }

        commit_word_bytes(value, orig[i], unsafe { dest.add(i * WORD_SIZE) });
    }
}

/// Merge one word into the persistent view, copying only the bytes that
/// differ from the twin. Bytes the working copy shares with the twin are
/// left alone, tolerating another process's concurrent write to them.
fn commit_word_bytes(local: usize, twin: usize, share: *mut u8) {
    let local_bytes = local.to_ne_bytes();
    let twin_bytes = twin.to_ne_bytes();
    for (i, (l, t)) in local_bytes.iter().zip(twin_bytes).enumerate() {
        if *l != t {
            unsafe { share.add(i).write_volatile(*l) };
        }
    }
}

/// Plain commit for a page that never reached shared tracking: every word
/// differing from the original twin is propagated into the persistent page.
///
/// Sixteen bytes per step: compare the lanes, invert the equality mask and
/// scatter only the differing bytes into the destination.
#[cfg(all(target_arch = "x86_64", target_feature = "sse2"))]
pub(crate) fn commit_page_diffs(local: *const u8, twin: &PageBuf, dest: *mut u8) {
    use std::arch::x86_64::{
        __m128i, _mm_cmpeq_epi8, _mm_load_si128, _mm_maskmoveu_si128, _mm_set1_epi8, _mm_xor_si128,
    };

    use crate::layout::PAGE_SIZE;

    const LANE_BYTES: usize = std::mem::size_of::<__m128i>();
    let twin = twin.as_ptr();
    unsafe {
        let all_ones = _mm_set1_epi8(-1);
        for i in 0..PAGE_SIZE / LANE_BYTES {
            let local_chunk = _mm_load_si128(local.add(i * LANE_BYTES) as *const __m128i);
            let twin_chunk = _mm_load_si128(twin.add(i * LANE_BYTES) as *const __m128i);
            let eq = _mm_cmpeq_epi8(local_chunk, twin_chunk);
            let neq = _mm_xor_si128(eq, all_ones);
            _mm_maskmoveu_si128(local_chunk, neq, dest.add(i * LANE_BYTES) as *mut i8);
        }
    }
}

/// Portable word-at-a-time commit, equivalent to the vectorized path.
#[cfg(not(all(target_arch = "x86_64", target_feature = "sse2")))]
pub(crate) fn commit_page_diffs(local: *const u8, twin: &PageBuf, dest: *mut u8) {
    let twin = twin.as_words();
    let local = local as *const usize;
    let dest = dest as *mut usize;
    for i in 0..WORDS_PER_PAGE {
        let value = unsafe { local.add(i).read() };
        if value != twin[i] {
            unsafe { dest.add(i).write_volatile(value) };
        }
    }
}
