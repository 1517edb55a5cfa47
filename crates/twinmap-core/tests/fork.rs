//! Cross-process scenarios over forked children.
//!
//! Forked processes inherit the region's mappings and shared counters, so
//! these tests exercise the real commit protocol. Run with
//! `cargo test --features integration`.

#[cfg(all(test, feature = "integration"))]
mod fork_scenarios {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    use twinmap_core::layout::{CACHE_LINE_SIZE, PAGE_SIZE, WORD_SIZE};
    use twinmap_core::Region;

    fn is_exit_success(status: WaitStatus) -> bool {
        matches!(status, WaitStatus::Exited(_, code) if code == 0)
    }

    fn write_word(addr: *mut u8, value: usize) {
        unsafe { (addr as *mut usize).write_volatile(value) }
    }

    /// Two processes write distinct words of the same page; after both
    /// commit, the persistent view reflects both writes and the page is
    /// known to be contended.
    #[test]
    fn distinct_words_of_one_page_merge_across_processes() {
        let mut region = Region::attach(4 * PAGE_SIZE, None, None);
        let child_word = region.base();
        let parent_word = unsafe { region.base().add(2 * CACHE_LINE_SIZE) };
        write_word(child_word, 0x1);
        write_word(parent_word, 0x2);
        region.open_protection();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                region.handle_write(child_word);
                write_word(child_word, 0xaa);
                region.commit(true);
                region.memory_barrier();
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert!(is_exit_success(status));

                region.handle_write(parent_word);
                write_word(parent_word, 0xbb);
                region.commit(true);
                region.memory_barrier();

                assert_eq!(region.read_shared_word(child_word), 0xaa);
                assert_eq!(region.read_shared_word(parent_word), 0xbb);
                assert_eq!(region.counters().page_users(0), 2);
            }
        }
    }

    /// A page stays untracked while one process owns it; once a second
    /// process faults it, the next periodic check promotes it and the
    /// checking commit records word history.
    #[test]
    fn late_contention_promotes_after_the_fact() {
        let mut region = Region::attach(2 * PAGE_SIZE, None, None);
        let word = region.base();
        let other_word = unsafe { region.base().add(WORD_SIZE) };
        write_word(word, 0x10);
        write_word(other_word, 0x20);
        region.open_protection();

        region.handle_write(word);
        write_word(word, 0x11);
        region.periodic_check();
        assert_eq!(region.counters().page_users(0), 1);

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                // Touches a different word of the same page, never commits.
                region.handle_write(other_word);
                write_word(other_word, 0x21);
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert!(is_exit_success(status));
                assert_eq!(region.counters().page_users(0), 2);

                // This pass sees the second user and starts tracking.
                region.periodic_check();
                write_word(word, 0x12);
                region.periodic_check();
                region.commit(true);
                region.memory_barrier();

                assert_eq!(region.read_shared_word(word), 0x12);
                assert_eq!(region.counters().word_change(0).version(), 2);
                // The child never committed its word.
                assert_eq!(region.read_shared_word(other_word), 0x20);
            }
        }
    }

    /// Both processes run tracked commits against the same cache line; the
    /// second one's recording observes the first one's ownership and tallies
    /// an interleaving.
    #[test]
    fn interleaved_line_writes_raise_invalidations() {
        let mut region = Region::attach(PAGE_SIZE, None, None);
        let word = region.base();
        let sibling = unsafe { region.base().add(WORD_SIZE) };
        write_word(word, 0x1);
        write_word(sibling, 0x2);
        region.open_protection();

        region.handle_write(word);
        write_word(word, 0x5);

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                region.handle_write(sibling);
                region.periodic_check(); // second user: promotes
                write_word(sibling, 0x6);
                region.periodic_check();
                region.commit(true);
                region.memory_barrier();
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert!(is_exit_success(status));

                region.periodic_check(); // promotes here too
                write_word(word, 0x7);
                region.periodic_check();
                region.commit(true);
                region.memory_barrier();

                assert!(region.counters().invalidations(0) >= 1);
                assert_eq!(region.read_shared_word(word), 0x7);
                assert_eq!(region.read_shared_word(sibling), 0x6);
            }
        }
    }
}
