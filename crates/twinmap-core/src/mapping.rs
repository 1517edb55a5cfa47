//! Platform mapping boundary: backing segment, remapping and protection

use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{madvise, mmap, mmap_anonymous, mprotect, munmap, MapFlags, MmapAdvise};
use nix::unistd::ftruncate;

use crate::{Error, Result};

pub(crate) use nix::sys::mman::ProtFlags;

/// Anonymous backing segment both region mappings are established over.
///
/// A memfd has exactly the lifetime the protocol needs: it is never visible
/// in the filesystem and disappears when the last process holding the fd
/// exits. Forked children inherit the fd together with the mappings.
pub(crate) struct Backing {
    fd: OwnedFd,
}

impl Backing {
    /// Create a segment of exactly `len` bytes.
    pub(crate) fn new(len: usize) -> Result<Self> {
        let fd = memfd_create(c"twinmap-backing", MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(|e| Error::Backing(format!("memfd_create: {e}")))?;
        ftruncate(&fd, len as i64)
            .map_err(|e| Error::Backing(format!("ftruncate to {len} bytes: {e}")))?;
        Ok(Self { fd })
    }

    /// Map `len` bytes of the segment starting at byte `offset`.
    ///
    /// With `at` given the mapping is fixed and replaces whatever currently
    /// occupies that address range; this is how a working range flips between
    /// private and shared views without ever moving.
    pub(crate) fn map(
        &self,
        at: Option<usize>,
        len: usize,
        prot: ProtFlags,
        shared: bool,
        offset: i64,
    ) -> Result<NonNull<u8>> {
        let mut flags = if shared {
            MapFlags::MAP_SHARED
        } else {
            MapFlags::MAP_PRIVATE
        };
        if at.is_some() {
            flags |= MapFlags::MAP_FIXED;
        }
        let length = NonZeroUsize::new(len).ok_or(Error::Map {
            addr: at.unwrap_or(0),
            len,
            errno: nix::Error::EINVAL,
        })?;
        let ptr = unsafe { mmap(at.and_then(NonZeroUsize::new), length, prot, flags, &self.fd, offset) }
            .map_err(|errno| Error::Map {
                addr: at.unwrap_or(0),
                len,
                errno,
            })?;
        Ok(ptr.cast())
    }
}

/// Anonymous shared mapping, zero-filled; inherited across fork.
pub(crate) fn map_shared_anon(len: usize) -> Result<NonNull<u8>> {
    let length = NonZeroUsize::new(len).ok_or(Error::Map {
        addr: 0,
        len,
        errno: nix::Error::EINVAL,
    })?;
    let ptr = unsafe {
        mmap_anonymous(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
        )
    }
    .map_err(|errno| Error::Map {
        addr: 0,
        len,
        errno,
    })?;
    Ok(ptr.cast())
}

/// Change the protection of an address range.
pub(crate) fn protect(addr: *mut u8, len: usize, prot: ProtFlags) -> Result<()> {
    let ptr = NonNull::new(addr.cast()).ok_or(Error::Protect {
        addr: 0,
        len,
        errno: nix::Error::EINVAL,
    })?;
    unsafe { mprotect(ptr, len, prot) }.map_err(|errno| Error::Protect {
        addr: addr as usize,
        len,
        errno,
    })
}

/// Tell the kernel to drop the private copies backing an address range.
pub(crate) fn discard(addr: *mut u8, len: usize) -> Result<()> {
    let ptr = NonNull::new(addr.cast()).ok_or(Error::Advise {
        addr: 0,
        len,
        errno: nix::Error::EINVAL,
    })?;
    unsafe { madvise(ptr, len, MmapAdvise::MADV_DONTNEED) }.map_err(|errno| Error::Advise {
        addr: addr as usize,
        len,
        errno,
    })
}

/// Best-effort unmap, for teardown paths.
pub(crate) fn unmap(addr: NonNull<u8>, len: usize) {
    let _ = unsafe { munmap(addr.cast(), len) };
}
