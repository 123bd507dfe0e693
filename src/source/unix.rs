use core::ptr::NonNull;

use super::PageSource;
use crate::ptr_utils;

const RESERVATION_DEFAULT: usize = 1 << 30;
const OS_PAGE_FALLBACK: usize = 4096;

/// Backs the heap with virtual memory from the operating system.
///
/// A range of address space is reserved with `mmap(PROT_NONE)` on the first
/// request. The break then moves through it, committing memory with `mprotect`
/// as it advances and decommitting it as it retreats. Requests beyond the
/// reservation fail.
#[derive(Debug)]
pub struct MmapSource {
    reservation: usize,
    base: *mut u8,
    committed: usize,
    brk: usize,
}

// SAFETY: the mapping is owned exclusively by the source
unsafe impl Send for MmapSource {}

impl MmapSource {
    /// A source reserving 1 GiB of address space.
    pub const fn new() -> Self {
        Self::with_reservation(RESERVATION_DEFAULT)
    }

    /// A source reserving `bytes` of address space, rounded up to whole pages.
    pub const fn with_reservation(bytes: usize) -> Self {
        Self { reservation: bytes, base: core::ptr::null_mut(), committed: 0, brk: 0 }
    }

    fn os_page_size() -> usize {
        // SAFETY: sysconf has no preconditions
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            size if size > 0 => size as usize,
            _ => OS_PAGE_FALLBACK,
        }
    }

    fn reserve(&mut self) -> bool {
        let Some(size) = ptr_utils::align_up_checked(self.reservation, Self::os_page_size())
            .filter(|&size| size != 0 && size <= isize::MAX as usize)
        else {
            return false;
        };

        // SAFETY: a fresh anonymous mapping aliases nothing
        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return false;
        }

        self.base = addr.cast();
        self.reservation = size;
        true
    }

    unsafe fn commit(&mut self, end: usize) -> bool {
        let end = match ptr_utils::align_up_checked(end, Self::os_page_size()) {
            Some(end) => end.min(self.reservation),
            None => return false,
        };

        let result = libc::mprotect(
            self.base.wrapping_add(self.committed).cast(),
            end - self.committed,
            libc::PROT_READ | libc::PROT_WRITE,
        );

        if result != 0 {
            return false;
        }
        self.committed = end;
        true
    }

    unsafe fn decommit(&mut self, end: usize) {
        let Some(end) = ptr_utils::align_up_checked(end, Self::os_page_size()) else {
            return;
        };
        if end >= self.committed {
            return;
        }

        let base = self.base.wrapping_add(end).cast();
        let size = self.committed - end;

        #[cfg(target_os = "linux")]
        libc::madvise(base, size, libc::MADV_DONTNEED);

        // failing to decommit only costs memory, the pages remain usable
        if libc::mprotect(base, size, libc::PROT_NONE) == 0 {
            self.committed = end;
        }
    }
}

impl Default for MmapSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MmapSource {
    fn drop(&mut self) {
        if !self.base.is_null() {
            // SAFETY: the mapping was created by `reserve` with this size
            unsafe { libc::munmap(self.base.cast(), self.reservation) };
        }
    }
}

// SAFETY: the break only moves within the reservation, and memory behind it
// is committed before being handed out
unsafe impl PageSource for MmapSource {
    unsafe fn grant(&mut self, delta: isize) -> Option<NonNull<u8>> {
        if self.base.is_null() && !self.reserve() {
            return None;
        }

        if delta >= 0 {
            let old = self.brk;
            let brk = old.checked_add(delta as usize).filter(|&brk| brk <= self.reservation)?;
            if brk > self.committed && !self.commit(brk) {
                return None;
            }

            self.brk = brk;
            NonNull::new(self.base.wrapping_add(old))
        } else {
            self.brk = self.brk.checked_sub(delta.unsigned_abs())?;
            self.decommit(self.brk);
            NonNull::new(self.base.wrapping_add(self.brk))
        }
    }
}
