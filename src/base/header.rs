//! The chunk header embedded in front of every payload, and the call-site tag it carries.

use core::fmt;

use crate::ptr_utils::byte_sum;

/// Value written to both fences of every header and of the heap state.
pub const FENCE: u32 = 0xA5C3_5A3C;

/// Link value of the left sentinel's `prev` and the right sentinel's `next`.
pub(crate) const NIL: usize = usize::MAX;

/// Size of a chunk header in bytes.
///
/// Every chunk, the two sentinels included, costs this much on top of its payload.
/// On 64-bit targets this is 64 bytes.
pub const HEADER_SIZE: usize = core::mem::size_of::<Header>();

const FREE_FLAG: u32 = 1;

const _: () = assert!(HEADER_SIZE % core::mem::size_of::<usize>() == 0);

/// Source location recorded against an allocation, shown by the debug dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
}

impl CallSite {
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    /// The location of whoever called the function this is invoked from.
    #[track_caller]
    pub fn caller() -> Self {
        let location = core::panic::Location::caller();
        Self { file: location.file(), line: location.line() }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A chunk header as it lies in the arena.
///
/// Only integers and raw pointers, so that any bit pattern, including one
/// produced by a stray write from a caller, can be read back for validation.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub(crate) struct Header {
    first_fence: u32,
    flags: u32,
    pub size: usize,
    pub next: usize,
    pub prev: usize,
    checksum: usize,
    site_file: *const u8,
    site_file_len: usize,
    site_line: u32,
    second_fence: u32,
}

impl Header {
    pub fn new(size: usize, free: bool, next: usize, prev: usize) -> Self {
        let mut header = Self {
            first_fence: FENCE,
            flags: 0,
            size,
            next,
            prev,
            checksum: 0,
            site_file: core::ptr::null(),
            site_file_len: 0,
            site_line: 0,
            second_fence: FENCE,
        };
        header.set_free(free);
        header.seal();
        header
    }

    /// A zero-sized, permanently used chunk bounding the arena.
    pub fn sentinel(next: usize, prev: usize) -> Self {
        Self::new(0, false, next, prev)
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.flags & FREE_FLAG != 0
    }

    #[inline]
    pub fn set_free(&mut self, free: bool) {
        if free {
            self.flags |= FREE_FLAG;
        } else {
            self.flags &= !FREE_FLAG;
        }
    }

    pub fn set_site(&mut self, site: Option<CallSite>) {
        match site {
            Some(site) => {
                self.site_file = site.file.as_ptr();
                self.site_file_len = site.file.len();
                self.site_line = site.line;
            }
            None => {
                self.site_file = core::ptr::null();
                self.site_file_len = 0;
                self.site_line = 0;
            }
        }
    }

    /// Recover the recorded call site.
    ///
    /// Returns `None` unless the header checksum holds, as a damaged header
    /// could otherwise produce a dangling string.
    pub fn site(&self) -> Option<CallSite> {
        if self.site_file.is_null() || !self.checksum_ok() {
            return None;
        }

        // SAFETY: sealed headers only ever carry pointers taken from `&'static str`s
        let file = unsafe {
            core::str::from_utf8_unchecked(core::slice::from_raw_parts(
                self.site_file,
                self.site_file_len,
            ))
        };

        Some(CallSite { file, line: self.site_line })
    }

    #[inline]
    pub fn fences_ok(&self) -> bool {
        self.first_fence == FENCE && self.second_fence == FENCE
    }

    #[inline]
    pub fn checksum_ok(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Byte sum over every field except the checksum itself.
    pub fn compute_checksum(&self) -> usize {
        [
            self.first_fence as usize,
            self.flags as usize,
            self.size,
            self.next,
            self.prev,
            self.site_file as usize,
            self.site_file_len,
            self.site_line as usize,
            self.second_fence as usize,
        ]
        .into_iter()
        .fold(0, |acc, field| acc.wrapping_add(byte_sum(field)))
    }

    #[inline]
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }
}
