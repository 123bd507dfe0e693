//! Page-aligned allocation: carving aligned blocks out of free chunks, with
//! transactional arena growth.

use core::ptr::NonNull;

use super::{CallSite, Heap, HEADER_SIZE};
use crate::{
    HeapError,
    logging::heap_log,
    ptr_utils::{align_up_checked, ceil_word, is_aligned_to},
    source::PageSource,
};

impl<S: PageSource> Heap<S> {
    /// Allocate at least `size` bytes whose payload starts on a page boundary.
    ///
    /// If no free chunk can host such a block, the arena grows one page at a
    /// time until one can. Should the page source give out first, every page
    /// granted during the attempt is handed back before returning.
    pub fn allocate_aligned(
        &mut self,
        size: usize,
        site: Option<CallSite>,
    ) -> Result<NonNull<u8>, HeapError> {
        self.check_initialized()?;
        if size == 0 {
            heap_log!(warn, "refusing a zero-byte aligned allocation");
            return Err(HeapError::InvalidArgument);
        }
        let size = ceil_word(size).ok_or(HeapError::Overflow)?;

        let chunk = match self.first_aligned(size, site) {
            Some(chunk) => chunk,
            None => self.grow_for_aligned(size, site)?,
        };
        self.seal();

        let ptr = self.payload(chunk);
        heap_log!(trace, "allocated {} page-aligned bytes at {:p}", size, ptr);
        Ok(ptr)
    }

    /// Allocate `count * elem_size` page-aligned bytes and zero them.
    pub fn allocate_zeroed_aligned(
        &mut self,
        count: usize,
        elem_size: usize,
        site: Option<CallSite>,
    ) -> Result<NonNull<u8>, HeapError> {
        let size = count.checked_mul(elem_size).ok_or(HeapError::Overflow)?;
        let ptr = self.allocate_aligned(size, site)?;
        // SAFETY: the payload spans at least `size` bytes
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    /// [`Heap::reallocate`] for page-aligned blocks.
    ///
    /// A block that does not start on a page boundary is always moved into a
    /// freshly aligned one. Otherwise the in-place rules apply, and a block that
    /// has to move goes to a page-aligned address.
    pub fn reallocate_aligned(
        &mut self,
        ptr: *mut u8,
        size: usize,
        site: Option<CallSite>,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        self.check_initialized()?;
        if ptr.is_null() {
            return self.allocate_aligned(size, site).map(Some);
        }
        if size == 0 {
            return self.release(ptr).map(|()| None);
        }

        let chunk = self.find_live(ptr)?;

        if !is_aligned_to(ptr, S::PAGE_SIZE) {
            let size = ceil_word(size).ok_or(HeapError::Overflow)?;
            // SAFETY: `chunk` was found in the list
            let old_size = unsafe { self.read(chunk) }.size;
            return self.relocate(chunk, old_size, size, site, Self::allocate_aligned).map(Some);
        }

        self.resize(chunk, size, site, Self::allocate_aligned).map(Some)
    }

    fn first_aligned(&mut self, size: usize, site: Option<CallSite>) -> Option<usize> {
        // SAFETY: the heap is initialized and every link followed is part of the list
        let mut chunk = unsafe { self.read(self.head) }.next;
        while chunk != self.tail {
            if let Some(block) = self.carve_aligned(chunk, size, site) {
                return Some(block);
            }
            chunk = unsafe { self.read(chunk) }.next;
        }
        None
    }

    /// Try to hand out a page-aligned block of `size` bytes from `chunk`.
    ///
    /// The heap is only modified on success. Any unaligned prefix stays behind
    /// as a free chunk, as does any suffix large enough to host a header.
    fn carve_aligned(&mut self, chunk: usize, size: usize, site: Option<CallSite>) -> Option<usize> {
        // SAFETY: callers pass chunks taken from the list
        let header = unsafe { self.read(chunk) };
        if !header.is_free() || header.size < size {
            return None;
        }

        let start = self.payload(chunk).as_ptr() as usize;
        if start % S::PAGE_SIZE == 0 {
            self.place(chunk, size, site);
            return Some(chunk);
        }

        // the aligned block needs its own header in front of it
        let aligned = align_up_checked(start.checked_add(HEADER_SIZE)?, S::PAGE_SIZE)?;
        let end = start + header.size;
        if aligned.checked_add(size)? > end {
            return None;
        }

        let prefix = aligned - HEADER_SIZE - start;
        let block = self.split(chunk, prefix);
        self.place(block, size, site);
        Some(block)
    }

    /// Grow page by page until the last chunk can host an aligned block, or roll back.
    fn grow_for_aligned(&mut self, size: usize, site: Option<CallSite>) -> Result<usize, HeapError> {
        let old_tail = self.tail;
        let mut pages = 0;

        loop {
            let last = match self.grow(1) {
                Ok(last) => last,
                Err(err) => {
                    if pages > 0 {
                        self.rollback_growth(old_tail, pages);
                    }
                    heap_log!(warn, "no room for {} page-aligned bytes", size);
                    return Err(err);
                }
            };
            pages += 1;

            // growth only ever changes the last chunk
            if let Some(chunk) = self.carve_aligned(last, size, site) {
                return Ok(chunk);
            }
        }
    }
}
