//! First-fit allocation, release and the realloc decision table.

use core::{cmp::Ordering, ptr::NonNull};

use super::{CallSite, Heap, HEADER_SIZE};
use crate::{HeapError, logging::heap_log, ptr_utils::ceil_word, source::PageSource};

/// Allocator used when a reallocation has to move the block.
pub(crate) type Relocate<S> =
    fn(&mut Heap<S>, usize, Option<CallSite>) -> Result<NonNull<u8>, HeapError>;

impl<S: PageSource> Heap<S> {
    /// Allocate at least `size` bytes, rounded up to a word multiple.
    ///
    /// Takes the first free chunk large enough, growing the arena if there is none.
    /// On failure the heap is left untouched.
    pub fn allocate(
        &mut self,
        size: usize,
        site: Option<CallSite>,
    ) -> Result<NonNull<u8>, HeapError> {
        self.check_initialized()?;
        if size == 0 {
            heap_log!(warn, "refusing a zero-byte allocation");
            return Err(HeapError::InvalidArgument);
        }
        let size = ceil_word(size).ok_or(HeapError::Overflow)?;

        let chunk = match self.first_fit(size) {
            Some(chunk) => chunk,
            None => self.grow_for(size)?,
        };

        self.place(chunk, size, site);
        self.seal();

        let ptr = self.payload(chunk);
        heap_log!(trace, "allocated {} bytes at {:p}", size, ptr);
        Ok(ptr)
    }

    /// Allocate `count * elem_size` bytes and zero them.
    pub fn allocate_zeroed(
        &mut self,
        count: usize,
        elem_size: usize,
        site: Option<CallSite>,
    ) -> Result<NonNull<u8>, HeapError> {
        let size = count.checked_mul(elem_size).ok_or(HeapError::Overflow)?;
        let ptr = self.allocate(size, site)?;
        // SAFETY: the payload spans at least `size` bytes
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    /// Release the block whose payload starts at `ptr`.
    ///
    /// Null is ignored. Pointers that do not start a payload in this heap, or
    /// that start an already free one, are reported and otherwise ignored.
    pub fn release(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
        if ptr.is_null() {
            return Ok(());
        }
        self.check_initialized()?;

        let Some(chunk) = self.find_chunk(ptr) else {
            heap_log!(warn, "release of unknown pointer {:p}", ptr);
            return Err(HeapError::InvalidPointer);
        };

        // SAFETY: `chunk` was found in the list
        if unsafe { self.read(chunk) }.is_free() {
            heap_log!(warn, "double free of {:p}", ptr);
            return Err(HeapError::DoubleFree);
        }

        self.free_chunk(chunk);
        self.seal();

        heap_log!(trace, "released {:p}", ptr);
        Ok(())
    }

    /// Resize the block at `ptr` to `size` bytes, in place when the neighbourhood allows.
    ///
    /// A null `ptr` allocates. A zero `size` releases and yields `Ok(None)`.
    /// If the block has to move and no new block can be found, the old one is
    /// left intact and the error is returned.
    pub fn reallocate(
        &mut self,
        ptr: *mut u8,
        size: usize,
        site: Option<CallSite>,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        self.check_initialized()?;
        if ptr.is_null() {
            return self.allocate(size, site).map(Some);
        }
        if size == 0 {
            return self.release(ptr).map(|()| None);
        }

        let chunk = self.find_live(ptr)?;
        self.resize(chunk, size, site, Self::allocate).map(Some)
    }

    /// Look up a used chunk by payload pointer.
    pub(crate) fn find_live(&self, ptr: *mut u8) -> Result<usize, HeapError> {
        match self.find_chunk(ptr) {
            // SAFETY: `chunk` was found in the list
            Some(chunk) if !unsafe { self.read(chunk) }.is_free() => Ok(chunk),
            _ => {
                heap_log!(warn, "reallocation of unknown or free pointer {:p}", ptr);
                Err(HeapError::InvalidPointer)
            }
        }
    }

    pub(crate) fn first_fit(&self, size: usize) -> Option<usize> {
        self.chunks()
            .find(|(_, header)| header.is_free() && header.size >= size)
            .map(|(chunk, _)| chunk)
    }

    /// Grow the arena so that its last chunk is free and holds at least `size` bytes.
    fn grow_for(&mut self, size: usize) -> Result<usize, HeapError> {
        // SAFETY: the tail and its predecessor are part of the list
        let last = unsafe { self.read(self.read(self.tail).prev) };
        let tail_free = if last.is_free() { last.size } else { 0 };

        // a first-fit miss means the free tail is smaller than `size`
        let needed = (size - tail_free).checked_add(HEADER_SIZE).ok_or(HeapError::Overflow)?;
        let chunk = self.grow(needed.div_ceil(S::PAGE_SIZE))?;

        debug_assert!(unsafe { self.read(chunk) }.size >= size);
        Ok(chunk)
    }

    /// Hand out `chunk`, splitting off what the caller does not need.
    pub(crate) fn place(&mut self, chunk: usize, size: usize, site: Option<CallSite>) {
        // SAFETY: `chunk` is a free chunk from the list
        if unsafe { self.read(chunk) }.size - size > HEADER_SIZE {
            self.split(chunk, size);
        }
        self.mark_used(chunk, site);
    }

    /// The in-place resize decision table, falling back to `relocate`.
    pub(crate) fn resize(
        &mut self,
        chunk: usize,
        size: usize,
        site: Option<CallSite>,
        relocate: Relocate<S>,
    ) -> Result<NonNull<u8>, HeapError> {
        let size = ceil_word(size).ok_or(HeapError::Overflow)?;

        // SAFETY: `chunk` is a used chunk from the list, its successor is at worst the tail
        let (current, next) = unsafe {
            let current = self.read(chunk);
            (current, self.read(current.next))
        };

        match size.cmp(&current.size) {
            Ordering::Equal => {}
            Ordering::Greater => {
                let avail = current.size + HEADER_SIZE + next.size;
                if !next.is_free() || avail < size {
                    return self.relocate(chunk, current.size, size, site, relocate);
                }

                self.merge(chunk, current.next);
                if avail - size > HEADER_SIZE {
                    self.split(chunk, size);
                }
            }
            Ordering::Less => {
                if current.size - size > HEADER_SIZE {
                    let rest = self.split(chunk, size);
                    // SAFETY: `rest` was just linked in, its successor is at worst the tail
                    let after = unsafe { self.read(rest) }.next;
                    if unsafe { self.read(after) }.is_free() {
                        self.merge(rest, after);
                    }
                } else if next.is_free() {
                    self.shift_down(chunk, size);
                }
            }
        }

        self.mark_used(chunk, site);
        self.seal();

        let ptr = self.payload(chunk);
        heap_log!(trace, "resized {:p} in place to {} bytes", ptr, size);
        Ok(ptr)
    }

    /// Move the contents of `chunk` into a block obtained from `relocate`, then free `chunk`.
    pub(crate) fn relocate(
        &mut self,
        chunk: usize,
        old_size: usize,
        new_size: usize,
        site: Option<CallSite>,
        relocate: Relocate<S>,
    ) -> Result<NonNull<u8>, HeapError> {
        let new = relocate(self, new_size, site)?;
        let old = self.payload(chunk);

        // SAFETY: both payloads are live, distinct, and at least this long
        unsafe {
            new.as_ptr().copy_from_nonoverlapping(old.as_ptr(), old_size.min(new_size));
        }

        self.free_chunk(chunk);
        self.seal();

        heap_log!(trace, "moved {:p} to {:p} ({} bytes)", old, new, new_size);
        Ok(new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PointerKind, test_utils::TestArena};

    #[test]
    fn allocate_rounds_to_words() {
        let arena = TestArena::new(4);
        let mut heap = arena.heap();

        let ptr = heap.allocate(13, None).unwrap();
        assert_eq!(heap.block_size(ptr.as_ptr()), Some(16));
        assert_eq!(ptr.as_ptr() as usize % crate::ptr_utils::WORD_SIZE, 0);
        assert_eq!(heap.used_block_count(), 3);
        heap.validate().unwrap();
    }

    #[test]
    fn allocate_rejects_bad_sizes() {
        let arena = TestArena::new(4);
        let mut heap = arena.heap();
        let before = heap.stats();

        assert_eq!(heap.allocate(0, None), Err(HeapError::InvalidArgument));
        assert_eq!(heap.allocate(usize::MAX, None), Err(HeapError::Overflow));
        assert_eq!(heap.allocate(usize::MAX - 64, None), Err(HeapError::Overflow));
        assert_eq!(heap.allocate(1 << 40, None), Err(HeapError::OutOfMemory));
        assert_eq!(heap.allocate_zeroed(usize::MAX, 2, None), Err(HeapError::Overflow));
        assert_eq!(heap.allocate_zeroed(0, 8, None), Err(HeapError::InvalidArgument));

        assert_eq!(heap.stats(), before);
        assert_eq!(heap.arena().size(), 4096);
        heap.validate().unwrap();
    }

    #[test]
    fn whole_chunk_when_leftover_is_small() {
        let arena = TestArena::new(4);
        let mut heap = arena.heap();

        let whole = 4096 - 3 * HEADER_SIZE;
        let ptr = heap.allocate(whole - HEADER_SIZE, None).unwrap();

        assert_eq!(heap.block_size(ptr.as_ptr()), Some(whole));
        assert_eq!(heap.free_gap_count(), 0);
        heap.validate().unwrap();
    }

    #[test]
    fn allocation_grows_on_miss() {
        let arena = TestArena::new(8);
        let mut heap = arena.heap();

        let a = heap.allocate(3000, None).unwrap();
        let b = heap.allocate(3000, None).unwrap();

        assert_eq!(heap.arena().size(), 2 * 4096);
        assert_eq!(heap.used_block_count(), 4);
        assert_eq!(heap.free_gap_count(), 1);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 3000 + HEADER_SIZE);
        heap.validate().unwrap();
    }

    #[test]
    fn allocate_zeroed_clears_reused_memory() {
        let arena = TestArena::new(4);
        let mut heap = arena.heap();

        let dirty = heap.allocate(256, None).unwrap();
        unsafe { dirty.as_ptr().write_bytes(0xAB, 256) };
        heap.release(dirty.as_ptr()).unwrap();

        let clean = heap.allocate_zeroed(32, 8, None).unwrap();
        assert_eq!(clean, dirty);
        let bytes = unsafe { core::slice::from_raw_parts(clean.as_ptr(), 256) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn release_coalesces_both_sides() {
        let arena = TestArena::new(4);
        let mut heap = arena.heap();

        let a = heap.allocate(64, None).unwrap();
        let b = heap.allocate(64, None).unwrap();
        let c = heap.allocate(64, None).unwrap();
        let _d = heap.allocate(64, None).unwrap();
        assert_eq!(heap.free_gap_count(), 1);

        heap.release(a.as_ptr()).unwrap();
        heap.release(c.as_ptr()).unwrap();
        assert_eq!(heap.free_gap_count(), 3);

        heap.release(b.as_ptr()).unwrap();
        assert_eq!(heap.free_gap_count(), 2);
        // `b`'s and `c`'s headers now lie inside `a`'s free payload
        let b_header = b.as_ptr().wrapping_sub(HEADER_SIZE);
        assert_eq!(heap.classify_pointer(b_header), PointerKind::Unallocated);
        assert_eq!(heap.data_block_start(b_header), None);
        heap.validate().unwrap();
    }

    #[test]
    fn release_rejects_foreign_and_repeated_pointers() {
        let arena = TestArena::new(4);
        let mut heap = arena.heap();

        assert_eq!(heap.release(core::ptr::null_mut()), Ok(()));

        let a = heap.allocate(64, None).unwrap();
        let _b = heap.allocate(64, None).unwrap();

        assert_eq!(heap.release(a.as_ptr().wrapping_add(8)), Err(HeapError::InvalidPointer));
        let mut local = 0u8;
        assert_eq!(heap.release(&mut local), Err(HeapError::InvalidPointer));

        heap.release(a.as_ptr()).unwrap();
        let (used, free) = (heap.used_block_count(), heap.free_gap_count());

        assert_eq!(heap.release(a.as_ptr()), Err(HeapError::DoubleFree));
        assert_eq!(heap.used_block_count(), used);
        assert_eq!(heap.free_gap_count(), free);
        heap.validate().unwrap();
    }

    #[test]
    fn release_after_coalescing_is_invalid() {
        let arena = TestArena::new(4);
        let mut heap = arena.heap();

        let a = heap.allocate(64, None).unwrap();
        let b = heap.allocate(64, None).unwrap();
        heap.release(b.as_ptr()).unwrap();
        heap.release(a.as_ptr()).unwrap();

        // `b`'s header was absorbed by `a`
        assert_eq!(heap.release(b.as_ptr()), Err(HeapError::InvalidPointer));
        assert_eq!(heap.used_block_count(), 2);
        assert_eq!(heap.free_gap_count(), 1);
    }

    #[test]
    fn reallocate_null_and_zero() {
        let arena = TestArena::new(4);
        let mut heap = arena.heap();

        let ptr = heap.reallocate(core::ptr::null_mut(), 40, None).unwrap().unwrap();
        assert_eq!(heap.used_block_count(), 3);

        assert_eq!(heap.reallocate(ptr.as_ptr(), 0, None), Ok(None));
        assert_eq!(heap.used_block_count(), 2);
        assert_eq!(heap.free_gap_count(), 1);

        assert_eq!(heap.reallocate(ptr.as_ptr(), 16, None), Err(HeapError::InvalidPointer));
    }

    #[test]
    fn reallocate_same_size_restamps() {
        let arena = TestArena::new(4);
        let mut heap = arena.heap();
        let site = CallSite::new("resize.rs", 3);

        let ptr = heap.allocate(60, None).unwrap();
        let same = heap.reallocate(ptr.as_ptr(), 57, Some(site)).unwrap().unwrap();

        assert_eq!(same, ptr);
        assert_eq!(heap.site_of(ptr.as_ptr()), Some(site));
    }

    #[test]
    fn reallocate_grows_into_free_successor() {
        let arena = TestArena::new(4);
        let mut heap = arena.heap();

        let a = heap.allocate(64, None).unwrap();
        let b = heap.allocate(64, None).unwrap();
        let _c = heap.allocate(64, None).unwrap();
        heap.release(b.as_ptr()).unwrap();

        // exactly fits: the successor disappears
        let grown = heap.reallocate(a.as_ptr(), 64 + HEADER_SIZE + 64, None).unwrap().unwrap();
        assert_eq!(grown, a);
        assert_eq!(heap.free_gap_count(), 1);
        assert_eq!(heap.block_size(a.as_ptr()), Some(128 + HEADER_SIZE));
        heap.validate().unwrap();
    }

    #[test]
    fn reallocate_grows_and_splits_successor() {
        let arena = TestArena::new(4);
        let mut heap = arena.heap();

        let a = heap.allocate(64, None).unwrap();
        let free_before = heap.largest_free_block();

        let grown = heap.reallocate(a.as_ptr(), 512, None).unwrap().unwrap();
        assert_eq!(grown, a);
        assert_eq!(heap.block_size(a.as_ptr()), Some(512));
        assert_eq!(heap.largest_free_block(), free_before - (512 - 64));
        heap.validate().unwrap();
    }

    #[test]
    fn reallocate_moves_when_boxed_in() {
        let arena = TestArena::new(4);
        let mut heap = arena.heap();

        let a = heap.allocate(32, None).unwrap();
        let _b = heap.allocate(32, None).unwrap();
        unsafe {
            for i in 0..32 {
                a.as_ptr().add(i).write(i as u8);
            }
        }

        let moved = heap.reallocate(a.as_ptr(), 200, None).unwrap().unwrap();
        assert_ne!(moved, a);
        let bytes = unsafe { core::slice::from_raw_parts(moved.as_ptr(), 32) };
        assert!(bytes.iter().enumerate().all(|(i, &b)| b == i as u8));

        assert_eq!(heap.classify_pointer(a.as_ptr()), PointerKind::Unallocated);
        heap.validate().unwrap();
    }

    #[test]
    fn failed_move_keeps_the_block() {
        let arena = TestArena::new(2);
        let mut heap = arena.heap();

        let a = heap.allocate(32, None).unwrap();
        let _b = heap.allocate(32, None).unwrap();
        let before = heap.stats();

        assert_eq!(heap.reallocate(a.as_ptr(), 1 << 20, None), Err(HeapError::OutOfMemory));
        assert_eq!(heap.stats(), before);
        assert_eq!(heap.classify_pointer(a.as_ptr()), PointerKind::ValidPayloadStart);
        heap.validate().unwrap();
    }

    #[test]
    fn reallocate_shrink_splits_and_coalesces() {
        let arena = TestArena::new(4);
        let mut heap = arena.heap();

        let a = heap.allocate(1024, None).unwrap();
        assert_eq!(heap.free_gap_count(), 1);

        let shrunk = heap.reallocate(a.as_ptr(), 256, None).unwrap().unwrap();
        assert_eq!(shrunk, a);
        assert_eq!(heap.block_size(a.as_ptr()), Some(256));
        // the cut-off tail merged with the free space behind it
        assert_eq!(heap.free_gap_count(), 1);
        assert_eq!(heap.largest_free_block(), 4096 - 4 * HEADER_SIZE - 256);
        heap.validate().unwrap();
    }

    #[test]
    fn reallocate_small_shrink() {
        let arena = TestArena::new(4);
        let mut heap = arena.heap();

        let a = heap.allocate(256, None).unwrap();
        let b = heap.allocate(256, None).unwrap();
        let _c = heap.allocate(256, None).unwrap();

        // boxed in: the slack stays with the block
        assert_eq!(heap.reallocate(a.as_ptr(), 256 - 16, None), Ok(Some(a)));
        assert_eq!(heap.block_size(a.as_ptr()), Some(256));

        // free successor: the slack moves over to it
        heap.release(b.as_ptr()).unwrap();
        let free_space = heap.free_space();
        assert_eq!(heap.reallocate(a.as_ptr(), 256 - 16, None), Ok(Some(a)));
        assert_eq!(heap.block_size(a.as_ptr()), Some(256 - 16));
        assert_eq!(heap.free_gap_count(), 2);
        assert_eq!(heap.free_space(), free_space + 16);
        heap.validate().unwrap();
    }
}
