//! The unsynchronized heap: arena bookkeeping, the chunk list and its split/merge primitives.
//!
//! The arena is a single contiguous range obtained page by page from a
//! [`PageSource`]. It is tiled, without gaps, by chunks: a [`HEADER_SIZE`]-byte
//! header followed by `size` bytes of payload. A zero-sized, permanently used
//! sentinel chunk sits at either end.
//!
//! ```not_rust
//! base                                                              acme
//! | head | hdr | payload | hdr | payload ... | hdr | payload | tail |
//! ```
//!
//! Chunks refer to each other by their byte offset from the arena base, so
//! only payload pointers ever leave the heap.

mod aligned;
mod alloc;
mod header;
mod integrity;
mod list;
mod stats;

use core::ptr::NonNull;

pub use header::{CallSite, FENCE, HEADER_SIZE};
pub use integrity::PointerKind;
pub use stats::HeapStats;

use header::{Header, NIL};

use crate::{HeapError, Span, logging::heap_log, ptr_utils::byte_sum, source::PageSource};

/// A fenced, checksummed first-fit heap over a single page-grown arena.
///
/// All operations take `&mut self`; wrap it in a [`HeapLock`](crate::HeapLock)
/// to share it between threads or to use it as the global allocator.
///
/// Every mutating operation leaves the heap state resealed, so that
/// [`Heap::validate`] can tell deliberate changes from stray writes.
#[derive(Debug)]
pub struct Heap<S: PageSource> {
    first_fence: u32,
    initialized: bool,
    arena: Span,
    head: usize,
    tail: usize,
    free_count: usize,
    used_count: usize,
    checksum: usize,
    second_fence: u32,

    source: S,
}

impl<S: PageSource> Heap<S> {
    /// Create an uninitialized heap. No memory is requested until [`Heap::initialize`].
    pub const fn new(source: S) -> Self {
        Self {
            first_fence: FENCE,
            initialized: false,
            arena: Span::empty(),
            head: 0,
            tail: 0,
            free_count: 0,
            used_count: 0,
            checksum: 0,
            second_fence: FENCE,
            source,
        }
    }

    /// Obtain the first page and lay out the two sentinels around one free chunk.
    ///
    /// Calling this on an initialized heap does nothing and succeeds.
    pub fn initialize(&mut self) -> Result<(), HeapError> {
        if self.initialized {
            return Ok(());
        }

        let page = S::PAGE_SIZE;
        debug_assert!(page > 3 * HEADER_SIZE);
        debug_assert!(page % crate::ptr_utils::WORD_SIZE == 0);

        // SAFETY: nothing has been granted yet, so there is nothing to disturb
        let Some(base) = (unsafe { self.source.grant(page as isize) }) else {
            heap_log!(warn, "page source denied the initial page");
            return Err(HeapError::OutOfMemory);
        };

        self.arena = Span::from_base_size(base.as_ptr(), page);
        self.head = 0;
        self.tail = page - HEADER_SIZE;
        self.free_count = 1;
        self.used_count = 2;
        self.initialized = true;
        self.first_fence = FENCE;
        self.second_fence = FENCE;

        let first = HEADER_SIZE;
        // SAFETY: all three offsets lie within the freshly granted page
        unsafe {
            self.write(self.head, Header::sentinel(first, NIL));
            self.write(first, Header::new(page - 3 * HEADER_SIZE, true, self.tail, self.head));
            self.write(self.tail, Header::sentinel(NIL, first));
        }
        self.seal();

        heap_log!(debug, "heap initialized at {}", self.arena);
        Ok(())
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The memory currently owned by the heap.
    #[inline]
    pub fn arena(&self) -> Span {
        self.arena
    }

    /// The page source the arena grows from.
    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Mutable access to the page source.
    ///
    /// # Safety
    /// The source must not be replaced, dropped or moved out of, and must not
    /// have its break moved, while the heap is initialized. The arena lives in
    /// memory the source granted.
    #[inline]
    pub unsafe fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    #[inline]
    pub(crate) fn check_initialized(&self) -> Result<(), HeapError> {
        if self.initialized {
            Ok(())
        } else {
            heap_log!(warn, "heap isn't initialized");
            Err(HeapError::NotInitialized)
        }
    }

    #[inline]
    fn header_ptr(&self, chunk: usize) -> *mut Header {
        self.arena.base().wrapping_add(chunk).cast()
    }

    /// Copy the header at `chunk` out of the arena.
    ///
    /// # Safety
    /// `chunk` must satisfy [`Heap::holds_header`].
    #[inline]
    pub(crate) unsafe fn read(&self, chunk: usize) -> Header {
        debug_assert!(self.holds_header(chunk));
        self.header_ptr(chunk).read()
    }

    /// Reseal `header` and store it at `chunk`.
    ///
    /// # Safety
    /// `chunk` must satisfy [`Heap::holds_header`] and must not overlap a live payload.
    #[inline]
    pub(crate) unsafe fn write(&mut self, chunk: usize, mut header: Header) {
        debug_assert!(self.holds_header(chunk));
        header.seal();
        self.header_ptr(chunk).write(header);
    }

    /// Pointer to the payload of `chunk`.
    #[inline]
    pub(crate) fn payload(&self, chunk: usize) -> NonNull<u8> {
        debug_assert!(self.initialized);
        // SAFETY: an initialized heap's arena base is non-null
        unsafe { NonNull::new_unchecked(self.arena.base().wrapping_add(chunk + HEADER_SIZE)) }
    }

    fn state_checksum(&self) -> usize {
        [
            self.first_fence as usize,
            self.initialized as usize,
            self.arena.base() as usize,
            self.arena.acme() as usize,
            self.head,
            self.tail,
            self.free_count,
            self.used_count,
            self.second_fence as usize,
        ]
        .into_iter()
        .fold(0, |acc, field| acc.wrapping_add(byte_sum(field)))
    }

    /// Recompute the heap state checksum after a mutation.
    #[inline]
    pub(crate) fn seal(&mut self) {
        self.checksum = self.state_checksum();
    }

    /// Flag `chunk` as free and clear its call site.
    pub(crate) fn mark_free(&mut self, chunk: usize) {
        // SAFETY: callers pass chunks taken from the list
        let mut header = unsafe { self.read(chunk) };
        if !header.is_free() {
            header.set_free(true);
            self.used_count -= 1;
            self.free_count += 1;
        }
        header.set_site(None);
        unsafe { self.write(chunk, header) };
    }

    /// Flag `chunk` as used and record `site` against it.
    pub(crate) fn mark_used(&mut self, chunk: usize, site: Option<CallSite>) {
        // SAFETY: callers pass chunks taken from the list
        let mut header = unsafe { self.read(chunk) };
        if header.is_free() {
            header.set_free(false);
            self.free_count -= 1;
            self.used_count += 1;
        }
        header.set_site(site);
        unsafe { self.write(chunk, header) };
    }

    /// Keep `keep` bytes of `chunk` and carve the remainder into a new free chunk after it.
    ///
    /// The remainder must be able to host a header: `size - keep > HEADER_SIZE`.
    pub(crate) fn split(&mut self, chunk: usize, keep: usize) -> usize {
        // SAFETY: callers pass chunks taken from the list, and the new header
        // lands inside `chunk`'s payload beyond the kept bytes
        let rest = unsafe {
            let mut header = self.read(chunk);
            debug_assert!(header.size > keep && header.size - keep > HEADER_SIZE);

            let rest = chunk + HEADER_SIZE + keep;
            self.write(rest, Header::new(header.size - keep - HEADER_SIZE, true, header.next, chunk));

            let mut next = self.read(header.next);
            next.prev = rest;
            self.write(header.next, next);

            header.size = keep;
            header.next = rest;
            self.write(chunk, header);
            rest
        };

        self.free_count += 1;
        rest
    }

    /// Fuse `second` (which must be `first`'s successor) into `first`, leaving `first` free.
    pub(crate) fn merge(&mut self, first: usize, second: usize) {
        // SAFETY: callers pass adjacent chunks taken from the list
        unsafe {
            let mut header = self.read(first);
            let absorbed = self.read(second);
            debug_assert_eq!(header.next, second);

            header.size += absorbed.size + HEADER_SIZE;
            header.next = absorbed.next;
            self.write(first, header);

            let mut next = self.read(absorbed.next);
            next.prev = first;
            self.write(absorbed.next, next);

            if absorbed.is_free() {
                self.free_count -= 1;
            } else {
                self.used_count -= 1;
            }
        }

        self.mark_free(first);
    }

    /// Move the header following `chunk` back so that `chunk` shrinks to `keep`
    /// and its free successor absorbs the difference.
    pub(crate) fn shift_down(&mut self, chunk: usize, keep: usize) {
        // SAFETY: callers pass a used chunk taken from the list whose successor
        // is free; the moved header overlaps only bytes `chunk` gives up and
        // the old header, which has already been copied out
        unsafe {
            let mut header = self.read(chunk);
            let old = header.next;
            let successor = self.read(old);
            debug_assert!(successor.is_free());

            let slack = header.size - keep;
            let moved = old - slack;
            self.write(moved, Header::new(successor.size + slack, true, successor.next, chunk));

            let mut after = self.read(successor.next);
            after.prev = moved;
            self.write(successor.next, after);

            header.size = keep;
            header.next = moved;
            self.write(chunk, header);
        }
    }

    /// Free a used chunk, coalescing with its neighbours. Returns the surviving chunk.
    pub(crate) fn free_chunk(&mut self, chunk: usize) -> usize {
        // SAFETY: callers pass a used chunk taken from the list
        unsafe {
            let next = self.read(chunk).next;
            if self.read(next).is_free() {
                self.merge(chunk, next);
            }

            let prev = self.read(chunk).prev;
            if self.read(prev).is_free() {
                self.merge(prev, chunk);
                return prev;
            }
        }

        self.mark_free(chunk);
        chunk
    }

    /// Append `pages` pages to the arena. The old right sentinel becomes a free
    /// chunk spanning the new bytes, coalesced with a free predecessor.
    ///
    /// Returns the last chunk before the new sentinel, which is free.
    pub(crate) fn grow(&mut self, pages: usize) -> Result<usize, HeapError> {
        let bytes = pages
            .checked_mul(S::PAGE_SIZE)
            .filter(|&bytes| bytes <= isize::MAX as usize)
            .ok_or(HeapError::Overflow)?;

        // SAFETY: the arena is initialized and owns everything granted so far
        let Some(granted) = (unsafe { self.source.grant(bytes as isize) }) else {
            heap_log!(warn, "page source denied {} more pages", pages);
            return Err(HeapError::OutOfMemory);
        };

        if granted.as_ptr() != self.arena.acme() {
            heap_log!(warn, "page source returned discontiguous memory at {:p}", granted);
            // SAFETY: handing back exactly what was just granted
            if unsafe { self.source.grant(-(bytes as isize)) }.is_none() {
                heap_log!(error, "page source refused to take back {} discontiguous bytes", bytes);
            }
            return Err(HeapError::OutOfMemory);
        }

        let old_tail = self.tail;
        let new_tail = old_tail + bytes;
        self.arena = self.arena.extend(bytes);
        self.tail = new_tail;

        // SAFETY: both offsets lie within the extended arena
        let last = unsafe {
            let sentinel = self.read(old_tail);
            self.write(old_tail, Header::new(bytes - HEADER_SIZE, true, new_tail, sentinel.prev));
            self.write(new_tail, Header::sentinel(NIL, old_tail));
            self.free_count += 1;

            if self.read(sentinel.prev).is_free() {
                self.merge(sentinel.prev, old_tail);
                sentinel.prev
            } else {
                old_tail
            }
        };

        self.seal();
        heap_log!(debug, "grew the arena by {} pages to {}", pages, self.arena);
        Ok(last)
    }

    /// Undo `pages` pages of growth since the right sentinel sat at `old_tail`.
    ///
    /// Every byte granted since must belong to the last chunk, which is free.
    pub(crate) fn rollback_growth(&mut self, old_tail: usize, pages: usize) {
        let bytes = pages * S::PAGE_SIZE;

        // SAFETY: `old_tail` and the current last chunk lie within the arena
        let returned = unsafe {
            let last = self.read(self.tail).prev;
            let mut header = self.read(last);
            debug_assert!(header.is_free());

            if last == old_tail {
                self.write(old_tail, Header::sentinel(NIL, header.prev));
                self.free_count -= 1;
            } else {
                header.size -= bytes;
                header.next = old_tail;
                self.write(last, header);
                self.write(old_tail, Header::sentinel(NIL, last));
            }

            self.tail = old_tail;
            self.arena = self.arena.truncate(bytes);
            self.source.grant(-(bytes as isize))
        };

        self.seal();
        if returned.is_none() {
            heap_log!(error, "page source refused to take back {} bytes, its break is past the arena", bytes);
        }
        heap_log!(debug, "rolled back {} speculative pages, arena is {}", pages, self.arena);
    }
}

// SAFETY: the heap exclusively owns its arena
unsafe impl<S: PageSource + Send> Send for Heap<S> {}
