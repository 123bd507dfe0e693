//! [`HeapLock`] shares a [`Heap`] between threads and lets it serve as a Rust
//! global allocator.
//!
//! See [`HeapLock`].

use core::{fmt, ptr::NonNull, ptr::null_mut};

use allocator_api2::alloc::{AllocError, Allocator, GlobalAlloc, Layout};

use crate::{
    CallSite, Heap, HeapError, HeapStats, PointerKind, ptr_utils::WORD_SIZE, source::PageSource,
};

#[cfg(all(feature = "system-backed", unix))]
use crate::source::MmapSource;

/// A [`Heap`] over virtual memory reserved from the operating system, behind a spin lock.
#[cfg(all(feature = "system-backed", unix))]
pub type SystemHeap = HeapLock<spin::Mutex<()>, MmapSource>;

#[cfg(all(feature = "system-backed", unix))]
static SYSTEM_HEAP: SystemHeap = HeapLock::new(MmapSource::new());

/// The process-wide heap, initialized on first use.
#[cfg(all(feature = "system-backed", unix))]
pub fn default_heap() -> Result<&'static SystemHeap, HeapError> {
    SYSTEM_HEAP.initialize()?;
    Ok(&SYSTEM_HEAP)
}

/// Wraps a mutex-locked [`Heap`].
///
/// Every operation holds the lock for its whole duration, page source requests
/// included. The lock is not reentrant, so a page source must never allocate
/// from the heap it serves.
///
/// # Example
/// ```rust
/// use brkheap::{HeapLock, Span, source::SpanSource};
///
/// static mut ARENA: [u8; 1 << 16] = [0; 1 << 16];
///
/// let span = Span::from(unsafe { core::ptr::addr_of_mut!(ARENA) } as *mut [u8]);
/// let heap = HeapLock::<spin::Mutex<()>, _>::new(unsafe { SpanSource::new(span) });
/// heap.initialize().unwrap();
///
/// let ptr = heap.allocate(100).unwrap();
/// assert_eq!(heap.block_size(ptr.as_ptr()), Some(104));
/// heap.release(ptr.as_ptr()).unwrap();
/// ```
pub struct HeapLock<R: lock_api::RawMutex, S: PageSource> {
    mutex: lock_api::Mutex<R, Heap<S>>,
}

impl<R: lock_api::RawMutex, S: PageSource> fmt::Debug for HeapLock<R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mutex.try_lock() {
            Some(heap) => f.debug_struct("HeapLock").field("heap", &*heap).finish(),
            None => f.write_str("HeapLock { <locked> }"),
        }
    }
}

impl<R: lock_api::RawMutex, S: PageSource> HeapLock<R, S> {
    /// Create a new [`HeapLock`] over an uninitialized heap.
    pub const fn new(source: S) -> Self {
        Self { mutex: lock_api::Mutex::new(Heap::new(source)) }
    }

    /// Lock the mutex and access the inner [`Heap`].
    #[track_caller]
    pub fn lock(&self) -> lock_api::MutexGuard<'_, R, Heap<S>> {
        self.mutex.lock()
    }

    /// Try to lock the mutex and access the inner [`Heap`].
    pub fn try_lock(&self) -> Option<lock_api::MutexGuard<'_, R, Heap<S>>> {
        self.mutex.try_lock()
    }

    /// Returns a mutable reference to the inner [`Heap`].
    ///
    /// This avoids locking, as having a mutable reference statically
    /// guarantees that `self` is not locked.
    pub fn get_mut(&mut self) -> &mut Heap<S> {
        self.mutex.get_mut()
    }

    /// Retrieve the inner [`Heap`].
    pub fn into_inner(self) -> Heap<S> {
        self.mutex.into_inner()
    }

    /// See [`Heap::initialize`].
    pub fn initialize(&self) -> Result<(), HeapError> {
        self.lock().initialize()
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().is_initialized()
    }

    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.lock().allocate(size, None)
    }

    /// [`HeapLock::allocate`], recording `site` against the block.
    pub fn allocate_at(&self, size: usize, site: CallSite) -> Result<NonNull<u8>, HeapError> {
        self.lock().allocate(size, Some(site))
    }

    pub fn allocate_zeroed(&self, count: usize, elem_size: usize) -> Result<NonNull<u8>, HeapError> {
        self.lock().allocate_zeroed(count, elem_size, None)
    }

    pub fn allocate_zeroed_at(
        &self,
        count: usize,
        elem_size: usize,
        site: CallSite,
    ) -> Result<NonNull<u8>, HeapError> {
        self.lock().allocate_zeroed(count, elem_size, Some(site))
    }

    pub fn reallocate(&self, ptr: *mut u8, size: usize) -> Result<Option<NonNull<u8>>, HeapError> {
        self.lock().reallocate(ptr, size, None)
    }

    pub fn reallocate_at(
        &self,
        ptr: *mut u8,
        size: usize,
        site: CallSite,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        self.lock().reallocate(ptr, size, Some(site))
    }

    pub fn release(&self, ptr: *mut u8) -> Result<(), HeapError> {
        self.lock().release(ptr)
    }

    pub fn allocate_aligned(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.lock().allocate_aligned(size, None)
    }

    pub fn allocate_aligned_at(&self, size: usize, site: CallSite) -> Result<NonNull<u8>, HeapError> {
        self.lock().allocate_aligned(size, Some(site))
    }

    pub fn allocate_zeroed_aligned(
        &self,
        count: usize,
        elem_size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        self.lock().allocate_zeroed_aligned(count, elem_size, None)
    }

    pub fn allocate_zeroed_aligned_at(
        &self,
        count: usize,
        elem_size: usize,
        site: CallSite,
    ) -> Result<NonNull<u8>, HeapError> {
        self.lock().allocate_zeroed_aligned(count, elem_size, Some(site))
    }

    pub fn reallocate_aligned(
        &self,
        ptr: *mut u8,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        self.lock().reallocate_aligned(ptr, size, None)
    }

    pub fn reallocate_aligned_at(
        &self,
        ptr: *mut u8,
        size: usize,
        site: CallSite,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        self.lock().reallocate_aligned(ptr, size, Some(site))
    }

    pub fn classify_pointer(&self, ptr: *const u8) -> PointerKind {
        self.lock().classify_pointer(ptr)
    }

    pub fn block_size(&self, ptr: *const u8) -> Option<usize> {
        self.lock().block_size(ptr)
    }

    pub fn data_block_start(&self, ptr: *const u8) -> Option<NonNull<u8>> {
        self.lock().data_block_start(ptr)
    }

    pub fn site_of(&self, ptr: *const u8) -> Option<CallSite> {
        self.lock().site_of(ptr)
    }

    pub fn stats(&self) -> HeapStats {
        self.lock().stats()
    }

    pub fn used_space(&self) -> usize {
        self.lock().used_space()
    }

    pub fn free_space(&self) -> usize {
        self.lock().free_space()
    }

    pub fn used_block_count(&self) -> usize {
        self.lock().used_block_count()
    }

    pub fn free_gap_count(&self) -> usize {
        self.lock().free_gap_count()
    }

    pub fn largest_used_block(&self) -> usize {
        self.lock().largest_used_block()
    }

    pub fn largest_free_block(&self) -> usize {
        self.lock().largest_free_block()
    }

    pub fn validate(&self) -> Result<(), HeapError> {
        self.lock().validate()
    }

    /// See [`Heap::dump_debug_info`]. The lock is held while writing to `out`.
    pub fn dump_debug_info<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        self.lock().dump_debug_info(out)
    }
}

/// Which of the heap's paths serves a given alignment, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    FirstFit,
    PageAligned,
}

fn route<S: PageSource>(align: usize) -> Option<Route> {
    if align <= WORD_SIZE {
        Some(Route::FirstFit)
    } else if align <= S::PAGE_SIZE {
        Some(Route::PageAligned)
    } else {
        None
    }
}

impl<S: PageSource> Heap<S> {
    fn allocate_layout(&mut self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        self.initialize()?;
        match route::<S>(layout.align()) {
            Some(Route::FirstFit) => self.allocate(layout.size(), None),
            Some(Route::PageAligned) => self.allocate_aligned(layout.size(), None),
            None => Err(HeapError::InvalidArgument),
        }
    }

    fn reallocate_layout(
        &mut self,
        ptr: *mut u8,
        layout: Layout,
        new_size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        let moved = match route::<S>(layout.align()) {
            Some(Route::FirstFit) => self.reallocate(ptr, new_size, None)?,
            Some(Route::PageAligned) => self.reallocate_aligned(ptr, new_size, None)?,
            None => return Err(HeapError::InvalidArgument),
        };
        moved.ok_or(HeapError::InvalidArgument)
    }
}

/// Layouts aligned to at most a word are served first fit. Anything aligned
/// past a word, up to a page, takes the page-aligned path, which places the
/// block on a page boundary and may carve off or grow the arena by a page to
/// do so. On 64-bit targets that includes every 16-byte aligned layout, such
/// as those of `u128`. Larger alignments are refused.
unsafe impl<R: lock_api::RawMutex, S: PageSource> GlobalAlloc for HeapLock<R, S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.lock().allocate_layout(layout).map_or(null_mut(), |nn| nn.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // nothing sensible can be done about a bad pointer here, the heap logs it
        let _ = self.lock().release(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.lock().reallocate_layout(ptr, layout, new_size).map_or(null_mut(), |nn| nn.as_ptr())
    }
}

#[inline(always)]
fn nonnull_slice_from_raw_parts(nn: NonNull<u8>, len: usize) -> NonNull<[u8]> {
    // SAFETY: if `nn` is non-null, then the resulting slice is non-null
    unsafe { NonNull::new_unchecked(core::ptr::slice_from_raw_parts_mut(nn.as_ptr(), len)) }
}

#[inline(always)]
fn dangling_for(layout: Layout) -> NonNull<u8> {
    // SAFETY: alignments are never zero
    unsafe { NonNull::new_unchecked(layout.align() as *mut u8) }
}

unsafe impl<R: lock_api::RawMutex, S: PageSource> Allocator for HeapLock<R, S> {
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(nonnull_slice_from_raw_parts(dangling_for(layout), 0));
        }

        self.lock()
            .allocate_layout(layout)
            .map(|nn| nonnull_slice_from_raw_parts(nn, layout.size()))
            .map_err(|_| AllocError)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            let _ = self.lock().release(ptr.as_ptr());
        }
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());

        if old_layout.size() == 0 {
            return Allocator::allocate(self, new_layout);
        }

        self.lock()
            .reallocate_layout(ptr.as_ptr(), new_layout, new_layout.size())
            .map(|nn| nonnull_slice_from_raw_parts(nn, new_layout.size()))
            .map_err(|_| AllocError)
    }

    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let res = self.grow(ptr, old_layout, new_layout);

        if let Ok(allocation) = res {
            allocation
                .as_ptr()
                .cast::<u8>()
                .add(old_layout.size())
                .write_bytes(0, new_layout.size() - old_layout.size());
        }

        res
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());

        if new_layout.size() == 0 {
            self.deallocate(ptr, old_layout);
            return Ok(nonnull_slice_from_raw_parts(dangling_for(new_layout), 0));
        }

        self.lock()
            .reallocate_layout(ptr.as_ptr(), new_layout, new_layout.size())
            .map(|nn| nonnull_slice_from_raw_parts(nn, new_layout.size()))
            .map_err(|_| AllocError)
    }
}
