//! Test scaffolding: page-aligned arenas owned for the duration of a test.

use std::alloc::Layout;

use crate::{Heap, Span, source::SpanSource};

const PAGE: usize = 4096;

/// A zeroed, page-aligned allocation from the system allocator, freed on drop.
///
/// Declare it before any heap built over it, so that the heap is dropped first.
pub struct TestArena {
    base: *mut u8,
    layout: Layout,
}

impl TestArena {
    pub fn new(pages: usize) -> Self {
        init_logger();

        let layout = Layout::from_size_align(pages * PAGE, PAGE).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());
        Self { base, layout }
    }

    pub fn span(&self) -> Span {
        Span::from_base_size(self.base, self.layout.size())
    }

    pub fn source(&self) -> SpanSource {
        unsafe { SpanSource::new(self.span()) }
    }

    /// An initialized heap over the whole arena.
    pub fn heap(&self) -> Heap<SpanSource> {
        let mut heap = Heap::new(self.source());
        heap.initialize().unwrap();
        heap
    }
}

impl Drop for TestArena {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.base, self.layout) };
    }
}

/// Route heap logs to stderr, filtered by `RUST_LOG`.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
