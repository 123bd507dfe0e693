//! Where the heap's pages come from.
//!
//! The heap asks a [`PageSource`] for more memory whenever it runs out, and
//! hands pages back only to undo growth it could not use.

use core::{fmt::Debug, ptr::NonNull};

use crate::{Span, ptr_utils};

#[cfg(all(feature = "system-backed", unix))]
mod unix;

#[cfg(all(feature = "system-backed", unix))]
pub use unix::MmapSource;

/// A break-style memory source that grows and shrinks at one end.
///
/// # Safety
/// Implementors must ensure that:
/// * a successful positive grant of `n` bytes returns the start of `n` readable
///   and writable bytes, aligned to [`PageSource::PAGE_SIZE`] for the first grant
///   and contiguous with the previous grant afterwards,
/// * a negative grant of `n` bytes only ever gives up the `n` most recently granted bytes,
/// * granted memory stays valid until it is given back or the source is dropped,
/// * `grant` never calls into the heap that owns the source, directly or through
///   the global allocator.
pub unsafe trait PageSource: Debug {
    /// The unit the arena grows by.
    const PAGE_SIZE: usize = 4096;

    /// Move the break by `delta` bytes.
    ///
    /// For positive `delta`, returns the start of the new bytes. For negative
    /// `delta`, returns the new break. Returns `None` if the request cannot be met,
    /// in which case nothing changes.
    ///
    /// # Safety
    /// A negative `delta` must not exceed what was granted, and the given-back
    /// bytes must no longer be in use.
    unsafe fn grant(&mut self, delta: isize) -> Option<NonNull<u8>>;
}

/// Never provides memory. A heap over it cannot even be initialized.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPages;

// SAFETY: never grants anything
unsafe impl PageSource for NoPages {
    #[inline]
    unsafe fn grant(&mut self, _delta: isize) -> Option<NonNull<u8>> {
        None
    }
}

/// Hands out pages from a fixed span of memory, such as a static array.
///
/// The start of the span is rounded up to a page boundary on first use.
/// Once the span is exhausted, requests fail.
///
/// # Example
/// ```
/// use brkheap::{Heap, Span, source::SpanSource};
///
/// static mut ARENA: [u8; 10000] = [0; 10000];
///
/// let span = Span::from(unsafe { core::ptr::addr_of_mut!(ARENA) } as *mut [u8]);
/// let mut heap = Heap::new(unsafe { SpanSource::new(span) });
/// heap.initialize().unwrap();
/// ```
#[derive(Debug)]
pub struct SpanSource {
    span: Span,
    start: *mut u8,
    brk: *mut u8,
}

// SAFETY: the source has exclusive access to its span
unsafe impl Send for SpanSource {}

impl SpanSource {
    /// # Safety
    /// `span` must be valid for reads and writes, and unused by anything else,
    /// for as long as the source or memory granted from it is in use.
    pub const unsafe fn new(span: Span) -> Self {
        Self { span, start: core::ptr::null_mut(), brk: core::ptr::null_mut() }
    }

    /// The bytes granted and not given back.
    pub fn granted(&self) -> Span {
        Span::new(self.start, self.brk)
    }

    /// The bytes still available.
    pub fn remaining(&self) -> usize {
        if self.start.is_null() {
            let start = ptr_utils::align_up_by(self.span.base(), Self::PAGE_SIZE - 1);
            Span::new(start, self.span.acme()).size()
        } else {
            Span::new(self.brk, self.span.acme()).size()
        }
    }
}

// SAFETY: the break only moves within the span, and only downwards by as much
// as it has previously moved upwards
unsafe impl PageSource for SpanSource {
    unsafe fn grant(&mut self, delta: isize) -> Option<NonNull<u8>> {
        if self.start.is_null() {
            if self.span.is_empty() {
                return None;
            }
            let start = ptr_utils::align_up_by(self.span.base(), Self::PAGE_SIZE - 1);
            if start as usize > self.span.acme() as usize {
                return None;
            }
            self.start = start;
            self.brk = start;
        }

        if delta >= 0 {
            let old = self.brk;
            if delta as usize > self.span.acme() as usize - old as usize {
                return None;
            }
            self.brk = old.wrapping_add(delta as usize);
            NonNull::new(old)
        } else {
            let back = delta.unsigned_abs();
            if back > self.brk as usize - self.start as usize {
                return None;
            }
            self.brk = self.brk.wrapping_sub(back);
            NonNull::new(self.brk)
        }
    }
}
