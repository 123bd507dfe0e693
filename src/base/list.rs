//! Walking the chunk list.

use super::header::{Header, HEADER_SIZE, NIL};
use super::Heap;
use crate::source::PageSource;

/// Iterator over `(offset, header)` pairs in list order.
///
/// Stops on reaching `stop`, or as soon as a link leaves the arena, so a
/// damaged list can end a walk early but never send it outside the arena.
pub(crate) struct Chunks<'h, S: PageSource> {
    heap: &'h Heap<S>,
    at: usize,
    stop: usize,
}

impl<'h, S: PageSource> Iterator for Chunks<'h, S> {
    type Item = (usize, Header);

    fn next(&mut self) -> Option<Self::Item> {
        if self.at == self.stop || !self.heap.holds_header(self.at) {
            return None;
        }

        let at = self.at;
        // SAFETY: bounds and alignment were checked by `holds_header`
        let header = unsafe { self.heap.read(at) };
        self.at = header.next;
        Some((at, header))
    }
}

impl<S: PageSource> Heap<S> {
    /// The chunks strictly between the two sentinels.
    pub(crate) fn chunks(&self) -> Chunks<'_, S> {
        if !self.initialized {
            return Chunks { heap: self, at: NIL, stop: NIL };
        }

        // SAFETY: the heap is initialized, so `head` holds a header
        let first = unsafe { self.read(self.head) }.next;
        Chunks { heap: self, at: first, stop: self.tail }
    }

    /// Every chunk, sentinels included.
    pub(crate) fn all_chunks(&self) -> Chunks<'_, S> {
        let at = if self.initialized { self.head } else { NIL };
        Chunks { heap: self, at, stop: NIL }
    }

    /// Upper bound on the number of chunks the arena can hold.
    pub(crate) fn max_chunks(&self) -> usize {
        self.arena.size() / HEADER_SIZE
    }

    /// Whether a header starting at `offset` would lie within the arena and be word-aligned.
    #[inline]
    pub(crate) fn holds_header(&self, offset: usize) -> bool {
        offset % crate::ptr_utils::WORD_SIZE == 0
            && offset.checked_add(HEADER_SIZE).is_some_and(|end| end <= self.arena.size())
    }

    /// Find the used-or-free chunk whose payload starts at `ptr`, walking from the head.
    pub(crate) fn find_chunk(&self, ptr: *const u8) -> Option<usize> {
        let chunk = self.arena.offset_of(ptr)?.checked_sub(HEADER_SIZE)?;
        self.chunks().map(|(offset, _)| offset).find(|&offset| offset == chunk)
    }

    /// The chunk whose span, header included, contains `offset`.
    pub(crate) fn locate(&self, offset: usize) -> Option<(usize, Header)> {
        self.all_chunks()
            .take(self.max_chunks())
            .find(|&(chunk, header)| chunk <= offset && offset - chunk < header.size.saturating_add(HEADER_SIZE))
    }
}
