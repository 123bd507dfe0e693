//! Pointer classification and whole-heap validation.

use core::ptr::NonNull;

use super::{CallSite, FENCE, HEADER_SIZE, Heap, header::NIL};
use crate::{Corruption, HeapError, logging::heap_log, ptr_utils::WORD_SIZE, source::PageSource};

/// What a pointer refers to, as far as a heap can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerKind {
    Null,
    /// Not within the arena, or the heap is uninitialized.
    OutOfHeap,
    /// Within a chunk header, sentinels included.
    ControlBlock,
    /// Within the payload of a free chunk.
    Unallocated,
    /// Within the payload of a used chunk, but not at its start.
    InsideUsedPayload,
    /// The start of a used chunk's payload, as returned by an allocation.
    ValidPayloadStart,
}

impl<S: PageSource> Heap<S> {
    /// Classify `ptr` by locating the chunk whose span contains it.
    pub fn classify_pointer(&self, ptr: *const u8) -> PointerKind {
        if ptr.is_null() {
            return PointerKind::Null;
        }
        let Some(offset) = self.arena.offset_of(ptr) else {
            return PointerKind::OutOfHeap;
        };
        let Some((chunk, header)) = self.locate(offset) else {
            return PointerKind::OutOfHeap;
        };

        let payload = chunk + HEADER_SIZE;
        if offset < payload {
            PointerKind::ControlBlock
        } else if header.is_free() {
            PointerKind::Unallocated
        } else if offset == payload {
            PointerKind::ValidPayloadStart
        } else {
            PointerKind::InsideUsedPayload
        }
    }

    /// The payload size of the used block containing `ptr`.
    pub fn block_size(&self, ptr: *const u8) -> Option<usize> {
        self.used_block_at(ptr).map(|(_, size)| size)
    }

    /// The payload start of the used block containing `ptr`.
    pub fn data_block_start(&self, ptr: *const u8) -> Option<NonNull<u8>> {
        self.used_block_at(ptr).map(|(chunk, _)| self.payload(chunk))
    }

    /// The call site recorded for the used block containing `ptr`.
    pub fn site_of(&self, ptr: *const u8) -> Option<CallSite> {
        let offset = self.arena.offset_of(ptr)?;
        self.locate(offset)
            .filter(|&(chunk, header)| !header.is_free() && offset >= chunk + HEADER_SIZE)
            .and_then(|(_, header)| header.site())
    }

    fn used_block_at(&self, ptr: *const u8) -> Option<(usize, usize)> {
        match self.classify_pointer(ptr) {
            PointerKind::ValidPayloadStart | PointerKind::InsideUsedPayload => {
                let offset = self.arena.offset_of(ptr)?;
                self.locate(offset).map(|(chunk, header)| (chunk, header.size))
            }
            _ => None,
        }
    }

    /// Check every invariant of the heap, stopping at the first violation.
    ///
    /// This walks the entire arena; ordinary operations never call it.
    pub fn validate(&self) -> Result<(), HeapError> {
        if !self.initialized {
            return Err(HeapError::NotInitialized);
        }

        self.check().map_err(|corruption| {
            heap_log!(error, "{}", corruption);
            HeapError::from(corruption)
        })
    }

    fn check(&self) -> Result<(), Corruption> {
        let arena_size = self.arena.size();
        if self.head != 0 || arena_size < 2 * HEADER_SIZE || self.tail != arena_size - HEADER_SIZE {
            return Err(Corruption::Boundaries);
        }

        if self.first_fence != FENCE || self.second_fence != FENCE {
            return Err(Corruption::StateFence);
        }
        if self.checksum != self.state_checksum() {
            return Err(Corruption::StateChecksum);
        }

        let (mut free, mut used) = (0, 0);
        let mut prev = NIL;
        let mut prev_free = false;
        let mut chunk = self.head;

        for index in 0.. {
            if (self.arena.base() as usize).wrapping_add(chunk) % WORD_SIZE != 0 {
                return Err(Corruption::Misaligned(index));
            }
            if !self.holds_header(chunk) {
                return Err(Corruption::LinkOutOfBounds(index));
            }

            // SAFETY: bounds and alignment were just checked
            let header = unsafe { self.read(chunk) };

            if !header.fences_ok() {
                return Err(Corruption::Fence(index));
            }
            if !header.checksum_ok() {
                return Err(Corruption::Checksum(index));
            }
            if header.size % WORD_SIZE != 0 {
                return Err(Corruption::Size(index));
            }
            if header.prev != prev {
                return Err(Corruption::BrokenLink(index));
            }
            if (chunk == self.head || chunk == self.tail) && (header.size != 0 || header.is_free()) {
                return Err(Corruption::Boundaries);
            }
            if header.is_free() && prev_free {
                return Err(Corruption::Uncoalesced(index - 1));
            }

            if header.is_free() {
                free += 1;
            } else {
                used += 1;
            }

            if chunk == self.tail {
                if header.next != NIL {
                    return Err(Corruption::BrokenLink(index));
                }
                break;
            }

            if header.next == NIL || header.next % WORD_SIZE != 0 {
                return Err(Corruption::BrokenLink(index));
            }
            if !self.holds_header(header.next) {
                return Err(Corruption::LinkOutOfBounds(index));
            }
            // the expected successor address also guarantees forward progress
            if chunk.checked_add(HEADER_SIZE + header.size) != Some(header.next) {
                return Err(Corruption::Gap(index));
            }

            prev = chunk;
            prev_free = header.is_free();
            chunk = header.next;
        }

        if free != self.free_count || used != self.used_count {
            return Err(Corruption::Counts);
        }
        if arena_size % S::PAGE_SIZE != 0 {
            return Err(Corruption::PartialPage);
        }

        Ok(())
    }
}
