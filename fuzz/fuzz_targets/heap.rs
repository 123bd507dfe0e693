#![no_main]

use brkheap::{Heap, PointerKind, Span, source::SpanSource};

use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

const PAGE: usize = 4096;

#[derive(Arbitrary, Debug)]
enum Actions {
    /// Allocate `size` bytes
    Alloc { size: u16 },
    /// Allocate `count * size` zeroed bytes
    AllocZeroed { count: u8, size: u8 },
    /// Allocate `size` page-aligned bytes
    AllocAligned { size: u16 },
    /// Release the ith allocation
    Release { index: u8 },
    /// Resize the ith allocation
    Realloc { index: u8, new_size: u16 },
    /// Resize the ith allocation into a page-aligned block
    ReallocAligned { index: u8, new_size: u16 },
    /// Release an arbitrary address within the arena
    ReleaseStray { offset: u32 },
}
use Actions::*;

fuzz_target!(|data: (u8, Vec<Actions>)| {
    let (pages, actions) = data;

    let memory = Box::leak(vec![0u8; (pages as usize + 2) * PAGE].into_boxed_slice());
    let span = Span::from(&mut memory[..]);
    let mut heap = Heap::new(unsafe { SpanSource::new(span) });
    heap.initialize().unwrap();

    let mut allocations: Vec<(*mut u8, usize)> = vec![];

    for action in actions {
        match action {
            Alloc { size } => {
                if let Ok(ptr) = heap.allocate(size as usize, None) {
                    unsafe { ptr.as_ptr().write_bytes(0xab, size as usize) };
                    allocations.push((ptr.as_ptr(), size as usize));
                }
            }
            AllocZeroed { count, size } => {
                let total = count as usize * size as usize;
                if let Ok(ptr) = heap.allocate_zeroed(count as usize, size as usize, None) {
                    let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), total) };
                    assert!(bytes.iter().all(|&b| b == 0));
                    allocations.push((ptr.as_ptr(), total));
                }
            }
            AllocAligned { size } => {
                if let Ok(ptr) = heap.allocate_aligned(size as usize, None) {
                    assert_eq!(ptr.as_ptr() as usize % PAGE, 0);
                    unsafe { ptr.as_ptr().write_bytes(0xab, size as usize) };
                    allocations.push((ptr.as_ptr(), size as usize));
                }
            }
            Release { index } => {
                if index as usize >= allocations.len() { continue; }

                let (ptr, _) = allocations.swap_remove(index as usize);
                heap.release(ptr).unwrap();
                assert!(heap.release(ptr).is_err());
            }
            Realloc { index, new_size } | ReallocAligned { index, new_size } => {
                if index as usize >= allocations.len() { continue; }
                if new_size == 0 { continue; }

                let aligned = matches!(action, ReallocAligned { .. });
                let (ptr, old_size) = allocations[index as usize];
                let new_size = new_size as usize;

                let result = if aligned {
                    heap.reallocate_aligned(ptr, new_size, None)
                } else {
                    heap.reallocate(ptr, new_size, None)
                };

                if let Ok(Some(moved)) = result {
                    let moved = moved.as_ptr();
                    if aligned {
                        assert_eq!(moved as usize % PAGE, 0);
                    }
                    if old_size < new_size {
                        unsafe { moved.add(old_size).write_bytes(0xcd, new_size - old_size) };
                    }
                    allocations[index as usize] = (moved, new_size);
                } else {
                    assert_eq!(heap.classify_pointer(ptr), PointerKind::ValidPayloadStart);
                }
            }
            ReleaseStray { offset } => {
                let arena = heap.arena();
                let ptr = arena.base().wrapping_add(offset as usize % arena.size());

                if heap.classify_pointer(ptr) != PointerKind::ValidPayloadStart {
                    assert!(heap.release(ptr).is_err());
                }
            }
        }

        heap.validate().unwrap();
    }

    for (ptr, _) in allocations {
        heap.release(ptr).unwrap();
    }

    heap.validate().unwrap();
    assert_eq!(heap.used_block_count(), 2);
    assert_eq!(heap.free_gap_count(), 1);

    drop(heap);
    unsafe { drop(Box::from_raw(memory)) };
});
