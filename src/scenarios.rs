//! Whole-heap scenarios exercising the public surface end to end.

use core::ptr::NonNull;

use crate::{HEADER_SIZE, Heap, HeapError, PointerKind, test_utils::TestArena};

const PAGE: usize = 4096;

fn is_page_aligned(ptr: NonNull<u8>) -> bool {
    ptr.as_ptr() as usize % PAGE == 0
}

/// A tour through setup, growth, in-place and moving reallocation, rejection
/// of bad requests and aligned allocation, checking the exact layout as it goes.
#[cfg(target_pointer_width = "64")]
#[test]
fn guided_tour() {
    let arena = TestArena::new(64);
    let mut heap = Heap::new(arena.source());

    // nothing works before initialization
    assert_eq!(heap.allocate(10, None), Err(HeapError::NotInitialized));
    assert_eq!(heap.reallocate(core::ptr::null_mut(), 10, None), Err(HeapError::NotInitialized));
    assert_eq!(heap.reallocate_aligned(core::ptr::null_mut(), 10, None), Err(HeapError::NotInitialized));
    assert_eq!(heap.allocate_aligned(10, None), Err(HeapError::NotInitialized));

    heap.initialize().unwrap();
    assert_eq!(heap.used_space(), 3 * HEADER_SIZE);
    assert_eq!(heap.free_space(), PAGE - 3 * HEADER_SIZE);
    assert_eq!(heap.free_gap_count(), 1);
    assert_eq!(heap.used_block_count(), 2);

    let first = heap.allocate(13, None).unwrap();
    assert_eq!(heap.used_block_count(), 3);

    // too big for the first page, the arena grows by one
    let second = heap.allocate(4200, None).unwrap();
    assert_eq!(heap.arena().size(), 2 * PAGE);
    assert_eq!(heap.used_block_count(), 4);
    assert_eq!(heap.free_gap_count(), 1);
    assert_eq!(second.as_ptr(), first.as_ptr().wrapping_add(16 + HEADER_SIZE));

    assert_eq!(heap.allocate(10_000_000_000, None), Err(HeapError::OutOfMemory));
    assert_eq!(heap.arena().size(), 2 * PAGE);

    // exactly fills what is left
    let third = heap.allocate(3656, None).unwrap();
    assert_eq!(heap.free_gap_count(), 0);
    assert_eq!(heap.used_block_count(), 5);
    assert_eq!(heap.used_space(), 2 * PAGE);

    assert_eq!(heap.allocate(0, None), Err(HeapError::InvalidArgument));

    // shrink, then grow back into the split-off remainder
    assert_eq!(heap.reallocate(third.as_ptr(), 2000, None), Ok(Some(third)));
    assert_eq!(heap.reallocate(third.as_ptr(), 3000, None), Ok(Some(third)));

    // `first` is boxed in by `second`
    let first = heap.reallocate(first.as_ptr(), 23, None).unwrap().unwrap();
    assert_eq!(heap.block_size(first.as_ptr()), Some(24));
    assert_eq!(heap.reallocate(first.as_ptr(), 10_000_000_000, None), Err(HeapError::OutOfMemory));
    assert_eq!(heap.classify_pointer(first.as_ptr()), PointerKind::ValidPayloadStart);

    assert_eq!(heap.reallocate(first.as_ptr(), 0, None), Ok(None));
    assert_eq!(heap.used_block_count(), 4);

    let fourth = heap.reallocate(core::ptr::null_mut(), 3 * PAGE, None).unwrap().unwrap();
    assert_eq!(heap.used_block_count(), 5);
    assert_eq!(heap.free_gap_count(), 2);
    heap.validate().unwrap();

    for ptr in [second, third, fourth] {
        heap.release(ptr.as_ptr()).unwrap();
    }
    assert!(heap.release(fourth.as_ptr()).is_err());
    assert_eq!(heap.used_block_count(), 2);
    assert_eq!(heap.free_gap_count(), 1);

    let a = heap.allocate_aligned(10, None).unwrap();
    let b = heap.allocate_aligned(100_000, None).unwrap();
    assert_eq!(heap.allocate_aligned(1_000_000_000_000, None), Err(HeapError::OutOfMemory));
    let c = heap.allocate_aligned(10, None).unwrap();
    for ptr in [a, b, c] {
        assert!(is_page_aligned(ptr));
    }
    assert_eq!(heap.arena().size() % PAGE, 0);
    heap.validate().unwrap();

    assert_eq!(heap.reallocate_aligned(a.as_ptr(), 1002, None), Ok(Some(a)));
    let a = heap.reallocate_aligned(a.as_ptr(), 5000, None).unwrap().unwrap();
    assert!(is_page_aligned(a));

    let mut dump = String::new();
    heap.dump_debug_info(&mut dump).unwrap();
    assert!(dump.contains("Used Blocks"));
    heap.validate().unwrap();

    for ptr in [a, b, c] {
        heap.release(ptr.as_ptr()).unwrap();
    }
    heap.validate().unwrap();
    assert_eq!(heap.used_block_count(), 2);
    assert_eq!(heap.free_gap_count(), 1);
}

struct Block {
    ptr: NonNull<u8>,
    size: usize,
    fill: u8,
}

impl Block {
    fn bytes(&self, len: usize) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), len) }
    }

    fn refill(&mut self, fill: u8) {
        self.fill = fill;
        unsafe { self.ptr.as_ptr().write_bytes(fill, self.size) };
    }

    fn intact(&self, len: usize) -> bool {
        self.bytes(len.min(self.size)).iter().all(|&b| b == self.fill)
    }
}

/// Random mixes of every operation, validating the whole heap after each one.
#[test]
fn random_actions() {
    let arena = TestArena::new(512);
    let mut heap = arena.heap();
    let rng = fastrand::Rng::with_seed(0x5EED);
    let mut live: Vec<Block> = Vec::new();

    for step in 0..3000 {
        let fill = (step % 251) as u8 + 1;
        let action = if live.len() > 60 { 3 } else { rng.usize(0..=5) };

        match action {
            0 | 1 => {
                let size = rng.usize(1..2000);
                let ptr = if action == 0 {
                    heap.allocate(size, None).unwrap()
                } else {
                    let ptr = heap.allocate_zeroed(size, 1, None).unwrap();
                    let zeroed = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), size) };
                    assert!(zeroed.iter().all(|&b| b == 0));
                    ptr
                };
                let mut block = Block { ptr, size, fill };
                block.refill(fill);
                live.push(block);
            }
            2 => {
                let size = rng.usize(1..6000);
                let ptr = heap.allocate_aligned(size, None).unwrap();
                assert!(is_page_aligned(ptr));
                let mut block = Block { ptr, size, fill };
                block.refill(fill);
                live.push(block);
            }
            3 => {
                if !live.is_empty() {
                    let block = live.swap_remove(rng.usize(0..live.len()));
                    assert!(block.intact(block.size));
                    heap.release(block.ptr.as_ptr()).unwrap();
                    assert_ne!(heap.classify_pointer(block.ptr.as_ptr()), PointerKind::ValidPayloadStart);
                }
            }
            4 | 5 => {
                if !live.is_empty() {
                    let index = rng.usize(0..live.len());
                    let size = rng.usize(1..4000);
                    let old = &live[index];

                    let moved = if action == 4 {
                        heap.reallocate(old.ptr.as_ptr(), size, None)
                    } else {
                        heap.reallocate_aligned(old.ptr.as_ptr(), size, None)
                    };
                    let ptr = moved.unwrap().unwrap();
                    if action == 5 {
                        assert!(is_page_aligned(ptr));
                    }

                    let block = &mut live[index];
                    block.ptr = ptr;
                    assert!(block.intact(size));
                    block.size = size;
                    block.refill(fill);
                }
            }
            _ => unreachable!(),
        }

        heap.validate().unwrap();
        let stats = heap.stats();
        assert_eq!(stats.total_space(), heap.arena().size());
        assert_eq!(stats.used_block_count, live.len() + 2);
        for block in &live {
            assert!(heap.block_size(block.ptr.as_ptr()).unwrap() >= block.size);
        }
    }

    for block in live.drain(..) {
        assert!(block.intact(block.size));
        heap.release(block.ptr.as_ptr()).unwrap();
    }
    heap.validate().unwrap();
    assert_eq!(heap.used_block_count(), 2);
    assert_eq!(heap.free_gap_count(), 1);
}
