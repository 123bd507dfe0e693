#![no_main]

use std::alloc::{GlobalAlloc, Layout};
use std::ptr;

use brkheap::{HeapLock, Span, source::SpanSource};

use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum Actions {
    /// Allocate memory with the given size and align of 1 << (align_bit % 14)
    Alloc { size: u16, align_bit: u8 },
    /// Dealloc the ith allocation
    Dealloc { index: u8 },
    /// Realloc the ith allocation
    Realloc { index: u8, new_size: u16 },
}
use Actions::*;

fuzz_target!(|data: (u8, Vec<Actions>)| {
    let (pages, actions) = data;

    let memory = Box::leak(vec![0u8; (pages as usize + 2) * 4096].into_boxed_slice());
    let span = Span::from(&mut memory[..]);
    let allocator = HeapLock::<spin::Mutex<()>, _>::new(unsafe { SpanSource::new(span) });

    let mut allocations: Vec<(*mut u8, Layout)> = vec![];

    for action in actions {
        match action {
            Alloc { size, align_bit } => {
                if size == 0 { continue; }

                let layout = Layout::from_size_align(size as usize, 1 << (align_bit % 14)).unwrap();
                let ptr = unsafe { allocator.alloc(layout) };

                if ptr::null_mut() != ptr {
                    assert_eq!(ptr as usize % layout.align(), 0);
                    allocations.push((ptr, layout));
                    unsafe { ptr.write_bytes(0xab, layout.size()); }
                }
            }
            Dealloc { index } => {
                if index as usize >= allocations.len() { continue; }

                let (ptr, layout) = allocations.swap_remove(index as usize);
                unsafe { allocator.dealloc(ptr, layout); }
            }
            Realloc { index, new_size } => {
                if index as usize >= allocations.len() { continue; }
                if new_size == 0 { continue; }

                let (ptr, old_layout) = allocations[index as usize];
                let new_layout = Layout::from_size_align(new_size as usize, old_layout.align()).unwrap();

                let ptr = unsafe { allocator.realloc(ptr, old_layout, new_size as usize) };

                if !ptr.is_null() {
                    assert_eq!(ptr as usize % new_layout.align(), 0);
                    allocations[index as usize] = (ptr, new_layout);
                    if old_layout.size() < new_size as usize {
                        unsafe { ptr.add(old_layout.size()).write_bytes(0xcd, new_size as usize - old_layout.size()); }
                    }
                }
            }
        }

        if allocator.is_initialized() {
            allocator.validate().unwrap();
        }
    }

    for (ptr, layout) in allocations {
        unsafe { allocator.dealloc(ptr, layout); }
    }

    drop(allocator);
    unsafe { drop(Box::from_raw(memory)) };
});
