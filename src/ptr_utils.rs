//! Generic utilities for pointer handling and sizing.

pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Rounds `size` up to the next multiple of the machine word.
///
/// Returns `None` if doing so overflows.
#[inline]
pub fn ceil_word(size: usize) -> Option<usize> {
    align_up_checked(size, WORD_SIZE)
}

/// Aligns `value` up to the next multiple of `align`, which must be a power of two.
#[inline]
pub fn align_up_checked(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());

    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Aligns `ptr` up to the next `align_mask + 1`.
///
/// `align_mask` must be a power of two minus one.
#[inline]
pub fn align_up_by(ptr: *mut u8, align_mask: usize) -> *mut u8 {
    debug_assert!((align_mask + 1).is_power_of_two());

    // this incantation maintains provenance of ptr
    // while allowing the compiler to see through the wrapping_add and optimize it
    ptr.wrapping_add(((ptr as usize + align_mask) & !align_mask) - ptr as usize)
}

#[inline]
pub fn is_aligned_to(ptr: *const u8, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());

    ptr as usize & (align - 1) == 0
}

/// Wrapping byte sum of `value`'s native representation.
#[inline]
pub fn byte_sum(value: usize) -> usize {
    value.to_ne_bytes().iter().fold(0, |acc, &b| acc.wrapping_add(b as usize))
}
