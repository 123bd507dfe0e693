//! Error types reported by [`Heap`](crate::Heap) and [`HeapLock`](crate::HeapLock).

use thiserror::Error;

/// Why a heap operation was refused.
///
/// Failed allocations leave the heap exactly as it was. [`HeapError::DoubleFree`]
/// and [`HeapError::InvalidPointer`] are recoverable: the call is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum HeapError {
    #[error("the heap has not been initialized")]
    NotInitialized,

    #[error("zero-byte request or unsupported alignment")]
    InvalidArgument,

    #[error("requested size overflows")]
    Overflow,

    #[error("the page source could not provide enough memory")]
    OutOfMemory,

    #[error("the block has already been released")]
    DoubleFree,

    #[error("the pointer does not refer to a block of this heap")]
    InvalidPointer,

    #[error("heap corruption detected: {0}")]
    CorruptionDetected(#[from] Corruption),
}

/// The first inconsistency found by [`Heap::validate`](crate::Heap::validate).
///
/// Per-block variants carry the block's position in the list, counting the
/// left sentinel as block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Corruption {
    #[error("head/tail do not match the arena's sentinel blocks")]
    Boundaries,

    #[error("heap state fences were overwritten")]
    StateFence,

    #[error("heap state checksum mismatch")]
    StateChecksum,

    #[error("block {0} links outside of the arena")]
    LinkOutOfBounds(usize),

    #[error("block {0} has inconsistent next/prev links")]
    BrokenLink(usize),

    #[error("block {0} has an address that is not word-aligned")]
    Misaligned(usize),

    #[error("block {0} has overwritten fences")]
    Fence(usize),

    #[error("block {0} has a size that is not a multiple of the word size")]
    Size(usize),

    #[error("block {0} has an invalid checksum")]
    Checksum(usize),

    #[error("block {0} is not physically contiguous with its successor")]
    Gap(usize),

    #[error("block {0} and its successor are both free")]
    Uncoalesced(usize),

    #[error("block counts disagree with the block list")]
    Counts,

    #[error("arena size is not a whole number of pages")]
    PartialPage,
}
