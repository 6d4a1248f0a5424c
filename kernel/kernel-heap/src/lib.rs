//! # Kernel Heap
//!
//! A boundary-tag, best-fit byte allocator layered on the VMM. Every
//! block is `[header | redzone | payload | redzone | footer]`; header and
//! footer carry a magic word and the block size so the allocator can walk
//! forwards from any block and backwards from any footer, which is what
//! makes immediate coalescing cheap. Free blocks additionally sit on a
//! size-ordered doubly-linked list, so best fit is "first fit on a sorted
//! list".
//!
//! Growth is on demand: when no free block fits, the heap asks its
//! [`HeapBacking`] (the kernel VMM, a leaked buffer in tests) for at
//! least [`HEAP_MIN_SIZE`] more bytes and retries once.
//!
//! Integrity is checked aggressively: magic words on every touch,
//! redzone verification on free, a double-free bit, and a full
//! [`Heap::check_integrity`] walk for the paranoid paths.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod heap;

pub use heap::{Heap, HeapStats};

/// Payload alignment guaranteed by every allocation.
pub const HEAP_MIN_ALIGN: u64 = 16;

/// Minimum number of bytes requested from the backing per growth step.
pub const HEAP_MIN_SIZE: u64 = 64 * 1024;

/// Status codes of the heap.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("invalid argument")]
    Invalid,
    #[error("out of memory")]
    Oom,
    #[error("heap not initialized")]
    NotInit,
    #[error("heap already initialized")]
    AlreadyInit,
    #[error("backing VMM allocation failed")]
    VmmFail,
    #[error("heap metadata corrupted")]
    Corrupted,
    #[error("pointer does not belong to this heap")]
    NotFound,
    #[error("block freed twice")]
    DoubleFree,
}

/// Supplies address ranges to a heap instance.
///
/// The kernel implementation allocates writable pages from the kernel
/// VMM; user-space heaps are layered on their own address space the same
/// way.
pub trait HeapBacking {
    /// Obtain at least `min_bytes` of contiguous, writable memory.
    /// Returns the base pointer and the actual length.
    ///
    /// # Errors
    /// [`HeapError::VmmFail`] when the backing cannot grow.
    fn grow(&mut self, min_bytes: u64) -> Result<(*mut u8, u64), HeapError>;

    /// Return a region obtained from [`grow`](Self::grow). Called on heap
    /// destruction only.
    ///
    /// # Safety
    /// `base`/`len` must be exactly one prior `grow` result, no longer
    /// referenced.
    unsafe fn release(&mut self, base: *mut u8, len: u64);
}
