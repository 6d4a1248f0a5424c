//! # Slab Allocator
//!
//! Named fixed-size object caches backed by single PMM pages. Every slab
//! is one 4 KiB frame: a header at the page start, then the object area
//! at `align`-sized strides. A freed pointer finds its slab by masking to
//! the page base, so no lookup table is needed.
//!
//! Slabs are classified Full / Partial / Empty per cache; allocation
//! prefers Partial over Empty and never touches Full. One fully free
//! slab is kept cached per cache, further ones go back to the PMM.
//!
//! Like the PMM, all memory access goes through a [`PhysMapper`], which
//! keeps the allocator testable against plain host memory.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod cache;
mod registry;

pub use cache::{SLAB_MAGIC, SlabCache};
pub use registry::{MAX_CACHES, SlabRegistry};

/// Status codes of the slab allocator.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum SlabError {
    #[error("invalid argument")]
    Invalid,
    #[error("backing allocator exhausted")]
    NoMemory,
    #[error("allocator not initialized")]
    NotInit,
    #[error("allocator already initialized")]
    AlreadyInit,
    #[error("cache registry is full")]
    CacheFull,
    #[error("no such cache or object")]
    NotFound,
    #[error("slab metadata corrupted")]
    Corruption,
    #[error("object size not representable in a slab")]
    BadSize,
}
