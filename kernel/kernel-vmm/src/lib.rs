//! # Virtual Memory Manager
//!
//! Tracks what lives where in one address space. Each mapping is a **VM
//! object**: a contiguous, page-aligned virtual range with one flag set,
//! kept in an intrusive, ascending, non-overlapping list whose nodes come
//! from a slab cache. On top of the paging layer this adds policy:
//! finding free ranges, backing leaves with PMM frames (or caller-given
//! MMIO frames), protection changes, growth and the destruction cascade.
//!
//! The kernel address space is a distinguished singleton owned by the
//! kernel crate; all other spaces share its upper-half mappings and may
//! be destroyed, which releases every frame unique to them — leaves
//! first, then interior tables, never anything the kernel half reaches.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod object;
mod space;

pub use object::{NodeAlloc, SlabNodePool, VmObject};
pub use space::VmSpace;

/// Status codes of the virtual memory manager.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("invalid argument")]
    Invalid,
    #[error("virtual allocation window exhausted")]
    Oom,
    #[error("not initialized")]
    NotInit,
    #[error("already initialized")]
    AlreadyInit,
    #[error("no object covers the address")]
    NotFound,
    #[error("address not page-aligned")]
    NotAligned,
    #[error("physical memory exhausted")]
    NoMemory,
    #[error("range intersects an existing mapping")]
    AlreadyMapped,
}

impl From<kernel_vmem::PagingError> for VmmError {
    fn from(e: kernel_vmem::PagingError) -> Self {
        match e {
            kernel_vmem::PagingError::OutOfMemory => Self::NoMemory,
            kernel_vmem::PagingError::AlreadyMapped => Self::AlreadyMapped,
            kernel_vmem::PagingError::NotMapped => Self::NotFound,
            kernel_vmem::PagingError::Unaligned => Self::NotAligned,
        }
    }
}
