//! Physical page-frame allocation for privileged, self-contained environments.
//!
//! `pfa` manages a bounded pool of physically contiguous frames with a
//! binary-buddy scheme: blocks of `2^order` frames are split on allocation and
//! merged with their buddy on release. Per-frame bookkeeping lives in a
//! caller-donated [frame map](page::FrameMap) (one small descriptor per
//! frame), free-list links live in the free frames themselves, and allocated
//! blocks always read back as zero.
//!
//! The crate is `no_std` and built for contexts where no host allocator
//! exists, such as a hypervisor's private address space or early kernel boot.
//! Blocking is confined to a spinlock around each pool; everything else is
//! atomic reference counting on the frame descriptors.

#![no_std]
#![warn(missing_docs)]
#![deny(missing_debug_implementations)]

#[cfg(test)]
extern crate std;

/// Physical and virtual address types.
pub mod addr;
mod list;
/// Page constants, frame descriptors and the frame map.
pub mod page;
/// The buddy pool itself.
pub mod pool;

pub use addr::{Align, PhysAddr, VirtAddr};
pub use page::{FrameMap, Page, MAX_ORDER, NO_ORDER, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
pub use pool::{order_for_size, size_for_order, AllocatorError, Pool};
