//! Page constants, per-frame descriptors and the frame map.
//!
//! Every physical frame in the addressable range is described by one [`Page`]
//! slot in a linear [`FrameMap`], indexed in O(1) from a physical address.
//! The map is registered once per process and consulted by every pool; the
//! descriptors themselves are tiny (an order byte and a reference count) so
//! the map stays cache-compact even for large ranges.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU16, AtomicU8, Ordering},
};

use spin::Once;

use crate::addr::{PhysAddr, VirtAddr};

/// Length in bits of the offset part of a page.
pub const PAGE_SHIFT: usize = 12;

/// Length of a page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Bitmask of the page number part of an address.
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// The highest block order a pool may track (inclusive).
///
/// An order-11 block spans `2^11` frames, 8 MiB with 4 KiB pages.
pub const MAX_ORDER: u8 = 11;

/// The size of the per-order free-list array inside a pool.
pub(crate) const NR_ORDERS: usize = MAX_ORDER as usize + 1;

/// Sentinel order for a frame that is not the head of any block.
pub const NO_ORDER: u8 = u8::MAX;

/// Per-frame bookkeeping.
///
/// The head of a block, free or allocated, carries the block's order; every
/// other frame carries [`NO_ORDER`]. The reference count is zero exactly when
/// the frame is free. The order is only written while its pool's lock is
/// held (or while the caller has exclusive ownership of the frame); the
/// reference count is adjusted atomically without the lock.
#[derive(Debug)]
pub struct Page {
    order: AtomicU8,
    refcount: AtomicU16,
}

impl Page {
    pub(crate) const fn new() -> Self {
        Self {
            order: AtomicU8::new(NO_ORDER),
            refcount: AtomicU16::new(0),
        }
    }

    /// Returns the order stored in this descriptor.
    pub fn order(&self) -> u8 {
        self.order.load(Ordering::Relaxed)
    }

    /// Returns the current reference count.
    pub fn ref_count(&self) -> u16 {
        self.refcount.load(Ordering::Relaxed)
    }

    pub(crate) fn set_order(&self, order: u8) {
        self.order.store(order, Ordering::Relaxed);
    }

    /// Marks a frame with no references as held by a single owner.
    pub(crate) fn set_refcounted(&self) {
        debug_assert_eq!(0, self.ref_count(), "frame is already refcounted");
        self.refcount.store(1, Ordering::Relaxed);
    }

    pub(crate) fn ref_inc(&self) {
        let old = self.refcount.fetch_add(1, Ordering::Relaxed);
        debug_assert!(old < u16::MAX);
    }

    /// Drops one reference, returning `true` if it was the last one.
    pub(crate) fn ref_dec_and_test(&self) -> bool {
        let old = self.refcount.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(old != 0, "released a frame with no references");
        old == 1
    }
}

/// The linear array of frame descriptors covering the addressable range.
///
/// Physical and virtual addresses convert to descriptors (and back) by plain
/// index arithmetic. The pools live in an identity-mapped window, so the
/// virtual address of a frame equals its physical address.
#[derive(Debug)]
pub struct FrameMap {
    pages: NonNull<Page>,
    base: PhysAddr,
    len: usize,
}

// The descriptor array is never reallocated and all mutation inside it goes
// through atomics.
unsafe impl Send for FrameMap {}
unsafe impl Sync for FrameMap {}

impl FrameMap {
    /// Creates a frame map for the `len` frames starting at `base`, storing
    /// the descriptors in `backing`.
    ///
    /// Every slot starts out as [`NO_ORDER`] with no references.
    ///
    /// # Safety
    ///
    /// `backing` must be valid for `len` [`Page`] slots and must stay valid
    /// (and never be reused) for as long as the map is in use. `base` must be
    /// page-aligned.
    pub unsafe fn new(base: PhysAddr, len: usize, backing: NonNull<Page>) -> Self {
        for i in 0..len {
            backing.as_ptr().add(i).write(Page::new());
        }

        Self {
            pages: backing,
            base,
            len,
        }
    }

    /// Returns the number of frames covered by this map.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the map covers no frames.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if `phys` falls into a frame covered by this map.
    pub fn contains(&self, phys: PhysAddr) -> bool {
        self.base <= phys && phys < self.base + (self.len << PAGE_SHIFT)
    }

    /// Returns the descriptor of the frame containing `phys`.
    ///
    /// # Panics
    ///
    /// Panics if `phys` is not covered by this map.
    pub fn page_of_phys(&self, phys: PhysAddr) -> &Page {
        assert!(self.contains(phys), "{phys:?} outside the frame map");

        let idx = (phys - self.base) >> PAGE_SHIFT;
        unsafe { &*self.pages.as_ptr().add(idx) }
    }

    /// Returns the physical address of the frame described by `page`.
    pub fn phys_of_page(&self, page: &Page) -> PhysAddr {
        let idx = (page as *const Page as usize - self.pages.as_ptr() as usize)
            / core::mem::size_of::<Page>();
        debug_assert!(idx < self.len);

        self.base + (idx << PAGE_SHIFT)
    }

    /// Returns the virtual address of the frame described by `page`.
    pub fn virt_of_page(&self, page: &Page) -> VirtAddr {
        VirtAddr::new(self.phys_of_page(page).as_usize())
    }

    /// Returns the descriptor of the frame containing `virt`.
    ///
    /// # Panics
    ///
    /// Panics if `virt` is not covered by this map.
    pub fn page_of_virt(&self, virt: VirtAddr) -> &Page {
        self.page_of_phys(PhysAddr::new(virt.as_usize()))
    }

    /// Hands a frame to the allocator as a live, singly-referenced order-0
    /// allocation.
    ///
    /// This is how external frames are fed to a pool built with
    /// [`Pool::init_empty`](crate::pool::Pool::init_empty): adopt the frame,
    /// then [`release`](crate::pool::Pool::release) it into the pool.
    ///
    /// # Safety
    ///
    /// The caller must exclusively own the frame; in particular it must not
    /// be tracked by any pool.
    pub unsafe fn adopt(&self, phys: PhysAddr) -> VirtAddr {
        let page = self.page_of_phys(phys);
        page.set_order(0);
        page.set_refcounted();

        self.virt_of_page(page)
    }
}

/// The process-wide frame map.
static FRAME_MAP: Once<FrameMap> = Once::new();

/// Registers the process-wide frame map.
///
/// Only the first registration takes effect; later calls are ignored.
pub fn register(map: FrameMap) {
    FRAME_MAP.call_once(|| map);
}

/// Returns the process-wide frame map.
///
/// # Panics
///
/// Panics if no map has been registered.
pub fn frame_map() -> &'static FrameMap {
    FRAME_MAP.get().expect("no frame map registered")
}
