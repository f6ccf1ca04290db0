//! The buddy pool.
//!
//! A [`Pool`] owns a physically contiguous range of frames and hands them out
//! in power-of-two blocks. Free blocks of each order sit on a per-order free
//! list; releasing a block repeatedly merges it with its buddy while the
//! buddy is free at the same order, and allocating splits a larger block down
//! until the requested order is reached.
//!
//! The buddy of a block is found by flipping one bit of its physical address:
//! `phys ^ (PAGE_SIZE << order)`. The operation is an involution, so it walks
//! both directions of the buddy tree, and a result outside the pool range
//! means the block has no partner to merge with.
//!
//! Allocation and the final release of a block serialize on the pool's
//! spinlock. Intermediate [`retain`](Pool::retain)/[`release`](Pool::release)
//! pairs only touch the frame's atomic reference count, and the free-frame
//! counter can be read without the lock at the price of a possibly stale
//! value.

use core::{
    cmp, fmt, ptr,
    sync::atomic::{AtomicU64, Ordering},
};

use log::{info, warn};
use spin::Mutex;

use crate::{
    addr::{PhysAddr, VirtAddr},
    list::FreeList,
    page::{self, FrameMap, Page, MAX_ORDER, NO_ORDER, NR_ORDERS, PAGE_SHIFT, PAGE_SIZE},
};

/// The error type returned by fallible pool operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AllocatorError {
    /// The region does not contain a single whole frame.
    RegionTooSmall,
    /// More frames were reserved than the region holds.
    ReservedExceedsRegion,
    /// The region is not covered by the registered frame map.
    UnmappedRegion,
}

/// Calculates the size in bytes of a block of the given order.
pub const fn size_for_order(order: u8) -> usize {
    PAGE_SIZE << order
}

/// Calculates the first order whose blocks are at least `size` bytes.
pub fn order_for_size(size: usize) -> u8 {
    let frames = cmp::max(size, PAGE_SIZE).next_power_of_two() / PAGE_SIZE;
    frames.trailing_zeros() as u8
}

fn max_order_for(nr_pages: usize) -> u8 {
    cmp::min(MAX_ORDER as u32, nr_pages.next_power_of_two().trailing_zeros()) as u8
}

/// A buddy-system pool of page frames.
///
/// Blocks handed out by [`alloc`](Pool::alloc) are zero-filled and carry a
/// reference count; they return to the free lists once their last reference
/// is dropped. All bookkeeping lives in the frame map and in the free frames
/// themselves, so a pool is cheap to create and owns no heap memory.
pub struct Pool {
    free_area: Mutex<[FreeList; NR_ORDERS]>,
    range_start: PhysAddr,
    range_end: PhysAddr,
    max_order: u8,
    free_pages: AtomicU64,
}

impl Pool {
    /// Creates a pool owning the `nr_pages` frames starting at `pfn`, keeping
    /// the first `reserved_pages` of them allocated for the caller.
    ///
    /// The remaining frames are attached to the free lists in ascending
    /// address order, which coalesces them into maximal blocks.
    ///
    /// # Safety
    ///
    /// The frames must be unused, identity-mapped and writable, and must not
    /// be owned by any other pool. The frame map must cover them.
    pub unsafe fn init(
        pfn: usize,
        nr_pages: usize,
        reserved_pages: usize,
    ) -> Result<Pool, AllocatorError> {
        if nr_pages == 0 {
            return Err(AllocatorError::RegionTooSmall);
        }
        if reserved_pages > nr_pages {
            return Err(AllocatorError::ReservedExceedsRegion);
        }

        let map = page::frame_map();
        let start = PhysAddr::from_pfn(pfn);
        let end = start + (nr_pages << PAGE_SHIFT);
        if !map.contains(start) || !map.contains(end - PAGE_SIZE) {
            return Err(AllocatorError::UnmappedRegion);
        }

        let pool = Pool {
            free_area: Mutex::new([FreeList::EMPTY; NR_ORDERS]),
            range_start: start,
            range_end: end,
            max_order: max_order_for(nr_pages),
            free_pages: AtomicU64::new(0),
        };

        // Every owned frame starts out as an allocated order-0 page.
        for i in 0..nr_pages {
            let page = map.page_of_phys(start + (i << PAGE_SHIFT));
            page.set_order(0);
            page.set_refcounted();
        }

        // Handing the unreserved frames back builds the buddy tree.
        for i in reserved_pages..nr_pages {
            pool.release_page(map, map.page_of_phys(start + (i << PAGE_SHIFT)));
        }

        info!(
            "page pool: {} frames at {:#x}, {} reserved, max order {}",
            nr_pages,
            start.as_usize(),
            reserved_pages,
            pool.max_order
        );

        Ok(pool)
    }

    /// Creates a pool that owns no frames of its own.
    ///
    /// Frames are added later by [adopting](FrameMap::adopt) them and
    /// [releasing](Pool::release) them into the pool. Such frames enter the
    /// order-0 free list and never coalesce; `nr_pages` only sizes the orders
    /// the pool will track.
    pub fn init_empty(nr_pages: usize) -> Result<Pool, AllocatorError> {
        if nr_pages == 0 {
            return Err(AllocatorError::RegionTooSmall);
        }

        Ok(Pool {
            free_area: Mutex::new([FreeList::EMPTY; NR_ORDERS]),
            // Degenerate interval: no address ever tests in range.
            range_start: PhysAddr::new(usize::MAX),
            range_end: PhysAddr::new(0),
            max_order: max_order_for(nr_pages),
            free_pages: AtomicU64::new(0),
        })
    }

    /// Allocates a zero-filled block of `2^order` frames.
    ///
    /// Returns `None` when no free block of the requested (or any larger)
    /// order exists; the call never blocks waiting for memory.
    pub fn alloc(&self, order: u8) -> Option<VirtAddr> {
        let map = page::frame_map();
        let mut area = self.free_area.lock();

        // Look for the first order with a block large enough.
        let mut i = order;
        while i <= self.max_order && area[i as usize].is_empty() {
            i += 1;
        }
        if i > self.max_order {
            return None;
        }

        let head = unsafe { area[i as usize].pop_front() }?;
        let page = map.page_of_virt(head);
        unsafe { self.extract(&mut area, map, page, order) };
        page.set_refcounted();

        let free = self.free_pages.load(Ordering::Relaxed) - (1u64 << page.order());
        self.free_pages.store(free, Ordering::Relaxed);

        Some(map.virt_of_page(page))
    }

    /// Drops one reference to the block at `addr`, returning it to the free
    /// lists if it was the last one.
    ///
    /// Only the final release takes the pool lock; earlier ones are a single
    /// atomic decrement. Releasing a block whose physical address lies
    /// outside the pool range is allowed: the block is inserted at its own
    /// order and never coalesces.
    ///
    /// # Safety
    ///
    /// `addr` must refer to a live block handed out by this pool or adopted
    /// via [`FrameMap::adopt`], and must not be used after its last release.
    pub unsafe fn release(&self, addr: VirtAddr) {
        let map = page::frame_map();
        let page = map.page_of_virt(addr);
        let order = page.order();
        assert!(
            order <= self.max_order,
            "block order {order} exceeds pool max order {}",
            self.max_order
        );

        self.release_page(map, page);
    }

    /// Takes an additional reference to the live block at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must refer to a live block handed out by this pool.
    pub unsafe fn retain(&self, addr: VirtAddr) {
        page::frame_map().page_of_virt(addr).ref_inc();
    }

    /// Splits the live block at `addr` into independently refcounted order-0
    /// allocations.
    ///
    /// Every frame of the block, head included, becomes a separate order-0
    /// allocation with a single reference. The free lists and the free-frame
    /// counter are untouched; releasing the pieces may later rebuild the
    /// original block through coalescing.
    ///
    /// # Safety
    ///
    /// `addr` must refer to a live block handed out by this pool.
    pub unsafe fn split(&self, addr: VirtAddr) {
        let map = page::frame_map();
        let head = map.page_of_virt(addr);
        assert!(head.ref_count() > 0, "split of a free block");

        let order = head.order();
        head.set_order(0);
        for i in 1..(1usize << order) {
            let tail = map.page_of_phys(map.phys_of_page(head) + (i << PAGE_SHIFT));
            tail.set_order(0);
            tail.set_refcounted();
        }
    }

    /// Returns how many frames are free at the moment.
    ///
    /// The counter is read without taking the pool lock, so the value may be
    /// stale by the time the caller looks at it; it is exact while the pool
    /// is quiescent.
    pub fn free_pages(&self) -> u64 {
        self.free_pages.load(Ordering::Relaxed)
    }

    /// Returns `true` if `phys` lies in the range owned by this pool.
    pub fn contains(&self, phys: PhysAddr) -> bool {
        self.range_start <= phys && phys < self.range_end
    }

    /// Returns the highest block order this pool tracks.
    pub fn max_order(&self) -> u8 {
        self.max_order
    }

    fn release_page(&self, map: &'static FrameMap, page: &'static Page) {
        if page.ref_dec_and_test() {
            let mut area = self.free_area.lock();
            // Coalescing below may wipe the descriptor's order; the counter
            // accounts for the block as it was released.
            let order = page.order();
            unsafe { self.attach(&mut area, map, page) };

            let free = self.free_pages.load(Ordering::Relaxed) + (1u64 << order);
            self.free_pages.store(free, Ordering::Relaxed);
        }
    }

    /// Inserts the free block headed by `page` into the free lists, merging
    /// it with its buddies as far as possible.
    ///
    /// Must be called with the area lock held and the block unreferenced.
    unsafe fn attach(
        &self,
        area: &mut [FreeList; NR_ORDERS],
        map: &'static FrameMap,
        page: &'static Page,
    ) {
        let phys = map.phys_of_page(page);
        let mut order = page.order();

        // The whole block must read back as zero by the time it is handed
        // out again; the allocation path never does bulk writes.
        ptr::write_bytes(
            map.virt_of_page(page).as_mut_ptr::<u8>(),
            0,
            size_for_order(order),
        );

        let mut head = page;
        if self.contains(phys) {
            // `head` may stop being the head while coalescing, so the order
            // is cleared up front and rewritten once the loop settles.
            head.set_order(NO_ORDER);
            while order < self.max_order {
                let Some(buddy) = self.buddy_avail(map, head, order) else {
                    break;
                };

                area[order as usize].remove(map.virt_of_page(buddy));
                buddy.set_order(NO_ORDER);
                head = lower_of(head, buddy);
                order += 1;
            }
        }

        head.set_order(order);
        area[order as usize].push_tail(map.virt_of_page(head));
    }

    /// Splits the unlinked free block headed by `page` down to `order`,
    /// pushing the upper half onto the free lists at each step.
    ///
    /// Must be called with the area lock held.
    unsafe fn extract(
        &self,
        area: &mut [FreeList; NR_ORDERS],
        map: &'static FrameMap,
        page: &'static Page,
        order: u8,
    ) {
        while page.order() > order {
            let split = page.order() - 1;
            let Some(buddy) = self.buddy_nocheck(map, page, split) else {
                debug_assert!(
                    false,
                    "no buddy for {:?} at order {split}",
                    map.phys_of_page(page)
                );
                warn!("missing buddy at order {split} while splitting");
                break;
            };

            page.set_order(split);
            buddy.set_order(split);
            area[split as usize].push_tail(map.virt_of_page(buddy));
        }
    }

    /// Finds the buddy of `page` at `order`, making no assumption about its
    /// current state.
    ///
    /// Returns `None` when the buddy's address falls outside the pool range:
    /// such a frame belongs to something else and may not even be covered by
    /// the frame map.
    fn buddy_nocheck(
        &self,
        map: &'static FrameMap,
        page: &Page,
        order: u8,
    ) -> Option<&'static Page> {
        let phys = PhysAddr::new(map.phys_of_page(page).as_usize() ^ size_for_order(order));

        self.contains(phys).then(|| map.page_of_phys(phys))
    }

    /// Finds the buddy of `page` if it is currently free at exactly `order`.
    fn buddy_avail(&self, map: &'static FrameMap, page: &Page, order: u8) -> Option<&'static Page> {
        self.buddy_nocheck(map, page, order)
            .filter(|buddy| buddy.order() == order && buddy.ref_count() == 0)
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("range_start", &self.range_start)
            .field("range_end", &self.range_end)
            .field("max_order", &self.max_order)
            .field("free_pages", &self.free_pages())
            .finish_non_exhaustive()
    }
}

/// The lower-addressed of two frame descriptors; after a merge it is the head
/// of the combined block and keeps the alignment of the next order.
fn lower_of<'a>(a: &'a Page, b: &'a Page) -> &'a Page {
    if (b as *const Page) < (a as *const Page) {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use std::{
        alloc::Layout,
        ptr::NonNull,
        sync::atomic::AtomicUsize,
        vec::Vec,
    };

    use lazy_static::lazy_static;

    use super::*;
    use crate::page::PAGE_SIZE;

    // Each test carves its own frames out of one shared chunk, so pools never
    // overlap and every pool base is aligned for the orders under test.
    const SLOT_PAGES: usize = 16;
    const NUM_SLOTS: usize = 48;
    const TOTAL_PAGES: usize = SLOT_PAGES * NUM_SLOTS;

    lazy_static! {
        static ref CHUNK: usize = unsafe {
            let mem = std::alloc::alloc(
                Layout::from_size_align(TOTAL_PAGES * PAGE_SIZE, SLOT_PAGES * PAGE_SIZE).unwrap(),
            );
            assert!(!mem.is_null());

            let descriptors =
                std::alloc::alloc(Layout::array::<Page>(TOTAL_PAGES).unwrap()) as *mut Page;
            page::register(FrameMap::new(
                PhysAddr::new(mem as usize),
                TOTAL_PAGES,
                NonNull::new(descriptors).unwrap(),
            ));

            mem as usize
        };
    }

    static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

    /// Reserves a fresh, slot-aligned page-frame range for one test.
    fn carve(nr_pages: usize) -> usize {
        assert!(nr_pages <= SLOT_PAGES);
        let slot = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
        assert!(slot < NUM_SLOTS, "test memory exhausted");

        (*CHUNK + slot * SLOT_PAGES * PAGE_SIZE) >> PAGE_SHIFT
    }

    /// Collects every free head as a `(pfn, order)` pair, front to back per
    /// order list.
    fn free_heads(pool: &Pool) -> Vec<(usize, u8)> {
        let map = page::frame_map();
        let area = pool.free_area.lock();

        let mut heads = Vec::new();
        for (order, list) in area.iter().enumerate() {
            for virt in list.iter() {
                let page = map.page_of_virt(virt);
                assert_eq!(order as u8, page.order());
                assert_eq!(0, page.ref_count());
                heads.push((PhysAddr::new(virt.as_usize()).pfn(), order as u8));
            }
        }
        heads
    }

    /// Checks the structural invariants: head alignment, disjoint spans,
    /// buddy maximality inside the range and the free counter.
    fn check_invariants(pool: &Pool) {
        let mut heads = free_heads(pool);
        heads.sort_unstable();

        let mut total = 0u64;
        for &(pfn, order) in &heads {
            assert_eq!(0, pfn % (1 << order), "misaligned head at pfn {pfn:#x}");
            total += 1u64 << order;
        }

        for pair in heads.windows(2) {
            assert!(
                pair[0].0 + (1 << pair[0].1) <= pair[1].0,
                "overlapping free blocks at pfn {:#x}",
                pair[1].0
            );
        }

        for &(pfn, order) in &heads {
            let buddy = pfn ^ (1 << order);
            if order < pool.max_order
                && pool.contains(PhysAddr::from_pfn(pfn))
                && pool.contains(PhysAddr::from_pfn(buddy))
            {
                assert!(
                    !heads.contains(&(buddy, order)),
                    "unmerged buddies at pfn {pfn:#x}, order {order}"
                );
            }
        }

        assert_eq!(total, pool.free_pages());
    }

    #[test]
    fn init_builds_maximal_blocks() {
        let pfn = carve(4);
        let pool = unsafe { Pool::init(pfn, 4, 0) }.unwrap();

        assert_eq!(2, pool.max_order());
        assert_eq!(4, pool.free_pages());
        assert_eq!(free_heads(&pool), [(pfn, 2)]);
        check_invariants(&pool);
    }

    #[test]
    fn reserved_prefix_stays_allocated() {
        let pfn = carve(8);
        let pool = unsafe { Pool::init(pfn, 8, 3) }.unwrap();

        assert_eq!(5, pool.free_pages());
        let mut heads = free_heads(&pool);
        heads.sort_unstable();
        assert_eq!(heads, [(pfn + 3, 0), (pfn + 4, 2)]);
        check_invariants(&pool);
    }

    #[test]
    fn alloc_and_release_walk() {
        let pfn = carve(4);
        let pool = unsafe { Pool::init(pfn, 4, 0) }.unwrap();

        let a = pool.alloc(0).unwrap();
        assert_eq!(pfn, PhysAddr::new(a.as_usize()).pfn());
        assert_eq!(3, pool.free_pages());
        assert_eq!(free_heads(&pool), [(pfn + 1, 0), (pfn + 2, 1)]);
        check_invariants(&pool);

        let b = pool.alloc(0).unwrap();
        assert_eq!(pfn + 1, PhysAddr::new(b.as_usize()).pfn());
        assert_eq!(2, pool.free_pages());
        assert_eq!(free_heads(&pool), [(pfn + 2, 1)]);

        // No merge yet: the buddy of `b` is still allocated.
        unsafe { pool.release(b) };
        assert_eq!(3, pool.free_pages());
        assert_eq!(free_heads(&pool), [(pfn + 1, 0), (pfn + 2, 1)]);
        check_invariants(&pool);

        // The last release folds everything back into one block.
        unsafe { pool.release(a) };
        assert_eq!(4, pool.free_pages());
        assert_eq!(free_heads(&pool), [(pfn, 2)]);
        check_invariants(&pool);
    }

    #[test]
    fn release_restores_the_free_tree() {
        let pfn = carve(8);
        let pool = unsafe { Pool::init(pfn, 8, 0) }.unwrap();
        let mut before = free_heads(&pool);
        before.sort_unstable();

        let block = pool.alloc(1).unwrap();
        unsafe { pool.retain(block) };
        unsafe { pool.release(block) };
        // One reference is still held; nothing moved.
        assert_eq!(6, pool.free_pages());
        unsafe { pool.release(block) };

        assert_eq!(8, pool.free_pages());
        let mut after = free_heads(&pool);
        after.sort_unstable();
        assert_eq!(before, after);
        check_invariants(&pool);
    }

    #[test]
    fn external_frames_never_coalesce() {
        let pfn = carve(2);
        let pool = unsafe { Pool::init(pfn, 2, 0) }.unwrap();
        let outside = carve(2);
        let map = page::frame_map();

        for i in 0..2 {
            let virt = unsafe { map.adopt(PhysAddr::from_pfn(outside + i)) };
            unsafe { pool.release(virt) };
        }

        // The donated frames are buddies by address, but stay order 0.
        assert_eq!(4, pool.free_pages());
        let mut heads = free_heads(&pool);
        heads.sort_unstable();
        assert_eq!(heads, [(pfn, 1), (outside, 0), (outside + 1, 0)]);
        check_invariants(&pool);
    }

    #[test]
    fn split_makes_independent_singles() {
        let pfn = carve(4);
        let pool = unsafe { Pool::init(pfn, 4, 0) }.unwrap();
        let map = page::frame_map();

        let block = pool.alloc(2).unwrap();

        // Only the head of an allocated block carries its order.
        assert_eq!(2, map.page_of_virt(block).order());
        for i in 1..4 {
            let page = map.page_of_phys(PhysAddr::from_pfn(pfn + i));
            assert_eq!(NO_ORDER, page.order());
            assert_eq!(0, page.ref_count());
        }

        unsafe { pool.split(block) };

        for i in 0..4 {
            let page = map.page_of_phys(PhysAddr::from_pfn(pfn + i));
            assert_eq!(0, page.order());
            assert_eq!(1, page.ref_count());
        }
        assert_eq!(0, pool.free_pages());

        // Each piece releases on its own and the block coalesces back whole.
        for i in 0..4 {
            let virt = VirtAddr::new(PhysAddr::from_pfn(pfn + i).as_usize());
            unsafe { pool.release(virt) };
        }
        assert_eq!(4, pool.free_pages());
        assert_eq!(free_heads(&pool), [(pfn, 2)]);
        check_invariants(&pool);
    }

    #[test]
    fn alloc_failures_return_none() {
        let pool = Pool::init_empty(4).unwrap();
        assert_eq!(None, pool.alloc(0));

        let pfn = carve(1);
        let pool = unsafe { Pool::init(pfn, 1, 0) }.unwrap();
        assert_eq!(None, pool.alloc(pool.max_order() + 1));
        assert!(pool.alloc(0).is_some());
        assert_eq!(None, pool.alloc(0));
    }

    #[test]
    fn init_rejects_bad_regions() {
        assert!(matches!(
            unsafe { Pool::init(carve(1), 0, 0) },
            Err(AllocatorError::RegionTooSmall)
        ));
        assert!(matches!(
            unsafe { Pool::init(carve(2), 2, 3) },
            Err(AllocatorError::ReservedExceedsRegion)
        ));
        assert!(matches!(
            unsafe { Pool::init(0, 4, 0) },
            Err(AllocatorError::UnmappedRegion)
        ));
    }

    #[test]
    #[should_panic(expected = "split of a free block")]
    fn split_of_free_block_panics() {
        let pfn = carve(1);
        let pool = unsafe { Pool::init(pfn, 1, 0) }.unwrap();

        let block = pool.alloc(0).unwrap();
        unsafe { pool.release(block) };
        unsafe { pool.split(block) };
    }

    #[test]
    #[should_panic(expected = "exceeds pool max order")]
    fn oversized_release_panics() {
        let pfn = carve(4);
        let pool = unsafe { Pool::init(pfn, 4, 0) }.unwrap();

        let block = pool.alloc(0).unwrap();
        page::frame_map().page_of_virt(block).set_order(3);
        unsafe { pool.release(block) };
    }

    #[test]
    fn order_sizing() {
        assert_eq!(PAGE_SIZE, size_for_order(0));
        assert_eq!(4 * PAGE_SIZE, size_for_order(2));
        assert_eq!(0, order_for_size(1));
        assert_eq!(0, order_for_size(PAGE_SIZE));
        assert_eq!(1, order_for_size(PAGE_SIZE + 1));
        assert_eq!(3, order_for_size(8 * PAGE_SIZE));
    }
}
