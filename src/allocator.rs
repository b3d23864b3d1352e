//! The hugepage region allocator.

use std::ptr::{self, NonNull};

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, error, warn};

use crate::config::AllocatorConfig;
use crate::constants::{
    round_up_to_hugepage, HUGEPAGE_SIZE, MAX_ALLOC_SIZE, MAX_KEY_RETRIES, PAGE_SIZE,
};
use crate::error::{AllocError, AllocResult};
use crate::numa::NumaNode;
use crate::region::Region;
use crate::segment::{SegmentKey, SegmentSource};
#[cfg(target_os = "linux")]
use crate::segment::SysvShm;

/// Point-in-time snapshot of allocator counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    /// Total bytes reserved from the kernel, a multiple of the hugepage size.
    pub reserved: usize,
    /// Net bytes handed to callers.
    pub allocated: usize,
    /// Number of live regions.
    pub region_count: usize,
    /// Uncarved hugepages across all regions.
    pub free_hugepages: usize,
    /// Fine-grained pages sitting on the freelist.
    pub free_pages: usize,
}

/// An allocator over hugepage-backed, NUMA-pinned shared-memory regions.
///
/// Two allocation surfaces share the same regions:
///
/// - [`alloc_page`](Self::alloc_page) / [`free_page`](Self::free_page) hand
///   out individually recyclable 4 KiB pages through a LIFO freelist.
/// - [`alloc_huge`](Self::alloc_huge) bump-allocates contiguous buffers of
///   one hugepage or more; those are reclaimed only when the allocator is
///   dropped.
///
/// Regions grow geometrically: each internal reservation doubles the
/// previous one (and doubles further until the triggering request fits), so
/// the region list stays short and front-to-back scans touch the smallest
/// regions first.
///
/// The allocator is single-threaded and hands out borrowed addresses
/// without ownership; callers must not use a page after returning it and
/// must not share the allocator across threads without their own
/// serialization.
///
/// # Example
///
/// ```rust
/// use hugepool::{AllocatorConfig, HugeAllocator, MemorySegments, PAGE_SIZE};
///
/// let config = AllocatorConfig::from_hugepages(1);
/// let mut alloc = HugeAllocator::with_source(MemorySegments::new(), config)?;
///
/// let page = alloc.alloc_page().expect("fresh region has pages");
/// assert_eq!(page.as_ptr() as usize % PAGE_SIZE, 0);
/// alloc.free_page(page);
/// # Ok::<(), hugepool::AllocError>(())
/// ```
#[derive(Debug)]
pub struct HugeAllocator<S: SegmentSource> {
    source: S,
    numa_node: NumaNode,
    /// Live regions in acquisition order, non-decreasing by size.
    regions: Vec<Region>,
    /// Recyclable 4 KiB pages, popped LIFO.
    page_freelist: Vec<NonNull<u8>>,
    /// Uncarved hugepages across all regions.
    total_free_hugepages: usize,
    /// Size of the most recent reservation request.
    last_reservation: usize,
    /// Sum of region sizes.
    reserved: usize,
    /// Net bytes handed to callers.
    allocated: usize,
}

#[cfg(target_os = "linux")]
impl HugeAllocator<SysvShm> {
    /// Constructs an allocator over kernel hugepage shared memory, eagerly
    /// reserving `initial_size` bytes on `numa_node`.
    ///
    /// Returns [`AllocError::OutOfHugeMemory`] if the kernel cannot back the
    /// initial reservation; any other reservation failure, and any
    /// precondition violation, panics.
    ///
    /// ```no_run
    /// use hugepool::{HugeAllocator, NumaNode, HUGEPAGE_SIZE};
    ///
    /// let mut alloc = HugeAllocator::new(HUGEPAGE_SIZE, NumaNode::new(0))?;
    /// let buf = alloc.alloc_huge(3 * 1024 * 1024);
    /// # Ok::<(), hugepool::AllocError>(())
    /// ```
    pub fn new(initial_size: usize, numa_node: NumaNode) -> AllocResult<Self> {
        Self::with_config(AllocatorConfig::new(initial_size).with_numa_node(numa_node))
    }

    /// Constructs an allocator over kernel hugepage shared memory from a
    /// prepared configuration.
    pub fn with_config(config: AllocatorConfig) -> AllocResult<Self> {
        Self::with_source(SysvShm::new(), config)
    }
}

impl<S: SegmentSource> HugeAllocator<S> {
    /// Constructs an allocator over an explicit segment source.
    ///
    /// The initial reservation happens here; an out-of-memory report from
    /// the source is the only recoverable failure.
    pub fn with_source(source: S, config: AllocatorConfig) -> AllocResult<Self> {
        if let Err(reason) = config.validate() {
            panic!(
                "huge allocator misconfigured ({reason}): initial_size = {}, numa_node = {}",
                config.initial_size, config.numa_node
            );
        }

        let mut alloc = Self {
            source,
            numa_node: config.numa_node,
            regions: Vec::new(),
            page_freelist: Vec::new(),
            total_free_hugepages: 0,
            last_reservation: config.initial_size,
            reserved: 0,
            allocated: 0,
        };
        alloc.reserve(config.initial_size)?;
        Ok(alloc)
    }

    /// Allocates one 4 KiB page.
    ///
    /// Returns `None` if and only if the kernel is out of hugepages and no
    /// recyclable page remains; the allocator stays usable.
    pub fn alloc_page(&mut self) -> Option<NonNull<u8>> {
        if let Some(page) = self.page_freelist.pop() {
            self.allocated += PAGE_SIZE;
            return Some(page);
        }

        if self.total_free_hugepages == 0 {
            self.last_reservation *= 2;
            let request = self.last_reservation;
            if self.reserve(request).is_err() {
                return None;
            }
        }

        // At least one region now has an uncarved hugepage; carve the first
        // one found into pages. Scanning from the front lands on the
        // smallest region that still has room.
        for region in &mut self.regions {
            if region.free_hugepages() == 0 {
                continue;
            }

            let hugepage = region.take_hugepages(1);
            self.total_free_hugepages -= 1;
            for offset in (0..HUGEPAGE_SIZE).step_by(PAGE_SIZE) {
                // SAFETY: offset stays inside the hugepage just carved from
                // this region's mapping.
                let page = unsafe { NonNull::new_unchecked(hugepage.as_ptr().add(offset)) };
                self.page_freelist.push(page);
            }

            let page = self
                .page_freelist
                .pop()
                .expect("carving a hugepage populated the freelist");
            self.allocated += PAGE_SIZE;
            return Some(page);
        }

        unreachable!("a region with uncarved hugepages exists after growth");
    }

    /// Returns a page obtained from [`alloc_page`](Self::alloc_page) to the
    /// freelist.
    ///
    /// The page must have been produced by this allocator and must not be
    /// in use or freed twice; neither condition is checked.
    pub fn free_page(&mut self, page: NonNull<u8>) {
        assert!(
            page.as_ptr() as usize % PAGE_SIZE == 0,
            "free_page got unaligned address {:#x}",
            page.as_ptr() as usize
        );
        self.page_freelist.push(page);
        self.allocated -= PAGE_SIZE;
    }

    /// Allocates a contiguous buffer of `size` bytes, rounded up to whole
    /// hugepages.
    ///
    /// The buffer is hugepage-aligned, lies inside a single region, and is
    /// never reclaimed before the allocator is dropped. Returns `None` if
    /// and only if the kernel is out of hugepages. `size` must be between
    /// one hugepage and [`MAX_ALLOC_SIZE`] inclusive.
    pub fn alloc_huge(&mut self, size: usize) -> Option<NonNull<u8>> {
        assert!(
            (HUGEPAGE_SIZE..=MAX_ALLOC_SIZE).contains(&size),
            "alloc_huge size {size} outside [{HUGEPAGE_SIZE}, {MAX_ALLOC_SIZE}]"
        );

        let size = round_up_to_hugepage(size);
        let needed = size / HUGEPAGE_SIZE;

        for region in &mut self.regions {
            if region.free_hugepages() >= needed {
                let buf = region.take_hugepages(needed);
                self.total_free_hugepages -= needed;
                self.allocated += size;
                return Some(buf);
            }
        }

        // No region can hold the request whole; grow until one can.
        self.last_reservation *= 2;
        while self.last_reservation < size {
            self.last_reservation *= 2;
        }
        let request = self.last_reservation;
        if self.reserve(request).is_err() {
            return None;
        }

        let region = self
            .regions
            .last_mut()
            .expect("a successful reservation appends a region");
        let buf = region.take_hugepages(needed);
        self.total_free_hugepages -= needed;
        self.allocated += size;
        Some(buf)
    }

    /// Returns the total bytes reserved from the kernel.
    #[inline]
    #[must_use]
    pub fn reserved_memory(&self) -> usize {
        debug_assert!(self.reserved % HUGEPAGE_SIZE == 0);
        self.reserved
    }

    /// Returns the net bytes currently handed to callers.
    #[inline]
    #[must_use]
    pub fn allocated_memory(&self) -> usize {
        debug_assert!(self.allocated % PAGE_SIZE == 0);
        self.allocated
    }

    /// Returns the NUMA node every region is pinned to.
    #[inline]
    #[must_use]
    pub const fn numa_node(&self) -> NumaNode {
        self.numa_node
    }

    /// Returns the live regions in acquisition order.
    #[inline]
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Returns a snapshot of the allocator counters.
    #[must_use]
    pub fn stats(&self) -> AllocStats {
        AllocStats {
            reserved: self.reserved,
            allocated: self.allocated,
            region_count: self.regions.len(),
            free_hugepages: self.total_free_hugepages,
            free_pages: self.page_freelist.len(),
        }
    }

    /// Reserves a new region of at least `n_bytes`, rounded up to whole
    /// hugepages, pinned to the allocator's node.
    ///
    /// Out-of-memory is returned to the caller; key collisions are retried
    /// with fresh keys; everything else panics with the failing operation
    /// and size.
    fn reserve(&mut self, n_bytes: usize) -> AllocResult<()> {
        let size = round_up_to_hugepage(n_bytes);
        let mut rng = OsRng;

        let mut attempts = 0;
        let (key, id) = loop {
            attempts += 1;
            assert!(
                attempts <= MAX_KEY_RETRIES,
                "segment key space exhausted after {MAX_KEY_RETRIES} collisions \
                 while reserving {size} bytes"
            );

            let key = draw_key(&mut rng);
            match self.source.create_exclusive(key, size) {
                Ok(id) => break (key, id),
                Err(err) if err.is_key_collision() => continue,
                Err(err) if err.is_out_of_memory() => {
                    warn!(size, node = self.numa_node.id(), "reservation failed: {err}");
                    return Err(AllocError::OutOfHugeMemory {
                        requested: size,
                        node: self.numa_node.id(),
                    });
                }
                Err(err) => {
                    panic!("segment creation failed while reserving {size} bytes: {err}")
                }
            }
        };

        let base = match self.source.attach(id) {
            Ok(base) => base,
            Err(err) => panic!("could not map segment key {key} of {size} bytes: {err}"),
        };
        if let Err(err) = self.source.bind(base, size, self.numa_node) {
            panic!("could not pin segment key {key} of {size} bytes: {err}");
        }

        // Touch every byte now so a backing shortage surfaces here rather
        // than at first use of some page.
        // SAFETY: [base, base + size) is the mapping attached above.
        unsafe { ptr::write_bytes(base.as_ptr(), 0, size) };

        debug!(key = %key, size, node = self.numa_node.id(), "reserved region");
        self.regions.push(Region::new(key, base, size));
        self.total_free_hugepages += size / HUGEPAGE_SIZE;
        self.reserved += size;
        Ok(())
    }
}

impl<S: SegmentSource> Drop for HugeAllocator<S> {
    /// Removes every acquired region, in acquisition order.
    ///
    /// A teardown failure aborts the process: a kernel-visible segment
    /// leaking past the allocator is worse than a loud crash.
    fn drop(&mut self) {
        let source = &mut self.source;
        for region in &self.regions {
            let id = match source.lookup(region.key()) {
                Ok(id) => id,
                Err(err) => {
                    error!(key = %region.key(), "teardown lookup failed: {err}");
                    std::process::abort();
                }
            };
            if let Err(err) = source.remove(id) {
                error!(key = %region.key(), "teardown removal failed: {err}");
                std::process::abort();
            }
            if let Err(err) = source.detach(region.base(), region.size()) {
                error!(key = %region.key(), "teardown detach failed: {err}");
                std::process::abort();
            }
        }
    }
}

/// Draws a random positive segment key.
///
/// Key zero is skipped: the kernel treats it as the anonymous "private"
/// key, which can neither collide nor be re-resolved for removal.
fn draw_key(rng: &mut impl RngCore) -> SegmentKey {
    loop {
        let raw = (rng.next_u64() & 0x7fff_ffff) as i32;
        if raw != 0 {
            return SegmentKey::new(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::MemorySegments;

    fn allocator(initial_size: usize) -> HugeAllocator<MemorySegments> {
        HugeAllocator::with_source(MemorySegments::new(), AllocatorConfig::new(initial_size))
            .expect("unbounded backend cannot be exhausted")
    }

    #[test]
    fn test_eager_initial_reservation() {
        let alloc = allocator(HUGEPAGE_SIZE);
        assert_eq!(alloc.reserved_memory(), HUGEPAGE_SIZE);
        assert_eq!(alloc.allocated_memory(), 0);
        assert_eq!(alloc.regions().len(), 1);
    }

    #[test]
    fn test_initial_size_rounds_up() {
        let alloc = allocator(HUGEPAGE_SIZE + 1);
        assert_eq!(alloc.reserved_memory(), 2 * HUGEPAGE_SIZE);
    }

    #[test]
    fn test_page_accounting() {
        let mut alloc = allocator(HUGEPAGE_SIZE);

        let page = alloc.alloc_page().unwrap();
        assert_eq!(alloc.allocated_memory(), PAGE_SIZE);

        alloc.free_page(page);
        assert_eq!(alloc.allocated_memory(), 0);
    }

    #[test]
    fn test_carve_returns_highest_subpage_first() {
        let mut alloc = allocator(HUGEPAGE_SIZE);

        let base = alloc.regions()[0].base().as_ptr() as usize;
        let first = alloc.alloc_page().unwrap().as_ptr() as usize;
        assert_eq!(first, base + HUGEPAGE_SIZE - PAGE_SIZE);

        let second = alloc.alloc_page().unwrap().as_ptr() as usize;
        assert_eq!(second, base + HUGEPAGE_SIZE - 2 * PAGE_SIZE);
    }

    #[test]
    fn test_freed_page_reused_lifo() {
        let mut alloc = allocator(HUGEPAGE_SIZE);

        let a = alloc.alloc_page().unwrap();
        let _b = alloc.alloc_page().unwrap();
        alloc.free_page(a);
        let c = alloc.alloc_page().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_huge_alloc_first_fit_from_front() {
        let mut alloc = allocator(HUGEPAGE_SIZE);

        // Too big for the 2 MiB region, so a 4 MiB region is appended and
        // serves the buffer.
        let buf = alloc.alloc_huge(2 * HUGEPAGE_SIZE).unwrap();
        assert_eq!(alloc.reserved_memory(), 3 * HUGEPAGE_SIZE);
        assert!(alloc.regions()[1].contains(buf));

        // The untouched first region is smaller and wins the next fit.
        let small = alloc.alloc_huge(HUGEPAGE_SIZE).unwrap();
        assert!(alloc.regions()[0].contains(small));
    }

    #[test]
    fn test_stats_snapshot() {
        let mut alloc = allocator(2 * HUGEPAGE_SIZE);
        let _page = alloc.alloc_page().unwrap();

        let stats = alloc.stats();
        assert_eq!(stats.reserved, 2 * HUGEPAGE_SIZE);
        assert_eq!(stats.allocated, PAGE_SIZE);
        assert_eq!(stats.region_count, 1);
        assert_eq!(stats.free_hugepages, 1);
        assert_eq!(stats.free_pages, crate::constants::PAGES_PER_HUGEPAGE - 1);
    }

    #[test]
    fn test_teardown_walks_all_regions() {
        let mut alloc = allocator(HUGEPAGE_SIZE);
        // Force two growth rounds so teardown has three regions to remove.
        let _ = alloc.alloc_huge(2 * HUGEPAGE_SIZE).unwrap();
        let _ = alloc.alloc_huge(8 * HUGEPAGE_SIZE).unwrap();
        assert_eq!(alloc.regions().len(), 3);
        // Dropping must re-resolve, remove, and detach every region; any
        // failure would abort the test process.
        drop(alloc);
    }

    #[test]
    #[should_panic(expected = "misconfigured")]
    fn test_zero_initial_size_is_fatal() {
        let _ = HugeAllocator::with_source(MemorySegments::new(), AllocatorConfig::new(0));
    }

    #[test]
    #[should_panic(expected = "alloc_huge size")]
    fn test_undersized_huge_request_is_fatal() {
        let mut alloc = allocator(HUGEPAGE_SIZE);
        let _ = alloc.alloc_huge(PAGE_SIZE);
    }

    #[test]
    fn test_draw_key_is_positive() {
        let mut rng = rand::rngs::mock::StepRng::new(0, 1);
        for _ in 0..64 {
            assert!(draw_key(&mut rng).raw() > 0);
        }
    }
}
