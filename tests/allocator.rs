//! End-to-end allocator behavior over the in-memory segment backend.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use hugepool::{
    AllocatorConfig, HugeAllocator, MemorySegments, Region, HUGEPAGE_SIZE, PAGE_SIZE,
};

const MB: usize = 1024 * 1024;

fn allocator(initial_size: usize) -> HugeAllocator<MemorySegments> {
    HugeAllocator::with_source(MemorySegments::new(), AllocatorConfig::new(initial_size))
        .expect("unbounded backend cannot be exhausted")
}

fn contained(alloc: &HugeAllocator<MemorySegments>, addr: usize, len: usize) -> bool {
    alloc.regions().iter().any(|region| {
        let base = region.base().as_ptr() as usize;
        addr >= base && addr + len <= base + region.size()
    })
}

#[test]
fn fresh_allocator_reserves_eagerly() {
    let alloc = allocator(2 * MB);
    assert_eq!(alloc.reserved_memory(), 2 * MB);
    assert_eq!(alloc.allocated_memory(), 0);
}

#[test]
fn page_pool_drains_one_region_exactly() {
    let mut alloc = allocator(2 * MB);

    let mut seen = HashSet::new();
    for _ in 0..512 {
        let page = alloc.alloc_page().expect("the initial region holds 512 pages");
        let addr = page.as_ptr() as usize;
        assert_eq!(addr % PAGE_SIZE, 0);
        assert!(contained(&alloc, addr, PAGE_SIZE));
        assert!(seen.insert(addr), "duplicate page {addr:#x}");
    }

    assert_eq!(alloc.allocated_memory(), 512 * PAGE_SIZE);
    assert_eq!(alloc.reserved_memory(), 2 * MB);
}

#[test]
fn page_alloc_past_region_grows_geometrically() {
    let mut alloc = allocator(2 * MB);
    for _ in 0..512 {
        alloc.alloc_page().unwrap();
    }

    // The 513th page doubles the previous reservation.
    let page = alloc.alloc_page().expect("growth backs the extra page");
    assert_eq!(page.as_ptr() as usize % PAGE_SIZE, 0);
    assert_eq!(alloc.reserved_memory(), 6 * MB);
    assert_eq!(alloc.allocated_memory(), 513 * PAGE_SIZE);
}

#[test]
fn huge_alloc_rounds_up_and_grows() {
    let mut alloc = allocator(2 * MB);
    for _ in 0..512 {
        alloc.alloc_page().unwrap();
    }
    let before = alloc.allocated_memory();

    // 3 MiB rounds to two hugepages; the drained region cannot serve them.
    let buf = alloc.alloc_huge(3 * MB).expect("growth backs the buffer");
    assert_eq!(buf.as_ptr() as usize % HUGEPAGE_SIZE, 0);
    assert_eq!(alloc.allocated_memory(), before + 4 * MB);
    assert_eq!(alloc.reserved_memory(), 6 * MB);
    assert!(contained(&alloc, buf.as_ptr() as usize, 4 * MB));
}

#[test]
fn freed_page_is_reissued_lifo() {
    let mut alloc = allocator(2 * MB);

    let a = alloc.alloc_page().unwrap();
    let b = alloc.alloc_page().unwrap();
    assert_ne!(a, b);

    alloc.free_page(a);
    let c = alloc.alloc_page().unwrap();
    assert_eq!(c, a);
}

#[test]
fn exhaustion_is_recoverable() {
    let source = MemorySegments::with_capacity(2 * MB);
    let mut alloc =
        HugeAllocator::with_source(source, AllocatorConfig::new(2 * MB)).expect("cap fits");

    let mut pages = Vec::new();
    for _ in 0..512 {
        pages.push(alloc.alloc_page().unwrap());
    }

    // The backend has nothing left, so growth fails and the request is
    // declined without poisoning the allocator.
    assert!(alloc.alloc_page().is_none());
    assert_eq!(alloc.reserved_memory(), 2 * MB);
    assert!(alloc.alloc_huge(2 * MB).is_none());

    let page = pages.pop().unwrap();
    alloc.free_page(page);
    assert_eq!(alloc.alloc_page(), Some(page));
}

#[test]
fn construction_fails_recoverably_on_exhaustion() {
    let source = MemorySegments::with_capacity(HUGEPAGE_SIZE);
    let err = HugeAllocator::with_source(source, AllocatorConfig::new(4 * MB))
        .expect_err("capacity cannot back the initial reservation");
    assert!(err.is_out_of_memory());
}

#[test]
fn huge_buffers_prefer_the_smallest_sufficient_region() {
    let mut alloc = allocator(2 * MB);

    // Outgrows the first region, appending a 4 MiB one.
    let big = alloc.alloc_huge(4 * MB).unwrap();
    assert!(alloc.regions()[1].contains(big));

    // One hugepage still fits the untouched 2 MiB region at the front.
    let small = alloc.alloc_huge(2 * MB).unwrap();
    assert!(alloc.regions()[0].contains(small));
}

#[test]
fn pages_can_be_written() {
    let mut alloc = allocator(2 * MB);
    let page = alloc.alloc_page().unwrap();

    // SAFETY: the page is a live, exclusive 4 KiB allocation.
    unsafe {
        std::ptr::write_bytes(page.as_ptr(), 0xAB, PAGE_SIZE);
        assert_eq!(*page.as_ptr(), 0xAB);
        assert_eq!(*page.as_ptr().add(PAGE_SIZE - 1), 0xAB);
    }
    alloc.free_page(page);
}

#[test]
fn introspection_reads_are_idempotent() {
    let mut alloc = allocator(2 * MB);
    let _page = alloc.alloc_page().unwrap();

    let reserved = alloc.reserved_memory();
    let allocated = alloc.allocated_memory();
    let node = alloc.numa_node();
    let stats = alloc.stats();

    assert_eq!(alloc.reserved_memory(), reserved);
    assert_eq!(alloc.allocated_memory(), allocated);
    assert_eq!(alloc.numa_node(), node);
    assert_eq!(alloc.stats(), stats);
}

#[test]
fn randomized_sequences_hold_the_invariants() {
    let mut rng = StdRng::seed_from_u64(0x6875_6765_706f_6f6c);
    let mut alloc = allocator(2 * MB);

    let mut live_pages: Vec<usize> = Vec::new();
    let mut live_huge: Vec<(usize, usize)> = Vec::new();
    let mut expected_allocated = 0usize;

    for _ in 0..2000 {
        match rng.gen_range(0..10) {
            // Page allocation dominates the mix, as it does in a running
            // RPC node.
            0..=5 => {
                let page = alloc.alloc_page().expect("backend is unbounded");
                let addr = page.as_ptr() as usize;
                assert_eq!(addr % PAGE_SIZE, 0);
                assert!(contained(&alloc, addr, PAGE_SIZE));
                assert!(!live_pages.contains(&addr), "page {addr:#x} double-issued");
                live_pages.push(addr);
                expected_allocated += PAGE_SIZE;
            }
            6..=8 => {
                if !live_pages.is_empty() {
                    let idx = rng.gen_range(0..live_pages.len());
                    let addr = live_pages.swap_remove(idx);
                    let page = std::ptr::NonNull::new(addr as *mut u8).unwrap();
                    alloc.free_page(page);
                    expected_allocated -= PAGE_SIZE;
                }
            }
            _ => {
                if live_huge.len() < 16 {
                    let size = rng.gen_range(HUGEPAGE_SIZE..=2 * HUGEPAGE_SIZE);
                    let rounded = size.div_ceil(HUGEPAGE_SIZE) * HUGEPAGE_SIZE;
                    let buf = alloc.alloc_huge(size).expect("backend is unbounded");
                    let addr = buf.as_ptr() as usize;
                    assert_eq!(addr % HUGEPAGE_SIZE, 0);
                    assert!(contained(&alloc, addr, rounded));
                    live_huge.push((addr, rounded));
                    expected_allocated += rounded;
                }
            }
        }

        assert_eq!(alloc.allocated_memory(), expected_allocated);
        assert_eq!(alloc.reserved_memory() % HUGEPAGE_SIZE, 0);
        assert_eq!(
            alloc.reserved_memory(),
            alloc.regions().iter().map(Region::size).sum::<usize>()
        );
    }

    // No two live allocations may overlap.
    let mut ranges: Vec<(usize, usize)> = live_pages
        .iter()
        .map(|&addr| (addr, PAGE_SIZE))
        .chain(live_huge.iter().copied())
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (addr, len) = pair[0];
        assert!(
            addr + len <= pair[1].0,
            "ranges {:#x}+{len:#x} and {:#x} overlap",
            addr,
            pair[1].0
        );
    }
}
