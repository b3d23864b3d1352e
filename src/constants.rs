//! System-wide constants for the allocator.
//!
//! Sizes are fixed by the platform contract: regions are carved from 2 MiB
//! hugepages, and the fine-grained pool hands out 4 KiB pages.

// =============================================================================
// Page and Hugepage Geometry
// =============================================================================

/// Size of one fine-grained page (4 KiB).
///
/// This matches the base page size of the host and is the unit handed out by
/// [`alloc_page`](crate::HugeAllocator::alloc_page).
pub const PAGE_SIZE: usize = 4 * 1024;

/// Size of one hugepage (2 MiB).
///
/// Every region is a whole number of hugepages, and every coarse allocation
/// is rounded up to this granularity.
pub const HUGEPAGE_SIZE: usize = 2 * 1024 * 1024;

/// Number of fine-grained pages carved from a single hugepage.
pub const PAGES_PER_HUGEPAGE: usize = HUGEPAGE_SIZE / PAGE_SIZE;

// =============================================================================
// Allocation Limits
// =============================================================================

/// Maximum size of a single reservation or coarse allocation (256 GiB).
///
/// This is a per-call limit; cumulative reservations across growth rounds
/// are not capped.
pub const MAX_ALLOC_SIZE: usize = 256 * 1024 * 1024 * 1024;

/// Highest NUMA node id the allocator accepts.
pub const MAX_NUMA_NODES: u32 = 8;

/// Default initial reservation when none is specified (16 MiB).
pub const DEFAULT_INITIAL_SIZE: usize = 8 * HUGEPAGE_SIZE;

// =============================================================================
// Region Acquisition
// =============================================================================

/// Maximum number of key collisions tolerated while creating one region.
///
/// Collisions on random 31-bit keys are vanishingly rare; hitting this cap
/// means the kernel namespace is corrupted or another tenant is flooding it,
/// and the allocator treats it as fatal.
pub const MAX_KEY_RETRIES: usize = 512;

/// Rounds `size` up to a whole number of hugepages.
#[inline]
#[must_use]
pub const fn round_up_to_hugepage(size: usize) -> usize {
    (size + HUGEPAGE_SIZE - 1) / HUGEPAGE_SIZE * HUGEPAGE_SIZE
}
