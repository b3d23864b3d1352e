//! # hugepool
//!
//! A hugepage-backed region allocator, built to be the memory substrate of a
//! user-space RPC runtime. It reserves large physically-contiguous regions
//! from the kernel's hugepage pool, pins each region strictly to one NUMA
//! node, and serves two kinds of allocations from them:
//!
//! - **Pages**: individually recyclable 4 KiB pages, managed through a LIFO
//!   freelist ([`HugeAllocator::alloc_page`] / [`HugeAllocator::free_page`]).
//! - **Huge buffers**: contiguous bump allocations of 2 MiB or more that are
//!   reclaimed only at allocator teardown ([`HugeAllocator::alloc_huge`]).
//!
//! Regions are System-V shared-memory segments created under random keys
//! with fail-if-exists semantics, so segments leaked by a crashed process
//! remain visible to out-of-band cleanup. Reservations grow geometrically,
//! keeping the region list logarithmic in the total memory served.
//!
//! ## Example
//!
//! ```rust
//! use hugepool::{AllocatorConfig, HugeAllocator, MemorySegments};
//!
//! let config = AllocatorConfig::from_hugepages(2);
//! let mut alloc = HugeAllocator::with_source(MemorySegments::new(), config)?;
//!
//! let page = alloc.alloc_page().expect("fresh region has pages");
//! let buf = alloc.alloc_huge(2 * 1024 * 1024).expect("one hugepage left");
//!
//! alloc.free_page(page);
//! // `buf` stays live until `alloc` is dropped.
//! # let _ = buf;
//! # Ok::<(), hugepool::AllocError>(())
//! ```
//!
//! On Linux hosts with a hugepage quota, [`HugeAllocator::new`] builds the
//! allocator over the kernel-backed [`SysvShm`] source instead.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod allocator;
pub mod config;
pub mod constants;
pub mod error;
pub mod numa;
pub mod region;
pub mod segment;

pub use allocator::{AllocStats, HugeAllocator};
pub use config::AllocatorConfig;
pub use constants::{HUGEPAGE_SIZE, MAX_ALLOC_SIZE, PAGE_SIZE};
pub use error::{AllocError, AllocResult};
pub use numa::NumaNode;
pub use region::Region;
#[cfg(target_os = "linux")]
pub use segment::SysvShm;
pub use segment::{MemorySegments, SegmentSource};
