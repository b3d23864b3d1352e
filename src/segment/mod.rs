//! Shared-memory segment backends.
//!
//! The allocator acquires its regions through the [`SegmentSource`] trait,
//! which captures the keyed create-exclusive / attach / bind / remove /
//! detach lifecycle the kernel offers for hugepage-backed shared memory:
//!
//! - [`SysvShm`]: System-V shared memory with `SHM_HUGETLB`, for production
//!   use on Linux.
//! - [`MemorySegments`]: plain aligned heap memory, for tests, benchmarks,
//!   and hosts without a hugepage quota.

mod memory;
#[cfg(target_os = "linux")]
mod sysv;

pub use memory::MemorySegments;
#[cfg(target_os = "linux")]
pub use sysv::SysvShm;

use std::fmt;
use std::ptr::NonNull;

use thiserror::Error;

use crate::numa::NumaNode;

/// Key a segment is created under.
///
/// Keys are positive and drawn at random; they outlive the creating process,
/// which is what makes out-of-band cleanup of orphaned segments possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentKey(i32);

impl SegmentKey {
    /// Creates a key from a raw non-negative value.
    #[inline]
    #[must_use]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw key value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kernel-assigned identifier of a live segment.
///
/// Unlike a [`SegmentKey`], an id is only valid while the segment exists;
/// teardown re-resolves each key to its current id before removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(i32);

impl SegmentId {
    /// Creates an id from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw id value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result type for segment operations.
pub type SegmentResult<T> = Result<T, SegmentError>;

/// Errors reported by a segment backend.
///
/// Only [`KeyExists`](SegmentError::KeyExists) (retried transparently) and
/// [`OutOfMemory`](SegmentError::OutOfMemory) (reported to the caller) are
/// survivable; the allocator treats every other variant as fatal.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// The chosen key is already in use.
    #[error("segment key {key} already exists")]
    KeyExists {
        /// The colliding key.
        key: SegmentKey,
    },

    /// The kernel has no hugepages left to back the segment.
    #[error("out of huge memory: cannot back segment key {key} of {size} bytes")]
    OutOfMemory {
        /// The key the creation was attempted under.
        key: SegmentKey,
        /// Requested segment size in bytes.
        size: usize,
    },

    /// The caller lacks permission for the operation.
    #[error("insufficient permissions during {operation}")]
    PermissionDenied {
        /// The segment operation that was denied.
        operation: &'static str,
    },

    /// The requested size falls outside the kernel's segment size class.
    #[error("segment size {size} bytes rejected by the kernel size class")]
    InvalidSize {
        /// Requested segment size in bytes.
        size: usize,
    },

    /// No segment exists for the given key.
    #[error("no segment found for key {key}")]
    NotFound {
        /// The unresolved key.
        key: SegmentKey,
    },

    /// Mapping the segment into the address space failed.
    #[error("attach failed for segment {id}: errno {errno}")]
    AttachFailed {
        /// The segment that could not be mapped.
        id: SegmentId,
        /// Raw OS error code.
        errno: i32,
    },

    /// Pinning the mapped range to a NUMA node failed.
    #[error("strict NUMA bind to node {node} failed: errno {errno}")]
    BindFailed {
        /// The target node id.
        node: u32,
        /// Raw OS error code.
        errno: i32,
    },

    /// Marking the segment for removal failed.
    #[error("removal failed for segment {id}: errno {errno}")]
    RemoveFailed {
        /// The segment that could not be removed.
        id: SegmentId,
        /// Raw OS error code.
        errno: i32,
    },

    /// Unmapping the segment failed.
    #[error("detach failed at address {addr:#x}: errno {errno}")]
    DetachFailed {
        /// Mapped address the detach was attempted at.
        addr: usize,
        /// Raw OS error code.
        errno: i32,
    },

    /// The kernel reported an error code the backend does not classify.
    #[error("unexpected segment error during {operation}: errno {errno}")]
    Unexpected {
        /// The segment operation that failed.
        operation: &'static str,
        /// Raw OS error code.
        errno: i32,
    },
}

impl SegmentError {
    /// Returns true if the error reports hugepage exhaustion.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// Returns true if the error is a key collision, retried transparently
    /// by the acquirer.
    #[must_use]
    pub const fn is_key_collision(&self) -> bool {
        matches!(self, Self::KeyExists { .. })
    }
}

/// A source of hugepage-backed shared-memory segments.
///
/// The trait mirrors the kernel lifecycle: create a keyed segment with
/// fail-if-exists semantics, map it, pin the mapping to a NUMA node, and at
/// teardown re-resolve the key, mark the segment for removal, and unmap it.
/// Implementations do not retry or classify beyond the error variants; that
/// policy belongs to the allocator.
pub trait SegmentSource {
    /// Creates a segment of `size` bytes under `key`, failing if the key is
    /// already in use. `size` is a whole number of hugepages.
    fn create_exclusive(&mut self, key: SegmentKey, size: usize) -> SegmentResult<SegmentId>;

    /// Maps the segment into the caller's address space.
    fn attach(&mut self, id: SegmentId) -> SegmentResult<NonNull<u8>>;

    /// Pins `[base, base + len)` strictly to the single given node.
    fn bind(&mut self, base: NonNull<u8>, len: usize, node: NumaNode) -> SegmentResult<()>;

    /// Re-resolves `key` to the segment's current id.
    fn lookup(&mut self, key: SegmentKey) -> SegmentResult<SegmentId>;

    /// Marks the segment for removal once all mappings are gone.
    fn remove(&mut self, id: SegmentId) -> SegmentResult<()>;

    /// Unmaps a previously attached segment.
    fn detach(&mut self, base: NonNull<u8>, len: usize) -> SegmentResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        assert_eq!(SegmentKey::new(42).to_string(), "42");
        assert_eq!(SegmentId::new(7).to_string(), "7");
    }

    #[test]
    fn test_error_display() {
        let err = SegmentError::OutOfMemory {
            key: SegmentKey::new(99),
            size: 2 * 1024 * 1024,
        };
        assert!(err.to_string().contains("99"));
        assert!(err.to_string().contains("2097152"));

        let err = SegmentError::BindFailed { node: 1, errno: 22 };
        assert!(err.to_string().contains("node 1"));
    }

    #[test]
    fn test_classification() {
        let collision = SegmentError::KeyExists {
            key: SegmentKey::new(1),
        };
        assert!(collision.is_key_collision());
        assert!(!collision.is_out_of_memory());

        let oom = SegmentError::OutOfMemory {
            key: SegmentKey::new(1),
            size: 2 * 1024 * 1024,
        };
        assert!(oom.is_out_of_memory());
        assert!(!oom.is_key_collision());
    }
}
