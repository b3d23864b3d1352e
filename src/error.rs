//! Allocator error types.
//!
//! Failures come in two tiers. Exhaustion of the kernel's hugepage quota is
//! recoverable and surfaces as [`AllocError::OutOfHugeMemory`] (or as a
//! `None` return from the allocation operations). Everything else indicates
//! misconfiguration or kernel-state corruption and terminates the process
//! with a diagnostic instead of returning.

use thiserror::Error;

/// Result type alias for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;

/// Errors returned by allocator operations.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The kernel could not back a reservation with hugepages.
    ///
    /// The allocator remains usable: previously handed-out memory is
    /// unaffected and freed pages can still be recycled.
    #[error("out of huge memory: could not reserve {requested} bytes on NUMA node {node}")]
    OutOfHugeMemory {
        /// Bytes requested from the kernel, rounded to whole hugepages.
        requested: usize,
        /// The NUMA node the reservation was pinned to.
        node: u32,
    },
}

impl AllocError {
    /// Returns true if the error reports hugepage exhaustion.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfHugeMemory { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AllocError::OutOfHugeMemory {
            requested: 4 * 1024 * 1024,
            node: 1,
        };
        assert!(err.to_string().contains("4194304"));
        assert!(err.to_string().contains("node 1"));
    }

    #[test]
    fn test_classification() {
        let err = AllocError::OutOfHugeMemory {
            requested: 2 * 1024 * 1024,
            node: 0,
        };
        assert!(err.is_out_of_memory());
    }
}
