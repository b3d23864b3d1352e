//! Allocator configuration.

use crate::constants::{DEFAULT_INITIAL_SIZE, HUGEPAGE_SIZE, MAX_ALLOC_SIZE, MAX_NUMA_NODES};
use crate::numa::NumaNode;

/// Configuration for a [`HugeAllocator`](crate::HugeAllocator).
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Bytes reserved eagerly at construction, rounded up to whole hugepages.
    pub initial_size: usize,
    /// NUMA node every region is pinned to.
    pub numa_node: NumaNode,
}

impl AllocatorConfig {
    /// Creates a configuration with the given initial reservation, pinned to
    /// node 0.
    #[must_use]
    pub fn new(initial_size: usize) -> Self {
        Self {
            initial_size,
            numa_node: NumaNode::default(),
        }
    }

    /// Creates a configuration reserving `count` hugepages up front.
    #[must_use]
    pub fn from_hugepages(count: usize) -> Self {
        Self::new(count * HUGEPAGE_SIZE)
    }

    /// Sets the NUMA node.
    #[must_use]
    pub fn with_numa_node(mut self, node: NumaNode) -> Self {
        self.numa_node = node;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.initial_size == 0 {
            return Err("initial_size must be > 0");
        }
        if self.initial_size > MAX_ALLOC_SIZE {
            return Err("initial_size exceeds the per-call allocation limit");
        }
        if self.numa_node.id() > MAX_NUMA_NODES {
            return Err("numa_node exceeds the supported node range");
        }
        Ok(())
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_SIZE)
    }
}
