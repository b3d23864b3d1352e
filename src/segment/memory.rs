//! In-memory segment backend.
//!
//! Serves the allocator from hugepage-aligned heap memory instead of kernel
//! shared memory. Used by the test suite and benchmarks, and usable on hosts
//! with no hugepage quota; an optional byte capacity simulates quota
//! exhaustion.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;

use crate::constants::HUGEPAGE_SIZE;
use crate::numa::NumaNode;

use super::{SegmentError, SegmentId, SegmentKey, SegmentResult, SegmentSource};

#[derive(Debug)]
struct Segment {
    ptr: NonNull<u8>,
    layout: Layout,
    removed: bool,
}

/// Segment source backed by aligned heap allocations.
///
/// Mirrors the kernel segment lifecycle closely enough for the allocator
/// not to notice: keyed exclusive creation, attach before use, removal
/// marking, and memory that survives until detach.
#[derive(Debug, Default)]
pub struct MemorySegments {
    capacity: Option<usize>,
    in_use: usize,
    next_id: i32,
    by_key: HashMap<SegmentKey, SegmentId>,
    segments: HashMap<SegmentId, Segment>,
}

impl MemorySegments {
    /// Creates a backend with no capacity limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend that refuses to back more than `capacity` bytes at
    /// once, reporting exhaustion exactly as an empty hugepage pool would.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            in_use: 0,
            next_id: 0,
            by_key: HashMap::new(),
            segments: HashMap::new(),
        }
    }

    /// Returns the bytes currently backing live segments.
    #[inline]
    #[must_use]
    pub fn bytes_in_use(&self) -> usize {
        self.in_use
    }
}

impl SegmentSource for MemorySegments {
    fn create_exclusive(&mut self, key: SegmentKey, size: usize) -> SegmentResult<SegmentId> {
        debug_assert!(size % HUGEPAGE_SIZE == 0);

        if self.by_key.contains_key(&key) {
            return Err(SegmentError::KeyExists { key });
        }
        if let Some(capacity) = self.capacity {
            if self.in_use + size > capacity {
                return Err(SegmentError::OutOfMemory { key, size });
            }
        }

        let layout = Layout::from_size_align(size, HUGEPAGE_SIZE)
            .map_err(|_| SegmentError::InvalidSize { size })?;
        // SAFETY: size is non-zero (a whole number of hugepages).
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or(SegmentError::OutOfMemory { key, size })?;

        let id = SegmentId::new(self.next_id);
        self.next_id += 1;
        self.in_use += size;
        self.by_key.insert(key, id);
        self.segments.insert(
            id,
            Segment {
                ptr,
                layout,
                removed: false,
            },
        );
        Ok(id)
    }

    fn attach(&mut self, id: SegmentId) -> SegmentResult<NonNull<u8>> {
        self.segments
            .get(&id)
            .filter(|segment| !segment.removed)
            .map(|segment| segment.ptr)
            .ok_or(SegmentError::AttachFailed { id, errno: 0 })
    }

    fn bind(&mut self, _base: NonNull<u8>, _len: usize, node: NumaNode) -> SegmentResult<()> {
        // Heap memory has no node affinity to enforce; reject only masks
        // that the strict-bind nodemask could not express.
        if u64::from(node.id()) >= 64 {
            return Err(SegmentError::BindFailed {
                node: node.id(),
                errno: 0,
            });
        }
        Ok(())
    }

    fn lookup(&mut self, key: SegmentKey) -> SegmentResult<SegmentId> {
        self.by_key
            .get(&key)
            .copied()
            .ok_or(SegmentError::NotFound { key })
    }

    fn remove(&mut self, id: SegmentId) -> SegmentResult<()> {
        let segment = self
            .segments
            .get_mut(&id)
            .ok_or(SegmentError::RemoveFailed { id, errno: 0 })?;
        segment.removed = true;
        // The key is released immediately; the memory lives until detach.
        self.by_key.retain(|_, v| *v != id);
        Ok(())
    }

    fn detach(&mut self, base: NonNull<u8>, _len: usize) -> SegmentResult<()> {
        let id = self
            .segments
            .iter()
            .find(|(_, segment)| segment.ptr == base)
            .map(|(id, _)| *id)
            .ok_or(SegmentError::DetachFailed {
                addr: base.as_ptr() as usize,
                errno: 0,
            })?;

        let segment = self.segments.remove(&id).expect("segment found above");
        self.in_use -= segment.layout.size();
        // SAFETY: allocated with this layout in create_exclusive and not
        // freed before; detach is the single release point.
        unsafe { alloc::dealloc(segment.ptr.as_ptr(), segment.layout) };
        Ok(())
    }
}

impl Drop for MemorySegments {
    fn drop(&mut self) {
        for segment in self.segments.values() {
            // SAFETY: each surviving segment still owns its allocation.
            unsafe { alloc::dealloc(segment.ptr.as_ptr(), segment.layout) };
        }
    }
}
