//! NUMA node identification.
//!
//! NUMA (Non-Uniform Memory Access) systems attach memory to CPU sockets;
//! memory pinned to the local node is cheaper to touch than remote memory.
//! The allocator binds every region it acquires strictly to one node, so
//! callers name that node with [`NumaNode`].

/// A NUMA node (memory locality domain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NumaNode(u32);

impl NumaNode {
    /// Creates a NUMA node with the specified id.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the node id.
    #[inline]
    #[must_use]
    pub const fn id(self) -> u32 {
        self.0
    }
}

impl Default for NumaNode {
    fn default() -> Self {
        Self(0)
    }
}

impl From<u32> for NumaNode {
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

impl std::fmt::Display for NumaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns whether the host exposes NUMA topology at all.
#[must_use]
pub fn numa_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/sys/devices/system/node").exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Returns the number of NUMA nodes on the host, or 1 when topology is
/// unavailable.
#[must_use]
pub fn numa_node_count() -> usize {
    #[cfg(target_os = "linux")]
    {
        if numa_available() {
            std::fs::read_dir("/sys/devices/system/node")
                .map(|entries| {
                    entries
                        .filter_map(Result::ok)
                        .filter(|e| {
                            let name = e.file_name();
                            let name = name.to_string_lossy();
                            name.starts_with("node")
                                && name[4..].chars().all(|c| c.is_ascii_digit())
                        })
                        .count()
                })
                .map(|n| n.max(1))
                .unwrap_or(1)
        } else {
            1
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        1
    }
}
