//! System-V shared memory backend.
//!
//! Regions are SysV segments created with `SHM_HUGETLB`, so every byte is
//! backed by the kernel's hugepage pool, and pinned with a strict `mbind`.
//! Segment keys persist in the kernel namespace until removal, which is what
//! lets an out-of-band tool reclaim segments leaked by a crashed process.

use std::io;
use std::ptr::{self, NonNull};

use libc::{c_int, c_uint, c_ulong, c_void};
use tracing::debug;

use crate::constants::HUGEPAGE_SIZE;
use crate::numa::NumaNode;

use super::{SegmentError, SegmentId, SegmentKey, SegmentResult, SegmentSource};

// From numaif.h; not exported by the libc crate.
const MPOL_BIND: c_int = 2;

const SHM_PERMISSIONS: c_int = 0o666;

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

/// Segment source backed by System-V hugepage shared memory.
#[derive(Debug, Default)]
pub struct SysvShm;

impl SysvShm {
    /// Creates the backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl SegmentSource for SysvShm {
    fn create_exclusive(&mut self, key: SegmentKey, size: usize) -> SegmentResult<SegmentId> {
        debug_assert!(size % HUGEPAGE_SIZE == 0);

        // SAFETY: shmget has no memory-safety preconditions.
        let id = unsafe {
            libc::shmget(
                key.raw(),
                size,
                libc::IPC_CREAT | libc::IPC_EXCL | libc::SHM_HUGETLB | SHM_PERMISSIONS,
            )
        };
        if id == -1 {
            let errno = last_errno();
            return Err(match errno {
                libc::EEXIST => SegmentError::KeyExists { key },
                libc::ENOMEM => SegmentError::OutOfMemory { key, size },
                libc::EACCES => SegmentError::PermissionDenied {
                    operation: "segment creation",
                },
                libc::EINVAL => SegmentError::InvalidSize { size },
                _ => SegmentError::Unexpected {
                    operation: "shmget",
                    errno,
                },
            });
        }

        debug!(key = %key, id, size, "created hugetlb segment");
        Ok(SegmentId::new(id))
    }

    fn attach(&mut self, id: SegmentId) -> SegmentResult<NonNull<u8>> {
        // SAFETY: a null shmaddr lets the kernel pick the mapping address.
        let addr = unsafe { libc::shmat(id.raw(), ptr::null(), 0) };
        // shmat reports failure as (void *)-1, not as a null pointer.
        if addr as isize == -1 {
            return Err(SegmentError::AttachFailed {
                id,
                errno: last_errno(),
            });
        }
        NonNull::new(addr.cast::<u8>()).ok_or(SegmentError::AttachFailed { id, errno: 0 })
    }

    fn bind(&mut self, base: NonNull<u8>, len: usize, node: NumaNode) -> SegmentResult<()> {
        let nodemask: c_ulong = 1 << c_ulong::from(node.id());
        let maxnode = 8 * std::mem::size_of::<c_ulong>() as c_ulong;

        // SAFETY: [base, base + len) is a mapping we just attached; the
        // nodemask outlives the call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                base.as_ptr().cast::<c_void>(),
                len as c_ulong,
                MPOL_BIND,
                std::ptr::addr_of!(nodemask),
                maxnode,
                0 as c_uint,
            )
        };
        if rc != 0 {
            return Err(SegmentError::BindFailed {
                node: node.id(),
                errno: last_errno(),
            });
        }
        Ok(())
    }

    fn lookup(&mut self, key: SegmentKey) -> SegmentResult<SegmentId> {
        // SAFETY: shmget has no memory-safety preconditions.
        let id = unsafe { libc::shmget(key.raw(), 0, 0) };
        if id == -1 {
            let errno = last_errno();
            return Err(match errno {
                libc::ENOENT => SegmentError::NotFound { key },
                libc::EACCES => SegmentError::PermissionDenied {
                    operation: "segment lookup",
                },
                _ => SegmentError::Unexpected {
                    operation: "shmget lookup",
                    errno,
                },
            });
        }
        Ok(SegmentId::new(id))
    }

    fn remove(&mut self, id: SegmentId) -> SegmentResult<()> {
        // SAFETY: IPC_RMID takes no buffer argument.
        let rc = unsafe { libc::shmctl(id.raw(), libc::IPC_RMID, ptr::null_mut()) };
        if rc != 0 {
            return Err(SegmentError::RemoveFailed {
                id,
                errno: last_errno(),
            });
        }
        Ok(())
    }

    fn detach(&mut self, base: NonNull<u8>, _len: usize) -> SegmentResult<()> {
        // SAFETY: base came from a successful attach and has not been
        // detached before.
        let rc = unsafe { libc::shmdt(base.as_ptr().cast::<c_void>().cast_const()) };
        if rc != 0 {
            return Err(SegmentError::DetachFailed {
                addr: base.as_ptr() as usize,
                errno: last_errno(),
            });
        }
        Ok(())
    }
}
