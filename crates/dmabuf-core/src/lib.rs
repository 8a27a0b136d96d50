//! dmabuf - Cross-device shared buffers with reservation fences
//!
//! An exporter wraps its memory in a [`DmaBuf`] behind a static
//! [`DmaBufOps`] table. Importers attach devices, map the buffer into
//! device address space, and coordinate access through the buffer's
//! [`Reservation`], either directly, through descriptor ioctls, or through
//! a multi-buffer [`SyncContext`].

pub mod access;
pub mod attachment;
pub mod buffer;
pub mod error;
pub mod fd;
pub mod fence;
pub mod file;
pub mod guard;
pub mod heap;
pub mod ops;
pub mod reservation;
pub mod sg_table;
pub mod shm;
pub mod sync;

#[cfg(test)]
mod testing;

pub use access::{DmaBufAccess, DmaDirection, DMA_BUF_ACCESS_R, DMA_BUF_ACCESS_W};
pub use attachment::{Device, DmaBufAttachment};
pub use buffer::{DmaBuf, ExportInfo};
pub use error::{to_syscall_ret, Error, Result};
pub use fd::{Fd, FdFlags, FdTable, FileObject};
pub use fence::FenceHandle;
pub use file::{DmaBufFence, DmaBufInfo, FileLock, IoctlArg, IoctlCmd, LockKind};
pub use guard::{CpuAccess, VmapGuard};
pub use heap::{ShmBuffer, ShmHeap};
pub use ops::{DmaBufOps, VAddr, VmArea};
pub use reservation::{PollMask, Reservation};
pub use sg_table::{SgEntry, SgTable};
pub use sync::{single_lock, single_unlock, SyncContext};

/// log2 of the page size
pub const PAGE_SHIFT: usize = 12;
/// Granularity of kmap, mmap and heap allocations
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
