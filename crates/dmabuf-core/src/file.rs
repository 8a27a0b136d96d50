//! File-like surface of a buffer: ioctl, poll, advisory locks, mmap

use crate::access::DmaBufAccess;
use crate::buffer::DmaBuf;
use crate::ops::VmArea;
use crate::reservation::PollMask;
use crate::{Error, Result};
use std::time::Duration;
use tracing::warn;

pub const DMABUF_IOCTL_GET_INFO: u32 = 0xc010_4600;
pub const DMABUF_IOCTL_GET_FENCE: u32 = 0xc010_4601;
pub const DMABUF_IOCTL_PUT_FENCE: u32 = 0xc010_4602;

/// Owner name recorded for fences taken through the ioctl interface
const IOCTL_FENCE_OWNER: &str = "3D";

/// Result of `GetInfo`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DmaBufInfo {
    pub size: u64,
    pub fence_supported: u32,
}

/// In/out argument of `GetFence` and `PutFence`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DmaBufFence {
    /// Fence handle, zero when none is held
    pub ctx: u64,
    /// Raw access bits (`DMA_BUF_ACCESS_R` / `DMA_BUF_ACCESS_W`)
    pub access: u32,
}

/// Descriptor-control command with its argument
#[derive(Debug)]
pub enum IoctlCmd<'a> {
    GetInfo(&'a mut DmaBufInfo),
    GetFence(&'a mut DmaBufFence),
    PutFence(&'a mut DmaBufFence),
}

impl IoctlCmd<'_> {
    /// Raw command number
    pub fn number(&self) -> u32 {
        match self {
            IoctlCmd::GetInfo(_) => DMABUF_IOCTL_GET_INFO,
            IoctlCmd::GetFence(_) => DMABUF_IOCTL_GET_FENCE,
            IoctlCmd::PutFence(_) => DMABUF_IOCTL_PUT_FENCE,
        }
    }
}

/// Untyped ioctl argument for raw-number dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlArg {
    Info(DmaBufInfo),
    Fence(DmaBufFence),
}

pub const F_RDLCK: i16 = 0;
pub const F_WRLCK: i16 = 1;
pub const F_UNLCK: i16 = 2;
pub const FL_SLEEP: u32 = 128;

/// Kind of advisory lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
    Unlock,
}

/// Advisory lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLock {
    pub kind: LockKind,
    /// Sleep until the lock is available
    pub sleep: bool,
}

impl FileLock {
    pub fn new(kind: LockKind, sleep: bool) -> Self {
        Self { kind, sleep }
    }

    /// Decode POSIX `l_type` and lock flags
    pub fn from_raw(fl_type: i16, fl_flags: u32) -> Result<Self> {
        let kind = match fl_type {
            F_RDLCK => LockKind::Read,
            F_WRLCK => LockKind::Write,
            F_UNLCK => LockKind::Unlock,
            other => return Err(Error::InvalidArgument(format!("lock type {}", other))),
        };
        Ok(Self {
            kind,
            sleep: fl_flags & FL_SLEEP != 0,
        })
    }
}

impl DmaBuf {
    /// Dispatch a descriptor-control command
    pub fn ioctl(&self, cmd: IoctlCmd<'_>) -> Result<()> {
        match cmd {
            IoctlCmd::GetInfo(info) => {
                self.get_info(info);
                Ok(())
            }
            IoctlCmd::GetFence(fence) => self.get_fence(fence),
            IoctlCmd::PutFence(fence) => self.put_fence(fence),
        }
    }

    /// Dispatch by raw command number
    ///
    /// An argument of the wrong shape for the command is a `Fault`.
    pub fn ioctl_raw(&self, nr: u32, arg: &mut IoctlArg) -> Result<()> {
        match (nr, arg) {
            (DMABUF_IOCTL_GET_INFO, IoctlArg::Info(info)) => self.ioctl(IoctlCmd::GetInfo(info)),
            (DMABUF_IOCTL_GET_FENCE, IoctlArg::Fence(f)) => self.ioctl(IoctlCmd::GetFence(f)),
            (DMABUF_IOCTL_PUT_FENCE, IoctlArg::Fence(f)) => self.ioctl(IoctlCmd::PutFence(f)),
            (DMABUF_IOCTL_GET_INFO | DMABUF_IOCTL_GET_FENCE | DMABUF_IOCTL_PUT_FENCE, _) => {
                Err(Error::Fault)
            }
            (nr, _) => Err(Error::InvalidArgument(format!("unknown ioctl {:#x}", nr))),
        }
    }

    fn get_info(&self, info: &mut DmaBufInfo) {
        info.size = self.size() as u64;
        info.fence_supported = self.has_sync() as u32;
    }

    fn get_fence(&self, fence: &mut DmaBufFence) -> Result<()> {
        let resv = self.reservation().ok_or(Error::PermissionDenied)?;
        if fence.ctx != 0 {
            warn!("dma-buf {}: fence context {:#x} already set", self.id(), fence.ctx);
            return Err(Error::Busy);
        }
        let access = DmaBufAccess::from_raw(fence.access)
            .ok_or_else(|| Error::InvalidArgument(format!("access type {:#x}", fence.access)))?;

        match resv.acquire_fence(access, IOCTL_FENCE_OWNER) {
            Ok(handle) => {
                fence.ctx = handle.raw();
                Ok(())
            }
            Err(e) => {
                warn!("dma-buf {}: fence acquire failed: {}", self.id(), e);
                fence.ctx = 0;
                Err(e)
            }
        }
    }

    fn put_fence(&self, fence: &mut DmaBufFence) -> Result<()> {
        let resv = self.reservation().ok_or(Error::PermissionDenied)?;
        if fence.ctx == 0 {
            warn!("dma-buf {}: put of empty fence context", self.id());
            return Err(Error::Fault);
        }
        resv.release_fence(fence.ctx)?;
        fence.ctx = 0;
        Ok(())
    }

    /// Readiness: `POLLERR` without sync support, else the reservation edge
    pub fn poll(&self) -> PollMask {
        match self.reservation() {
            Some(resv) => resv.poll(),
            None => PollMask::POLLERR,
        }
    }

    /// Like [`DmaBuf::poll`], sleeping up to `timeout` for the next edge
    pub fn poll_wait(&self, timeout: Duration) -> PollMask {
        match self.reservation() {
            Some(resv) => resv.poll_wait(timeout),
            None => PollMask::POLLERR,
        }
    }

    /// Map an advisory lock request onto the reservation
    pub fn flock(&self, lock: &FileLock) -> Result<()> {
        let resv = self.reservation().ok_or(Error::PermissionDenied)?;
        match lock.kind {
            LockKind::Unlock => resv.unlock(),
            LockKind::Read => resv.lock(DmaBufAccess::Read, lock.sleep),
            LockKind::Write => resv.lock(DmaBufAccess::Write, lock.sleep),
        }
    }

    /// mmap through the buffer's own file, at the region's page offset
    pub fn mmap_internal(&self, vma: &mut VmArea) -> Result<()> {
        let end = vma.pgoff.checked_add(vma.pages()).ok_or(Error::Overflow)?;
        if end > self.num_pages() {
            return Err(Error::InvalidArgument(format!(
                "mmap of pages {}..{} beyond {} pages",
                vma.pgoff,
                end,
                self.num_pages()
            )));
        }
        self.call_mmap(vma)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{DMA_BUF_ACCESS_R, DMA_BUF_ACCESS_W};
    use crate::fd::{FdFlags, FdTable, FileObject};
    use crate::testing::{test_buffer, test_buffer_nosync};
    use crate::PAGE_SIZE;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use tracing_test::traced_test;

    #[test]
    fn test_get_info() {
        let (buf, _exp) = test_buffer(3 * PAGE_SIZE);
        let mut info = DmaBufInfo::default();
        buf.ioctl(IoctlCmd::GetInfo(&mut info)).unwrap();
        assert_eq!(info.size, 3 * PAGE_SIZE as u64);
        assert_eq!(info.fence_supported, 1);

        let (nosync, _exp) = test_buffer_nosync(PAGE_SIZE);
        nosync.ioctl(IoctlCmd::GetInfo(&mut info)).unwrap();
        assert_eq!(info.fence_supported, 0);
    }

    #[test]
    fn test_fence_round_trip() {
        let (buf, _exp) = test_buffer(PAGE_SIZE);
        let mut fence = DmaBufFence {
            ctx: 0,
            access: DMA_BUF_ACCESS_W,
        };
        buf.ioctl(IoctlCmd::GetFence(&mut fence)).unwrap();
        assert_ne!(fence.ctx, 0);
        assert_eq!(buf.reservation().unwrap().access(), Some(DmaBufAccess::Write));

        buf.ioctl(IoctlCmd::PutFence(&mut fence)).unwrap();
        assert_eq!(fence.ctx, 0);
        assert!(!buf.reservation().unwrap().is_locked());
    }

    #[test]
    #[traced_test]
    fn test_get_fence_busy() {
        let (buf, _exp) = test_buffer(PAGE_SIZE);
        let mut fence = DmaBufFence {
            ctx: 7,
            access: DMA_BUF_ACCESS_R,
        };
        assert_eq!(buf.ioctl(IoctlCmd::GetFence(&mut fence)), Err(Error::Busy));
        assert_eq!(fence.ctx, 7);
        assert!(!buf.reservation().unwrap().is_locked());
        assert!(logs_contain("already set"));
    }

    #[test]
    fn test_put_fence_errors() {
        let (buf, _exp) = test_buffer(PAGE_SIZE);
        let mut fence = DmaBufFence::default();
        assert_eq!(buf.ioctl(IoctlCmd::PutFence(&mut fence)), Err(Error::Fault));

        fence.ctx = 0x1_0000_0001;
        assert_eq!(buf.ioctl(IoctlCmd::PutFence(&mut fence)), Err(Error::Fault));
        assert_eq!(fence.ctx, 0x1_0000_0001);
    }

    #[test]
    fn test_fence_from_other_buffer() {
        let (a, _ea) = test_buffer(PAGE_SIZE);
        let (b, _eb) = test_buffer(PAGE_SIZE);
        let mut fence = DmaBufFence {
            ctx: 0,
            access: DMA_BUF_ACCESS_R,
        };
        a.ioctl(IoctlCmd::GetFence(&mut fence)).unwrap();
        // handle tables are per buffer
        let mut stolen = fence;
        assert_eq!(b.ioctl(IoctlCmd::PutFence(&mut stolen)), Err(Error::Fault));
        a.ioctl(IoctlCmd::PutFence(&mut fence)).unwrap();
    }

    #[test]
    fn test_fence_without_sync() {
        let (buf, _exp) = test_buffer_nosync(PAGE_SIZE);
        let mut fence = DmaBufFence {
            ctx: 0,
            access: DMA_BUF_ACCESS_R,
        };
        assert_eq!(buf.ioctl(IoctlCmd::GetFence(&mut fence)), Err(Error::PermissionDenied));
        fence.ctx = 1;
        assert_eq!(buf.ioctl(IoctlCmd::PutFence(&mut fence)), Err(Error::PermissionDenied));
        assert_eq!(buf.poll(), PollMask::POLLERR);
    }

    #[test]
    fn test_get_fence_bad_access() {
        let (buf, _exp) = test_buffer(PAGE_SIZE);
        let mut fence = DmaBufFence { ctx: 0, access: 0 };
        assert!(matches!(
            buf.ioctl(IoctlCmd::GetFence(&mut fence)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_ioctl_raw() {
        let (buf, _exp) = test_buffer(PAGE_SIZE);
        let mut arg = IoctlArg::Info(DmaBufInfo::default());
        buf.ioctl_raw(DMABUF_IOCTL_GET_INFO, &mut arg).unwrap();
        assert!(matches!(arg, IoctlArg::Info(DmaBufInfo { size, .. }) if size == PAGE_SIZE as u64));

        assert_eq!(buf.ioctl_raw(DMABUF_IOCTL_GET_FENCE, &mut arg), Err(Error::Fault));
        assert!(matches!(buf.ioctl_raw(0x1234, &mut arg), Err(Error::InvalidArgument(_))));

        let mut arg = IoctlArg::Fence(DmaBufFence {
            ctx: 0,
            access: DMA_BUF_ACCESS_R,
        });
        buf.ioctl_raw(DMABUF_IOCTL_GET_FENCE, &mut arg).unwrap();
        buf.ioctl_raw(DMABUF_IOCTL_PUT_FENCE, &mut arg).unwrap();
        assert!(matches!(arg, IoctlArg::Fence(DmaBufFence { ctx: 0, .. })));
    }

    #[test]
    fn test_ioctl_through_fd_table() {
        let table = FdTable::new();
        let (buf, _exp) = test_buffer(2 * PAGE_SIZE);
        let fd = buf.fd(&table, FdFlags::default()).unwrap();

        let mut info = DmaBufInfo::default();
        table.ioctl(fd, IoctlCmd::GetInfo(&mut info)).unwrap();
        assert_eq!(info.size, 2 * PAGE_SIZE as u64);

        let other = table
            .install(FileObject::Other(Arc::new(())), FdFlags::default())
            .unwrap();
        assert!(matches!(
            table.ioctl(other, IoctlCmd::GetInfo(&mut info)),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(
            table.ioctl(99, IoctlCmd::GetInfo(&mut info)).unwrap_err().to_errno(),
            -9
        );
    }

    #[test]
    fn test_flock() {
        let (buf, _exp) = test_buffer(PAGE_SIZE);
        buf.flock(&FileLock::from_raw(F_WRLCK, 0).unwrap()).unwrap();
        assert_eq!(
            buf.flock(&FileLock::new(LockKind::Read, false)),
            Err(Error::WouldBlock)
        );
        buf.flock(&FileLock::from_raw(F_UNLCK, 0).unwrap()).unwrap();
        assert!(matches!(
            buf.flock(&FileLock::new(LockKind::Unlock, false)),
            Err(Error::InvalidState(_))
        ));
        assert!(FileLock::from_raw(9, 0).is_err());
        assert!(FileLock::from_raw(F_RDLCK, FL_SLEEP).unwrap().sleep);
    }

    #[test]
    fn test_flock_unlock_leaves_fence_window() {
        let (buf, _exp) = test_buffer(PAGE_SIZE);
        for _ in 0..2 * crate::fence::DEFAULT_FENCE_CAPACITY {
            let mut fence = DmaBufFence {
                ctx: 0,
                access: DMA_BUF_ACCESS_W,
            };
            buf.ioctl(IoctlCmd::GetFence(&mut fence)).unwrap();
            assert!(matches!(
                buf.flock(&FileLock::new(LockKind::Unlock, false)),
                Err(Error::InvalidState(_))
            ));
            assert_eq!(
                buf.flock(&FileLock::new(LockKind::Write, false)),
                Err(Error::WouldBlock)
            );
            buf.ioctl(IoctlCmd::PutFence(&mut fence)).unwrap();
        }
        let resv = buf.reservation().unwrap();
        assert_eq!(resv.fence_count(), 0);
        assert!(!resv.is_locked());
    }

    #[test]
    fn test_flock_sleeps_until_unlock() {
        let table = Arc::new(FdTable::new());
        let (buf, _exp) = test_buffer(PAGE_SIZE);
        let fd = buf.fd(&table, FdFlags::default()).unwrap();
        table.flock(fd, &FileLock::new(LockKind::Write, false)).unwrap();

        let sleeper = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                table.flock(fd, &FileLock::new(LockKind::Read, true)).unwrap();
                table.flock(fd, &FileLock::new(LockKind::Unlock, false)).unwrap();
            })
        };
        while buf.reservation().unwrap().waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        table.flock(fd, &FileLock::new(LockKind::Unlock, false)).unwrap();
        sleeper.join().unwrap();
        assert!(!buf.reservation().unwrap().is_locked());
    }

    #[test]
    fn test_poll_through_file() {
        let (buf, _exp) = test_buffer(PAGE_SIZE);
        assert_eq!(buf.poll(), PollMask::POLLERR);
        buf.flock(&FileLock::new(LockKind::Write, false)).unwrap();
        assert!(buf.poll().is_empty());
        buf.flock(&FileLock::new(LockKind::Unlock, false)).unwrap();
        assert_eq!(buf.poll(), PollMask::POLLIN | PollMask::POLLOUT);
        assert_eq!(buf.poll(), PollMask::POLLERR);
    }

    #[test]
    fn test_file_mmap() {
        let table = FdTable::new();
        let (buf, exp) = test_buffer(4 * PAGE_SIZE);
        let fd = buf.fd(&table, FdFlags::default()).unwrap();

        let mut vma = VmArea::new(0, 2 * PAGE_SIZE);
        vma.pgoff = 2;
        table.mmap(fd, &mut vma).unwrap();
        assert!(vma.mapping.is_some());
        assert!(vma.file.as_ref().unwrap().is_dmabuf());

        let mut vma = VmArea::new(0, 2 * PAGE_SIZE);
        vma.pgoff = 3;
        assert!(matches!(table.mmap(fd, &mut vma), Err(Error::InvalidArgument(_))));
        vma.pgoff = usize::MAX;
        assert_eq!(table.mmap(fd, &mut vma), Err(Error::Overflow));
        assert_eq!(exp.counters.mmap.load(Ordering::SeqCst), 1);
    }
}
