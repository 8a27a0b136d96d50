//! Descriptor table bridging buffers and integer handles

use crate::buffer::DmaBuf;
use crate::file::{FileLock, IoctlCmd};
use crate::ops::VmArea;
use crate::reservation::PollMask;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Default number of descriptor slots
pub const DEFAULT_FD_CAPACITY: usize = 1024;

/// Process-visible handle
pub type Fd = i32;

/// Per-descriptor flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FdFlags {
    /// Close on exec
    pub cloexec: bool,
}

impl FdFlags {
    pub const CLOEXEC: FdFlags = FdFlags { cloexec: true };
}

/// Object a descriptor refers to, tagged by kind
#[derive(Clone)]
pub enum FileObject {
    DmaBuf(Arc<DmaBuf>),
    Other(Arc<dyn Any + Send + Sync>),
}

impl FileObject {
    pub fn is_dmabuf(&self) -> bool {
        matches!(self, FileObject::DmaBuf(_))
    }

    /// The buffer behind this file, `InvalidArgument` for other files
    pub fn as_dmabuf(&self) -> Result<&Arc<DmaBuf>> {
        match self {
            FileObject::DmaBuf(buf) => Ok(buf),
            FileObject::Other(_) => Err(Error::InvalidArgument("not a dma-buf file".into())),
        }
    }

    pub fn into_dmabuf(self) -> Result<Arc<DmaBuf>> {
        match self {
            FileObject::DmaBuf(buf) => Ok(buf),
            FileObject::Other(_) => Err(Error::InvalidArgument("not a dma-buf file".into())),
        }
    }
}

impl fmt::Debug for FileObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileObject::DmaBuf(buf) => f.debug_tuple("DmaBuf").field(&buf.id()).finish(),
            FileObject::Other(_) => f.write_str("Other"),
        }
    }
}

struct FdEntry {
    file: FileObject,
    flags: FdFlags,
}

/// Descriptor table
///
/// Each installed descriptor owns one reference to its file. New descriptors
/// take the lowest free slot.
pub struct FdTable {
    slots: Mutex<Vec<Option<FdEntry>>>,
    capacity: usize,
}

impl FdTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FD_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of open descriptors
    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Install a file, returning its descriptor
    pub fn install(&self, file: FileObject, flags: FdFlags) -> Result<Fd> {
        let mut slots = self.slots.lock();
        let index = match slots.iter().position(|s| s.is_none()) {
            Some(index) => index,
            None if slots.len() < self.capacity => {
                slots.try_reserve(1)?;
                slots.push(None);
                slots.len() - 1
            }
            None => return Err(Error::ResourceExhausted),
        };
        slots[index] = Some(FdEntry { file, flags });
        Ok(index as Fd)
    }

    /// Resolve a descriptor, taking a new reference to its file
    pub fn get(&self, fd: Fd) -> Result<FileObject> {
        let slots = self.slots.lock();
        Self::entry(&slots, fd).map(|e| e.file.clone())
    }

    /// Flags of an open descriptor
    pub fn flags(&self, fd: Fd) -> Result<FdFlags> {
        let slots = self.slots.lock();
        Self::entry(&slots, fd).map(|e| e.flags)
    }

    fn entry(slots: &[Option<FdEntry>], fd: Fd) -> Result<&FdEntry> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| slots.get(i))
            .and_then(|s| s.as_ref())
            .ok_or(Error::NotFound(fd))
    }

    /// Close a descriptor, dropping its reference
    pub fn close(&self, fd: Fd) -> Result<()> {
        let entry = {
            let mut slots = self.slots.lock();
            usize::try_from(fd)
                .ok()
                .and_then(|i| slots.get_mut(i))
                .and_then(|s| s.take())
                .ok_or(Error::NotFound(fd))?
        };
        debug!("closed fd {}", fd);
        // the last reference may run an exporter's release hook; do it unlocked
        drop(entry);
        Ok(())
    }

    fn dmabuf(&self, fd: Fd) -> Result<Arc<DmaBuf>> {
        self.get(fd)?.into_dmabuf()
    }

    /// Descriptor-control call on a buffer descriptor
    pub fn ioctl(&self, fd: Fd, cmd: IoctlCmd<'_>) -> Result<()> {
        self.dmabuf(fd)?.ioctl(cmd)
    }

    /// Readiness of a buffer descriptor
    pub fn poll(&self, fd: Fd) -> PollMask {
        match self.dmabuf(fd) {
            Ok(buf) => buf.poll(),
            Err(_) => PollMask::POLLERR,
        }
    }

    /// Advisory lock on a buffer descriptor
    pub fn flock(&self, fd: Fd, lock: &FileLock) -> Result<()> {
        self.dmabuf(fd)?.flock(lock)
    }

    /// Map a buffer descriptor at the region's own page offset
    pub fn mmap(&self, fd: Fd, vma: &mut VmArea) -> Result<()> {
        let buf = self.dmabuf(fd)?;
        buf.mmap_internal(vma)?;
        vma.file = Some(FileObject::DmaBuf(buf));
        Ok(())
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaBuf {
    /// Install a descriptor for this buffer
    pub fn fd(self: &Arc<Self>, table: &FdTable, flags: FdFlags) -> Result<Fd> {
        let fd = table.install(FileObject::DmaBuf(Arc::clone(self)), flags)?;
        debug!("dma-buf {} installed as fd {}", self.id(), fd);
        Ok(fd)
    }

    /// Resolve a descriptor to its buffer, taking a reference
    pub fn get(table: &FdTable, fd: Fd) -> Result<Arc<DmaBuf>> {
        table.get(fd)?.into_dmabuf()
    }
}
