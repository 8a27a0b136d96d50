//! Exporter operation table
//!
//! Every exporter hands the core a static [`DmaBufOps`] table. Hooks are
//! nullable function fields: `map_dma_buf`, `unmap_dma_buf`, `release`,
//! `kmap_atomic`, `kmap` and `mmap` are mandatory and checked at export time,
//! the rest are optional and skipped when absent.

use crate::access::DmaDirection;
use crate::attachment::{DmaBufAttachment, Device};
use crate::buffer::DmaBuf;
use crate::fd::FileObject;
use crate::sg_table::SgTable;
use crate::{Result, PAGE_SHIFT};
use std::ptr::NonNull;

/// Kernel-side virtual address handed out by kmap/vmap hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VAddr(NonNull<u8>);

// Safety: VAddr is an address token; dereferencing it is up to the holder,
// who must respect the exporter's coherency rules
unsafe impl Send for VAddr {}
unsafe impl Sync for VAddr {}

impl VAddr {
    /// Wrap a raw pointer, `None` if null
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(VAddr)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Address `offset` bytes further
    ///
    /// # Safety
    /// The result must stay inside the same allocation.
    pub unsafe fn add(&self, offset: usize) -> Self {
        VAddr(NonNull::new_unchecked(self.0.as_ptr().add(offset)))
    }
}

/// User memory region a buffer is mapped into
#[derive(Debug)]
pub struct VmArea {
    /// First address of the region
    pub start: usize,
    /// One past the last address of the region
    pub end: usize,
    /// Offset into the backing file, in pages
    pub pgoff: usize,
    /// Backing file; rebound to the buffer on mmap
    pub file: Option<FileObject>,
    /// Address the exporter resolved the region to
    pub mapping: Option<VAddr>,
}

impl VmArea {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            pgoff: 0,
            file: None,
            mapping: None,
        }
    }

    /// Region length in pages
    pub fn pages(&self) -> usize {
        self.end.saturating_sub(self.start) >> PAGE_SHIFT
    }
}

pub type AttachFn = fn(&DmaBuf, &Device, &DmaBufAttachment) -> Result<()>;
pub type DetachFn = fn(&DmaBuf, &DmaBufAttachment);
pub type MapFn = fn(&DmaBuf, &DmaBufAttachment, DmaDirection) -> Result<SgTable>;
pub type UnmapFn = fn(&DmaBuf, &DmaBufAttachment, SgTable, DmaDirection);
pub type ReleaseFn = fn(&DmaBuf);
pub type BeginCpuAccessFn = fn(&DmaBuf, usize, usize, DmaDirection) -> Result<()>;
pub type EndCpuAccessFn = fn(&DmaBuf, usize, usize, DmaDirection);
pub type KmapFn = fn(&DmaBuf, usize) -> Option<VAddr>;
pub type KunmapFn = fn(&DmaBuf, usize, VAddr);
pub type MmapFn = fn(&DmaBuf, &mut VmArea) -> Result<()>;
pub type VmapFn = fn(&DmaBuf) -> Option<VAddr>;
pub type VunmapFn = fn(&DmaBuf, VAddr);

/// Operation table supplied by an exporter
#[derive(Debug, Clone, Copy)]
pub struct DmaBufOps {
    pub attach: Option<AttachFn>,
    pub detach: Option<DetachFn>,
    pub map_dma_buf: Option<MapFn>,
    pub unmap_dma_buf: Option<UnmapFn>,
    pub release: Option<ReleaseFn>,
    pub begin_cpu_access: Option<BeginCpuAccessFn>,
    pub end_cpu_access: Option<EndCpuAccessFn>,
    pub kmap_atomic: Option<KmapFn>,
    pub kunmap_atomic: Option<KunmapFn>,
    pub kmap: Option<KmapFn>,
    pub kunmap: Option<KunmapFn>,
    pub mmap: Option<MmapFn>,
    pub vmap: Option<VmapFn>,
    pub vunmap: Option<VunmapFn>,
}

impl DmaBufOps {
    /// Table with every hook absent, for `..DmaBufOps::EMPTY` initializers
    pub const EMPTY: Self = Self {
        attach: None,
        detach: None,
        map_dma_buf: None,
        unmap_dma_buf: None,
        release: None,
        begin_cpu_access: None,
        end_cpu_access: None,
        kmap_atomic: None,
        kunmap_atomic: None,
        kmap: None,
        kunmap: None,
        mmap: None,
        vmap: None,
        vunmap: None,
    };

    /// Name of the first missing mandatory hook
    pub fn missing_mandatory(&self) -> Option<&'static str> {
        if self.map_dma_buf.is_none() {
            Some("map_dma_buf")
        } else if self.unmap_dma_buf.is_none() {
            Some("unmap_dma_buf")
        } else if self.release.is_none() {
            Some("release")
        } else if self.kmap_atomic.is_none() {
            Some("kmap_atomic")
        } else if self.kmap.is_none() {
            Some("kmap")
        } else if self.mmap.is_none() {
            Some("mmap")
        } else {
            None
        }
    }
}
