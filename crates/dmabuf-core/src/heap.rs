//! Shared-memory heap exporter
//!
//! Buffers live in named POSIX shared memory, so another process can import
//! one by name and see the same pages. The mapping is treated as
//! identity-mapped for device addressing.

use crate::access::DmaDirection;
use crate::attachment::DmaBufAttachment;
use crate::buffer::{DmaBuf, ExportInfo};
use crate::ops::{DmaBufOps, VAddr, VmArea};
use crate::sg_table::SgTable;
use crate::shm::SharedMemory;
use crate::{Error, Result, PAGE_SIZE};
use std::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Exporter name reported by heap buffers
pub const SHM_HEAP_NAME: &str = "shm-heap";

/// Exporter-private state of one heap buffer
pub struct ShmBuffer {
    shm: SharedMemory,
    base: VAddr,
    cpu_users: AtomicUsize,
}

impl ShmBuffer {
    fn new(shm: SharedMemory) -> Result<Self> {
        let base = VAddr::new(shm.as_ptr())
            .ok_or_else(|| Error::SharedMemory(format!("{}: null mapping", shm.name())))?;
        Ok(Self {
            shm,
            base,
            cpu_users: AtomicUsize::new(0),
        })
    }

    /// Shared memory name other processes import by
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Number of open CPU access brackets
    pub fn cpu_users(&self) -> usize {
        self.cpu_users.load(Ordering::SeqCst)
    }

    fn page(&self, page_num: usize) -> VAddr {
        // callers bound page_num by the buffer's page count
        unsafe { self.base.add(page_num * PAGE_SIZE) }
    }
}

/// Allocator of shared-memory buffers under a common name prefix
pub struct ShmHeap {
    prefix: String,
    next_id: AtomicU32,
}

impl ShmHeap {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next_id: AtomicU32::new(0),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn buffer_shm_name(&self, id: u32) -> String {
        format!("{}_buf_{}", self.prefix, id)
    }

    /// Allocate a buffer of at least `size` bytes, rounded up to pages
    pub fn allocate(&self, size: usize) -> Result<Arc<DmaBuf>> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-sized allocation".into()));
        }
        let size = size
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(Error::Overflow)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shm = SharedMemory::create(&self.buffer_shm_name(id), size)?;
        Self::export(shm, size)
    }

    /// Import a buffer another process allocated
    pub fn import(&self, name: &str) -> Result<Arc<DmaBuf>> {
        let shm = SharedMemory::open(name)?;
        let size = shm.size() - shm.size() % PAGE_SIZE;
        if size == 0 {
            return Err(Error::InvalidArgument(format!("{}: smaller than a page", name)));
        }
        Self::export(shm, size)
    }

    fn export(shm: SharedMemory, size: usize) -> Result<Arc<DmaBuf>> {
        let name = shm.name().to_string();
        let buffer = Arc::new(ShmBuffer::new(shm)?);
        let buf = DmaBuf::export(
            ExportInfo::new(&SHM_HEAP_OPS, size)
                .private(buffer)
                .exp_name(SHM_HEAP_NAME),
        )?;
        debug!("{} backs dma-buf {}", name, buf.id());
        Ok(buf)
    }

    /// Shared memory name of a heap buffer
    pub fn buffer_name(buf: &DmaBuf) -> Result<&str> {
        Ok(buf.private::<ShmBuffer>()?.name())
    }
}

fn shm_buffer(buf: &DmaBuf) -> Option<&ShmBuffer> {
    let shm = buf.private::<ShmBuffer>().ok();
    if shm.is_none() {
        warn!("dma-buf {}: heap operation on foreign private data", buf.id());
    }
    shm
}

fn foreign(buf: &DmaBuf) -> Error {
    Error::InvalidArgument(format!("dma-buf {} is not a heap buffer", buf.id()))
}

fn heap_map(buf: &DmaBuf, attach: &DmaBufAttachment, _dir: DmaDirection) -> Result<SgTable> {
    let shm = shm_buffer(buf).ok_or_else(|| foreign(buf))?;
    let dev = attach.device();
    let base = shm.base.as_ptr() as u64;
    let last = base + (buf.size() as u64 - 1);
    if last & !dev.dma_mask() != 0 {
        warn!("{}: {:#x} outside dma mask {:#x}", dev.name(), last, dev.dma_mask());
        return Err(Error::InvalidArgument(format!(
            "{} cannot address the buffer",
            dev.name()
        )));
    }
    let mut sg = SgTable::new();
    for page in 0..buf.num_pages() {
        sg.push(base + (page * PAGE_SIZE) as u64, PAGE_SIZE);
    }
    Ok(sg)
}

fn heap_unmap(buf: &DmaBuf, attach: &DmaBufAttachment, sg: SgTable, _dir: DmaDirection) {
    debug!(
        "dma-buf {}: {} unmapped {} segment(s)",
        buf.id(),
        attach.device().name(),
        sg.nents()
    );
}

fn heap_release(buf: &DmaBuf) {
    let Some(shm) = shm_buffer(buf) else {
        return;
    };
    if shm.cpu_users() > 0 {
        warn!("{}: released inside {} CPU access bracket(s)", shm.name(), shm.cpu_users());
    }
    debug!("{}: released", shm.name());
}

fn heap_begin_cpu(buf: &DmaBuf, _start: usize, _len: usize, _dir: DmaDirection) -> Result<()> {
    let shm = shm_buffer(buf).ok_or_else(|| foreign(buf))?;
    shm.cpu_users.fetch_add(1, Ordering::SeqCst);
    fence(Ordering::Acquire);
    Ok(())
}

fn heap_end_cpu(buf: &DmaBuf, _start: usize, _len: usize, _dir: DmaDirection) {
    fence(Ordering::Release);
    if let Some(shm) = shm_buffer(buf) {
        shm.cpu_users.fetch_sub(1, Ordering::SeqCst);
    }
}

fn heap_kmap(buf: &DmaBuf, page_num: usize) -> Option<VAddr> {
    if page_num >= buf.num_pages() {
        return None;
    }
    shm_buffer(buf).map(|shm| shm.page(page_num))
}

fn heap_kunmap(_buf: &DmaBuf, _page_num: usize, _vaddr: VAddr) {}

fn heap_mmap(buf: &DmaBuf, vma: &mut VmArea) -> Result<()> {
    if vma.pgoff >= buf.num_pages() {
        return Err(Error::InvalidArgument(format!("page offset {}", vma.pgoff)));
    }
    let shm = shm_buffer(buf).ok_or_else(|| foreign(buf))?;
    vma.mapping = Some(shm.page(vma.pgoff));
    Ok(())
}

fn heap_vmap(buf: &DmaBuf) -> Option<VAddr> {
    shm_buffer(buf).map(|shm| shm.base)
}

fn heap_vunmap(_buf: &DmaBuf, _vaddr: VAddr) {}

static SHM_HEAP_OPS: DmaBufOps = DmaBufOps {
    attach: None,
    detach: None,
    map_dma_buf: Some(heap_map),
    unmap_dma_buf: Some(heap_unmap),
    release: Some(heap_release),
    begin_cpu_access: Some(heap_begin_cpu),
    end_cpu_access: Some(heap_end_cpu),
    kmap_atomic: Some(heap_kmap),
    kunmap_atomic: Some(heap_kunmap),
    kmap: Some(heap_kmap),
    kunmap: Some(heap_kunmap),
    mmap: Some(heap_mmap),
    vmap: Some(heap_vmap),
    vunmap: Some(heap_vunmap),
};
