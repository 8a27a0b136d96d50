//! Shared buffer object

use crate::attachment::DmaBufAttachment;
use crate::fd::{FdFlags, FileObject};
use crate::ops::{DmaBufOps, VAddr, VmArea};
use crate::reservation::Reservation;
use crate::{Error, Result, PAGE_SHIFT};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Parameters for [`DmaBuf::export`]
pub struct ExportInfo {
    exp_name: &'static str,
    ops: &'static DmaBufOps,
    size: usize,
    flags: FdFlags,
    private: Option<Arc<dyn Any + Send + Sync>>,
    sync: bool,
}

impl ExportInfo {
    pub fn new(ops: &'static DmaBufOps, size: usize) -> Self {
        Self {
            exp_name: "unknown",
            ops,
            size,
            flags: FdFlags::default(),
            private: None,
            sync: true,
        }
    }

    /// Attach exporter-private data
    pub fn private<T: Any + Send + Sync>(mut self, private: Arc<T>) -> Self {
        self.private = Some(private);
        self
    }

    /// Exporter name, used in diagnostics
    pub fn exp_name(mut self, name: &'static str) -> Self {
        self.exp_name = name;
        self
    }

    /// Default flags for descriptors created from this buffer
    pub fn flags(mut self, flags: FdFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Export without reservation state; fences and poll are then refused
    pub fn without_sync(mut self) -> Self {
        self.sync = false;
        self
    }
}

struct VmapCache {
    ptr: VAddr,
    count: usize,
}

/// State guarded by the buffer lock
pub(crate) struct BufState {
    pub(crate) attachments: Vec<Arc<DmaBufAttachment>>,
    vmap: Option<VmapCache>,
}

/// Buffer shared between devices, always handled through `Arc<DmaBuf>`
///
/// The `Arc` strong count is the buffer's reference count; the exporter's
/// release hook runs when the last reference is dropped.
pub struct DmaBuf {
    id: u64,
    size: usize,
    exp_name: &'static str,
    flags: FdFlags,
    ops: &'static DmaBufOps,
    private: Arc<dyn Any + Send + Sync>,
    pub(crate) state: Mutex<BufState>,
    resv: Option<Reservation>,
}

impl DmaBuf {
    /// Create a new buffer wrapping exporter-private data and operations
    pub fn export(info: ExportInfo) -> Result<Arc<Self>> {
        let private = match info.private {
            Some(p) => p,
            None => {
                warn!("{}: export without private data", info.exp_name);
                return Err(Error::InvalidArgument("missing exporter private data".into()));
            }
        };
        if let Some(hook) = info.ops.missing_mandatory() {
            warn!("{}: export with missing {} operation", info.exp_name, hook);
            return Err(Error::InvalidArgument(format!("missing mandatory operation {}", hook)));
        }

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let buf = Arc::new(Self {
            id,
            size: info.size,
            exp_name: info.exp_name,
            flags: info.flags,
            ops: info.ops,
            private,
            state: Mutex::new(BufState {
                attachments: Vec::new(),
                vmap: None,
            }),
            resv: info.sync.then(Reservation::new),
        });
        debug!("exported dma-buf {} ({}, {} bytes)", id, buf.exp_name, buf.size);
        Ok(buf)
    }

    /// Unique buffer id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Size in whole pages
    pub fn num_pages(&self) -> usize {
        self.size >> PAGE_SHIFT
    }

    pub fn exp_name(&self) -> &'static str {
        self.exp_name
    }

    /// Default descriptor flags
    pub fn flags(&self) -> FdFlags {
        self.flags
    }

    pub(crate) fn ops(&self) -> &'static DmaBufOps {
        self.ops
    }

    /// Exporter-private data, downcast to the exporter's type
    pub fn private<T: Any>(&self) -> Result<&T> {
        self.private
            .downcast_ref::<T>()
            .ok_or_else(|| Error::InvalidArgument("exporter private data type mismatch".into()))
    }

    /// Reservation state, absent when exported without sync support
    pub fn reservation(&self) -> Option<&Reservation> {
        self.resv.as_ref()
    }

    /// Whether fences and poll are available
    pub fn has_sync(&self) -> bool {
        self.resv.is_some()
    }

    /// Drop one reference
    pub fn put(self: Arc<Self>) {
        drop(self);
    }

    /// Number of attached devices
    pub fn attachment_count(&self) -> usize {
        self.state.lock().attachments.len()
    }

    /// Current vmap reference count
    pub fn vmap_count(&self) -> usize {
        self.state.lock().vmap.as_ref().map_or(0, |v| v.count)
    }

    /// Map one page for short, non-sleeping CPU access
    pub fn kmap_atomic(&self, page_num: usize) -> Option<VAddr> {
        if page_num >= self.num_pages() {
            warn!("dma-buf {}: kmap_atomic of page {} out of range", self.id, page_num);
            return None;
        }
        self.ops.kmap_atomic.and_then(|kmap| kmap(self, page_num))
    }

    /// Unmap a page obtained by [`DmaBuf::kmap_atomic`]
    pub fn kunmap_atomic(&self, page_num: usize, vaddr: VAddr) {
        if let Some(kunmap) = self.ops.kunmap_atomic {
            kunmap(self, page_num, vaddr);
        }
    }

    /// Map one page into the kernel address space
    pub fn kmap(&self, page_num: usize) -> Option<VAddr> {
        if page_num >= self.num_pages() {
            warn!("dma-buf {}: kmap of page {} out of range", self.id, page_num);
            return None;
        }
        self.ops.kmap.and_then(|kmap| kmap(self, page_num))
    }

    /// Unmap a page obtained by [`DmaBuf::kmap`]
    pub fn kunmap(&self, page_num: usize, vaddr: VAddr) {
        if let Some(kunmap) = self.ops.kunmap {
            kunmap(self, page_num, vaddr);
        }
    }

    /// Linear kernel mapping of the whole buffer
    ///
    /// The mapping is created once and shared; every successful call must be
    /// paired with [`DmaBuf::vunmap`]. Returns `None` if the exporter has no
    /// vmap support or the mapping fails.
    pub fn vmap(&self) -> Option<VAddr> {
        let vmap = self.ops.vmap?;

        let mut state = self.state.lock();
        if let Some(cache) = state.vmap.as_mut() {
            cache.count += 1;
            return Some(cache.ptr);
        }

        match vmap(self) {
            Some(ptr) => {
                state.vmap = Some(VmapCache { ptr, count: 1 });
                Some(ptr)
            }
            None => {
                debug!("dma-buf {}: exporter vmap failed", self.id);
                None
            }
        }
    }

    /// Release a mapping obtained by [`DmaBuf::vmap`]
    ///
    /// # Panics
    /// If the buffer is not vmapped or `vaddr` is not the cached mapping.
    pub fn vunmap(&self, vaddr: VAddr) {
        let mut state = self.state.lock();
        let cache = match state.vmap.as_mut() {
            Some(cache) if cache.ptr == vaddr => cache,
            Some(cache) => {
                error!(
                    "dma-buf {}: vunmap of {:p}, mapped at {:p}",
                    self.id,
                    vaddr.as_ptr(),
                    cache.ptr.as_ptr()
                );
                panic!("dma-buf {}: vunmap address mismatch", self.id);
            }
            None => {
                error!("dma-buf {}: vunmap without vmap", self.id);
                panic!("dma-buf {}: vunmap of unmapped buffer", self.id);
            }
        };

        cache.count -= 1;
        if cache.count == 0 {
            if let Some(vunmap) = self.ops.vunmap {
                vunmap(self, vaddr);
            }
            state.vmap = None;
        }
    }

    /// Map the buffer into a user region starting at page `pgoff`
    ///
    /// The region's backing file is rebound to this buffer so that later
    /// faults and close go through it.
    pub fn mmap(self: &Arc<Self>, vma: &mut VmArea, pgoff: usize) -> Result<()> {
        let end = pgoff.checked_add(vma.pages()).ok_or(Error::Overflow)?;
        if end > self.num_pages() {
            return Err(Error::InvalidArgument(format!(
                "mmap of pages {}..{} beyond {} pages",
                pgoff,
                end,
                self.num_pages()
            )));
        }

        vma.file = Some(FileObject::DmaBuf(Arc::clone(self)));
        vma.pgoff = pgoff;

        self.call_mmap(vma)
    }

    pub(crate) fn call_mmap(&self, vma: &mut VmArea) -> Result<()> {
        match self.ops.mmap {
            Some(mmap) => mmap(self, vma),
            None => Err(Error::InvalidArgument("exporter has no mmap".into())),
        }
    }
}

impl fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuf")
            .field("id", &self.id)
            .field("exp_name", &self.exp_name)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(cache) = &state.vmap {
            error!("dma-buf {}: released with {} vmap(s) outstanding", self.id, cache.count);
            if std::thread::panicking() {
                return;
            }
            panic!("dma-buf {}: released while vmapped", self.id);
        }
        // Attachments are the caller's to detach; they are not detached here.
        let attachments = state.attachments.len();
        if attachments > 0 {
            warn!("dma-buf {}: released with {} attachment(s)", self.id, attachments);
        }

        if let Some(release) = self.ops.release {
            release(self);
        }
        if let Some(resv) = &self.resv {
            resv.fini(self.id);
        }
        debug!("released dma-buf {}", self.id);
    }
}
