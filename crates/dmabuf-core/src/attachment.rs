//! Device attachments
//!
//! An attachment binds one consuming device to a buffer. It holds only a weak
//! back-reference: attaching does not keep the buffer alive, and releasing the
//! buffer does not detach anything. Detaching before the last reference goes
//! away is the caller's job; a stale attachment refuses to map.

use crate::access::DmaDirection;
use crate::buffer::DmaBuf;
use crate::sg_table::SgTable;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Device consuming shared buffers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    name: String,
    dma_mask: u64,
}

impl Device {
    /// Create a device able to address the full 64-bit space
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_dma_mask(name, u64::MAX)
    }

    pub fn with_dma_mask(name: impl Into<String>, dma_mask: u64) -> Self {
        Self {
            name: name.into(),
            dma_mask,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Highest device address this device can reach
    pub fn dma_mask(&self) -> u64 {
        self.dma_mask
    }
}

/// Binding between a buffer and one device
pub struct DmaBufAttachment {
    dmabuf: Weak<DmaBuf>,
    buf_id: u64,
    dev: Arc<Device>,
    private: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl DmaBufAttachment {
    /// Attached device
    pub fn device(&self) -> &Arc<Device> {
        &self.dev
    }

    /// Id of the buffer this attachment was created on
    pub fn buf_id(&self) -> u64 {
        self.buf_id
    }

    /// The buffer, if it is still alive
    pub fn dmabuf(&self) -> Option<Arc<DmaBuf>> {
        self.dmabuf.upgrade()
    }

    /// Store exporter-private data, usually from the attach hook
    pub fn set_private<T: Any + Send + Sync>(&self, private: T) {
        *self.private.lock() = Some(Box::new(private));
    }

    /// Run `f` on the exporter-private data if it has type `T`
    pub fn with_private<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.private.lock();
        guard.as_ref().and_then(|p| p.downcast_ref::<T>()).map(f)
    }

    fn live_dmabuf(&self) -> Result<Arc<DmaBuf>> {
        self.dmabuf.upgrade().ok_or_else(|| {
            warn!("attachment of {} outlived dma-buf {}", self.dev.name(), self.buf_id);
            Error::InvalidArgument(format!("dma-buf {} already released", self.buf_id))
        })
    }

    /// Map the buffer into the device's address space
    ///
    /// May sleep: the exporter can wait for memory or pending fences. Runs
    /// without the buffer lock held.
    pub fn map(&self, direction: DmaDirection) -> Result<SgTable> {
        let buf = self.live_dmabuf()?;
        let map = buf
            .ops()
            .map_dma_buf
            .ok_or_else(|| Error::InvalidArgument("exporter has no map".into()))?;
        let sg = map(&buf, self, direction)?;
        debug!(
            "mapped dma-buf {} for {}: {} segment(s), {} bytes",
            self.buf_id,
            self.dev.name(),
            sg.nents(),
            sg.total_len()
        );
        Ok(sg)
    }

    /// Unmap a scatter list obtained by [`DmaBufAttachment::map`]
    pub fn unmap(&self, sg: SgTable, direction: DmaDirection) {
        let buf = match self.dmabuf.upgrade() {
            Some(buf) => buf,
            None => {
                warn!("unmap on attachment of released dma-buf {}", self.buf_id);
                return;
            }
        };
        if let Some(unmap) = buf.ops().unmap_dma_buf {
            unmap(&buf, self, sg, direction);
        }
    }
}

impl fmt::Debug for DmaBufAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBufAttachment")
            .field("buf_id", &self.buf_id)
            .field("dev", &self.dev.name())
            .finish()
    }
}

impl DmaBuf {
    /// Attach a device to this buffer
    ///
    /// The exporter's attach hook, if any, may reject the device or store
    /// private data on the attachment. Concurrent attaches serialize on the
    /// buffer lock.
    pub fn attach(self: &Arc<Self>, dev: &Arc<Device>) -> Result<Arc<DmaBufAttachment>> {
        let attach = Arc::new(DmaBufAttachment {
            dmabuf: Arc::downgrade(self),
            buf_id: self.id(),
            dev: Arc::clone(dev),
            private: Mutex::new(None),
        });

        let mut state = self.state.lock();
        state.attachments.try_reserve(1)?;

        if let Some(hook) = self.ops().attach {
            if let Err(e) = hook(self, dev, &attach) {
                debug!("exporter refused {} on dma-buf {}: {}", dev.name(), self.id(), e);
                return Err(e);
            }
        }
        state.attachments.push(Arc::clone(&attach));
        debug!("attached {} to dma-buf {}", dev.name(), self.id());

        Ok(attach)
    }

    /// Detach a device; the attachment must not be used afterwards
    ///
    /// # Panics
    /// If `attach` does not belong to this buffer.
    pub fn detach(&self, attach: Arc<DmaBufAttachment>) {
        let mut state = self.state.lock();
        let pos = match state.attachments.iter().position(|a| Arc::ptr_eq(a, &attach)) {
            Some(pos) => pos,
            None => {
                error!(
                    "detach of {} from dma-buf {}, attached to dma-buf {}",
                    attach.dev.name(),
                    self.id(),
                    attach.buf_id
                );
                panic!("dma-buf {}: detach of foreign attachment", self.id());
            }
        };
        state.attachments.swap_remove(pos);

        if let Some(detach) = self.ops().detach {
            detach(self, &attach);
        }
        debug!("detached {} from dma-buf {}", attach.dev.name(), self.id());
    }
}
