//! RAII guards for CPU access and kernel mappings

use crate::access::DmaDirection;
use crate::buffer::DmaBuf;
use crate::ops::VAddr;
use crate::Result;

/// CPU access bracket over a byte range
///
/// Created by [`DmaBuf::begin_cpu_access`]; the exporter's end hook runs when
/// the guard is dropped, on every exit path.
#[must_use = "dropping the guard ends CPU access immediately"]
pub struct CpuAccess<'a> {
    dmabuf: &'a DmaBuf,
    start: usize,
    len: usize,
    direction: DmaDirection,
}

impl CpuAccess<'_> {
    /// Start of the covered range
    pub fn start(&self) -> usize {
        self.start
    }

    /// Length of the covered range
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn direction(&self) -> DmaDirection {
        self.direction
    }
}

impl Drop for CpuAccess<'_> {
    fn drop(&mut self) {
        self.dmabuf.end_cpu_access(self.start, self.len, self.direction);
    }
}

/// Scoped vmap, unmapped on drop
pub struct VmapGuard<'a> {
    dmabuf: &'a DmaBuf,
    vaddr: VAddr,
}

impl VmapGuard<'_> {
    pub fn vaddr(&self) -> VAddr {
        self.vaddr
    }
}

impl Drop for VmapGuard<'_> {
    fn drop(&mut self) {
        self.dmabuf.vunmap(self.vaddr);
    }
}

impl DmaBuf {
    /// Prepare `[start, start + len)` for CPU access in `direction`
    ///
    /// Succeeds without doing anything if the exporter has no begin hook.
    pub fn begin_cpu_access(
        &self,
        start: usize,
        len: usize,
        direction: DmaDirection,
    ) -> Result<CpuAccess<'_>> {
        if let Some(begin) = self.ops().begin_cpu_access {
            begin(self, start, len, direction)?;
        }
        Ok(CpuAccess {
            dmabuf: self,
            start,
            len,
            direction,
        })
    }

    /// Finish CPU access; always succeeds
    ///
    /// Normally called by dropping [`CpuAccess`].
    pub fn end_cpu_access(&self, start: usize, len: usize, direction: DmaDirection) {
        if let Some(end) = self.ops().end_cpu_access {
            end(self, start, len, direction);
        }
    }

    /// vmap the buffer for the guard's lifetime
    pub fn vmap_scoped(&self) -> Option<VmapGuard<'_>> {
        self.vmap().map(|vaddr| VmapGuard { dmabuf: self, vaddr })
    }
}
