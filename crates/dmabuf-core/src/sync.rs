//! Synchronization contexts over one or more buffers
//!
//! A context collects (buffer, access) requests and takes all of their
//! reservations at once. Reservations are always taken in buffer-id order,
//! so two contexts over overlapping buffers cannot deadlock.

use crate::access::DmaBufAccess;
use crate::buffer::DmaBuf;
use crate::reservation::Reservation;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct SyncObject {
    dmabuf: Arc<DmaBuf>,
    access: DmaBufAccess,
}

impl SyncObject {
    fn resv(&self) -> Result<&Reservation> {
        self.dmabuf.reservation().ok_or(Error::PermissionDenied)
    }
}

/// Named set of buffers locked and unlocked together
pub struct SyncContext {
    name: String,
    objects: Vec<SyncObject>,
    locked: bool,
}

impl SyncContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Vec::new(),
            locked: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of buffers in the context
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Add a buffer with the access it will be locked for
    pub fn get(&mut self, dmabuf: &Arc<DmaBuf>, access: DmaBufAccess) -> Result<()> {
        if self.locked {
            return Err(Error::InvalidState(format!("{}: context is locked", self.name)));
        }
        if !dmabuf.has_sync() {
            return Err(Error::PermissionDenied);
        }
        if self.objects.iter().any(|o| o.dmabuf.id() == dmabuf.id()) {
            return Err(Error::InvalidArgument(format!(
                "{}: dma-buf {} already in context",
                self.name,
                dmabuf.id()
            )));
        }
        self.objects.try_reserve(1)?;
        self.objects.push(SyncObject {
            dmabuf: Arc::clone(dmabuf),
            access,
        });
        Ok(())
    }

    /// Remove a buffer from the context
    pub fn put(&mut self, dmabuf: &DmaBuf) -> Result<()> {
        if self.locked {
            return Err(Error::InvalidState(format!("{}: context is locked", self.name)));
        }
        let pos = self
            .objects
            .iter()
            .position(|o| o.dmabuf.id() == dmabuf.id())
            .ok_or_else(|| {
                Error::InvalidArgument(format!("{}: dma-buf {} not in context", self.name, dmabuf.id()))
            })?;
        self.objects.remove(pos);
        Ok(())
    }

    /// Lock every buffer, sleeping as needed
    pub fn lock(&mut self) -> Result<()> {
        self.lock_all(None)
    }

    /// Lock every buffer, giving up after `timeout`
    ///
    /// On timeout nothing stays locked.
    pub fn lock_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.lock_all(Some(Instant::now() + timeout))
    }

    fn lock_all(&mut self, deadline: Option<Instant>) -> Result<()> {
        if self.locked {
            return Err(Error::InvalidState(format!("{}: already locked", self.name)));
        }
        if self.objects.is_empty() {
            return Err(Error::InvalidArgument(format!("{}: no buffers to lock", self.name)));
        }
        self.objects.sort_by_key(|o| o.dmabuf.id());

        for (i, obj) in self.objects.iter().enumerate() {
            let res = obj.resv().and_then(|resv| match deadline {
                Some(deadline) => resv.lock_until(obj.access, deadline),
                None => resv.lock(obj.access, true),
            });
            if let Err(e) = res {
                debug!("{}: lock of dma-buf {} failed: {}", self.name, obj.dmabuf.id(), e);
                for held in self.objects[..i].iter().rev() {
                    if let Err(undo) = held.resv().and_then(|resv| resv.unlock()) {
                        warn!(
                            "{}: rollback of dma-buf {} failed: {}",
                            self.name,
                            held.dmabuf.id(),
                            undo
                        );
                    }
                }
                return Err(e);
            }
        }

        self.locked = true;
        debug!("{}: locked {} buffer(s)", self.name, self.objects.len());
        Ok(())
    }

    /// Unlock every buffer
    pub fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            return Err(Error::InvalidState(format!("{}: not locked", self.name)));
        }
        self.locked = false;

        let mut result = Ok(());
        for obj in self.objects.iter().rev() {
            if let Err(e) = obj.resv().and_then(|resv| resv.unlock()) {
                result = result.and(Err(e));
            }
        }
        result
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        if self.locked {
            warn!("{}: dropped while locked", self.name);
            let _ = self.unlock();
        }
    }
}

/// Lock a single buffer
pub fn single_lock(dmabuf: &DmaBuf, access: DmaBufAccess, wait: bool) -> Result<()> {
    dmabuf
        .reservation()
        .ok_or(Error::PermissionDenied)?
        .lock(access, wait)
}

/// Unlock a single buffer
pub fn single_unlock(dmabuf: &DmaBuf) -> Result<()> {
    dmabuf.reservation().ok_or(Error::PermissionDenied)?.unlock()
}
