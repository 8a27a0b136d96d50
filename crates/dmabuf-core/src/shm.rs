//! POSIX shared memory backing store

use crate::{Error, Result};
use shared_memory::{Shmem, ShmemConf};
use tracing::debug;

/// Named shared memory region
///
/// The creating side owns the name and unlinks it on drop.
pub struct SharedMemory {
    inner: Shmem,
    name: String,
    size: usize,
}

// The mapping stays valid for the lifetime of `Shmem`; callers synchronize
// access to its contents.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create and map a new region
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-sized shared memory".into()));
        }
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .map_err(|e| Error::SharedMemory(e.to_string()))?;
        debug!("created shm {} ({} bytes)", name, size);

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
        })
    }

    /// Map an existing region created elsewhere
    pub fn open(name: &str) -> Result<Self> {
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| Error::SharedMemory(e.to_string()))?;
        let size = shmem.len();

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Base of the mapping
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.as_ptr()
    }

    /// Whether this side unlinks the region on drop
    pub fn is_owner(&self) -> bool {
        self.inner.is_owner()
    }
}
