//! Fence contexts handed out to user space
//!
//! A fence is a held access window bound to an opaque handle. Handles index
//! into a per-buffer arena and carry a generation, so a stale or forged handle
//! is rejected instead of resolving to someone else's window.

use crate::access::DmaBufAccess;
use crate::{Error, Result};
use std::num::NonZeroU64;

/// Default number of fences a buffer can have outstanding
pub const DEFAULT_FENCE_CAPACITY: usize = 64;

/// Opaque fence handle, never zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(NonZeroU64);

impl FenceHandle {
    fn new(index: usize, generation: u32) -> Self {
        let raw = ((generation as u64) << 32) | (index as u64 + 1);
        // index + 1 keeps the low half non-zero
        FenceHandle(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Rebuild from the raw value carried through the ioctl interface
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(FenceHandle)
    }

    pub fn raw(&self) -> u64 {
        self.0.get()
    }

    fn index(&self) -> Option<usize> {
        ((self.0.get() & 0xffff_ffff) as usize).checked_sub(1)
    }

    fn generation(&self) -> u32 {
        (self.0.get() >> 32) as u32
    }
}

/// One held access window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenceEntry {
    pub access: DmaBufAccess,
    pub owner: &'static str,
}

struct Slot {
    generation: u32,
    entry: Option<FenceEntry>,
}

/// Arena of outstanding fences
pub struct FenceTable {
    slots: Vec<Slot>,
    capacity: usize,
}

impl FenceTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FENCE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
        }
    }

    /// Number of outstanding fences
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether another fence fits
    pub fn has_room(&self) -> bool {
        self.slots.len() < self.capacity || self.slots.iter().any(|s| s.entry.is_none())
    }

    /// Store an entry, returning its handle
    pub fn insert(&mut self, entry: FenceEntry) -> Result<FenceHandle> {
        if let Some(index) = self.slots.iter().position(|s| s.entry.is_none()) {
            let slot = &mut self.slots[index];
            slot.entry = Some(entry);
            return Ok(FenceHandle::new(index, slot.generation));
        }
        if self.slots.len() >= self.capacity {
            return Err(Error::ResourceExhausted);
        }
        self.slots.try_reserve(1)?;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        Ok(FenceHandle::new(self.slots.len() - 1, 0))
    }

    /// Look up a live entry
    pub fn get(&self, handle: FenceHandle) -> Option<&FenceEntry> {
        let slot = self.slots.get(handle.index()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.entry.as_ref()
    }

    /// Remove an entry; its handle becomes stale
    pub fn remove(&mut self, handle: FenceHandle) -> Option<FenceEntry> {
        let slot = self.slots.get_mut(handle.index()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(entry)
    }
}

impl Default for FenceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(access: DmaBufAccess) -> FenceEntry {
        FenceEntry { access, owner: "test" }
    }

    #[test]
    fn test_insert_get_remove() {
        let mut table = FenceTable::new();
        let h = table.insert(entry(DmaBufAccess::Write)).unwrap();
        assert_ne!(h.raw(), 0);
        assert_eq!(table.get(h).unwrap().access, DmaBufAccess::Write);
        assert_eq!(table.len(), 1);

        assert!(table.remove(h).is_some());
        assert!(table.get(h).is_none());
        assert!(table.remove(h).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut table = FenceTable::new();
        let old = table.insert(entry(DmaBufAccess::Read)).unwrap();
        table.remove(old).unwrap();

        let new = table.insert(entry(DmaBufAccess::Write)).unwrap();
        assert_ne!(old, new);
        assert!(table.get(old).is_none());
        assert_eq!(table.get(new).unwrap().access, DmaBufAccess::Write);
    }

    #[test]
    fn test_capacity() {
        let mut table = FenceTable::with_capacity(2);
        let a = table.insert(entry(DmaBufAccess::Read)).unwrap();
        table.insert(entry(DmaBufAccess::Read)).unwrap();
        assert!(!table.has_room());
        assert_eq!(table.insert(entry(DmaBufAccess::Read)), Err(Error::ResourceExhausted));
        table.remove(a);
        assert!(table.insert(entry(DmaBufAccess::Read)).is_ok());
    }

    #[test]
    fn test_forged_handles() {
        let table = FenceTable::new();
        assert!(FenceHandle::from_raw(0).is_none());
        let forged = FenceHandle::from_raw(0xdead_0000_0000).unwrap();
        assert!(table.get(forged).is_none());
    }
}
