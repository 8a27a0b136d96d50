//! Scatter list describing device-addressable segments

/// One contiguous device-addressable segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// Device address of the segment
    pub dma_address: u64,
    /// Segment length in bytes
    pub length: usize,
}

/// Scatter list returned by an exporter's map hook
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SgTable {
    entries: Vec<SgEntry>,
}

impl SgTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment, merging it into the previous one when contiguous
    pub fn push(&mut self, dma_address: u64, length: usize) {
        if let Some(last) = self.entries.last_mut() {
            let end = (last.length as u64).checked_add(last.dma_address);
            if end == Some(dma_address) {
                last.length += length;
                return;
            }
        }
        self.entries.push(SgEntry { dma_address, length });
    }

    /// Number of segments
    pub fn nents(&self) -> usize {
        self.entries.len()
    }

    /// Total mapped length in bytes
    pub fn total_len(&self) -> usize {
        self.entries.iter().map(|e| e.length).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SgEntry> {
        self.entries.iter()
    }
}
