//! Access type and DMA direction definitions

/// Direction of a DMA transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DmaDirection {
    Bidirectional = 0,
    ToDevice = 1,
    FromDevice = 2,
    None = 3,
}

impl DmaDirection {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DmaDirection::Bidirectional),
            1 => Some(DmaDirection::ToDevice),
            2 => Some(DmaDirection::FromDevice),
            3 => Some(DmaDirection::None),
            _ => None,
        }
    }
}

/// Raw access bit for read windows
pub const DMA_BUF_ACCESS_R: u32 = 0x1;
/// Raw access bit for write windows
pub const DMA_BUF_ACCESS_W: u32 = 0x2;

/// Kind of access window held on a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaBufAccess {
    Read,
    Write,
}

impl DmaBufAccess {
    /// Convert from the raw access bits; write wins when both are set
    pub fn from_raw(v: u32) -> Option<Self> {
        if v & DMA_BUF_ACCESS_W != 0 {
            Some(DmaBufAccess::Write)
        } else if v & DMA_BUF_ACCESS_R != 0 {
            Some(DmaBufAccess::Read)
        } else {
            None
        }
    }

    /// Raw access bits
    pub fn as_raw(&self) -> u32 {
        match self {
            DmaBufAccess::Read => DMA_BUF_ACCESS_R,
            DmaBufAccess::Write => DMA_BUF_ACCESS_W,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_from_raw() {
        assert_eq!(DmaBufAccess::from_raw(0x1), Some(DmaBufAccess::Read));
        assert_eq!(DmaBufAccess::from_raw(0x2), Some(DmaBufAccess::Write));
        assert_eq!(DmaBufAccess::from_raw(0x3), Some(DmaBufAccess::Write));
        assert_eq!(DmaBufAccess::from_raw(0), None);
        assert_eq!(DmaDirection::from_u8(2), Some(DmaDirection::FromDevice));
        assert_eq!(DmaDirection::from_u8(9), None);
    }
}
