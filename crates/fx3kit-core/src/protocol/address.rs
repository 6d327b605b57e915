//! Load address encoding for firmware control transfers.
//!
//! The 32-bit target address of each chunk travels in the setup packet:
//! the low half in `wValue`, the high half in `wIndex`.

use std::fmt;

use crate::error::BringupError;

/// Checked `(wValue, wIndex)` pair for a firmware chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAddress {
    /// Low 16 bits, sent as `wValue`.
    pub low: u16,
    /// High 16 bits, sent as `wIndex`.
    pub high: u16,
}

impl ChunkAddress {
    /// Split `base + offset` into its setup-packet halves.
    ///
    /// `offset` is the position of the chunk inside its segment. Fails if the
    /// sum does not fit the 32-bit address space.
    pub fn new(base: u32, offset: usize) -> Result<Self, BringupError> {
        let offset = u32::try_from(offset).map_err(|_| BringupError::AddressOverflow {
            base,
            offset: offset as u64,
        })?;
        let full = base
            .checked_add(offset)
            .ok_or(BringupError::AddressOverflow {
                base,
                offset: offset as u64,
            })?;
        Ok(Self::from_u32(full))
    }

    /// Split an already-computed absolute address.
    pub const fn from_u32(addr: u32) -> Self {
        Self {
            low: (addr & 0xFFFF) as u16,
            high: (addr >> 16) as u16,
        }
    }

    /// Reassemble the absolute address.
    pub const fn as_u32(&self) -> u32 {
        ((self.high as u32) << 16) | self.low as u32
    }
}

impl fmt::Display for ChunkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.as_u32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_below_64k() {
        let addr = ChunkAddress::new(0, 0x1000).unwrap();
        assert_eq!(addr.low, 0x1000);
        assert_eq!(addr.high, 0);
    }

    #[test]
    fn test_split_crosses_64k() {
        let addr = ChunkAddress::new(0xF000, 0x1000).unwrap();
        assert_eq!(addr.low, 0x0000);
        assert_eq!(addr.high, 0x0001);
        assert_eq!(addr.as_u32(), 0x0001_0000);
    }

    #[test]
    fn test_split_high_base() {
        let addr = ChunkAddress::new(0x4000_0000, 0x2345).unwrap();
        assert_eq!(addr.low, 0x2345);
        assert_eq!(addr.high, 0x4000);
        assert_eq!(addr.to_string(), "0x40002345");
    }

    #[test]
    fn test_overflow_rejected() {
        assert!(matches!(
            ChunkAddress::new(0xFFFF_F000, 0x1000),
            Err(BringupError::AddressOverflow { .. })
        ));
    }
}
