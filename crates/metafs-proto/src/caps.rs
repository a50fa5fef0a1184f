//! Capability bitmasks
//!
//! A capability mask encodes what a client may cache or mutate for an inode.
//! Bits are independent; an MDS grants and revokes them individually.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// A set of capability bits
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CapMask(u32);

impl CapMask {
    /// No bits
    pub const EMPTY: CapMask = CapMask(0);
    /// Pin the inode in the client cache
    pub const PIN: CapMask = CapMask(1 << 0);
    /// Read file data
    pub const RD: CapMask = CapMask(1 << 1);
    /// Cache reads
    pub const RD_CACHE: CapMask = CapMask(1 << 2);
    /// Lazy (relaxed-consistency) reads
    pub const RD_LAZY: CapMask = CapMask(1 << 3);
    /// Write file data
    pub const WR: CapMask = CapMask(1 << 4);
    /// Buffer writes before flushing them
    pub const WR_BUFFER: CapMask = CapMask(1 << 5);
    /// Exclusive writer; may extend the file and update times locally
    pub const WR_EXCL: CapMask = CapMask(1 << 6);

    /// Create from raw bits
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits
    #[must_use]
    pub const fn bits(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// All of `other`'s bits are present
    #[must_use]
    pub const fn contains(&self, other: CapMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any of `other`'s bits are present
    #[must_use]
    pub const fn intersects(&self, other: CapMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Bits present here but not in `other`
    #[must_use]
    pub const fn difference(&self, other: CapMask) -> CapMask {
        CapMask(self.0 & !other.0)
    }
}

impl BitOr for CapMask {
    type Output = CapMask;
    fn bitor(self, rhs: CapMask) -> CapMask {
        CapMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for CapMask {
    fn bitor_assign(&mut self, rhs: CapMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for CapMask {
    type Output = CapMask;
    fn bitand(self, rhs: CapMask) -> CapMask {
        CapMask(self.0 & rhs.0)
    }
}

impl Not for CapMask {
    type Output = CapMask;
    fn not(self) -> CapMask {
        CapMask(!self.0)
    }
}

impl fmt::Debug for CapMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapMask({self})")
    }
}

impl fmt::Display for CapMask {
    /// Compact "pRcLwBx" rendering, one letter per bit, "-" when empty.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "-");
        }
        let bits = [
            (CapMask::PIN, 'p'),
            (CapMask::RD, 'R'),
            (CapMask::RD_CACHE, 'c'),
            (CapMask::RD_LAZY, 'L'),
            (CapMask::WR, 'W'),
            (CapMask::WR_BUFFER, 'B'),
            (CapMask::WR_EXCL, 'x'),
        ];
        for (bit, ch) in bits {
            if self.contains(bit) {
                write!(f, "{ch}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_ops() {
        let m = CapMask::RD | CapMask::RD_CACHE;
        assert!(m.contains(CapMask::RD));
        assert!(!m.contains(CapMask::WR));
        assert!(m.intersects(CapMask::RD_CACHE | CapMask::WR));
        assert_eq!(m.difference(CapMask::RD), CapMask::RD_CACHE);
    }

    #[test]
    fn test_mask_display() {
        assert_eq!((CapMask::PIN | CapMask::RD).to_string(), "pR");
        assert_eq!((CapMask::WR | CapMask::WR_BUFFER).to_string(), "WB");
        assert_eq!(CapMask::EMPTY.to_string(), "-");
    }
}
