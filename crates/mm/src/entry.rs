//! x86_64 page-table entry format.
//!
//! Entries are 64-bit little-endian words. The layout must match the processor bit
//! for bit (Intel SDM Vol. 3A, 4.5):
//! - Bit 0: present
//! - Bit 1: writable
//! - Bit 2: user-accessible
//! - Bit 7: page size (never set here, all leaves are 4 KiB)
//! - Bits 12-51: physical address
//! - Bit 63: execute-disable

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

use crate::PhysicalAddress;

/// Page-table entry flags.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageFlags(u64);

impl PageFlags {
    /// Present bit (bit 0).
    pub const PRESENT: Self = Self(1 << 0);

    /// Writable bit (bit 1).
    pub const WRITABLE: Self = Self(1 << 1);

    /// User-accessible bit (bit 2).
    pub const USER: Self = Self(1 << 2);

    /// Page-size bit (bit 7).
    pub const HUGE_PAGE: Self = Self(1 << 7);

    /// Execute-disable bit (bit 63).
    pub const NO_EXECUTE: Self = Self(1 << 63);

    /// Flags carried by intermediate nodes created during descent.
    pub const NODE: Self = Self(Self::PRESENT.0 | Self::WRITABLE.0 | Self::USER.0);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits_truncate(bits: u64) -> Self {
        Self(bits & !PageEntry::ADDRESS_MASK)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Self, value: bool) {
        if value {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }

    /// Translates a protection request into leaf flags.
    ///
    /// Leaves are present and execute-disabled unless `EXECUTE` is requested; `WRITE`
    /// and `USER` each set their own bit. Read access is implied by presence.
    pub fn from_protection(protection: Protection) -> Self {
        let mut flags = Self::PRESENT | Self::NO_EXECUTE;
        flags.set(Self::WRITABLE, protection.contains(Protection::WRITE));
        flags.set(Self::NO_EXECUTE, !protection.contains(Protection::EXECUTE));
        flags.set(Self::USER, protection.contains(Protection::USER));
        flags
    }
}

impl BitOr for PageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for PageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PageFlags, &str); 5] = [
            (PageFlags::PRESENT, "P"),
            (PageFlags::WRITABLE, "W"),
            (PageFlags::USER, "U"),
            (PageFlags::HUGE_PAGE, "PS"),
            (PageFlags::NO_EXECUTE, "NX"),
        ];

        write!(f, "PageFlags(")?;
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        write!(f, ")")
    }
}

/// A single page-table entry.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// Physical address mask (bits 12-51).
    pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Creates an entry pointing at `address` with `flags`.
    ///
    /// Address bits outside 12-51 are dropped.
    pub const fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        Self((address.as_u64() & Self::ADDRESS_MASK) | flags.bits())
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    /// Returns the physical address stored in this entry, masked to bits 12-51.
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize)
    }

    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageEntry({:#x}, {:?})", self.address().as_usize(), self.flags())
    }
}

/// Access rights requested for a mapping. Read access is always implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Protection(u8);

impl Protection {
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const EXECUTE: Self = Self(1 << 2);
    pub const USER: Self = Self(1 << 3);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Protection {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Protection {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Page sizes the hardware can map. Only [`PageSize::Size4KiB`] is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4KiB,
    Size2MiB,
    Size1GiB,
}

impl PageSize {
    pub const fn bytes(self) -> usize {
        match self {
            PageSize::Size4KiB => 4096,
            PageSize::Size2MiB => 2 * 1024 * 1024,
            PageSize::Size1GiB => 1024 * 1024 * 1024,
        }
    }
}
