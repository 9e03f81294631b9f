//! Address types for physical and virtual memory management.
//!
//! This module provides architecture-independent wrappers around physical and virtual
//! addresses, with methods to manipulate them for page table operations.

use core::fmt;
use core::ops::{Add, Sub};

use crate::FrameNumber;

/// Size of the smallest page (and of a physical frame) in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// Rounds `value` up to the next multiple of `align`.
///
/// # Panics
///
/// Panics if `align` is not a power of two.
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    assert!(align.is_power_of_two(), "alignment must be a power of two");
    (value + align - 1) & !(align - 1)
}

/// Rounds `value` down to a multiple of `align`.
///
/// # Panics
///
/// Panics if `align` is not a power of two.
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    assert!(align.is_power_of_two(), "alignment must be a power of two");
    value & !(align - 1)
}

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns the raw address value as a `u64`.
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            /// Checks if the address is aligned to the given alignment.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                Self(align_down(self.0, align))
            }

            /// Aligns the address up to the given alignment.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                Self(align_up(self.0, align))
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (PAGE_SIZE - 1)
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:p}", self.0 as *const u8)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(addr: u64) -> Self {
                Self::new(addr as usize)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     This is a newtype wrapper around the architecture-dependent representation of a\n\
     physical address. It provides methods for address manipulation and alignment checks."
);

impl PhysicalAddress {
    /// Returns the corresponding frame number for this physical address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::containing(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     This is a newtype wrapper around the architecture-dependent representation of a\n\
     virtual address. It provides methods for address manipulation, alignment checks,\n\
     and extracting page table indices."
);

impl VirtualAddress {
    /// Returns true if the address is canonical under 4-level paging
    /// (bits 48-63 are copies of bit 47).
    #[inline]
    pub const fn is_canonical(self) -> bool {
        let upper = self.0 >> 47;
        upper == 0 || upper == (usize::MAX >> 47)
    }
}
