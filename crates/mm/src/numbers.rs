//! Frame number type for physical memory management.

use core::{
    fmt,
    ops::{Add, Sub},
};

use crate::address::{PAGE_SHIFT, PhysicalAddress};

/// A physical memory frame number.
///
/// Frame numbers are zero-indexed and correspond to `PAGE_SIZE`-aligned physical
/// addresses: frame `n` starts at `n * PAGE_SIZE`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(usize);

impl FrameNumber {
    /// Creates a new frame number.
    #[inline]
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    /// Returns the frame containing the given physical address.
    #[inline]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(addr.as_usize() >> PAGE_SHIFT)
    }

    /// Returns the raw frame number.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({})", self.0)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<usize> for FrameNumber {
    type Output = Self;

    #[inline]
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<FrameNumber> for FrameNumber {
    type Output = usize;

    #[inline]
    fn sub(self, rhs: FrameNumber) -> Self::Output {
        self.0 - rhs.0
    }
}
