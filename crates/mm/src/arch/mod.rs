//! Architecture-specific paging topology.
//!
//! The mapper never reads control registers itself. It asks a [`MachineTopology`]
//! how many paging levels are active, where the current root table lives, and to
//! drop stale translations. The x86_64 implementation talks to the processor; the
//! software implementation is a fixed, inspectable stand-in for tests.

use crate::{PhysicalAddress, VirtualAddress};

// NOTE: We DO include the hardware module even during tests so that rust-analyzer can see it.
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(any(test, feature = "software-emulation"))]
pub mod software;

/// Bits of virtual address consumed per paging level.
const INDEX_BITS: usize = 9;

/// Number of entries in a paging-structure node.
pub const ENTRY_COUNT: usize = 1 << INDEX_BITS;

/// Number of paging levels active on the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingLevels {
    /// PML4 is the root.
    Four,
    /// PML5 is the root (CR4.LA57 set).
    Five,
}

impl PagingLevels {
    /// Returns the number of levels.
    pub const fn count(self) -> usize {
        match self {
            PagingLevels::Four => 4,
            PagingLevels::Five => 5,
        }
    }

    /// Returns the level number of the root table (levels are numbered from 1 at the leaves).
    pub const fn top_level(self) -> usize {
        self.count()
    }
}

/// Returns the index into the level-`level` table for `virt`.
///
/// Level 1 is the page table holding leaf entries, level 4 the PML4 and level 5 the PML5.
///
/// # Panics
///
/// Panics if `level` is not in `1..=5`.
#[inline]
pub const fn page_index(virt: VirtualAddress, level: usize) -> usize {
    assert!(level >= 1 && level <= 5, "paging level out of range");
    let shift = crate::PAGE_SHIFT + (level - 1) * INDEX_BITS;
    (virt.as_usize() >> shift) & (ENTRY_COUNT - 1)
}

/// Machine collaborator for paging registers.
pub trait MachineTopology {
    /// Returns the number of active paging levels. All address spaces share it.
    fn paging_levels(&self) -> PagingLevels;

    /// Returns the physical address of the root table the processor is using.
    fn active_root(&self) -> PhysicalAddress;

    /// Drops any cached translation for the page containing `virt`.
    fn invalidate(&self, virt: VirtualAddress);
}

impl<T: MachineTopology + ?Sized> MachineTopology for &T {
    fn paging_levels(&self) -> PagingLevels {
        (**self).paging_levels()
    }

    fn active_root(&self) -> PhysicalAddress {
        (**self).active_root()
    }

    fn invalidate(&self, virt: VirtualAddress) {
        (**self).invalidate(virt)
    }
}
