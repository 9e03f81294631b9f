//! Mapping contiguous ranges one page at a time.

use crate::{
    AddressSpace, DirectMap, MachineTopology, MapError, PAGE_SIZE, PageMapper, PageSize,
    PhysicalAddress, Protection, VirtualAddress, align_up,
};

/// A request to map `length` bytes at `virt` onto physical memory at `phys`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub virt: VirtualAddress,
    pub phys: PhysicalAddress,
    pub length: usize,
}

impl Region {
    pub const fn new(virt: VirtualAddress, phys: PhysicalAddress, length: usize) -> Self {
        Self { virt, phys, length }
    }

    /// Number of pages mapped for the region: its length rounded up to whole pages.
    pub const fn page_count(&self) -> usize {
        align_up(self.length, PAGE_SIZE) / PAGE_SIZE
    }
}

impl<D: DirectMap, T: MachineTopology> PageMapper<'_, '_, D, T> {
    /// Maps every page of `region` with `protection`, in increasing address order.
    ///
    /// Both bases are aligned down to a page and the length is rounded up on its own, so
    /// a misaligned base does not add a page. Mapping stops at the first failure; pages already mapped stay
    /// mapped.
    pub fn map_region(
        &self,
        space: &mut AddressSpace,
        region: &Region,
        protection: Protection,
    ) -> Result<(), MapError> {
        let virt = region.virt.align_down(PAGE_SIZE);
        let phys = region.phys.align_down(PAGE_SIZE);
        let pages = region.page_count();

        log::debug!("mapping {} pages {} -> {}", pages, virt, phys);
        for page in 0..pages {
            let offset = page * PAGE_SIZE;
            self.map(space, virt + offset, phys + offset, protection, PageSize::Size4KiB)?;
        }
        Ok(())
    }
}
