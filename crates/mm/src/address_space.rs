//! Address space page-table construction.
//!
//! An [`AddressSpace`] is nothing more than the physical address of its root paging
//! structure. The [`PageMapper`] walks and grows the tree under that root: it reaches
//! table memory through a [`DirectMap`], takes new nodes from the [`FrameAllocator`],
//! and asks the [`MachineTopology`] how many levels the tree has.
//!
//! The mapper does no locking of its own. Mutating operations take the space by
//! `&mut`, so concurrent mutation of one space needs a caller-held lock around it.

use crate::arch::{ENTRY_COUNT, page_index};
use crate::{
    AllocError, DirectMap, FrameAllocator, MachineTopology, PAGE_SIZE, PageEntry, PageFlags,
    PageSize, PhysicalAddress, Protection, VirtualAddress,
};

/// Size of one page-table entry in bytes.
const ENTRY_SIZE: usize = core::mem::size_of::<u64>();

/// Errors returned by the mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("unsupported page size {0:?}, only 4 KiB pages can be mapped")]
    InvalidPageSize(PageSize),
    #[error("failed to allocate a page-table node: {0}")]
    AllocationFailed(#[from] AllocError),
    #[error("no page table present for the address")]
    NotPresent,
    #[error("a level {0} entry on the walk maps a large page")]
    HugePage(usize),
}

/// A virtual address space, identified by the physical address of its root table.
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    root: PhysicalAddress,
}

impl AddressSpace {
    /// Wraps an existing root table.
    pub const fn from_root(root: PhysicalAddress) -> Self {
        Self { root }
    }

    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }
}

/// Builds and edits page tables.
pub struct PageMapper<'a, 'm, D, T> {
    frames: &'a FrameAllocator<'m>,
    direct_map: D,
    topology: T,
}

impl<'a, 'm, D: DirectMap, T: MachineTopology> PageMapper<'a, 'm, D, T> {
    pub fn new(frames: &'a FrameAllocator<'m>, direct_map: D, topology: T) -> Self {
        Self {
            frames,
            direct_map,
            topology,
        }
    }

    pub fn frames(&self) -> &'a FrameAllocator<'m> {
        self.frames
    }

    pub fn direct_map(&self) -> &D {
        &self.direct_map
    }

    /// Returns the space the processor is currently running in.
    pub fn read_current_space(&self) -> AddressSpace {
        AddressSpace::from_root(self.topology.active_root())
    }

    /// Creates an empty address space with a zero-filled root table.
    pub fn create_space(&self) -> Result<AddressSpace, MapError> {
        let root = self.allocate_table()?;
        log::debug!("created address space with root {}", root);
        Ok(AddressSpace::from_root(root))
    }

    /// Walks from the root of `space` down to the table at `target_level` and returns
    /// its physical address.
    ///
    /// Missing intermediate tables are allocated and installed as present, writable and
    /// user-accessible when `allocate` is set; otherwise the walk fails with
    /// [`MapError::NotPresent`]. Tables created before a failed allocation stay in place.
    /// A present entry with the page-size bit set is a large-page leaf, not a table, and
    /// stops the walk with [`MapError::HugePage`].
    ///
    /// # Panics
    ///
    /// Panics if `target_level` is zero or above the root level.
    pub fn descend(
        &self,
        space: &AddressSpace,
        virt: VirtualAddress,
        target_level: usize,
        allocate: bool,
    ) -> Result<PhysicalAddress, MapError> {
        let top_level = self.topology.paging_levels().top_level();
        assert!(
            (1..=top_level).contains(&target_level),
            "target level {target_level} outside 1..={top_level}"
        );

        let mut table = space.root;
        for level in (target_level + 1..=top_level).rev() {
            let slot = entry_slot(table, virt, level);
            let entry = PageEntry::from_bits(self.direct_map.read_u64(slot));

            table = if entry.is_present() {
                if entry.flags().contains(PageFlags::HUGE_PAGE) {
                    return Err(MapError::HugePage(level));
                }
                entry.address()
            } else if allocate {
                let node = self.allocate_table()?;
                self.direct_map
                    .write_u64(slot, PageEntry::new(node, PageFlags::NODE).bits());
                log::trace!("level {} table for {} at {}", level - 1, virt, node);
                node
            } else {
                return Err(MapError::NotPresent);
            };
        }

        Ok(table)
    }

    /// Maps the page containing `virt` to the frame at `phys`.
    pub fn map(
        &self,
        space: &mut AddressSpace,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        protection: Protection,
        size: PageSize,
    ) -> Result<(), MapError> {
        if size != PageSize::Size4KiB {
            return Err(MapError::InvalidPageSize(size));
        }

        let virt = virt.align_down(PAGE_SIZE);
        let table = self.descend(space, virt, 1, true)?;
        let entry = PageEntry::new(phys, PageFlags::from_protection(protection));
        self.direct_map.write_u64(entry_slot(table, virt, 1), entry.bits());
        self.topology.invalidate(virt);

        log::trace!("mapped {} -> {} {:?}", virt, phys, entry.flags());
        Ok(())
    }

    /// Removes the mapping for the page containing `virt` and returns the frame it
    /// pointed at. The frame itself is not freed.
    pub fn unmap(&self, space: &mut AddressSpace, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let virt = virt.align_down(PAGE_SIZE);
        let slot = entry_slot(self.descend(space, virt, 1, false).ok()?, virt, 1);
        let entry = PageEntry::from_bits(self.direct_map.read_u64(slot));
        if !entry.is_present() {
            return None;
        }

        self.direct_map.write_u64(slot, 0);
        self.topology.invalidate(virt);
        Some(entry.address())
    }

    /// Looks up the physical address and leaf flags `virt` translates to.
    pub fn translate(
        &self,
        space: &AddressSpace,
        virt: VirtualAddress,
    ) -> Option<(PhysicalAddress, PageFlags)> {
        let table = self.descend(space, virt, 1, false).ok()?;
        let entry = PageEntry::from_bits(self.direct_map.read_u64(entry_slot(table, virt, 1)));
        entry
            .is_present()
            .then(|| (entry.address() + virt.page_offset(), entry.flags()))
    }

    /// Frees every table of `space`, root included, back to the frame allocator.
    ///
    /// Frames referenced by leaf entries belong to whoever mapped them and are left alone.
    /// The space must not be active on any processor.
    pub fn release_tables(&self, space: AddressSpace) {
        debug_assert_ne!(
            space.root,
            self.topology.active_root(),
            "releasing the active address space"
        );
        let top_level = self.topology.paging_levels().top_level();
        self.release_table(space.root, top_level);
    }

    fn release_table(&self, table: PhysicalAddress, level: usize) {
        if level > 1 {
            for index in 0..ENTRY_COUNT {
                let slot = table + index * ENTRY_SIZE;
                let entry = PageEntry::from_bits(self.direct_map.read_u64(slot));
                if entry.is_present() {
                    self.release_table(entry.address(), level - 1);
                }
            }
        }
        self.frames.free(table, 1);
    }

    fn allocate_table(&self) -> Result<PhysicalAddress, AllocError> {
        let frame = self.frames.alloc(1)?;
        self.direct_map.zero_frames(frame, 1);
        Ok(frame)
    }
}

/// Address of the entry for `virt` inside the level-`level` table at `table`.
fn entry_slot(table: PhysicalAddress, virt: VirtualAddress, level: usize) -> PhysicalAddress {
    table + page_index(virt, level) * ENTRY_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EmulatedMemory, FakeTopology, MemoryKind, MemoryMapEntry, PagingLevels};

    const RAM_BASE: usize = 0x100000;

    fn machine(frames: usize) -> (EmulatedMemory, [MemoryMapEntry; 1]) {
        let memory = EmulatedMemory::new(PhysicalAddress::new(RAM_BASE), frames * PAGE_SIZE);
        let map = [MemoryMapEntry::new(
            PhysicalAddress::new(RAM_BASE),
            frames * PAGE_SIZE,
            MemoryKind::Usable,
        )];
        (memory, map)
    }

    #[test]
    fn maps_read_execute_leaf() {
        let (memory, map) = machine(64);
        let frames = unsafe { FrameAllocator::new(&map, &memory) }.unwrap();
        let topology = FakeTopology::new(PagingLevels::Four);
        let mapper = PageMapper::new(&frames, &memory, &topology);
        let mut space = mapper.create_space().unwrap();

        mapper
            .map(
                &mut space,
                VirtualAddress::new(0x400000),
                PhysicalAddress::new(0x200000),
                Protection::READ | Protection::EXECUTE,
                PageSize::Size4KiB,
            )
            .unwrap();

        let (phys, flags) = mapper.translate(&space, VirtualAddress::new(0x400000)).unwrap();
        assert_eq!(phys, PhysicalAddress::new(0x200000));
        assert!(flags.contains(PageFlags::PRESENT));
        assert!(!flags.contains(PageFlags::WRITABLE));
        assert!(!flags.contains(PageFlags::NO_EXECUTE));
        assert!(!flags.contains(PageFlags::USER));
        assert_eq!(topology.invalidated(), vec![VirtualAddress::new(0x400000)]);
    }

    #[test]
    fn tree_layout_is_hardware_exact() {
        let (memory, map) = machine(64);
        let frames = unsafe { FrameAllocator::new(&map, &memory) }.unwrap();
        let topology = FakeTopology::new(PagingLevels::Four);
        let mapper = PageMapper::new(&frames, &memory, &topology);
        let mut space = mapper.create_space().unwrap();

        // 0x4000_1000: PML4 0, PDPT 1, PD 0, PT 1.
        mapper
            .map(
                &mut space,
                VirtualAddress::new(0x4000_1000),
                PhysicalAddress::new(0x300000),
                Protection::READ | Protection::WRITE | Protection::USER,
                PageSize::Size4KiB,
            )
            .unwrap();

        let pml4e = memory.read_u64(space.root());
        assert_eq!(pml4e & 0xFFF, 0x7);
        let pdpt = PhysicalAddress::new((pml4e & PageEntry::ADDRESS_MASK) as usize);
        let pdpte = memory.read_u64(pdpt + 8);
        assert_eq!(pdpte & 0xFFF, 0x7);
        let pd = PhysicalAddress::new((pdpte & PageEntry::ADDRESS_MASK) as usize);
        let pde = memory.read_u64(pd);
        let pt = PhysicalAddress::new((pde & PageEntry::ADDRESS_MASK) as usize);
        assert_eq!(memory.read_u64(pt + 8), 0x8000_0000_0030_0007);
    }

    #[test]
    fn rejects_large_pages_without_side_effects() {
        let (memory, map) = machine(16);
        let frames = unsafe { FrameAllocator::new(&map, &memory) }.unwrap();
        let topology = FakeTopology::new(PagingLevels::Four);
        let mapper = PageMapper::new(&frames, &memory, &topology);
        let mut space = mapper.create_space().unwrap();
        let free = frames.free_frames();

        let result = mapper.map(
            &mut space,
            VirtualAddress::new(0x200000),
            PhysicalAddress::new(0x200000),
            Protection::READ,
            PageSize::Size2MiB,
        );
        assert_eq!(result, Err(MapError::InvalidPageSize(PageSize::Size2MiB)));
        assert_eq!(frames.free_frames(), free);
        assert!(topology.invalidated().is_empty());
    }

    #[test]
    fn unaligned_virtual_address_maps_its_page() {
        let (memory, map) = machine(16);
        let frames = unsafe { FrameAllocator::new(&map, &memory) }.unwrap();
        let topology = FakeTopology::new(PagingLevels::Four);
        let mapper = PageMapper::new(&frames, &memory, &topology);
        let mut space = mapper.create_space().unwrap();

        mapper
            .map(
                &mut space,
                VirtualAddress::new(0x400123),
                PhysicalAddress::new(0x500000),
                Protection::READ,
                PageSize::Size4KiB,
            )
            .unwrap();

        let (phys, _) = mapper.translate(&space, VirtualAddress::new(0x400fff)).unwrap();
        assert_eq!(phys, PhysicalAddress::new(0x500fff));
        assert_eq!(topology.invalidated(), vec![VirtualAddress::new(0x400000)]);
    }

    #[test]
    fn neighbouring_pages_share_tables() {
        let (memory, map) = machine(16);
        let frames = unsafe { FrameAllocator::new(&map, &memory) }.unwrap();
        let topology = FakeTopology::new(PagingLevels::Four);
        let mapper = PageMapper::new(&frames, &memory, &topology);
        let mut space = mapper.create_space().unwrap();

        let free = frames.free_frames();
        for page in 0..2 {
            mapper
                .map(
                    &mut space,
                    VirtualAddress::new(0x400000 + page * PAGE_SIZE),
                    PhysicalAddress::new(0x500000 + page * PAGE_SIZE),
                    Protection::READ,
                    PageSize::Size4KiB,
                )
                .unwrap();
        }
        assert_eq!(frames.free_frames(), free - 3);
    }

    #[test]
    fn five_level_tree_has_an_extra_node() {
        let (memory, map) = machine(16);
        let frames = unsafe { FrameAllocator::new(&map, &memory) }.unwrap();
        let topology = FakeTopology::new(PagingLevels::Five);
        let mapper = PageMapper::new(&frames, &memory, &topology);
        let mut space = mapper.create_space().unwrap();

        let free = frames.free_frames();
        let virt = VirtualAddress::new(0x0001_0000_0000_0000);
        mapper
            .map(
                &mut space,
                virt,
                PhysicalAddress::new(0x600000),
                Protection::READ,
                PageSize::Size4KiB,
            )
            .unwrap();

        assert_eq!(frames.free_frames(), free - 4);
        // Bit 48 selects PML5 entry 1.
        assert_eq!(memory.read_u64(space.root()), 0);
        assert_ne!(memory.read_u64(space.root() + 8), 0);
        assert_eq!(
            mapper.translate(&space, virt).map(|(phys, _)| phys),
            Some(PhysicalAddress::new(0x600000))
        );
    }

    #[test]
    fn allocation_failure_keeps_partial_tree() {
        // One frame for the bitmap, one root, one node; the second node cannot be allocated.
        let (memory, map) = machine(3);
        let frames = unsafe { FrameAllocator::new(&map, &memory) }.unwrap();
        let topology = FakeTopology::new(PagingLevels::Four);
        let mapper = PageMapper::new(&frames, &memory, &topology);
        let mut space = mapper.create_space().unwrap();

        let result = mapper.map(
            &mut space,
            VirtualAddress::new(0x400000),
            PhysicalAddress::new(0x200000),
            Protection::READ,
            PageSize::Size4KiB,
        );
        assert_eq!(result, Err(MapError::AllocationFailed(AllocError::OutOfMemory)));
        assert_ne!(memory.read_u64(space.root()), 0);
        assert_eq!(frames.free_frames(), 0);
    }

    #[test]
    fn descend_without_allocation() {
        let (memory, map) = machine(16);
        let frames = unsafe { FrameAllocator::new(&map, &memory) }.unwrap();
        let topology = FakeTopology::new(PagingLevels::Four);
        let mapper = PageMapper::new(&frames, &memory, &topology);
        let mut space = mapper.create_space().unwrap();
        let virt = VirtualAddress::new(0x400000);

        assert_eq!(mapper.descend(&space, virt, 1, false), Err(MapError::NotPresent));
        assert_eq!(mapper.descend(&space, virt, 4, false), Ok(space.root()));

        let leaf_table = mapper.descend(&space, virt, 1, true).unwrap();
        assert_eq!(mapper.descend(&space, virt, 1, false), Ok(leaf_table));
        assert!(mapper.translate(&space, virt).is_none());
        assert!(mapper.unmap(&mut space, virt).is_none());
    }

    #[test]
    fn large_page_leaves_are_not_walked() {
        let (memory, map) = machine(16);
        let frames = unsafe { FrameAllocator::new(&map, &memory) }.unwrap();
        let topology = FakeTopology::new(PagingLevels::Four);
        let mapper = PageMapper::new(&frames, &memory, &topology);
        let mut space = mapper.create_space().unwrap();
        let virt = VirtualAddress::new(0x400000);

        // A bootloader-style 2 MiB leaf in the page directory.
        let directory = mapper.descend(&space, virt, 2, true).unwrap();
        let data = frames.alloc(1).unwrap();
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::HUGE_PAGE;
        let leaf = PageEntry::new(data, flags);
        memory.write_u64(entry_slot(directory, virt, 2), leaf.bits());
        let free = frames.free_frames();

        let result = mapper.map(
            &mut space,
            virt + PAGE_SIZE,
            PhysicalAddress::new(0x900000),
            Protection::READ,
            PageSize::Size4KiB,
        );
        assert_eq!(result, Err(MapError::HugePage(2)));
        assert_eq!(mapper.descend(&space, virt, 1, false), Err(MapError::HugePage(2)));
        assert!(mapper.translate(&space, virt).is_none());
        assert_eq!(frames.free_frames(), free);
        assert!(memory.read(data, PAGE_SIZE).iter().all(|byte| *byte == 0));
        assert!(topology.invalidated().is_empty());
    }

    #[test]
    fn unmap_clears_leaf() {
        let (memory, map) = machine(16);
        let frames = unsafe { FrameAllocator::new(&map, &memory) }.unwrap();
        let topology = FakeTopology::new(PagingLevels::Four);
        let mapper = PageMapper::new(&frames, &memory, &topology);
        let mut space = mapper.create_space().unwrap();
        let virt = VirtualAddress::new(0x7000_0000);

        mapper
            .map(
                &mut space,
                virt,
                PhysicalAddress::new(0x900000),
                Protection::READ,
                PageSize::Size4KiB,
            )
            .unwrap();
        assert_eq!(mapper.unmap(&mut space, virt + 0x10), Some(PhysicalAddress::new(0x900000)));
        assert!(mapper.translate(&space, virt).is_none());
        assert_eq!(topology.invalidated(), vec![virt, virt]);
    }

    #[test]
    fn release_returns_every_table() {
        let (memory, map) = machine(32);
        let frames = unsafe { FrameAllocator::new(&map, &memory) }.unwrap();
        let topology = FakeTopology::new(PagingLevels::Four);
        let mapper = PageMapper::new(&frames, &memory, &topology);
        let free = frames.free_frames();

        let mut space = mapper.create_space().unwrap();
        for virt in [0x400000, 0x4000_0000, 0x7F00_0000_0000] {
            mapper
                .map(
                    &mut space,
                    VirtualAddress::new(virt),
                    PhysicalAddress::new(0x200000),
                    Protection::READ,
                    PageSize::Size4KiB,
                )
                .unwrap();
        }
        assert!(frames.free_frames() < free);

        mapper.release_tables(space);
        assert_eq!(frames.free_frames(), free);
    }

    #[test]
    fn reads_active_root() {
        let (memory, map) = machine(4);
        let frames = unsafe { FrameAllocator::new(&map, &memory) }.unwrap();
        let topology = FakeTopology::new(PagingLevels::Four);
        topology.set_active_root(PhysicalAddress::new(0x1000));
        let mapper = PageMapper::new(&frames, &memory, &topology);

        assert_eq!(mapper.read_current_space().root(), PhysicalAddress::new(0x1000));
    }
}
