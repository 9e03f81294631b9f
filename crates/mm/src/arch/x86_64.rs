//! x86_64 hardware topology.

use ::x86_64::{
    VirtAddr,
    instructions::tlb,
    registers::control::{Cr3, Cr4, Cr4Flags},
};

use super::{MachineTopology, PagingLevels};
use crate::{PhysicalAddress, VirtualAddress};

/// Reads paging state straight from the processor.
///
/// The level count is sampled from CR4.LA57 on first use and cached; the bit cannot
/// change while paging is enabled.
pub struct HardwareTopology {
    levels: spin::Once<PagingLevels>,
}

impl HardwareTopology {
    pub const fn new() -> Self {
        Self {
            levels: spin::Once::new(),
        }
    }
}

impl Default for HardwareTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineTopology for HardwareTopology {
    fn paging_levels(&self) -> PagingLevels {
        *self.levels.call_once(|| {
            if Cr4::read().contains(Cr4Flags::L5_PAGING) {
                PagingLevels::Five
            } else {
                PagingLevels::Four
            }
        })
    }

    fn active_root(&self) -> PhysicalAddress {
        let (frame, _) = Cr3::read();
        PhysicalAddress::from(frame.start_address().as_u64())
    }

    fn invalidate(&self, virt: VirtualAddress) {
        tlb::flush(VirtAddr::new_truncate(virt.as_u64()));
    }
}
