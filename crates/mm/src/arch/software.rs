//! Software topology for testing and development.
//!
//! Stands in for the processor: the level count and root are whatever the test
//! configured, and invalidations are recorded instead of executed.

use std::vec::Vec;

use super::{MachineTopology, PagingLevels};
use crate::{PhysicalAddress, VirtualAddress};

/// A fake machine topology.
pub struct FakeTopology {
    levels: PagingLevels,
    root: spin::Mutex<PhysicalAddress>,
    invalidated: spin::Mutex<Vec<VirtualAddress>>,
}

impl FakeTopology {
    /// Creates a topology with the given level count and an active root of zero.
    pub fn new(levels: PagingLevels) -> Self {
        Self {
            levels,
            root: spin::Mutex::new(PhysicalAddress::new(0)),
            invalidated: spin::Mutex::new(Vec::new()),
        }
    }

    /// Pretends the processor switched to the table rooted at `root`.
    pub fn set_active_root(&self, root: PhysicalAddress) {
        *self.root.lock() = root;
    }

    /// Returns every address passed to [`MachineTopology::invalidate`], in order.
    pub fn invalidated(&self) -> Vec<VirtualAddress> {
        self.invalidated.lock().clone()
    }
}

impl MachineTopology for FakeTopology {
    fn paging_levels(&self) -> PagingLevels {
        self.levels
    }

    fn active_root(&self) -> PhysicalAddress {
        *self.root.lock()
    }

    fn invalidate(&self, virt: VirtualAddress) {
        self.invalidated.lock().push(virt);
    }
}
