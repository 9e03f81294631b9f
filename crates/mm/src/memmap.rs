//! Boot-time physical memory map.
//!
//! The boot protocol hands the kernel an ordered, finite list of memory regions. It is
//! queried by index through [`MemoryMapSource`]; the end of the list and a failed lookup
//! are reported through the same error, so consumers stop at the first error.
//!
//! # Providing a Memory Map
//!
//! Implement [`MemoryMapSource`] on your bootloader's response type, or pass a plain
//! slice of [`MemoryMapEntry`] values:
//!
//! ```
//! use mm::{MemoryKind, MemoryMapEntry, MemoryMapSource, PhysicalAddress};
//!
//! let map = [MemoryMapEntry::new(PhysicalAddress::new(0x100000), 0x100000, MemoryKind::Usable)];
//! assert_eq!(map.entries().count(), 1);
//! ```

use crate::PhysicalAddress;

/// Classification of a physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Free RAM the kernel may allocate.
    Usable,
    /// Firmware-reserved or otherwise unavailable memory.
    Reserved,
    /// ACPI tables that may be reclaimed once parsed.
    AcpiReclaim,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Defective RAM.
    Bad,
    /// Memory holding bootloader structures.
    Bootloader,
    /// The kernel image and boot modules.
    KernelImage,
    /// A linear framebuffer.
    Framebuffer,
}

impl MemoryKind {
    /// Returns a short upper-case name for diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            MemoryKind::Usable => "USABLE",
            MemoryKind::Reserved => "RESERVED",
            MemoryKind::AcpiReclaim => "ACPI_RECLAIMABLE",
            MemoryKind::AcpiNvs => "ACPI_NVS",
            MemoryKind::Bad => "BAD_MEMORY",
            MemoryKind::Bootloader => "BOOTLOADER_RECLAIMABLE",
            MemoryKind::KernelImage => "EXECUTABLE_AND_MODULES",
            MemoryKind::Framebuffer => "FRAMEBUFFER",
        }
    }
}

/// A single region of the boot memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
    pub base: PhysicalAddress,
    pub length: usize,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    pub const fn new(base: PhysicalAddress, length: usize, kind: MemoryKind) -> Self {
        Self { base, length, kind }
    }

    /// Returns the end address (exclusive) of this region.
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_usize() + self.length)
    }

    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryKind::Usable)
    }
}

/// Error returned by [`MemoryMapSource::entry`].
///
/// There is a single variant: the protocol does not distinguish "no more entries"
/// from "the lookup failed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryMapError {
    #[error("memory map index {0} is out of range")]
    OutOfRange(usize),
}

/// An indexed, restartable view of the boot memory map.
pub trait MemoryMapSource {
    /// Returns the entry at `index`, or an error once `index` is past the end.
    fn entry(&self, index: usize) -> Result<MemoryMapEntry, MemoryMapError>;

    /// Iterates the entries from index 0, stopping at the first error.
    fn entries(&self) -> Entries<'_, Self> {
        Entries {
            source: self,
            index: 0,
        }
    }
}

impl MemoryMapSource for [MemoryMapEntry] {
    fn entry(&self, index: usize) -> Result<MemoryMapEntry, MemoryMapError> {
        self.get(index)
            .copied()
            .ok_or(MemoryMapError::OutOfRange(index))
    }
}

impl<const N: usize> MemoryMapSource for [MemoryMapEntry; N] {
    fn entry(&self, index: usize) -> Result<MemoryMapEntry, MemoryMapError> {
        self.as_slice().entry(index)
    }
}

/// Iterator returned by [`MemoryMapSource::entries`].
pub struct Entries<'a, S: ?Sized> {
    source: &'a S,
    index: usize,
}

impl<S: MemoryMapSource + ?Sized> Iterator for Entries<'_, S> {
    type Item = MemoryMapEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.source.entry(self.index).ok()?;
        self.index += 1;
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> [MemoryMapEntry; 3] {
        [
            MemoryMapEntry::new(PhysicalAddress::new(0), 0x1000, MemoryKind::Reserved),
            MemoryMapEntry::new(PhysicalAddress::new(0x1000), 0x9F000, MemoryKind::Usable),
            MemoryMapEntry::new(PhysicalAddress::new(0x100000), 0x1000, MemoryKind::AcpiNvs),
        ]
    }

    #[test]
    fn indexes_entries() {
        let map = sample_map();
        assert_eq!(map.entry(1).unwrap().base, PhysicalAddress::new(0x1000));
        assert_eq!(map.entry(3), Err(MemoryMapError::OutOfRange(3)));
    }

    #[test]
    fn iteration_is_restartable() {
        let map = sample_map();
        assert_eq!(map.entries().count(), 3);
        assert_eq!(map.entries().filter(|e| e.is_usable()).count(), 1);
    }

    #[test]
    fn entry_end_is_exclusive() {
        let entry = sample_map()[1];
        assert_eq!(entry.end(), PhysicalAddress::new(0xA0000));
        assert_eq!(entry.kind.name(), "USABLE");
    }
}
