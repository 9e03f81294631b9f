//! Limine boot protocol requests and adapters onto the memory subsystem.

use core::ffi::CStr;

use limine::{
    memory_map::{self, Entry},
    request::{HhdmRequest, MemoryMapRequest, ModuleRequest, StackSizeRequest},
};
use mm::{
    HumanSize, MemoryKind, MemoryMapEntry, MemoryMapError, MemoryMapSource, OffsetDirectMap,
    PhysicalAddress,
};

/// Boot stack requested from the bootloader.
pub const BOOT_STACK_SIZE: u64 = 64 * 1024;

#[used]
#[unsafe(link_section = ".requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static HIGHER_HALF_DIRECT_MAP: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static MODULE: ModuleRequest = ModuleRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static STACK_SIZE: StackSizeRequest = StackSizeRequest::new().with_size(BOOT_STACK_SIZE);

/// The bootloader's memory map, queried by index.
#[derive(Clone, Copy)]
pub struct LimineMemoryMap<'a>(&'a [&'a Entry]);

impl LimineMemoryMap<'static> {
    pub fn get() -> Option<Self> {
        MEMORY_MAP_REQUEST
            .get_response()
            .map(|response| Self(response.entries()))
    }
}

impl LimineMemoryMap<'_> {
    pub fn dump(&self) {
        for entry in self.entries() {
            log::debug!(
                "{} - {} {} ({})",
                entry.base,
                entry.end(),
                entry.kind.name(),
                HumanSize(entry.length)
            );
        }
    }
}

impl MemoryMapSource for LimineMemoryMap<'_> {
    fn entry(&self, index: usize) -> Result<MemoryMapEntry, MemoryMapError> {
        let entry = self.0.get(index).ok_or(MemoryMapError::OutOfRange(index))?;
        Ok(MemoryMapEntry::new(
            PhysicalAddress::new(entry.base as usize),
            entry.length as usize,
            kind(entry.entry_type),
        ))
    }
}

fn kind(entry_type: memory_map::EntryType) -> MemoryKind {
    match entry_type {
        memory_map::EntryType::USABLE => MemoryKind::Usable,
        memory_map::EntryType::ACPI_RECLAIMABLE => MemoryKind::AcpiReclaim,
        memory_map::EntryType::ACPI_NVS => MemoryKind::AcpiNvs,
        memory_map::EntryType::BAD_MEMORY => MemoryKind::Bad,
        memory_map::EntryType::BOOTLOADER_RECLAIMABLE => MemoryKind::Bootloader,
        memory_map::EntryType::EXECUTABLE_AND_MODULES => MemoryKind::KernelImage,
        memory_map::EntryType::FRAMEBUFFER => MemoryKind::Framebuffer,
        _ => MemoryKind::Reserved,
    }
}

/// Returns the direct map the bootloader set up at the higher-half offset.
pub fn direct_map() -> Option<OffsetDirectMap> {
    let offset = HIGHER_HALF_DIRECT_MAP.get_response()?.offset();
    Some(OffsetDirectMap::new(offset as usize))
}

/// Returns the contents of the boot module whose command line string is `name`.
pub fn module(name: &CStr) -> Option<&'static [u8]> {
    let modules = MODULE.get_response()?.modules();
    let module = modules.iter().find(|module| module.string() == name)?;

    // SAFETY: Limine maps modules in the direct map and marks them as
    // EXECUTABLE_AND_MODULES, so nothing hands their frames out while the kernel runs.
    let contents =
        unsafe { core::slice::from_raw_parts(module.addr().cast_const(), module.size() as usize) };
    Some(contents)
}
