#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Ember Memory Manager (MM)
//!
//! The boot-time memory subsystem of the Ember kernel. It provides:
//!
//! - A bitmap frame allocator built from the boot memory map.
//! - Per-address-space page table construction for x86_64 4- and 5-level paging.
//! - Region mapping on top of single-page mappings.
//! - An ELF loader that materializes an executable into a fresh address space.
//!
//! Hardware access is injected through two collaborators: a [`DirectMap`] for
//! reaching physical memory and a [`MachineTopology`] for paging registers. With
//! the `software-emulation` feature (and in tests) both can be simulated on the host.

mod address;
mod address_space;
mod arch;
mod direct_map;
mod entry;
mod frame_allocator;
mod human_size;
mod loader;
mod memmap;
mod numbers;
mod region;

pub use address::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, align_up};
pub use address_space::{AddressSpace, MapError, PageMapper};
pub use arch::{MachineTopology, PagingLevels};
pub use direct_map::{DirectMap, OffsetDirectMap};
pub use entry::{PageEntry, PageFlags, PageSize, Protection};
pub use frame_allocator::{AllocError, FrameAllocator, InitError, MemoryProbe};
pub use human_size::HumanSize;
pub use loader::{ImageError, LoadError, LoadedImage, load};
pub use memmap::{MemoryKind, MemoryMapEntry, MemoryMapError, MemoryMapSource};
pub use numbers::FrameNumber;
pub use region::Region;

#[cfg(target_arch = "x86_64")]
pub use arch::x86_64::HardwareTopology;

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::software::FakeTopology;
#[cfg(any(test, feature = "software-emulation"))]
pub use direct_map::EmulatedMemory;
