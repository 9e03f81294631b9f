#![cfg_attr(not(test), no_std)]

//! The Ember kernel boot sequence.
//!
//! Brings up the memory subsystem from the bootloader's handoff and loads the first
//! user program from the boot archive into the running address space.

mod arch;
mod boot;
mod console;
mod serial;

use core::fmt;

use initrd::Archive;
use limine::BaseRevision;
use mm::{
    FrameAllocator, HardwareTopology, PAGE_SIZE, PageMapper, PageSize, Protection,
    VirtualAddress,
};

use crate::boot::LimineMemoryMap;

/// Boot module holding the initial ramdisk.
const INITRD_MODULE: &core::ffi::CStr = c"initrd";

/// Archive path of the first user program.
const INIT_PATH: &str = "/sbin/init";

#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::with_revision(4);

static TOPOLOGY: HardwareTopology = HardwareTopology::new();

pub fn kernel_main(stack_start: usize) -> ! {
    let console = console::Console::init();
    serial::init(console);

    if !BASE_REVISION.is_supported() {
        fatal(format_args!("bootloader does not support base revision 4"));
    }
    log::debug!(
        "boot stack {:#x} - {:#x}",
        stack_start - boot::BOOT_STACK_SIZE as usize,
        stack_start
    );

    let memory_map =
        LimineMemoryMap::get().unwrap_or_else(|| fatal(format_args!("no memory map")));
    memory_map.dump();
    let direct_map =
        boot::direct_map().unwrap_or_else(|| fatal(format_args!("no higher-half direct map")));

    log::info!("engaging frame allocator");
    // SAFETY: Usable entries of the Limine memory map are unused, and the higher-half
    // direct map covers all of them. This is the only allocator built from this map.
    let frames = unsafe { FrameAllocator::new(&memory_map, &direct_map) }
        .unwrap_or_else(|err| fatal(format_args!("frame allocator: {}", err)));
    log::info!(
        "{} of {} frames free",
        frames.free_frames(),
        frames.total_frames()
    );

    let mapper = PageMapper::new(&frames, &direct_map, &TOPOLOGY);
    let mut space = mapper.read_current_space();

    let stack = frames
        .alloc(1)
        .unwrap_or_else(|err| fatal(format_args!("user stack: {}", err)));
    mapper
        .map(
            &mut space,
            VirtualAddress::new(stack.as_usize()),
            stack,
            Protection::READ | Protection::WRITE | Protection::USER,
            PageSize::Size4KiB,
        )
        .unwrap_or_else(|err| fatal(format_args!("user stack: {}", err)));
    let stack_top = stack.as_usize() + PAGE_SIZE;

    let archive = boot::module(INITRD_MODULE)
        .map(Archive::new)
        .unwrap_or_else(|| fatal(format_args!("no {:?} boot module", INITRD_MODULE)));
    let image = archive
        .lookup(INIT_PATH)
        .unwrap_or_else(|| fatal(format_args!("{} not found in initrd", INIT_PATH)));

    let loaded = mm::load(&mapper, &mut space, image)
        .unwrap_or_else(|err| fatal(format_args!("loading {}: {}", INIT_PATH, err)));
    log::info!(
        "{} loaded, entry {}, stack top {:#x}",
        INIT_PATH,
        loaded.entry,
        stack_top
    );

    arch::park()
}

/// Logs `message` and halts. Boot cannot continue past any of these failures.
fn fatal(message: fmt::Arguments<'_>) -> ! {
    log::error!("{}", message);
    arch::park()
}

pub fn handle_panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("kernel panic: {}", info);
    arch::park()
}
