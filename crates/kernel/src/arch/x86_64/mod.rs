/// The architecture-specific entry point
///
/// Captures the boot stack pointer and hands off to the kernel main routine.
#[unsafe(no_mangle)]
pub extern "C" fn kenter() -> ! {
    let stack_start = unsafe {
        // SAFETY: The bootloader sets up the stack pointer before transferring control
        // to the kernel entry point. Reading it has no side effects.
        let rsp: u64;
        core::arch::asm!("mov {}, rsp", out(reg) rsp);
        rsp as usize
    };
    crate::kernel_main(stack_start)
}
