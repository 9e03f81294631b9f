use crate::console::Console;

/// COM1 on PC-compatible machines.
const COM1: u16 = 0x3F8;

pub struct SerialWriter {
    port: uart_16550::SerialPort,
}

impl core::fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.port.write_str(s)
    }
}

// cSpell:ignore uart
pub fn init(console: &Console) {
    // SAFETY: COM1 is a standard 16550 port and nothing else in the kernel drives it.
    let mut port = unsafe { uart_16550::SerialPort::new(COM1) };
    port.init();
    console.attach_serial(SerialWriter { port });
}
