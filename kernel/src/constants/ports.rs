//! I/O port definitions.

/// Base I/O port address for the first serial port (COM1).
pub const SERIAL_PORT: u16 = 0x3F8;

/// Command port of the master 8259 PIC.
pub const PIC1_COMMAND: u16 = 0x20;
/// End-of-interrupt command byte.
pub const PIC_EOI: u8 = 0x20;
