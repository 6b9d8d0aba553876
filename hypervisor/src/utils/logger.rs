//! A [`log::Log`] implementation that writes to a 16550 UART.
//!
//! The host has no console of its own once a processor is virtualized, so
//! every record is pushed out over the serial port byte by byte.

use core::fmt::{self, Write};
use log::{LevelFilter, Metadata, Record, SetLoggerError};
use spin::{Mutex, Once};
use x86::io::{inb, outb};

pub const COM1: u16 = 0x3F8;
pub const COM2: u16 = 0x2F8;

const LINE_STATUS_OFFSET: u16 = 5;
const TRANSMITTER_EMPTY: u8 = 1 << 5;

pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    /// # Safety
    ///
    /// `base` must be the I/O port of a 16550 compatible UART that nothing else
    /// drives.
    pub const unsafe fn new(base: u16) -> Self {
        Self { base }
    }

    /// 115200 baud, 8N1, FIFO enabled, interrupts disabled.
    fn init(&mut self) {
        unsafe {
            outb(self.base + 1, 0x00);
            outb(self.base + 3, 0x80);
            outb(self.base, 0x01);
            outb(self.base + 1, 0x00);
            outb(self.base + 3, 0x03);
            outb(self.base + 2, 0xC7);
            outb(self.base + 4, 0x0B);
        }
    }

    fn write_byte(&mut self, byte: u8) {
        while unsafe { inb(self.base + LINE_STATUS_OFFSET) } & TRANSMITTER_EMPTY == 0 {
            core::hint::spin_loop();
        }

        unsafe { outb(self.base, byte) };
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }

        Ok(())
    }
}

pub struct SerialLogger {
    port: Mutex<SerialPort>,
    level: LevelFilter,
}

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = write_record(&mut *self.port.lock(), record);
        }
    }

    fn flush(&self) {}
}

/// Formats a record the same way on every sink.
pub fn write_record(writer: &mut impl Write, record: &Record) -> fmt::Result {
    writeln!(writer, "{} - {}", record.level(), record.args())
}

static LOGGER: Once<SerialLogger> = Once::new();

/// Installs the serial logger. Only the first call configures the port.
///
/// # Safety
///
/// See [`SerialPort::new`].
pub unsafe fn init(port: u16, level: LevelFilter) -> Result<(), SetLoggerError> {
    let logger = LOGGER.call_once(|| {
        let mut serial = SerialPort::new(port);
        serial.init();

        SerialLogger {
            port: Mutex::new(serial),
            level,
        }
    });

    log::set_logger(logger)?;
    log::set_max_level(level);

    Ok(())
}
