//! Kernel console.
//!
//! The console is a byte sink the kernel writes human-readable output to:
//! the boot banner, the process exit announcements, and whatever user code
//! sends to file descriptor 1. The backing device is injected at boot as a
//! [`Sink`]; a real port hands in its serial or VGA driver, tests hand in a
//! capturing sink and grep the result.
//!
//! Use the [`kprint!`]/[`kprintln!`] macros for formatted output; both take
//! the kernel handle as their first argument.

use crate::KernelError;
use alloc::string::String;

/// A console backing device.
pub trait Sink {
    /// Writes `s` to the device.
    fn write_str(&self, s: &str);

    /// Reads one byte of input, if any is pending.
    fn read_byte(&self) -> Option<u8> {
        None
    }
}

/// A sink that discards all output.
pub struct NullSink;

impl Sink for NullSink {
    fn write_str(&self, _s: &str) {}
}

/// The kernel console: a thin formatting layer over the injected [`Sink`].
pub struct Console {
    sink: alloc::boxed::Box<dyn Sink>,
}

impl Console {
    pub(crate) fn new(sink: alloc::boxed::Box<dyn Sink>) -> Self {
        Self { sink }
    }

    /// Writes a string to the console.
    pub fn write(&self, s: &str) {
        self.sink.write_str(s);
    }

    /// Writes raw bytes to the console, replacing invalid UTF-8.
    ///
    /// Returns the number of bytes consumed. This is the `write(1, ..)`
    /// path; user buffers are not guaranteed to be text.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<usize, KernelError> {
        let s = String::from_utf8_lossy(bytes);
        self.sink.write_str(&s);
        Ok(bytes.len())
    }

    /// Reads up to `buf.len()` bytes of console input.
    pub fn read_bytes(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut n = 0;
        while n < buf.len() {
            match self.sink.read_byte() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    /// Writes formatted output to the console.
    pub fn write_fmt(&self, args: core::fmt::Arguments<'_>) {
        use core::fmt::Write;
        struct Adapter<'a>(&'a Console);
        impl core::fmt::Write for Adapter<'_> {
            fn write_str(&mut self, s: &str) -> core::fmt::Result {
                self.0.write(s);
                Ok(())
            }
        }
        let _ = Adapter(self).write_fmt(args);
    }
}

/// Prints formatted output to the kernel console.
///
/// The first argument is the kernel handle.
#[macro_export]
macro_rules! kprint {
    ($k:expr, $($arg:tt)*) => {
        $k.console().write_fmt(core::format_args!($($arg)*))
    };
}

/// Prints formatted output to the kernel console, with a trailing newline.
///
/// The first argument is the kernel handle.
#[macro_export]
macro_rules! kprintln {
    ($k:expr) => { $k.console().write("\n") };
    ($k:expr, $($arg:tt)*) => {
        $k.console().write_fmt(core::format_args!("{}\n", core::format_args!($($arg)*)))
    };
}
