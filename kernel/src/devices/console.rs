/*
 * Console
 *
 * Byte-stream console with a pluggable sink. The target installs the
 * serial port; tests install a capture buffer to observe kernel output
 * (the exit banner, most importantly). Input arrives from whatever
 * driver owns the keyboard or serial line via `push_input`; readers
 * block on a counting semaphore that tracks buffered bytes.
 *
 * fd 0 of every process reads from here and fd 1 writes here.
 */

use alloc::boxed::Box;
use core::fmt::{self, Write};

use heapless::Deque;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::sync::Semaphore;

/// Destination for console output.
pub trait ConsoleSink: Send {
    fn write_bytes(&mut self, bytes: &[u8]);
}

static SINK: Mutex<Option<Box<dyn ConsoleSink>>> = Mutex::new(None);

/// Buffered input not yet consumed by a reader.
static INPUT: Mutex<Deque<u8, 256>> = Mutex::new(Deque::new());

lazy_static! {
    /// Counts buffered input bytes; readers down once per byte.
    static ref INPUT_AVAILABLE: Semaphore = Semaphore::new(0);
}

/// Install the console sink, replacing any previous one.
pub fn set_sink(sink: Box<dyn ConsoleSink>) {
    *SINK.lock() = Some(sink);
}

/// Write raw bytes to the console. Output before a sink is installed is
/// dropped; the boot path installs one before first print.
pub fn write_bytes(bytes: &[u8]) {
    if let Some(sink) = SINK.lock().as_mut() {
        sink.write_bytes(bytes);
    }
}

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_bytes(s.as_bytes());
        Ok(())
    }
}

/// `print!`-style formatted output.
pub fn write_fmt(args: fmt::Arguments) {
    let _ = ConsoleWriter.write_fmt(args);
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::devices::console::write_fmt(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kprintln {
    () => { $crate::kprint!("\n") };
    ($($arg:tt)*) => {{
        $crate::devices::console::write_fmt(format_args!($($arg)*));
        $crate::kprint!("\n");
    }};
}

/// Feed one input byte from the driver side. Bytes beyond the buffer
/// capacity are dropped.
pub fn push_input(byte: u8) {
    let accepted = INPUT.lock().push_back(byte).is_ok();
    if accepted {
        INPUT_AVAILABLE.up();
    }
}

/// Read one byte, blocking until input arrives.
pub fn read_byte() -> u8 {
    INPUT_AVAILABLE.down();
    INPUT.lock().pop_front().expect("console input underflow")
}

/// Read without blocking.
pub fn try_read_byte() -> Option<u8> {
    if INPUT_AVAILABLE.try_down() {
        INPUT.lock().pop_front()
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod capture {
    use super::*;
    use alloc::string::String;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    /// Sink that stores everything written, for assertions.
    pub struct CaptureSink(pub Arc<Mutex<Vec<u8>>>);

    impl ConsoleSink for CaptureSink {
        fn write_bytes(&mut self, bytes: &[u8]) {
            self.0.lock().extend_from_slice(bytes);
        }
    }

    /// Install a capture sink and return its shared buffer.
    pub fn install() -> Arc<Mutex<Vec<u8>>> {
        let buf = Arc::new(Mutex::new(Vec::new()));
        set_sink(Box::new(CaptureSink(buf.clone())));
        buf
    }

    pub fn contents(buf: &Arc<Mutex<Vec<u8>>>) -> String {
        String::from_utf8_lossy(&buf.lock()).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_reaches_the_sink() {
        let _serial = crate::test_sync::lock();
        let buf = capture::install();
        kprint!("hello {}", 42);
        assert_eq!(capture::contents(&buf), "hello 42");
    }

    #[test]
    fn input_is_fifo_and_nonblocking_when_buffered() {
        let _serial = crate::test_sync::lock();
        crate::scheduler::init(false);
        while try_read_byte().is_some() {}

        push_input(b'a');
        push_input(b'b');
        assert_eq!(read_byte(), b'a');
        assert_eq!(try_read_byte(), Some(b'b'));
        assert_eq!(try_read_byte(), None);
    }
}
