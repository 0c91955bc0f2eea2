//! Byte-oriented I/O drivers.
//!
//! Drivers wrap hardware or host resources (serial ports, files, sockets).
//! Modules register them by name with
//! [`Framework::create_driver`](crate::Framework::create_driver); components
//! look them up with [`Framework::driver`](crate::Framework::driver).

use std::io;

/// A named read/write endpoint.
///
/// Implementations are shared between components, so both methods take
/// `&self` and synchronize internally.
pub trait IoDriver: Send + Sync {
    /// Read up to `buf.len()` bytes, returning how many were read.
    ///
    /// # Errors
    ///
    /// Any I/O failure of the underlying resource.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write bytes from `buf`, returning how many were written.
    ///
    /// # Errors
    ///
    /// Any I/O failure of the underlying resource.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Flush buffered output.
    ///
    /// # Errors
    ///
    /// Any I/O failure of the underlying resource.
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// In-memory loopback: bytes written are read back in order.
#[derive(Debug, Default)]
pub struct LoopbackDriver {
    buffer: std::sync::Mutex<std::collections::VecDeque<u8>>,
}

impl LoopbackDriver {
    /// An empty loopback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written but not read yet.
    #[must_use]
    pub fn available(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, std::collections::VecDeque<u8>> {
        self.buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl IoDriver for LoopbackDriver {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut buffer = self.lock();
        let n = buf.len().min(buffer.len());
        for (slot, byte) in buf.iter_mut().zip(buffer.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.lock().extend(buf);
        Ok(buf.len())
    }
}
