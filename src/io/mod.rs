// src/io/mod.rs
//
// Raw-byte sources feeding the ASCII framer.
// A source is polled: `read_available` returns 0 when nothing is pending and
// never blocks for long.

use std::io::Read;

pub mod serial;

/// The raw-byte boundary toward the serial link (or a capture file).
pub trait ByteSource {
    /// Copy whatever bytes are available into `buf`, returning the count.
    /// `Ok(0)` means "nothing right now" for live sources and end-of-input for readers.
    fn read_available(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// Adapts any `std::io::Read` (capture files, pipes, in-memory buffers).
pub struct ReaderByteSource<R: Read> {
    inner: R,
    exhausted: bool,
}

impl<R: Read> ReaderByteSource<R> {
    pub fn new(inner: R) -> Self {
        ReaderByteSource {
            inner,
            exhausted: false,
        }
    }

    /// True once the underlying reader reported end of input.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

impl<R: Read> ByteSource for ReaderByteSource<R> {
    fn read_available(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.exhausted {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.exhausted = true;
        }
        Ok(n)
    }
}
