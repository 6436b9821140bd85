//! Generic byte-stream interfaces and the `pipe` copy operation.
//!
//! The task pool consumes these only through [`pipe`]; everything else is
//! plumbing for implementors. All traits are object safe so streams can be
//! passed around as `&mut dyn` where convenient.

use anyhow::Result;
use std::cell::RefCell;
use std::time::Duration;

mod memory;
pub use memory::MemoryStream;

mod pipe;
pub use pipe::{PIPE_ALL, PipeMode, pipe};

/// How much of a requested transfer a single `read`/`write` call must
/// complete before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Only what is available right now, possibly nothing.
    Immediate,

    /// At most one underlying operation; at least one byte unless the
    /// stream is exhausted.
    Once,

    /// The full requested amount; anything less is an error.
    All,
}

/// A source of bytes.
pub trait InputStream {
    /// Whether the stream is out of data for good. May block until the
    /// answer is known.
    fn empty(&mut self) -> Result<bool>;

    /// Number of bytes that can currently be read without blocking.
    fn least_size(&mut self) -> Result<u64>;

    /// The currently buffered bytes, without consuming them.
    fn peek(&mut self) -> Result<&[u8]>;

    /// Read into `dst` according to `mode`, returning the byte count.
    fn read(&mut self, dst: &mut [u8], mode: IoMode) -> Result<usize>;
}

/// A sink of bytes.
pub trait OutputStream {
    /// Write `bytes` according to `mode`, returning the byte count.
    fn write(&mut self, bytes: &[u8], mode: IoMode) -> Result<usize>;

    /// Push buffered data towards the underlying device.
    fn flush(&mut self) -> Result<()>;

    /// Flush and mark the stream complete; no writes may follow.
    fn finalize(&mut self) -> Result<()>;
}

/// A bidirectional stream.
pub trait Stream: InputStream + OutputStream {}

impl<T: InputStream + OutputStream> Stream for T {}

/// A bidirectional stream backed by a peer connection.
pub trait ConnectionStream: Stream {
    fn connected(&self) -> bool;

    fn close(&mut self) -> Result<()>;

    /// Wait up to `timeout` for data to become readable. Returns whether
    /// data arrived.
    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool>;
}

/// A stream over a seekable byte container.
pub trait RandomAccessStream: Stream {
    fn size(&self) -> u64;

    /// Absolute reposition of the read/write cursor.
    fn seek(&mut self, offset: u64) -> Result<()>;

    fn tell(&self) -> u64;

    fn readable(&self) -> bool;

    fn writable(&self) -> bool;
}

pub trait TruncatableStream: RandomAccessStream {
    fn truncate(&mut self, size: u64) -> Result<()>;
}

pub trait ClosableRandomAccessStream: TruncatableStream {
    fn is_open(&self) -> bool;

    fn close(&mut self) -> Result<()>;
}

/// An output stream that discards everything written to it.
#[derive(Debug, Default)]
pub struct NullSink {
    discarded: u64,
}

impl NullSink {
    /// Total bytes discarded by this sink.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

impl OutputStream for NullSink {
    fn write(&mut self, bytes: &[u8], _mode: IoMode) -> Result<usize> {
        self.discarded += bytes.len() as u64;
        Ok(bytes.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

thread_local! {
    static NULL_SINK: RefCell<NullSink> = RefCell::new(NullSink::default());
}

/// Run `f` against this thread's shared [`NullSink`], constructing it on
/// first use.
pub fn with_null_sink<R>(f: impl FnOnce(&mut NullSink) -> R) -> R {
    NULL_SINK.with(|sink| f(&mut sink.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sink_discards_and_counts() {
        let mut sink = NullSink::default();
        assert_eq!(sink.write(b"hello", IoMode::All).unwrap(), 5);
        assert_eq!(sink.write(b"world", IoMode::Once).unwrap(), 5);
        sink.flush().unwrap();
        sink.finalize().unwrap();
        assert_eq!(sink.discarded(), 10);
    }

    #[test]
    fn test_thread_local_null_sink_accumulates_per_thread() {
        let before = with_null_sink(|sink| sink.discarded());
        with_null_sink(|sink| sink.write(b"abc", IoMode::All).unwrap());
        assert_eq!(with_null_sink(|sink| sink.discarded()), before + 3);

        std::thread::spawn(|| {
            // A fresh thread gets a fresh sink.
            assert_eq!(with_null_sink(|sink| sink.discarded()), 0);
        })
        .join()
        .unwrap();
    }
}
