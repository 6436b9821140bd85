use crate::stream::{
    ClosableRandomAccessStream, ConnectionStream, InputStream, IoMode, OutputStream,
    RandomAccessStream, TruncatableStream,
};
use anyhow::{Result, bail, ensure};
use std::time::Duration;

/// A seekable in-memory stream over a byte vector.
///
/// Reads consume from the cursor; writes overwrite at the cursor and extend
/// the buffer past the end. Implements the whole random-access family, which
/// makes it the workhorse for exercising `pipe` and stream consumers.
#[derive(Debug, Default)]
pub struct MemoryStream {
    buf: Vec<u8>,
    pos: usize,
    open: bool,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self {
            buf,
            pos: 0,
            open: true,
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    fn available(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn check_open(&self) -> Result<()> {
        ensure!(self.open, "memory stream is closed");
        Ok(())
    }
}

impl InputStream for MemoryStream {
    fn empty(&mut self) -> Result<bool> {
        self.check_open()?;
        Ok(self.available() == 0)
    }

    fn least_size(&mut self) -> Result<u64> {
        self.check_open()?;
        Ok(self.available() as u64)
    }

    fn peek(&mut self) -> Result<&[u8]> {
        self.check_open()?;
        Ok(&self.buf[self.pos..])
    }

    fn read(&mut self, dst: &mut [u8], mode: IoMode) -> Result<usize> {
        self.check_open()?;

        let n = match mode {
            IoMode::All => {
                ensure!(
                    self.available() >= dst.len(),
                    "read of {} bytes requested but only {} available",
                    dst.len(),
                    self.available()
                );
                dst.len()
            }
            IoMode::Once | IoMode::Immediate => dst.len().min(self.available()),
        };

        dst[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl OutputStream for MemoryStream {
    fn write(&mut self, bytes: &[u8], _mode: IoMode) -> Result<usize> {
        // Memory never blocks, so every mode behaves like `All`.
        self.check_open()?;

        let overlap = bytes.len().min(self.buf.len() - self.pos);
        self.buf[self.pos..self.pos + overlap].copy_from_slice(&bytes[..overlap]);
        self.buf.extend_from_slice(&bytes[overlap..]);
        self.pos += bytes.len();

        Ok(bytes.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.check_open()
    }

    fn finalize(&mut self) -> Result<()> {
        self.check_open()
    }
}

impl ConnectionStream for MemoryStream {
    fn connected(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<()> {
        ClosableRandomAccessStream::close(self)
    }

    fn wait_for_data(&mut self, _timeout: Duration) -> Result<bool> {
        self.check_open()?;
        Ok(self.available() > 0)
    }
}

impl RandomAccessStream for MemoryStream {
    fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.check_open()?;
        if offset > self.buf.len() as u64 {
            bail!(
                "seek to {} is past the end of the stream ({})",
                offset,
                self.buf.len()
            );
        }
        self.pos = offset as usize;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.pos as u64
    }

    fn readable(&self) -> bool {
        self.open
    }

    fn writable(&self) -> bool {
        self.open
    }
}

impl TruncatableStream for MemoryStream {
    fn truncate(&mut self, size: u64) -> Result<()> {
        self.check_open()?;
        self.buf.truncate(size as usize);
        self.pos = self.pos.min(self.buf.len());
        Ok(())
    }
}

impl ClosableRandomAccessStream for MemoryStream {
    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<()> {
        self.check_open()?;
        self.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_modes() {
        let mut stream = MemoryStream::from_vec(vec![1, 2, 3, 4, 5]);
        let mut dst = [0u8; 3];

        assert_eq!(stream.read(&mut dst, IoMode::All).unwrap(), 3);
        assert_eq!(dst, [1, 2, 3]);
        assert_eq!(stream.tell(), 3);

        // Only two bytes left: `All` refuses, `Once` reads what is there.
        assert!(stream.read(&mut dst, IoMode::All).is_err());
        assert_eq!(stream.read(&mut dst, IoMode::Once).unwrap(), 2);
        assert_eq!(&dst[..2], &[4, 5]);

        assert!(stream.empty().unwrap());
        assert_eq!(stream.read(&mut dst, IoMode::Immediate).unwrap(), 0);
    }

    #[test]
    fn test_write_overwrites_then_extends() {
        let mut stream = MemoryStream::from_vec(vec![1, 2, 3]);
        stream.seek(2).unwrap();

        assert_eq!(stream.write(&[9, 9, 9], IoMode::All).unwrap(), 3);
        assert_eq!(stream.size(), 5);
        assert_eq!(stream.tell(), 5);
        assert_eq!(stream.into_inner(), vec![1, 2, 9, 9, 9]);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut stream = MemoryStream::from_vec(vec![7, 8, 9]);
        assert_eq!(stream.peek().unwrap(), &[7, 8, 9]);
        assert_eq!(stream.least_size().unwrap(), 3);
        assert_eq!(stream.tell(), 0);
    }

    #[test]
    fn test_seek_and_truncate() {
        let mut stream = MemoryStream::from_vec(vec![0; 10]);
        stream.seek(8).unwrap();
        assert!(stream.seek(11).is_err());

        stream.truncate(4).unwrap();
        assert_eq!(stream.size(), 4);
        assert_eq!(stream.tell(), 4);
    }

    #[test]
    fn test_closed_stream_rejects_operations() {
        let mut stream = MemoryStream::from_vec(vec![1]);
        assert!(stream.is_open());
        ClosableRandomAccessStream::close(&mut stream).unwrap();

        assert!(!stream.is_open());
        assert!(!stream.connected());
        assert!(stream.empty().is_err());
        assert!(stream.write(&[1], IoMode::All).is_err());
        assert!(ClosableRandomAccessStream::close(&mut stream).is_err());
    }
}
