//! Positioned byte I/O consumed by the engine.
//!
//! The engine owns the position: every read and write names an absolute
//! offset. Streaming-only sinks cannot satisfy this contract and are
//! rejected at construction by the concrete implementations.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Hdf5Error, Result};

/// A seekable byte store. All offsets are absolute from the start.
pub trait ByteChannel {
    /// Fill `buf` from `offset`, failing with `TruncatedRead` if the channel
    /// ends early.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`, growing the channel if needed.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Current size of the channel in bytes.
    fn size(&mut self) -> Result<u64>;
}

/// Growable in-memory channel. Used by tests and callers that assemble a
/// file in memory before shipping it elsewhere.
#[derive(Debug, Default)]
pub struct MemChannel {
    bytes: Vec<u8>,
}

impl MemChannel {
    pub fn new() -> Self {
        MemChannel { bytes: Vec::new() }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        MemChannel { bytes }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl ByteChannel for MemChannel {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or(Hdf5Error::TruncatedRead)?;
        if end > self.bytes.len() {
            return Err(Hdf5Error::TruncatedRead);
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.bytes.len() as u64)
    }
}

/// Channel over an open `std::fs::File`.
#[derive(Debug)]
pub struct FileChannel {
    file: File,
}

impl FileChannel {
    pub fn new(file: File) -> Self {
        FileChannel { file }
    }
}

impl ByteChannel for FileChannel {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Hdf5Error::TruncatedRead
            } else {
                Hdf5Error::Io(e)
            }
        })
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Drain an entire channel into memory. The read path parses structures out
/// of a single contiguous byte run, whether that run came from a map or a
/// channel.
pub fn read_all(channel: &mut dyn ByteChannel) -> Result<Vec<u8>> {
    let size = channel.size()?;
    let mut bytes = vec![0u8; size as usize];
    channel.read_at(0, &mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_channel_roundtrip() {
        let mut ch = MemChannel::new();
        ch.write_at(4, b"abcd").unwrap();
        assert_eq!(ch.size().unwrap(), 8);

        let mut buf = [0u8; 4];
        ch.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");

        // The gap before the write reads back as zeros.
        ch.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, &[0, 0, 0, 0]);
    }

    #[test]
    fn mem_channel_short_read() {
        let mut ch = MemChannel::from_bytes(vec![1, 2, 3]);
        let mut buf = [0u8; 4];
        match ch.read_at(0, &mut buf) {
            Err(Hdf5Error::TruncatedRead) => {}
            other => panic!("expected TruncatedRead, got {:?}", other),
        }
    }
}
