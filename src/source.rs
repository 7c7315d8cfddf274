//! Byte sources feeding the framing reader.
//!
//! The pipeline consumes an opaque stream of `(offset, chunk)` pairs and
//! never learns whether the bytes came from a file, a socket or memory. The
//! framing layer pulls chunks only when it needs more bytes, so back-pressure
//! falls out of the call direction.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use bytes::{Bytes, BytesMut};
use memmap2::Mmap;

/// A cold, forward-only byte source.
pub trait ChunkSource {
    /// Returns the next chunk and its absolute offset, or `None` at end of
    /// input. `max_len` is the pipeline's high-water mark; implementations
    /// may return less but never more.
    fn read_chunk(&mut self, max_len: usize) -> io::Result<Option<(u64, Bytes)>>;

    /// Total size of the input, when known up front.
    fn size_hint(&self) -> Option<u64> {
        None
    }

    /// Human-readable description of the input, for the `start` event.
    fn descriptor(&self) -> Option<String> {
        None
    }
}

/// Adapts any [`Read`] into a chunk source.
pub struct ReadSource<R> {
    reader: R,
    offset: u64,
    size: Option<u64>,
    descriptor: Option<String>,
}

impl<R: Read> ReadSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            offset: 0,
            size: None,
            descriptor: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_descriptor<S: Into<String>>(mut self, descriptor: S) -> Self {
        self.descriptor = Some(descriptor.into());
        self
    }
}

impl ReadSource<File> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        Ok(ReadSource::new(file)
            .with_size(size)
            .with_descriptor(path.as_ref().display().to_string()))
    }
}

impl<R: Read> ChunkSource for ReadSource<R> {
    fn read_chunk(&mut self, max_len: usize) -> io::Result<Option<(u64, Bytes)>> {
        let mut buf = BytesMut::zeroed(max_len);
        let mut filled = 0;
        // loop until the chunk is full or the reader runs dry; a short read
        // is not EOF
        while filled < max_len {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        let offset = self.offset;
        self.offset += filled as u64;
        Ok(Some((offset, buf.freeze())))
    }

    fn size_hint(&self) -> Option<u64> {
        self.size
    }

    fn descriptor(&self) -> Option<String> {
        self.descriptor.clone()
    }
}

/// Memory-mapped file source. Chunks are copied out of the map, so the
/// returned bytes do not pin the mapping.
pub struct MmapSource {
    map: Mmap,
    pos: usize,
    descriptor: Option<String>,
}

impl MmapSource {
    pub fn from_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(&path)?;
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self {
            map,
            pos: 0,
            descriptor: Some(path.as_ref().display().to_string()),
        })
    }
}

impl ChunkSource for MmapSource {
    fn read_chunk(&mut self, max_len: usize) -> io::Result<Option<(u64, Bytes)>> {
        if self.pos >= self.map.len() {
            return Ok(None);
        }
        let end = (self.pos + max_len).min(self.map.len());
        let chunk = Bytes::copy_from_slice(&self.map[self.pos..end]);
        let offset = self.pos as u64;
        self.pos = end;
        Ok(Some((offset, chunk)))
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.map.len() as u64)
    }

    fn descriptor(&self) -> Option<String> {
        self.descriptor.clone()
    }
}
