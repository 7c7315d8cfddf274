//! File-level framing: the `[length][BlobHeader][Blob]` record layout.
//!
//! The reader consumes a [`ChunkSource`] incrementally, keeps only the bytes
//! it has not yet parsed, and yields one [`BlobRecord`] per file block. It
//! never buffers more than one chunk beyond the record it is assembling.

use std::collections::VecDeque;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};
use log::{debug, trace};

use crate::error::{Error, Result};
use crate::source::ChunkSource;
use crate::varint::{read_len_delim, read_tag, read_uvarint, skip_field, WireType};

/// Largest permitted serialized `BlobHeader` (64 KiB).
pub const MAX_BLOB_HEADER_LEN: u32 = 64 * 1024;

/// Largest permitted serialized `Blob` (32 MiB).
pub const MAX_BLOB_LEN: i64 = 32 * 1024 * 1024;

const TYPE_FIELD: u32 = 1;
const INDEXDATA_FIELD: u32 = 2;
const DATASIZE_FIELD: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobType {
    OsmHeader,
    OsmData,
    /// Any other type string; the record is passed through for the consumer
    /// to skip or inspect.
    Other(String),
}

impl BlobType {
    fn from_wire(name: &[u8]) -> BlobType {
        match name {
            b"OSMHeader" => BlobType::OsmHeader,
            b"OSMData" => BlobType::OsmData,
            other => BlobType::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BlobType::OsmHeader => "OSMHeader",
            BlobType::OsmData => "OSMData",
            BlobType::Other(name) => name,
        }
    }
}

/// One framed file block, still compressed.
#[derive(Debug, Clone)]
pub struct BlobRecord {
    /// Sequence number assigned in file order, starting at 0.
    pub index: u64,
    /// Absolute offset of the record's 4-byte length prefix.
    pub offset: u64,
    pub blob_type: BlobType,
    /// The raw `BlobHeader` message bytes.
    pub header: Bytes,
    /// The raw `Blob` message bytes (the envelope, not yet inflated).
    pub payload: Bytes,
}

struct ParsedHeader {
    blob_type: BlobType,
    datasize: i64,
}

/// Walks the `BlobHeader` fields: `type`(1), `indexdata`(2), `datasize`(3).
fn parse_blob_header(buf: &[u8]) -> Result<ParsedHeader> {
    let mut blob_type = None;
    let mut datasize = None;
    let mut pos = 0;
    while pos < buf.len() {
        let (field, wire, consumed) = read_tag(buf, pos)?;
        pos += consumed;
        match (field, wire) {
            (TYPE_FIELD, WireType::LengthDelim) => {
                let (name, consumed) = read_len_delim(buf, pos)?;
                pos += consumed;
                blob_type = Some(BlobType::from_wire(name));
            }
            (INDEXDATA_FIELD, WireType::LengthDelim) => {
                // opaque to the streaming core
                pos += skip_field(buf, pos, wire)?;
            }
            (DATASIZE_FIELD, WireType::Varint) => {
                let (value, consumed) = read_uvarint(buf, pos)?;
                pos += consumed;
                datasize = Some(value as i64);
            }
            (_, wire) => pos += skip_field(buf, pos, wire)?,
        }
    }
    let blob_type = blob_type.ok_or(Error::Protobuf("blob header without type"))?;
    let datasize = datasize.ok_or(Error::Protobuf("blob header without datasize"))?;
    Ok(ParsedHeader {
        blob_type,
        datasize,
    })
}

/// FIFO of source chunks with zero-copy extraction where a read stays inside
/// a single chunk.
#[derive(Default)]
struct ChunkFifo {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ChunkFifo {
    fn push(&mut self, chunk: Bytes) {
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    fn len(&self) -> usize {
        self.len
    }

    /// Removes exactly `n` buffered bytes. Caller checks `n <= len()`.
    fn take(&mut self, n: usize) -> Bytes {
        debug_assert!(n <= self.len);
        self.len -= n;
        let front = self.chunks.front_mut().expect("fifo not empty");
        if front.len() > n {
            return front.split_to(n);
        }
        if front.len() == n {
            return self.chunks.pop_front().expect("fifo not empty");
        }
        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let front = self.chunks.front_mut().expect("fifo holds enough bytes");
            if front.len() <= remaining {
                remaining -= front.len();
                out.extend_from_slice(front);
                self.chunks.pop_front();
            } else {
                out.extend_from_slice(&front.split_to(remaining));
                remaining = 0;
            }
        }
        out.freeze()
    }
}

/// Streaming record extractor over a chunk source.
///
/// Ends cleanly on EOF at a record boundary or when one of the optional
/// gates (blob count, byte threshold) trips; once a gate is tripped no
/// further chunks are requested and only fully buffered records are drained.
pub struct FramingReader<S> {
    source: S,
    fifo: ChunkFifo,
    chunk_size: usize,
    next_index: u64,
    offset: u64,
    bytes_read: u64,
    max_blobs: Option<u64>,
    read_threshold: Option<u64>,
    eof: bool,
    gated: bool,
    done: bool,
}

enum Fill {
    Ready,
    /// The source is exhausted or gated and cannot supply the bytes.
    Short,
}

impl<S: ChunkSource> FramingReader<S> {
    pub fn new(source: S, chunk_size: usize) -> Self {
        Self {
            source,
            fifo: ChunkFifo::default(),
            chunk_size: chunk_size.max(8),
            next_index: 0,
            offset: 0,
            bytes_read: 0,
            max_blobs: None,
            read_threshold: None,
            eof: false,
            gated: false,
            done: false,
        }
    }

    pub fn with_max_blobs(mut self, limit: Option<u64>) -> Self {
        self.max_blobs = limit;
        self
    }

    pub fn with_read_threshold(mut self, threshold: Option<u64>) -> Self {
        self.read_threshold = threshold;
        self
    }

    /// Total bytes pulled from the source so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Stops the reader; buffered bytes are dropped.
    pub fn close(&mut self) {
        self.done = true;
    }

    fn fill(&mut self, need: usize) -> Result<Fill> {
        while self.fifo.len() < need {
            if self.eof {
                return Ok(Fill::Short);
            }
            if let Some(threshold) = self.read_threshold {
                if self.bytes_read >= threshold {
                    trace!(
                        "read threshold of {} bytes reached, gating source",
                        threshold
                    );
                    self.gated = true;
                    return Ok(Fill::Short);
                }
            }
            match self.source.read_chunk(self.chunk_size)? {
                Some((_, chunk)) => {
                    self.bytes_read += chunk.len() as u64;
                    self.fifo.push(chunk);
                }
                None => self.eof = true,
            }
        }
        Ok(Fill::Ready)
    }

    /// Produces the next record, `Ok(None)` on clean end of stream.
    pub fn next_record(&mut self) -> Result<Option<BlobRecord>> {
        if self.done {
            return Ok(None);
        }
        if let Some(max) = self.max_blobs {
            if self.next_index >= max {
                debug!("blob limit of {} reached, closing stream", max);
                self.done = true;
                return Ok(None);
            }
        }

        if let Fill::Short = self.fill(4)? {
            self.done = true;
            if self.fifo.len() == 0 || self.gated {
                return Ok(None);
            }
            return Err(Error::Truncated("record length prefix"));
        }
        let len_prefix = self.fifo.take(4);
        let header_len = BigEndian::read_u32(&len_prefix);
        if header_len == 0 || header_len > MAX_BLOB_HEADER_LEN {
            self.done = true;
            return Err(Error::InvalidFraming(format!(
                "blob header length {} outside (0, {}]",
                header_len, MAX_BLOB_HEADER_LEN
            )));
        }

        if let Fill::Short = self.fill(header_len as usize)? {
            self.done = true;
            if self.gated {
                return Ok(None);
            }
            return Err(Error::Truncated("blob header"));
        }
        let header = self.fifo.take(header_len as usize);
        let parsed = match parse_blob_header(&header) {
            Ok(parsed) => parsed,
            Err(e) => {
                // framing cannot recover without a datasize to skip by
                self.done = true;
                return Err(e);
            }
        };
        if parsed.datasize < 0 || parsed.datasize > MAX_BLOB_LEN {
            self.done = true;
            return Err(Error::InvalidFraming(format!(
                "blob datasize {} outside [0, {}]",
                parsed.datasize, MAX_BLOB_LEN
            )));
        }

        if let Fill::Short = self.fill(parsed.datasize as usize)? {
            self.done = true;
            if self.gated {
                return Ok(None);
            }
            return Err(Error::Truncated("blob payload"));
        }
        let payload = self.fifo.take(parsed.datasize as usize);

        let record = BlobRecord {
            index: self.next_index,
            offset: self.offset,
            blob_type: parsed.blob_type,
            header,
            payload,
        };
        self.next_index += 1;
        self.offset += 4 + u64::from(header_len) + parsed.datasize as u64;
        trace!(
            "framed blob {} ({}) at offset {}, {} payload bytes",
            record.index,
            record.blob_type.as_str(),
            record.offset,
            record.payload.len()
        );
        Ok(Some(record))
    }
}

impl<S: ChunkSource> Iterator for FramingReader<S> {
    type Item = Result<BlobRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::ReadSource;
    use std::io::Cursor;

    fn encode_header(blob_type: &str, datasize: i64) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(0x0a);
        buf.push(blob_type.len() as u8);
        buf.extend_from_slice(blob_type.as_bytes());
        buf.push(0x18);
        let mut v = datasize as u64;
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                buf.push(byte);
                break;
            }
            buf.push(byte | 0x80);
        }
        buf
    }

    fn encode_record(blob_type: &str, payload: &[u8]) -> Vec<u8> {
        let header = encode_header(blob_type, payload.len() as i64);
        let mut out = Vec::new();
        out.extend_from_slice(&(header.len() as u32).to_be_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(payload);
        out
    }

    fn reader(data: Vec<u8>, chunk: usize) -> FramingReader<ReadSource<Cursor<Vec<u8>>>> {
        FramingReader::new(ReadSource::new(Cursor::new(data)), chunk)
    }

    #[test]
    fn frames_records_across_chunk_boundaries() {
        let mut data = encode_record("OSMHeader", b"first");
        data.extend_from_slice(&encode_record("OSMData", b"second blob"));
        // tiny chunks force every record to span several reads
        let mut r = reader(data, 3);

        let a = r.next_record().unwrap().unwrap();
        assert_eq!(a.index, 0);
        assert_eq!(a.offset, 0);
        assert_eq!(a.blob_type, BlobType::OsmHeader);
        assert_eq!(a.payload.as_ref(), b"first");

        let b = r.next_record().unwrap().unwrap();
        assert_eq!(b.index, 1);
        assert_eq!(b.blob_type, BlobType::OsmData);
        assert_eq!(b.payload.as_ref(), b"second blob");
        assert_eq!(b.offset, (4 + a.header.len() + 5) as u64);

        assert!(r.next_record().unwrap().is_none());
        // the reader stays closed
        assert!(r.next_record().unwrap().is_none());
    }

    #[test]
    fn unknown_blob_type_is_passed_through() {
        let data = encode_record("OSMIndex", b"opaque");
        let mut r = reader(data, 64);
        let rec = r.next_record().unwrap().unwrap();
        assert_eq!(rec.blob_type, BlobType::Other("OSMIndex".into()));
    }

    #[test]
    fn truncated_header_is_an_error() {
        let mut data = encode_record("OSMData", b"payload");
        data.truncate(6);
        let mut r = reader(data, 64);
        assert!(matches!(r.next_record(), Err(Error::Truncated(_))));
    }

    #[test]
    fn truncated_length_prefix_is_an_error() {
        let mut data = encode_record("OSMData", b"payload");
        data.truncate(2);
        let mut r = reader(data, 64);
        assert!(matches!(r.next_record(), Err(Error::Truncated(_))));
    }

    #[test]
    fn header_length_bounds_are_enforced() {
        let mut data = Vec::new();
        data.extend_from_slice(&(MAX_BLOB_HEADER_LEN + 1).to_be_bytes());
        data.extend_from_slice(&[0u8; 16]);
        let mut r = reader(data, 64);
        assert!(matches!(r.next_record(), Err(Error::InvalidFraming(_))));

        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_be_bytes());
        let mut r = reader(data, 64);
        assert!(matches!(r.next_record(), Err(Error::InvalidFraming(_))));
    }

    #[test]
    fn blob_limit_closes_cleanly() {
        let mut data = Vec::new();
        for i in 0..5 {
            data.extend_from_slice(&encode_record("OSMData", format!("blob {}", i).as_bytes()));
        }
        let mut r = reader(data, 64).with_max_blobs(Some(2));
        assert_eq!(r.next_record().unwrap().unwrap().index, 0);
        assert_eq!(r.next_record().unwrap().unwrap().index, 1);
        assert!(r.next_record().unwrap().is_none());
    }

    #[test]
    fn zero_blob_limit_yields_nothing() {
        let data = encode_record("OSMData", b"x");
        let mut r = reader(data, 64).with_max_blobs(Some(0));
        assert!(r.next_record().unwrap().is_none());
    }

    #[test]
    fn read_threshold_gates_without_error() {
        let mut data = Vec::new();
        for _ in 0..10 {
            data.extend_from_slice(&encode_record("OSMData", &[7u8; 100]));
        }
        // threshold of one byte: the first chunk is still read, whatever
        // records it completes are drained, then the stream closes
        let mut r = reader(data, 256).with_read_threshold(Some(1));
        let mut count = 0;
        while let Some(rec) = r.next_record().unwrap() {
            assert_eq!(rec.index, count);
            count += 1;
        }
        assert!(count >= 1);
        assert!(count < 10);
    }
}
