//! The `Blob` envelope: compression variant, payload location and declared
//! raw size, plus inflation of a single payload.
//!
//! Classification is a cheap field walk done on the coordinator thread; the
//! actual inflation runs wherever the pipeline dispatched the job (worker
//! thread or inline).

use std::io::Read;

use flate2::read::ZlibDecoder;
use log::warn;

use crate::error::{Error, Result};
use crate::varint::{read_len_delim, read_tag, read_uvarint, skip_field, WireType};

const RAW_FIELD: u32 = 1;
const RAW_SIZE_FIELD: u32 = 2;
const ZLIB_FIELD: u32 = 3;
const LZMA_FIELD: u32 = 4;
const OBSOLETE_BZIP2_FIELD: u32 = 5;
const LZ4_FIELD: u32 = 6;
const ZSTD_FIELD: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zlib,
    Lzma,
    Lz4,
    Zstd,
    /// Field 5, written by long-obsolete encoders. Recognized so the blob is
    /// reported as unsupported rather than malformed.
    Bzip2,
}

impl Compression {
    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zlib => "zlib",
            Compression::Lzma => "lzma",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
            Compression::Bzip2 => "bzip2",
        }
    }
}

/// A classified `Blob` envelope. Offsets index into the blob bytes it was
/// parsed from, so the classification can travel to a worker thread together
/// with the payload buffer without borrowing it.
#[derive(Debug, Clone, Copy)]
pub struct Envelope {
    pub compression: Compression,
    /// `(start, end)` of the payload within the blob message bytes.
    pub data: (usize, usize),
    pub raw_size: Option<u64>,
}

impl Envelope {
    /// Walks the fields of a `Blob` message.
    ///
    /// A well-formed envelope carries exactly one payload field. If several
    /// are present the first one parsed wins and the extras are logged and
    /// skipped.
    pub fn parse(buf: &[u8]) -> Result<Envelope> {
        let mut payload: Option<(Compression, usize, usize)> = None;
        let mut raw_size = None;

        let mut pos = 0;
        while pos < buf.len() {
            let (field, wire, consumed) = read_tag(buf, pos)?;
            pos += consumed;
            match (field, wire) {
                (RAW_SIZE_FIELD, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(buf, pos)?;
                    pos += consumed;
                    raw_size = Some(value);
                }
                (
                    RAW_FIELD | ZLIB_FIELD | LZMA_FIELD | OBSOLETE_BZIP2_FIELD | LZ4_FIELD
                    | ZSTD_FIELD,
                    WireType::LengthDelim,
                ) => {
                    let (data, consumed) = read_len_delim(buf, pos)?;
                    let start = pos + consumed - data.len();
                    pos += consumed;
                    let compression = match field {
                        RAW_FIELD => Compression::None,
                        ZLIB_FIELD => Compression::Zlib,
                        LZMA_FIELD => Compression::Lzma,
                        OBSOLETE_BZIP2_FIELD => Compression::Bzip2,
                        LZ4_FIELD => Compression::Lz4,
                        _ => Compression::Zstd,
                    };
                    if payload.is_some() {
                        warn!(
                            "blob envelope carries more than one payload field; \
                             ignoring additional {} data",
                            compression.name()
                        );
                    } else {
                        payload = Some((compression, start, start + data.len()));
                    }
                }
                (_, wire) => pos += skip_field(buf, pos, wire)?,
            }
        }

        let (compression, start, end) =
            payload.ok_or(Error::MalformedBlob("no raw or compressed payload present"))?;
        Ok(Envelope {
            compression,
            data: (start, end),
            raw_size,
        })
    }

    pub fn payload<'a>(&self, blob: &'a [u8]) -> &'a [u8] {
        &blob[self.data.0..self.data.1]
    }

    /// Inflates the payload into `out` (which arrives empty), enforcing the
    /// declared raw size when one is present.
    pub fn inflate(&self, blob: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let payload = self.payload(blob);
        match self.compression {
            Compression::None => out.extend_from_slice(payload),
            Compression::Zlib => {
                if let Some(size) = self.raw_size {
                    out.reserve(size as usize);
                }
                ZlibDecoder::new(payload)
                    .read_to_end(out)
                    .map_err(|e| Error::DecompressionFailed(format!("zlib: {}", e)))?;
            }
            Compression::Lzma => self.inflate_lzma(payload, out)?,
            Compression::Lz4 => self.inflate_lz4(payload, out)?,
            Compression::Zstd => self.inflate_zstd(payload, out)?,
            Compression::Bzip2 => {
                return Err(Error::UnsupportedCompression("obsolete bzip2 data"));
            }
        }
        if let Some(declared) = self.raw_size {
            if declared != out.len() as u64 {
                return Err(Error::RawSizeMismatch {
                    declared,
                    actual: out.len() as u64,
                });
            }
        }
        Ok(())
    }

    #[cfg(feature = "lzma")]
    fn inflate_lzma(&self, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        lzma_rs::lzma_decompress(&mut std::io::Cursor::new(payload), out)
            .map_err(|e| Error::DecompressionFailed(format!("lzma: {:?}", e)))
    }

    #[cfg(not(feature = "lzma"))]
    fn inflate_lzma(&self, _payload: &[u8], _out: &mut Vec<u8>) -> Result<()> {
        Err(Error::UnsupportedCompression(
            "lzma data (crate built without the `lzma` feature)",
        ))
    }

    #[cfg(feature = "lz4")]
    fn inflate_lz4(&self, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        // the block format cannot be inflated without the decompressed size
        let size = self.raw_size.ok_or(Error::DecompressionFailed(
            "lz4 data without declared raw size".into(),
        ))?;
        let data = lz4_flex::block::decompress(payload, size as usize)
            .map_err(|e| Error::DecompressionFailed(format!("lz4: {}", e)))?;
        out.extend_from_slice(&data);
        Ok(())
    }

    #[cfg(not(feature = "lz4"))]
    fn inflate_lz4(&self, _payload: &[u8], _out: &mut Vec<u8>) -> Result<()> {
        Err(Error::UnsupportedCompression(
            "lz4 data (crate built without the `lz4` feature)",
        ))
    }

    #[cfg(feature = "zstd")]
    fn inflate_zstd(&self, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let mut decoder = zstd::stream::read::Decoder::new(payload)
            .map_err(|e| Error::DecompressionFailed(format!("zstd: {}", e)))?;
        decoder
            .read_to_end(out)
            .map_err(|e| Error::DecompressionFailed(format!("zstd: {}", e)))?;
        Ok(())
    }

    #[cfg(not(feature = "zstd"))]
    fn inflate_zstd(&self, _payload: &[u8], _out: &mut Vec<u8>) -> Result<()> {
        Err(Error::UnsupportedCompression(
            "zstd data (crate built without the `zstd` feature)",
        ))
    }
}
