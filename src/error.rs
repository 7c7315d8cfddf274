use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while streaming and decoding a PBF file.
///
/// Framing-level failures ([`Error::is_fatal`]) terminate the stream; the
/// remaining kinds are scoped to a single blob or entity and leave the
/// pipeline running.
#[derive(Debug, Error)]
pub enum Error {
    /// The upstream byte source failed.
    #[error("source i/o: {0}")]
    SourceIo(#[from] io::Error),

    /// The source ended in the middle of a framed record.
    #[error("unexpected end of input while reading {0}")]
    Truncated(&'static str),

    /// Header length out of range, negative datasize, or oversized blob.
    #[error("invalid framing: {0}")]
    InvalidFraming(String),

    /// A blob envelope without any payload field.
    #[error("malformed blob envelope: {0}")]
    MalformedBlob(&'static str),

    /// The compression variant is known but not compiled into this build.
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(&'static str),

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// The envelope's declared raw size disagrees with the inflated length.
    #[error("declared raw size {declared} does not match inflated length {actual}")]
    RawSizeMismatch { declared: u64, actual: u64 },

    /// Varint overflow, unknown wire type, or a length running past the buffer.
    #[error("malformed protobuf: {0}")]
    Protobuf(&'static str),

    /// A tag, role or user index pointing past the end of the string table.
    #[error("string index {index} out of range (table has {len} entries)")]
    StringIndexOutOfRange { index: u64, len: usize },

    /// Parallel arrays that must run in lockstep differ in length.
    #[error("parallel arrays differ in length: {0}")]
    ArityMismatch(&'static str),

    /// The pipeline was torn down on request. Terminal, but not a failure.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error terminates the whole stream.
    ///
    /// Everything else is reported per blob (or per entity) and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::SourceIo(_) | Error::Truncated(_) | Error::InvalidFraming(_)
        )
    }
}
