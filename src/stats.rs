use std::fmt;
use std::ops::AddAssign;

/// Counters accumulated over one pipeline run. Worker threads report their
/// share as deltas attached to each result; the coordinator owns the sum.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub bytes_read: u64,
    pub blobs: u64,
    pub blocks_decoded: u64,
    pub block_errors: u64,
    pub inflated_bytes: u64,
    pub inline_decompressions: u64,
}

impl AddAssign for Stats {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.bytes_read += other.bytes_read;
        self.blobs += other.blobs;
        self.blocks_decoded += other.blocks_decoded;
        self.block_errors += other.block_errors;
        self.inflated_bytes += other.inflated_bytes;
        self.inline_decompressions += other.inline_decompressions;
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            r#"Streamed:
  bytes read:      {}
  blobs:           {}
  blocks decoded:  {}
  block errors:    {}
  inflated bytes:  {}
  inline fallback: {}"#,
            self.bytes_read,
            self.blobs,
            self.blocks_decoded,
            self.block_errors,
            self.inflated_bytes,
            self.inline_decompressions
        )
    }
}
